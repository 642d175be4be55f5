use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use sandbox::{
    HandlerError, Reply, Resource, ResourceConfig, SandboxApi, SandboxError, reply, reply_error,
};
use sandbox_proto::Command;
use serde::Deserialize;
use serde_json::Value;
use tracing::{Level, debug};

use crate::error::StoreError;
use crate::keys::{count_key, is_valid_sandbox_id, sandboxed_key};
use crate::reconcile::{ReconcileConfig, Reconciler, ReconcilerHandle};
use crate::store::{self, SharedStore, StoreConfig};

pub const DEFAULT_KEYS_PER_USER: i64 = 100;

pub const TOO_MANY_KEYS: &str = "Too many keys";

fn default_reconcile_period() -> u64 {
    crate::reconcile::DEFAULT_PERIOD.as_secs()
}

fn default_reconciliation_expiry() -> u64 {
    crate::reconcile::DEFAULT_EXPIRY.as_secs()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KvConfig {
    #[serde(default)]
    pub store: StoreConfig,
    pub keys_per_user_hard: Option<i64>,
    /// Older name for `keys_per_user_hard`.
    pub keys_per_user: Option<i64>,
    pub keys_per_user_soft: Option<i64>,
    /// Seconds between reconciliation attempts.
    #[serde(default = "default_reconcile_period")]
    pub reconcile_period: u64,
    /// Seconds before a finished reconciliation is redone.
    #[serde(default = "default_reconciliation_expiry")]
    pub reconciliation_expiry: u64,
    /// Run the reconciler alongside this resource.
    #[serde(default = "default_true")]
    pub reconcile: bool,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            keys_per_user_hard: None,
            keys_per_user: None,
            keys_per_user_soft: None,
            reconcile_period: default_reconcile_period(),
            reconciliation_expiry: default_reconciliation_expiry(),
            reconcile: true,
        }
    }
}

impl KvConfig {
    pub fn from_resource_config(name: &str, config: ResourceConfig) -> Result<Self, SandboxError> {
        serde_json::from_value(config.into())
            .map_err(|e| SandboxError::InvalidConfig(format!("resource {name}: {e}")))
    }

    pub fn limits(&self) -> KeyLimits {
        let hard = self
            .keys_per_user_hard
            .or(self.keys_per_user)
            .unwrap_or(DEFAULT_KEYS_PER_USER);
        let soft = self.keys_per_user_soft.unwrap_or(hard * 4 / 5);
        KeyLimits { soft, hard }
    }

    pub fn reconcile_config(&self) -> Result<ReconcileConfig, SandboxError> {
        if self.reconcile_period == 0 {
            return Err(SandboxError::InvalidConfig(
                "reconcile_period must be positive".into(),
            ));
        }
        Ok(ReconcileConfig {
            period: Duration::from_secs(self.reconcile_period),
            expiry: Duration::from_secs(self.reconciliation_expiry),
            ..ReconcileConfig::default()
        })
    }
}

/// The store key for the command's `key` field, scoped to the calling sandbox.
fn tenant_key(api: &dyn SandboxApi, command: &Command) -> Result<String, HandlerError> {
    let sandbox_id = api.sandbox_id();
    if !is_valid_sandbox_id(sandbox_id) {
        return Err(HandlerError::other(StoreError::InvalidSandboxId(
            sandbox_id.to_string(),
        )));
    }
    Ok(sandboxed_key(sandbox_id, command.require_str("key")?))
}

/// Per-tenant key ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLimits {
    /// Above this, new keys are allowed with a warning.
    pub soft: i64,
    /// Reaching this refuses new keys.
    pub hard: i64,
}

/// The `kv` resource: tenant-scoped keys under a key-count quota.
pub struct KvResource {
    name: String,
    config: KvConfig,
    limits: KeyLimits,
    store: Option<SharedStore>,
    reconciler: Option<ReconcilerHandle>,
}

impl KvResource {
    pub fn new(name: &str, config: KvConfig) -> Self {
        Self {
            name: name.to_string(),
            limits: config.limits(),
            config,
            store: None,
            reconciler: None,
        }
    }

    /// Use an already-open store instead of connecting in setup.
    pub fn with_store(name: &str, config: KvConfig, store: SharedStore) -> Self {
        Self {
            store: Some(store),
            ..Self::new(name, config)
        }
    }

    pub fn boxed(name: &str, config: ResourceConfig) -> Result<Box<dyn Resource>, SandboxError> {
        let config = KvConfig::from_resource_config(name, config)?;
        config.reconcile_config()?;
        Ok(Box::new(Self::new(name, config)))
    }

    pub fn limits(&self) -> KeyLimits {
        self.limits
    }

    fn store(&self) -> Result<&SharedStore, HandlerError> {
        self.store
            .as_ref()
            .ok_or_else(|| HandlerError::other(StoreError::NotConnected))
    }

    /// Admit a write to `key`, claiming a quota slot if the key is new.
    async fn check_keys(&self, api: &dyn SandboxApi, key: &str) -> Result<bool, StoreError> {
        let store = self.store.as_ref().ok_or(StoreError::NotConnected)?;
        if store.exists(key).await? {
            return Ok(true);
        }
        let counter = count_key(api.sandbox_id());
        let count = store.incr_by(&counter, 1).await?;
        let KeyLimits { soft, hard } = self.limits;
        if count >= hard {
            api.log(
                Level::ERROR,
                &format!(
                    "Redis hard limit of {hard} keys reached for sandbox {}. \
                     No more keys can be written.",
                    api.sandbox_id()
                ),
            );
            store.incr_by(&counter, -1).await?;
            return Ok(false);
        }
        if count > soft {
            api.log(
                Level::WARN,
                &format!(
                    "Redis soft limit of {soft} keys reached for sandbox {}. \
                     Once the hard limit of {hard} is reached no more keys can be written.",
                    api.sandbox_id()
                ),
            );
        }
        Ok(true)
    }

    async fn handle_set(
        &self,
        api: &dyn SandboxApi,
        command: &Command,
    ) -> Result<Command, HandlerError> {
        let key = tenant_key(api, command)?;
        let ttl = match command.get("seconds") {
            None | Some(Value::Null) => None,
            Some(seconds) => match seconds.as_i64() {
                Some(s) if s > 0 => Some(Duration::from_secs(s.unsigned_abs())),
                Some(_) => return Ok(reply_error(command, "seconds must be positive")),
                None => return Ok(reply_error(command, "seconds must be a number or null")),
            },
        };
        if !self.check_keys(api, &key).await.map_err(HandlerError::other)? {
            return Ok(reply_error(command, TOO_MANY_KEYS));
        }
        let value = command.get("value").unwrap_or(&Value::Null).to_string();
        self.store()?
            .set(&key, &value, ttl)
            .await
            .map_err(HandlerError::other)?;
        Ok(reply(command))
    }

    async fn handle_get(
        &self,
        api: &dyn SandboxApi,
        command: &Command,
    ) -> Result<Command, HandlerError> {
        let key = tenant_key(api, command)?;
        let raw = self.store()?.get(&key).await.map_err(HandlerError::other)?;
        let value = match raw {
            Some(raw) => serde_json::from_str(&raw).map_err(HandlerError::other)?,
            None => Value::Null,
        };
        Ok(reply(command).with("value", value))
    }

    async fn handle_delete(
        &self,
        api: &dyn SandboxApi,
        command: &Command,
    ) -> Result<Command, HandlerError> {
        let key = tenant_key(api, command)?;
        let store = self.store()?;
        let existed = store.delete(&key).await.map_err(HandlerError::other)?;
        if existed {
            store
                .incr_by(&count_key(api.sandbox_id()), -1)
                .await
                .map_err(HandlerError::other)?;
        }
        Ok(reply(command).with("existed", existed))
    }

    async fn handle_incr(
        &self,
        api: &dyn SandboxApi,
        command: &Command,
    ) -> Result<Command, HandlerError> {
        let key = tenant_key(api, command)?;
        let amount = command.get_i64("amount")?.unwrap_or(1);
        if !self.check_keys(api, &key).await.map_err(HandlerError::other)? {
            return Ok(reply_error(command, TOO_MANY_KEYS));
        }
        match self.store()?.incr_by(&key, amount).await {
            Ok(value) => Ok(reply(command).with("value", value)),
            Err(e) => Ok(reply_error(command, e.to_string())),
        }
    }
}

#[async_trait]
impl Resource for KvResource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self) -> Result<(), SandboxError> {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => {
                let store = store::connect(&self.config.store)
                    .await
                    .map_err(|e| SandboxError::Setup {
                        resource: self.name.clone(),
                        reason: e.to_string(),
                    })?;
                self.store = Some(store.clone());
                store
            }
        };
        if self.config.reconcile {
            let config = self.config.reconcile_config()?;
            debug!(resource = %self.name, period = ?config.period, "starting reconciler");
            self.reconciler = Some(Reconciler::new(store, config).start());
        }
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), SandboxError> {
        if let Some(reconciler) = self.reconciler.take() {
            reconciler.stop().await;
        }
        Ok(())
    }

    fn handler<'a>(
        &'a self,
        verb: &str,
        api: &'a dyn SandboxApi,
        command: &'a Command,
    ) -> Option<Reply<'a>> {
        Some(match verb {
            "set" => self.handle_set(api, command).boxed(),
            "get" => self.handle_get(api, command).boxed(),
            "delete" => self.handle_delete(api, command).boxed(),
            "incr" => self.handle_incr(api, command).boxed(),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn limits_follow_config() {
        assert_eq!(KvConfig::default().limits(), KeyLimits { soft: 80, hard: 100 });

        let legacy = KvConfig {
            keys_per_user: Some(50),
            ..KvConfig::default()
        };
        assert_eq!(legacy.limits(), KeyLimits { soft: 40, hard: 50 });

        let both = KvConfig {
            keys_per_user_hard: Some(10),
            keys_per_user: Some(50),
            keys_per_user_soft: Some(3),
            ..KvConfig::default()
        };
        assert_eq!(both.limits(), KeyLimits { soft: 3, hard: 10 });
    }

    #[test]
    fn config_rejects_unknown_keys_and_zero_period() {
        let bad = serde_json::from_value::<ResourceConfig>(json!({"keys_per_usr": 3})).unwrap();
        assert!(KvConfig::from_resource_config("kv", bad).is_err());

        let zero = serde_json::from_value::<ResourceConfig>(json!({"reconcile_period": 0})).unwrap();
        assert!(KvResource::boxed("kv", zero).is_err());
    }

    #[tokio::test]
    async fn setup_with_injected_store_skips_connect() {
        let store = Arc::new(MemoryStore::new());
        let config = KvConfig {
            reconcile: false,
            ..KvConfig::default()
        };
        let mut kv = KvResource::with_store("kv", config, store);
        kv.setup().await.unwrap();
        assert!(kv.reconciler.is_none());
        kv.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn setup_starts_and_teardown_stops_reconciler() {
        let mut kv = KvResource::new("kv", KvConfig::default());
        kv.setup().await.unwrap();
        assert!(kv.store.is_some());
        assert!(kv.reconciler.is_some());
        kv.teardown().await.unwrap();
        assert!(kv.reconciler.is_none());
    }
}
