//! Resources every worker can offer without external services.

use std::collections::BTreeMap;
use std::path::PathBuf;

use futures_util::FutureExt;
use sandbox_proto::Command;
use serde::Deserialize;
use tracing::Level;

use crate::api::SandboxApi;
use crate::error::{Result, SandboxError};
use crate::registry::ResourceCatalog;
use crate::resource::{HandlerError, Reply, Resource, ResourceConfig, reply, reply_error};

/// Catalog with the `log` and `config` classes registered.
pub fn builtin_catalog() -> ResourceCatalog {
    ResourceCatalog::new()
        .with("log", LogResource::boxed)
        .with("config", ConfigResource::boxed)
}

/// Forwards sandbox log lines (`log.<level>`, field `msg`) to the host log.
pub struct LogResource {
    name: String,
}

impl LogResource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn boxed(name: &str, _config: ResourceConfig) -> Result<Box<dyn Resource>> {
        Ok(Box::new(Self::new(name)))
    }

    fn handle_log(
        &self,
        level: Level,
        api: &dyn SandboxApi,
        command: &Command,
    ) -> std::result::Result<Command, HandlerError> {
        let msg = command.require_str("msg")?;
        api.log(level, msg);
        Ok(reply(command))
    }
}

impl Resource for LogResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler<'a>(
        &'a self,
        verb: &str,
        api: &'a dyn SandboxApi,
        command: &'a Command,
    ) -> Option<Reply<'a>> {
        let level = match verb {
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warning" => Level::WARN,
            "error" | "critical" => Level::ERROR,
            _ => return None,
        };
        Some(std::future::ready(self.handle_log(level, api, command)).boxed())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigResourceConfig {
    #[serde(default)]
    keys: BTreeMap<String, PathBuf>,
}

/// Serves file contents by configuration key (`config.get`, field `key`).
pub struct ConfigResource {
    name: String,
    keys: BTreeMap<String, PathBuf>,
}

impl ConfigResource {
    pub fn new(name: &str, keys: BTreeMap<String, PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            keys,
        }
    }

    fn boxed(name: &str, config: ResourceConfig) -> Result<Box<dyn Resource>> {
        let config: ConfigResourceConfig = serde_json::from_value(config.into())
            .map_err(|e| SandboxError::InvalidConfig(format!("resource {name}: {e}")))?;
        Ok(Box::new(Self::new(name, config.keys)))
    }

    async fn handle_get(&self, command: &Command) -> std::result::Result<Command, HandlerError> {
        let key = command.require_str("key")?;
        let Some(path) = self.keys.get(key) else {
            return Ok(reply_error(
                command,
                format!("Configuration key '{key}' not found"),
            ));
        };
        match tokio::fs::read_to_string(path).await {
            Ok(value) => Ok(reply(command).with("value", value)),
            Err(_) => Ok(reply_error(
                command,
                format!("Cannot read file '{}'", path.display()),
            )),
        }
    }
}

impl Resource for ConfigResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler<'a>(
        &'a self,
        verb: &str,
        _api: &'a dyn SandboxApi,
        command: &'a Command,
    ) -> Option<Reply<'a>> {
        match verb {
            "get" => Some(self.handle_get(command).boxed()),
            _ => None,
        }
    }
}
