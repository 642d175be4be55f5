use std::collections::{BTreeMap, HashMap};

use sandbox_proto::Command;
use serde_json::Value;
use tracing::{Level, debug, warn};

use crate::api::SandboxApi;
use crate::error::{Result, SandboxError};
use crate::resource::{Resource, ResourceConfig, reply_error, unknown_command};

/// Config key naming the resource class.
pub const CLASS_KEY: &str = "cls";

/// Resource name used in logs for commands no resource claims.
pub const FALLBACK: &str = "fallback";

/// Builds a resource from its registered name and config.
pub type Constructor = fn(&str, ResourceConfig) -> Result<Box<dyn Resource>>;

/// Known resource classes, by the name used in `cls`.
#[derive(Clone, Default)]
pub struct ResourceCatalog {
    classes: HashMap<String, Constructor>,
}

impl ResourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: &str, constructor: Constructor) -> &mut Self {
        self.classes.insert(class.to_string(), constructor);
        self
    }

    pub fn with(mut self, class: &str, constructor: Constructor) -> Self {
        self.register(class, constructor);
        self
    }

    fn build(&self, class: &str, name: &str, config: ResourceConfig) -> Result<Box<dyn Resource>> {
        let constructor = self
            .classes
            .get(class)
            .ok_or_else(|| SandboxError::UnknownResourceClass(class.to_string()))?;
        constructor(name, config)
    }
}

/// The resources available to one sandbox worker, keyed by namespace.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: BTreeMap<String, Box<dyn Resource>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate one resource per entry of `config`.
    ///
    /// Each entry must be an object with a `cls` naming a catalog class; the
    /// remaining keys become the resource's config.
    pub fn validate(catalog: &ResourceCatalog, config: &BTreeMap<String, Value>) -> Result<Self> {
        let mut registry = Self::new();
        for (name, entry) in config {
            let Value::Object(entry) = entry else {
                return Err(SandboxError::InvalidConfig(format!(
                    "resource {name}: expected a mapping"
                )));
            };
            let mut entry = entry.clone();
            let class = match entry.remove(CLASS_KEY) {
                Some(Value::String(class)) => class,
                _ => {
                    return Err(SandboxError::InvalidConfig(format!(
                        "resource {name}: '{CLASS_KEY}' must be a string"
                    )));
                }
            };
            let resource = catalog.build(&class, name, entry)?;
            registry.add_resource(name, resource);
        }
        Ok(registry)
    }

    pub fn add_resource(&mut self, name: &str, resource: Box<dyn Resource>) {
        self.resources.insert(name.to_string(), resource);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Resource> {
        self.resources.get(name).map(|r| r.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Set up every resource in name order.
    ///
    /// Stops at the first failure, tearing down the resources already set
    /// up before returning it.
    pub async fn setup_resources(&mut self) -> Result<()> {
        let mut ready = 0;
        let mut failure = None;
        for (name, resource) in &mut self.resources {
            debug!(resource = %name, "setting up resource");
            if let Err(e) = resource.setup().await {
                failure = Some(e);
                break;
            }
            ready += 1;
        }
        let Some(err) = failure else {
            return Ok(());
        };
        for (name, resource) in self.resources.iter_mut().take(ready) {
            debug!(resource = %name, "tearing down resource after failed setup");
            if let Err(e) = resource.teardown().await {
                warn!(resource = %name, error = %e, "resource teardown failed");
            }
        }
        Err(err)
    }

    /// Tear down every resource, returning the first failure.
    pub async fn teardown_resources(&mut self) -> Result<()> {
        let mut first_err = None;
        for (name, resource) in &mut self.resources {
            debug!(resource = %name, "tearing down resource");
            if let Err(e) = resource.teardown().await {
                warn!(resource = %name, error = %e, "resource teardown failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Route `command` to its resource and wait for the reply.
    ///
    /// Returns `None` when the command was not routable; in that case the
    /// sandbox has already been told to die through [`SandboxApi::kill`].
    pub async fn dispatch(&self, api: &dyn SandboxApi, command: &Command) -> Option<Command> {
        let (namespace, verb) = command.route();
        let Some(resource) = self.resources.get(namespace) else {
            unknown_command(FALLBACK, api, command);
            return None;
        };
        let Some(handler) = resource.handler(verb, api, command) else {
            resource.unknown_command(api, command);
            return None;
        };
        match handler.await {
            Ok(reply) => Some(reply),
            Err(e) => {
                api.log(
                    Level::ERROR,
                    &format!(
                        "Resource {namespace} failed to handle '{}' from sandbox '{}': {e}",
                        command.cmd,
                        api.sandbox_id()
                    ),
                );
                Some(reply_error(command, e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::resource::{HandlerError, Reply, reply};
    use crate::testing::RecordingApi;

    static SETUPS: AtomicUsize = AtomicUsize::new(0);
    static TEARDOWNS: Mutex<Vec<String>> = Mutex::new(Vec::new());

    struct Echo {
        name: String,
        config: ResourceConfig,
    }

    impl Echo {
        fn boxed(name: &str, config: ResourceConfig) -> Result<Box<dyn Resource>> {
            Ok(Box::new(Self {
                name: name.to_string(),
                config,
            }))
        }

        async fn handle_echo(&self, command: &Command) -> std::result::Result<Command, HandlerError> {
            tokio::task::yield_now().await;
            let mut out = reply(command);
            if let Some(v) = command.get("value") {
                out.insert("value", v.clone());
            }
            Ok(out)
        }

        fn handle_fail(&self) -> std::result::Result<Command, HandlerError> {
            Err(HandlerError::other(std::io::Error::other(
                "Something bad happened",
            )))
        }
    }

    #[async_trait::async_trait]
    impl Resource for Echo {
        fn name(&self) -> &str {
            &self.name
        }

        async fn setup(&mut self) -> Result<()> {
            if self.config.get("fail_setup") == Some(&json!(true)) {
                return Err(SandboxError::Setup {
                    resource: self.name.clone(),
                    reason: "boom".into(),
                });
            }
            SETUPS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn teardown(&mut self) -> Result<()> {
            TEARDOWNS.lock().unwrap().push(self.name.clone());
            Ok(())
        }

        fn handler<'a>(
            &'a self,
            verb: &str,
            _api: &'a dyn SandboxApi,
            command: &'a Command,
        ) -> Option<Reply<'a>> {
            Some(match verb {
                "echo" => self.handle_echo(command).boxed(),
                "fail" => std::future::ready(self.handle_fail()).boxed(),
                _ => return None,
            })
        }
    }

    fn catalog() -> ResourceCatalog {
        ResourceCatalog::new().with("echo", Echo::boxed)
    }

    fn config(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn registry() -> ResourceRegistry {
        ResourceRegistry::validate(&catalog(), &config(json!({"tst": {"cls": "echo"}}))).unwrap()
    }

    #[test]
    fn validate_builds_each_entry() {
        let registry = ResourceRegistry::validate(
            &catalog(),
            &config(json!({
                "tst1": {"cls": "echo"},
                "tst2": {"cls": "echo", "extra": "more config"},
            })),
        )
        .unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["tst1", "tst2"]);
        assert_eq!(registry.get("tst2").unwrap().name(), "tst2");
    }

    #[test]
    fn validate_rejects_unknown_class() {
        let err = ResourceRegistry::validate(&catalog(), &config(json!({"x": {"cls": "nope"}})))
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::UnknownResourceClass(c) if c == "nope"));
    }

    #[test]
    fn validate_rejects_missing_class() {
        let err = ResourceRegistry::validate(&catalog(), &config(json!({"x": {}})))
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn failed_setup_tears_down_what_was_set_up() {
        let mut registry = ResourceRegistry::validate(
            &catalog(),
            &config(json!({
                "partial1": {"cls": "echo"},
                "partial2": {"cls": "echo", "fail_setup": true},
                "partial3": {"cls": "echo"},
            })),
        )
        .unwrap();
        assert!(registry.setup_resources().await.is_err());
        let torn_down: Vec<String> = TEARDOWNS
            .lock()
            .unwrap()
            .iter()
            .filter(|name| name.starts_with("partial"))
            .cloned()
            .collect();
        assert_eq!(torn_down, ["partial1"]);
    }

    #[tokio::test]
    async fn setup_and_teardown_propagate_failures() {
        let before = SETUPS.load(Ordering::SeqCst);
        let mut registry = ResourceRegistry::validate(
            &catalog(),
            &config(json!({
                "a": {"cls": "echo"},
                "b": {"cls": "echo", "fail_setup": true},
            })),
        )
        .unwrap();
        let err = registry.setup_resources().await.unwrap_err();
        assert!(matches!(err, SandboxError::Setup { resource, .. } if resource == "b"));
        assert_eq!(SETUPS.load(Ordering::SeqCst) - before, 1);
        registry.teardown_resources().await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_routes_to_handler() {
        let api = RecordingApi::default();
        let command = Command::new("tst.echo").with("value", json!({"a": [1, 2]}));
        let reply = registry().dispatch(&api, &command).await.unwrap();
        assert_eq!(reply.cmd_id, command.cmd_id);
        assert_eq!(reply.cmd, "tst.echo");
        assert!(reply.reply);
        assert_eq!(reply.get("success"), Some(&json!(true)));
        assert_eq!(reply.get("value"), Some(&json!({"a": [1, 2]})));
        assert!(!api.was_killed());
    }

    #[tokio::test]
    async fn dispatch_unknown_namespace_kills_sandbox() {
        let api = RecordingApi::default();
        let command = Command::new("bogus.verb");
        assert!(registry().dispatch(&api, &command).await.is_none());
        assert!(api.was_killed());
        let logs = api.logs.lock().unwrap();
        let [(level, msg)] = logs.as_slice() else {
            panic!("expected one log line, got {logs:?}");
        };
        assert_eq!(*level, Level::ERROR);
        assert!(msg.starts_with(
            "Resource fallback received unknown command 'bogus.verb' from sandbox 'sandbox1'. \
             Killing sandbox. [Full command: {"
        ));
    }

    #[tokio::test]
    async fn dispatch_unknown_verb_kills_sandbox() {
        let api = RecordingApi::default();
        assert!(registry().dispatch(&api, &Command::new("tst.nope")).await.is_none());
        assert!(api.was_killed());
        let logs = api.logs.lock().unwrap();
        assert!(logs[0].1.starts_with("Resource tst received unknown command 'tst.nope'"));
    }

    #[tokio::test]
    async fn dispatch_handler_error_becomes_failure_reply() {
        let api = RecordingApi::default();
        let command = Command::new("tst.fail");
        let reply = registry().dispatch(&api, &command).await.unwrap();
        assert_eq!(reply.cmd_id, command.cmd_id);
        assert_eq!(reply.get("success"), Some(&json!(false)));
        assert_eq!(reply.get("reason"), Some(&json!("Something bad happened")));
        assert!(!api.was_killed());
        assert_eq!(api.logs.lock().unwrap()[0].0, Level::ERROR);
    }
}
