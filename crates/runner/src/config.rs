use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sandbox::{CLASS_KEY, ResourceConfig, Rlimit, RlimitKind};
use sandbox_kv::KvConfig;
use sandbox_proto::{Command, FIELD_CMD};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_SANDBOX_ID: &str = "sandbox";
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub(crate) const DEFAULT_RECV_LIMIT: usize = 1024 * 1024;

fn default_sandbox_id() -> String {
    DEFAULT_SANDBOX_ID.to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_recv_limit() -> usize {
    DEFAULT_RECV_LIMIT
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Tenant id the sandbox's keys and logs are scoped to.
    #[serde(default = "default_sandbox_id")]
    pub sandbox_id: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// The sandbox's whole environment; `PATH` is inherited unless set here.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub rlimits: BTreeMap<RlimitKind, Rlimit>,
    /// Seconds before the sandbox is killed.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Bytes of stdout plus stderr before the sandbox is killed.
    #[serde(default = "default_recv_limit")]
    pub recv_limit: usize,
    /// Resource name to `{cls: ..., <resource config>}`.
    #[serde(default)]
    pub sandbox: BTreeMap<String, Value>,
    /// Written to the sandbox's stdin right after launch.
    pub initial_command: Option<Map<String, Value>>,
}

impl RunnerConfig {
    /// A config running `executable` with every other setting at its default.
    #[cfg(test)]
    pub(crate) fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            sandbox_id: default_sandbox_id(),
            executable: executable.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            path: None,
            rlimits: BTreeMap::new(),
            timeout: default_timeout(),
            recv_limit: default_recv_limit(),
            sandbox: BTreeMap::new(),
            initial_command: None,
        }
    }

    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    ///
    /// A bare executable name is left alone so it is looked up on `PATH`.
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if self.executable.is_relative() && self.executable.components().count() > 1 {
            self.executable = config_dir.join(&self.executable);
        }
        if let Some(path) = &mut self.path
            && path.is_relative()
        {
            *path = config_dir.join(&*path);
        }
    }

    /// Reject settings the rest of the runner cannot work with.
    pub fn validate(&self) -> RunnerResult<()> {
        if !sandbox_kv::keys::is_valid_sandbox_id(&self.sandbox_id) {
            return Err(RunnerError::Config(format!(
                "sandbox_id '{}' must be non-empty and must not contain '#'",
                self.sandbox_id
            )));
        }
        Ok(())
    }

    /// The configured initial command, if any.
    pub fn initial_command(&self) -> RunnerResult<Option<Command>> {
        let Some(fields) = &self.initial_command else {
            return Ok(None);
        };
        let Some(cmd) = fields.get(FIELD_CMD).and_then(Value::as_str) else {
            return Err(RunnerError::Config(
                "initial_command needs a string 'cmd'".into(),
            ));
        };
        let mut command = Command::new(cmd);
        for (key, value) in fields {
            if key != FIELD_CMD {
                command.insert(key, value.clone());
            }
        }
        Ok(Some(command))
    }

    /// Config of the `kv` resource named `name`, or of the only one when no
    /// name is given.
    pub fn kv_config(&self, name: Option<&str>) -> RunnerResult<(String, KvConfig)> {
        let mut found = self.sandbox.iter().filter(|(resource, entry)| {
            entry.get(CLASS_KEY).and_then(Value::as_str) == Some(sandbox_kv::CLASS)
                && name.is_none_or(|name| name == resource.as_str())
        });
        let Some((resource, entry)) = found.next() else {
            return Err(RunnerError::Config(match name {
                Some(name) => format!("no kv resource named '{name}'"),
                None => "no kv resource configured".into(),
            }));
        };
        if found.next().is_some() {
            return Err(RunnerError::Config(
                "several kv resources configured; pick one with --resource".into(),
            ));
        }
        let mut config: ResourceConfig = match entry {
            Value::Object(map) => map.clone(),
            _ => return Err(RunnerError::Config(format!("resource {resource} is not a map"))),
        };
        config.remove(CLASS_KEY);
        let kv = KvConfig::from_resource_config(resource, config)?;
        Ok((resource.clone(), kv))
    }
}

/// Load a runner config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    if let Some(dir) = &config.path
        && !tokio::fs::try_exists(dir).await.unwrap_or(false)
    {
        return Err(RunnerError::Config(format!(
            "path not found: {}",
            dir.display()
        )));
    }
    Ok(config)
}
