use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sandbox_proto::{Command, FieldError};
use serde_json::{Map, Value};
use tracing::Level;

use crate::api::SandboxApi;
use crate::error::Result;

/// Per-resource configuration: the resource's entry from the sandbox config,
/// minus its `cls` key.
pub type ResourceConfig = Map<String, Value>;

/// A handler's eventual reply.
///
/// Every handler returns one of these, whether it finishes immediately or
/// after awaiting I/O.
pub type Reply<'a> = BoxFuture<'a, std::result::Result<Command, HandlerError>>;

/// A failure the handler did not turn into a reply itself.
///
/// The dispatcher answers with `success: false` and the error text; the
/// sandbox keeps running.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Field(#[from] FieldError),

    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }
}

/// A named capability a sandbox may invoke as `<name>.<verb>`.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Name the resource is registered under (the command namespace).
    fn name(&self) -> &str;

    /// Called once before the first dispatch.
    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once at shutdown.
    async fn teardown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Map `verb` to its handler, or `None` if this resource has no such verb.
    fn handler<'a>(
        &'a self,
        verb: &str,
        api: &'a dyn SandboxApi,
        command: &'a Command,
    ) -> Option<Reply<'a>>;

    /// Fallback for verbs [`handler`](Self::handler) does not know.
    fn unknown_command(&self, api: &dyn SandboxApi, command: &Command) {
        unknown_command(self.name(), api, command);
    }
}

/// Log the unhandled command and kill the sandbox that sent it.
pub fn unknown_command(resource: &str, api: &dyn SandboxApi, command: &Command) {
    let full = String::from_utf8_lossy(&sandbox_proto::encode(command)).into_owned();
    api.log(
        Level::ERROR,
        &format!(
            "Resource {resource} received unknown command '{}' from sandbox '{}'. \
             Killing sandbox. [Full command: {full}]",
            command.cmd,
            api.sandbox_id(),
        ),
    );
    api.kill();
}

/// Successful reply carrying `success: true`.
pub fn reply(command: &Command) -> Command {
    command.reply_to().with("success", true)
}

/// Failure reply carrying `success: false` and `reason`.
pub fn reply_error(command: &Command, reason: impl Into<String>) -> Command {
    command
        .reply_to()
        .with("success", false)
        .with("reason", reason.into())
}
