use sandbox::SandboxApi;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, trace, warn};

/// What resources see of the sandbox a worker is running.
///
/// Logs go to the host's tracing output tagged with the sandbox id; `kill`
/// trips a token the worker's supervisor is waiting on.
pub struct WorkerApi {
    sandbox_id: String,
    killed: CancellationToken,
}

impl WorkerApi {
    pub fn new(sandbox_id: &str) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            killed: CancellationToken::new(),
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.is_cancelled()
    }

    /// Resolves once [`SandboxApi::kill`] has been called.
    pub async fn killed(&self) {
        self.killed.cancelled().await;
    }
}

impl SandboxApi for WorkerApi {
    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    fn log(&self, level: Level, message: &str) {
        let sandbox_id = self.sandbox_id.as_str();
        match level {
            Level::ERROR => error!(sandbox_id, "{message}"),
            Level::WARN => warn!(sandbox_id, "{message}"),
            Level::INFO => info!(sandbox_id, "{message}"),
            Level::DEBUG => debug!(sandbox_id, "{message}"),
            _ => trace!(sandbox_id, "{message}"),
        }
    }

    fn kill(&self) {
        if !self.killed.is_cancelled() {
            debug!(sandbox_id = %self.sandbox_id, "kill requested");
        }
        self.killed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kill_resolves_waiters() {
        let api = std::sync::Arc::new(WorkerApi::new("sb"));
        let waiter = {
            let api = api.clone();
            tokio::spawn(async move { api.killed().await })
        };
        assert!(!api.is_killed());
        api.kill();
        api.kill();
        waiter.await.unwrap();
        assert!(api.is_killed());
        assert_eq!(api.sandbox_id(), "sb");
    }
}
