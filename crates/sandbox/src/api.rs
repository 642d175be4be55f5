use tracing::Level;

/// Per-sandbox context handed to every resource handler.
///
/// Implemented by whatever owns the sandboxed process.
pub trait SandboxApi: Send + Sync {
    /// Tenant id that scopes keys, quotas and log lines.
    fn sandbox_id(&self) -> &str;
    /// Emit a sandbox-scoped diagnostic.
    fn log(&self, level: Level, message: &str);
    /// Ask the owner to terminate the sandboxed process.
    fn kill(&self);
}
