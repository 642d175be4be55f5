mod api;
mod builtin;
mod error;
mod registry;
mod resource;
pub mod rlimit;
#[cfg(test)]
mod testing;

pub use api::SandboxApi;
pub use builtin::{ConfigResource, LogResource, builtin_catalog};
pub use error::{Result, SandboxError};
pub use registry::{CLASS_KEY, Constructor, FALLBACK, ResourceCatalog, ResourceRegistry};
pub use resource::{
    HandlerError, Reply, Resource, ResourceConfig, reply, reply_error, unknown_command,
};
pub use rlimit::{Rlimit, RlimitKind, RlimitScript};
