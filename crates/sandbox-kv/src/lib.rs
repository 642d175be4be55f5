//! Tenant-scoped key-value resource with key-count quotas, and the daemon
//! that keeps those counts honest.

mod error;
pub mod keys;
pub mod reconcile;
mod resource;
pub mod store;

pub use error::{ReconcileError, Result, StoreError};
pub use reconcile::{Attempt, ReconcileConfig, Reconciler, ReconcilerHandle};
pub use resource::{DEFAULT_KEYS_PER_USER, KeyLimits, KvConfig, KvResource, TOO_MANY_KEYS};
pub use store::{MemoryStore, RedisStore, SharedStore, Store, StoreConfig};

/// Class name the kv resource registers under.
pub const CLASS: &str = "kv";

/// Add the kv class to `catalog`.
pub fn register(catalog: &mut sandbox::ResourceCatalog) -> &mut sandbox::ResourceCatalog {
    catalog.register(CLASS, KvResource::boxed)
}
