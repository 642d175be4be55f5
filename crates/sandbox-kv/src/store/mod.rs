//! Shared key-value store backing the kv resource and the reconciler.
//!
//! Every operation is individually atomic at the store; nothing here does a
//! read-modify-write across two calls.

mod memory;
mod redis;
mod resp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Cursor value that starts a scan and marks its end.
pub const SCAN_START: &str = "0";

pub type SharedStore = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value`, expiring after `ttl` if given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write `value` only if `key` is absent. Returns whether it was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Add `amount` to an integer value, treating a missing key as 0.
    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64>;

    /// One batch of a cursor scan over keys matching a `*` glob.
    ///
    /// Start with [`SCAN_START`]; the scan is finished when the returned
    /// cursor is [`SCAN_START`] again.
    async fn scan(&self, cursor: &str, pattern: &str, count: usize) -> Result<(String, Vec<String>)>;

    /// Delete `key` only if it currently holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    6379
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub db: u32,
    /// Prepended to every key; stripped from scan results.
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db: 0,
            key_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local; tenants only share keys within one process.
    #[default]
    Memory,
    Redis(RedisConfig),
}

/// Open the configured backend.
pub async fn connect(config: &StoreConfig) -> Result<SharedStore> {
    Ok(match config {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        StoreConfig::Redis(redis) => Arc::new(RedisStore::connect(redis.clone()).await?),
    })
}

/// Match `key` against a glob where `*` is the only wildcard.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };
    let mut parts: Vec<&str> = parts.collect();
    let Some(last) = parts.pop() else {
        return rest.is_empty();
    };
    for part in parts {
        match rest.find(part) {
            Some(at) => rest = rest.get(at + part.len()..).unwrap_or_default(),
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
