use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{SCAN_START, Store, glob_match};
use crate::error::{Result, StoreError};

/// Scan cursors carry the last key returned, behind this marker so they can
/// never collide with [`SCAN_START`].
const CURSOR_MARK: char = '>';

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store with Redis semantics, including passive expiry.
///
/// Expiry uses tokio's clock, so paused-time tests can advance it.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn lookup<'a>(entries: &'a mut BTreeMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| !e.live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        Ok(lookup(&mut entries, key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if lookup(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let existed = lookup(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        Ok(lookup(&mut entries, key).is_some())
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        let now = Instant::now();
        let fresh = || Entry {
            value: "0".into(),
            expires_at: None,
        };
        let not_integer = || StoreError::Server("ERR value is not an integer or out of range".into());
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_string()).or_insert_with(fresh);
        if !entry.live(now) {
            *entry = fresh();
        }
        let current: i64 = entry.value.parse().map_err(|_| not_integer())?;
        let next = current.checked_add(amount).ok_or_else(not_integer)?;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn scan(&self, cursor: &str, pattern: &str, count: usize) -> Result<(String, Vec<String>)> {
        let start = match cursor {
            SCAN_START => Bound::Unbounded,
            _ => match cursor.strip_prefix(CURSOR_MARK) {
                Some(last) => Bound::Excluded(last.to_string()),
                None => return Err(StoreError::Server(format!("ERR invalid cursor {cursor}"))),
            },
        };
        let now = Instant::now();
        let batch = count.max(1);
        let mut entries = self.entries.lock().await;
        let mut examined: Vec<(String, bool)> = entries
            .range((start, Bound::Unbounded))
            .take(batch + 1)
            .map(|(key, entry)| (key.clone(), entry.live(now)))
            .collect();
        let more = examined.len() > batch;
        examined.truncate(batch);
        let next = match examined.last() {
            Some((last, _)) if more => format!("{CURSOR_MARK}{last}"),
            _ => SCAN_START.to_string(),
        };
        // Expired entries are dropped as the cursor passes them.
        let mut keys = Vec::new();
        for (key, live) in examined {
            if !live {
                entries.remove(&key);
            } else if glob_match(pattern, &key) {
                keys.push(key);
            }
        }
        Ok((next, keys))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if lookup(&mut entries, key).is_some_and(|e| e.value == value) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
