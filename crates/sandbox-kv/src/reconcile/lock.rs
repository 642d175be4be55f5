use std::time::Duration;

use uuid::Uuid;

use crate::error::Result;
use crate::keys;
use crate::store::Store;

/// Store-resident mutual exclusion for reconciliation.
///
/// The marker expires after `ttl`, so a holder that dies never blocks other
/// instances for longer than that.
pub struct ReconciliationLock<'a> {
    store: &'a dyn Store,
    token: String,
    ttl: Duration,
}

impl<'a> ReconciliationLock<'a> {
    pub fn new(store: &'a dyn Store, ttl: Duration) -> Self {
        Self {
            store,
            token: Uuid::new_v4().simple().to_string(),
            ttl,
        }
    }

    /// Returns whether this instance now holds the lock.
    pub async fn acquire(&self) -> Result<bool> {
        self.store.set_nx(keys::LOCK_KEY, &self.token, self.ttl).await
    }

    /// Release the lock if this instance still holds it.
    pub async fn release(&self) -> Result<bool> {
        self.store.delete_if_equals(keys::LOCK_KEY, &self.token).await
    }
}
