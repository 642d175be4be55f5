use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::keys::{self, Tally};
use crate::store::{SCAN_START, Store};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Complete,
    Scanning,
    Saving,
}

/// Persisted progress of one reconciliation pass.
///
/// Stored as JSON under [`keys::STATUS_KEY`] so a pass can resume in a later
/// period or on another host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationStatus {
    pub phase: Phase,
    /// Next scan cursor; meaningful while scanning.
    #[serde(default)]
    pub cursor: String,
    /// Recomputed counts not yet written back, by sandbox id.
    #[serde(default)]
    pub pending: BTreeMap<String, i64>,
    #[serde(default)]
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl ReconciliationStatus {
    /// Load the stored status, or a never-completed one.
    pub async fn load(store: &dyn Store) -> Result<Self, ReconcileError> {
        match store.get(keys::STATUS_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Self::default()),
        }
    }

    pub async fn save(&self, store: &dyn Store) -> Result<(), ReconcileError> {
        let raw = serde_json::to_string(self)?;
        store.set(keys::STATUS_KEY, &raw, None).await?;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    pub fn is_scanning(&self) -> bool {
        self.phase == Phase::Scanning
    }

    pub fn is_saving(&self) -> bool {
        self.phase == Phase::Saving
    }

    /// A pass that never completed, or completed more than `expiry` ago.
    pub fn is_expired(&self, expiry: Duration, now: DateTime<Utc>) -> bool {
        let expiry = TimeDelta::from_std(expiry).unwrap_or(TimeDelta::MAX);
        self.last_completed_at
            .is_none_or(|at| now.signed_duration_since(at) > expiry)
    }

    /// Start a fresh scan.
    pub fn reset(&mut self) {
        self.phase = Phase::Scanning;
        self.cursor = SCAN_START.to_string();
        self.pending.clear();
    }

    /// Fold one scan batch in. When the cursor wraps, move on to saving, or
    /// straight to complete if there is nothing to save.
    ///
    /// A key repeated within the batch counts once.
    pub fn update_scan(&mut self, cursor: String, batch: &[String], now: DateTime<Utc>) {
        let unique: BTreeSet<&String> = batch.iter().collect();
        for key in unique {
            match keys::classify(key) {
                Some(Tally::Value(id)) => *self.pending.entry(id.to_string()).or_default() += 1,
                Some(Tally::Counter(id)) => {
                    self.pending.entry(id.to_string()).or_default();
                }
                None => {}
            }
        }
        self.cursor = cursor;
        if self.cursor == SCAN_START {
            self.phase = Phase::Saving;
            self.finish_if_saved(now);
        }
    }

    /// Take the next recomputed count to write back.
    pub fn pop_count(&mut self) -> Option<(String, i64)> {
        self.pending.pop_first()
    }

    /// Mark the pass complete once every count has been written.
    pub fn finish_if_saved(&mut self, now: DateTime<Utc>) {
        if self.is_saving() && self.pending.is_empty() {
            self.phase = Phase::Complete;
            self.cursor.clear();
            self.last_completed_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn expiry() {
        let day = Duration::from_secs(86_400);
        let mut status = ReconciliationStatus::default();
        assert!(status.is_expired(day, at(0)));
        status.last_completed_at = Some(at(1_000));
        assert!(!status.is_expired(day, at(1_000 + 86_400)));
        assert!(status.is_expired(day, at(1_000 + 86_401)));
    }

    #[test]
    fn scan_tallies_until_cursor_wraps() {
        let mut status = ReconciliationStatus::default();
        status.reset();
        status.update_scan(
            "17".into(),
            &[
                "sandboxes#a#x".into(),
                "sandboxes#a#y".into(),
                "count#b".into(),
                "recon#lock".into(),
            ],
            at(5),
        );
        assert!(status.is_scanning());
        assert_eq!(status.cursor, "17");
        status.update_scan(SCAN_START.into(), &["sandboxes#b#x".into()], at(5));
        assert!(status.is_saving());
        assert_eq!(
            status.pending,
            BTreeMap::from([("a".to_string(), 2), ("b".to_string(), 1)])
        );
    }

    #[test]
    fn repeated_key_in_a_batch_counts_once() {
        let mut status = ReconciliationStatus::default();
        status.reset();
        status.update_scan(
            SCAN_START.into(),
            &[
                "sandboxes#a#x".into(),
                "sandboxes#a#y".into(),
                "sandboxes#a#x".into(),
            ],
            at(1),
        );
        assert!(status.is_saving());
        assert_eq!(status.pending, BTreeMap::from([("a".to_string(), 2)]));
    }

    #[test]
    fn empty_scan_completes_directly() {
        let mut status = ReconciliationStatus::default();
        status.reset();
        status.update_scan(SCAN_START.into(), &[], at(9));
        assert!(status.is_complete());
        assert_eq!(status.last_completed_at, Some(at(9)));
    }

    #[test]
    fn saving_drains_then_completes() {
        let mut status = ReconciliationStatus {
            phase: Phase::Saving,
            pending: BTreeMap::from([("a".to_string(), 0)]),
            ..Default::default()
        };
        assert_eq!(status.pop_count(), Some(("a".to_string(), 0)));
        status.finish_if_saved(at(3));
        assert!(status.is_complete());
        assert_eq!(status.pop_count(), None);
    }

    #[tokio::test]
    async fn persists_as_json() {
        let store = MemoryStore::new();
        assert_eq!(
            ReconciliationStatus::load(&store).await.unwrap(),
            ReconciliationStatus::default()
        );
        let mut status = ReconciliationStatus::default();
        status.reset();
        status.update_scan("42".into(), &["sandboxes#t#k".into()], at(0));
        status.save(&store).await.unwrap();

        let raw = store.get(keys::STATUS_KEY).await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["phase"], "scanning");
        assert_eq!(json["cursor"], "42");
        assert_eq!(json["pending"]["t"], 1);
        assert_eq!(ReconciliationStatus::load(&store).await.unwrap(), status);
    }

    #[tokio::test]
    async fn corrupt_status_is_an_error() {
        let store = MemoryStore::new();
        store.set(keys::STATUS_KEY, "not json", None).await.unwrap();
        assert!(matches!(
            ReconciliationStatus::load(&store).await,
            Err(ReconcileError::Status(_))
        ));
    }
}
