//! Store key layout shared by the kv resource and the reconciler.

pub const SEPARATOR: char = '#';

/// Reconciliation lock marker.
pub const LOCK_KEY: &str = "recon#lock";

/// Persisted reconciliation progress.
pub const STATUS_KEY: &str = "recon#status";

const SANDBOXES: &str = "sandboxes";
const COUNT: &str = "count";

/// A tenant id that keeps the layout unambiguous.
pub fn is_valid_sandbox_id(sandbox_id: &str) -> bool {
    !sandbox_id.is_empty() && !sandbox_id.contains(SEPARATOR)
}

/// `sandboxes#<tenant>#<key>`
pub fn sandboxed_key(sandbox_id: &str, key: &str) -> String {
    format!("{SANDBOXES}{SEPARATOR}{sandbox_id}{SEPARATOR}{key}")
}

/// `count#<tenant>`
pub fn count_key(sandbox_id: &str) -> String {
    format!("{COUNT}{SEPARATOR}{sandbox_id}")
}

/// What a scanned key contributes to its tenant's recomputed count.
#[derive(Debug, PartialEq, Eq)]
pub enum Tally<'a> {
    /// A tenant value: counts one.
    Value(&'a str),
    /// A tenant counter: counts nothing but keeps the tenant in the tally.
    Counter(&'a str),
}

pub fn classify(key: &str) -> Option<Tally<'_>> {
    let (kind, rest) = key.split_once(SEPARATOR)?;
    match kind {
        SANDBOXES => rest
            .split_once(SEPARATOR)
            .map(|(tenant, _)| Tally::Value(tenant)),
        COUNT if is_valid_sandbox_id(rest) => Some(Tally::Counter(rest)),
        _ => None,
    }
}
