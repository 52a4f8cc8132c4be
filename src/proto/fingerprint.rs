//! Canonical result serialization for diff suppression.
//!
//! The broker withholds a push when a re-evaluated result is
//! structurally identical to the last delivered one. "Structurally
//! identical" is defined as byte equality of the canonical
//! serialization produced here: `serde_json`'s default object map is
//! ordered by key, so two structurally equal values — regardless of the
//! key order they were built with — serialize to the same string.
//! Methods returning genuinely unstable values (e.g. fresh timestamps)
//! will therefore push on every re-evaluation, which is the intended
//! reading: the protocol compares serialized results, not identities.

use serde_json::Value;

/// Returns the canonical serialization of a result value.
///
/// Falls back to the `Display` rendering of the value when
/// serialization fails, which cannot happen for values that already
/// arrived as [`Value`] but keeps this function total.
#[must_use]
pub fn fingerprint(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}
