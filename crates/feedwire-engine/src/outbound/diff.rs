//! Identity-based collection diff.
//!
//! Items are keyed by their `id` field. Numbers and strings key by their
//! text, so `7` and `"7"` are the same identity. Content is compared with
//! structural JSON equality.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;

/// Field holding an item's identity.
pub const ID_FIELD: &str = "id";

/// An item had no usable identity.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("item at index {index} has no id")]
pub struct MissingIdentity {
    /// Position of the offending item.
    pub index: usize,
}

/// Inserted, updated and deleted item sets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diff {
    /// Items absent from the baseline.
    pub inserted: Vec<Value>,
    /// Items whose content changed.
    pub updated: Vec<Value>,
    /// Baseline items absent from the fresh collection.
    pub deleted: Vec<Value>,
}

impl Diff {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Every fresh item as an insertion.
    pub fn insert_all(items: &[Value]) -> Self {
        Self {
            inserted: items.to_vec(),
            ..Self::default()
        }
    }
}

/// Identity text of an `id` value. `null` has no identity.
pub fn identity_key(id: &Value) -> Option<String> {
    match id {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Identity of an item.
pub fn identity(item: &Value) -> Option<String> {
    item.get(ID_FIELD).and_then(identity_key)
}

fn require_identity(item: &Value, index: usize) -> Result<String, MissingIdentity> {
    identity(item).ok_or(MissingIdentity { index })
}

/// Diff `fresh` against `baseline`.
///
/// Duplicate identities in `fresh` keep their first occurrence.
pub fn diff(fresh: &[Value], baseline: &[Value]) -> Result<Diff, MissingIdentity> {
    let mut previous: HashMap<String, &Value> = HashMap::with_capacity(baseline.len());
    for (index, item) in baseline.iter().enumerate() {
        let _ = previous
            .entry(require_identity(item, index)?)
            .or_insert(item);
    }

    let mut result = Diff::default();
    let mut seen: HashSet<String> = HashSet::with_capacity(fresh.len());
    for (index, item) in fresh.iter().enumerate() {
        let key = require_identity(item, index)?;
        match previous.get(key.as_str()) {
            None if !seen.contains(&key) => result.inserted.push(item.clone()),
            Some(old) if !seen.contains(&key) && *old != item => {
                result.updated.push(item.clone());
            }
            _ => {}
        }
        let _ = seen.insert(key);
    }

    let mut removed: HashSet<String> = HashSet::new();
    for item in baseline {
        let Some(key) = identity(item) else {
            continue;
        };
        if !seen.contains(&key) && removed.insert(key) {
            result.deleted.push(item.clone());
        }
    }
    Ok(result)
}

/// Apply a diff to a baseline in place.
pub fn apply(baseline: &mut Vec<Value>, diff: &Diff) {
    let deleted: HashSet<String> = diff.deleted.iter().filter_map(identity).collect();
    if !deleted.is_empty() {
        baseline.retain(|item| identity(item).is_none_or(|key| !deleted.contains(&key)));
    }
    upsert(baseline, diff.inserted.iter().chain(&diff.updated));
}

/// Insert or replace items by identity. Items without identity are skipped.
pub fn upsert<'a>(baseline: &mut Vec<Value>, items: impl IntoIterator<Item = &'a Value>) {
    let mut index: HashMap<String, usize> = baseline
        .iter()
        .enumerate()
        .filter_map(|(i, item)| identity(item).map(|key| (key, i)))
        .collect();
    for item in items {
        let Some(key) = identity(item) else {
            continue;
        };
        if let Some(&i) = index.get(&key) {
            baseline[i] = item.clone();
        } else {
            let _ = index.insert(key, baseline.len());
            baseline.push(item.clone());
        }
    }
}
