use crate::steamdb::Database;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Key sets steering `merge_into`.
///
/// `overwrite_keys` are replaced wholesale from the fresh side and deleted
/// when the fresh side lacks them. `preserve_keys` are also replaced
/// wholesale when the fresh side carries them, but survive when it does not;
/// that is how curated annotations outlive automated re-queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePolicy {
    pub overwrite_keys: BTreeSet<String>,
    pub preserve_keys: BTreeSet<String>,
    pub prune_exempt_keys: BTreeSet<String>,
    pub purge_keys: BTreeSet<String>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            overwrite_keys: BTreeSet::from(["dependencies".to_string()]),
            preserve_keys: BTreeSet::from(["blacklist".to_string()]),
            prune_exempt_keys: BTreeSet::from(["dependencies".to_string()]),
            purge_keys: BTreeSet::new(),
        }
    }
}

impl MergePolicy {
    /// Plain recursive merge with no exception keys.
    pub fn plain() -> Self {
        Self {
            overwrite_keys: BTreeSet::new(),
            preserve_keys: BTreeSet::new(),
            prune_exempt_keys: BTreeSet::new(),
            purge_keys: BTreeSet::new(),
        }
    }

    fn replaces_wholesale(&self, key: &str) -> bool {
        self.overwrite_keys.contains(key) || self.preserve_keys.contains(key)
    }
}

pub fn merge_into(existing: &mut Map<String, Value>, fresh: Map<String, Value>, policy: &MergePolicy) {
    existing.retain(|key, _| !policy.overwrite_keys.contains(key) || fresh.contains_key(key));

    for (key, value) in fresh {
        if policy.replaces_wholesale(&key) {
            existing.insert(key, value);
            continue;
        }
        match value {
            Value::Object(incoming) if existing.get(&key).is_some_and(Value::is_object) => {
                if let Some(Value::Object(current)) = existing.get_mut(&key) {
                    merge_into(current, incoming, policy);
                }
            }
            value => {
                existing.insert(key, value);
            }
        }
    }

    existing.retain(|key, value| {
        let empty_object = matches!(value, Value::Object(map) if map.is_empty());
        !empty_object || policy.prune_exempt_keys.contains(key)
    });
    for key in &policy.purge_keys {
        existing.remove(key);
    }
}

/// Merges `fresh` into `existing`; the result carries the fresh build time.
pub fn merge_databases(mut existing: Database, fresh: Database, policy: &MergePolicy) -> Database {
    existing.version = fresh.version;
    merge_into(&mut existing.database, fresh.database, policy);
    existing
}
