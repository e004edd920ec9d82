use crate::error::MetadataError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    fs,
    path::Path,
};
use tracing::{debug, info};

/// Ordering hints for one package id from a community or user rule file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRules {
    #[serde(rename = "loadBefore", default, deserialize_with = "lenient_targets")]
    pub load_before: Vec<String>,
    #[serde(rename = "loadAfter", default, deserialize_with = "lenient_targets")]
    pub load_after: Vec<String>,
    #[serde(rename = "loadTop", default, deserialize_with = "lenient_targets")]
    pub load_top: Vec<String>,
    #[serde(rename = "loadBottom", default, deserialize_with = "lenient_targets")]
    pub load_bottom: Vec<String>,
}

/// Accepts a list of package ids, or an object keyed by package id (the
/// shape community rule files use, with name/comment payloads). Anything
/// else, and bare flag entries like `{"value": true}`, yield no targets.
fn lenient_targets<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let targets = match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Value::Object(map) => map
            .into_iter()
            .filter(|(_, payload)| !payload.is_boolean())
            .map(|(key, _)| key)
            .collect(),
        _ => Vec::new(),
    };
    Ok(targets
        .into_iter()
        .map(|target: String| target.trim().to_lowercase())
        .filter(|target| !target.is_empty())
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: HashMap<String, LoadRules>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: HashMap<String, Value>,
}

impl RuleSet {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let file: RuleFile = serde_json::from_str(raw)?;
        let mut rules = HashMap::new();
        for (package_id, value) in file.rules {
            match serde_json::from_value::<LoadRules>(value) {
                Ok(entry) => {
                    rules.insert(package_id.trim().to_lowercase(), entry);
                }
                Err(err) => debug!("skip rule entry {package_id}: {err}"),
            }
        }
        Ok(Self { rules })
    }

    pub fn get(&self, package_id: &str) -> Option<&LoadRules> {
        self.rules.get(package_id)
    }

    pub fn insert(&mut self, package_id: &str, rules: LoadRules) {
        self.rules.insert(package_id.to_lowercase(), rules);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn ensure_rules_file(path: &Path, kind: &str) -> Result<(), MetadataError> {
    if path.as_os_str().is_empty() {
        return Err(MetadataError::configuration(kind, "no path configured"));
    }
    if path.is_dir() {
        return Err(MetadataError::configuration(
            kind,
            format!("{} is a directory", path.display()),
        ));
    }
    if !path.exists() {
        return Err(MetadataError::configuration(
            kind,
            format!("{} does not exist", path.display()),
        ));
    }
    Ok(())
}

pub fn load_rule_set(path: &Path, kind: &str) -> Result<RuleSet, MetadataError> {
    ensure_rules_file(path, kind)?;
    let raw = fs::read_to_string(path).map_err(|err| {
        MetadataError::configuration(kind, format!("read {}: {err}", path.display()))
    })?;
    let rules = RuleSet::from_json(&raw).map_err(|err| {
        MetadataError::configuration(kind, format!("parse {}: {err}", path.display()))
    })?;
    info!("Loaded {} {kind} entries from {}", rules.len(), path.display());
    Ok(rules)
}

/// The user rule file is created empty on first use.
pub fn load_or_create_user_rules(path: &Path) -> Result<RuleSet, MetadataError> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                MetadataError::configuration("User Rules", format!("create {}: {err}", parent.display()))
            })?;
        }
        fs::write(path, "{\"rules\":{}}").map_err(|err| {
            MetadataError::configuration("User Rules", format!("write {}: {err}", path.display()))
        })?;
        info!("Created empty user rules at {}", path.display());
    }
    load_rule_set(path, "User Rules")
}
