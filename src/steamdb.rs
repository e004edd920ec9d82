use crate::error::MetadataError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, fs, path::Path};
use time::{macros::format_description, OffsetDateTime};
use tracing::info;

/// On-disk curated metadata database: `{"version": <unix secs>, "database": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Database {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub database: Map<String, Value>,
}

impl Database {
    pub fn read(path: &Path) -> Result<Self, MetadataError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            MetadataError::configuration("Steam DB", format!("read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            MetadataError::configuration("Steam DB", format!("parse {}: {err}", path.display()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistNote {
    pub comment: String,
}

/// Typed view of one database entry; unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteEntry {
    pub package_id: Option<String>,
    pub name: Option<String>,
    pub steam_name: Option<String>,
    pub dependencies: Vec<String>,
    pub blacklist: Option<BlacklistNote>,
    pub is_app: bool,
}

impl RemoteEntry {
    fn from_value(value: &Value) -> Self {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        let package_id = text("packageId")
            .or_else(|| text("packageid"))
            .map(|id| id.trim().to_lowercase());
        let dependencies = match value.get("dependencies") {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let blacklist = value.get("blacklist").and_then(|note| match note {
            Value::Object(map) => Some(BlacklistNote {
                comment: map
                    .get("comment")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            Value::Bool(true) => Some(BlacklistNote {
                comment: String::new(),
            }),
            _ => None,
        });
        Self {
            package_id,
            name: text("name"),
            steam_name: text("steamName"),
            dependencies,
            blacklist,
            is_app: value.get("appid").and_then(Value::as_bool).unwrap_or(false),
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().or(self.steam_name.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteDatabase {
    pub version: i64,
    entries: HashMap<String, RemoteEntry>,
    package_names: HashMap<String, String>,
}

impl RemoteDatabase {
    pub fn from_database(database: &Database) -> Self {
        let entries: HashMap<String, RemoteEntry> = database
            .database
            .iter()
            .map(|(key, value)| (key.clone(), RemoteEntry::from_value(value)))
            .collect();
        let package_names = entries
            .values()
            .filter_map(|entry| match (&entry.package_id, &entry.name) {
                (Some(package_id), Some(name)) => Some((package_id.clone(), name.clone())),
                _ => None,
            })
            .collect();
        Self {
            version: database.version,
            entries,
            package_names,
        }
    }

    /// Workshop name for a package id, for mods that are not installed.
    pub fn name_for_package(&self, package_id: &str) -> Option<&str> {
        self.package_names
            .get(&package_id.trim().to_lowercase())
            .map(String::as_str)
    }

    pub fn get(&self, published_file_id: &str) -> Option<&RemoteEntry> {
        self.entries.get(published_file_id)
    }

    /// Package id recorded for a published file id, if any.
    pub fn package_for(&self, published_file_id: &str) -> Option<&str> {
        self.get(published_file_id)
            .and_then(|entry| entry.package_id.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct LoadedDatabase {
    pub database: RemoteDatabase,
    pub expired: bool,
}

pub fn load_remote_database(path: &Path, expiry_secs: i64) -> Result<LoadedDatabase, MetadataError> {
    if path.as_os_str().is_empty() || !path.is_file() {
        return Err(MetadataError::configuration(
            "Steam DB",
            format!("{} is not a readable file", path.display()),
        ));
    }
    let raw = Database::read(path)?;
    let database = RemoteDatabase::from_database(&raw);
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let expired = expiry_secs > 0 && now - database.version > expiry_secs;
    info!(
        "Loaded {} Steam DB entries from {} (built {})",
        database.len(),
        path.display(),
        format_timestamp(database.version)
    );
    Ok(LoadedDatabase { database, expired })
}

pub fn format_timestamp(unix_secs: i64) -> String {
    OffsetDateTime::from_unix_timestamp(unix_secs)
        .ok()
        .and_then(|ts| {
            ts.format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
                .ok()
        })
        .unwrap_or_else(|| unix_secs.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlacklistHit {
    pub published_file_id: String,
    pub name: String,
    pub comment: String,
}

/// Ids in `published_file_ids` the database marks as blacklisted.
pub fn check_blacklisted(published_file_ids: &[String], database: &RemoteDatabase) -> Vec<BlacklistHit> {
    published_file_ids
        .iter()
        .filter_map(|pfid| {
            let entry = database.get(pfid)?;
            let note = entry.blacklist.as_ref()?;
            Some(BlacklistHit {
                published_file_id: pfid.clone(),
                name: entry.display_name().unwrap_or(pfid).to_string(),
                comment: note.comment.clone(),
            })
        })
        .collect()
}
