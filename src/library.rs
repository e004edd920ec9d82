use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
};

/// Store-assigned identifier, stable for the lifetime of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModId(pub u64);

impl fmt::Display for ModId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Expansion,
    Local,
    Workshop,
}

impl DataSource {
    pub const ALL: [DataSource; 3] = [DataSource::Expansion, DataSource::Local, DataSource::Workshop];

    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::Expansion => "expansion",
            DataSource::Local => "local",
            DataSource::Workshop => "workshop",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "expansion" | "expansions" | "core" => Some(DataSource::Expansion),
            "local" => Some(DataSource::Local),
            "workshop" | "steam" => Some(DataSource::Workshop),
            _ => None,
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ordering edge. `explicit` marks edges the holder declared itself;
/// implied edges were pushed onto it by the other side's declaration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LoadRule {
    pub package_id: String,
    pub explicit: bool,
}

impl LoadRule {
    pub fn explicit(package_id: &str) -> Self {
        Self {
            package_id: package_id.to_string(),
            explicit: true,
        }
    }

    pub fn implied(package_id: &str) -> Self {
        Self {
            package_id: package_id.to_string(),
            explicit: false,
        }
    }
}

/// A relation list as declared: an unconditional part plus per-version
/// parts keyed by the descriptor's version tag (`v1.4`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedList {
    pub all: Vec<String>,
    pub by_version: BTreeMap<String, Vec<String>>,
}

impl VersionedList {
    pub fn plain<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            all: items.into_iter().map(Into::into).collect(),
            by_version: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.by_version.values().all(Vec::is_empty)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRelations {
    pub dependencies: VersionedList,
    pub incompatible_with: VersionedList,
    pub load_after: VersionedList,
    pub force_load_after: VersionedList,
    pub load_before: VersionedList,
    pub force_load_before: VersionedList,
}

/// What a descriptor parser hands back for one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDescriptor {
    pub package_id: String,
    pub name: Option<String>,
    pub authors: Vec<String>,
    pub description: Option<String>,
    pub supported_versions: Vec<String>,
    pub published_file_id: Option<String>,
    pub relations: RawRelations,
}

impl RawDescriptor {
    pub fn new(package_id: &str) -> Self {
        Self {
            package_id: package_id.to_string(),
            ..Self::default()
        }
    }
}

pub const INVALID_PACKAGE_ID: &str = "invalid.item";
pub const INVALID_NAME: &str = "Invalid item";
pub const INVALID_AUTHOR: &str = "Not found";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModRecord {
    pub id: ModId,
    pub package_id: String,
    pub data_source: DataSource,
    pub path: PathBuf,
    pub descriptor_path: PathBuf,
    #[serde(default)]
    pub published_file_id: Option<String>,
    #[serde(default)]
    pub app_id: Option<u32>,
    pub name: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub supported_versions: Vec<String>,
    #[serde(default)]
    pub steam_url: Option<String>,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default)]
    pub remote_time_created: Option<i64>,
    #[serde(default)]
    pub remote_time_updated: Option<i64>,
    #[serde(default)]
    pub raw: RawRelations,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub incompatibilities: BTreeSet<String>,
    #[serde(default)]
    pub load_these_before: BTreeSet<LoadRule>,
    #[serde(default)]
    pub load_these_after: BTreeSet<LoadRule>,
}

impl ModRecord {
    pub fn from_descriptor(
        id: ModId,
        data_source: DataSource,
        path: PathBuf,
        descriptor_path: PathBuf,
        descriptor: RawDescriptor,
    ) -> Self {
        let package_id = descriptor.package_id.trim().to_lowercase();
        let name = descriptor
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| package_id.clone());
        Self {
            id,
            package_id,
            data_source,
            path,
            descriptor_path,
            published_file_id: descriptor.published_file_id,
            app_id: None,
            name,
            authors: descriptor.authors,
            description: descriptor.description.unwrap_or_default(),
            supported_versions: descriptor.supported_versions,
            steam_url: None,
            invalid: false,
            remote_time_created: None,
            remote_time_updated: None,
            raw: descriptor.relations,
            dependencies: BTreeSet::new(),
            incompatibilities: BTreeSet::new(),
            load_these_before: BTreeSet::new(),
            load_these_after: BTreeSet::new(),
        }
    }

    /// Placeholder kept in the store so the directory stays visible.
    pub fn invalid(
        id: ModId,
        data_source: DataSource,
        path: PathBuf,
        descriptor_path: PathBuf,
        err: &ParseError,
    ) -> Self {
        let mut record = Self::from_descriptor(
            id,
            data_source,
            path,
            descriptor_path,
            RawDescriptor::new(INVALID_PACKAGE_ID),
        );
        record.name = INVALID_NAME.to_string();
        record.authors = vec![INVALID_AUTHOR.to_string()];
        record.description = err.to_string();
        record.invalid = true;
        record
    }

    pub fn folder_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn clear_relations(&mut self) {
        self.dependencies.clear();
        self.incompatibilities.clear();
        self.load_these_before.clear();
        self.load_these_after.clear();
    }

    /// Moves the edges other records pushed onto `previous` over to this
    /// freshly parsed record. Its own declarations are recompiled anyway.
    pub fn inherit_implied(&mut self, previous: &ModRecord) {
        self.load_these_before.extend(
            previous
                .load_these_before
                .iter()
                .filter(|rule| !rule.explicit)
                .cloned(),
        );
        self.load_these_after.extend(
            previous
                .load_these_after
                .iter()
                .filter(|rule| !rule.explicit)
                .cloned(),
        );
    }

    pub fn authors_label(&self) -> String {
        self.authors.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(package_id: &str) -> ModRecord {
        ModRecord::from_descriptor(
            ModId(1),
            DataSource::Local,
            PathBuf::from("/mods/Example"),
            PathBuf::from("/mods/Example/About/About.xml"),
            RawDescriptor::new(package_id),
        )
    }

    #[test]
    fn package_ids_are_lowercased_and_name_falls_back() {
        let record = record("  Author.CoolMod ");
        assert_eq!(record.package_id, "author.coolmod");
        assert_eq!(record.name, "author.coolmod");
        assert_eq!(record.folder_name(), "Example");
    }

    #[test]
    fn invalid_placeholder_carries_reason() {
        let err = ParseError::MissingDescriptor(PathBuf::from("/mods/Broken"));
        let record = ModRecord::invalid(
            ModId(9),
            DataSource::Workshop,
            PathBuf::from("/mods/Broken"),
            PathBuf::from("/mods/Broken/About/About.xml"),
            &err,
        );
        assert!(record.invalid);
        assert_eq!(record.package_id, INVALID_PACKAGE_ID);
        assert_eq!(record.name, INVALID_NAME);
        assert_eq!(record.authors, vec![INVALID_AUTHOR.to_string()]);
        assert!(record.description.contains("/mods/Broken"));
    }

    #[test]
    fn inherit_implied_keeps_only_foreign_edges() {
        let mut previous = record("a.one");
        previous.load_these_before.insert(LoadRule::explicit("b.two"));
        previous.load_these_before.insert(LoadRule::implied("c.three"));
        previous.load_these_after.insert(LoadRule::implied("d.four"));

        let mut fresh = record("a.one");
        fresh.inherit_implied(&previous);
        assert_eq!(
            fresh.load_these_before.iter().collect::<Vec<_>>(),
            vec![&LoadRule::implied("c.three")]
        );
        assert!(fresh.load_these_after.contains(&LoadRule::implied("d.four")));
    }

    #[test]
    fn data_source_parse_accepts_aliases() {
        assert_eq!(DataSource::parse("Steam"), Some(DataSource::Workshop));
        assert_eq!(DataSource::parse("expansion"), Some(DataSource::Expansion));
        assert_eq!(DataSource::parse("nope"), None);
    }
}
