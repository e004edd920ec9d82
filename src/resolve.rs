use crate::{
    library::{DataSource, ModId},
    mods_config::{read_mods_config, write_mods_config, ModsConfig},
    store::MetadataStore,
};
use anyhow::Result;
use serde::Serialize;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashSet},
    path::PathBuf,
};
use tracing::{debug, info};

/// Marker the active-list export appends to point at the Workshop copy.
pub const STEAM_SUFFIX: &str = "_steam";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveListRequest {
    /// A `ModsConfig.xml`; created with the base game when missing.
    Path(PathBuf),
    PackageIds(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActiveLists {
    pub active: Vec<ModId>,
    pub inactive: Vec<ModId>,
    pub duplicates: BTreeMap<String, Vec<ModId>>,
    pub missing: Vec<String>,
}

pub fn resolve_active_list(store: &MetadataStore, request: &ActiveListRequest) -> Result<ActiveLists> {
    match request {
        ActiveListRequest::PackageIds(ids) => Ok(resolve_package_ids(store, ids)),
        ActiveListRequest::Path(path) => {
            if !path.exists() {
                info!("{} not found; generating a base game list", path.display());
                write_mods_config(path, &ModsConfig::default_for(store.game_version()))?;
            }
            let config = read_mods_config(path)?;
            Ok(resolve_package_ids(store, &config.active_mods))
        }
    }
}

fn source_priority(steam_marker: bool) -> &'static [DataSource] {
    if steam_marker {
        &[DataSource::Workshop, DataSource::Local]
    } else {
        &[DataSource::Expansion, DataSource::Local, DataSource::Workshop]
    }
}

/// First source with any candidate wins; ties break on natural path order.
fn pick_duplicate(store: &MetadataStore, group: &[ModId], priority: &[DataSource]) -> Option<ModId> {
    for source in priority {
        let mut candidates: Vec<(String, ModId)> = group
            .iter()
            .filter_map(|id| store.get(*id))
            .filter(|record| record.data_source == *source)
            .map(|record| (record.path.to_string_lossy().to_string(), record.id))
            .collect();
        if candidates.is_empty() {
            continue;
        }
        candidates.sort_by(|a, b| natural_cmp(&a.0, &b.0).then(a.1.cmp(&b.1)));
        return candidates.first().map(|(_, id)| *id);
    }
    None
}

pub fn resolve_package_ids(store: &MetadataStore, requested: &[String]) -> ActiveLists {
    let duplicates = store.duplicate_groups();
    let mut active = Vec::new();
    let mut selected: HashSet<ModId> = HashSet::new();
    let mut resolved_duplicates: HashSet<String> = HashSet::new();
    let mut populated: HashSet<String> = HashSet::new();
    let mut targets: Vec<String> = Vec::new();

    for entry in requested {
        let normalized = entry.trim().to_lowercase();
        if normalized.is_empty() {
            continue;
        }
        let (target, steam_marker) = match normalized.strip_suffix(STEAM_SUFFIX) {
            Some(stripped) if !store.knows_package(&normalized) => (stripped.to_string(), true),
            _ => (normalized.clone(), false),
        };
        if !targets.contains(&target) {
            targets.push(target.clone());
        }

        if let Some(group) = duplicates.get(&target) {
            if resolved_duplicates.contains(&target) {
                continue;
            }
            if let Some(id) = pick_duplicate(store, group, source_priority(steam_marker)) {
                debug!("Resolved duplicate {target} to {id}");
                if selected.insert(id) {
                    active.push(id);
                }
                resolved_duplicates.insert(target.clone());
                populated.insert(target);
            }
        } else if let Some(ids) = store.ids_for_package(&target) {
            for id in ids {
                if selected.insert(*id) {
                    active.push(*id);
                }
            }
            populated.insert(target);
        }
    }

    let missing = targets
        .into_iter()
        .filter(|target| !populated.contains(target))
        .collect();
    let inactive = store.ids().filter(|id| !selected.contains(id)).collect();
    ActiveLists {
        active,
        inactive,
        duplicates,
        missing,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Chunk<'a> {
    Digits(&'a str),
    Text(&'a str),
}

fn chunks(value: &str) -> Vec<Chunk<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut digits = None;
    for (index, c) in value.char_indices() {
        let is_digit = c.is_ascii_digit();
        match digits {
            Some(current) if current != is_digit => {
                let piece = &value[start..index];
                out.push(if current { Chunk::Digits(piece) } else { Chunk::Text(piece) });
                start = index;
            }
            _ => {}
        }
        digits = Some(is_digit);
    }
    if let Some(current) = digits {
        let piece = &value[start..];
        out.push(if current { Chunk::Digits(piece) } else { Chunk::Text(piece) });
    }
    out
}

fn cmp_digits(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
        .then_with(|| a.len().cmp(&b.len()))
}

/// Orders embedded numbers by value: `mod2` < `mod10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let left = chunks(a);
    let right = chunks(b);
    for (l, r) in left.iter().zip(&right) {
        let ordering = match (l, r) {
            (Chunk::Digits(x), Chunk::Digits(y)) => cmp_digits(x, y),
            (Chunk::Text(x), Chunk::Text(y)) => x.cmp(y),
            (Chunk::Digits(_), Chunk::Text(_)) => Ordering::Less,
            (Chunk::Text(_), Chunk::Digits(_)) => Ordering::Greater,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        library::RawDescriptor,
        mods_config::read_mods_config,
        rimworld::BASE_GAME_PACKAGE_ID,
        testing::{store_with, FakeParser},
    };
    use rstest::rstest;
    use std::path::Path;
    use tempfile::TempDir;

    fn store() -> MetadataStore {
        let parser = FakeParser::new()
            .with("/game/Data/Core", RawDescriptor::new("ludeon.rimworld"))
            .with("/local/XMod", RawDescriptor::new("x.mod"))
            .with("/workshop/200", RawDescriptor::new("x.mod"))
            .with("/workshop/100", RawDescriptor::new("x.mod"))
            .with("/local/Solo", RawDescriptor::new("solo.mod"))
            .with("/local/dup10", RawDescriptor::new("twin.mod"))
            .with("/local/dup9", RawDescriptor::new("twin.mod"));
        let mut store = store_with(parser);
        store.upsert_batch(DataSource::Expansion, &[PathBuf::from("/game/Data/Core")]);
        store.upsert_batch(
            DataSource::Local,
            &["/local/XMod", "/local/Solo", "/local/dup10", "/local/dup9"].map(PathBuf::from),
        );
        store.upsert_batch(DataSource::Workshop, &["/workshop/200", "/workshop/100"].map(PathBuf::from));
        store.rebuild_indices();
        store
    }

    fn id(store: &MetadataStore, dir: &str) -> ModId {
        store.id_for_directory(Path::new(dir)).expect("id")
    }

    fn request(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn steam_marker_prefers_workshop_copy() {
        let store = store();
        let lists = resolve_package_ids(&store, &request(&["x.mod_steam"]));
        // Natural path order picks /workshop/100 before /workshop/200.
        assert_eq!(lists.active, vec![id(&store, "/workshop/100")]);
        assert!(lists.missing.is_empty());
    }

    #[test]
    fn plain_entry_prefers_local_over_workshop() {
        let store = store();
        let lists = resolve_package_ids(&store, &request(&["X.Mod", "x.mod"]));
        assert_eq!(lists.active, vec![id(&store, "/local/XMod")]);
    }

    #[test]
    fn ties_use_natural_path_order() {
        let store = store();
        let lists = resolve_package_ids(&store, &request(&["twin.mod"]));
        assert_eq!(lists.active, vec![id(&store, "/local/dup9")]);
    }

    #[test]
    fn missing_and_inactive_are_reported() {
        let store = store();
        let lists = resolve_package_ids(&store, &request(&["ludeon.rimworld", "missing.mod", "solo.mod"]));
        assert_eq!(lists.missing, vec!["missing.mod"]);
        assert_eq!(
            lists.active,
            vec![id(&store, "/game/Data/Core"), id(&store, "/local/Solo")]
        );
        assert_eq!(lists.inactive.len(), store.len() - 2);
        assert!(!lists.inactive.contains(&id(&store, "/local/Solo")));
        assert_eq!(lists.duplicates.len(), 2);
        assert_eq!(lists.duplicates["x.mod"].len(), 3);
    }

    #[test]
    fn resolution_is_deterministic() {
        let store = store();
        let req = request(&["x.mod_steam", "twin.mod", "ghost", "solo.mod", "x.mod"]);
        let first = resolve_package_ids(&store, &req);
        for _ in 0..5 {
            assert_eq!(resolve_package_ids(&store, &req), first);
        }
    }

    #[test]
    fn missing_list_file_is_created_with_base_game() {
        let store = store();
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("ModsConfig.xml");
        let lists = resolve_active_list(&store, &ActiveListRequest::Path(path.clone())).expect("resolve");
        assert_eq!(lists.active, vec![id(&store, "/game/Data/Core")]);
        let written = read_mods_config(&path).expect("read back");
        assert_eq!(written.active_mods, vec![BASE_GAME_PACKAGE_ID]);
    }

    #[rstest]
    #[case("mod2", "mod10", Ordering::Less)]
    #[case("/a/dup9", "/a/dup10", Ordering::Less)]
    #[case("abc", "abd", Ordering::Less)]
    #[case("item007", "item7", Ordering::Greater)]
    #[case("same", "same", Ordering::Equal)]
    #[case("a", "a1", Ordering::Less)]
    fn natural_ordering(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        assert_eq!(natural_cmp(a, b), expected);
    }
}
