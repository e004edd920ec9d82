use crate::{
    compile::{self, major_minor, CompileContext, VersionMatcher},
    config::AppConfig,
    events::{EventSink, WatchEvent},
    library::{DataSource, ModId, ModRecord},
    rimworld,
    rules::{load_or_create_user_rules, load_rule_set},
    steamdb::{format_timestamp, load_remote_database},
    store::MetadataStore,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};
use tracing::{debug, info, warn};

/// Folders scanned for each data source. `None` disables the source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFolders {
    pub expansions: Option<PathBuf>,
    pub local: Option<PathBuf>,
    pub workshop: Option<PathBuf>,
}

impl SourceFolders {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            expansions: config.game_folder.as_deref().map(rimworld::expansions_folder),
            local: config.local_folder.clone(),
            workshop: config.workshop_folder.clone(),
        }
    }

    pub fn folder(&self, source: DataSource) -> Option<&PathBuf> {
        match source {
            DataSource::Expansion => self.expansions.as_ref(),
            DataSource::Local => self.local.as_ref(),
            DataSource::Workshop => self.workshop.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub scanned: usize,
    pub created: usize,
    pub invalid: usize,
    pub purged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub game_version: Option<String>,
    pub sources: BTreeMap<DataSource, SourceSummary>,
    pub total: usize,
    pub duplicates: usize,
}

/// Reads the game version and every external rule source. Each failure
/// narrows the feature set and surfaces a warning; none aborts.
pub fn load_compile_context(config: &AppConfig, events: &EventSink) -> (Option<String>, CompileContext) {
    let mut ctx = CompileContext {
        dependency_for_sorting: config.dependency_for_sorting,
        ..CompileContext::default()
    };

    let game_version = match &config.game_folder {
        Some(folder) => match rimworld::read_game_version(folder) {
            Ok(version) => Some(version),
            Err(err) => {
                events.warn(
                    "Missing game version",
                    "Version-specific rules are skipped.",
                    &err.to_string(),
                );
                None
            }
        },
        None => None,
    };
    if let Some(version) = &game_version {
        match VersionMatcher::new(version, config.strict_version_keys) {
            Ok(matcher) => ctx.version = Some(matcher),
            Err(err) => events.warn(
                "Unreadable game version",
                "Version-specific rules are skipped.",
                &err.to_string(),
            ),
        }
    }

    if let Some(path) = &config.steam_db_path {
        match load_remote_database(path, config.database_expiry_secs) {
            Ok(loaded) => {
                if loaded.expired {
                    events.warn(
                        "Steam DB metadata expired",
                        "The Steam DB is older than the configured expiry; it is still used.",
                        &format!("Last updated {}", format_timestamp(loaded.database.version)),
                    );
                }
                ctx.remote_db = Some(loaded.database);
            }
            Err(err) => events.warn("Steam DB unavailable", "Skipping Steam DB dependencies.", &err.to_string()),
        }
    }

    if let Some(path) = &config.community_rules_path {
        match load_rule_set(path, "Community Rules") {
            Ok(rules) => ctx.community_rules = Some(rules),
            Err(err) => events.warn("Community Rules unavailable", "Skipping community rules.", &err.to_string()),
        }
    }

    match config.user_rules_path() {
        Ok(path) => match load_or_create_user_rules(&path) {
            Ok(rules) => ctx.user_rules = Some(rules),
            Err(err) => events.warn("User Rules unavailable", "Skipping user rules.", &err.to_string()),
        },
        Err(err) => events.warn("User Rules unavailable", "Skipping user rules.", &err.to_string()),
    }

    (game_version, ctx)
}

/// Fills in what a descriptor cannot carry for its source. Base game data
/// folders may lack a usable descriptor; known ones are named after the
/// expansion they hold. Workshop items get their page url.
pub(crate) fn decorate(record: &mut ModRecord, game_version: Option<&str>) {
    match record.data_source {
        DataSource::Expansion => name_expansion(record, game_version),
        DataSource::Workshop => {
            record.steam_url = record.published_file_id.as_deref().map(rimworld::workshop_url);
        }
        DataSource::Local => {}
    }
}

fn name_expansion(record: &mut ModRecord, game_version: Option<&str>) {
    if record.invalid {
        if let Some(expansion) = rimworld::expansion_for_folder(&record.folder_name()) {
            debug!("Naming expansion folder {} as {}", record.path.display(), expansion.package_id);
            record.invalid = false;
            record.package_id = expansion.package_id.to_string();
            record.authors = vec!["Ludeon Studios".to_string()];
        }
    }
    let Some(expansion) = rimworld::expansion_for_package(&record.package_id) else {
        return;
    };
    record.app_id = Some(expansion.app_id);
    record.name = expansion.name.to_string();
    record.description = expansion.description.to_string();
    record.steam_url = Some(rimworld::store_url(expansion.app_id));
    if record.supported_versions.is_empty() {
        record.supported_versions = game_version.and_then(major_minor).into_iter().collect();
    }
}

impl MetadataStore {
    fn decorate_batch(&mut self, ids: &BTreeSet<ModId>) {
        let game_version = self.game_version().map(str::to_string);
        for id in ids {
            if let Some(record) = self.get_mut(*id) {
                decorate(record, game_version.as_deref());
            }
        }
    }

    /// Full refresh: scan every source, purge what vanished, rebuild indices
    /// and recompile everything from cleared relation fields.
    pub fn refresh(&mut self, folders: &SourceFolders, ctx: &CompileContext, initial: bool) -> RefreshSummary {
        let mut summary = RefreshSummary {
            game_version: self.game_version().map(str::to_string),
            ..RefreshSummary::default()
        };

        for source in DataSource::ALL {
            let mut source_summary = SourceSummary::default();
            let Some(folder) = folders.folder(source) else {
                source_summary.purged = self.purge_source(source).len();
                summary.sources.insert(source, source_summary);
                continue;
            };
            let directories = match rimworld::list_mod_directories(folder) {
                Ok(directories) => directories,
                Err(err) => {
                    self.events().warn(
                        "Unreadable mod folder",
                        &format!("Could not list {source} mods."),
                        &format!("{err:#}"),
                    );
                    Vec::new()
                }
            };
            let outcome = self.upsert_batch(source, &directories);
            self.decorate_batch(&outcome.ids);
            if !initial {
                source_summary.purged = self.purge_stale(source, &outcome.ids).len();
            }
            source_summary.scanned = directories.len();
            source_summary.created = outcome.created.len();
            source_summary.invalid = outcome.invalid;
            info!(
                "Scanned {} {source} mods from {} ({} new, {} invalid)",
                source_summary.scanned,
                folder.display(),
                source_summary.created,
                source_summary.invalid
            );
            summary.sources.insert(source, source_summary);
        }

        self.rebuild_indices();
        let all: BTreeSet<ModId> = self.ids().collect();
        self.clear_relations(&all);
        compile::compile(self, &all, ctx);

        summary.total = self.len();
        summary.duplicates = self.duplicate_groups().len();
        info!("Refresh finished with {} mods, {} duplicate package ids", summary.total, summary.duplicates);
        summary
    }

    /// Routes a watcher notification to the matching single-item operation.
    pub fn apply_watch_event(&mut self, event: &WatchEvent, ctx: &CompileContext) {
        match event {
            WatchEvent::Created { source, dir } => {
                self.process_creation(*source, dir, ctx);
            }
            WatchEvent::Deleted { source, dir } => match self.id_for_directory(dir) {
                Some(id) => {
                    self.process_deletion(*source, dir, id);
                }
                None => debug!("Ignoring deletion of unknown directory {}", dir.display()),
            },
            // Some watchers report the descriptor file rather than its mod folder.
            WatchEvent::Modified { source, dir } => {
                let known = self
                    .id_for_directory(dir)
                    .or_else(|| self.id_for_descriptor(dir))
                    .and_then(|id| self.get(id).map(|record| (id, record.path.clone())));
                match known {
                    Some((id, mod_dir)) => self.process_update(*source, &mod_dir, id, ctx),
                    None => {
                        warn!("Modified directory {} was not indexed; treating as new", dir.display());
                        self.process_creation(*source, dir, ctx);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::MetadataEvent,
        library::{LoadRule, INVALID_PACKAGE_ID},
        metadata::AboutXmlParser,
    };
    use std::{
        fs,
        path::Path,
        sync::{mpsc, Arc},
    };
    use tempfile::TempDir;

    fn write_mod(root: &Path, folder: &str, package_id: &str, extra: &str) -> PathBuf {
        let dir = root.join(folder);
        fs::create_dir_all(dir.join("About")).expect("mkdir");
        fs::write(
            dir.join("About").join("About.xml"),
            format!(
                "<ModMetaData><packageId>{package_id}</packageId><name>{folder}</name>{extra}</ModMetaData>"
            ),
        )
        .expect("write about");
        dir
    }

    struct Fixture {
        _temp: TempDir,
        folders: SourceFolders,
        game: PathBuf,
        local: PathBuf,
        workshop: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().expect("tempdir");
        let game = temp.path().join("RimWorld");
        let local = game.join("Mods");
        let workshop = temp.path().join("workshop");
        fs::create_dir_all(&local).expect("local");
        fs::create_dir_all(&workshop).expect("workshop");
        fs::write(game.join("Version.txt"), "1.5.4104 rev435").expect("version");
        let data = rimworld::expansions_folder(&game);
        write_mod(&data, "Core", "Ludeon.RimWorld", "");
        // Data folder without a descriptor.
        fs::create_dir_all(data.join("Royalty")).expect("royalty");
        write_mod(
            &local,
            "Harmony",
            "brrainz.harmony",
            "<loadBefore><li>Ludeon.RimWorld</li></loadBefore>",
        );
        write_mod(
            &workshop,
            "2009463077",
            "brrainz.harmony",
            "<loadBefore><li>Ludeon.RimWorld</li></loadBefore>",
        );
        write_mod(
            &workshop,
            "111",
            "some.mod",
            "<modDependencies><li><packageId>brrainz.harmony</packageId></li></modDependencies>",
        );
        Fixture {
            folders: SourceFolders {
                expansions: Some(data),
                local: Some(local.clone()),
                workshop: Some(workshop.clone()),
            },
            _temp: temp,
            game,
            local,
            workshop,
        }
    }

    fn store(events: EventSink) -> MetadataStore {
        MetadataStore::new(Arc::new(AboutXmlParser), 2, events).expect("store")
    }

    fn context() -> CompileContext {
        CompileContext {
            version: Some(VersionMatcher::new("1.5.4104", false).expect("matcher")),
            dependency_for_sorting: true,
            ..CompileContext::default()
        }
    }

    #[test]
    fn full_refresh_builds_compiled_store() {
        let fx = fixture();
        let mut store = store(EventSink::disabled());
        let version = rimworld::read_game_version(&fx.game).expect("version");
        store.set_game_version(Some(version));
        let summary = store.refresh(&fx.folders, &context(), true);

        assert_eq!(summary.total, 5);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.game_version.as_deref(), Some("1.5.4104 rev435"));
        assert_eq!(summary.sources[&DataSource::Expansion].scanned, 2);
        assert_eq!(summary.sources[&DataSource::Workshop].created, 2);

        let core = store.find_by_package("ludeon.rimworld")[0];
        assert_eq!(core.app_id, Some(294100));
        assert_eq!(core.name, "Core (Base game)");
        assert_eq!(core.supported_versions, vec!["1.5"]);
        assert_eq!(core.steam_url.as_deref(), Some("https://store.steampowered.com/app/294100"));

        let royalty = store.find_by_package("ludeon.rimworld.royalty");
        assert_eq!(royalty.len(), 1);
        assert!(!royalty[0].invalid);
        assert_eq!(royalty[0].app_id, Some(1149640));

        let some = store.find_by_package("some.mod")[0];
        assert!(some.dependencies.contains("brrainz.harmony"));
        assert!(some.load_these_before.contains(&LoadRule::explicit("brrainz.harmony")));
        assert_eq!(some.published_file_id.as_deref(), Some("111"));
        assert_eq!(
            some.steam_url.as_deref(),
            Some("https://steamcommunity.com/sharedfiles/filedetails/?id=111")
        );
    }

    #[test]
    fn load_before_declarations_mirror_onto_core() {
        let fx = fixture();
        let mut store = store(EventSink::disabled());
        store.refresh(&fx.folders, &context(), true);
        let core = store.find_by_package("ludeon.rimworld")[0];
        assert!(core.load_these_before.contains(&LoadRule::implied("brrainz.harmony")));
        for harmony in store.find_by_package("brrainz.harmony") {
            assert!(harmony.load_these_after.contains(&LoadRule::explicit("ludeon.rimworld")));
        }
    }

    #[test]
    fn later_refresh_purges_removed_directories_and_keeps_ids() {
        let fx = fixture();
        let mut store = store(EventSink::disabled());
        store.refresh(&fx.folders, &CompileContext::default(), true);
        let some_id = store.id_for_directory(&fx.workshop.join("111")).expect("id");
        let harmony_local = store.id_for_directory(&fx.local.join("Harmony")).expect("id");

        fs::remove_dir_all(fx.local.join("Harmony")).expect("remove");
        let summary = store.refresh(&fx.folders, &CompileContext::default(), false);

        assert_eq!(summary.sources[&DataSource::Local].purged, 1);
        assert!(store.get(harmony_local).is_none());
        assert_eq!(store.id_for_directory(&fx.workshop.join("111")), Some(some_id));
        assert_eq!(summary.duplicates, 0);
    }

    #[test]
    fn unconfigured_source_is_emptied() {
        let fx = fixture();
        let mut store = store(EventSink::disabled());
        store.refresh(&fx.folders, &CompileContext::default(), true);
        let folders = SourceFolders {
            workshop: None,
            ..fx.folders.clone()
        };
        let summary = store.refresh(&folders, &CompileContext::default(), false);
        assert_eq!(summary.sources[&DataSource::Workshop].purged, 2);
        assert!(store.records().all(|record| record.data_source != DataSource::Workshop));
    }

    #[test]
    fn broken_descriptor_becomes_invalid_record() {
        let fx = fixture();
        // No About.xml at all.
        let broken = fx.local.join("Broken");
        fs::create_dir_all(&broken).expect("mkdir");
        let mut store = store(EventSink::disabled());
        store.refresh(&fx.folders, &CompileContext::default(), true);
        let invalid = store.find_by_package(INVALID_PACKAGE_ID);
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].path, broken);
    }

    #[test]
    fn watch_events_route_to_single_item_operations() {
        let fx = fixture();
        let (tx, rx) = mpsc::channel();
        let mut store = store(EventSink::new(tx));
        let ctx = CompileContext::default();
        store.refresh(&fx.folders, &ctx, true);

        let fresh = write_mod(&fx.local, "Fresh", "fresh.mod", "");
        store.apply_watch_event(
            &WatchEvent::Created {
                source: DataSource::Local,
                dir: fresh.clone(),
            },
            &ctx,
        );
        let id = store.id_for_directory(&fresh).expect("created");
        store.apply_watch_event(
            &WatchEvent::Deleted {
                source: DataSource::Local,
                dir: fresh.clone(),
            },
            &ctx,
        );
        assert!(store.get(id).is_none());
        // A second deletion for the same directory is ignored.
        store.apply_watch_event(
            &WatchEvent::Deleted {
                source: DataSource::Local,
                dir: fresh,
            },
            &ctx,
        );
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events, vec![MetadataEvent::ModCreated(id), MetadataEvent::ModDeleted(id)]);
    }

    #[test]
    fn modified_descriptor_path_updates_owning_record() {
        let fx = fixture();
        let (tx, rx) = mpsc::channel();
        let mut store = store(EventSink::new(tx));
        let ctx = CompileContext::default();
        store.refresh(&fx.folders, &ctx, true);
        let dir = fx.local.join("Harmony");
        let id = store.id_for_directory(&dir).expect("indexed");

        let versions = "<supportedVersions><li>1.5</li></supportedVersions>";
        let descriptor = write_mod(&fx.local, "Harmony", "brrainz.harmony", versions)
            .join("About")
            .join("About.xml");
        store.apply_watch_event(
            &WatchEvent::Modified {
                source: DataSource::Local,
                dir: descriptor,
            },
            &ctx,
        );

        let record = store.get(id).expect("record");
        assert_eq!(record.supported_versions, vec!["1.5"]);
        assert_eq!(record.path, dir);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![MetadataEvent::ModUpdated(id)]);
    }

    #[test]
    fn modified_expansion_folder_keeps_its_expansion_identity() {
        let fx = fixture();
        let mut store = store(EventSink::disabled());
        let ctx = context();
        store.set_game_version(Some("1.5.4104 rev435".to_string()));
        store.refresh(&fx.folders, &ctx, true);
        let royalty = rimworld::expansions_folder(&fx.game).join("Royalty");
        let id = store.id_for_directory(&royalty).expect("indexed");

        store.apply_watch_event(
            &WatchEvent::Modified {
                source: DataSource::Expansion,
                dir: royalty,
            },
            &ctx,
        );

        let record = store.get(id).expect("record");
        assert!(!record.invalid);
        assert_eq!(record.package_id, "ludeon.rimworld.royalty");
        assert_eq!(record.app_id, Some(1149640));
        assert_eq!(record.supported_versions, vec!["1.5"]);
        assert_eq!(store.find_by_package("ludeon.rimworld.royalty").len(), 1);
        assert!(store.find_by_package(INVALID_PACKAGE_ID).is_empty());
    }

    #[test]
    fn created_workshop_item_links_its_page() {
        let fx = fixture();
        let mut store = store(EventSink::disabled());
        let ctx = CompileContext::default();
        store.refresh(&fx.folders, &ctx, true);

        let dir = write_mod(&fx.workshop, "222", "other.mod", "");
        store.apply_watch_event(
            &WatchEvent::Created {
                source: DataSource::Workshop,
                dir: dir.clone(),
            },
            &ctx,
        );
        let id = store.id_for_directory(&dir).expect("created");
        assert_eq!(
            store.get(id).and_then(|record| record.steam_url.as_deref()),
            Some("https://steamcommunity.com/sharedfiles/filedetails/?id=222")
        );
    }

    #[test]
    fn context_loading_degrades_to_warnings() {
        let temp = TempDir::new().expect("tempdir");
        let config = AppConfig {
            game_folder: Some(temp.path().join("missing-game")),
            community_rules_path: Some(temp.path().join("nope.json")),
            steam_db_path: Some(temp.path().join("steamDB.json")),
            user_rules_path: Some(temp.path().join("userRules.json")),
            ..AppConfig::default()
        };
        let (tx, rx) = mpsc::channel();
        let (version, ctx) = load_compile_context(&config, &EventSink::new(tx));

        assert!(version.is_none());
        assert!(ctx.version.is_none());
        assert!(ctx.community_rules.is_none());
        assert!(ctx.remote_db.is_none());
        assert!(ctx.user_rules.is_some());
        let titles: Vec<String> = rx
            .try_iter()
            .filter_map(|event| match event {
                MetadataEvent::Warning(warning) => Some(warning.title),
                _ => None,
            })
            .collect();
        assert_eq!(
            titles,
            vec!["Missing game version", "Steam DB unavailable", "Community Rules unavailable"]
        );
    }
}
