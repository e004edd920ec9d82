use crate::{
    compile::{self, CompileContext},
    error::MetadataError,
    events::{EventSink, MetadataEvent},
    library::{DataSource, ModId, ModRecord},
    metadata::DescriptorParser,
    refresh,
};
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Every id touched by the batch, new or reused.
    pub ids: BTreeSet<ModId>,
    pub created: BTreeSet<ModId>,
    pub invalid: usize,
}

/// In-memory table of mod records plus the lookup indices built over it.
pub struct MetadataStore {
    records: BTreeMap<ModId, ModRecord>,
    package_index: HashMap<String, BTreeSet<ModId>>,
    dir_index: HashMap<PathBuf, ModId>,
    descriptor_index: HashMap<PathBuf, ModId>,
    next_id: u64,
    parser: Arc<dyn DescriptorParser>,
    pool: rayon::ThreadPool,
    events: EventSink,
    game_version: Option<String>,
}

impl MetadataStore {
    pub fn new(parser: Arc<dyn DescriptorParser>, threads: usize, events: EventSink) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|index| format!("modsmith-parse-{index}"))
            .build()
            .context("build parse pool")?;
        Ok(Self {
            records: BTreeMap::new(),
            package_index: HashMap::new(),
            dir_index: HashMap::new(),
            descriptor_index: HashMap::new(),
            next_id: 1,
            parser,
            pool,
            events,
            game_version: None,
        })
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn game_version(&self) -> Option<&str> {
        self.game_version.as_deref()
    }

    pub fn set_game_version(&mut self, version: Option<String>) {
        self.game_version = version;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: ModId) -> Option<&ModRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ModId) -> Option<&mut ModRecord> {
        self.records.get_mut(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ModRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = ModId> + '_ {
        self.records.keys().copied()
    }

    pub fn ids_for_package(&self, package_id: &str) -> Option<&BTreeSet<ModId>> {
        self.package_index.get(package_id)
    }

    pub fn knows_package(&self, package_id: &str) -> bool {
        self.package_index.contains_key(package_id)
    }

    pub fn id_for_directory(&self, dir: &Path) -> Option<ModId> {
        self.dir_index.get(dir).copied()
    }

    pub fn id_for_descriptor(&self, descriptor: &Path) -> Option<ModId> {
        self.descriptor_index.get(descriptor).copied()
    }

    pub fn find_by_package(&self, package_id: &str) -> Vec<&ModRecord> {
        self.ids_for_package(&package_id.to_lowercase())
            .map(|ids| ids.iter().filter_map(|id| self.records.get(id)).collect())
            .unwrap_or_default()
    }

    /// Package ids present in more than one directory.
    pub fn duplicate_groups(&self) -> BTreeMap<String, Vec<ModId>> {
        self.package_index
            .iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(package_id, ids)| (package_id.clone(), ids.iter().copied().collect()))
            .collect()
    }

    fn mint_id(&mut self) -> ModId {
        let id = ModId(self.next_id);
        self.next_id += 1;
        id
    }

    fn build_record(parser: &dyn DescriptorParser, id: ModId, source: DataSource, dir: &Path) -> ModRecord {
        let descriptor_path = parser.descriptor_path(dir);
        let mut record = match parser.parse(dir) {
            Ok(descriptor) => {
                ModRecord::from_descriptor(id, source, dir.to_path_buf(), descriptor_path, descriptor)
            }
            Err(err) => {
                warn!("Invalid mod at {}: {err}", dir.display());
                ModRecord::invalid(id, source, dir.to_path_buf(), descriptor_path, &err)
            }
        };
        // Workshop folders are named after their published file id.
        if source == DataSource::Workshop && record.published_file_id.is_none() {
            let folder = record.folder_name();
            if !folder.is_empty() && folder.chars().all(|c| c.is_ascii_digit()) {
                record.published_file_id = Some(folder);
            }
        }
        record
    }

    /// Parses `directories` on the worker pool and inserts every result.
    /// Returns only after all workers finished. Indices are left stale
    /// until `rebuild_indices`.
    pub fn upsert_batch(&mut self, source: DataSource, directories: &[PathBuf]) -> BatchOutcome {
        let mut assignments = Vec::with_capacity(directories.len());
        let mut outcome = BatchOutcome::default();
        let mut seen = HashSet::with_capacity(directories.len());
        for dir in directories {
            if !seen.insert(dir) {
                continue;
            }
            let id = match self.dir_index.get(dir) {
                Some(id) => *id,
                None => {
                    let id = self.mint_id();
                    outcome.created.insert(id);
                    id
                }
            };
            assignments.push((id, dir.clone()));
        }

        let parser = Arc::clone(&self.parser);
        let parsed: Vec<ModRecord> = self.pool.install(|| {
            assignments
                .par_iter()
                .map(|(id, dir)| Self::build_record(parser.as_ref(), *id, source, dir))
                .collect()
        });

        for mut record in parsed {
            if let Some(previous) = self.records.get(&record.id) {
                record.remote_time_created = previous.remote_time_created;
                record.remote_time_updated = previous.remote_time_updated;
            }
            if record.invalid {
                outcome.invalid += 1;
            }
            outcome.ids.insert(record.id);
            self.records.insert(record.id, record);
        }
        debug!(
            "Upserted {} {source} mods ({} new, {} invalid)",
            outcome.ids.len(),
            outcome.created.len(),
            outcome.invalid
        );
        outcome
    }

    /// Drops records of `source` whose id is not in `keep`.
    pub fn purge_stale(&mut self, source: DataSource, keep: &BTreeSet<ModId>) -> Vec<ModId> {
        let stale: Vec<ModId> = self
            .records
            .values()
            .filter(|record| record.data_source == source && !keep.contains(&record.id))
            .map(|record| record.id)
            .collect();
        for id in &stale {
            if let Ok(record) = self.remove(*id) {
                debug!("Purged stale {source} mod {} at {}", record.package_id, record.path.display());
            }
        }
        stale
    }

    pub fn purge_source(&mut self, source: DataSource) -> Vec<ModId> {
        self.purge_stale(source, &BTreeSet::new())
    }

    pub fn rebuild_indices(&mut self) {
        self.package_index.clear();
        self.dir_index.clear();
        self.descriptor_index.clear();
        for record in self.records.values() {
            self.package_index
                .entry(record.package_id.clone())
                .or_default()
                .insert(record.id);
            self.dir_index.insert(record.path.clone(), record.id);
            self.descriptor_index
                .insert(record.descriptor_path.clone(), record.id);
        }
    }

    fn unindex(&mut self, record: &ModRecord) {
        if let Some(ids) = self.package_index.get_mut(&record.package_id) {
            ids.remove(&record.id);
            if ids.is_empty() {
                self.package_index.remove(&record.package_id);
            }
        }
        if self.dir_index.get(&record.path) == Some(&record.id) {
            self.dir_index.remove(&record.path);
        }
        if self.descriptor_index.get(&record.descriptor_path) == Some(&record.id) {
            self.descriptor_index.remove(&record.descriptor_path);
        }
    }

    fn insert_indexed(&mut self, record: ModRecord) {
        if let Some(previous) = self.records.remove(&record.id) {
            self.unindex(&previous);
        }
        self.package_index
            .entry(record.package_id.clone())
            .or_default()
            .insert(record.id);
        self.dir_index.insert(record.path.clone(), record.id);
        self.descriptor_index
            .insert(record.descriptor_path.clone(), record.id);
        self.records.insert(record.id, record);
    }

    pub fn remove(&mut self, id: ModId) -> Result<ModRecord, MetadataError> {
        let record = self
            .records
            .remove(&id)
            .ok_or(MetadataError::RaceCondition(id))?;
        self.unindex(&record);
        Ok(record)
    }

    pub fn clear_relations(&mut self, ids: &BTreeSet<ModId>) {
        for id in ids {
            if let Some(record) = self.records.get_mut(id) {
                record.clear_relations();
            }
        }
    }

    /// A mod directory appeared.
    pub fn process_creation(&mut self, source: DataSource, dir: &Path, ctx: &CompileContext) -> ModId {
        let (id, existed) = match self.dir_index.get(dir) {
            Some(id) => (*id, self.records.contains_key(id)),
            None => (self.mint_id(), false),
        };
        let mut record = Self::build_record(self.parser.as_ref(), id, source, dir);
        refresh::decorate(&mut record, self.game_version());
        if let Some(previous) = self.records.get(&id) {
            record.inherit_implied(previous);
        }
        self.insert_indexed(record);
        compile::compile(self, &BTreeSet::from([id]), ctx);
        if existed {
            self.events.emit(MetadataEvent::ModUpdated(id));
        }
        self.events.emit(MetadataEvent::ModCreated(id));
        id
    }

    /// A mod directory disappeared. Unknown ids are a benign race with a
    /// concurrent refresh.
    pub fn process_deletion(&mut self, source: DataSource, dir: &Path, id: ModId) -> bool {
        match self.remove(id) {
            Ok(record) => {
                debug!("Removed {source} mod {} at {}", record.package_id, dir.display());
                self.events.emit(MetadataEvent::ModDeleted(id));
                true
            }
            Err(err) => {
                debug!("Skipping deletion of {}: {err}", dir.display());
                false
            }
        }
    }

    /// A mod's descriptor changed. Its raw fields are replaced and its own
    /// declarations recompiled; edges other mods pushed onto it survive.
    pub fn process_update(&mut self, source: DataSource, dir: &Path, id: ModId, ctx: &CompileContext) {
        let mut record = Self::build_record(self.parser.as_ref(), id, source, dir);
        refresh::decorate(&mut record, self.game_version());
        let existed = match self.records.get(&id) {
            Some(previous) => {
                record.inherit_implied(previous);
                record.remote_time_created = previous.remote_time_created;
                record.remote_time_updated = previous.remote_time_updated;
                true
            }
            None => false,
        };
        self.insert_indexed(record);
        if existed {
            compile::compile(self, &BTreeSet::from([id]), ctx);
            self.events.emit(MetadataEvent::ModUpdated(id));
        }
    }
}

/// Store handle shared between the refresh driver and readers.
#[derive(Clone)]
pub struct SharedStore(Arc<RwLock<MetadataStore>>);

impl SharedStore {
    pub fn new(store: MetadataStore) -> Self {
        Self(Arc::new(RwLock::new(store)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, MetadataStore> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, MetadataStore> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        library::{LoadRule, RawDescriptor, VersionedList, INVALID_PACKAGE_ID},
        testing::{store_with, FakeParser},
    };
    use std::sync::mpsc;

    fn dirs(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|name| PathBuf::from(format!("/mods/{name}"))).collect()
    }

    #[test]
    fn batch_reuses_ids_for_known_directories() {
        let parser = FakeParser::new()
            .with("/mods/a", RawDescriptor::new("a.one"))
            .with("/mods/b", RawDescriptor::new("b.two"));
        let mut store = store_with(parser);

        let first = store.upsert_batch(DataSource::Local, &dirs(&["a", "b"]));
        assert_eq!(first.created.len(), 2);
        store.rebuild_indices();

        let second = store.upsert_batch(DataSource::Local, &dirs(&["a", "b"]));
        assert!(second.created.is_empty());
        assert_eq!(first.ids, second.ids);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn repeated_directory_in_one_batch_gets_one_id() {
        let parser = FakeParser::new().with("/mods/a", RawDescriptor::new("a.one"));
        let mut store = store_with(parser);
        let outcome = store.upsert_batch(DataSource::Local, &dirs(&["a", "a"]));
        store.rebuild_indices();

        assert_eq!(outcome.created.len(), 1);
        assert_eq!(outcome.ids.len(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.find_by_package("a.one").len(), 1);
    }

    #[test]
    fn parse_failures_become_invalid_records() {
        let parser = FakeParser::new().with("/mods/a", RawDescriptor::new("a.one"));
        let mut store = store_with(parser);
        let outcome = store.upsert_batch(DataSource::Local, &dirs(&["a", "broken"]));
        store.rebuild_indices();

        assert_eq!(outcome.invalid, 1);
        let broken = store.find_by_package(INVALID_PACKAGE_ID);
        assert_eq!(broken.len(), 1);
        assert!(broken[0].invalid);
        assert_eq!(broken[0].path, PathBuf::from("/mods/broken"));
    }

    #[test]
    fn workshop_records_take_folder_name_as_published_id() {
        let parser = FakeParser::new().with("/mods/2009463077", RawDescriptor::new("brrainz.harmony"));
        let mut store = store_with(parser);
        store.upsert_batch(DataSource::Workshop, &dirs(&["2009463077"]));
        store.rebuild_indices();
        let record = store.find_by_package("brrainz.harmony")[0];
        assert_eq!(record.published_file_id.as_deref(), Some("2009463077"));
    }

    #[test]
    fn purge_stale_only_touches_one_source() {
        let parser = FakeParser::new()
            .with("/mods/a", RawDescriptor::new("a.one"))
            .with("/mods/b", RawDescriptor::new("b.two"))
            .with("/mods/c", RawDescriptor::new("c.three"));
        let mut store = store_with(parser);
        let local = store.upsert_batch(DataSource::Local, &dirs(&["a", "b"]));
        store.upsert_batch(DataSource::Workshop, &dirs(&["c"]));
        store.rebuild_indices();

        let keep: BTreeSet<ModId> = local.ids.iter().take(1).copied().collect();
        let removed = store.purge_stale(DataSource::Local, &keep);
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len(), 2);
        assert!(store.knows_package("c.three"));
        assert!(!store.knows_package("b.two"));
        assert_eq!(store.id_for_directory(Path::new("/mods/b")), None);
    }

    #[test]
    fn duplicate_groups_list_shared_package_ids() {
        let parser = FakeParser::new()
            .with("/mods/a", RawDescriptor::new("same.mod"))
            .with("/mods/b", RawDescriptor::new("Same.Mod"))
            .with("/mods/c", RawDescriptor::new("other.mod"));
        let mut store = store_with(parser);
        store.upsert_batch(DataSource::Local, &dirs(&["a", "b", "c"]));
        store.rebuild_indices();

        let groups = store.duplicate_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["same.mod"].len(), 2);
    }

    #[test]
    fn deletion_of_unknown_id_is_a_noop() {
        let (tx, rx) = mpsc::channel();
        let mut store = crate::testing::store_with_events(FakeParser::new(), EventSink::new(tx));
        assert!(!store.process_deletion(DataSource::Local, Path::new("/mods/x"), ModId(42)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn creation_and_deletion_emit_events_and_keep_indices() {
        let (tx, rx) = mpsc::channel();
        let parser = FakeParser::new().with("/mods/a", RawDescriptor::new("a.one"));
        let mut store = crate::testing::store_with_events(parser, EventSink::new(tx));
        let ctx = CompileContext::default();

        let id = store.process_creation(DataSource::Local, Path::new("/mods/a"), &ctx);
        assert_eq!(store.id_for_directory(Path::new("/mods/a")), Some(id));
        assert!(store.knows_package("a.one"));

        assert!(store.process_deletion(DataSource::Local, Path::new("/mods/a"), id));
        assert!(!store.knows_package("a.one"));
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![MetadataEvent::ModCreated(id), MetadataEvent::ModDeleted(id)]
        );
    }

    #[test]
    fn update_recompiles_own_declarations_and_keeps_foreign_edges() {
        let mut b = RawDescriptor::new("b.two");
        b.relations.load_after = VersionedList::plain(["a.one"]);
        let mut c = RawDescriptor::new("c.three");
        c.relations.load_before = VersionedList::plain(["a.one"]);
        let parser = FakeParser::new()
            .with("/mods/a", RawDescriptor::new("a.one"))
            .with("/mods/b", b)
            .with("/mods/c", c);
        let mut store = store_with(parser.clone());
        let ctx = CompileContext::default();
        let outcome = store.upsert_batch(DataSource::Local, &dirs(&["a", "b", "c"]));
        store.rebuild_indices();
        compile::compile(&mut store, &outcome.ids, &ctx);

        let a_id = store.id_for_directory(Path::new("/mods/a")).expect("a");
        let b_id = store.id_for_directory(Path::new("/mods/b")).expect("b");

        // b drops its loadAfter declaration.
        parser.set("/mods/b", RawDescriptor::new("b.two"));
        store.process_update(DataSource::Local, Path::new("/mods/b"), b_id, &ctx);
        let b_record = store.get(b_id).expect("b record");
        assert!(b_record.load_these_before.is_empty());

        // a still carries both implied edges; removal is not propagated.
        let a_record = store.get(a_id).expect("a record");
        assert!(a_record.load_these_after.contains(&LoadRule::implied("b.two")));
        assert!(a_record.load_these_before.contains(&LoadRule::implied("c.three")));
    }

    #[test]
    fn shared_store_survives_poisoned_lock() {
        let shared = SharedStore::new(store_with(FakeParser::new()));
        let clone = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.write();
            panic!("poison");
        })
        .join();
        assert!(shared.read().is_empty());
    }
}
