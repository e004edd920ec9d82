use crate::{
    dbmerge::{merge_databases, MergePolicy},
    error::MetadataError,
    library::ModRecord,
    rimworld::{self, EXPANSIONS},
    steamdb::Database,
    workshop::{PublishedFileDetails, WorkshopApi, DETAILS_BATCH_LIMIT},
};
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const UNPUBLISHED_NAME: &str = "Missing mod: deleted/private/removed/unposted";
const UNAVAILABLE_NAME: &str = "Steam metadata unavailable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// List every published file id of the catalogue.
    Enumerate,
    /// Full detail fetch for the whole catalogue.
    FromRemote,
    /// Detail fetch seeded from installed mods.
    FromLocal,
}

impl BuildMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "enumerate" | "ids" => Some(BuildMode::Enumerate),
            "remote" | "fromremote" | "all" => Some(BuildMode::FromRemote),
            "local" | "fromlocal" => Some(BuildMode::FromLocal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutput {
    Catalogue(Vec<String>),
    Database(Database),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    pub output: BuildOutput,
    pub cancelled: bool,
    pub missing_children: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetailPass {
    /// Name, url and an empty dependency map per item.
    Initial,
    /// Child items resolved against what is already in the database.
    Dependencies,
}

pub struct DatabaseBuilder<'a, A: WorkshopApi + ?Sized> {
    api: &'a A,
    app_id: u32,
    cancel: Arc<AtomicBool>,
}

impl<'a, A: WorkshopApi + ?Sized> DatabaseBuilder<'a, A> {
    pub fn new(api: &'a A, app_id: u32, cancel: Arc<AtomicBool>) -> Self {
        Self { api, app_id, cancel }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn build(&self, mode: BuildMode, seed: &[ModRecord]) -> Result<BuildReport, MetadataError> {
        match mode {
            BuildMode::Enumerate => {
                let (ids, cancelled) = self.enumerate_catalogue()?;
                Ok(BuildReport {
                    output: BuildOutput::Catalogue(ids),
                    cancelled,
                    missing_children: Vec::new(),
                })
            }
            BuildMode::FromRemote => self.from_remote(),
            BuildMode::FromLocal => self.from_local(seed),
        }
    }

    /// Walks QueryFiles cursors. Stops at the expected page count, on an
    /// empty page or on a cursor that no longer moves.
    pub fn enumerate_catalogue(&self) -> Result<(Vec<String>, bool), MetadataError> {
        let mut ids = Vec::new();
        let mut cursor = "*".to_string();
        let mut page_number: u64 = 1;
        let mut pages: u64 = 1;
        let mut total: u64 = 0;

        while page_number <= pages {
            if self.cancelled() {
                info!("Catalogue enumeration cancelled after {} ids", ids.len());
                return Ok((ids, true));
            }
            let page = self.api.query_files(self.app_id, &cursor)?;
            if page.ids.is_empty() {
                break;
            }
            if total == 0 && page.total > 0 {
                total = page.total;
                pages = total.div_ceil(page.ids.len() as u64);
                debug!("Catalogue holds {total} items over {pages} pages");
            }
            ids.extend(page.ids);
            page_number += 1;
            if page.next_cursor.is_empty() || page.next_cursor == cursor {
                break;
            }
            cursor = page.next_cursor;
        }
        ids.sort();
        ids.dedup();
        info!("Enumerated {} published files for app {}", ids.len(), self.app_id);
        Ok((ids, false))
    }

    fn from_remote(&self) -> Result<BuildReport, MetadataError> {
        let (ids, cancelled) = self.enumerate_catalogue()?;
        if cancelled {
            return Ok(self.partial(Map::new(), Vec::new()));
        }
        if ids.is_empty() {
            return Err(MetadataError::RemoteFetch("catalogue returned no ids".to_string()));
        }
        let mut database = seed_expansions();
        for id in &ids {
            database.insert(id.clone(), json!({ "url": rimworld::workshop_url(id) }));
        }
        if self.populate(&mut database, &ids, DetailPass::Initial)?.1 {
            return Ok(self.partial(database, Vec::new()));
        }
        let (missing, cancelled) = self.populate(&mut database, &ids, DetailPass::Dependencies)?;
        if cancelled {
            return Ok(self.partial(database, missing));
        }
        Ok(self.finish(database, missing))
    }

    fn from_local(&self, seed: &[ModRecord]) -> Result<BuildReport, MetadataError> {
        if seed.is_empty() {
            return Err(MetadataError::configuration(
                "Steam DB builder",
                "no local mod metadata to seed the query",
            ));
        }
        let mut database = Map::new();
        let mut ids = Vec::new();
        for record in seed {
            if let Some(app_id) = record.app_id {
                database.insert(
                    app_id.to_string(),
                    json!({
                        "appid": true,
                        "url": rimworld::store_url(app_id),
                        "packageId": record.package_id,
                        "name": record.name,
                    }),
                );
            } else if let Some(pfid) = &record.published_file_id {
                database.insert(
                    pfid.clone(),
                    json!({
                        "url": rimworld::workshop_url(pfid),
                        "packageId": record.package_id,
                        "name": record.name,
                        "authors": record.authors_label(),
                        "gameVersions": record.supported_versions,
                    }),
                );
                ids.push(pfid.clone());
            }
        }
        ids.sort();
        ids.dedup();

        let (mut missing, cancelled) = self.populate(&mut database, &ids, DetailPass::Dependencies)?;
        if cancelled {
            return Ok(self.partial(database, missing));
        }
        if !missing.is_empty() {
            info!("Querying {} dependencies missing from local metadata", missing.len());
            let (still_missing, cancelled) =
                self.populate(&mut database, &missing, DetailPass::Dependencies)?;
            if cancelled {
                return Ok(self.partial(database, still_missing));
            }
            missing = still_missing;
        }
        Ok(self.finish(database, missing))
    }

    fn partial(&self, database: Map<String, Value>, missing_children: Vec<String>) -> BuildReport {
        BuildReport {
            output: BuildOutput::Database(Database {
                version: OffsetDateTime::now_utc().unix_timestamp(),
                database,
            }),
            cancelled: true,
            missing_children,
        }
    }

    fn finish(&self, database: Map<String, Value>, missing_children: Vec<String>) -> BuildReport {
        info!(
            "Built Steam DB with {} entries ({} dependencies unresolved)",
            database.len(),
            missing_children.len()
        );
        BuildReport {
            output: BuildOutput::Database(Database {
                version: OffsetDateTime::now_utc().unix_timestamp(),
                database,
            }),
            cancelled: false,
            missing_children,
        }
    }

    /// Returns child ids referenced but not present in the database, and
    /// whether the pass was cancelled.
    fn populate(
        &self,
        database: &mut Map<String, Value>,
        ids: &[String],
        pass: DetailPass,
    ) -> Result<(Vec<String>, bool), MetadataError> {
        let mut missing = Vec::new();
        for chunk in ids.chunks(DETAILS_BATCH_LIMIT) {
            if self.cancelled() {
                return Ok((missing, true));
            }
            for details in self.api.get_details(self.app_id, chunk)? {
                match pass {
                    DetailPass::Initial => apply_initial(database, &details),
                    DetailPass::Dependencies => apply_dependencies(database, &details, &mut missing),
                }
            }
        }
        Ok((missing, false))
    }
}

fn seed_expansions() -> Map<String, Value> {
    EXPANSIONS
        .iter()
        .map(|expansion| {
            (
                expansion.app_id.to_string(),
                json!({
                    "appid": true,
                    "url": rimworld::store_url(expansion.app_id),
                    "packageId": expansion.package_id,
                    "name": expansion.name,
                }),
            )
        })
        .collect()
}

fn entry_object<'m>(database: &'m mut Map<String, Value>, id: &str) -> Option<&'m mut Map<String, Value>> {
    let value = database
        .entry(id.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut()
}

fn mark_unpublished(entry: &mut Map<String, Value>) {
    entry.insert("steamName".to_string(), json!(UNPUBLISHED_NAME));
    entry.insert("unpublished".to_string(), json!(true));
}

fn apply_initial(database: &mut Map<String, Value>, details: &PublishedFileDetails) {
    let Some(entry) = entry_object(database, &details.publishedfileid) else {
        return;
    };
    if !details.is_available() {
        mark_unpublished(entry);
        return;
    }
    entry.insert("url".to_string(), json!(rimworld::workshop_url(&details.publishedfileid)));
    entry.insert("steamName".to_string(), json!(details.title));
    entry.insert("dependencies".to_string(), json!({}));
}

fn apply_dependencies(database: &mut Map<String, Value>, details: &PublishedFileDetails, missing: &mut Vec<String>) {
    let pfid = &details.publishedfileid;
    if !database.contains_key(pfid) {
        database.insert(
            pfid.clone(),
            json!({
                "url": rimworld::workshop_url(pfid),
                "steamName": UNAVAILABLE_NAME,
                "missing": true,
            }),
        );
        if !details.is_available() {
            if let Some(entry) = entry_object(database, pfid) {
                mark_unpublished(entry);
            }
        }
        return;
    }
    if !details.is_available() {
        if let Some(entry) = entry_object(database, pfid) {
            mark_unpublished(entry);
        }
        return;
    }
    if database[pfid].get("unpublished").and_then(Value::as_bool).unwrap_or(false) {
        return;
    }

    let mut dependencies = Map::new();
    for child in &details.children {
        let child_id = &child.publishedfileid;
        match database.get(child_id) {
            Some(child_entry) => {
                let name = child_entry
                    .get("name")
                    .or_else(|| child_entry.get("steamName"))
                    .and_then(Value::as_str)
                    .unwrap_or(child_id);
                let url = child_entry
                    .get("url")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| rimworld::workshop_url(child_id));
                dependencies.insert(child_id.clone(), json!([name, url]));
            }
            None => {
                if !missing.contains(child_id) {
                    missing.push(child_id.clone());
                }
            }
        }
    }
    if let Some(entry) = entry_object(database, pfid) {
        entry.insert("steamName".to_string(), json!(details.title));
        entry.insert("dependencies".to_string(), Value::Object(dependencies));
    }
}

/// Persists a build. With `update`, an existing file absorbs the fresh
/// data through the merge policy; a missing one is written as `NEW_<name>`.
pub fn write_database(path: &Path, fresh: &Database, update: bool, policy: &MergePolicy) -> Result<PathBuf> {
    let (target, database) = if update && path.exists() {
        let existing = Database::read(path).context("read existing Steam DB")?;
        (path.to_path_buf(), merge_databases(existing, fresh.clone(), policy))
    } else if update {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "steamDB.json".to_string());
        let target = path.with_file_name(format!("NEW_{name}"));
        warn!(
            "{} does not exist; writing fresh database to {}",
            path.display(),
            target.display()
        );
        (target, fresh.clone())
    } else {
        (path.to_path_buf(), fresh.clone())
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).context("create database dir")?;
    }
    let raw = serde_json::to_string_pretty(&database).context("serialize Steam DB")?;
    let tmp = target.with_extension("json.tmp");
    fs::write(&tmp, raw).context("write Steam DB")?;
    fs::rename(&tmp, &target).context("move Steam DB into place")?;
    info!("Wrote {} entries to {}", database.database.len(), target.display());
    Ok(target)
}
