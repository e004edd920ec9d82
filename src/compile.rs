use crate::{
    error::MetadataError,
    library::{LoadRule, ModId, ModRecord, VersionedList},
    rules::RuleSet,
    steamdb::RemoteDatabase,
    store::MetadataStore,
};
use regex::Regex;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Decides which `vX.Y` keyed blocks apply to the running game version.
#[derive(Debug, Clone)]
pub struct VersionMatcher {
    major_minor: String,
    regex: Regex,
}

impl VersionMatcher {
    /// Keys are matched as a prefix by default, so `v1.4` also accepts a
    /// `v1.4x` style key. `strict` anchors the match at the end.
    pub fn new(game_version: &str, strict: bool) -> Result<Self, MetadataError> {
        let major_minor = major_minor(game_version).ok_or_else(|| {
            MetadataError::VersionUnavailable(format!(
                "cannot read major.minor from {game_version:?}"
            ))
        })?;
        let anchor = if strict { "$" } else { "" };
        let pattern = format!("^v{}{anchor}", regex::escape(&major_minor));
        let regex = Regex::new(&pattern)
            .map_err(|err| MetadataError::VersionUnavailable(err.to_string()))?;
        Ok(Self { major_minor, regex })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(&key.trim().to_lowercase())
    }

    pub fn major_minor(&self) -> &str {
        &self.major_minor
    }
}

/// `"1.5.4104 rev435"` -> `"1.5"`.
pub fn major_minor(game_version: &str) -> Option<String> {
    let mut parts = game_version.trim().split('.');
    let major: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    if major.is_empty() || minor.is_empty() {
        return None;
    }
    Some(format!("{major}.{minor}"))
}

#[derive(Debug, Clone, Default)]
pub struct CompileContext {
    pub version: Option<VersionMatcher>,
    pub community_rules: Option<RuleSet>,
    pub user_rules: Option<RuleSet>,
    pub remote_db: Option<RemoteDatabase>,
    pub dependency_for_sorting: bool,
}

impl CompileContext {
    /// Unconditional entries, then every version block the matcher accepts.
    /// Without a matcher the version blocks are never looked at.
    pub fn resolve(&self, list: &VersionedList) -> Vec<String> {
        let mut out: Vec<String> = list.all.iter().map(|item| item.trim().to_lowercase()).collect();
        if let Some(matcher) = &self.version {
            for (key, items) in &list.by_version {
                if matcher.matches(key) {
                    out.extend(items.iter().map(|item| item.trim().to_lowercase()));
                }
            }
        }
        out.retain(|item| !item.is_empty());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Order {
    /// The declaring mod loads after the target.
    After,
    /// The declaring mod loads before the target.
    Before,
}

/// Records one declared ordering edge and mirrors it onto every installed
/// copy of `target`. Targets that are not installed are ignored.
fn add_load_rule(store: &mut MetadataStore, id: ModId, target: &str, order: Order) {
    let Some(target_ids) = store.ids_for_package(target).cloned() else {
        return;
    };
    let Some(record) = store.get_mut(id) else {
        return;
    };
    let declaring = record.package_id.clone();
    match order {
        Order::After => record.load_these_before.insert(LoadRule::explicit(target)),
        Order::Before => record.load_these_after.insert(LoadRule::explicit(target)),
    };
    for target_id in target_ids {
        if let Some(target_record) = store.get_mut(target_id) {
            match order {
                Order::After => target_record.load_these_after.insert(LoadRule::implied(&declaring)),
                Order::Before => target_record.load_these_before.insert(LoadRule::implied(&declaring)),
            };
        }
    }
}

fn apply_rule_set(store: &mut MetadataStore, ids: &BTreeSet<ModId>, rules: &RuleSet) {
    for id in ids {
        let Some(package_id) = store.get(*id).map(|record| record.package_id.clone()) else {
            continue;
        };
        let Some(rule) = rules.get(&package_id).cloned() else {
            continue;
        };
        for target in rule.load_before.iter().chain(&rule.load_bottom).chain(&rule.load_top) {
            add_load_rule(store, *id, target, Order::Before);
        }
        for target in rule.load_after.iter().chain(&rule.load_bottom).chain(&rule.load_top) {
            add_load_rule(store, *id, target, Order::After);
        }
    }
}

fn apply_remote_dependencies(store: &mut MetadataStore, ids: &BTreeSet<ModId>, remote: &RemoteDatabase) {
    for id in ids {
        let Some(record) = store.get(*id) else {
            continue;
        };
        let Some(pfid) = record.published_file_id.as_deref() else {
            continue;
        };
        let Some(entry) = remote.get(pfid) else {
            continue;
        };
        if entry.package_id.as_deref() != Some(record.package_id.as_str()) {
            continue;
        }
        let resolved: Vec<String> = entry
            .dependencies
            .iter()
            .filter_map(|dep_pfid| match remote.package_for(dep_pfid) {
                Some(package_id) => Some(package_id.to_string()),
                None => {
                    debug!("No package id for remote dependency {dep_pfid} of {pfid}");
                    None
                }
            })
            .collect();
        if let Some(record) = store.get_mut(*id) {
            record.dependencies.extend(resolved);
        }
    }
}

fn log_totals(store: &MetadataStore, stage: &str) {
    let (mut before, mut after, mut deps, mut incompat) = (0, 0, 0, 0);
    for record in store.records() {
        before += record.load_these_before.len();
        after += record.load_these_after.len();
        deps += record.dependencies.len();
        incompat += record.incompatibilities.len();
    }
    info!(
        "Relations after {stage}: {before} load_these_before, {after} load_these_after, {deps} dependencies, {incompat} incompatibilities"
    );
}

/// Derives relation fields for `ids`. Tuples already present are kept;
/// callers recompiling from scratch clear relation fields first.
pub fn compile(store: &mut MetadataStore, ids: &BTreeSet<ModId>, ctx: &CompileContext) {
    for id in ids {
        let Some(record) = store.get(*id) else {
            continue;
        };
        let raw = record.raw.clone();

        let dependencies = ctx.resolve(&raw.dependencies);
        let incompatibilities: Vec<String> = ctx
            .resolve(&raw.incompatible_with)
            .into_iter()
            .filter(|package_id| store.knows_package(package_id))
            .collect();
        if let Some(record) = store.get_mut(*id) {
            record.dependencies.extend(dependencies.iter().cloned());
            record.incompatibilities.extend(incompatibilities);
        }
        if ctx.dependency_for_sorting {
            for dependency in &dependencies {
                add_load_rule(store, *id, dependency, Order::After);
            }
        }

        for target in ctx
            .resolve(&raw.load_after)
            .into_iter()
            .chain(ctx.resolve(&raw.force_load_after))
        {
            add_load_rule(store, *id, &target, Order::After);
        }
        for target in ctx
            .resolve(&raw.load_before)
            .into_iter()
            .chain(ctx.resolve(&raw.force_load_before))
        {
            add_load_rule(store, *id, &target, Order::Before);
        }
    }
    log_totals(store, "descriptors");

    if let Some(rules) = &ctx.community_rules {
        apply_rule_set(store, ids, rules);
        log_totals(store, "community rules");
    }
    if let Some(rules) = &ctx.user_rules {
        apply_rule_set(store, ids, rules);
        log_totals(store, "user rules");
    }
    if let Some(remote) = &ctx.remote_db {
        apply_remote_dependencies(store, ids, remote);
        log_totals(store, "Steam DB dependencies");
    }
}

/// True unless one of the record's supported versions prefixes the game
/// version. Unknown on either side counts as a mismatch.
pub fn is_version_mismatch(record: &ModRecord, game_version: Option<&str>) -> bool {
    let Some(game_version) = game_version.map(str::trim).filter(|v| !v.is_empty()) else {
        return true;
    };
    !record
        .supported_versions
        .iter()
        .map(|version| version.trim())
        .any(|version| !version.is_empty() && game_version.starts_with(version))
}
