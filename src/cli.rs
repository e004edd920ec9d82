use crate::{
    app::App,
    compile::is_version_mismatch,
    config::base_data_dir,
    dbbuild::{write_database, BuildMode, BuildOutput, BuildReport, DatabaseBuilder},
    dbmerge::{merge_databases, MergePolicy},
    ledger::{import_ledger, purge_ledger_items},
    events::{MetadataEvent, WatchEvent},
    library::{DataSource, ModId, ModRecord},
    logging,
    resolve::{resolve_active_list, ActiveListRequest},
    rimworld::{self, STEAM_APP_ID},
    steamdb::{check_blacklisted, format_timestamp, load_remote_database, Database, RemoteDatabase},
    workshop::SteamWebApi,
};
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GlobalOptions {
    format: OutputFormat,
    config: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
struct CliAction {
    command: CliCommand,
    global: GlobalOptions,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Refresh { remote_times: bool },
    ModsList(ModsListOptions),
    Deps(String),
    Active(ActiveListRequest),
    DbBuild(DbBuildOptions),
    DbMerge {
        existing: PathBuf,
        fresh: PathBuf,
        output: Option<PathBuf>,
    },
    DbBlacklist(Vec<String>),
    LedgerImport {
        source: PathBuf,
        into: Option<PathBuf>,
    },
    LedgerPurge {
        ids: Vec<String>,
        depotcache: Option<PathBuf>,
    },
    Watch(WatchEvent),
    Paths,
    Help,
    Version,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ModsListOptions {
    filter: Option<String>,
    source: Option<DataSource>,
}

#[derive(Debug, PartialEq, Eq)]
struct DbBuildOptions {
    mode: BuildMode,
    output: PathBuf,
    update: bool,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let action = parse_args(&args)?;
    match action.command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("modsmith v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let data_dir = base_data_dir()?;
            if let Err(err) = logging::init(&data_dir) {
                eprintln!("Logging disabled: {err:#}");
            }
            let mut app = App::initialize(action.global.config.as_deref())?;
            let result = run_command(&mut app, command, action.global.format);
            if let Err(err) = &result {
                error!("Command failed: {err:#}");
            }
            result
        }
    }
}

fn parse_args(args: &[String]) -> Result<CliAction> {
    let help = |global: GlobalOptions| CliAction {
        command: CliCommand::Help,
        global,
    };
    let (global, tokens) = parse_global_options(args)?;
    let Some(head) = tokens.first() else {
        return Ok(help(global));
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    let command = match head.as_str() {
        "--help" | "-h" | "help" => CliCommand::Help,
        "--version" | "-V" | "version" => CliCommand::Version,
        "refresh" => CliCommand::Refresh {
            remote_times: rest.iter().any(|arg| arg == "--remote-times"),
        },
        "mods" => CliCommand::ModsList(parse_mods_list(rest)?),
        "deps" => {
            let package_id = rest
                .first()
                .ok_or_else(|| anyhow!("deps requires a package id"))?;
            CliCommand::Deps(package_id.to_lowercase())
        }
        "active" => CliCommand::Active(parse_active(rest)?),
        "db" => parse_db(rest)?,
        "ledger" => parse_ledger(rest)?,
        "event" => CliCommand::Watch(parse_watch_event(rest)?),
        "paths" => CliCommand::Paths,
        other => bail!("Unknown command: {other} (see 'modsmith help')"),
    };
    Ok(CliAction { command, global })
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut format = OutputFormat::Text;
    let mut config = None;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            format = OutputFormat::parse(value).ok_or_else(|| anyhow!("Unknown format: {value}"))?;
            continue;
        }
        if arg == "--format" {
            let value = iter.next().ok_or_else(|| anyhow!("--format requires a value"))?;
            format = OutputFormat::parse(value).ok_or_else(|| anyhow!("Unknown format: {value}"))?;
            continue;
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(value));
            continue;
        }
        if arg == "--config" {
            let value = iter.next().ok_or_else(|| anyhow!("--config requires a path"))?;
            config = Some(PathBuf::from(value));
            continue;
        }
        tokens.push(arg.to_string());
    }
    Ok((GlobalOptions { format, config }, tokens))
}

/// Reads `--flag value` or `--flag=value` at `arg`, advancing `iter`.
fn flag_value<'a>(
    arg: &str,
    flag: &str,
    iter: &mut impl Iterator<Item = &'a String>,
) -> Result<Option<String>> {
    if arg == flag {
        let value = iter.next().ok_or_else(|| anyhow!("{flag} requires a value"))?;
        return Ok(Some(value.to_string()));
    }
    Ok(arg
        .strip_prefix(flag)
        .and_then(|rest| rest.strip_prefix('='))
        .map(str::to_string))
}

fn parse_mods_list(args: &[String]) -> Result<ModsListOptions> {
    let mut options = ModsListOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = flag_value(arg, "--filter", &mut iter)? {
            options.filter = Some(value);
        } else if let Some(value) = flag_value(arg, "--source", &mut iter)? {
            options.source =
                Some(DataSource::parse(&value).ok_or_else(|| anyhow!("Unknown source: {value}"))?);
        } else if arg != "list" {
            bail!("Unknown mods option: {arg}");
        }
    }
    Ok(options)
}

fn parse_active(args: &[String]) -> Result<ActiveListRequest> {
    match args {
        [] => bail!("active requires a ModsConfig.xml path or package ids"),
        [single] if single.to_ascii_lowercase().ends_with(".xml") => {
            Ok(ActiveListRequest::Path(PathBuf::from(single)))
        }
        ids => Ok(ActiveListRequest::PackageIds(ids.to_vec())),
    }
}

fn parse_db(args: &[String]) -> Result<CliCommand> {
    let sub = args.first().map(String::as_str).unwrap_or("");
    let rest = args.get(1..).unwrap_or(&[]);
    match sub {
        "build" => {
            let mut mode = None;
            let mut output = None;
            let mut update = false;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                if let Some(value) = flag_value(arg, "--mode", &mut iter)? {
                    mode = Some(BuildMode::parse(&value).ok_or_else(|| anyhow!("Unknown build mode: {value}"))?);
                } else if let Some(value) = flag_value(arg, "--output", &mut iter)? {
                    output = Some(PathBuf::from(value));
                } else if arg == "--update" {
                    update = true;
                } else {
                    bail!("Unknown db build option: {arg}");
                }
            }
            Ok(CliCommand::DbBuild(DbBuildOptions {
                mode: mode.ok_or_else(|| anyhow!("db build requires --mode enumerate|remote|local"))?,
                output: output.ok_or_else(|| anyhow!("db build requires --output <path>"))?,
                update,
            }))
        }
        "merge" => {
            let mut paths = Vec::new();
            let mut output = None;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                if let Some(value) = flag_value(arg, "--output", &mut iter)? {
                    output = Some(PathBuf::from(value));
                } else {
                    paths.push(PathBuf::from(arg));
                }
            }
            let [existing, fresh] = <[PathBuf; 2]>::try_from(paths)
                .map_err(|_| anyhow!("db merge requires <existing> <fresh>"))?;
            Ok(CliCommand::DbMerge {
                existing,
                fresh,
                output,
            })
        }
        "blacklist" => {
            if rest.is_empty() {
                bail!("db blacklist requires one or more published file ids");
            }
            Ok(CliCommand::DbBlacklist(rest.to_vec()))
        }
        _ => bail!("Unknown db command: {sub} (use 'build', 'merge', or 'blacklist')"),
    }
}

/// `event <created|deleted|modified> <source> <dir>`, as a file watcher
/// script would report it.
fn parse_watch_event(args: &[String]) -> Result<WatchEvent> {
    let [kind, source, dir] = args else {
        bail!("event requires <created|deleted|modified> <source> <dir>");
    };
    let source = DataSource::parse(source).ok_or_else(|| anyhow!("Unknown source: {source}"))?;
    let dir = PathBuf::from(dir);
    match kind.to_ascii_lowercase().as_str() {
        "created" | "create" => Ok(WatchEvent::Created { source, dir }),
        "deleted" | "delete" | "removed" => Ok(WatchEvent::Deleted { source, dir }),
        "modified" | "modify" | "changed" => Ok(WatchEvent::Modified { source, dir }),
        other => bail!("Unknown event kind: {other}"),
    }
}

fn parse_ledger(args: &[String]) -> Result<CliCommand> {
    let sub = args.first().map(String::as_str).unwrap_or("");
    let rest = args.get(1..).unwrap_or(&[]);
    match sub {
        "import" => {
            let mut source = None;
            let mut into = None;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                if let Some(value) = flag_value(arg, "--into", &mut iter)? {
                    into = Some(PathBuf::from(value));
                } else if source.is_none() {
                    source = Some(PathBuf::from(arg));
                } else {
                    bail!("Unexpected argument: {arg}");
                }
            }
            Ok(CliCommand::LedgerImport {
                source: source.ok_or_else(|| anyhow!("ledger import requires a source ledger"))?,
                into,
            })
        }
        "purge" => {
            let mut ids = Vec::new();
            let mut depotcache = None;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                if let Some(value) = flag_value(arg, "--depotcache", &mut iter)? {
                    depotcache = Some(PathBuf::from(value));
                } else {
                    ids.push(arg.to_string());
                }
            }
            if ids.is_empty() {
                bail!("ledger purge requires one or more published file ids");
            }
            Ok(CliCommand::LedgerPurge { ids, depotcache })
        }
        _ => bail!("Unknown ledger command: {sub} (use 'import' or 'purge')"),
    }
}

fn run_command(app: &mut App, command: CliCommand, format: OutputFormat) -> Result<()> {
    match command {
        CliCommand::Refresh { remote_times } => refresh(app, remote_times, format),
        CliCommand::ModsList(options) => {
            app.refresh(true);
            list_mods(app, &options, format)
        }
        CliCommand::Deps(package_id) => {
            app.refresh(true);
            show_dependencies(app, &package_id, format)
        }
        CliCommand::Active(request) => {
            app.refresh(true);
            show_active(app, &request, format)
        }
        CliCommand::DbBuild(options) => build_database(app, &options, format),
        CliCommand::Watch(event) => apply_watch_event(app, &event, format),
        CliCommand::DbMerge {
            existing,
            fresh,
            output,
        } => merge_database_files(app, &existing, &fresh, output.as_deref(), format),
        CliCommand::DbBlacklist(ids) => show_blacklisted(app, &ids, format),
        CliCommand::LedgerImport { source, into } => {
            let target = match into {
                Some(target) => target,
                None => configured_ledger(app)?,
            };
            let summary = import_ledger(&target, &source)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Text => println!(
                    "Imported {} into {}: {} -> {} installed items, {} -> {} details",
                    source.display(),
                    target.display(),
                    summary.installed_before,
                    summary.installed_after,
                    summary.details_before,
                    summary.details_after
                ),
            }
            Ok(())
        }
        CliCommand::LedgerPurge { ids, depotcache } => {
            let ledger = configured_ledger(app)?;
            let depotcache = match depotcache {
                Some(path) => path,
                None => default_depotcache(&ledger)?,
            };
            let summary = purge_ledger_items(&ledger, &depotcache, &ids, STEAM_APP_ID)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Text => {
                    println!("Removed {} item(s) from {}", summary.removed_items.len(), ledger.display());
                    for manifest in &summary.removed_manifests {
                        println!("  deleted {}", manifest.display());
                    }
                }
            }
            Ok(())
        }
        CliCommand::Paths => list_paths(app, format),
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

#[derive(Serialize)]
struct EventItem {
    event: &'static str,
    id: Option<u64>,
    package_id: Option<String>,
    detail: Option<String>,
}

fn apply_watch_event(app: &mut App, event: &WatchEvent, format: OutputFormat) -> Result<()> {
    app.refresh(true);
    print_warnings(app, format);
    app.drain_events();
    app.handle_watch_event(event);

    let store = app.store.read();
    let package_of = |id: ModId| store.get(id).map(|record| record.package_id.clone());
    let items: Vec<EventItem> = app
        .drain_events()
        .into_iter()
        .map(|emitted| match emitted {
            MetadataEvent::ModCreated(id) => EventItem {
                event: "created",
                id: Some(id.0),
                package_id: package_of(id),
                detail: None,
            },
            MetadataEvent::ModUpdated(id) => EventItem {
                event: "updated",
                id: Some(id.0),
                package_id: package_of(id),
                detail: None,
            },
            MetadataEvent::ModDeleted(id) => EventItem {
                event: "deleted",
                id: Some(id.0),
                package_id: None,
                detail: None,
            },
            MetadataEvent::Warning(warning) => EventItem {
                event: "warning",
                id: None,
                package_id: None,
                detail: Some(format!("{}: {}", warning.title, warning.text)),
            },
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
        OutputFormat::Text => {
            if items.is_empty() {
                println!("No change");
            }
            for item in &items {
                let target = item
                    .package_id
                    .as_deref()
                    .or(item.detail.as_deref())
                    .unwrap_or_default();
                match item.id {
                    Some(id) => println!("{:<8} #{id} {target}", item.event),
                    None => println!("{:<8} {target}", item.event),
                }
            }
        }
    }
    Ok(())
}

fn print_warnings(app: &App, format: OutputFormat) {
    if format == OutputFormat::Json {
        return;
    }
    for warning in app.drain_warnings() {
        eprintln!("Warning: {}: {}", warning.title, warning.text);
        if !warning.detail.is_empty() {
            eprintln!("  {}", warning.detail);
        }
    }
}

fn refresh(app: &mut App, remote_times: bool, format: OutputFormat) -> Result<()> {
    let summary = app.refresh(true);
    let remote = if remote_times {
        Some(app.refresh_remote_times()?)
    } else {
        None
    };
    print_warnings(app, format);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => {
            println!(
                "Game version: {}",
                summary.game_version.as_deref().unwrap_or("unknown")
            );
            for (source, counts) in &summary.sources {
                println!(
                    "{:<10} {:>5} scanned {:>5} new {:>5} invalid {:>5} purged",
                    source.as_str(),
                    counts.scanned,
                    counts.created,
                    counts.invalid,
                    counts.purged
                );
            }
            println!("{} mods, {} duplicate package ids", summary.total, summary.duplicates);
            if let Some(count) = remote {
                println!("Updated remote times for {count} Workshop mods");
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ModListItem {
    id: u64,
    package_id: String,
    name: String,
    source: DataSource,
    authors: String,
    path: String,
    published_file_id: Option<String>,
    invalid: bool,
    version_mismatch: bool,
}

fn mod_item(record: &ModRecord, game_version: Option<&str>) -> ModListItem {
    ModListItem {
        id: record.id.0,
        package_id: record.package_id.clone(),
        name: record.name.clone(),
        source: record.data_source,
        authors: record.authors_label(),
        path: record.path.display().to_string(),
        published_file_id: record.published_file_id.clone(),
        invalid: record.invalid,
        version_mismatch: is_version_mismatch(record, game_version),
    }
}

fn list_mods(app: &App, options: &ModsListOptions, format: OutputFormat) -> Result<()> {
    print_warnings(app, format);
    let store = app.store.read();
    let mut items: Vec<ModListItem> = store
        .records()
        .filter(|record| options.source.map_or(true, |source| record.data_source == source))
        .map(|record| mod_item(record, store.game_version()))
        .collect();
    if let Some(filter) = &options.filter {
        let needle = filter.to_lowercase();
        items.retain(|item| {
            item.name.to_lowercase().contains(&needle) || item.package_id.contains(&needle)
        });
    }
    items.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.id.cmp(&b.id)));

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
        OutputFormat::Text => {
            for item in items {
                let flag = if item.invalid {
                    "!"
                } else if item.version_mismatch {
                    "?"
                } else {
                    " "
                };
                println!(
                    "{flag} {id:>5} {source:<10} {package:<40} {name}",
                    id = item.id,
                    source = item.source.as_str(),
                    package = item.package_id,
                    name = item.name
                );
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct RelationItem {
    package_id: String,
    explicit: bool,
}

#[derive(Serialize)]
struct DependencyItem {
    id: u64,
    name: String,
    source: DataSource,
    path: String,
    dependencies: Vec<String>,
    incompatibilities: Vec<String>,
    load_these_before: Vec<RelationItem>,
    load_these_after: Vec<RelationItem>,
    missing: Vec<MissingDependency>,
}

#[derive(Serialize)]
struct MissingDependency {
    package_id: String,
    name: Option<String>,
}

fn show_dependencies(app: &App, package_id: &str, format: OutputFormat) -> Result<()> {
    print_warnings(app, format);
    let store = app.store.read();
    let records = store.find_by_package(package_id);
    if records.is_empty() {
        bail!("No installed mod has package id {package_id}");
    }
    let relation = |rule: &crate::library::LoadRule| RelationItem {
        package_id: rule.package_id.clone(),
        explicit: rule.explicit,
    };
    let items: Vec<DependencyItem> = records
        .into_iter()
        .map(|record| DependencyItem {
            id: record.id.0,
            name: record.name.clone(),
            source: record.data_source,
            path: record.path.display().to_string(),
            dependencies: record.dependencies.iter().cloned().collect(),
            incompatibilities: record.incompatibilities.iter().cloned().collect(),
            load_these_before: record.load_these_before.iter().map(relation).collect(),
            load_these_after: record.load_these_after.iter().map(relation).collect(),
            missing: record
                .dependencies
                .iter()
                .filter(|dependency| !store.knows_package(dependency))
                .map(|dependency| MissingDependency {
                    package_id: dependency.clone(),
                    name: app
                        .context
                        .remote_db
                        .as_ref()
                        .and_then(|db| db.name_for_package(dependency))
                        .map(str::to_string),
                })
                .collect(),
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
        OutputFormat::Text => {
            for item in items {
                println!("{} [{}] {}", item.name, item.source, item.path);
                print_list("depends on", &item.dependencies);
                print_list("incompatible with", &item.incompatibilities);
                for (label, rules) in [
                    ("loads after", &item.load_these_before),
                    ("loads before", &item.load_these_after),
                ] {
                    let rendered: Vec<String> = rules
                        .iter()
                        .map(|rule| {
                            if rule.explicit {
                                rule.package_id.clone()
                            } else {
                                format!("{} (implied)", rule.package_id)
                            }
                        })
                        .collect();
                    print_list(label, &rendered);
                }
                let missing: Vec<String> = item
                    .missing
                    .iter()
                    .map(|dependency| match &dependency.name {
                        Some(name) => format!("{} ({name})", dependency.package_id),
                        None => dependency.package_id.clone(),
                    })
                    .collect();
                print_list("not installed", &missing);
            }
        }
    }
    Ok(())
}

fn print_list(label: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    println!("  {label}:");
    for value in values {
        println!("    {value}");
    }
}

fn show_active(app: &App, request: &ActiveListRequest, format: OutputFormat) -> Result<()> {
    print_warnings(app, format);
    let store = app.store.read();
    let lists = resolve_active_list(&store, request)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&lists)?),
        OutputFormat::Text => {
            println!("Active ({}):", lists.active.len());
            for id in &lists.active {
                if let Some(record) = store.get(*id) {
                    println!("  {:<40} {} [{}]", record.package_id, record.path.display(), record.data_source);
                }
            }
            if !lists.missing.is_empty() {
                println!("Missing ({}):", lists.missing.len());
                for package_id in &lists.missing {
                    println!("  {package_id}");
                }
            }
            if !lists.duplicates.is_empty() {
                println!("Duplicates ({}):", lists.duplicates.len());
                for (package_id, ids) in &lists.duplicates {
                    println!("  {package_id}: {} copies", ids.len());
                }
            }
            println!("Inactive: {}", lists.inactive.len());
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct BuildSummary {
    mode: String,
    cancelled: bool,
    written: Option<String>,
    entries: usize,
    missing_children: Vec<String>,
}

/// Flag raised by Ctrl-C. The builder stops paging once it is set.
fn cancel_on_interrupt() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    match ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    }) {
        Ok(()) => info!("Press Ctrl-C to stop the build; nothing is written on cancel"),
        Err(err) => warn!("Ctrl-C handler unavailable: {err}"),
    }
    cancel
}

/// Writes a finished build to `options.output`. Cancelled builds are
/// reported but never written.
fn persist_build(report: BuildReport, options: &DbBuildOptions, policy: &MergePolicy) -> Result<BuildSummary> {
    let mut summary = BuildSummary {
        mode: format!("{:?}", options.mode),
        cancelled: report.cancelled,
        written: None,
        entries: 0,
        missing_children: report.missing_children,
    };
    if report.cancelled {
        return Ok(summary);
    }
    match &report.output {
        BuildOutput::Catalogue(ids) => {
            summary.entries = ids.len();
            let raw = serde_json::to_string_pretty(ids).context("serialize catalogue")?;
            fs::write(&options.output, raw).context("write catalogue")?;
            summary.written = Some(options.output.display().to_string());
        }
        BuildOutput::Database(database) => {
            summary.entries = database.database.len();
            let written = write_database(&options.output, database, options.update, policy)?;
            summary.written = Some(written.display().to_string());
        }
    }
    Ok(summary)
}

fn build_database(app: &mut App, options: &DbBuildOptions, format: OutputFormat) -> Result<()> {
    let key = app
        .config
        .steam_api_key
        .clone()
        .context("steam_api_key is not configured")?;
    let api = SteamWebApi::new(&key)?;
    let seed: Vec<ModRecord> = if options.mode == BuildMode::FromLocal {
        app.refresh(true);
        app.store.read().records().cloned().collect()
    } else {
        Vec::new()
    };
    print_warnings(app, format);

    let cancel = cancel_on_interrupt();
    let report = DatabaseBuilder::new(&api, STEAM_APP_ID, cancel).build(options.mode, &seed)?;
    let summary = persist_build(report, options, &app.config.db_builder)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => {
            match &summary.written {
                Some(path) => println!("Wrote {} entries to {path}", summary.entries),
                None => println!("Build cancelled; nothing written"),
            }
            if !summary.missing_children.is_empty() {
                println!("{} dependencies are missing from the database:", summary.missing_children.len());
                for pfid in &summary.missing_children {
                    println!("  {pfid}");
                }
            }
        }
    }
    Ok(())
}

fn merge_database_files(
    app: &App,
    existing: &Path,
    fresh: &Path,
    output: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    let existing_db = Database::read(existing)?;
    let fresh_db = Database::read(fresh)?;
    let merged = merge_databases(existing_db, fresh_db, &app.config.db_builder);
    let target = output.unwrap_or(existing);
    let written = write_database(target, &merged, false, &app.config.db_builder)?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "written": written.display().to_string(),
                "version": merged.version,
                "entries": merged.database.len(),
            })
        ),
        OutputFormat::Text => println!(
            "Merged {} into {} ({} entries, version {})",
            fresh.display(),
            written.display(),
            merged.database.len(),
            format_timestamp(merged.version)
        ),
    }
    Ok(())
}

fn show_blacklisted(app: &App, ids: &[String], format: OutputFormat) -> Result<()> {
    let path = app
        .config
        .steam_db_path
        .as_deref()
        .context("steam_db_path is not configured")?;
    let loaded = load_remote_database(path, app.config.database_expiry_secs)?;
    let hits = blacklisted(ids, &loaded.database);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&hits)?),
        OutputFormat::Text => {
            if hits.is_empty() {
                println!("None of the {} id(s) are blacklisted.", ids.len());
            }
            for hit in hits {
                println!("{} {}: {}", hit.published_file_id, hit.name, hit.comment);
            }
        }
    }
    Ok(())
}

fn blacklisted(ids: &[String], database: &RemoteDatabase) -> Vec<crate::steamdb::BlacklistHit> {
    let trimmed: Vec<String> = ids.iter().map(|id| id.trim().to_string()).collect();
    check_blacklisted(&trimmed, database)
}

fn configured_ledger(app: &App) -> Result<PathBuf> {
    app.config
        .steamcmd_ledger_path
        .clone()
        .context("steamcmd_ledger_path is not configured")
}

/// SteamCMD keeps `depotcache/` three levels above
/// `steamapps/workshop/appworkshop_<appid>.acf`.
fn default_depotcache(ledger: &Path) -> Result<PathBuf> {
    ledger
        .ancestors()
        .nth(3)
        .map(|root| root.join("depotcache"))
        .ok_or_else(|| anyhow!("cannot derive depotcache from {}; pass --depotcache", ledger.display()))
}

#[derive(Serialize)]
struct PathsOutput {
    data_dir: Option<String>,
    config_file: Option<String>,
    game_folder: Option<String>,
    local_folder: Option<String>,
    workshop_folder: Option<String>,
    mods_config: Option<String>,
    steam_db: Option<String>,
    community_rules: Option<String>,
    user_rules: Option<String>,
    steamcmd_ledger: Option<String>,
    detected_workshop_ledger: Option<String>,
}

fn list_paths(app: &App, format: OutputFormat) -> Result<()> {
    let show = |path: Option<&Path>| path.map(|path| path.display().to_string());
    let detected = rimworld::detect_paths();
    let output = PathsOutput {
        data_dir: base_data_dir().ok().map(|path| path.display().to_string()),
        config_file: app.config_path().ok().map(|path| path.display().to_string()),
        game_folder: show(app.config.game_folder.as_deref()),
        local_folder: show(app.config.local_folder.as_deref()),
        workshop_folder: show(app.config.workshop_folder.as_deref()),
        mods_config: show(app.config.mods_config_path().as_deref()),
        steam_db: show(app.config.steam_db_path.as_deref()),
        community_rules: show(app.config.community_rules_path.as_deref()),
        user_rules: app.config.user_rules_path().ok().map(|path| path.display().to_string()),
        steamcmd_ledger: show(app.config.steamcmd_ledger_path.as_deref()),
        detected_workshop_ledger: show(detected.workshop_ledger.as_deref()),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Text => {
            let unset = || "(not set)".to_string();
            println!("Data dir: {}", output.data_dir.unwrap_or_else(unset));
            println!("Config: {}", output.config_file.unwrap_or_else(unset));
            println!("Game: {}", output.game_folder.unwrap_or_else(unset));
            println!("Local mods: {}", output.local_folder.unwrap_or_else(unset));
            println!("Workshop mods: {}", output.workshop_folder.unwrap_or_else(unset));
            println!("ModsConfig.xml: {}", output.mods_config.unwrap_or_else(unset));
            println!("Steam DB: {}", output.steam_db.unwrap_or_else(unset));
            println!("Community rules: {}", output.community_rules.unwrap_or_else(unset));
            println!("User rules: {}", output.user_rules.unwrap_or_else(unset));
            println!("SteamCMD ledger: {}", output.steamcmd_ledger.unwrap_or_else(unset));
            if let Some(ledger) = output.detected_workshop_ledger {
                println!("Detected Workshop ledger: {ledger}");
            }
        }
    }
    Ok(())
}

fn print_help() {
    println!("modsmith v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  modsmith refresh [--remote-times]          Scan all mod folders and compile relations");
    println!("  modsmith mods [--filter <text>] [--source <src>]");
    println!("                                             List mods (src: expansion|local|workshop)");
    println!("  modsmith deps <packageId>                  Show relations of a package id");
    println!("  modsmith active <ModsConfig.xml|ids...>    Resolve an active mod list");
    println!("  modsmith db build --mode <m> --output <p> [--update]");
    println!("                                             Build a Steam DB (m: enumerate|remote|local)");
    println!("  modsmith db merge <existing> <fresh> [--output <path>]");
    println!("  modsmith db blacklist <publishedFileId...> Check ids against the Steam DB blacklist");
    println!("  modsmith ledger import <source> [--into <target>]");
    println!("  modsmith ledger purge <id...> [--depotcache <dir>]");
    println!("  modsmith event <kind> <src> <dir>          Apply one watcher event (kind: created|deleted|modified)");
    println!("  modsmith paths                             Show configured and detected paths");
    println!();
    println!("Global options:");
    println!("  --format <json|text>                       Output format");
    println!("  --config <path>                            Use this config file");
    println!("  -h, --help                                 Show help");
    println!("  -V, --version                              Show version");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    fn command(items: &[&str]) -> CliCommand {
        parse_args(&args(items)).expect("parse").command
    }

    #[test]
    fn global_options_are_position_independent() {
        let action = parse_args(&args(&["mods", "--format", "json", "--config=/tmp/c.json"])).expect("parse");
        assert_eq!(action.global.format, OutputFormat::Json);
        assert_eq!(action.global.config, Some(PathBuf::from("/tmp/c.json")));
        assert_eq!(action.command, CliCommand::ModsList(ModsListOptions::default()));
    }

    fn catalogue_report(cancelled: bool) -> BuildReport {
        BuildReport {
            output: BuildOutput::Catalogue(vec!["111".into(), "222".into()]),
            cancelled,
            missing_children: Vec::new(),
        }
    }

    fn build_options(output: PathBuf) -> DbBuildOptions {
        DbBuildOptions {
            mode: BuildMode::Enumerate,
            output,
            update: false,
        }
    }

    #[test]
    fn cancelled_build_writes_nothing() {
        let temp = tempfile::TempDir::new().expect("tempdir");
        let options = build_options(temp.path().join("ids.json"));
        let summary =
            persist_build(catalogue_report(true), &options, &MergePolicy::default()).expect("persist");
        assert!(summary.cancelled);
        assert_eq!(summary.written, None);
        assert!(!options.output.exists());
    }

    #[test]
    fn finished_catalogue_is_written() {
        let temp = tempfile::TempDir::new().expect("tempdir");
        let options = build_options(temp.path().join("ids.json"));
        let summary =
            persist_build(catalogue_report(false), &options, &MergePolicy::default()).expect("persist");
        assert_eq!(summary.entries, 2);
        let raw = fs::read_to_string(&options.output).expect("read");
        let ids: Vec<String> = serde_json::from_str(&raw).expect("json");
        assert_eq!(ids, vec!["111".to_string(), "222".to_string()]);
    }

    #[test]
    fn interrupt_flag_starts_lowered() {
        let first = cancel_on_interrupt();
        let second = cancel_on_interrupt();
        assert!(!first.load(Ordering::Relaxed));
        assert!(!second.load(Ordering::Relaxed));
    }

    #[rstest]
    #[case("created", WatchEvent::Created { source: DataSource::Local, dir: PathBuf::from("/m/a") })]
    #[case("Deleted", WatchEvent::Deleted { source: DataSource::Local, dir: PathBuf::from("/m/a") })]
    #[case("changed", WatchEvent::Modified { source: DataSource::Local, dir: PathBuf::from("/m/a") })]
    fn watch_events_parse(#[case] kind: &str, #[case] expected: WatchEvent) {
        assert_eq!(command(&["event", kind, "local", "/m/a"]), CliCommand::Watch(expected));
    }

    #[test]
    fn watch_event_needs_kind_source_and_dir() {
        assert!(parse_args(&args(&["event", "created", "local"])).is_err());
        assert!(parse_args(&args(&["event", "renamed", "local", "/m/a"])).is_err());
        assert!(parse_args(&args(&["event", "created", "nowhere", "/m/a"])).is_err());
    }

    #[test]
    fn empty_args_show_help() {
        assert_eq!(command(&[]), CliCommand::Help);
        assert_eq!(command(&["-V"]), CliCommand::Version);
    }

    #[test]
    fn mods_options_parse_filter_and_source() {
        assert_eq!(
            command(&["mods", "--filter=harmony", "--source", "workshop"]),
            CliCommand::ModsList(ModsListOptions {
                filter: Some("harmony".into()),
                source: Some(DataSource::Workshop),
            })
        );
        assert!(parse_args(&args(&["mods", "--source", "nowhere"])).is_err());
    }

    #[rstest]
    #[case(&["active", "/cfg/ModsConfig.xml"], ActiveListRequest::Path(PathBuf::from("/cfg/ModsConfig.xml")))]
    #[case(&["active", "a.mod", "b.mod_steam"], ActiveListRequest::PackageIds(vec!["a.mod".into(), "b.mod_steam".into()]))]
    fn active_accepts_file_or_ids(#[case] input: &[&str], #[case] expected: ActiveListRequest) {
        assert_eq!(command(input), CliCommand::Active(expected));
    }

    #[test]
    fn db_build_requires_mode_and_output() {
        assert_eq!(
            command(&["db", "build", "--mode", "local", "--output", "/db/steamDB.json", "--update"]),
            CliCommand::DbBuild(DbBuildOptions {
                mode: BuildMode::FromLocal,
                output: PathBuf::from("/db/steamDB.json"),
                update: true,
            })
        );
        assert!(parse_args(&args(&["db", "build", "--output", "/db/x.json"])).is_err());
        assert!(parse_args(&args(&["db", "build", "--mode", "sideways", "--output", "x"])).is_err());
    }

    #[test]
    fn db_merge_takes_two_paths() {
        assert_eq!(
            command(&["db", "merge", "old.json", "new.json", "--output", "out.json"]),
            CliCommand::DbMerge {
                existing: PathBuf::from("old.json"),
                fresh: PathBuf::from("new.json"),
                output: Some(PathBuf::from("out.json")),
            }
        );
        assert!(parse_args(&args(&["db", "merge", "only.json"])).is_err());
    }

    #[test]
    fn ledger_commands_parse() {
        assert_eq!(
            command(&["ledger", "purge", "111", "222", "--depotcache", "/steam/depotcache"]),
            CliCommand::LedgerPurge {
                ids: vec!["111".into(), "222".into()],
                depotcache: Some(PathBuf::from("/steam/depotcache")),
            }
        );
        assert_eq!(
            command(&["ledger", "import", "/other/appworkshop_294100.acf"]),
            CliCommand::LedgerImport {
                source: PathBuf::from("/other/appworkshop_294100.acf"),
                into: None,
            }
        );
    }

    #[test]
    fn unknown_commands_are_errors() {
        assert!(parse_args(&args(&["explode"])).is_err());
        assert!(parse_args(&args(&["--format", "yaml", "mods"])).is_err());
    }

    #[test]
    fn depotcache_sits_beside_steamapps() {
        let ledger = Path::new("/opt/steamcmd/steamapps/workshop/appworkshop_294100.acf");
        assert_eq!(
            default_depotcache(ledger).expect("derive"),
            PathBuf::from("/opt/steamcmd/depotcache")
        );
    }
}
