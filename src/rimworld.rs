use crate::{error::MetadataError, ledger};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

pub const GAME_NAME: &str = "RimWorld";
pub const STEAM_APP_ID: u32 = 294100;
pub const BASE_GAME_PACKAGE_ID: &str = "ludeon.rimworld";
const VERSION_FILE: &str = "Version.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expansion {
    pub app_id: u32,
    pub package_id: &'static str,
    pub folder: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

pub const EXPANSIONS: &[Expansion] = &[
    Expansion {
        app_id: 294100,
        package_id: "ludeon.rimworld",
        folder: "Core",
        name: "Core (Base game)",
        description: "The base RimWorld game.",
    },
    Expansion {
        app_id: 1149640,
        package_id: "ludeon.rimworld.royalty",
        folder: "Royalty",
        name: "Royalty (DLC #1)",
        description: "Nobles, psychic powers, quests and mechanoid clusters.",
    },
    Expansion {
        app_id: 1392840,
        package_id: "ludeon.rimworld.ideology",
        folder: "Ideology",
        name: "Ideology (DLC #2)",
        description: "Belief systems, rituals, roles and relics.",
    },
    Expansion {
        app_id: 1826140,
        package_id: "ludeon.rimworld.biotech",
        folder: "Biotech",
        name: "Biotech (DLC #3)",
        description: "Children, genetics, mechanitors and xenotypes.",
    },
    Expansion {
        app_id: 2380740,
        package_id: "ludeon.rimworld.anomaly",
        folder: "Anomaly",
        name: "Anomaly (DLC #4)",
        description: "Horror, entities and the void monolith.",
    },
];

pub fn expansion_for_package(package_id: &str) -> Option<&'static Expansion> {
    EXPANSIONS
        .iter()
        .find(|expansion| expansion.package_id.eq_ignore_ascii_case(package_id))
}

pub fn expansion_for_folder(folder: &str) -> Option<&'static Expansion> {
    EXPANSIONS
        .iter()
        .find(|expansion| expansion.folder.eq_ignore_ascii_case(folder))
}

pub fn store_url(app_id: u32) -> String {
    format!("https://store.steampowered.com/app/{app_id}")
}

pub fn workshop_url(published_file_id: &str) -> String {
    format!("https://steamcommunity.com/sharedfiles/filedetails/?id={published_file_id}")
}

/// Expansions live under `<game>/Data`.
pub fn expansions_folder(game_folder: &Path) -> PathBuf {
    game_folder.join("Data")
}

pub fn read_game_version(game_folder: &Path) -> Result<String, MetadataError> {
    let path = game_folder.join(VERSION_FILE);
    let raw = fs::read_to_string(&path)
        .map_err(|err| MetadataError::VersionUnavailable(format!("read {}: {err}", path.display())))?;
    let version = raw.trim().trim_start_matches('\u{feff}').to_string();
    if version.is_empty() {
        return Err(MetadataError::VersionUnavailable(format!("{} is empty", path.display())));
    }
    Ok(version)
}

/// Immediate sub-directories of `folder`, sorted.
pub fn list_mod_directories(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(folder).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("list {}", folder.display()))?;
        if entry.file_type().is_dir() || (entry.path_is_symlink() && entry.path().is_dir()) {
            dirs.push(entry.path().to_path_buf());
        }
    }
    Ok(dirs)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectedPaths {
    pub game_folder: Option<PathBuf>,
    pub workshop_folder: Option<PathBuf>,
    pub workshop_ledger: Option<PathBuf>,
}

pub fn detect_paths() -> DetectedPaths {
    let mut candidates = Vec::new();
    if let Some(home) = dirs_home() {
        candidates.push(home.join(".local/share/Steam"));
        candidates.push(home.join(".steam/steam"));
        candidates.push(home.join(".var/app/com.valvesoftware.Steam/.local/share/Steam"));
    }
    detect_in_steam_roots(&candidates)
}

fn detect_in_steam_roots(roots: &[PathBuf]) -> DetectedPaths {
    let mut libraries = Vec::new();
    for base in roots {
        let vdf = base.join("steamapps/libraryfolders.vdf");
        if vdf.exists() {
            if let Ok(paths) = parse_steam_library_paths(&vdf) {
                libraries.extend(paths);
            }
        }
        libraries.push(base.clone());
    }

    let mut detected = DetectedPaths::default();
    for lib in libraries {
        let game = lib.join("steamapps/common").join(GAME_NAME);
        if detected.game_folder.is_none() && looks_like_game_folder(&game) {
            detected.game_folder = Some(game);
        }
        let workshop = lib
            .join("steamapps/workshop/content")
            .join(STEAM_APP_ID.to_string());
        if detected.workshop_folder.is_none() && workshop.is_dir() {
            detected.workshop_folder = Some(workshop);
        }
        let ledger = lib
            .join("steamapps/workshop")
            .join(format!("appworkshop_{STEAM_APP_ID}.acf"));
        if detected.workshop_ledger.is_none() && ledger.is_file() {
            detected.workshop_ledger = Some(ledger);
        }
    }
    detected
}

fn parse_steam_library_paths(path: &Path) -> Result<Vec<PathBuf>> {
    let folders = ledger::read_ledger(path).context("read libraryfolders.vdf")?;
    let Some(root) = folders.get("libraryfolders").and_then(|v| v.as_object()) else {
        return Ok(Vec::new());
    };
    Ok(root
        .values()
        .filter_map(|entry| entry.get("path").and_then(|p| p.as_str()))
        .map(PathBuf::from)
        .collect())
}

fn dirs_home() -> Option<PathBuf> {
    BaseDirs::new().map(|base| base.home_dir().to_path_buf())
}

pub fn looks_like_game_folder(path: &Path) -> bool {
    path.join("Data").is_dir() && path.join(VERSION_FILE).is_file()
}
