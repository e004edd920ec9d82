use crate::dbmerge::MergePolicy;
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

const CONFIG_FILE: &str = "config.json";
const USER_RULES_FILE: &str = "userRules.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub game_folder: Option<PathBuf>,
    pub config_folder: Option<PathBuf>,
    pub local_folder: Option<PathBuf>,
    pub workshop_folder: Option<PathBuf>,
    pub steam_db_path: Option<PathBuf>,
    pub community_rules_path: Option<PathBuf>,
    pub user_rules_path: Option<PathBuf>,
    pub database_expiry_secs: i64,
    pub dependency_for_sorting: bool,
    pub strict_version_keys: bool,
    pub parser_threads: usize,
    pub steam_api_key: Option<String>,
    pub steamcmd_ledger_path: Option<PathBuf>,
    pub db_builder: MergePolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            game_folder: None,
            config_folder: None,
            local_folder: None,
            workshop_folder: None,
            steam_db_path: None,
            community_rules_path: None,
            user_rules_path: None,
            database_expiry_secs: 604_800,
            dependency_for_sorting: true,
            strict_version_keys: false,
            parser_threads: 0,
            steam_api_key: None,
            steamcmd_ledger_path: None,
            db_builder: MergePolicy::default(),
        }
    }
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join(CONFIG_FILE);
        if path.exists() {
            return Self::load_from(&path);
        }
        let config = AppConfig::default();
        config.save_to(&path)?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).context("read app config")?;
        serde_json::from_str(&raw).context("parse app config")
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        self.save_to(&base_dir.join(CONFIG_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn user_rules_path(&self) -> Result<PathBuf> {
        match &self.user_rules_path {
            Some(path) => Ok(path.clone()),
            None => Ok(databases_dir()?.join(USER_RULES_FILE)),
        }
    }

    /// `ModsConfig.xml` inside the game's config folder.
    pub fn mods_config_path(&self) -> Option<PathBuf> {
        self.config_folder
            .as_ref()
            .map(|folder| folder.join("ModsConfig.xml"))
    }

    pub fn parser_threads(&self) -> usize {
        if self.parser_threads > 0 {
            return self.parser_threads;
        }
        std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(4)
    }
}

pub fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modsmith"))
}

pub fn databases_dir() -> Result<PathBuf> {
    Ok(base_data_dir()?.join("databases"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"game_folder": "/games/RimWorld", "parser_threads": 3}"#)
                .expect("parse");
        assert_eq!(config.game_folder, Some(PathBuf::from("/games/RimWorld")));
        assert_eq!(config.parser_threads(), 3);
        assert_eq!(config.database_expiry_secs, 604_800);
        assert!(config.dependency_for_sorting);
        assert!(config.db_builder.preserve_keys.contains("blacklist"));
    }

    #[test]
    fn save_and_load_round_trip_through_file() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("config.json");
        let config = AppConfig {
            steam_api_key: Some("k".repeat(32)),
            strict_version_keys: true,
            ..AppConfig::default()
        };
        config.save_to(&path).expect("save");
        assert_eq!(AppConfig::load_from(&path).expect("load"), config);
    }

    #[test]
    fn explicit_user_rules_path_wins() {
        let config = AppConfig {
            user_rules_path: Some(PathBuf::from("/rules/user.json")),
            ..AppConfig::default()
        };
        assert_eq!(config.user_rules_path().expect("path"), PathBuf::from("/rules/user.json"));
        assert_eq!(
            AppConfig {
                config_folder: Some(PathBuf::from("/cfg")),
                ..AppConfig::default()
            }
            .mods_config_path(),
            Some(PathBuf::from("/cfg/ModsConfig.xml"))
        );
    }
}
