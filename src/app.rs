use crate::{
    compile::CompileContext,
    config::{base_data_dir, AppConfig},
    events::{EventSink, MetadataEvent, WatchEvent, Warning},
    metadata::AboutXmlParser,
    refresh::{load_compile_context, RefreshSummary, SourceFolders},
    rimworld::{self, STEAM_APP_ID},
    store::{MetadataStore, SharedStore},
    workshop::{refresh_workshop_times, SteamWebApi},
};
use anyhow::{Context, Result};
use std::{
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
};
use tracing::info;

pub struct App {
    pub config: AppConfig,
    config_path: Option<PathBuf>,
    pub store: SharedStore,
    pub context: CompileContext,
    events: Receiver<MetadataEvent>,
}

impl App {
    /// Loads the config (default location unless `config_path` is given),
    /// fills undetected folders from the Steam libraries and builds an
    /// empty store.
    pub fn initialize(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => AppConfig::load_from(path)?,
            None => AppConfig::load_or_create()?,
        };
        if config.game_folder.is_none() || config.workshop_folder.is_none() {
            let detected = rimworld::detect_paths();
            let mut changed = false;
            if config.game_folder.is_none() && detected.game_folder.is_some() {
                config.game_folder = detected.game_folder;
                changed = true;
            }
            if config.workshop_folder.is_none() && detected.workshop_folder.is_some() {
                config.workshop_folder = detected.workshop_folder;
                changed = true;
            }
            if config.local_folder.is_none() {
                if let Some(game) = &config.game_folder {
                    config.local_folder = Some(game.join("Mods"));
                    changed = true;
                }
            }
            if changed {
                info!("Filled missing folders from Steam library detection");
                let _ = match config_path {
                    Some(path) => config.save_to(path),
                    None => config.save(),
                };
            }
        }
        Self::from_config(config, config_path.map(Path::to_path_buf))
    }

    pub fn from_config(config: AppConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let store = MetadataStore::new(
            Arc::new(AboutXmlParser),
            config.parser_threads(),
            EventSink::new(tx),
        )?;
        Ok(Self {
            config,
            config_path,
            store: SharedStore::new(store),
            context: CompileContext::default(),
            events: rx,
        })
    }

    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Ok(base_data_dir()?.join("config.json")),
        }
    }

    /// Reloads rule sources and the game version, then runs a full refresh
    /// under one write lock.
    pub fn refresh(&mut self, initial: bool) -> RefreshSummary {
        let mut store = self.store.write();
        let (game_version, context) = load_compile_context(&self.config, store.events());
        self.context = context;
        store.set_game_version(game_version);
        store.refresh(&SourceFolders::from_config(&self.config), &self.context, initial)
    }

    /// Entry point for an external file watcher.
    pub fn handle_watch_event(&self, event: &WatchEvent) {
        self.store.write().apply_watch_event(event, &self.context);
    }

    /// Pulls remote created/updated times for every Workshop record.
    pub fn refresh_remote_times(&self) -> Result<usize> {
        let key = self
            .config
            .steam_api_key
            .as_deref()
            .context("steam_api_key is not configured")?;
        let api = SteamWebApi::new(key)?;
        let mut store = self.store.write();
        Ok(refresh_workshop_times(&mut store, &api, STEAM_APP_ID)?)
    }

    pub fn drain_events(&self) -> Vec<MetadataEvent> {
        self.events.try_iter().collect()
    }

    pub fn drain_warnings(&self) -> Vec<Warning> {
        self.drain_events()
            .into_iter()
            .filter_map(|event| match event {
                MetadataEvent::Warning(warning) => Some(warning),
                _ => None,
            })
            .collect()
    }
}
