use crate::library::{DataSource, ModId};
use std::{path::PathBuf, sync::mpsc::Sender};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub title: String,
    pub text: String,
    pub detail: String,
}

/// Notifications the core emits for whoever drives it (CLI, shell, watcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataEvent {
    ModCreated(ModId),
    ModDeleted(ModId),
    ModUpdated(ModId),
    Warning(Warning),
}

/// File-system change reported by an external watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created { source: DataSource, dir: PathBuf },
    Deleted { source: DataSource, dir: PathBuf },
    Modified { source: DataSource, dir: PathBuf },
}

#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<MetadataEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<MetadataEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: MetadataEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver only means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }

    pub fn warn(&self, title: &str, text: &str, detail: &str) {
        warn!("{title}: {text} {detail}");
        self.emit(MetadataEvent::Warning(Warning {
            title: title.to_string(),
            text: text.to_string(),
            detail: detail.to_string(),
        }));
    }
}
