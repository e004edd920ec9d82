use crate::library::ModId;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Failure to turn one mod directory into a descriptor.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("descriptor not found in {0}")]
    MissingDescriptor(PathBuf),

    #[error("read descriptor {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed descriptor {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{kind} is misconfigured: {detail}")]
    Configuration { kind: String, detail: String },

    #[error("game version unavailable: {0}")]
    VersionUnavailable(String),

    #[error("remote fetch failed: {0}")]
    RemoteFetch(String),

    #[error("mod {0} is no longer in the store")]
    RaceCondition(ModId),
}

impl MetadataError {
    pub fn configuration(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        MetadataError::Configuration {
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

impl From<ureq::Error> for MetadataError {
    fn from(err: ureq::Error) -> Self {
        MetadataError::RemoteFetch(err.to_string())
    }
}
