//! Shared fixtures for unit tests.

use crate::{
    error::ParseError,
    events::EventSink,
    library::RawDescriptor,
    metadata::DescriptorParser,
    store::MetadataStore,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

/// Descriptor parser backed by a map; unknown directories fail to parse.
#[derive(Clone, Default)]
pub struct FakeParser {
    descriptors: Arc<Mutex<HashMap<PathBuf, RawDescriptor>>>,
}

impl FakeParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, dir: &str, descriptor: RawDescriptor) -> Self {
        self.set(dir, descriptor);
        self
    }

    pub fn set(&self, dir: &str, descriptor: RawDescriptor) {
        self.descriptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(PathBuf::from(dir), descriptor);
    }
}

impl DescriptorParser for FakeParser {
    fn descriptor_path(&self, directory: &Path) -> PathBuf {
        directory.join("About").join("About.xml")
    }

    fn parse(&self, directory: &Path) -> Result<RawDescriptor, ParseError> {
        self.descriptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(directory)
            .cloned()
            .ok_or_else(|| ParseError::MissingDescriptor(directory.to_path_buf()))
    }
}

pub fn store_with(parser: FakeParser) -> MetadataStore {
    store_with_events(parser, EventSink::disabled())
}

pub fn store_with_events(parser: FakeParser, events: EventSink) -> MetadataStore {
    MetadataStore::new(Arc::new(parser), 2, events).expect("store")
}
