//! Test utilities for memwarden - sample catalogs and instrumented handlers
//!
//! Shared by unit tests, integration tests and the CLI's scenario runner.

use std::sync::Mutex;

use crate::config::Config;
use crate::eviction::{HandlerError, Releasable};
use crate::resource::{Payload, ResourceTypeDescriptor, TypeCatalog};

/// The five stock resource types from the default configuration
pub fn sample_descriptors() -> Vec<ResourceTypeDescriptor> {
    Config::default().types
}

/// Catalog built from [`sample_descriptors`]
pub fn sample_catalog() -> TypeCatalog {
    TypeCatalog::new(sample_descriptors()).expect("sample descriptors are unique")
}

/// Teardown always fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingReleaser;

impl Releasable for FailingReleaser {
    fn teardown(&self, id: &str, _payload: &mut dyn Payload) -> Result<(), HandlerError> {
        Err(HandlerError::new(format!("refusing to release {id}")))
    }
}

/// Teardown panics
#[derive(Debug, Default, Clone, Copy)]
pub struct PanickingReleaser;

impl Releasable for PanickingReleaser {
    fn teardown(&self, id: &str, _payload: &mut dyn Payload) -> Result<(), HandlerError> {
        panic!("teardown of {id} blew up");
    }
}

/// Records the ids it tears down
#[derive(Debug, Default)]
pub struct RecordingReleaser {
    released: Mutex<Vec<String>>,
}

impl RecordingReleaser {
    pub fn released(&self) -> Vec<String> {
        self.released.lock().map(|ids| ids.clone()).unwrap_or_default()
    }
}

impl Releasable for RecordingReleaser {
    fn teardown(&self, id: &str, _payload: &mut dyn Payload) -> Result<(), HandlerError> {
        if let Ok(mut released) = self.released.lock() {
            released.push(id.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_catalog() {
        let catalog = sample_catalog();
        assert_eq!(catalog.len(), 5);
        assert!(catalog.get("index_structures").unwrap().incrementally_releasable);
    }
}
