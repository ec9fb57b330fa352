//! Resource type catalog
//!
//! Immutable table of per-type metadata supplied by configuration at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Result, WardenError};

/// Metadata shared by every resource of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeDescriptor {
    /// Type name, also the prefix of every resource id of this type
    pub type_name: String,
    /// Release priority (lower = released first)
    pub priority: u32,
    /// Idle time after which a resource of this type is considered expired
    pub max_retain_seconds: u64,
    /// Payloads of this type can be compressed in place
    #[serde(default)]
    pub compressible: bool,
    /// Payloads of this type can shed their oldest state without being destroyed
    #[serde(default)]
    pub incrementally_releasable: bool,
}

impl ResourceTypeDescriptor {
    pub fn new(type_name: impl Into<String>, priority: u32, max_retain_seconds: u64) -> Self {
        Self {
            type_name: type_name.into(),
            priority,
            max_retain_seconds,
            compressible: false,
            incrementally_releasable: false,
        }
    }

    /// Mark the type as compressible
    pub fn compressible(mut self) -> Self {
        self.compressible = true;
        self
    }

    /// Mark the type as incrementally releasable
    pub fn incremental(mut self) -> Self {
        self.incrementally_releasable = true;
        self
    }

    pub fn max_retain(&self) -> Duration {
        Duration::from_secs(self.max_retain_seconds)
    }
}

/// Read-only lookup of resource type metadata.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    types: HashMap<String, ResourceTypeDescriptor>,
}

impl TypeCatalog {
    /// Build a catalog, rejecting duplicate type names
    pub fn new(descriptors: impl IntoIterator<Item = ResourceTypeDescriptor>) -> Result<Self> {
        let mut types = HashMap::new();
        for descriptor in descriptors {
            let name = descriptor.type_name.clone();
            if types.insert(name.clone(), descriptor).is_some() {
                return Err(WardenError::Config(format!("Duplicate type name: {name}")));
            }
        }
        Ok(Self { types })
    }

    pub fn get(&self, type_name: &str) -> Option<&ResourceTypeDescriptor> {
        self.types.get(type_name)
    }

    /// Like [`TypeCatalog::get`] but fails with `UnknownType`
    pub fn require(&self, type_name: &str) -> Result<&ResourceTypeDescriptor> {
        self.get(type_name)
            .ok_or_else(|| WardenError::UnknownType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Descriptors ordered by priority, then name
    pub fn descriptors(&self) -> Vec<&ResourceTypeDescriptor> {
        let mut all: Vec<_> = self.types.values().collect();
        all.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.type_name.cmp(&b.type_name))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> TypeCatalog {
        TypeCatalog::new([
            ResourceTypeDescriptor::new("model_shards", 5, 3600),
            ResourceTypeDescriptor::new("temp_buffers", 1, 60),
            ResourceTypeDescriptor::new("index_structures", 4, 1800).incremental(),
        ])
        .unwrap()
    }

    #[test]
    fn test_lookup() {
        let catalog = catalog();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get("temp_buffers").unwrap().priority, 1);
        assert!(catalog.get("nope").is_none());
        assert!(matches!(
            catalog.require("nope"),
            Err(WardenError::UnknownType(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_descriptors_sorted_by_priority() {
        let catalog = catalog();
        let names: Vec<_> = catalog
            .descriptors()
            .into_iter()
            .map(|d| d.type_name.as_str())
            .collect();
        assert_eq!(names, ["temp_buffers", "index_structures", "model_shards"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let result = TypeCatalog::new([
            ResourceTypeDescriptor::new("a", 1, 1),
            ResourceTypeDescriptor::new("a", 2, 1),
        ]);
        assert!(matches!(result, Err(WardenError::Config(_))));
    }

    #[test]
    fn test_builder_flags() {
        let descriptor = ResourceTypeDescriptor::new("x", 1, 10).compressible().incremental();
        assert!(descriptor.compressible);
        assert!(descriptor.incrementally_releasable);
        assert_eq!(descriptor.max_retain(), Duration::from_secs(10));
    }
}
