//! Resource model: type catalog, payload storage and registry handles

pub mod catalog;
pub mod payload;
pub mod types;

pub use catalog::{ResourceTypeDescriptor, TypeCatalog};
pub use payload::{Opaque, Payload, PayloadSlot, RollingBuffer};
pub use types::{ResourceHandle, parse_id};
