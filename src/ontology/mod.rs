//! Domain ontology: entity discovery and guarded metadata edits

pub mod discovery;
pub mod service;

pub use discovery::{DiscoverySummary, EntityDiscovery};
pub use service::{EntityPatch, Modifier, OntologyService, RelationshipPatch};
