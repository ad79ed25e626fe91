//! Schema synchronization
//!
//! Diffs a discovered schema against the stored mirror and reports every
//! delta for the change classifier.

pub mod policy;
pub mod result;
pub mod synchronizer;

pub use policy::AutoSelectPolicy;
pub use result::RefreshResult;
pub use synchronizer::SchemaSynchronizer;
