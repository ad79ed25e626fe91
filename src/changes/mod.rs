//! Pending schema changes
//!
//! Classification of refresh deltas into reviewable changes, and resolution
//! of those changes back into the selection state of the mirror.

pub mod classifier;
pub mod resolver;

pub use classifier::{suggested_entity_name, ChangeClassifier};
pub use resolver::{ChangeResolver, ResolutionSummary, SelectionSet};
