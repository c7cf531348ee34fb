//! Repository traits for lifecycle metadata.

pub mod dead_letters;
pub mod pending;
pub mod usage;
pub mod version_media;

pub use dead_letters::DeadLetterRepo;
pub use pending::{PendingDeletionRepo, ReclaimOutcome};
pub use usage::{AutosaveSync, RebuildStats, UsageRepo, UsageSnapshot, VersionMediaSet};
pub use version_media::{DecrementOutcome, VersionMediaRepo};
