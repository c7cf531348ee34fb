//! Media asset lifecycle for the ebook editor.
//!
//! Tracks which managed media keys are referenced by the live draft and by
//! stored version snapshots, schedules explicit removals for deletion after
//! a grace period, and physically deletes only keys that are still
//! unreferenced when the garbage collector gets to them.
//!
//! Operations, all methods on [`Lifecycle`]:
//! - [`Lifecycle::reindex_now`]: rebuild the ledger from source content
//! - [`Lifecycle::enqueue_deletion`]: schedule a removed asset
//! - [`Lifecycle::run_gc_batch`]: reclaim due, still-unreferenced assets
//! - [`Lifecycle::run_audit`]: report orphans and missing objects
//!
//! Incremental ledger updates ([`Lifecycle::sync_autosave`],
//! [`Lifecycle::record_version`], [`Lifecycle::release_version`]) keep
//! counters current between reindexes.

pub mod audit;
pub mod dead_letters;
pub mod documents;
pub mod enqueue;
pub mod error;
pub mod gc;
pub mod ledger;
pub mod metrics;
pub mod reindex;
pub mod state;

pub use audit::AuditReport;
pub use dead_letters::{DeadLetterEntry, RequeueOutcome};
pub use documents::{BlobDocumentStore, DocumentStore};
pub use enqueue::EnqueueOutcome;
pub use error::{FailureReason, LifecycleError, LifecycleResult};
pub use gc::{GcRunReport, KeyOutcome};
pub use ledger::VersionUpdate;
pub use reindex::ReindexReport;
pub use state::{HealthReport, Lifecycle};
