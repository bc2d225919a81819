//! Landing zone of the pipeline: a date-partitioned object store layout of change events.
//!
//! Every [`ChangeEvent`](bronze_types::ChangeEvent) is stored as its own JSON object under a key
//! derived only from the event ([`LakeObjectKey`]). Writes use create-if-absent semantics, so
//! delivering the same event twice leaves exactly one object behind.
//!
//! Events that cannot be normalized go to a [`DeadLetterSink`] instead.

pub mod dead_letter;
pub mod paths;
pub mod writer;

pub use dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterSink, ObjectStoreDeadLetterSink};
pub use paths::{DeadLetterPath, LakeObjectKey};
pub use writer::{LakeSink, LakeWriter, WriteError, WriteOutcome};
