//! Experience Kernel: immutable experience banks and single-writer curation.
//!
//! This crate holds the domain-agnostic half of training-free policy
//! improvement: the experience bank data model, mutation operations and their
//! deterministic resolution, step-indexed snapshot persistence, and the
//! completion capability the rest of the system is written against.

pub mod completion;
pub mod error;
pub mod experience;
pub mod mutation;
pub mod snapshot;

pub use completion::{Completion, CompletionError, CompletionRequest};
pub use error::KernelError;
pub use experience::{Experience, ExperienceBank, ExperienceId, Namespace};
pub use mutation::{MutationOp, MutationResolver, OpOutcome, Resolution, SkipReason};
pub use snapshot::{Snapshot, SnapshotStore};
