//! Scheduled publishing of the extracted subset: fetch upstream, transform,
//! compare against the distribution and overwrite it when something changed.

pub mod digest;
pub mod git;
pub mod lock;
pub mod orchestrator;
pub mod transport;

pub use digest::TreeDigest;
pub use orchestrator::{CancelToken, Orchestrator, Outcome, RunOptions, SyncReport, SyncState};
pub use transport::{DistributionRepo, DistributionState, PublishRequest, RunLock, SourceRepo, SourceSnapshot};
