//! Proto-session assembly
//!
//! Hits are grouped into proto-sessions by authoritative client id, with
//! identifier conflicts rerouting hits to the first owner. A timing wheel
//! driven by observed time closes proto-sessions after inactivity.

pub mod batched;
pub mod closer;
pub mod conflicts;
pub mod deduplicating;
pub mod generic;
pub mod handler;
pub mod orchestrator;
pub mod sqlite;
pub mod timing_wheel;

pub use batched::{BatchedIoBackend, BucketId};
pub use closer::{Closer, LoggingCloser};
pub use conflicts::{ConflictStrategy, EvictWholeProtoSession, Resolution, RewriteIdAndUpdateInPlace};
pub use deduplicating::DeduplicatingBackend;
pub use generic::KvBatchedIoBackend;
pub use handler::HitsTaskHandler;
pub use orchestrator::{split_on_inactivity, Orchestrator, OrchestratorConfig};
pub use sqlite::SqliteBatchedIoBackend;
pub use timing_wheel::{BucketProcessor, FireOutcome, TimingWheel, WheelBucket};
