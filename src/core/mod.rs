pub mod aggregator;
pub mod backend;
pub mod diff;
pub mod dispatcher;
pub mod events;
pub mod executor;
pub mod journal;
pub mod runner;
pub mod throughput;
pub mod walker;

pub use aggregator::ExecutionLogAggregator;
pub use backend::{create_backend, BackendKind, NativeCopyBackend, StreamCopyBackend, TransferBackend};
pub use diff::{ClassifiedEntry, CompareStrategy, DiffEngine, DiffResult, DiffSummary, Disposition};
pub use dispatcher::{Dispatcher, ManualTrigger, RunGuard, RunHandle, RunningSet};
pub use events::{BroadcastSink, EventSink, FanoutSink, NullSink, SinkEvent, TracingSink, TransferEvent};
pub use executor::{DeletePolicy, RunOptions, RunPhase, RunRequest, RunSummary, TransferExecutor};
pub use journal::RunJournal;
pub use runner::{RunSettings, RunTarget, Runner};
pub use throughput::{format_rate, ProgressSnapshot, ThroughputEstimator};
pub use walker::{FileEntry, Snapshot, TreeWalker, WalkConfig, WalkWarning};
