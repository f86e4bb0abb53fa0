//! # chainwork
//!
//! Chained job scheduler with a persisted SQLite work ledger.
//!
//! Callers compose work units into continuations (sequential stages,
//! parallel fan-out, merged tails), admit them under an optional unique name
//! with a KEEP / REPLACE / APPEND policy, and observe progress by id, name
//! or tag. Units run when their upstreams have succeeded and their
//! environmental constraints hold; outputs flow into downstream inputs,
//! failures fail everything downstream, and retries back off linearly or
//! exponentially.

pub mod backoff;
pub mod chain;
pub mod config;
pub mod constraint;
pub mod engine;
pub mod error;
pub mod event;
pub mod executable;
pub mod model;
pub mod status;
pub mod storage;
pub mod telemetry;

pub use backoff::{Backoff, BackoffPolicy, next_delay};
pub use chain::{Continuation, UniqueWork};
pub use constraint::{
    Constraints, Environment, EnvironmentProvider, Network, NetworkType, StaticEnvironment,
    satisfied,
};
pub use engine::{Admission, Claim, Collaborators, Scheduler, SchedulerConfig, WorkerPool};
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use executable::{ExecResult, Executable, ProgressSink, Registry, TracingSink, WorkContext};
pub use model::{
    Data, ExistingWorkPolicy, InstanceId, MAX_DATA_BYTES, NewWorkUnit, State, Value, WorkId,
    WorkSpec, WorkUnit,
};
pub use status::{ChangeSet, WorkFilter, WorkObserver};
pub use storage::Storage;
