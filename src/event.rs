//! Structured events appended to the ledger on every admission and
//! transition.
//!
//! The event log is durable and ordered by `seq`, so a consumer that was not
//! subscribed to the live feed can catch up with `Scheduler::events_since`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ExistingWorkPolicy, InstanceId, State, WorkId};

/// A structured event recorded by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Ledger-assigned, strictly increasing.
    pub seq: u64,
    /// When the event was written.
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ContinuationAdmitted {
        instance_id: InstanceId,
        unique_name: Option<String>,
        policy: Option<ExistingWorkPolicy>,
        units: Vec<WorkId>,
    },
    AdmissionKept {
        unique_name: String,
        existing: InstanceId,
    },
    InstanceReplaced {
        unique_name: String,
        previous: InstanceId,
        replacement: InstanceId,
    },
    ContinuationAppended {
        unique_name: String,
        instance_id: InstanceId,
        after: Vec<WorkId>,
        units: Vec<WorkId>,
    },
    StateTransition {
        id: WorkId,
        from: State,
        to: State,
    },
    RetryScheduled {
        id: WorkId,
        attempt: u32,
        delay_ms: u64,
    },
    WorkFailed {
        id: WorkId,
        reason: String,
    },
    OutputRecorded {
        id: WorkId,
        keys: usize,
    },
    RecoveredAfterRestart {
        id: WorkId,
    },
    /// Fallback for rows that no longer parse.
    Unknown {
        raw: String,
    },
}
