//! Status queries and live observation of work units.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::engine::Scheduler;
use crate::error::Result;
use crate::model::{WorkId, WorkUnit};

/// Selects the work units a query or observer is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkFilter {
    Id(WorkId),
    /// Units of the instance currently bound to the name.
    UniqueName(String),
    Tag(String),
}

impl WorkFilter {
    /// Whether a changed unit could alter the result of this filter.
    ///
    /// A unit matches a name filter if its instance was admitted under that
    /// name; the bound instance may have moved on since.
    pub fn matches(&self, unit: &WorkUnit) -> bool {
        match self {
            WorkFilter::Id(id) => unit.id == *id,
            WorkFilter::UniqueName(name) => unit.unique_name.as_deref() == Some(name.as_str()),
            WorkFilter::Tag(tag) => unit.tags.contains(tag),
        }
    }
}

/// Snapshot of the units touched by one committed transaction.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub units: Vec<WorkUnit>,
}

/// Live view over the units matching a filter.
///
/// The first call to [`WorkObserver::next`] returns the current snapshot.
/// After that each committed change to a matching unit yields a fresh
/// snapshot. Dropping the observer unsubscribes.
pub struct WorkObserver {
    scheduler: Scheduler,
    filter: WorkFilter,
    changes: broadcast::Receiver<Arc<ChangeSet>>,
    primed: bool,
}

impl WorkObserver {
    pub(crate) fn new(
        scheduler: Scheduler,
        filter: WorkFilter,
        changes: broadcast::Receiver<Arc<ChangeSet>>,
    ) -> Self {
        Self {
            scheduler,
            filter,
            changes,
            primed: false,
        }
    }

    pub fn filter(&self) -> &WorkFilter {
        &self.filter
    }

    /// Wait for the next snapshot. Returns `None` once the scheduler is gone.
    pub async fn next(&mut self) -> Option<Result<Vec<WorkUnit>>> {
        if !self.primed {
            self.primed = true;
            return Some(self.scheduler.query(&self.filter));
        }

        loop {
            match self.changes.recv().await {
                Ok(set) => {
                    if set.units.iter().any(|u| self.filter.matches(u)) {
                        return Some(self.scheduler.query(&self.filter));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed changes may have matched; the ledger has the truth.
                    debug!(skipped, filter = ?self.filter, "observer lagged, re-querying");
                    return Some(self.scheduler.query(&self.filter));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
