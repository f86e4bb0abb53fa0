//! The seams between the scheduler and the code it runs.
//!
//! An [`Executable`] does the actual work of a unit kind. A [`ProgressSink`]
//! hears about starts and finishes; it can fail without affecting scheduling.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::constraint::Environment;
use crate::error::Result;
use crate::model::{Data, WorkId, WorkUnit};

/// Outcome reported by an executable.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecResult {
    Success(Data),
    /// Terminal failure with a human-readable reason.
    Failure(String),
    /// Try again after the unit's backoff delay.
    Retry,
}

impl ExecResult {
    pub fn success() -> Self {
        ExecResult::Success(Data::new())
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        ExecResult::Failure(reason.into())
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            ExecResult::Success(_) => "success",
            ExecResult::Failure(_) => "failure",
            ExecResult::Retry => "retry",
        }
    }
}

/// Everything an executable gets to see about the attempt it is running.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub id: WorkId,
    pub kind: String,
    /// 1 on first run.
    pub attempt: u32,
    /// Upstream outputs merged with the unit's explicit input.
    pub input: Data,
    pub tags: BTreeSet<String>,
    pub environment: Environment,
    /// Fires when the unit is cancelled while running. Observing it is
    /// optional; the ledger state is forced to Cancelled either way.
    pub cancel: CancellationToken,
}

/// A unit of executable behavior, selected by a unit's `kind`.
#[async_trait]
pub trait Executable: Send + Sync {
    async fn execute(&self, ctx: WorkContext) -> ExecResult;
}

/// Executables indexed by kind.
#[derive(Default, Clone)]
pub struct Registry {
    executables: HashMap<String, Arc<dyn Executable>>,
}

impl Registry {
    /// Create an empty registry with no executables.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, executable: impl Executable + 'static) {
        self.executables.insert(kind.into(), Arc::new(executable));
    }

    /// Builder-style [`Registry::register`].
    pub fn with(mut self, kind: impl Into<String>, executable: impl Executable + 'static) -> Self {
        self.register(kind, executable);
        self
    }

    /// Look up an executable by kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Executable>> {
        self.executables.get(kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.executables.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kinds", &self.executables.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Side channel told about unit starts and finishes.
pub trait ProgressSink: Send + Sync {
    fn started(&self, unit: &WorkUnit) -> Result<()>;
    fn finished(&self, unit: &WorkUnit) -> Result<()>;
}

/// Sink that logs transitions through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn started(&self, unit: &WorkUnit) -> Result<()> {
        tracing::info!(work.id = %unit.id, kind = %unit.kind, attempt = unit.attempts, "work started");
        Ok(())
    }

    fn finished(&self, unit: &WorkUnit) -> Result<()> {
        tracing::info!(
            work.id = %unit.id,
            kind = %unit.kind,
            state = %unit.state,
            failure = unit.failure.as_deref().unwrap_or("-"),
            "work finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Executable for Echo {
        async fn execute(&self, ctx: WorkContext) -> ExecResult {
            ExecResult::Success(ctx.input)
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_kind() {
        let registry = Registry::empty().with("echo", Echo);
        assert!(registry.get("missing").is_none());

        let exec = registry.get("echo").unwrap();
        let ctx = WorkContext {
            id: WorkId::new(),
            kind: "echo".into(),
            attempt: 1,
            input: Data::new().with("uri", "X"),
            tags: BTreeSet::new(),
            environment: Environment::default(),
            cancel: CancellationToken::new(),
        };
        let result = exec.execute(ctx).await;
        assert_eq!(result, ExecResult::Success(Data::new().with("uri", "X")));
    }
}
