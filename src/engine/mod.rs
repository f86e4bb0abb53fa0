//! Scheduler engine: admission, dispatch, completion and cancellation.
//!
//! Every mutation runs as one immediate ledger transaction behind a single
//! writer lock. After commit the touched units are published on the change
//! feed, the progress sink is told about starts and finishes, and the worker
//! pool is woken. Executables never run while the lock is held.

pub mod pool;

pub use pool::WorkerPool;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{Continuation, UniqueWork};
use crate::constraint::{Environment, EnvironmentProvider, StaticEnvironment, satisfied};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::executable::{ExecResult, Executable, ProgressSink, Registry, TracingSink, WorkContext};
use crate::model::{Data, ExistingWorkPolicy, InstanceId, State, WorkId, WorkUnit};
use crate::status::{ChangeSet, WorkFilter, WorkObserver};
use crate::storage::{Storage, TxContext};
use crate::telemetry::metrics;

/// How often a transaction is retried when the ledger file is busy.
const BUSY_RETRIES: u32 = 3;
const BUSY_PAUSE: Duration = Duration::from_millis(50);

/// Configuration for the scheduler and its worker pool.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of executables allowed to run at once.
    pub workers: usize,
    /// Attempt cap for units that do not set their own.
    pub default_max_attempts: u32,
    /// Dispatch fallback when nothing wakes the pool.
    pub poll_interval: Duration,
    /// How long shutdown waits for running executables.
    pub drain_timeout: Duration,
    /// Capacity of the change feed before slow observers lag.
    pub change_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_max_attempts: 5,
            poll_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
            change_buffer: 256,
        }
    }
}

/// Things the scheduler consumes but does not own.
pub struct Collaborators {
    pub registry: Registry,
    pub environment: Arc<dyn EnvironmentProvider>,
    pub sink: Option<Arc<dyn ProgressSink>>,
}

impl Collaborators {
    /// A static default environment and the tracing sink.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            environment: Arc::new(StaticEnvironment::default()),
            sink: Some(Arc::new(TracingSink)),
        }
    }

    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentProvider>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn without_sink(mut self) -> Self {
        self.sink = None;
        self
    }
}

/// Result of admitting a continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A new instance was created.
    Enqueued { instance: InstanceId, ids: Vec<WorkId> },
    /// KEEP found an active instance; nothing was admitted.
    Kept { instance: InstanceId, existing: Vec<WorkId> },
    /// REPLACE cancelled the active instance and created a new one.
    Replaced {
        instance: InstanceId,
        ids: Vec<WorkId>,
        cancelled: Vec<WorkId>,
    },
    /// APPEND grafted the units after the active instance's leaves.
    Appended {
        instance: InstanceId,
        ids: Vec<WorkId>,
        after: Vec<WorkId>,
    },
}

impl Admission {
    /// The instance that is active under the name after admission.
    pub fn instance(&self) -> InstanceId {
        match self {
            Admission::Enqueued { instance, .. }
            | Admission::Kept { instance, .. }
            | Admission::Replaced { instance, .. }
            | Admission::Appended { instance, .. } => *instance,
        }
    }

    /// Ids of the admitted units, or of the existing ones for KEEP.
    pub fn ids(&self) -> &[WorkId] {
        match self {
            Admission::Enqueued { ids, .. }
            | Admission::Replaced { ids, .. }
            | Admission::Appended { ids, .. } => ids,
            Admission::Kept { existing, .. } => existing,
        }
    }

    pub fn is_kept(&self) -> bool {
        matches!(self, Admission::Kept { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Admission::Enqueued { .. } => "enqueued",
            Admission::Kept { .. } => "kept",
            Admission::Replaced { .. } => "replaced",
            Admission::Appended { .. } => "appended",
        }
    }
}

/// A unit moved to Running by [`Scheduler::claim_ready`], with everything
/// needed to run it. Report the outcome with [`Scheduler::complete`].
pub struct Claim {
    pub context: WorkContext,
    pub executable: Arc<dyn Executable>,
}

impl Claim {
    pub fn id(&self) -> WorkId {
        self.context.id
    }

    /// Run the executable to completion.
    pub async fn run(self) -> ExecResult {
        self.executable.execute(self.context).await
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim").field("context", &self.context).finish()
    }
}

struct Inner {
    ledger: Mutex<Storage>,
    registry: Registry,
    environment: Arc<dyn EnvironmentProvider>,
    sink: Option<Arc<dyn ProgressSink>>,
    config: SchedulerConfig,
    changes: broadcast::Sender<Arc<ChangeSet>>,
    wake: Notify,
    /// Cancellation signals of units currently Running.
    running: Mutex<HashMap<WorkId, CancellationToken>>,
}

/// Handle to the scheduler. Cheap to clone; all clones share one ledger.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// A unit as planned in memory before it is written to the ledger.
struct Planned {
    unit: WorkUnit,
    /// Indices into the plan; empty for roots.
    upstream: Vec<usize>,
}

struct DispatchDraft {
    context: WorkContext,
    executable: Arc<dyn Executable>,
}

impl Scheduler {
    /// Open a ledger file and recover units that were running when the
    /// previous process stopped.
    pub fn open(
        path: impl AsRef<Path>,
        collaborators: Collaborators,
        config: SchedulerConfig,
    ) -> Result<Self> {
        Self::new(Storage::open(path)?, collaborators, config)
    }

    /// Scheduler over an in-memory ledger with default collaborators.
    pub fn in_memory(registry: Registry) -> Result<Self> {
        Self::new(
            Storage::in_memory()?,
            Collaborators::new(registry),
            SchedulerConfig::default(),
        )
    }

    pub fn new(
        storage: Storage,
        collaborators: Collaborators,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let (changes, _) = broadcast::channel(config.change_buffer.max(1));
        let scheduler = Self {
            inner: Arc::new(Inner {
                ledger: Mutex::new(storage),
                registry: collaborators.registry,
                environment: collaborators.environment,
                sink: collaborators.sink,
                config,
                changes,
                wake: Notify::new(),
                running: Mutex::new(HashMap::new()),
            }),
        };
        scheduler.recover()?;
        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// The environment as the scheduler currently sees it.
    pub fn environment(&self) -> Environment {
        self.inner.environment.current()
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Persist a continuation, resolving a unique-name collision with its
    /// policy. Resolution and insertion are one transaction.
    pub fn enqueue(&self, continuation: Continuation) -> Result<Admission> {
        let now = Utc::now();
        let env = self.inner.environment.current();
        let unique = continuation.unique.clone();
        let plan = plan(continuation, now);

        let admission = self.transact(
            "admit",
            |tx| admit_tx(tx, unique.as_ref(), &plan, &env),
            |_| {},
        )?;

        let policy = unique
            .as_ref()
            .map(|u| u.policy.to_string())
            .unwrap_or_else(|| "none".to_string());
        metrics::work_admitted().add(
            1,
            &[
                KeyValue::new("policy", policy),
                KeyValue::new("result", admission.label()),
            ],
        );
        info!(
            instance = %admission.instance(),
            unique_name = unique.as_ref().map(|u| u.name.as_str()).unwrap_or("-"),
            result = admission.label(),
            units = admission.ids().len(),
            "continuation admitted"
        );

        if let Admission::Replaced { cancelled, .. } = &admission {
            self.signal_cancelled(cancelled);
        }
        self.inner.wake.notify_one();
        Ok(admission)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Claim up to `limit` ready units now.
    pub fn claim_ready(&self, limit: usize) -> Result<Vec<Claim>> {
        self.claim_ready_at(Utc::now(), limit)
    }

    /// Claim up to `limit` ready units as of `now`.
    ///
    /// Blocked units whose upstreams all succeeded are promoted when their
    /// constraints hold; Enqueued units whose constraints stopped holding
    /// are demoted. Claimed units enter Running with their effective input
    /// recorded.
    pub fn claim_ready_at(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Claim>> {
        let env = self.inner.environment.current();
        let default_max = self.inner.config.default_max_attempts;

        let drafts = self.transact(
            "dispatch",
            |tx| self.dispatch_tx(tx, now, limit, &env, default_max),
            |drafts: &Vec<DispatchDraft>| {
                let mut running = self.inner.running.lock();
                for draft in drafts {
                    running.insert(draft.context.id, draft.context.cancel.clone());
                }
            },
        )?;

        Ok(drafts
            .into_iter()
            .map(|d| Claim {
                context: d.context,
                executable: d.executable,
            })
            .collect())
    }

    fn dispatch_tx(
        &self,
        tx: &mut TxContext,
        now: DateTime<Utc>,
        limit: usize,
        env: &Environment,
        default_max: u32,
    ) -> Result<Vec<DispatchDraft>> {
        let mut drafts = Vec::new();
        let candidates =
            tx.units_in_states(&[State::Blocked, State::Enqueued, State::Retrying])?;

        for unit in candidates {
            let holds = satisfied(&unit.constraints, env);
            match unit.state {
                State::Blocked => {
                    if !holds || !upstream_succeeded(tx, unit.id)? {
                        continue;
                    }
                    tx.update_state(unit.id, State::Enqueued)?;
                }
                State::Enqueued if !holds => {
                    tx.update_state(unit.id, State::Blocked)?;
                    continue;
                }
                _ => {}
            }

            if !holds || unit.run_at > now || drafts.len() >= limit {
                continue;
            }

            let input = effective_input(tx, &unit)?;
            let Some(executable) = self.inner.registry.get(&unit.kind) else {
                tx.start_attempt(unit.id, &input)?;
                let reason = format!("no executable registered for kind '{}'", unit.kind);
                warn!(work.id = %unit.id, kind = %unit.kind, "{reason}");
                fail_tx(tx, unit.id, &reason)?;
                continue;
            };

            let attempt = tx.start_attempt(unit.id, &input)?;
            debug!(
                work.id = %unit.id,
                kind = %unit.kind,
                attempt,
                max = unit.max_attempts.unwrap_or(default_max),
                "claimed"
            );

            drafts.push(DispatchDraft {
                context: WorkContext {
                    id: unit.id,
                    kind: unit.kind,
                    attempt,
                    input,
                    tags: unit.tags,
                    environment: *env,
                    cancel: CancellationToken::new(),
                },
                executable,
            });
        }

        Ok(drafts)
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Record what an executable returned for a running unit.
    pub fn complete(&self, id: WorkId, result: ExecResult) -> Result<State> {
        self.complete_at(id, result, Utc::now())
    }

    /// Record an executable outcome as of `now`. Returns the unit's state
    /// afterwards. Outcomes for units no longer Running (cancelled meanwhile)
    /// are discarded.
    pub fn complete_at(&self, id: WorkId, result: ExecResult, now: DateTime<Utc>) -> Result<State> {
        let default_max = self.inner.config.default_max_attempts;

        let state = self.transact(
            "complete",
            |tx| complete_tx(tx, id, &result, now, default_max),
            |_| {
                self.inner.running.lock().remove(&id);
            },
        )?;

        self.inner.wake.notify_one();
        Ok(state)
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel a unit and everything downstream of it. Terminal units are
    /// left alone. Returns the ids that moved to Cancelled.
    pub fn cancel_by_id(&self, id: WorkId) -> Result<Vec<WorkId>> {
        self.cancel_where("cancel_by_id", |tx| {
            tx.get_unit(id)?;
            Ok(vec![id])
        })
    }

    /// Cancel every non-terminal unit of the instance bound to `name`.
    pub fn cancel_unique(&self, name: &str) -> Result<Vec<WorkId>> {
        self.cancel_where("cancel_unique", |tx| match tx.instance_for_name(name)? {
            Some(instance) => Ok(tx
                .units_in_instance(instance)?
                .into_iter()
                .map(|u| u.id)
                .collect()),
            None => Ok(Vec::new()),
        })
    }

    /// Cancel every unit tagged `tag` and everything downstream of them.
    pub fn cancel_by_tag(&self, tag: &str) -> Result<Vec<WorkId>> {
        self.cancel_where("cancel_by_tag", |tx| {
            Ok(tx.units_by_tag(tag)?.into_iter().map(|u| u.id).collect())
        })
    }

    fn cancel_where(
        &self,
        op: &'static str,
        select: impl Fn(&mut TxContext) -> Result<Vec<WorkId>>,
    ) -> Result<Vec<WorkId>> {
        let cancelled = self.transact(
            op,
            |tx| {
                let roots = select(tx)?;
                cancel_tx(tx, roots)
            },
            |_| {},
        )?;

        if !cancelled.is_empty() {
            info!(op, count = cancelled.len(), "work cancelled");
        }
        self.signal_cancelled(&cancelled);
        self.inner.wake.notify_one();
        Ok(cancelled)
    }

    /// Fire the token of every running unit without touching the ledger.
    pub(crate) fn signal_running(&self) -> usize {
        let running = self.inner.running.lock();
        for token in running.values() {
            token.cancel();
        }
        running.len()
    }

    fn signal_cancelled(&self, ids: &[WorkId]) {
        let mut running = self.inner.running.lock();
        for id in ids {
            if let Some(token) = running.remove(id) {
                token.cancel();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: WorkId) -> Result<WorkUnit> {
        self.inner.ledger.lock().get_unit(id)
    }

    /// Current snapshot of the units matching `filter`. No match is an
    /// empty list.
    pub fn query(&self, filter: &WorkFilter) -> Result<Vec<WorkUnit>> {
        let ledger = self.inner.ledger.lock();
        match filter {
            WorkFilter::Id(id) => Ok(ledger.find_unit(*id)?.into_iter().collect()),
            WorkFilter::UniqueName(name) => ledger.units_by_name(name),
            WorkFilter::Tag(tag) => ledger.units_by_tag(tag),
        }
    }

    /// Live snapshots of the units matching `filter`.
    pub fn observe(&self, filter: WorkFilter) -> WorkObserver {
        WorkObserver::new(self.clone(), filter, self.inner.changes.subscribe())
    }

    /// Raw change feed: one [`ChangeSet`] per committed transaction.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeSet>> {
        self.inner.changes.subscribe()
    }

    /// Ledger events with a sequence number greater than `seq`.
    pub fn events_since(&self, seq: u64) -> Result<Vec<Event>> {
        self.inner.ledger.lock().get_events_since(seq)
    }

    /// Earliest instant at which a waiting unit becomes due.
    pub fn next_due(&self) -> Result<Option<DateTime<Utc>>> {
        let units = self
            .inner
            .ledger
            .lock()
            .units_in_states(&[State::Enqueued, State::Retrying])?;
        Ok(units.iter().map(|u| u.run_at).min())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Tell the scheduler the environment changed, so blocked and enqueued
    /// units are re-evaluated on the next dispatch pass.
    pub fn environment_changed(&self) {
        debug!("environment changed");
        self.inner.wake.notify_one();
    }

    pub(crate) fn woken(&self) -> tokio::sync::futures::Notified<'_> {
        self.inner.wake.notified()
    }

    /// Units left Running by a previous process go back to Retrying, due
    /// now, with their attempt count kept. A unit that was on its last
    /// allowed attempt fails instead.
    fn recover(&self) -> Result<()> {
        let now = Utc::now();
        let default_max = self.inner.config.default_max_attempts;
        let recovered = self.transact(
            "recover",
            |tx| {
                let mut recovered = Vec::new();
                for unit in tx.units_in_states(&[State::Running])? {
                    tx.record_event(EventKind::RecoveredAfterRestart { id: unit.id })?;
                    recovered.push(unit.id);

                    let max = unit.max_attempts.unwrap_or(default_max);
                    if unit.attempts >= max {
                        fail_tx(
                            tx,
                            unit.id,
                            &format!("exhausted {}/{} attempts", unit.attempts, max),
                        )?;
                        continue;
                    }
                    tx.update_state(unit.id, State::Retrying)?;
                    tx.set_run_at(unit.id, now)?;
                }
                Ok(recovered)
            },
            |_| {},
        )?;

        if !recovered.is_empty() {
            warn!(count = recovered.len(), "recovered units left running by a previous process");
        }
        Ok(())
    }

    /// Run `f` in one ledger transaction, retrying while the file is busy.
    ///
    /// `after_commit` runs with the writer lock still held. The touched
    /// units are then published and reported to the sink.
    fn transact<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut(&mut TxContext) -> Result<T>,
        after_commit: impl FnOnce(&T),
    ) -> Result<T> {
        let (value, changed) = {
            let mut ledger = self.inner.ledger.lock();
            let mut attempt = 0;
            let (value, touched) = loop {
                match ledger.with_transaction(&mut f) {
                    Ok(done) => break done,
                    Err(e) if e.is_busy() && attempt < BUSY_RETRIES => {
                        attempt += 1;
                        warn!(op, attempt, "ledger busy, retrying transaction");
                        std::thread::sleep(BUSY_PAUSE * attempt);
                    }
                    Err(e) if e.is_busy() => {
                        return Err(Error::Unavailable(format!("{op}: {e}")));
                    }
                    Err(e) => return Err(e),
                }
            };
            after_commit(&value);

            let mut changed = Vec::with_capacity(touched.len());
            for id in touched {
                if let Some(unit) = ledger.find_unit(id)? {
                    changed.push(unit);
                }
            }
            if !changed.is_empty() {
                // No receivers is fine.
                let _ = self.inner.changes.send(Arc::new(ChangeSet {
                    units: changed.clone(),
                }));
            }
            (value, changed)
        };

        self.notify_sink(&changed);
        Ok(value)
    }

    fn notify_sink(&self, changed: &[WorkUnit]) {
        let Some(sink) = &self.inner.sink else {
            return;
        };
        for unit in changed {
            let result = match unit.state {
                State::Running => sink.started(unit),
                s if s.is_terminal() => sink.finished(unit),
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(work.id = %unit.id, "progress sink error: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

fn plan(continuation: Continuation, now: DateTime<Utc>) -> Vec<Planned> {
    continuation
        .nodes
        .into_iter()
        .map(|node| {
            let id = node.unit.id;
            let spec = node.unit.spec;
            Planned {
                unit: WorkUnit {
                    id,
                    instance_id: InstanceId::default(),
                    unique_name: None,
                    kind: spec.kind,
                    position: node.position,
                    state: State::Blocked,
                    tags: spec.tags,
                    input: spec.input,
                    effective_input: None,
                    output: None,
                    constraints: spec.constraints,
                    backoff: spec.backoff,
                    max_attempts: spec.max_attempts,
                    attempts: 0,
                    run_at: after(now, spec.initial_delay),
                    failure: None,
                    created_at: now,
                    updated_at: now,
                    finished_at: None,
                },
                upstream: node.upstream,
            }
        })
        .collect()
}

fn admit_tx(
    tx: &mut TxContext,
    unique: Option<&UniqueWork>,
    plan: &[Planned],
    env: &Environment,
) -> Result<Admission> {
    let Some(unique) = unique else {
        let instance = InstanceId::new();
        tx.insert_instance(instance, None)?;
        let ids = insert_plan(tx, plan, instance, None, &[], 0, env)?;
        tx.record_event(EventKind::ContinuationAdmitted {
            instance_id: instance,
            unique_name: None,
            policy: None,
            units: ids.clone(),
        })?;
        return Ok(Admission::Enqueued { instance, ids });
    };

    let name = unique.name.as_str();
    let active = match tx.instance_for_name(name)? {
        Some(instance) if instance_active(tx, instance)? => Some(instance),
        _ => None,
    };

    match (unique.policy, active) {
        (ExistingWorkPolicy::Keep, Some(existing)) => {
            let ids = tx
                .units_in_instance(existing)?
                .into_iter()
                .map(|u| u.id)
                .collect();
            tx.record_event(EventKind::AdmissionKept {
                unique_name: name.to_string(),
                existing,
            })?;
            Ok(Admission::Kept {
                instance: existing,
                existing: ids,
            })
        }
        (ExistingWorkPolicy::Replace, Some(previous)) => {
            let targets = tx
                .units_in_instance(previous)?
                .into_iter()
                .map(|u| u.id)
                .collect();
            let cancelled = cancel_tx(tx, targets)?;

            let instance = InstanceId::new();
            tx.insert_instance(instance, Some(name))?;
            tx.bind_unique_name(name, instance)?;
            let ids = insert_plan(tx, plan, instance, Some(name), &[], 0, env)?;
            tx.record_event(EventKind::InstanceReplaced {
                unique_name: name.to_string(),
                previous,
                replacement: instance,
            })?;
            Ok(Admission::Replaced {
                instance,
                ids,
                cancelled,
            })
        }
        (ExistingWorkPolicy::Append, Some(instance)) => {
            let leaves = tx.leaves(instance)?;
            let after_ids: Vec<WorkId> = leaves.iter().map(|u| u.id).collect();
            let offset = leaves.iter().map(|u| u.position + 1).max().unwrap_or(0);

            let ids = insert_plan(tx, plan, instance, Some(name), &after_ids, offset, env)?;
            settle_graft(tx, plan, &leaves)?;
            tx.record_event(EventKind::ContinuationAppended {
                unique_name: name.to_string(),
                instance_id: instance,
                after: after_ids.clone(),
                units: ids.clone(),
            })?;
            Ok(Admission::Appended {
                instance,
                ids,
                after: after_ids,
            })
        }
        (policy, None) => {
            let instance = InstanceId::new();
            tx.insert_instance(instance, Some(name))?;
            tx.bind_unique_name(name, instance)?;
            let ids = insert_plan(tx, plan, instance, Some(name), &[], 0, env)?;
            tx.record_event(EventKind::ContinuationAdmitted {
                instance_id: instance,
                unique_name: Some(name.to_string()),
                policy: Some(policy),
                units: ids.clone(),
            })?;
            Ok(Admission::Enqueued { instance, ids })
        }
    }
}

/// Write planned units into `instance`. Roots depend on `graft` (empty for
/// a fresh instance) and positions are shifted by `offset`.
fn insert_plan(
    tx: &mut TxContext,
    plan: &[Planned],
    instance: InstanceId,
    unique_name: Option<&str>,
    graft: &[WorkId],
    offset: u32,
    env: &Environment,
) -> Result<Vec<WorkId>> {
    let mut ids = Vec::with_capacity(plan.len());
    for planned in plan {
        let mut unit = planned.unit.clone();
        unit.instance_id = instance;
        unit.unique_name = unique_name.map(str::to_string);
        unit.position += offset;

        let upstream: Vec<WorkId> = if planned.upstream.is_empty() {
            graft.to_vec()
        } else {
            planned.upstream.iter().map(|&i| plan[i].unit.id).collect()
        };
        unit.state = if upstream.is_empty() && satisfied(&unit.constraints, env) {
            State::Enqueued
        } else {
            State::Blocked
        };

        tx.insert_unit(&unit, &upstream)?;
        ids.push(unit.id);
    }
    Ok(ids)
}

/// Grafted roots can never run if a leaf they now depend on already failed
/// or was cancelled; settle them right away.
fn settle_graft(tx: &mut TxContext, plan: &[Planned], leaves: &[WorkUnit]) -> Result<()> {
    let failed = leaves.iter().find(|u| u.state == State::Failed);
    let cancelled = leaves.iter().any(|u| u.state == State::Cancelled);
    let roots = plan.iter().filter(|p| p.upstream.is_empty()).map(|p| p.unit.id);

    if let Some(leaf) = failed {
        let reason = format!("upstream {} failed", leaf.id);
        for root in roots {
            fail_tx(tx, root, &reason)?;
        }
    } else if cancelled {
        cancel_tx(tx, roots.collect())?;
    }
    Ok(())
}

fn complete_tx(
    tx: &mut TxContext,
    id: WorkId,
    result: &ExecResult,
    now: DateTime<Utc>,
    default_max: u32,
) -> Result<State> {
    let unit = tx.get_unit(id)?;
    if unit.state != State::Running {
        debug!(work.id = %id, state = %unit.state, "discarding outcome for unit no longer running");
        return Ok(unit.state);
    }

    match result {
        ExecResult::Success(output) => {
            if let Err(e) = output.validate() {
                fail_tx(tx, id, &format!("output rejected: {e}"))?;
                return Ok(State::Failed);
            }
            tx.set_output(id, output)?;
            tx.update_state(id, State::Succeeded)?;
            tx.record_event(EventKind::OutputRecorded {
                id,
                keys: output.len(),
            })?;
            Ok(State::Succeeded)
        }
        ExecResult::Failure(reason) => {
            fail_tx(tx, id, reason)?;
            Ok(State::Failed)
        }
        ExecResult::Retry => {
            let max = unit.max_attempts.unwrap_or(default_max);
            if unit.attempts >= max {
                fail_tx(
                    tx,
                    id,
                    &format!("exhausted {}/{} attempts", unit.attempts, max),
                )?;
                return Ok(State::Failed);
            }

            let delay = unit.backoff.delay_for(unit.attempts);
            tx.update_state(id, State::Retrying)?;
            tx.set_run_at(id, after(now, delay))?;
            tx.record_event(EventKind::RetryScheduled {
                id,
                attempt: unit.attempts,
                delay_ms: delay.as_millis() as u64,
            })?;
            metrics::work_retries().add(1, &[KeyValue::new("kind", unit.kind.clone())]);
            info!(
                work.id = %id,
                kind = %unit.kind,
                attempt = unit.attempts,
                delay_ms = delay.as_millis() as u64,
                "retry scheduled"
            );
            Ok(State::Retrying)
        }
    }
}

/// Fail `id` and every non-terminal unit downstream of it.
fn fail_tx(tx: &mut TxContext, id: WorkId, reason: &str) -> Result<()> {
    tx.set_failure(id, reason)?;
    tx.update_state(id, State::Failed)?;
    tx.record_event(EventKind::WorkFailed {
        id,
        reason: reason.to_string(),
    })?;
    warn!(work.id = %id, reason, "work failed");

    let upstream_reason = format!("upstream {id} failed");
    let mut stack = tx.downstream(id)?;
    let mut seen = HashSet::new();
    while let Some(next) = stack.pop() {
        if !seen.insert(next) {
            continue;
        }
        let unit = tx.get_unit(next)?;
        if !unit.state.can_transition_to(State::Failed) || unit.state == State::Running {
            continue;
        }
        tx.set_failure(next, &upstream_reason)?;
        tx.update_state(next, State::Failed)?;
        tx.record_event(EventKind::WorkFailed {
            id: next,
            reason: upstream_reason.clone(),
        })?;
        stack.extend(tx.downstream(next)?);
    }
    Ok(())
}

/// Cancel `roots` and their transitive downstream. Terminal units and their
/// downstream are skipped. Returns the ids that moved to Cancelled.
fn cancel_tx(tx: &mut TxContext, roots: Vec<WorkId>) -> Result<Vec<WorkId>> {
    let mut cancelled = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<WorkId> = roots.into_iter().rev().collect();

    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let unit = tx.get_unit(id)?;
        if unit.state.is_terminal() {
            continue;
        }
        tx.update_state(id, State::Cancelled)?;
        cancelled.push(id);
        stack.extend(tx.downstream(id)?.into_iter().rev());
    }
    Ok(cancelled)
}

fn instance_active(tx: &TxContext, instance: InstanceId) -> Result<bool> {
    Ok(tx
        .units_in_instance(instance)?
        .iter()
        .any(|u| !u.state.is_terminal()))
}

fn upstream_succeeded(tx: &TxContext, id: WorkId) -> Result<bool> {
    for up in tx.upstream(id)? {
        if tx.get_unit(up)?.state != State::Succeeded {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Upstream outputs merged in declaration order, then the explicit input.
fn effective_input(tx: &TxContext, unit: &WorkUnit) -> Result<Data> {
    let mut merged = Data::new();
    for up in tx.upstream(unit.id)? {
        if let Some(output) = tx.get_unit(up)?.output {
            merged.merge(&output);
        }
    }
    merged.merge(&unit.input);
    Ok(merged)
}

fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewWorkUnit;

    #[test]
    fn admission_accessors() {
        let instance = InstanceId::new();
        let ids = vec![WorkId::new(), WorkId::new()];
        let kept = Admission::Kept {
            instance,
            existing: ids.clone(),
        };
        assert!(kept.is_kept());
        assert_eq!(kept.instance(), instance);
        assert_eq!(kept.ids(), ids.as_slice());
        assert_eq!(kept.label(), "kept");
    }

    #[test]
    fn plan_keeps_ids_and_positions() {
        let chain = Continuation::new(vec![
            vec![NewWorkUnit::of("cleanup").unwrap()],
            vec![NewWorkUnit::of("blur").unwrap()],
        ])
        .unwrap();
        let ids = chain.unit_ids();
        let now = Utc::now();

        let planned = plan(chain, now);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].unit.id, ids[0]);
        assert_eq!(planned[1].upstream, vec![0]);
        assert_eq!(planned[1].unit.position, 1);
        assert_eq!(planned[0].unit.run_at, now);
    }

    #[test]
    fn run_at_saturates() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::from_secs(10)), now + chrono::Duration::seconds(10));
        assert_eq!(after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
