//! Core data model.
//!
//! A work unit is one schedulable task. It is described by a [`WorkSpec`],
//! sealed into a [`NewWorkUnit`] (which fixes its id), placed in a
//! continuation, and from admission on lives in the ledger as a [`WorkUnit`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::constraint::Constraints;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for work unit IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl std::str::FromStr for WorkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(WorkId)
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

/// One admitted continuation in the ledger. APPEND grafts onto an existing
/// instance; every other admission creates a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Ready to run once a worker is free.
    Enqueued,
    /// Waiting on upstream units or on constraints.
    Blocked,
    /// Executable in progress.
    Running,
    /// Asked for a retry, waiting out its backoff.
    Retrying,
    /// Done, output recorded. Terminal.
    Succeeded,
    /// Failed or failed upstream. Terminal.
    Failed,
    /// Cancelled explicitly or upstream. Terminal.
    Cancelled,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Enqueued, Blocked)         // constraints stopped holding
                | (Enqueued, Running)
                | (Blocked, Enqueued)   // upstream done, constraints hold
                | (Blocked, Running)
                | (Blocked, Failed)     // upstream failed
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Enqueued, Cancelled)
                | (Blocked, Cancelled)
                | (Running, Cancelled)
                | (Retrying, Cancelled)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Failed | State::Cancelled)
    }

    pub const ACTIVE: [State; 4] = [
        State::Enqueued,
        State::Blocked,
        State::Running,
        State::Retrying,
    ];
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Enqueued => "enqueued",
            State::Blocked => "blocked",
            State::Running => "running",
            State::Retrying => "retrying",
            State::Succeeded => "succeeded",
            State::Failed => "failed",
            State::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enqueued" => Ok(State::Enqueued),
            "blocked" => Ok(State::Blocked),
            "running" => Ok(State::Running),
            "retrying" => Ok(State::Retrying),
            "succeeded" => Ok(State::Succeeded),
            "failed" => Ok(State::Failed),
            "cancelled" => Ok(State::Cancelled),
            _ => Err(Error::Corrupt(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// Largest serialized input or output a unit may carry.
pub const MAX_DATA_BYTES: usize = 10 * 1024;

/// A primitive value in a unit's input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Key/value payload passed into and out of executables. Keys are kept
/// sorted so merged payloads serialize deterministically.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Data(BTreeMap<String, Value>);

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(Value::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Overlay `other` onto self; keys in `other` win.
    pub fn merge(&mut self, other: &Data) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(serde_json::to_vec(self)?.len())
    }

    /// Reject payloads the ledger could not read back: non-finite floats
    /// and anything over [`MAX_DATA_BYTES`].
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some((key, _)) = self
            .0
            .iter()
            .find(|(_, v)| matches!(v, Value::Float(f) if !f.is_finite()))
        {
            return Err(Error::InvalidData(format!("{key} is not a finite number")));
        }
        let size = self.encoded_len()?;
        if size > MAX_DATA_BYTES {
            return Err(Error::DataTooLarge {
                size,
                limit: MAX_DATA_BYTES,
            });
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Data {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ---------------------------------------------------------------------------
// Unique work
// ---------------------------------------------------------------------------

/// What to do when a continuation is admitted under a name that already has
/// an active instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingWorkPolicy {
    /// Leave the active instance alone; admission is a no-op.
    Keep,
    /// Cancel the active instance, then admit.
    Replace,
    /// Graft the new continuation after the active instance's leaves.
    Append,
}

impl std::fmt::Display for ExistingWorkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExistingWorkPolicy::Keep => "keep",
            ExistingWorkPolicy::Replace => "replace",
            ExistingWorkPolicy::Append => "append",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExistingWorkPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "keep" => Ok(ExistingWorkPolicy::Keep),
            "replace" => Ok(ExistingWorkPolicy::Replace),
            "append" => Ok(ExistingWorkPolicy::Append),
            _ => Err(Error::Other(format!("unknown existing work policy: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Plain description of a unit of work. Build one with struct update syntax
/// over [`WorkSpec::new`], then seal it with [`NewWorkUnit::new`].
#[derive(Debug, Clone)]
pub struct WorkSpec {
    /// Which registered executable runs this unit.
    pub kind: String,
    /// Explicit input. Wins over any key propagated from upstream.
    pub input: Data,
    pub tags: BTreeSet<String>,
    pub constraints: Constraints,
    pub backoff: Backoff,
    /// Minimum time between admission and first dispatch.
    pub initial_delay: Duration,
    /// Attempt cap. None = scheduler default.
    pub max_attempts: Option<u32>,
}

impl WorkSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            input: Data::new(),
            tags: BTreeSet::new(),
            constraints: Constraints::default(),
            backoff: Backoff::default(),
            initial_delay: Duration::ZERO,
            max_attempts: None,
        }
    }
}

/// A validated work unit with a fixed id, not yet admitted.
///
/// Not `Clone`: a unit is moved into exactly one continuation.
#[derive(Debug)]
pub struct NewWorkUnit {
    pub(crate) id: WorkId,
    pub(crate) spec: WorkSpec,
}

impl NewWorkUnit {
    /// Validate `spec` and assign an id. The backoff delay is raised to the
    /// floor if needed.
    pub fn new(mut spec: WorkSpec) -> Result<Self> {
        if spec.kind.trim().is_empty() {
            return Err(Error::InvalidWork("kind must not be empty".to_string()));
        }
        if spec.max_attempts == Some(0) {
            return Err(Error::InvalidWork("max_attempts must be at least 1".to_string()));
        }
        spec.input.validate()?;
        spec.backoff = Backoff::new(spec.backoff.policy, spec.backoff.delay);

        Ok(Self {
            id: WorkId::new(),
            spec,
        })
    }

    /// Shorthand for a unit with nothing but a kind.
    pub fn of(kind: impl Into<String>) -> Result<Self> {
        Self::new(WorkSpec::new(kind))
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn spec(&self) -> &WorkSpec {
        &self.spec
    }
}

// ---------------------------------------------------------------------------
// Ledger snapshot
// ---------------------------------------------------------------------------

/// A work unit as recorded in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: WorkId,
    pub instance_id: InstanceId,
    /// Unique name the instance was admitted under, if any.
    pub unique_name: Option<String>,
    pub kind: String,
    /// Stage depth within the instance, 0 for roots.
    pub position: u32,
    pub state: State,
    pub tags: BTreeSet<String>,
    /// Explicit input as declared.
    pub input: Data,
    /// Input the executable actually received, set at dispatch.
    pub effective_input: Option<Data>,
    /// Set once, only on success.
    pub output: Option<Data>,
    pub constraints: Constraints,
    pub backoff: Backoff,
    pub max_attempts: Option<u32>,
    /// Number of times the unit has entered Running.
    pub attempts: u32,
    /// Not dispatched before this instant.
    pub run_at: DateTime<Utc>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn terminal_states_have_no_exits() {
        use State::*;
        let all = [Enqueued, Blocked, Running, Retrying, Succeeded, Failed, Cancelled];
        for from in [Succeeded, Failed, Cancelled] {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn every_active_state_can_be_cancelled() {
        for s in State::ACTIVE {
            assert!(!s.is_terminal());
            assert!(s.can_transition_to(State::Cancelled));
        }
    }

    #[test]
    fn state_round_trips_through_text() {
        for s in State::ACTIVE {
            assert_eq!(State::from_str(&s.to_string()).unwrap(), s);
        }
        assert!(State::from_str("dead").is_err());
    }

    #[test]
    fn merge_overlays_later_keys() {
        let mut base = Data::new().with("uri", "a").with("level", 1i64);
        base.merge(&Data::new().with("uri", "b"));
        assert_eq!(base.get_str("uri"), Some("b"));
        assert_eq!(base.get_int("level"), Some(1));
    }

    #[test]
    fn data_serializes_as_flat_object() {
        let data = Data::new().with("b", true).with("a", "x").with("n", 2.5);
        let json = serde_json::to_string(&data).unwrap();
        assert_eq!(json, r#"{"a":"x","b":true,"n":2.5}"#);
        let back: Data = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn oversized_input_is_rejected() {
        let spec = WorkSpec {
            input: Data::new().with("blob", "x".repeat(MAX_DATA_BYTES)),
            ..WorkSpec::new("blur")
        };
        assert!(matches!(
            NewWorkUnit::new(spec),
            Err(Error::DataTooLarge { .. })
        ));
    }

    #[test]
    fn non_finite_input_is_rejected() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let spec = WorkSpec {
                input: Data::new().with("ratio", bad),
                ..WorkSpec::new("blur")
            };
            assert!(matches!(NewWorkUnit::new(spec), Err(Error::InvalidData(_))));
        }
    }

    #[test]
    fn empty_kind_is_rejected() {
        assert!(matches!(
            NewWorkUnit::of("  "),
            Err(Error::InvalidWork(_))
        ));
    }

    #[test]
    fn backoff_is_floored_at_construction() {
        let spec = WorkSpec {
            backoff: Backoff {
                policy: crate::backoff::BackoffPolicy::Linear,
                delay: Duration::from_secs(1),
            },
            ..WorkSpec::new("blur")
        };
        let unit = NewWorkUnit::new(spec).unwrap();
        assert_eq!(unit.spec().backoff.delay, crate::backoff::MIN_BACKOFF);
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!(
            ExistingWorkPolicy::from_str("REPLACE").unwrap(),
            ExistingWorkPolicy::Replace
        );
    }
}
