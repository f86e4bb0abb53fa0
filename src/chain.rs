//! Continuations: ordered and parallel compositions of work units.
//!
//! A continuation is a value; building one runs nothing. Each stage-group
//! depends on every unit of the group before it, and `combine` joins the
//! tails of several continuations into one downstream stage.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::model::{ExistingWorkPolicy, NewWorkUnit, WorkId};

/// Unique name and collision policy of a continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueWork {
    pub name: String,
    pub policy: ExistingWorkPolicy,
}

/// One unit in a continuation together with its direct upstream units.
#[derive(Debug)]
pub(crate) struct ChainNode {
    pub unit: NewWorkUnit,
    /// Indices into `Continuation::nodes`, in declaration order.
    pub upstream: Vec<usize>,
    pub position: u32,
}

/// An ordered/parallel composition of work units forming a dependency chain.
#[derive(Debug)]
pub struct Continuation {
    pub(crate) unique: Option<UniqueWork>,
    pub(crate) nodes: Vec<ChainNode>,
    /// Indices of the last stage-group.
    pub(crate) tails: Vec<usize>,
}

impl Continuation {
    /// Build a continuation from stage-groups run in order. Units within a
    /// group run in parallel.
    pub fn new(stages: Vec<Vec<NewWorkUnit>>) -> Result<Self> {
        let mut stages = stages.into_iter();
        let first = stages
            .next()
            .ok_or_else(|| Error::InvalidChain("a continuation needs at least one stage".into()))?;

        let mut chain = Self {
            unique: None,
            nodes: Vec::new(),
            tails: Vec::new(),
        };
        chain.push_stage(first, Vec::new())?;
        for stage in stages {
            chain = chain.then(stage)?;
        }
        Ok(chain)
    }

    /// A single-unit continuation.
    pub fn single(unit: NewWorkUnit) -> Result<Self> {
        Self::new(vec![vec![unit]])
    }

    /// Same as [`Continuation::new`], admitted under `name` with `policy`.
    pub fn unique(
        name: impl Into<String>,
        policy: ExistingWorkPolicy,
        stages: Vec<Vec<NewWorkUnit>>,
    ) -> Result<Self> {
        Self::new(stages)?.named(name, policy)
    }

    /// Append a stage-group that depends on every unit of the current tail.
    pub fn then(mut self, stage: Vec<NewWorkUnit>) -> Result<Self> {
        let upstream = std::mem::take(&mut self.tails);
        self.push_stage(stage, upstream)?;
        Ok(self)
    }

    /// Join several continuations into one: `stage` depends on the tails of
    /// every chain in `chains`, in the order given.
    ///
    /// The joined chains must not carry unique names of their own; name the
    /// result instead.
    pub fn combine(chains: Vec<Continuation>, stage: Vec<NewWorkUnit>) -> Result<Self> {
        if chains.is_empty() {
            return Err(Error::InvalidChain("combine needs at least one chain".into()));
        }

        let mut merged = Self {
            unique: None,
            nodes: Vec::new(),
            tails: Vec::new(),
        };
        let mut upstream = Vec::new();

        for chain in chains {
            if let Some(unique) = chain.unique {
                return Err(Error::InvalidChain(format!(
                    "combined chain carries its own unique name '{}'",
                    unique.name
                )));
            }
            let offset = merged.nodes.len();
            upstream.extend(chain.tails.iter().map(|t| t + offset));
            for node in chain.nodes {
                merged.nodes.push(ChainNode {
                    upstream: node.upstream.iter().map(|u| u + offset).collect(),
                    ..node
                });
            }
        }

        merged.push_stage(stage, upstream)?;
        Ok(merged)
    }

    /// Attach a unique name and collision policy.
    pub fn named(mut self, name: impl Into<String>, policy: ExistingWorkPolicy) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidChain("unique name must not be empty".into()));
        }
        self.unique = Some(UniqueWork { name, policy });
        Ok(self)
    }

    pub fn unique_work(&self) -> Option<&UniqueWork> {
        self.unique.as_ref()
    }

    /// Ids of every unit, in declaration order.
    pub fn unit_ids(&self) -> Vec<WorkId> {
        self.nodes.iter().map(|n| n.unit.id).collect()
    }

    /// Ids of the last stage-group.
    pub fn tail_ids(&self) -> Vec<WorkId> {
        self.tails.iter().map(|&i| self.nodes[i].unit.id).collect()
    }

    /// Ids of units with no upstream.
    pub fn root_ids(&self) -> Vec<WorkId> {
        self.nodes
            .iter()
            .filter(|n| n.upstream.is_empty())
            .map(|n| n.unit.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push_stage(&mut self, stage: Vec<NewWorkUnit>, upstream: Vec<usize>) -> Result<()> {
        if stage.is_empty() {
            return Err(Error::InvalidChain("stage-group must not be empty".into()));
        }

        let position = upstream
            .iter()
            .map(|&u| self.nodes[u].position + 1)
            .max()
            .unwrap_or(0);

        let mut seen: HashSet<WorkId> = self.nodes.iter().map(|n| n.unit.id).collect();
        let mut tails = Vec::with_capacity(stage.len());
        for unit in stage {
            if !seen.insert(unit.id) {
                return Err(Error::InvalidChain(format!(
                    "work unit {} appears more than once",
                    unit.id
                )));
            }
            tails.push(self.nodes.len());
            self.nodes.push(ChainNode {
                unit,
                upstream: upstream.clone(),
                position,
            });
        }
        self.tails = tails;
        Ok(())
    }
}
