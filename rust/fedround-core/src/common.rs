//! Identifiers shared by the controller and the nodes.

use std::{collections::BTreeSet, fmt};

use derive_more::{AsRef, Display, From};
use thiserror::Error;

/// The number of a round. Rounds are numbered from zero.
pub type RoundNumber = u64;

#[derive(
    AsRef, Clone, Debug, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
/// An opaque identifier of a node.
pub struct NodeId(String);

impl NodeId {
    /// Creates a node identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Gets the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(
    AsRef, Clone, Debug, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
/// An identifier of an experiment.
pub struct ExperimentId(String);

impl ExperimentId {
    /// Creates an experiment identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Gets the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExperimentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(
    AsRef, Clone, Debug, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
/// An identifier of the researcher driving an experiment.
pub struct ResearcherId(String);

impl ResearcherId {
    /// Creates a researcher identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for ResearcherId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(
    Clone, Copy, Debug, Default, Eq, From, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
/// A token identifying a local state of a node.
///
/// Every node starts from [`StateId::INITIAL`]. A work request carries the id of the state the
/// node must continue from, and completing the request produces the [`successor`] of that state.
/// The node keeps the states it produced in a [`StateLedger`], which lets it detect that it is
/// asked to continue from a state it never produced.
///
/// [`successor`]: StateId::successor
pub struct StateId(u64);

impl StateId {
    /// The state of a node that has not completed any round yet.
    pub const INITIAL: StateId = StateId(0);

    /// Gets the id of the state produced by continuing from this one.
    pub fn successor(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Gets the raw value of the id.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("the node never produced {requested}, its latest state is {latest}")]
/// A node was asked to continue from a state it never produced.
pub struct StateMismatch {
    pub requested: StateId,
    pub latest: StateId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The states produced by a node, kept on the node side.
///
/// A state produced in a round which later failed on the controller side is kept as well, the
/// controller then asks the node to retry from the previous state.
pub struct StateLedger {
    produced: BTreeSet<StateId>,
}

impl Default for StateLedger {
    fn default() -> Self {
        Self {
            produced: std::iter::once(StateId::INITIAL).collect(),
        }
    }
}

impl StateLedger {
    /// Creates a ledger holding the initial state only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that the node holds the `requested` state.
    pub fn check(&self, requested: StateId) -> Result<(), StateMismatch> {
        if self.produced.contains(&requested) {
            Ok(())
        } else {
            Err(StateMismatch {
                requested,
                latest: self.latest(),
            })
        }
    }

    /// Records the state produced by continuing from `from`, and returns its id.
    pub fn record(&mut self, from: StateId) -> StateId {
        let produced = from.successor();
        self.produced.insert(produced);
        produced
    }

    /// Gets the latest state produced.
    pub fn latest(&self) -> StateId {
        self.produced
            .iter()
            .next_back()
            .copied()
            .unwrap_or(StateId::INITIAL)
    }
}
