//! Per node state carried across rounds.
//!
//! The [`NodeStateAgent`] keeps one [`NodeState`] per node. It never combines the states of
//! different nodes, that is the job of the aggregators. The agent also knows the [`StateId`] sent
//! with every work request: a node that is asked to continue from a state it never produced
//! refuses the round.

use std::collections::{btree_map, BTreeMap};

use fedround_core::{model::Parameters, NodeId, RoundNumber, StateId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// The state of a node as known to the controller.
pub struct NodeState {
    /// The id of the last state the node produced in a completed round.
    pub state_id: StateId,
    /// The last completed round the node took part in.
    #[serde(default)]
    pub last_round: Option<RoundNumber>,
    /// The control variate of the node, kept by the `Scaffold` aggregator.
    #[serde(default)]
    pub control_variate: Option<Parameters>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
/// The states of all nodes.
pub struct NodeStateAgent {
    states: BTreeMap<NodeId, NodeState>,
}

impl NodeStateAgent {
    /// Creates an agent without any node state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the state of a node, or the default state if the node is unknown.
    pub fn state_for(&self, node_id: &NodeId) -> NodeState {
        self.states.get(node_id).cloned().unwrap_or_default()
    }

    /// Replaces the state of a node.
    pub fn update(&mut self, node_id: NodeId, state: NodeState) {
        self.states.insert(node_id, state);
    }

    /// Gets the id of the state a node continues from in its next round.
    pub fn expected_state_id(&self, node_id: &NodeId) -> StateId {
        self.states
            .get(node_id)
            .map(|state| state.state_id)
            .unwrap_or(StateId::INITIAL)
    }

    /// Drops the states of the nodes for which `keep` returns `false`.
    pub fn retain(&mut self, mut keep: impl FnMut(&NodeId) -> bool) {
        self.states.retain(|node_id, _| keep(node_id));
    }

    /// Iterates over the known node states in ascending node order.
    pub fn iter(&self) -> btree_map::Iter<'_, NodeId, NodeState> {
        self.states.iter()
    }

    /// Gets the number of known node states.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Checks whether no node state is known.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
