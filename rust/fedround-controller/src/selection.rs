//! Selection of the nodes participating in a round.

use std::{collections::BTreeSet, fmt, sync::Arc};

use displaydoc::Display;
use thiserror::Error;

use fedround_core::{NodeId, RoundNumber};

use crate::{dataset::FederatedDataset, node_state::NodeStateAgent};

/// Errors which can occur during the selection of nodes.
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum SelectionError {
    /// {0} was selected but is not part of the federated dataset.
    InvalidSelection(NodeId),
    /// No node was selected.
    Empty,
}

/// A custom selection of nodes.
pub trait SelectNodes: fmt::Debug + Send + Sync {
    /// Gets the name of the selection.
    fn name(&self) -> &str;

    /// Selects the participants of a round among the nodes of the `dataset`.
    fn select(
        &self,
        round_number: RoundNumber,
        dataset: &FederatedDataset,
        node_states: &NodeStateAgent,
    ) -> Vec<NodeId>;
}

#[derive(Debug, Clone)]
/// The strategies to select the participants of a round.
pub enum NodeSelectionStrategy {
    /// Every available node of the federated dataset.
    AllAvailable,
    /// A custom selection, which must be a subset of the federated dataset.
    Custom(Arc<dyn SelectNodes>),
}

impl Default for NodeSelectionStrategy {
    fn default() -> Self {
        NodeSelectionStrategy::AllAvailable
    }
}

impl NodeSelectionStrategy {
    /// Gets the name of the strategy.
    pub fn name(&self) -> &str {
        match self {
            NodeSelectionStrategy::AllAvailable => "AllAvailable",
            NodeSelectionStrategy::Custom(custom) => custom.name(),
        }
    }

    /// Selects the participants of a round.
    ///
    /// The selection is made anew for every round from the current `dataset`.
    ///
    /// # Errors
    /// Fails if a selected node is not part of the `dataset` or if no node is selected.
    pub fn select(
        &self,
        round_number: RoundNumber,
        dataset: &FederatedDataset,
        node_states: &NodeStateAgent,
    ) -> Result<BTreeSet<NodeId>, SelectionError> {
        let selected: BTreeSet<NodeId> = match self {
            NodeSelectionStrategy::AllAvailable => dataset
                .records()
                .filter(|record| record.available)
                .map(|record| record.node_id.clone())
                .collect(),
            NodeSelectionStrategy::Custom(custom) => {
                let selected = custom.select(round_number, dataset, node_states);
                if let Some(unknown) = selected.iter().find(|node_id| !dataset.contains(node_id)) {
                    return Err(SelectionError::InvalidSelection(unknown.clone()));
                }
                selected.into_iter().collect()
            }
        };
        if selected.is_empty() {
            return Err(SelectionError::Empty);
        }
        debug!("selected {} nodes for round {}", selected.len(), round_number);
        Ok(selected)
    }
}
