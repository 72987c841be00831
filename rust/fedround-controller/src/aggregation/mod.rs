//! Aggregation of the results of a round.
//!
//! An [`Aggregator`] combines the parameters returned by the participants of a round into new
//! global parameters. Aggregation is a pure function of its inputs: the aggregator returns its
//! successor state together with the new global parameters and node states, and the controller
//! commits all of them at once when the round completes.
//!
//! The aggregated parameters are finally passed through the [`ServerOptimizer`] of the
//! experiment, which is the identity unless configured otherwise.
//!
//! Every reduction over the participants visits them in ascending node order, hence aggregating
//! the same set of results always yields bit-for-bit identical parameters, regardless of the order
//! in which the replies arrived.

mod fedavg;
pub mod optimizer;
mod scaffold;

use std::collections::BTreeMap;

use displaydoc::Display;
use thiserror::Error;

use fedround_core::{
    message::{AuxVars, TrainingArgs},
    model::{Parameters, ShapeError},
    NodeId,
};

pub use self::{
    fedavg::FedAverage,
    optimizer::ServerOptimizer,
    scaffold::{Scaffold, CORRECTION},
};
use crate::{
    node_state::{NodeState, NodeStateAgent},
    settings::{AggregatorKind, AggregatorSettings},
};

/// Errors which can occur during the aggregation of a round.
#[derive(Debug, Display, Error, PartialEq)]
pub enum AggregationError {
    /// There are no results to aggregate.
    NoResults,
    /// The total sample count of the participants is zero.
    ZeroWeight,
    /// The total sample count of the participants overflows.
    WeightOverflow,
    /// The parameters of {0} are incompatible: {1}.
    ShapeMismatch(NodeId, ShapeError),
    /// The aggregated parameters are not finite.
    NonFinite,
    /// The state of the server optimizer doesn't fit the parameters: {0}.
    OptimizerState(ShapeError),
    /// The training arguments lack `{0}`.
    MissingTrainingArg(&'static str),
    /// {0} does not support secure aggregation.
    SecureAggregationUnsupported(&'static str),
}

/// Errors related to aggregator preconditions, checked before a round is dispatched.
#[derive(Debug, Display, Error, PartialEq)]
pub enum PreconditionError {
    /// {0} requires a fixed number of local updates (`num_updates`).
    FixedIterations(&'static str),
    /// {0} requires a positive local learning rate.
    LearningRate(&'static str),
    /// {0} can't be combined with secure aggregation.
    SecureAggregation(&'static str),
    /// The hyperparameters of the {0} server optimizer are invalid.
    Optimizer(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
/// The result of one node.
pub struct NodeUpdate {
    pub params: Parameters,
    pub sample_count: u64,
    pub aux_vars: AuxVars,
}

/// The inputs of an aggregation.
pub struct AggregationInput<'a> {
    /// The results of the participants, ordered by node.
    pub results: &'a BTreeMap<NodeId, NodeUpdate>,
    /// The global parameters the participants started from.
    pub previous: &'a Parameters,
    /// The node states before the round.
    pub node_states: &'a NodeStateAgent,
    /// The training arguments of the round.
    pub training_args: &'a TrainingArgs,
    /// The number of nodes in the federation, participating or not.
    pub federation_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
/// The outputs of an aggregation.
pub struct Aggregated {
    /// The new global parameters.
    pub global: Parameters,
    /// The new states of the participants.
    pub node_states: BTreeMap<NodeId, NodeState>,
    /// The successor state of the aggregator.
    pub aggregator: Aggregator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The aggregators.
pub enum Aggregator {
    FedAverage(FedAverage),
    Scaffold(Scaffold),
}

impl Default for Aggregator {
    fn default() -> Self {
        Aggregator::FedAverage(FedAverage)
    }
}

impl From<&AggregatorSettings> for Aggregator {
    fn from(settings: &AggregatorSettings) -> Self {
        match settings.kind {
            AggregatorKind::FedAverage => Aggregator::FedAverage(FedAverage),
            AggregatorKind::Scaffold => Aggregator::Scaffold(Scaffold::new(settings.server_lr)),
        }
    }
}

impl Aggregator {
    /// Gets the name of the aggregator.
    pub fn name(&self) -> &'static str {
        match self {
            Aggregator::FedAverage(_) => FedAverage::NAME,
            Aggregator::Scaffold(_) => Scaffold::NAME,
        }
    }

    /// Checks that the experiment configuration satisfies the preconditions of the aggregator.
    pub fn check_preconditions(
        &self,
        training_args: &TrainingArgs,
        secure_aggregation: bool,
    ) -> Result<(), PreconditionError> {
        match self {
            Aggregator::FedAverage(_) => Ok(()),
            Aggregator::Scaffold(scaffold) => {
                scaffold.check_preconditions(training_args, secure_aggregation)
            }
        }
    }

    /// Creates the auxiliary variables sent to a node along with its work request.
    pub fn aux_vars_for(
        &self,
        node_id: &NodeId,
        node_states: &NodeStateAgent,
        global: &Parameters,
    ) -> Result<AuxVars, AggregationError> {
        match self {
            Aggregator::FedAverage(_) => Ok(AuxVars::new()),
            Aggregator::Scaffold(scaffold) => scaffold.aux_vars_for(node_id, node_states, global),
        }
    }

    /// Aggregates the results of the participants of a round.
    pub fn aggregate(&self, input: AggregationInput<'_>) -> Result<Aggregated, AggregationError> {
        if input.results.is_empty() {
            return Err(AggregationError::NoResults);
        }
        let aggregated = match self {
            Aggregator::FedAverage(fedavg) => fedavg.aggregate(&input),
            Aggregator::Scaffold(scaffold) => scaffold.aggregate(&input),
        }?;
        if !aggregated.global.is_finite() {
            return Err(AggregationError::NonFinite);
        }
        Ok(aggregated)
    }

    /// Completes a secure aggregation round whose weighted mean was recovered by unmasking.
    pub fn aggregate_secure(
        &self,
        mean: Parameters,
        participants: impl IntoIterator<Item = NodeId>,
        node_states: &NodeStateAgent,
    ) -> Result<Aggregated, AggregationError> {
        match self {
            Aggregator::FedAverage(_) => Ok(Aggregated {
                global: mean,
                node_states: carry_over(participants, node_states),
                aggregator: self.clone(),
            }),
            Aggregator::Scaffold(_) => Err(AggregationError::SecureAggregationUnsupported(
                Scaffold::NAME,
            )),
        }
    }
}

/// Computes the weight of every participant, i.e. its share of the total sample count.
///
/// # Errors
/// Fails if there are no results or the total sample count is zero or overflows.
pub fn weights(
    results: &BTreeMap<NodeId, NodeUpdate>,
) -> Result<BTreeMap<NodeId, f64>, AggregationError> {
    if results.is_empty() {
        return Err(AggregationError::NoResults);
    }
    let total = results
        .values()
        .try_fold(0_u64, |total, update| total.checked_add(update.sample_count))
        .ok_or(AggregationError::WeightOverflow)?;
    if total == 0 {
        return Err(AggregationError::ZeroWeight);
    }
    Ok(results
        .iter()
        .map(|(node_id, update)| (node_id.clone(), update.sample_count as f64 / total as f64))
        .collect())
}

/// Checks that the parameters of every participant have the layout of `reference`.
fn check_shapes(
    results: &BTreeMap<NodeId, NodeUpdate>,
    reference: &Parameters,
) -> Result<(), AggregationError> {
    results.iter().try_for_each(|(node_id, update)| {
        reference
            .check_shape(&update.params)
            .map_err(|error| AggregationError::ShapeMismatch(node_id.clone(), error))
    })
}

/// Keeps the current state of every participant.
fn carry_over(
    participants: impl IntoIterator<Item = NodeId>,
    node_states: &NodeStateAgent,
) -> BTreeMap<NodeId, NodeState> {
    participants
        .into_iter()
        .map(|node_id| {
            let state = node_states.state_for(&node_id);
            (node_id, state)
        })
        .collect()
}
