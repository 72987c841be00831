//! Stochastic controlled averaging.
//!
//! Every node `i` keeps a control variate `c_i` and the controller keeps the global control
//! variate `c`. With `x` the global parameters a round starts from, `y_i` the parameters returned
//! by node `i`, `K` the fixed number of local updates and `lr` the local learning rate, a round
//! updates:
//!
//! ```text
//! x   <- x + server_lr * sum_i w_i (y_i - x)
//! c_i <- c_i - c + (x - y_i) / (K * lr)
//! c   <- c + sum_i (c_i' - c_i) / N
//! ```
//!
//! where `w_i` are the sample count weights of the participants and `N` is the size of the
//! federation. Nodes receive the correction `c - c_i` with their work request.

use fedround_core::{
    message::{AuxVars, TrainingArgs},
    model::Parameters,
    NodeId,
};

use crate::{
    aggregation::{
        check_shapes,
        weights,
        Aggregated,
        AggregationError,
        AggregationInput,
        Aggregator,
        PreconditionError,
    },
    node_state::{NodeState, NodeStateAgent},
};

/// The key of the correction in the auxiliary variables of a work request.
pub const CORRECTION: &str = "correction";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The `Scaffold` aggregator.
pub struct Scaffold {
    /// The global learning rate.
    server_lr: f64,
    /// The global control variate, zero until the first round completes.
    global_control: Option<Parameters>,
}

impl Scaffold {
    pub const NAME: &'static str = "Scaffold";

    /// Creates the aggregator with a zero global control variate.
    pub fn new(server_lr: f64) -> Self {
        Self {
            server_lr,
            global_control: None,
        }
    }

    /// Gets the global control variate.
    pub fn global_control(&self) -> Option<&Parameters> {
        self.global_control.as_ref()
    }

    pub(in crate::aggregation) fn check_preconditions(
        &self,
        training_args: &TrainingArgs,
        secure_aggregation: bool,
    ) -> Result<(), PreconditionError> {
        if secure_aggregation {
            return Err(PreconditionError::SecureAggregation(Self::NAME));
        }
        match training_args.num_updates {
            Some(n) if n > 0 => {}
            _ => return Err(PreconditionError::FixedIterations(Self::NAME)),
        }
        match training_args.learning_rate {
            Some(lr) if lr.is_finite() && lr > 0. => Ok(()),
            _ => Err(PreconditionError::LearningRate(Self::NAME)),
        }
    }

    fn control_or_zero(control: Option<&Parameters>, global: &Parameters) -> Parameters {
        control.cloned().unwrap_or_else(|| global.zeros_like())
    }

    pub(in crate::aggregation) fn aux_vars_for(
        &self,
        node_id: &NodeId,
        node_states: &NodeStateAgent,
        global: &Parameters,
    ) -> Result<AuxVars, AggregationError> {
        let c = Self::control_or_zero(self.global_control.as_ref(), global);
        let c_i = Self::control_or_zero(node_states.state_for(node_id).control_variate.as_ref(), global);
        let correction = c
            .zip_with(&c_i, |c, c_i| c - c_i)
            .map_err(|error| AggregationError::ShapeMismatch(node_id.clone(), error))?;

        let mut aux_vars = AuxVars::new();
        aux_vars.insert(CORRECTION.into(), correction);
        Ok(aux_vars)
    }

    pub(in crate::aggregation) fn aggregate(
        &self,
        input: &AggregationInput<'_>,
    ) -> Result<Aggregated, AggregationError> {
        let num_updates = input
            .training_args
            .num_updates
            .filter(|n| *n > 0)
            .ok_or(AggregationError::MissingTrainingArg("num_updates"))?;
        let lr = input
            .training_args
            .learning_rate
            .ok_or(AggregationError::MissingTrainingArg("learning_rate"))?;
        let step = num_updates as f64 * lr;

        let weights = weights(input.results)?;
        check_shapes(input.results, input.previous)?;

        let x = input.previous;
        let c = Self::control_or_zero(self.global_control.as_ref(), x);
        let mut global = x.clone();
        let mut control_delta = x.zeros_like();
        let mut node_states = std::collections::BTreeMap::new();
        let federation_size = input.federation_size.max(input.results.len()) as f64;

        for (node_id, update) in input.results.iter() {
            let shape_error = |error| AggregationError::ShapeMismatch(node_id.clone(), error);
            let weight = weights.get(node_id).copied().unwrap_or_default();
            let y = &update.params;

            let delta = y.zip_with(x, |y, x| y - x).map_err(shape_error)?;
            global
                .add_scaled(self.server_lr * weight, &delta)
                .map_err(shape_error)?;

            let prior = input.node_states.state_for(node_id);
            let c_i = Self::control_or_zero(prior.control_variate.as_ref(), x);
            let drift = x.zip_with(y, |x, y| (x - y) / step).map_err(shape_error)?;
            let c_i_new = c_i
                .zip_with(&c, |c_i, c| c_i - c)
                .and_then(|p| p.zip_with(&drift, |a, b| a + b))
                .map_err(shape_error)?;

            let change = c_i_new.zip_with(&c_i, |new, old| new - old).map_err(shape_error)?;
            control_delta
                .add_scaled(1. / federation_size, &change)
                .map_err(shape_error)?;

            node_states.insert(
                node_id.clone(),
                NodeState {
                    control_variate: Some(c_i_new),
                    ..prior
                },
            );
        }

        let global_control = c
            .zip_with(&control_delta, |c, d| c + d)
            .map_err(|error| AggregationError::ShapeMismatch(NodeId::from("controller"), error))?;

        Ok(Aggregated {
            global,
            node_states,
            aggregator: Aggregator::Scaffold(Scaffold {
                server_lr: self.server_lr,
                global_control: Some(global_control),
            }),
        })
    }
}
