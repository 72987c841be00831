//! Helpers for building parameters and messages in tests.

use crate::{
    message::{AuxVars, ReplyParams, Timing, TrainingArgs, WorkReply, WorkRequest},
    model::Parameters,
    ExperimentId,
    NodeId,
    ResearcherId,
    RoundNumber,
    StateId,
};

/// The experiment every helper message belongs to.
pub const EXPERIMENT_ID: &str = "experiment-0";

/// Creates parameters with a two value `weight` layer and a one value `bias`
/// layer, every value set to `value`.
pub fn parameters(value: f64) -> Parameters {
    Parameters::from_layers(vec![("weight", vec![value; 2]), ("bias", vec![value])])
}

/// Creates a training request for round `round_number` addressed to `node_id`.
pub fn work_request(node_id: &str, round_number: RoundNumber) -> WorkRequest {
    WorkRequest {
        researcher_id: ResearcherId::from("researcher-0"),
        experiment_id: ExperimentId::from(EXPERIMENT_ID),
        round_number,
        request_id: round_number,
        node_id: NodeId::from(node_id),
        dataset_id: format!("dataset-{}", node_id),
        state_id: StateId::from(round_number),
        params: parameters(0.0),
        training_args: TrainingArgs::default(),
        model_args: Default::default(),
        aux_vars: AuxVars::new(),
        secagg: None,
    }
}

/// Creates a successful reply to [`work_request()`] whose parameters are all `value`.
pub fn work_reply(
    node_id: &str,
    round_number: RoundNumber,
    value: f64,
    sample_count: u64,
) -> WorkReply {
    WorkReply::success(
        &work_request(node_id, round_number),
        ReplyParams::Plain(parameters(value)),
        sample_count,
        AuxVars::new(),
        Timing::default(),
    )
}
