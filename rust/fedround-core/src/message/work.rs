//! Training requests and replies.
//!
//! See the [message module] documentation since this is a private module anyways.
//!
//! [message module]: crate::message

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    crypto::{ExchangeKeyPair, PublicExchangeKey},
    mask::{MaskConfig, MaskObject, Masker, MaskingError},
    model::Parameters,
    ExperimentId,
    NodeId,
    ResearcherId,
    RoundNumber,
    StateId,
};

/// Auxiliary variables exchanged with stateful aggregators, keyed by name.
pub type AuxVars = BTreeMap<String, Parameters>;

/// Training metrics reported by a node, keyed by name.
pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// The local training configuration sent to every node.
pub struct TrainingArgs {
    /// The fixed number of local iterations, if any.
    #[serde(default)]
    pub num_updates: Option<u64>,
    /// The number of local epochs, if the iterations are not fixed.
    #[serde(default)]
    pub epochs: Option<u64>,
    /// The local learning rate.
    #[serde(default)]
    pub learning_rate: Option<f64>,
    /// The local batch size.
    #[serde(default)]
    pub batch_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Secure aggregation parameters of a training request.
pub struct SecaggArguments {
    /// The session the node joined during the setup phase.
    pub session_id: String,
    /// The exact set of parties whose masks cancel.
    pub parties: Vec<NodeId>,
    /// The public keys the parties handed in when they joined the session.
    pub public_keys: BTreeMap<NodeId, PublicExchangeKey>,
    /// The nonce of the round, every party derives its masks for it.
    pub nonce: u64,
    /// The value every party encodes as verification element.
    pub random: f64,
    /// The absolute bound on every value before masking.
    pub clipping_range: f64,
    /// The number of fractional bits of the fixed point representation.
    pub fixed_point_bits: u8,
}

impl SecaggArguments {
    /// Gets the masking configuration.
    pub fn mask_config(&self) -> MaskConfig {
        MaskConfig {
            clipping_range: self.clipping_range,
            fixed_point_bits: self.fixed_point_bits,
        }
    }

    /// Creates the masker of party `me`, which joined the session with the `keys`.
    ///
    /// # Errors
    /// Fails if `me` is not a party or the key agreement with a peer fails.
    pub fn masker(&self, me: &NodeId, keys: &ExchangeKeyPair) -> Result<Masker, MaskingError> {
        let session_keys = keys.session_keys(me, &self.parties, &self.public_keys)?;
        Masker::new(self.mask_config(), me, &self.parties, session_keys)
    }

    /// Masks the weighted `values` of party `me` for this round.
    ///
    /// # Errors
    /// See [`masker()`].
    ///
    /// [`masker()`]: SecaggArguments::masker
    pub fn mask(
        &self,
        me: &NodeId,
        keys: &ExchangeKeyPair,
        weight: u64,
        values: &[f64],
    ) -> Result<MaskObject, MaskingError> {
        Ok(self
            .masker(me, keys)?
            .mask(self.nonce, weight, values, self.random))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A request to train on the local dataset for one round.
pub struct WorkRequest {
    pub researcher_id: ResearcherId,
    pub experiment_id: ExperimentId,
    pub round_number: RoundNumber,
    /// Identifies this attempt of the round, a retry of the round gets a new one.
    pub request_id: u64,
    pub node_id: NodeId,
    pub dataset_id: String,
    /// The state the node must continue from.
    pub state_id: StateId,
    /// The global parameters to start from.
    pub params: Parameters,
    pub training_args: TrainingArgs,
    #[serde(default)]
    pub model_args: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub aux_vars: AuxVars,
    #[serde(default)]
    pub secagg: Option<SecaggArguments>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Updated parameters returned by a node.
pub enum ReplyParams {
    /// Parameters in the clear.
    Plain(Parameters),
    /// Weighted and masked parameters of a secure aggregation round.
    Masked(MaskObject),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Timing reported by a node, in seconds.
pub struct Timing {
    /// Wall clock time spent training.
    #[serde(default)]
    pub rtime_training: f64,
    /// Processor time spent training.
    #[serde(default)]
    pub ptime_training: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    Training,
    StateMismatch,
    Setup,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// An error reported by a node.
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors related to internally inconsistent replies.
pub enum ReplyError {
    #[error("a successful reply carries no parameters")]
    MissingParams,

    #[error("a successful reply carries an error")]
    UnexpectedError,

    #[error("a failed reply carries no error")]
    MissingError,

    #[error("a failed reply carries parameters")]
    UnexpectedParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// The outcome of a training request.
pub struct WorkReply {
    pub experiment_id: ExperimentId,
    pub round_number: RoundNumber,
    /// The request id of the request, echoed back.
    pub request_id: u64,
    pub node_id: NodeId,
    /// The state id of the request, echoed back.
    pub state_id: StateId,
    pub success: bool,
    #[serde(default)]
    pub params: Option<ReplyParams>,
    #[serde(default)]
    pub sample_count: u64,
    #[serde(default)]
    pub aux_vars: AuxVars,
    #[serde(default)]
    pub timing: Timing,
    /// The training metrics of the round, e.g. the final loss.
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub error: Option<NodeError>,
}

impl WorkReply {
    /// Creates a successful reply to the `request`.
    pub fn success(
        request: &WorkRequest,
        params: ReplyParams,
        sample_count: u64,
        aux_vars: AuxVars,
        timing: Timing,
    ) -> Self {
        Self {
            experiment_id: request.experiment_id.clone(),
            round_number: request.round_number,
            request_id: request.request_id,
            node_id: request.node_id.clone(),
            state_id: request.state_id,
            success: true,
            params: Some(params),
            sample_count,
            aux_vars,
            timing,
            metrics: Metrics::new(),
            error: None,
        }
    }

    /// Creates a failed reply to the `request`.
    pub fn failure(request: &WorkRequest, error: NodeError) -> Self {
        Self {
            experiment_id: request.experiment_id.clone(),
            round_number: request.round_number,
            request_id: request.request_id,
            node_id: request.node_id.clone(),
            state_id: request.state_id,
            success: false,
            params: None,
            sample_count: 0,
            aux_vars: AuxVars::new(),
            timing: Timing::default(),
            metrics: Metrics::new(),
            error: Some(error),
        }
    }

    /// Attaches training metrics to the reply.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Checks that the success flag agrees with the payload.
    pub fn validate(&self) -> Result<(), ReplyError> {
        match (self.success, &self.params, &self.error) {
            (true, None, _) => Err(ReplyError::MissingParams),
            (true, _, Some(_)) => Err(ReplyError::UnexpectedError),
            (false, _, None) => Err(ReplyError::MissingError),
            (false, Some(_), _) => Err(ReplyError::UnexpectedParams),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;

    #[test]
    fn test_reply_echoes_the_request() {
        let request = testutils::work_request("node-1", 2);
        let reply = WorkReply::success(
            &request,
            ReplyParams::Plain(request.params.clone()),
            10,
            AuxVars::new(),
            Timing::default(),
        );
        assert_eq!(reply.round_number, 2);
        assert_eq!(reply.request_id, request.request_id);
        assert_eq!(reply.state_id, request.state_id);
        assert_eq!(reply.node_id, request.node_id);
        assert!(reply.validate().is_ok());
    }

    #[test]
    fn test_metrics_are_optional_on_the_wire() {
        let reply = testutils::work_reply("node-1", 0, 1.0, 1)
            .with_metrics(vec![("loss".to_string(), 0.25)].into_iter().collect());
        let mut json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["metrics"]["loss"], 0.25);

        json.as_object_mut().unwrap().remove("metrics");
        let reply: WorkReply = serde_json::from_value(json).unwrap();
        assert!(reply.metrics.is_empty());
    }

    #[test]
    fn test_secagg_arguments_mask_for_the_round() {
        let parties = vec![NodeId::from("node-1"), NodeId::from("node-2")];
        let keys: Vec<ExchangeKeyPair> = (0..2).map(|_| ExchangeKeyPair::generate()).collect();
        let mut args = SecaggArguments {
            session_id: "session-0".into(),
            parties: parties.clone(),
            public_keys: parties
                .iter()
                .cloned()
                .zip(keys.iter().map(|pair| pair.public))
                .collect(),
            nonce: 1,
            random: 0.5,
            clipping_range: 3.0,
            fixed_point_bits: 20,
        };
        let config = args.mask_config();

        let mut aggregation = crate::mask::Aggregation::new(1);
        for (party, pair) in parties.iter().zip(&keys) {
            aggregation
                .aggregate(args.mask(party, pair, 2, &[1.0]).unwrap())
                .unwrap();
        }
        let unmasked = aggregation.unmask(config, 4).unwrap();
        assert!((unmasked.values[0] - 1.0).abs() < 1e-5);
        assert!((unmasked.verification - 0.5).abs() < 1e-5);

        // a party missing from the relayed keys can't be masked for
        args.public_keys.remove(&parties[1]);
        assert!(args.mask(&parties[0], &keys[0], 2, &[1.0]).is_err());
    }

    #[test]
    fn test_validate() {
        let request = testutils::work_request("node-1", 0);
        let error = NodeError {
            kind: NodeErrorKind::Training,
            message: "out of memory".into(),
        };
        let failure = WorkReply::failure(&request, error.clone());
        assert!(failure.validate().is_ok());

        let mut reply = failure.clone();
        reply.error = None;
        assert_eq!(reply.validate(), Err(ReplyError::MissingError));

        let mut reply = failure.clone();
        reply.params = Some(ReplyParams::Plain(Parameters::default()));
        assert_eq!(reply.validate(), Err(ReplyError::UnexpectedParams));

        let mut reply = failure;
        reply.success = true;
        assert_eq!(reply.validate(), Err(ReplyError::MissingParams));

        let mut reply = testutils::work_reply("node-1", 0, 1.0, 1);
        reply.error = Some(error);
        assert_eq!(reply.validate(), Err(ReplyError::UnexpectedError));
    }
}
