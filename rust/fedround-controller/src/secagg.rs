//! Secure aggregation sessions.
//!
//! Before the first secure round, and whenever the set of parties changes, the controller runs a
//! setup phase: every party is asked to join a fresh session and must acknowledge within the
//! setup timeout, handing in an ephemeral public key. The session is reused by the following
//! rounds as long as the parties stay the same.
//!
//! In a secure round the controller relays the public keys of all parties together with a fresh
//! nonce. Every party agrees on a key with each of its peers and masks its weighted parameters for
//! the nonce, so that only the sum over the exact party set can be recovered and the masks of two
//! rounds are unrelated. The controller sums the masked vectors, unmasks the total and compares the
//! verification element with the random value it chose for the round.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use displaydoc::Display;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fedround_core::{
    crypto::PublicExchangeKey,
    mask::{Aggregation, AggregationError, MaskConfig, MaskConfigError, MaskObject, UnmaskingError},
    message::{Reply, Request, SecaggArguments, SecaggSetupRequest},
    model::{Parameters, ShapeError},
    ExperimentId,
    NodeId,
    ResearcherId,
};

use crate::{settings::SecaggSettings, state_machine::replies::ReplyReceiver, transport::Transport};

/// Errors which can occur during secure aggregation.
#[derive(Debug, Display, Error, PartialEq)]
pub enum SecureAggregationError {
    /// The masking configuration is invalid: {0}.
    Config(#[from] MaskConfigError),
    /// The setup request to {0} could not be sent: {1}.
    SetupDispatch(NodeId, String),
    /// The parties {0:?} did not join the session before the setup timeout.
    SetupTimeout(Vec<NodeId>),
    /// {node} refused to join the session: {message}.
    SetupRefused { node: NodeId, message: String },
    /// {0} joined the session without a public key.
    MissingPublicKey(NodeId),
    /// The parties {0:?} sent no masked parameters, the masks can't cancel.
    QuorumNotMet(Vec<NodeId>),
    /// {0} is not a party of the session.
    UnexpectedParty(NodeId),
    /// The masked parameters of {0} are invalid: {1}.
    InvalidMaskedParameters(NodeId, AggregationError),
    /// Unmasking failed: {0}.
    Unmasking(#[from] UnmaskingError),
    /// The unmasked verification element {actual} differs from the expected {expected}.
    MaskMismatch { expected: f64, actual: f64 },
    /// The unmasked parameters don't match the global parameters: {0}.
    Layout(#[from] ShapeError),
    /// The reply channel is closed.
    ReplyChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A secure aggregation session agreed on by a fixed set of parties.
pub struct SecaggSession {
    pub session_id: String,
    /// The parties, in ascending order.
    pub parties: Vec<NodeId>,
    /// The public key every party joined the session with.
    pub public_keys: BTreeMap<NodeId, PublicExchangeKey>,
}

impl SecaggSession {
    fn has_parties(&self, parties: &BTreeSet<NodeId>) -> bool {
        self.parties.len() == parties.len() && self.parties.iter().eq(parties.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The secure aggregation state of an experiment.
pub struct SecureAggregation {
    enabled: bool,
    config: MaskConfig,
    timeout: Duration,
    session: Option<SecaggSession>,
}

impl Default for SecureAggregation {
    fn default() -> Self {
        Self::from(&SecaggSettings::default())
    }
}

impl From<&SecaggSettings> for SecureAggregation {
    fn from(settings: &SecaggSettings) -> Self {
        Self {
            enabled: settings.enable,
            config: settings.mask_config(),
            timeout: settings.timeout(),
            session: None,
        }
    }
}

impl SecureAggregation {
    /// Creates a secure aggregation state.
    ///
    /// # Errors
    /// Fails if the masking configuration is invalid.
    pub fn new(
        enabled: bool,
        config: MaskConfig,
        timeout: Duration,
    ) -> Result<Self, SecureAggregationError> {
        config.validate()?;
        Ok(Self {
            enabled,
            config,
            timeout,
            session: None,
        })
    }

    /// Checks whether the rounds are securely aggregated.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables secure aggregation. Disabling it drops the current session.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clear();
        }
    }

    /// Gets the masking configuration.
    pub fn config(&self) -> MaskConfig {
        self.config
    }

    /// Gets the current session, if any.
    pub fn session(&self) -> Option<&SecaggSession> {
        self.session.as_ref()
    }

    /// Drops the current session. The next secure round runs the setup phase again.
    pub fn clear(&mut self) {
        if self.session.take().is_some() {
            debug!("secure aggregation session dropped");
        }
    }

    /// Makes sure that the `parties` share a session.
    ///
    /// The current session is reused if its parties are exactly the given ones. Otherwise every
    /// party is asked to join a new session, and the session is established once all of them
    /// acknowledged within the setup timeout. Replies unrelated to the setup are discarded.
    pub async fn setup(
        &mut self,
        researcher_id: &ResearcherId,
        experiment_id: &ExperimentId,
        parties: &BTreeSet<NodeId>,
        transport: &dyn Transport,
        replies: &mut ReplyReceiver,
    ) -> Result<SecaggSession, SecureAggregationError> {
        if let Some(session) = self.session.as_ref().filter(|s| s.has_parties(parties)) {
            debug!("reusing secure aggregation session {}", session.session_id);
            return Ok(session.clone());
        }
        self.clear();

        let mut session = SecaggSession {
            session_id: Uuid::new_v4().to_string(),
            parties: parties.iter().cloned().collect(),
            public_keys: BTreeMap::new(),
        };
        info!(
            "setting up secure aggregation session {} with {} parties",
            session.session_id,
            session.parties.len()
        );
        let requests = session
            .parties
            .iter()
            .map(|node_id| {
                Request::SecaggSetup(SecaggSetupRequest {
                    researcher_id: researcher_id.clone(),
                    experiment_id: experiment_id.clone(),
                    session_id: session.session_id.clone(),
                    node_id: node_id.clone(),
                    parties: session.parties.clone(),
                })
            })
            .collect();
        transport
            .broadcast(requests)
            .await
            .map_err(|(node_id, error)| {
                SecureAggregationError::SetupDispatch(node_id, error.to_string())
            })?;

        let mut pending = parties.clone();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        while !pending.is_empty() {
            tokio::select! {
                biased;

                _ = &mut deadline => {
                    warn!("secure aggregation setup timed out");
                    return Err(SecureAggregationError::SetupTimeout(pending.into_iter().collect()));
                }
                next = replies.recv() => {
                    let reply = match next {
                        Some(Reply::SecaggSetup(reply)) => reply,
                        Some(Reply::Train(reply)) => {
                            debug!("discarding training reply of {} during setup", reply.node_id);
                            continue;
                        }
                        None => return Err(SecureAggregationError::ReplyChannel),
                    };
                    if &reply.experiment_id != experiment_id
                        || reply.session_id != session.session_id
                        || !pending.contains(&reply.node_id)
                    {
                        debug!("discarding setup reply of {} for another session", reply.node_id);
                        continue;
                    }
                    if !reply.success {
                        let message = reply
                            .error
                            .map(|error| error.message)
                            .unwrap_or_default();
                        return Err(SecureAggregationError::SetupRefused {
                            node: reply.node_id,
                            message,
                        });
                    }
                    let public_key = reply
                        .public_key
                        .ok_or_else(|| SecureAggregationError::MissingPublicKey(reply.node_id.clone()))?;
                    debug!("{} joined the session", reply.node_id);
                    pending.remove(&reply.node_id);
                    session.public_keys.insert(reply.node_id, public_key);
                }
            }
        }

        info!("secure aggregation session {} established", session.session_id);
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Prepares a secure round of the current `session` with the verification value `random`.
    ///
    /// Every round gets a fresh random nonce, so the parties never mask two rounds of a session
    /// alike.
    pub fn round(&self, session: SecaggSession, random: f64) -> SecaggRound {
        SecaggRound {
            session,
            config: self.config,
            nonce: rand::random(),
            random,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The secure aggregation parameters of a single round.
pub struct SecaggRound {
    pub session: SecaggSession,
    pub config: MaskConfig,
    /// The nonce the parties derive their masks for.
    pub nonce: u64,
    pub random: f64,
}

impl SecaggRound {
    /// Gets the arguments sent to every party along with its work request.
    pub fn arguments(&self) -> SecaggArguments {
        SecaggArguments {
            session_id: self.session.session_id.clone(),
            parties: self.session.parties.clone(),
            public_keys: self.session.public_keys.clone(),
            nonce: self.nonce,
            random: self.random,
            clipping_range: self.config.clipping_range,
            fixed_point_bits: self.config.fixed_point_bits,
        }
    }

    /// Recovers the weighted mean of the parameters of all parties.
    ///
    /// `masked` maps every party to its masked parameters and its weight. The result has the
    /// layout of `layout`.
    ///
    /// # Errors
    /// Fails unless exactly the parties of the session contributed, or if the unmasked
    /// verification element reveals a corrupted mask.
    pub fn aggregate(
        &self,
        masked: BTreeMap<NodeId, (MaskObject, u64)>,
        layout: &Parameters,
    ) -> Result<Parameters, SecureAggregationError> {
        if let Some(node_id) = masked
            .keys()
            .find(|node_id| !self.session.parties.contains(node_id))
        {
            return Err(SecureAggregationError::UnexpectedParty(node_id.clone()));
        }
        let missing: Vec<NodeId> = self
            .session
            .parties
            .iter()
            .filter(|node_id| !masked.contains_key(node_id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(SecureAggregationError::QuorumNotMet(missing));
        }

        let mut aggregation = Aggregation::new(layout.len());
        let mut total_weight = 0_u64;
        for (node_id, (object, weight)) in masked {
            aggregation
                .aggregate(object)
                .map_err(|error| SecureAggregationError::InvalidMaskedParameters(node_id, error))?;
            total_weight = total_weight
                .checked_add(weight)
                .ok_or(UnmaskingError::TooMuchWeight(u64::MAX))?;
        }
        let unmasked = aggregation.unmask(self.config, total_weight)?;

        // every party rounds its verification element once
        let tolerance = (self.session.parties.len() as f64 + 1.0) * self.config.resolution();
        if (unmasked.verification - self.random).abs() > tolerance {
            warn!("unmasked verification element differs from the round's random value");
            return Err(SecureAggregationError::MaskMismatch {
                expected: self.random,
                actual: unmasked.verification,
            });
        }
        Ok(layout.unflatten(&unmasked.values)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fedround_core::{crypto::ExchangeKeyPair, mask::Masker, testutils};

    /// A secure round of the `parties`, together with the key pair every party joined with.
    pub fn secure_round(parties: &[&str]) -> (SecaggRound, BTreeMap<NodeId, ExchangeKeyPair>) {
        let keys: BTreeMap<NodeId, ExchangeKeyPair> = parties
            .iter()
            .map(|party| (NodeId::from(*party), ExchangeKeyPair::generate()))
            .collect();
        let round = SecaggRound {
            session: SecaggSession {
                session_id: "session-0".into(),
                parties: keys.keys().cloned().collect(),
                public_keys: keys
                    .iter()
                    .map(|(party, pair)| (party.clone(), pair.public))
                    .collect(),
            },
            config: MaskConfig::default(),
            nonce: 11,
            random: 0.375,
        };
        (round, keys)
    }

    /// Masks the parameters of every party the way the nodes do.
    pub fn mask_all(
        round: &SecaggRound,
        keys: &BTreeMap<NodeId, ExchangeKeyPair>,
        updates: &[(&str, Parameters, u64)],
    ) -> BTreeMap<NodeId, (MaskObject, u64)> {
        let args = round.arguments();
        updates
            .iter()
            .map(|(node, params, weight)| {
                let node_id = NodeId::from(*node);
                let object = args
                    .mask(&node_id, &keys[&node_id], *weight, &params.flatten())
                    .unwrap();
                (node_id, (object, *weight))
            })
            .collect()
    }

    fn updates() -> Vec<(&'static str, Parameters, u64)> {
        vec![
            ("a", testutils::parameters(1.0), 100),
            ("b", testutils::parameters(2.0), 150),
            ("c", testutils::parameters(3.0), 50),
        ]
    }

    #[test]
    fn test_secure_weighted_mean() {
        let (round, keys) = secure_round(&["a", "b", "c"]);
        let masked = mask_all(&round, &keys, &updates());
        let mean = round.aggregate(masked, &testutils::parameters(0.0)).unwrap();

        let expected = (100.0 * 1.0 + 150.0 * 2.0 + 50.0 * 3.0) / 300.0;
        for value in mean.flatten() {
            assert!((value - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn test_rounds_of_a_session_mask_differently() {
        let (first, keys) = secure_round(&["a", "b"]);
        let mut second = first.clone();
        second.nonce = first.nonce + 1;

        let update = [("a", testutils::parameters(0.75), 10)];
        let masked_first = mask_all(&first, &keys, &update);
        let masked_second = mask_all(&second, &keys, &update);
        let a = NodeId::from("a");
        assert_ne!(masked_first[&a].0, masked_second[&a].0);

        // the difference of two rounds reveals nothing about the difference of the updates
        let config = first.config;
        let diff = masked_first[&a].0.data[0].wrapping_sub(masked_second[&a].0.data[0]);
        assert!(config.decode(diff).abs() > 1.0);
    }

    #[test]
    fn test_arguments_relay_the_session() {
        let (round, keys) = secure_round(&["a", "b"]);
        let args = round.arguments();
        assert_eq!(args.session_id, "session-0");
        assert_eq!(args.nonce, 11);
        assert_eq!(args.parties, vec![NodeId::from("a"), NodeId::from("b")]);
        assert_eq!(args.public_keys[&NodeId::from("b")], keys[&NodeId::from("b")].public);
    }

    #[test]
    fn test_missing_party_is_rejected() {
        let (round, keys) = secure_round(&["a", "b", "c"]);
        let mut masked = mask_all(&round, &keys, &updates());
        masked.remove(&NodeId::from("b"));
        assert_eq!(
            round.aggregate(masked, &testutils::parameters(0.0)),
            Err(SecureAggregationError::QuorumNotMet(vec![NodeId::from("b")]))
        );
    }

    #[test]
    fn test_unexpected_party_is_rejected() {
        let (round, keys) = secure_round(&["a", "b"]);
        let mut masked = mask_all(&round, &keys, &updates()[..2]);
        let (object, weight) = masked[&NodeId::from("a")].clone();
        masked.insert(NodeId::from("z"), (object, weight));
        assert_eq!(
            round.aggregate(masked, &testutils::parameters(0.0)),
            Err(SecureAggregationError::UnexpectedParty(NodeId::from("z")))
        );
    }

    #[test]
    fn test_corrupted_mask_is_detected() {
        let (round, keys) = secure_round(&["a", "b"]);
        let mut masked = mask_all(&round, &keys, &updates()[..2]);
        // a party masked with a key its peer doesn't know
        let stray = Masker::new(
            round.config,
            &NodeId::from("a"),
            &round.session.parties,
            vec![(NodeId::from("b"), fedround_core::mask::SessionKey::generate())]
                .into_iter()
                .collect(),
        )
        .unwrap()
        .mask(round.nonce, 1, &testutils::parameters(1.0).flatten(), round.random);
        masked.insert(NodeId::from("a"), (stray, 1));

        assert!(matches!(
            round.aggregate(masked, &testutils::parameters(0.0)),
            Err(SecureAggregationError::MaskMismatch { .. }) | Err(SecureAggregationError::Unmasking(_))
        ));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = MaskConfig {
            clipping_range: -1.0,
            fixed_point_bits: 20,
        };
        assert!(SecureAggregation::new(true, config, Duration::from_secs(1)).is_err());
    }
}
