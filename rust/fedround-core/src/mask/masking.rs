//! Masking, aggregation and unmasking of parameter vectors.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    crypto::KeyExchangeError,
    mask::{config::MaskConfig, seed::SessionKey},
    NodeId,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors related to the setup of a masker.
pub enum MaskingError {
    #[error("{0} is not a party of the session")]
    UnknownParty(NodeId),

    #[error("there is no session key shared with {0}")]
    MissingPeerKey(NodeId),

    #[error("the key agreement failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors related to the aggregation of masked vectors.
pub enum AggregationError {
    #[error("the masked vector has length {actual}, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors related to the unmasking of aggregated vectors.
pub enum UnmaskingError {
    #[error("there is no masked vector to unmask")]
    NoModel,

    #[error("the total weight is zero")]
    ZeroWeight,

    #[error("the total weight {0} exceeds what the masking configuration can represent")]
    TooMuchWeight(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A masked vector. The last element is the masked verification element.
pub struct MaskObject {
    pub data: Vec<u64>,
}

impl MaskObject {
    /// Gets the number of masked values, excluding the verification element.
    pub fn values_len(&self) -> usize {
        self.data.len().saturating_sub(1)
    }
}

/// A masker for the parameters of one party.
pub struct Masker {
    config: MaskConfig,
    /// The peers this party adds its pair mask for.
    add: Vec<SessionKey>,
    /// The peers this party subtracts its pair mask for.
    sub: Vec<SessionKey>,
}

impl Masker {
    /// Creates a masker for party `me` of a session over `parties`.
    ///
    /// `keys` must hold the key shared with every other party.
    ///
    /// # Errors
    /// Fails if `me` is not a party or a peer key is missing.
    pub fn new(
        config: MaskConfig,
        me: &NodeId,
        parties: &[NodeId],
        mut keys: BTreeMap<NodeId, SessionKey>,
    ) -> Result<Self, MaskingError> {
        if !parties.contains(me) {
            return Err(MaskingError::UnknownParty(me.clone()));
        }
        let mut peers = parties.to_vec();
        peers.sort();
        peers.dedup();

        let mut add = Vec::new();
        let mut sub = Vec::new();
        for peer in peers.into_iter().filter(|peer| peer != me) {
            let key = keys
                .remove(&peer)
                .ok_or_else(|| MaskingError::MissingPeerKey(peer.clone()))?;
            if me < &peer {
                add.push(key);
            } else {
                sub.push(key);
            }
        }
        Ok(Self { config, add, sub })
    }

    /// Masks `weight * values` and appends the weighted `verification` element.
    ///
    /// The masking proceeds in the following steps:
    /// - Clamp the values to the clipping range.
    /// - Scale the values by the weight and encode them in fixed point.
    /// - Add the pair masks of the peers after this party and subtract the
    ///   pair masks of the peers before it.
    ///
    /// The pair masks are derived for the round `nonce`. All parties of a round must use the
    /// same nonce, and a nonce must never be used for two rounds of a session.
    pub fn mask(&self, nonce: u64, weight: u64, values: &[f64], verification: f64) -> MaskObject {
        let mut data: Vec<u64> = values
            .iter()
            .map(|value| self.config.encode(weight, *value))
            .collect();
        data.push(self.config.encode_unclipped(weight, verification));

        let len = data.len();
        for key in &self.add {
            for (x, m) in data.iter_mut().zip(key.derive_mask(nonce, len)) {
                *x = x.wrapping_add(m);
            }
        }
        for key in &self.sub {
            for (x, m) in data.iter_mut().zip(key.derive_mask(nonce, len)) {
                *x = x.wrapping_sub(m);
            }
        }
        MaskObject { data }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The result of unmasking an aggregation.
pub struct Unmasked {
    /// The weighted mean of the values.
    pub values: Vec<f64>,
    /// The weighted mean of the verification elements.
    pub verification: f64,
}

#[derive(Debug, Clone)]
/// An aggregator for masked vectors.
pub struct Aggregation {
    nb_models: usize,
    object: Vec<u64>,
}

impl Aggregation {
    /// Creates a new, empty aggregator for masked vectors of `values_len` values.
    pub fn new(values_len: usize) -> Self {
        Self {
            nb_models: 0,
            object: vec![0; values_len + 1],
        }
    }

    /// Gets the number of aggregated masked vectors.
    pub fn nb_models(&self) -> usize {
        self.nb_models
    }

    /// Validates if the `object` may be aggregated.
    pub fn validate_aggregation(&self, object: &MaskObject) -> Result<(), AggregationError> {
        if object.data.len() != self.object.len() {
            return Err(AggregationError::LengthMismatch {
                expected: self.object.len(),
                actual: object.data.len(),
            });
        }
        Ok(())
    }

    /// Aggregates the `object` into the sum.
    ///
    /// # Errors
    /// Fails if the `object` has the wrong length, in which case nothing is aggregated.
    pub fn aggregate(&mut self, object: MaskObject) -> Result<(), AggregationError> {
        self.validate_aggregation(&object)?;
        for (acc, x) in self.object.iter_mut().zip(object.data) {
            *acc = acc.wrapping_add(x);
        }
        self.nb_models += 1;
        Ok(())
    }

    /// Unmasks the aggregated sum and divides it by the `total_weight`.
    ///
    /// Only the sum over all parties of the session is free of masks. Unmasking a
    /// partial sum does not fail but yields noise, which the verification
    /// element exposes.
    pub fn unmask(self, config: MaskConfig, total_weight: u64) -> Result<Unmasked, UnmaskingError> {
        if self.nb_models == 0 {
            return Err(UnmaskingError::NoModel);
        }
        if total_weight == 0 {
            return Err(UnmaskingError::ZeroWeight);
        }
        if total_weight > config.max_total_weight() {
            return Err(UnmaskingError::TooMuchWeight(total_weight));
        }

        let mut values: Vec<f64> = self
            .object
            .into_iter()
            .map(|x| config.decode(x) / total_weight as f64)
            .collect();
        // the vector always holds at least the verification element
        let verification = values.pop().unwrap_or(f64::NAN);
        Ok(Unmasked {
            values,
            verification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parties(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::new(format!("node-{}", i))).collect()
    }

    /// Creates one key per unordered pair and hands each party its peer keys.
    fn pair_keys(parties: &[NodeId]) -> Vec<BTreeMap<NodeId, SessionKey>> {
        let mut keys = vec![BTreeMap::new(); parties.len()];
        for i in 0..parties.len() {
            for j in (i + 1)..parties.len() {
                let key = SessionKey::generate();
                keys[i].insert(parties[j].clone(), key.clone());
                keys[j].insert(parties[i].clone(), key);
            }
        }
        keys
    }

    fn maskers(config: MaskConfig, parties: &[NodeId]) -> Vec<Masker> {
        pair_keys(parties)
            .into_iter()
            .zip(parties)
            .map(|(keys, me)| Masker::new(config, me, parties, keys).unwrap())
            .collect()
    }

    #[test]
    fn test_masking_hides_values() {
        let config = MaskConfig::default();
        let parties = parties(2);
        let maskers = maskers(config, &parties);
        let masked = maskers[0].mask(0, 1, &[0.5, -0.5], 0.1);
        assert_eq!(masked.values_len(), 2);
        assert_ne!(masked.data[0], config.encode(1, 0.5));
    }

    #[test]
    fn test_masking_and_aggregation() {
        let config = MaskConfig::default();
        let parties = parties(3);
        let maskers = maskers(config, &parties);
        let weights = [100_u64, 150, 50];
        let values = [[1.0, -2.0], [0.5, 1.0], [-1.0, 2.5]];
        let random = 0.375;

        let mut aggregation = Aggregation::new(2);
        for ((masker, weight), values) in maskers.iter().zip(&weights).zip(&values) {
            aggregation
                .aggregate(masker.mask(7, *weight, values, random))
                .unwrap();
        }
        assert_eq!(aggregation.nb_models(), 3);

        let unmasked = aggregation.unmask(config, 300).unwrap();
        let expected = [
            (100.0 * 1.0 + 150.0 * 0.5 + 50.0 * -1.0) / 300.0,
            (100.0 * -2.0 + 150.0 * 1.0 + 50.0 * 2.5) / 300.0,
        ];
        for (x, y) in unmasked.values.iter().zip(&expected) {
            assert!((x - y).abs() < 1e-5, "{} != {}", x, y);
        }
        assert!((unmasked.verification - random).abs() < 1e-5);
    }

    #[test]
    fn test_masks_of_different_rounds_are_unrelated() {
        let config = MaskConfig::default();
        let parties = parties(2);
        let maskers = maskers(config, &parties);

        // the same party in two rounds of one session
        let first = maskers[0].mask(1, 10, &[0.75], 0.5);
        let second = maskers[0].mask(2, 10, &[0.25], 0.5);
        let delta = config.decode(first.data[0].wrapping_sub(second.data[0])) / 10.0;
        assert!((delta - 0.5).abs() > 1.0, "the masks cancel: {}", delta);

        // both members of a pair still cancel within a round
        let mut aggregation = Aggregation::new(1);
        aggregation.aggregate(maskers[0].mask(2, 10, &[0.75], 0.5)).unwrap();
        aggregation.aggregate(maskers[1].mask(2, 10, &[0.25], 0.5)).unwrap();
        let unmasked = aggregation.unmask(config, 20).unwrap();
        assert!((unmasked.values[0] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_mismatched_nonces_fail_verification() {
        let config = MaskConfig::default();
        let parties = parties(2);
        let maskers = maskers(config, &parties);

        let mut aggregation = Aggregation::new(1);
        aggregation.aggregate(maskers[0].mask(1, 10, &[0.75], 0.5)).unwrap();
        aggregation.aggregate(maskers[1].mask(2, 10, &[0.25], 0.5)).unwrap();
        let unmasked = aggregation.unmask(config, 20).unwrap();
        assert!((unmasked.verification - 0.5).abs() > 1e-3);
    }

    #[test]
    fn test_partial_aggregation_fails_verification() {
        let config = MaskConfig::default();
        let parties = parties(3);
        let maskers = maskers(config, &parties);
        let random = 0.5;

        let mut aggregation = Aggregation::new(1);
        for masker in maskers.iter().take(2) {
            aggregation.aggregate(masker.mask(7, 10, &[1.0], random)).unwrap();
        }
        let unmasked = aggregation.unmask(config, 20).unwrap();
        assert!((unmasked.verification - random).abs() > 1e-3);
    }

    #[test]
    fn test_aggregate_length_mismatch() {
        let mut aggregation = Aggregation::new(2);
        assert_eq!(
            aggregation.aggregate(MaskObject { data: vec![0; 2] }),
            Err(AggregationError::LengthMismatch {
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(aggregation.nb_models(), 0);
    }

    #[test]
    fn test_unmask_errors() {
        let config = MaskConfig::default();
        assert_eq!(
            Aggregation::new(1).unmask(config, 1).unwrap_err(),
            UnmaskingError::NoModel
        );

        let mut aggregation = Aggregation::new(1);
        aggregation.aggregate(MaskObject { data: vec![0; 2] }).unwrap();
        assert_eq!(
            aggregation.clone().unmask(config, 0).unwrap_err(),
            UnmaskingError::ZeroWeight
        );
        assert_eq!(
            aggregation.unmask(config, u64::MAX).unwrap_err(),
            UnmaskingError::TooMuchWeight(u64::MAX)
        );
    }

    #[test]
    fn test_masker_setup_errors() {
        let config = MaskConfig::default();
        let parties = parties(2);
        assert_eq!(
            Masker::new(config, &NodeId::from("stranger"), &parties, BTreeMap::new()).err(),
            Some(MaskingError::UnknownParty(NodeId::from("stranger")))
        );
        assert_eq!(
            Masker::new(config, &parties[0], &parties, BTreeMap::new()).err(),
            Some(MaskingError::MissingPeerKey(parties[1].clone()))
        );
    }
}
