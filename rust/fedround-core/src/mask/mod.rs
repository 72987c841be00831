//! Additive masking, aggregation and unmasking of parameter vectors.
//!
//! # Masking configuration
//! Values are embedded into the group of integers modulo `2^64` in fixed
//! point representation. The [`MaskConfig`] decides on the clipping range,
//! i.e. the absolute bound enforced on every value before masking, and on the
//! number of fractional bits of the fixed point representation. Together with
//! the total weight of an aggregation they bound the largest representable
//! sum, see [`MaskConfig::max_total_weight()`].
//!
//! # Masking
//! Every pair of parties shares a [`SessionKey`], agreed on during the setup
//! of a session (see [`ExchangeKeyPair`]). Both members of a pair derive the
//! same pseudo-random mask from their key and the nonce of the round: the
//! party coming first in the sorted party order adds it, the other one
//! subtracts it. Summing the masked vectors of all parties therefore cancels
//! every mask, while any proper subset of the parties leaves at least one mask
//! uncanceled and sums to random noise. A fresh nonce per round keeps the
//! masks of two rounds of the same session unrelated.
//!
//! A [`Masker`] scales the values of a node by its weight (usually the sample
//! count), masks them and appends a verification element, the weighted random
//! value chosen by the controller for the round.
//!
//! # Aggregation and unmasking
//! An [`Aggregation`] sums masked vectors. Once the masked vectors of all
//! parties have been aggregated, [`Aggregation::unmask()`] decodes the weighted
//! mean and the verification element. A verification element that differs
//! from the expected random value reveals a partial or corrupted party set.
//!
//! ```
//! # use fedround_core::{crypto::ExchangeKeyPair, mask::{Aggregation, MaskConfig, Masker}, NodeId};
//! let config = MaskConfig { clipping_range: 2.0, fixed_point_bits: 20 };
//! let parties = vec![NodeId::from("a"), NodeId::from("b")];
//! let exchange_a = ExchangeKeyPair::generate();
//! let exchange_b = ExchangeKeyPair::generate();
//! let public_keys = vec![
//!     (parties[0].clone(), exchange_a.public),
//!     (parties[1].clone(), exchange_b.public),
//! ]
//! .into_iter()
//! .collect();
//! let keys_a = exchange_a.session_keys(&parties[0], &parties, &public_keys).unwrap();
//! let keys_b = exchange_b.session_keys(&parties[1], &parties, &public_keys).unwrap();
//!
//! let nonce = 42;
//! let masked_a = Masker::new(config, &parties[0], &parties, keys_a).unwrap().mask(nonce, 1, &[1.0], 0.25);
//! let masked_b = Masker::new(config, &parties[1], &parties, keys_b).unwrap().mask(nonce, 3, &[0.5], 0.25);
//!
//! let mut aggregation = Aggregation::new(1);
//! aggregation.aggregate(masked_a).unwrap();
//! aggregation.aggregate(masked_b).unwrap();
//! let unmasked = aggregation.unmask(config, 4).unwrap();
//! assert!((unmasked.values[0] - 0.625).abs() < 1e-5);
//! assert!((unmasked.verification - 0.25).abs() < 1e-5);
//! ```
//!
//! [`ExchangeKeyPair`]: crate::crypto::ExchangeKeyPair

pub mod config;
pub(crate) mod masking;
pub(crate) mod seed;

pub use self::{
    config::{MaskConfig, MaskConfigError},
    masking::{Aggregation, AggregationError, MaskObject, Masker, MaskingError, Unmasked, UnmaskingError},
    seed::SessionKey,
};
