//! Wrappers around the [sodiumoxide] key exchange primitives.
//!
//! The parties of a secure aggregation session agree on their pairwise [`SessionKey`]s without
//! the controller learning them. Every party generates an ephemeral [`ExchangeKeyPair`] when it
//! joins a session and hands its public key to the controller, which relays the public keys of
//! all parties with every training request. Each party then derives the key it shares with a
//! peer from its own secret key and the public key of that peer.
//!
//! ```
//! # use fedround_core::{crypto::ExchangeKeyPair, NodeId};
//! let (a, b) = (NodeId::from("a"), NodeId::from("b"));
//! let keys_a = ExchangeKeyPair::generate();
//! let keys_b = ExchangeKeyPair::generate();
//!
//! let shared_a = keys_a.agree(&a, &b, &keys_b.public).unwrap();
//! let shared_b = keys_b.agree(&b, &a, &keys_a.public).unwrap();
//! assert_eq!(shared_a, shared_b);
//! ```
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/
//! [`SessionKey`]: crate::mask::SessionKey

pub(crate) mod exchange;

pub use self::exchange::{ExchangeKeyPair, KeyExchangeError, PublicExchangeKey, SecretExchangeKey};
