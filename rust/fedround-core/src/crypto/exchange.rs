//! Key agreement between the parties of a session.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [crypto module]: crate::crypto

use std::collections::BTreeMap;

use derive_more::{AsMut, AsRef, From};
use sodiumoxide::crypto::kx;
use thiserror::Error;

use crate::{mask::SessionKey, NodeId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors related to the key agreement.
pub enum KeyExchangeError {
    #[error("there is no public key of {0}")]
    MissingPublicKey(NodeId),

    #[error("the public key of {0} is invalid")]
    InvalidPublicKey(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An ephemeral `X25519` key pair of a party, valid for a single session.
pub struct ExchangeKeyPair {
    pub public: PublicExchangeKey,
    pub secret: SecretExchangeKey,
}

impl ExchangeKeyPair {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        // initializing more than once is harmless
        let _ = sodiumoxide::init();
        let (pk, sk) = kx::gen_keypair();
        Self {
            public: PublicExchangeKey(pk),
            secret: SecretExchangeKey(sk),
        }
    }

    /// Agrees on the key shared by `me` and `peer`.
    ///
    /// The party whose id comes first acts as the client of the exchange, the other one as the
    /// server, so that both derive the same key.
    ///
    /// # Errors
    /// Fails if the public key of the `peer` is invalid.
    pub fn agree(
        &self,
        me: &NodeId,
        peer: &NodeId,
        peer_key: &PublicExchangeKey,
    ) -> Result<SessionKey, KeyExchangeError> {
        let key = if me < peer {
            kx::client_session_keys(&self.public.0, &self.secret.0, &peer_key.0)
                .map(|(_rx, tx)| tx)
        } else {
            kx::server_session_keys(&self.public.0, &self.secret.0, &peer_key.0)
                .map(|(rx, _tx)| rx)
        }
        .map_err(|_| KeyExchangeError::InvalidPublicKey(peer.clone()))?;
        Ok(SessionKey::from_bytes(key.0))
    }

    /// Agrees on a key with every party of `public_keys` but `me`.
    ///
    /// # Errors
    /// Fails if a public key is missing or invalid.
    pub fn session_keys(
        &self,
        me: &NodeId,
        parties: &[NodeId],
        public_keys: &BTreeMap<NodeId, PublicExchangeKey>,
    ) -> Result<BTreeMap<NodeId, SessionKey>, KeyExchangeError> {
        parties
            .iter()
            .filter(|peer| *peer != me)
            .map(|peer| {
                let peer_key = public_keys
                    .get(peer)
                    .ok_or_else(|| KeyExchangeError::MissingPublicKey(peer.clone()))?;
                Ok((peer.clone(), self.agree(me, peer, peer_key)?))
            })
            .collect()
    }
}

#[derive(AsRef, AsMut, From, Serialize, Deserialize, Hash, Eq, Ord, PartialEq, Copy, Clone, PartialOrd, Debug)]
/// An `X25519` public key for the key agreement.
pub struct PublicExchangeKey(kx::PublicKey);

impl PublicExchangeKey {
    /// The length of a key in bytes.
    pub const LENGTH: usize = kx::PUBLICKEYBYTES;

    /// Creates a key from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        kx::PublicKey::from_slice(bytes).map(Self)
    }
}

#[derive(AsRef, AsMut, From, Eq, PartialEq, Clone, Debug)]
/// An `X25519` secret key for the key agreement.
///
/// When this goes out of scope, its contents will be zeroed out.
pub struct SecretExchangeKey(kx::SecretKey);
