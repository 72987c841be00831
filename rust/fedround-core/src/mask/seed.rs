//! Session keys and mask generation.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use std::{fmt, iter};

use derive_more::{AsMut, AsRef};
use rand::{thread_rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

#[derive(AsRef, AsMut, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A secret shared by a pair of parties of a secure aggregation session.
///
/// The key is agreed on by the nodes themselves, the controller never learns it.
pub struct SessionKey([u8; 32]);

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl SessionKey {
    /// The length of a key in bytes.
    pub const LENGTH: usize = 32;

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0_u8; Self::LENGTH];
        thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    /// Derives a mask of the given length from this key and the round `nonce`.
    ///
    /// Both members of a pair derive the identical mask. Every nonce selects an independent
    /// stream of the generator, so masks of different rounds are unrelated.
    pub(crate) fn derive_mask(&self, nonce: u64, len: usize) -> Vec<u64> {
        let mut prng = ChaCha20Rng::from_seed(self.0);
        prng.set_stream(nonce);
        iter::repeat_with(|| prng.next_u64()).take(len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_mask_is_deterministic() {
        let key = SessionKey::from_bytes([7; 32]);
        assert_eq!(key.derive_mask(3, 16), key.clone().derive_mask(3, 16));
        assert_eq!(key.derive_mask(3, 16).len(), 16);
        assert_ne!(
            key.derive_mask(3, 4),
            SessionKey::from_bytes([8; 32]).derive_mask(3, 4)
        );
    }

    #[test]
    fn test_derive_mask_differs_per_nonce() {
        let key = SessionKey::from_bytes([7; 32]);
        let first = key.derive_mask(1, 8);
        let second = key.derive_mask(2, 8);
        assert!(first.iter().zip(&second).all(|(a, b)| a != b));
    }

    #[test]
    fn test_debug_hides_the_key() {
        assert_eq!(format!("{:?}", SessionKey::generate()), "SessionKey(..)");
    }
}
