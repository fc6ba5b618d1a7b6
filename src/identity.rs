//! # Identities and the XOR metric
//!
//! Every node is addressed by an [`Id`]: the raw 32 bytes of its Ed25519
//! public key. The same id space carries value ids (SHA-256 digests) and
//! peer ids, so the Kademlia XOR metric applies uniformly.
//!
//! - [`Keypair`]: Ed25519 signing keypair, the node's long-term identity
//! - [`Id`]: 256-bit identifier with XOR distance and ordering helpers
//!
//! ## Invariants
//!
//! - `Id::from_bytes(b).as_bytes() == b` (round-trip preservation)
//! - XOR distance is symmetric and `d(a, a) == 0`

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length of an [`Id`] in bytes.
pub const ID_BYTES: usize = 32;

/// Length of an [`Id`] in bits.
pub const ID_BITS: usize = 256;

/// Ed25519 signing keypair backing a node identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn random() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn id(&self) -> Id {
        Id::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// The clamped X25519 scalar derived from this Ed25519 secret key.
    ///
    /// Used to agree on per-peer datagram keys; see `crypto::CryptoBox`.
    pub(crate) fn x25519_secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_scalar_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// A 256-bit identifier in the overlay's id space.
///
/// Node ids are Ed25519 public keys; value ids are SHA-256 digests.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Id([u8; ID_BYTES]);

impl Id {
    pub const MIN: Id = Id([0u8; ID_BYTES]);
    pub const MAX: Id = Id([0xFF; ID_BYTES]);

    #[inline]
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ID_BYTES] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Uniformly random id, used for bucket refresh probes.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// XOR distance to `other`, as raw big-endian magnitude bytes.
    #[inline]
    pub fn distance(&self, other: &Id) -> [u8; ID_BYTES] {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Whether this id can verify signatures, i.e. decodes to an Ed25519 point.
    pub fn is_valid_key(&self) -> bool {
        VerifyingKey::from_bytes(&self.0).is_ok()
    }

    /// Verify an Ed25519 signature made by the keypair behind this id.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }

    /// Value of the bit at `index` (0 = most significant).
    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Returns a copy with the bit at `index` set to `value`.
    pub fn with_bit(&self, index: usize, value: bool) -> Id {
        let mut bytes = self.0;
        let mask = 0x80u8 >> (index % 8);
        if value {
            bytes[index / 8] |= mask;
        } else {
            bytes[index / 8] &= !mask;
        }
        Id(bytes)
    }

    /// Index of the first differing bit, or `ID_BITS` when equal.
    pub fn first_different_bit(&self, other: &Id) -> usize {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let x = a ^ b;
            if x != 0 {
                return i * 8 + x.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::try_from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}

/// Compare two XOR distances as unsigned 256-bit magnitudes.
#[inline]
pub fn distance_cmp(a: &[u8; ID_BYTES], b: &[u8; ID_BYTES]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Order `a` and `b` by their distance to `target` (closest first).
#[inline]
pub fn closer_to(target: &Id, a: &Id, b: &Id) -> std::cmp::Ordering {
    distance_cmp(&target.distance(a), &target.distance(b))
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({}…)", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; ID_BYTES]> for Id {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }
}

impl From<Id> for [u8; ID_BYTES] {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_ids_are_distinct() {
        let a = Keypair::random();
        let b = Keypair::random();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = Keypair::random();
        let sig = kp.sign(b"datagram");
        assert!(kp.id().verify(b"datagram", &sig));
        assert!(!kp.id().verify(b"tampered", &sig));
    }

    #[test]
    fn keypair_reconstruction_preserves_id() {
        let original = Keypair::random();
        let restored = Keypair::from_secret_key_bytes(&original.secret_key_bytes());
        assert_eq!(original.id(), restored.id());
    }

    #[test]
    fn distance_properties() {
        let a = Id::random();
        let b = Id::random();
        assert_eq!(a.distance(&a), [0u8; ID_BYTES]);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn distance_ordering_is_lexicographic() {
        let target = Id::MIN;
        let near = Id::from_bytes({
            let mut b = [0u8; 32];
            b[31] = 1;
            b
        });
        let far = Id::from_bytes({
            let mut b = [0u8; 32];
            b[0] = 1;
            b
        });
        assert_eq!(closer_to(&target, &near, &far), std::cmp::Ordering::Less);
    }

    #[test]
    fn bit_accessors() {
        let id = Id::MIN.with_bit(0, true).with_bit(255, true);
        assert!(id.bit(0));
        assert!(id.bit(255));
        assert!(!id.bit(1));
        assert_eq!(id.with_bit(0, false).with_bit(255, false), Id::MIN);
    }

    #[test]
    fn first_different_bit_positions() {
        let a = Id::MIN;
        assert_eq!(a.first_different_bit(&a), ID_BITS);
        let b = a.with_bit(13, true);
        assert_eq!(a.first_different_bit(&b), 13);
    }

    #[test]
    fn hex_roundtrip() {
        let id = Id::random();
        assert_eq!(Id::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Id::from_hex("abcd").is_err());
    }

    #[test]
    fn random_keys_are_valid_points() {
        let kp = Keypair::random();
        assert!(kp.id().is_valid_key());
    }
}
