//! # Per-datagram authenticated encryption
//!
//! Every datagram between nodes is boxed from the sender's long-term key to
//! the receiver's. Keys are the X25519 form of the Ed25519 identities (via
//! the standard birational map), the AEAD is XChaCha20-Poly1305 with a
//! 24-byte nonce derived from `(sender, receiver, txid)`, and the wire
//! layout is:
//!
//! ```text
//! sender_id (32) || nonce (24) || ciphertext (plaintext + 16-byte tag)
//! ```
//!
//! The nonce is deterministic at the sender but carried on the wire, since
//! the receiver cannot know the txid before decrypting. Uniqueness per
//! `(nonce, key)` pair holds because txids are monotonic per server and a
//! request and its response swap sender/receiver in the derivation.
//!
//! Derived per-peer keys are cached; decrypt failures are surfaced as
//! [`Error::Crypto`] and counted (never answered) by the caller.

use std::num::NonZeroUsize;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::VerifyingKey;
use lru::LruCache;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};
use crate::identity::{Id, Keypair, ID_BYTES};

/// Nonce length of the datagram box.
pub const NONCE_BYTES: usize = 24;

/// AEAD authentication tag length.
pub const TAG_BYTES: usize = 16;

/// Fixed framing overhead of a sealed datagram.
pub const ENVELOPE_OVERHEAD: usize = ID_BYTES + NONCE_BYTES + TAG_BYTES;

/// Bounded cache of derived per-peer keys.
const KEY_CACHE_SIZE: usize = 256;

/// Encrypt/decrypt capability bound to the local identity.
pub struct CryptoBox {
    local_id: Id,
    secret: StaticSecret,
    keys: LruCache<Id, [u8; 32]>,
}

impl CryptoBox {
    pub fn new(keypair: &Keypair) -> Self {
        Self {
            local_id: keypair.id(),
            secret: StaticSecret::from(keypair.x25519_secret_bytes()),
            keys: LruCache::new(NonZeroUsize::new(KEY_CACHE_SIZE).expect("nonzero")),
        }
    }

    pub fn local_id(&self) -> Id {
        self.local_id
    }

    /// Derive (or fetch) the symmetric key shared with `peer`.
    fn shared_key(&mut self, peer: &Id) -> Result<[u8; 32]> {
        if let Some(key) = self.keys.get(peer) {
            return Ok(*key);
        }
        let key = derive_shared_key(&self.secret, peer)?;
        self.keys.put(*peer, key);
        Ok(key)
    }

    /// Box `plaintext` for `peer` under an explicit nonce.
    pub fn encrypt(&mut self, peer: &Id, nonce: &[u8; NONCE_BYTES], plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.shared_key(peer)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| Error::crypto("encrypt failed"))
    }

    /// Open a box from `peer` under an explicit nonce.
    pub fn decrypt(&mut self, peer: &Id, nonce: &[u8; NONCE_BYTES], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = self.shared_key(peer)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::crypto("decrypt failed"))
    }

    /// Seal a complete outgoing datagram for `receiver`.
    pub fn seal_envelope(&mut self, receiver: &Id, txid: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = derive_nonce(&self.local_id, receiver, txid);
        let ciphertext = self.encrypt(receiver, &nonce, plaintext)?;
        let mut packet = Vec::with_capacity(ID_BYTES + NONCE_BYTES + ciphertext.len());
        packet.extend_from_slice(self.local_id.as_bytes());
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    /// Open an incoming datagram, returning the sender id and plaintext.
    pub fn open_envelope(&mut self, packet: &[u8]) -> Result<(Id, Vec<u8>)> {
        if packet.len() < ENVELOPE_OVERHEAD {
            return Err(Error::crypto("datagram shorter than envelope overhead"));
        }
        let sender = Id::try_from_slice(&packet[..ID_BYTES]).expect("length checked");
        let mut nonce = [0u8; NONCE_BYTES];
        nonce.copy_from_slice(&packet[ID_BYTES..ID_BYTES + NONCE_BYTES]);
        let plaintext = self.decrypt(&sender, &nonce, &packet[ID_BYTES + NONCE_BYTES..])?;
        Ok((sender, plaintext))
    }
}

impl std::fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBox")
            .field("local_id", &self.local_id)
            .field("cached_keys", &self.keys.len())
            .finish()
    }
}

/// Deterministic datagram nonce for `(sender, receiver, txid)`.
pub fn derive_nonce(sender: &Id, receiver: &Id, txid: u32) -> [u8; NONCE_BYTES] {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(receiver.as_bytes());
    hasher.update(txid.to_be_bytes());
    let digest = hasher.finalize();
    let mut nonce = [0u8; NONCE_BYTES];
    nonce.copy_from_slice(&digest[..NONCE_BYTES]);
    nonce
}

/// One-shot box between two identities, used for encrypted-mutable values.
pub fn encrypt_to(
    sender: &Keypair,
    recipient: &Id,
    nonce: &[u8; NONCE_BYTES],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let secret = StaticSecret::from(sender.x25519_secret_bytes());
    let key = derive_shared_key(&secret, recipient)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| Error::crypto("encrypt failed"))
}

/// Counterpart of [`encrypt_to`] on the recipient side.
pub fn decrypt_from(
    recipient: &Keypair,
    sender: &Id,
    nonce: &[u8; NONCE_BYTES],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let secret = StaticSecret::from(recipient.x25519_secret_bytes());
    let key = derive_shared_key(&secret, sender)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::crypto("decrypt failed"))
}

/// X25519 agreement with `peer`, hashed down to an AEAD key.
///
/// Symmetric in the two identities, so both directions of a conversation
/// derive the same key; nonces disambiguate direction.
fn derive_shared_key(secret: &StaticSecret, peer: &Id) -> Result<[u8; 32]> {
    let verifying = VerifyingKey::from_bytes(peer.as_bytes())
        .map_err(|_| Error::crypto("peer id is not a valid Ed25519 key"))?;
    let peer_public = PublicKey::from(verifying.to_montgomery().to_bytes());
    let shared = secret.diffie_hellman(&peer_public);
    let digest = Sha256::digest(shared.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Ok(key)
}
