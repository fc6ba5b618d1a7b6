//! # Stored records: values and peer announcements
//!
//! Three value modes share one record shape:
//!
//! | Mode | `public_key` | `recipient` | id |
//! |------|--------------|-------------|----|
//! | immutable | absent | absent | `sha256(data)` |
//! | signed mutable | present | absent | `sha256(public_key)` |
//! | encrypted mutable | present | present | `sha256(public_key)` |
//!
//! Mutable records carry an Ed25519 signature over `nonce || seq || data`;
//! encrypted records additionally box `data` from the owner to the recipient
//! using the record nonce. Updates must strictly increase `seq` and preserve
//! `(public_key, recipient, nonce)`.
//!
//! A [`PeerInfo`] associates an application peer (port, optional URL) with a
//! resource id, signed by the peer key so storage nodes and readers can
//! verify the announcement without trusting the carrier.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{self, NONCE_BYTES};
use crate::error::{Error, Result};
use crate::identity::{Id, Keypair};

/// Sequence number carried by immutable values.
pub const SEQ_IMMUTABLE: i32 = -1;

/// A record in the distributed store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub(crate) public_key: Option<Id>,
    pub(crate) recipient: Option<Id>,
    pub(crate) nonce: Option<[u8; NONCE_BYTES]>,
    pub(crate) signature: Option<Vec<u8>>,
    pub(crate) sequence_number: i32,
    pub(crate) data: Vec<u8>,
}

impl Value {
    /// Content-addressed immutable value; `id() == sha256(data)`.
    pub fn of_immutable(data: impl Into<Vec<u8>>) -> Value {
        Value {
            public_key: None,
            recipient: None,
            nonce: None,
            signature: None,
            sequence_number: SEQ_IMMUTABLE,
            data: data.into(),
        }
    }

    /// Signed mutable value owned by `keypair`; `data` stays in the clear.
    pub fn of_signed(
        keypair: &Keypair,
        nonce: [u8; NONCE_BYTES],
        sequence_number: i32,
        data: impl Into<Vec<u8>>,
    ) -> Result<Value> {
        if sequence_number < 0 {
            return Err(Error::InvalidValue("sequence number must be >= 0".into()));
        }
        let data = data.into();
        let signature = keypair.sign(&signed_payload(&nonce, sequence_number, &data));
        Ok(Value {
            public_key: Some(keypair.id()),
            recipient: None,
            nonce: Some(nonce),
            signature: Some(signature.to_vec()),
            sequence_number,
            data,
        })
    }

    /// Encrypted mutable value: `data` is boxed from the owner to `recipient`
    /// under the record nonce, then signed like any mutable value.
    pub fn of_encrypted(
        keypair: &Keypair,
        recipient: Id,
        nonce: [u8; NONCE_BYTES],
        sequence_number: i32,
        data: &[u8],
    ) -> Result<Value> {
        if sequence_number < 0 {
            return Err(Error::InvalidValue("sequence number must be >= 0".into()));
        }
        let boxed = crypto::encrypt_to(keypair, &recipient, &nonce, data)?;
        let signature = keypair.sign(&signed_payload(&nonce, sequence_number, &boxed));
        Ok(Value {
            public_key: Some(keypair.id()),
            recipient: Some(recipient),
            nonce: Some(nonce),
            signature: Some(signature.to_vec()),
            sequence_number,
            data: boxed,
        })
    }

    pub(crate) fn from_parts(
        public_key: Option<Id>,
        recipient: Option<Id>,
        nonce: Option<[u8; NONCE_BYTES]>,
        signature: Option<Vec<u8>>,
        sequence_number: i32,
        data: Vec<u8>,
    ) -> Value {
        Value {
            public_key,
            recipient,
            nonce,
            signature,
            sequence_number,
            data,
        }
    }

    /// The id this value is stored under.
    pub fn id(&self) -> Id {
        let digest = match &self.public_key {
            Some(pk) => Sha256::digest(pk.as_bytes()),
            None => Sha256::digest(&self.data),
        };
        Id::try_from_slice(&digest).expect("sha256 is 32 bytes")
    }

    pub fn is_mutable(&self) -> bool {
        self.public_key.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.recipient.is_some()
    }

    pub fn public_key(&self) -> Option<&Id> {
        self.public_key.as_ref()
    }

    pub fn recipient(&self) -> Option<&Id> {
        self.recipient.as_ref()
    }

    pub fn nonce(&self) -> Option<&[u8; NONCE_BYTES]> {
        self.nonce.as_ref()
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn sequence_number(&self) -> i32 {
        self.sequence_number
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Structural and cryptographic validity of this record in isolation.
    pub fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(Error::InvalidValue("empty data".into()));
        }
        let Some(public_key) = &self.public_key else {
            // Immutable: no mutable-only fields may be present.
            if self.recipient.is_some() || self.nonce.is_some() || self.signature.is_some() {
                return Err(Error::InvalidValue(
                    "immutable value carries mutable fields".into(),
                ));
            }
            return Ok(());
        };

        let nonce = self
            .nonce
            .as_ref()
            .ok_or_else(|| Error::InvalidValue("mutable value without nonce".into()))?;
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| Error::InvalidValue("mutable value without signature".into()))?;
        if signature.len() != 64 {
            return Err(Error::InvalidValue("signature must be 64 bytes".into()));
        }
        if self.sequence_number < 0 {
            return Err(Error::InvalidValue("mutable value with negative seq".into()));
        }
        let payload = signed_payload(nonce, self.sequence_number, &self.data);
        if !public_key.verify(&payload, signature) {
            return Err(Error::InvalidValue("signature verification failed".into()));
        }
        Ok(())
    }

    /// Whether `newer` is an acceptable successor of `self` under the
    /// store's update rule (same owner material, strictly larger seq).
    pub fn accepts_update(&self, newer: &Value) -> Result<()> {
        if self.public_key != newer.public_key
            || self.recipient != newer.recipient
            || self.nonce != newer.nonce
        {
            return Err(Error::InvalidValue("owner material mismatch".into()));
        }
        if newer.sequence_number <= self.sequence_number {
            return Err(Error::InvalidValue("sequence number not monotonic".into()));
        }
        Ok(())
    }

    /// Open the boxed payload of an encrypted value addressed to `recipient`.
    pub fn decrypt_data(&self, recipient: &Keypair) -> Result<Vec<u8>> {
        let owner = self
            .public_key
            .as_ref()
            .ok_or_else(|| Error::InvalidValue("not an encrypted value".into()))?;
        let expected = self
            .recipient
            .as_ref()
            .ok_or_else(|| Error::InvalidValue("not an encrypted value".into()))?;
        if *expected != recipient.id() {
            return Err(Error::InvalidValue("value addressed to another recipient".into()));
        }
        let nonce = self
            .nonce
            .as_ref()
            .ok_or_else(|| Error::InvalidValue("encrypted value without nonce".into()))?;
        crypto::decrypt_from(recipient, owner, nonce, &self.data)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("id", &self.id())
            .field("mutable", &self.is_mutable())
            .field("encrypted", &self.is_encrypted())
            .field("seq", &self.sequence_number)
            .field("data_len", &self.data.len())
            .finish()
    }
}

fn signed_payload(nonce: &[u8; NONCE_BYTES], seq: i32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(NONCE_BYTES + 4 + data.len());
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.extend_from_slice(data);
    payload
}

/// A signed peer announcement stored under the peer id.
///
/// `node_id` is the overlay node that published the announcement; `origin`
/// is set when the publisher acts on behalf of another node. Storage
/// uniqueness key is `(peer_id, node_id)`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub(crate) peer_id: Id,
    pub(crate) node_id: Id,
    pub(crate) origin: Option<Id>,
    pub(crate) port: u16,
    pub(crate) alternative_url: Option<String>,
    pub(crate) signature: Vec<u8>,
}

impl PeerInfo {
    /// Announce a peer service directly from `node_id`.
    pub fn of(
        peer_keypair: &Keypair,
        node_id: Id,
        port: u16,
        alternative_url: Option<String>,
    ) -> PeerInfo {
        Self::build(peer_keypair, node_id, None, port, alternative_url)
    }

    /// Announce on behalf of `origin` (delegated announcement).
    pub fn of_delegated(
        peer_keypair: &Keypair,
        node_id: Id,
        origin: Id,
        port: u16,
        alternative_url: Option<String>,
    ) -> PeerInfo {
        Self::build(peer_keypair, node_id, Some(origin), port, alternative_url)
    }

    fn build(
        peer_keypair: &Keypair,
        node_id: Id,
        origin: Option<Id>,
        port: u16,
        alternative_url: Option<String>,
    ) -> PeerInfo {
        let peer_id = peer_keypair.id();
        let payload = peer_payload(
            &peer_id,
            &node_id,
            origin.as_ref().unwrap_or(&node_id),
            port,
            alternative_url.as_deref(),
        );
        let signature = peer_keypair.sign(&payload).to_vec();
        PeerInfo {
            peer_id,
            node_id,
            origin,
            port,
            alternative_url,
            signature,
        }
    }

    pub(crate) fn from_parts(
        peer_id: Id,
        node_id: Id,
        origin: Option<Id>,
        port: u16,
        alternative_url: Option<String>,
        signature: Vec<u8>,
    ) -> PeerInfo {
        PeerInfo {
            peer_id,
            node_id,
            origin,
            port,
            alternative_url,
            signature,
        }
    }

    pub fn peer_id(&self) -> &Id {
        &self.peer_id
    }

    pub fn node_id(&self) -> &Id {
        &self.node_id
    }

    /// Effective origin: the delegating node, or the publisher itself.
    pub fn origin(&self) -> &Id {
        self.origin.as_ref().unwrap_or(&self.node_id)
    }

    pub fn is_delegated(&self) -> bool {
        self.origin.is_some()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn alternative_url(&self) -> Option<&str> {
        self.alternative_url.as_deref()
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn verify(&self) -> Result<()> {
        if self.signature.len() != 64 {
            return Err(Error::InvalidPeer("signature must be 64 bytes".into()));
        }
        if self.port == 0 {
            return Err(Error::InvalidPeer("port must be non-zero".into()));
        }
        let payload = peer_payload(
            &self.peer_id,
            &self.node_id,
            self.origin(),
            self.port,
            self.alternative_url.as_deref(),
        );
        if !self.peer_id.verify(&payload, &self.signature) {
            return Err(Error::InvalidPeer("signature verification failed".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerInfo")
            .field("peer_id", &self.peer_id)
            .field("node_id", &self.node_id)
            .field("port", &self.port)
            .field("url", &self.alternative_url)
            .finish()
    }
}

fn peer_payload(peer_id: &Id, node_id: &Id, origin: &Id, port: u16, url: Option<&str>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(98 + url.map_or(0, str::len));
    payload.extend_from_slice(peer_id.as_bytes());
    payload.extend_from_slice(node_id.as_bytes());
    payload.extend_from_slice(origin.as_bytes());
    payload.extend_from_slice(&port.to_be_bytes());
    if let Some(url) = url {
        payload.extend_from_slice(url.as_bytes());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_id_is_content_hash() {
        let value = Value::of_immutable(b"Hello".to_vec());
        let expected = Sha256::digest(b"Hello");
        assert_eq!(value.id().as_bytes()[..], expected[..]);
        assert!(!value.is_mutable());
        assert!(value.validate().is_ok());
    }

    #[test]
    fn signed_value_validates() {
        let kp = Keypair::random();
        let value = Value::of_signed(&kp, [1u8; NONCE_BYTES], 0, b"v1".to_vec()).unwrap();
        assert!(value.is_mutable());
        assert!(!value.is_encrypted());
        assert!(value.validate().is_ok());

        let expected = Sha256::digest(kp.id().as_bytes());
        assert_eq!(value.id().as_bytes()[..], expected[..]);
    }

    #[test]
    fn tampered_signed_value_rejected() {
        let kp = Keypair::random();
        let mut value = Value::of_signed(&kp, [1u8; NONCE_BYTES], 3, b"v1".to_vec()).unwrap();
        value.data = b"v2".to_vec();
        assert!(value.validate().is_err());

        let mut value = Value::of_signed(&kp, [1u8; NONCE_BYTES], 3, b"v1".to_vec()).unwrap();
        value.sequence_number = 4;
        assert!(value.validate().is_err());
    }

    #[test]
    fn update_rule() {
        let kp = Keypair::random();
        let nonce = [2u8; NONCE_BYTES];
        let v0 = Value::of_signed(&kp, nonce, 0, b"v1".to_vec()).unwrap();
        let v1 = Value::of_signed(&kp, nonce, 1, b"v2".to_vec()).unwrap();

        assert!(v0.accepts_update(&v1).is_ok());
        assert!(v1.accepts_update(&v0).is_err());
        assert!(v0.accepts_update(&v0).is_err());

        let other_nonce = Value::of_signed(&kp, [9u8; NONCE_BYTES], 2, b"v3".to_vec()).unwrap();
        assert!(v0.accepts_update(&other_nonce).is_err());
    }

    #[test]
    fn encrypted_value_roundtrip() {
        let owner = Keypair::random();
        let recipient = Keypair::random();
        let value =
            Value::of_encrypted(&owner, recipient.id(), [3u8; NONCE_BYTES], 0, b"secret").unwrap();

        assert!(value.is_encrypted());
        assert!(value.validate().is_ok());
        assert_ne!(value.data(), b"secret");
        assert_eq!(value.decrypt_data(&recipient).unwrap(), b"secret");

        let stranger = Keypair::random();
        assert!(value.decrypt_data(&stranger).is_err());
    }

    #[test]
    fn peer_info_sign_and_verify() {
        let peer_kp = Keypair::random();
        let node_id = Id::random();
        let peer = PeerInfo::of(&peer_kp, node_id, 8888, None);

        assert!(peer.verify().is_ok());
        assert_eq!(*peer.origin(), node_id);
        assert!(!peer.is_delegated());

        let with_url = PeerInfo::of(&peer_kp, node_id, 8888, Some("https://alt.example".into()));
        assert!(with_url.verify().is_ok());
    }

    #[test]
    fn tampered_peer_info_rejected() {
        let peer_kp = Keypair::random();
        let peer = PeerInfo::of(&peer_kp, Id::random(), 8888, None);

        let mut tampered = peer.clone();
        tampered.port = 9999;
        assert!(tampered.verify().is_err());

        let mut tampered = peer.clone();
        tampered.node_id = Id::random();
        assert!(tampered.verify().is_err());

        let mut tampered = peer.clone();
        tampered.alternative_url = Some("https://evil.example".into());
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn delegated_peer_origin() {
        let peer_kp = Keypair::random();
        let node_id = Id::random();
        let origin = Id::random();
        let peer = PeerInfo::of_delegated(&peer_kp, node_id, origin, 80, None);

        assert!(peer.is_delegated());
        assert_eq!(*peer.origin(), origin);
        assert!(peer.verify().is_ok());
    }
}
