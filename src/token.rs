//! Short-lived HMAC tokens gating write-class requests.
//!
//! A token proves a recent `find_*` interaction: it is an HMAC-SHA256 over
//! `(sender_id, sender_address, target_id)` under a rotating secret,
//! truncated to 4 bytes. Two secrets are kept; rotation every 5 minutes
//! gives a 5-10 minute validity window. Secrets are ephemeral and never
//! persisted.

use std::net::SocketAddr;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::identity::Id;

type HmacSha256 = Hmac<Sha256>;

/// Secret rotation interval.
pub const TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct TokenManager {
    current: [u8; 32],
    previous: [u8; 32],
}

impl TokenManager {
    pub fn new() -> TokenManager {
        TokenManager {
            current: random_secret(),
            previous: random_secret(),
        }
    }

    /// Age out the previous secret and draw a fresh current one.
    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = random_secret();
    }

    /// Token for a `(sender, address, target)` triple under the current secret.
    pub fn generate(&self, sender: &Id, address: &SocketAddr, target: &Id) -> u32 {
        compute(&self.current, sender, address, target)
    }

    /// Accepts tokens minted under either live secret.
    pub fn verify(&self, sender: &Id, address: &SocketAddr, target: &Id, token: u32) -> bool {
        token != 0
            && (compute(&self.current, sender, address, target) == token
                || compute(&self.previous, sender, address, target) == token)
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    secret
}

fn compute(secret: &[u8; 32], sender: &Id, address: &SocketAddr, target: &Id) -> u32 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(sender.as_bytes());
    match address.ip() {
        std::net::IpAddr::V4(ip) => mac.update(&ip.octets()),
        std::net::IpAddr::V6(ip) => mac.update(&ip.octets()),
    }
    mac.update(&address.port().to_be_bytes());
    mac.update(target.as_bytes());
    let digest = mac.finalize().into_bytes();
    u32::from_be_bytes(digest[..4].try_into().expect("digest is long enough"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn fresh_token_verifies() {
        let manager = TokenManager::new();
        let sender = Id::random();
        let target = Id::random();
        let token = manager.generate(&sender, &addr(1234), &target);
        assert!(manager.verify(&sender, &addr(1234), &target, token));
    }

    #[test]
    fn token_is_bound_to_all_inputs() {
        let manager = TokenManager::new();
        let sender = Id::random();
        let target = Id::random();
        let token = manager.generate(&sender, &addr(1234), &target);

        assert!(!manager.verify(&Id::random(), &addr(1234), &target, token));
        assert!(!manager.verify(&sender, &addr(4321), &target, token));
        assert!(!manager.verify(&sender, &addr(1234), &Id::random(), token));
        assert!(!manager.verify(&sender, &addr(1234), &target, token.wrapping_add(1)));
    }

    #[test]
    fn survives_one_rotation_not_two() {
        let mut manager = TokenManager::new();
        let sender = Id::random();
        let target = Id::random();
        let token = manager.generate(&sender, &addr(1234), &target);

        manager.rotate();
        assert!(manager.verify(&sender, &addr(1234), &target, token));

        manager.rotate();
        assert!(!manager.verify(&sender, &addr(1234), &target, token));
    }

    #[test]
    fn zero_token_never_verifies() {
        let manager = TokenManager::new();
        assert!(!manager.verify(&Id::random(), &addr(1), &Id::random(), 0));
    }
}
