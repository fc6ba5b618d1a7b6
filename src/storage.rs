//! # Data store
//!
//! Long-term storage of values and peer announcements, consumed by the
//! request handlers and the republish schedule. The [`DataStore`] trait is
//! the seam: the engine only needs get/put, republish listing, and snapshot
//! persistence. [`MemStore`] is the in-memory implementation with a
//! self-describing CBOR snapshot format.
//!
//! Records keep their original announce timestamp so republishing stays on
//! the announcer's schedule across restarts.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identity::Id;
use crate::routing::Network;
use crate::value::{PeerInfo, Value};

/// Owned records are re-announced this often.
pub const REPUBLISH_INTERVAL: Duration = Duration::from_secs(60 * 60);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage capability used by the per-family engines.
pub trait DataStore: Send {
    /// Insert or overwrite a value. `announced` marks records owned by the
    /// local user, which are republished periodically.
    fn put_value(&mut self, value: Value, announced: bool);

    fn value(&self, id: &Id) -> Option<&Value>;

    /// Insert or refresh a peer announcement (unique per `(peer_id, node_id)`).
    fn put_peer(&mut self, peer: PeerInfo, network: Network, announced: bool);

    /// Announcements for `peer_id` seen on `network`, capped at `max`.
    fn peers(&self, peer_id: &Id, network: Network, max: usize) -> Vec<PeerInfo>;

    /// Owned values due for re-announcement; refreshes their timestamps.
    fn values_to_republish(&mut self) -> Vec<Value>;

    /// Owned peer records due for re-announcement; refreshes their timestamps.
    fn peers_to_republish(&mut self) -> Vec<PeerInfo>;

    fn save(&self, path: &Path) -> Result<()>;

    fn load(&mut self, path: &Path) -> Result<()>;
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredValue {
    value: Value,
    announced: bool,
    timestamp: u64,
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredPeer {
    peer: PeerInfo,
    network: Network,
    announced: bool,
    timestamp: u64,
}

/// Self-describing snapshot schema; unknown future fields are ignored on
/// load so the format survives version changes.
#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    values: Vec<StoredValue>,
    #[serde(default)]
    peers: Vec<StoredPeer>,
}

/// In-memory store with CBOR snapshot persistence.
#[derive(Default)]
pub struct MemStore {
    values: HashMap<Id, StoredValue>,
    peers: HashMap<Id, Vec<StoredPeer>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.values().map(Vec::len).sum()
    }
}

impl DataStore for MemStore {
    fn put_value(&mut self, value: Value, announced: bool) {
        let id = value.id();
        self.values.insert(
            id,
            StoredValue {
                value,
                announced,
                timestamp: now_secs(),
            },
        );
    }

    fn value(&self, id: &Id) -> Option<&Value> {
        self.values.get(id).map(|s| &s.value)
    }

    fn put_peer(&mut self, peer: PeerInfo, network: Network, announced: bool) {
        let entries = self.peers.entry(*peer.peer_id()).or_default();
        let record = StoredPeer {
            network,
            announced,
            timestamp: now_secs(),
            peer,
        };
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.peer.node_id() == record.peer.node_id())
        {
            *existing = record;
        } else {
            entries.push(record);
        }
    }

    fn peers(&self, peer_id: &Id, network: Network, max: usize) -> Vec<PeerInfo> {
        self.peers
            .get(peer_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.network == network)
                    .take(max)
                    .map(|e| e.peer.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn values_to_republish(&mut self) -> Vec<Value> {
        let now = now_secs();
        let deadline = REPUBLISH_INTERVAL.as_secs();
        let mut due = Vec::new();
        for stored in self.values.values_mut() {
            if stored.announced && now.saturating_sub(stored.timestamp) >= deadline {
                stored.timestamp = now;
                due.push(stored.value.clone());
            }
        }
        due
    }

    fn peers_to_republish(&mut self) -> Vec<PeerInfo> {
        let now = now_secs();
        let deadline = REPUBLISH_INTERVAL.as_secs();
        let mut due = Vec::new();
        for entries in self.peers.values_mut() {
            for stored in entries.iter_mut() {
                if stored.announced && now.saturating_sub(stored.timestamp) >= deadline {
                    stored.timestamp = now;
                    due.push(stored.peer.clone());
                }
            }
        }
        due
    }

    fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            values: self.values.values().cloned().collect(),
            peers: self.peers.values().flatten().cloned().collect(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let file = fs::File::create(&tmp)?;
        ciborium::into_writer(&snapshot, file)
            .map_err(|e| Error::Persistence(format!("snapshot encode: {e}")))?;
        fs::rename(&tmp, path)?;
        debug!(
            values = snapshot.values.len(),
            peers = snapshot.peers.len(),
            path = %path.display(),
            "data store saved"
        );
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let file = fs::File::open(path)?;
        let snapshot: Snapshot = match ciborium::from_reader(file) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable data store snapshot, starting empty");
                return Ok(());
            }
        };
        for stored in snapshot.values {
            self.values.insert(stored.value.id(), stored);
        }
        for stored in snapshot.peers {
            self.peers
                .entry(*stored.peer.peer_id())
                .or_default()
                .push(stored);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn value_roundtrip() {
        let mut store = MemStore::new();
        let value = Value::of_immutable(b"Hello".to_vec());
        let id = value.id();
        store.put_value(value.clone(), false);
        assert_eq!(store.value(&id), Some(&value));
        assert_eq!(store.value(&Id::random()), None);
    }

    #[test]
    fn peer_uniqueness_per_announcer() {
        let mut store = MemStore::new();
        let kp = Keypair::random();
        let node_a = Id::random();
        let node_b = Id::random();

        store.put_peer(PeerInfo::of(&kp, node_a, 80, None), Network::V4, false);
        store.put_peer(PeerInfo::of(&kp, node_b, 80, None), Network::V4, false);
        // Re-announce from the same node replaces rather than duplicates.
        store.put_peer(PeerInfo::of(&kp, node_a, 81, None), Network::V4, false);

        let peers = store.peers(&kp.id(), Network::V4, 8);
        assert_eq!(peers.len(), 2);
        let from_a: Vec<_> = peers.iter().filter(|p| *p.node_id() == node_a).collect();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].port(), 81);
    }

    #[test]
    fn peers_filtered_by_family() {
        let mut store = MemStore::new();
        let kp = Keypair::random();
        store.put_peer(PeerInfo::of(&kp, Id::random(), 80, None), Network::V4, false);
        store.put_peer(PeerInfo::of(&kp, Id::random(), 80, None), Network::V6, false);

        assert_eq!(store.peers(&kp.id(), Network::V4, 8).len(), 1);
        assert_eq!(store.peers(&kp.id(), Network::V6, 8).len(), 1);
    }

    #[test]
    fn republish_only_announced_and_due() {
        let mut store = MemStore::new();
        let owned = Value::of_immutable(b"mine".to_vec());
        let foreign = Value::of_immutable(b"theirs".to_vec());
        store.put_value(owned.clone(), true);
        store.put_value(foreign, false);

        // Nothing is due right after storing.
        assert!(store.values_to_republish().is_empty());

        // Age the owned record past the interval.
        store
            .values
            .get_mut(&owned.id())
            .unwrap()
            .timestamp = now_secs() - REPUBLISH_INTERVAL.as_secs() - 1;
        let due = store.values_to_republish();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id(), owned.id());
        // Timestamp refreshed; not due again immediately.
        assert!(store.values_to_republish().is_empty());
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = std::env::temp_dir().join(format!("warren-store-{}", std::process::id()));
        let path = dir.join("store.cbor");
        let _ = fs::remove_file(&path);

        let mut store = MemStore::new();
        let kp = Keypair::random();
        let value = Value::of_signed(&kp, [5u8; 24], 1, b"persisted".to_vec()).unwrap();
        store.put_value(value.clone(), true);
        store.put_peer(PeerInfo::of(&kp, Id::random(), 443, None), Network::V4, true);
        store.save(&path).unwrap();

        let mut restored = MemStore::new();
        restored.load(&path).unwrap();
        assert_eq!(restored.value(&value.id()), Some(&value));
        assert_eq!(restored.peers(&kp.id(), Network::V4, 8).len(), 1);

        let _ = fs::remove_file(&path);
        let _ = fs::remove_dir(&dir);
    }

    #[test]
    fn missing_snapshot_is_fine() {
        let mut store = MemStore::new();
        assert!(store
            .load(Path::new("/nonexistent/warren/store.cbor"))
            .is_ok());
    }
}
