//! # Per-family engine
//!
//! One [`Dht`] per address family owns that family's routing table, token
//! manager, and task manager. It dispatches incoming requests, applies the
//! store's write rules (tokens, signatures, CAS), runs the bootstrap state
//! machine, and feeds every observed message into routing liveness.
//!
//! ## Bootstrap
//!
//! Two independent completion stages drive the connection status:
//! `fill_home_bucket` (a lookup of the local id) and `fill_all_buckets`
//! (one probe per bucket). Status transitions
//! `Disconnected → Connecting → Connected → Profound`; listeners at the
//! node level are invoked on change only.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, Result};
use crate::identity::Id;
use crate::messages::{
    Body, ErrorBody, FindPeerResponse, FindValueResponse, LookupResponse, Message,
    MAX_PACKET_BUDGET,
};
use crate::routing::{Network, NodeInfo, RoutingTable, K};
use crate::storage::DataStore;
use crate::task::{LookupOption, TaskManager, TaskResult};
use crate::token::TokenManager;

/// Peers returned per find_peer response.
const MAX_PEERS_PER_RESPONSE: usize = 8;

/// Connection status of one family's overlay membership.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// All buckets sufficiently populated.
    Profound,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Profound => "Profound",
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CompletionStatus {
    Pending,
    Completed,
}

struct BootstrapStage {
    fill_home_bucket: CompletionStatus,
    fill_all_buckets: CompletionStatus,
}

impl BootstrapStage {
    fn new() -> BootstrapStage {
        BootstrapStage {
            fill_home_bucket: CompletionStatus::Pending,
            fill_all_buckets: CompletionStatus::Pending,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    id: Id,
    addr: SocketAddr,
    last_seen_age_secs: u64,
}

#[derive(Default, Serialize, Deserialize)]
struct RoutingSnapshot {
    #[serde(default)]
    nodes: Vec<NodeRecord>,
}

/// One family's engine state. All access happens on the network actor.
pub struct Dht {
    network: Network,
    local_id: Id,
    addr: SocketAddr,
    routing: RoutingTable,
    tokens: TokenManager,
    pub tasks: TaskManager,
    bootstrap_nodes: Vec<NodeInfo>,
    status: ConnectionStatus,
    stage: BootstrapStage,
    bootstrapping: bool,
    home_task: Option<u64>,
    fill_tasks: HashSet<u64>,
    persist_path: Option<PathBuf>,
    running: bool,
}

impl Dht {
    pub fn new(network: Network, local_id: Id, addr: SocketAddr) -> Dht {
        Dht {
            network,
            local_id,
            addr,
            routing: RoutingTable::new(local_id),
            tokens: TokenManager::new(),
            tasks: TaskManager::new(),
            bootstrap_nodes: Vec::new(),
            status: ConnectionStatus::Disconnected,
            stage: BootstrapStage::new(),
            bootstrapping: false,
            home_task: None,
            fill_tasks: HashSet::new(),
            persist_path: None,
            running: false,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn enable_persistence(&mut self, path: PathBuf) {
        self.persist_path = Some(path);
    }

    /// Load persisted neighbours and go live.
    pub fn start(&mut self, bootstrap_nodes: Vec<NodeInfo>) {
        self.running = true;
        if let Some(path) = self.persist_path.clone() {
            if let Err(e) = self.load_nodes(&path) {
                warn!(network = %self.network, error = %e, "could not load routing snapshot");
            }
        }
        self.add_bootstrap_nodes(bootstrap_nodes);
        info!(
            network = %self.network,
            addr = %self.addr,
            known = self.routing.size(),
            "engine started"
        );
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        if let Some(path) = self.persist_path.clone() {
            if let Err(e) = self.save_nodes(&path) {
                warn!(network = %self.network, error = %e, "could not save routing snapshot");
            }
        }
        self.status = ConnectionStatus::Disconnected;
        info!(network = %self.network, "engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn add_bootstrap_nodes(&mut self, nodes: Vec<NodeInfo>) {
        for node in nodes {
            if node.id == self.local_id || !self.network.can_use(&node.addr) {
                continue;
            }
            if !self.bootstrap_nodes.iter().any(|n| n.id == node.id) {
                self.bootstrap_nodes.push(node);
            }
        }
    }

    // -----------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------

    /// Kick off (or restart) the two-stage bootstrap.
    pub fn begin_bootstrap(
        &mut self,
        extra: Vec<NodeInfo>,
        want: crate::messages::Want,
    ) -> Option<(ConnectionStatus, ConnectionStatus)> {
        self.add_bootstrap_nodes(extra);
        if self.bootstrapping || !self.running {
            return None;
        }
        if self.bootstrap_nodes.is_empty() && self.routing.size() == 0 {
            debug!(network = %self.network, "nothing to bootstrap from");
            return None;
        }

        self.bootstrapping = true;
        self.stage = BootstrapStage::new();

        let mut seeds = self.routing.closest(&self.local_id, K);
        for node in &self.bootstrap_nodes {
            if !seeds.iter().any(|s| s.id == node.id) {
                seeds.push(node.clone());
            }
        }
        let task = self
            .tasks
            .add_node_lookup(self.local_id, self.network, want, self.local_id, seeds);
        self.home_task = Some(task);
        info!(network = %self.network, task, "bootstrap started");
        self.update_status()
    }

    /// Bootstrap progression; returns a status transition when one happens.
    pub fn on_task_completed(
        &mut self,
        task_id: u64,
        _result: &TaskResult,
        want: crate::messages::Want,
    ) -> Option<(ConnectionStatus, ConnectionStatus)> {
        if self.home_task == Some(task_id) {
            self.home_task = None;
            self.stage.fill_home_bucket = CompletionStatus::Completed;
            debug!(network = %self.network, "home bucket fill completed");

            // Stage two: one probe per bucket.
            for target in self.routing.all_bucket_targets() {
                let task = self.tasks.add_node_lookup(
                    target,
                    self.network,
                    want,
                    self.local_id,
                    self.routing.closest(&target, K),
                );
                self.fill_tasks.insert(task);
            }
            if self.fill_tasks.is_empty() {
                self.stage.fill_all_buckets = CompletionStatus::Completed;
                self.bootstrapping = false;
            }
        } else if self.fill_tasks.remove(&task_id) && self.fill_tasks.is_empty() {
            self.stage.fill_all_buckets = CompletionStatus::Completed;
            self.bootstrapping = false;
            debug!(network = %self.network, "all-bucket fill completed");
        }
        self.update_status()
    }

    fn update_status(&mut self) -> Option<(ConnectionStatus, ConnectionStatus)> {
        let all_buckets_populated = self
            .routing
            .buckets()
            .iter()
            .all(|b| !b.entries().is_empty());
        let new = if !self.running || (self.routing.size() == 0 && !self.bootstrapping) {
            ConnectionStatus::Disconnected
        } else if self.stage.fill_all_buckets == CompletionStatus::Completed
            || (self.routing.bucket_count() > 1 && all_buckets_populated)
        {
            ConnectionStatus::Profound
        } else if self.stage.fill_home_bucket == CompletionStatus::Completed
            || self.routing.home_bucket().entries().len() >= K
        {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Connecting
        };

        if new == self.status {
            return None;
        }
        let old = self.status;
        self.status = new;
        info!(network = %self.network, %old, %new, "connection status changed");
        Some((old, new))
    }

    // -----------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------

    /// Periodic upkeep: stale-bucket probes and re-bootstrap when lonely.
    pub fn periodic_update(
        &mut self,
        want: crate::messages::Want,
    ) -> Option<(ConnectionStatus, ConnectionStatus)> {
        if !self.running {
            return None;
        }

        for target in self.routing.refresh_targets(Instant::now()) {
            self.routing.mark_refreshed(&target);
            let seeds = self.routing.closest(&target, K);
            self.tasks
                .add_node_lookup(target, self.network, want, self.local_id, seeds);
        }

        if self.routing.size() == 0 && !self.bootstrapping && !self.bootstrap_nodes.is_empty() {
            return self.begin_bootstrap(Vec::new(), want);
        }
        self.update_status()
    }

    pub fn rotate_tokens(&mut self) {
        self.tokens.rotate();
    }

    // -----------------------------------------------------------------
    // Routing liveness
    // -----------------------------------------------------------------

    /// Every incoming message makes its sender a known neighbour;
    /// responses additionally mark it alive.
    pub fn observe(&mut self, msg: &Message, responded: bool) {
        let Some(origin) = msg.origin else {
            return;
        };
        if msg.id == self.local_id || !self.network.can_use(&origin) {
            return;
        }
        self.routing
            .insert(NodeInfo::new(msg.id, origin).with_version(msg.version));
        if responded {
            self.routing.on_response(&msg.id);
        }
    }

    pub fn on_send(&mut self, target: &Id) {
        self.routing.on_send(target);
    }

    pub fn on_timeout(&mut self, target: &Id) {
        self.routing.on_timeout(target);
    }

    // -----------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------

    fn seeds_for(&self, target: &Id) -> Vec<NodeInfo> {
        let mut seeds = self.routing.closest(target, K);
        if seeds.is_empty() {
            seeds.extend(self.bootstrap_nodes.iter().cloned());
        }
        seeds
    }

    pub fn start_find_node(&mut self, target: Id, want: crate::messages::Want) -> u64 {
        let seeds = self.seeds_for(&target);
        self.tasks
            .add_node_lookup(target, self.network, want, self.local_id, seeds)
    }

    pub fn start_find_value(
        &mut self,
        target: Id,
        want: crate::messages::Want,
        option: LookupOption,
    ) -> u64 {
        let seeds = self.seeds_for(&target);
        self.tasks
            .add_value_lookup(target, self.network, want, self.local_id, seeds, option)
    }

    pub fn start_find_peer(
        &mut self,
        target: Id,
        want: crate::messages::Want,
        expected: usize,
    ) -> u64 {
        let seeds = self.seeds_for(&target);
        self.tasks
            .add_peer_lookup(target, self.network, want, self.local_id, seeds, expected)
    }

    // -----------------------------------------------------------------
    // Request handlers
    // -----------------------------------------------------------------

    /// Dispatch one incoming request. `nodes4`/`nodes6` are the closest
    /// node lists already assembled for the request's target and want mask.
    pub fn handle_request(
        &mut self,
        msg: &Message,
        nodes4: Vec<NodeInfo>,
        nodes6: Vec<NodeInfo>,
        store: &mut dyn DataStore,
    ) -> Option<Message> {
        let origin = msg.origin?;
        let mut response = match &msg.body {
            Body::PingRequest => Message::respond_to(msg, Body::PingResponse),
            Body::FindNodeRequest(_) => Message::respond_to(
                msg,
                Body::FindNodeResponse(LookupResponse {
                    nodes4,
                    nodes6,
                    token: 0,
                }),
            ),
            Body::FindValueRequest(q) => {
                let token = self.tokens.generate(&msg.id, &origin, &q.target);
                Message::respond_to(
                    msg,
                    Body::FindValueResponse(FindValueResponse {
                        nodes: LookupResponse {
                            nodes4,
                            nodes6,
                            token,
                        },
                        value: store.value(&q.target).cloned(),
                    }),
                )
            }
            Body::FindPeerRequest(q) => {
                let token = self.tokens.generate(&msg.id, &origin, &q.target);
                let peers = store.peers(&q.target, self.network, MAX_PEERS_PER_RESPONSE);
                let (peers4, peers6) = match self.network {
                    Network::V4 => (peers, Vec::new()),
                    Network::V6 => (Vec::new(), peers),
                };
                Message::respond_to(
                    msg,
                    Body::FindPeerResponse(FindPeerResponse {
                        nodes: LookupResponse {
                            nodes4,
                            nodes6,
                            token,
                        },
                        peers4,
                        peers6,
                    }),
                )
            }
            Body::StoreValueRequest(_) => self.handle_store_value(msg, origin, store),
            Body::AnnouncePeerRequest(_) => self.handle_announce_peer(msg, origin, store),
            _ => {
                debug!(msg = %msg, "non-request body in request path");
                return None;
            }
        };
        trim_response(&mut response);
        Some(response)
    }

    fn handle_store_value(
        &mut self,
        msg: &Message,
        origin: SocketAddr,
        store: &mut dyn DataStore,
    ) -> Message {
        let Body::StoreValueRequest(q) = &msg.body else {
            unreachable!("checked by caller");
        };
        let value_id = q.value.id();

        if !self.tokens.verify(&msg.id, &origin, &value_id, q.token) {
            return error_response(msg, ErrorCode::InvalidToken, "invalid or expired token");
        }
        if q.value.validate().is_err() {
            return error_response(msg, ErrorCode::InvalidSignature, "value failed validation");
        }

        if let Some(existing) = store.value(&value_id) {
            if existing.is_mutable() != q.value.is_mutable() {
                return error_response(
                    msg,
                    ErrorCode::ImmutableSubstitution,
                    "cannot substitute between immutable and mutable",
                );
            }
            if q.value.is_mutable() {
                if existing.public_key() != q.value.public_key()
                    || existing.recipient() != q.value.recipient()
                    || existing.nonce() != q.value.nonce()
                {
                    return error_response(
                        msg,
                        ErrorCode::ImmutableSubstitution,
                        "owner material does not match the stored value",
                    );
                }
                if let Some(cas) = q.expected_seq {
                    if existing.sequence_number() != cas {
                        return error_response(
                            msg,
                            ErrorCode::CasFail,
                            format!(
                                "expected sequence {cas}, stored {}",
                                existing.sequence_number()
                            ),
                        );
                    }
                }
                if q.value.sequence_number() <= existing.sequence_number() {
                    return error_response(
                        msg,
                        ErrorCode::SeqNotMonotonic,
                        "sequence number must increase",
                    );
                }
            }
        }

        store.put_value(q.value.clone(), false);
        debug!(network = %self.network, id = %value_id, "value stored");
        Message::respond_to(msg, Body::StoreValueResponse)
    }

    fn handle_announce_peer(
        &mut self,
        msg: &Message,
        origin: SocketAddr,
        store: &mut dyn DataStore,
    ) -> Message {
        let Body::AnnouncePeerRequest(q) = &msg.body else {
            unreachable!("checked by caller");
        };

        if !self.tokens.verify(&msg.id, &origin, &q.peer_id, q.token) {
            return error_response(msg, ErrorCode::InvalidToken, "invalid or expired token");
        }
        let peer = q.to_peer(msg.id);
        if peer.verify().is_err() {
            return error_response(msg, ErrorCode::InvalidSignature, "peer record failed validation");
        }

        store.put_peer(peer, self.network, false);
        debug!(network = %self.network, peer = %q.peer_id, "peer announcement stored");
        Message::respond_to(msg, Body::AnnouncePeerResponse)
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    /// Write the routing snapshot now, if persistence is enabled.
    pub fn persist(&self) -> Result<()> {
        match &self.persist_path {
            Some(path) => self.save_nodes(path),
            None => Ok(()),
        }
    }

    fn save_nodes(&self, path: &Path) -> Result<()> {
        let now = Instant::now();
        let snapshot = RoutingSnapshot {
            nodes: self
                .routing
                .dump()
                .into_iter()
                .map(|n| NodeRecord {
                    id: n.id,
                    addr: n.addr,
                    last_seen_age_secs: n
                        .last_seen()
                        .map(|seen| now.duration_since(seen).as_secs())
                        .unwrap_or(u64::MAX),
                })
                .collect(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let file = fs::File::create(&tmp)?;
        ciborium::into_writer(&snapshot, file)
            .map_err(|e| crate::error::Error::Persistence(format!("routing encode: {e}")))?;
        fs::rename(&tmp, path)?;
        debug!(network = %self.network, nodes = snapshot.nodes.len(), "routing snapshot saved");
        Ok(())
    }

    fn load_nodes(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let file = fs::File::open(path)?;
        let snapshot: RoutingSnapshot = match ciborium::from_reader(file) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable routing snapshot");
                return Ok(());
            }
        };
        let count = snapshot.nodes.len();
        for record in snapshot.nodes {
            self.routing.insert(NodeInfo::new(record.id, record.addr));
        }
        debug!(network = %self.network, nodes = count, "routing snapshot loaded");
        Ok(())
    }
}

fn error_response(msg: &Message, code: ErrorCode, text: impl Into<String>) -> Message {
    Message::respond_to(
        msg,
        Body::Error(ErrorBody {
            method: msg.method(),
            code: code.code(),
            message: text.into(),
        }),
    )
}

/// Shrink list-bearing responses until they fit a single packet.
fn trim_response(msg: &mut Message) {
    loop {
        if msg.estimate_size() <= MAX_PACKET_BUDGET {
            return;
        }
        let trimmed = match &mut msg.body {
            Body::FindNodeResponse(r) => trim_nodes(r),
            Body::FindValueResponse(r) => trim_nodes(&mut r.nodes),
            Body::FindPeerResponse(r) => {
                trim_nodes(&mut r.nodes)
                    || r.peers6.pop().is_some()
                    || r.peers4.pop().is_some()
            }
            _ => false,
        };
        if !trimmed {
            return;
        }
    }
}

fn trim_nodes(r: &mut LookupResponse) -> bool {
    if r.nodes6.len() >= r.nodes4.len() && !r.nodes6.is_empty() {
        r.nodes6.pop();
        true
    } else if !r.nodes4.is_empty() {
        r.nodes4.pop();
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::messages::{LookupRequest, StoreValueRequest, Want};
    use crate::storage::MemStore;
    use crate::value::{PeerInfo, Value};

    fn engine() -> (Dht, Keypair) {
        let kp = Keypair::random();
        let dht = Dht::new(
            Network::V4,
            kp.id(),
            "127.0.0.1:39000".parse().unwrap(),
        );
        (dht, kp)
    }

    fn incoming(sender: &Keypair, body: Body) -> Message {
        let mut msg = Message::new(body);
        msg.id = sender.id();
        msg.txid = 7;
        msg.origin = Some("127.0.0.1:40001".parse().unwrap());
        msg
    }

    fn fresh_token(dht: &Dht, sender: &Keypair, target: &Id) -> u32 {
        dht.tokens.generate(
            &sender.id(),
            &"127.0.0.1:40001".parse().unwrap(),
            target,
        )
    }

    #[test]
    fn ping_is_answered() {
        let (mut dht, _) = engine();
        let sender = Keypair::random();
        let mut store = MemStore::new();
        let msg = incoming(&sender, Body::PingRequest);
        let response = dht
            .handle_request(&msg, Vec::new(), Vec::new(), &mut store)
            .unwrap();
        assert_eq!(response.body, Body::PingResponse);
        assert_eq!(response.txid, msg.txid);
    }

    #[test]
    fn find_value_returns_stored_value_and_token() {
        let (mut dht, _) = engine();
        let sender = Keypair::random();
        let mut store = MemStore::new();
        let value = Value::of_immutable(b"Hello".to_vec());
        store.put_value(value.clone(), false);

        let msg = incoming(
            &sender,
            Body::FindValueRequest(LookupRequest {
                target: value.id(),
                want: Want { v4: true, v6: false },
            }),
        );
        let response = dht
            .handle_request(&msg, Vec::new(), Vec::new(), &mut store)
            .unwrap();
        match response.body {
            Body::FindValueResponse(r) => {
                assert_eq!(r.value, Some(value));
                assert_ne!(r.nodes.token, 0);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn store_value_requires_token() {
        let (mut dht, _) = engine();
        let sender = Keypair::random();
        let mut store = MemStore::new();
        let value = Value::of_immutable(b"Hello".to_vec());

        let msg = incoming(
            &sender,
            Body::StoreValueRequest(StoreValueRequest {
                token: 0xBAD,
                value,
                expected_seq: None,
            }),
        );
        let response = dht
            .handle_request(&msg, Vec::new(), Vec::new(), &mut store)
            .unwrap();
        match response.body {
            Body::Error(e) => assert_eq!(e.code, ErrorCode::InvalidToken.code()),
            other => panic!("{other:?}"),
        }
        assert_eq!(store.value_count(), 0);
    }

    #[test]
    fn store_value_happy_path_and_seq_rules() {
        let (mut dht, _) = engine();
        let sender = Keypair::random();
        let owner = Keypair::random();
        let mut store = MemStore::new();
        let nonce = [3u8; 24];

        let v0 = Value::of_signed(&owner, nonce, 0, b"v1".to_vec()).unwrap();
        let target = v0.id();

        let msg = incoming(
            &sender,
            Body::StoreValueRequest(StoreValueRequest {
                token: fresh_token(&dht, &sender, &target),
                value: v0.clone(),
                expected_seq: None,
            }),
        );
        let response = dht
            .handle_request(&msg, Vec::new(), Vec::new(), &mut store)
            .unwrap();
        assert_eq!(response.body, Body::StoreValueResponse);
        assert_eq!(store.value(&target), Some(&v0));

        // Replay of the same sequence number is rejected.
        let msg = incoming(
            &sender,
            Body::StoreValueRequest(StoreValueRequest {
                token: fresh_token(&dht, &sender, &target),
                value: v0.clone(),
                expected_seq: None,
            }),
        );
        let response = dht
            .handle_request(&msg, Vec::new(), Vec::new(), &mut store)
            .unwrap();
        match response.body {
            Body::Error(e) => assert_eq!(e.code, ErrorCode::SeqNotMonotonic.code()),
            other => panic!("{other:?}"),
        }

        // Update with a higher sequence number is accepted.
        let v1 = Value::of_signed(&owner, nonce, 1, b"v2".to_vec()).unwrap();
        let msg = incoming(
            &sender,
            Body::StoreValueRequest(StoreValueRequest {
                token: fresh_token(&dht, &sender, &target),
                value: v1.clone(),
                expected_seq: Some(0),
            }),
        );
        let response = dht
            .handle_request(&msg, Vec::new(), Vec::new(), &mut store)
            .unwrap();
        assert_eq!(response.body, Body::StoreValueResponse);
        assert_eq!(store.value(&target), Some(&v1));

        // Stale CAS expectation fails.
        let v2 = Value::of_signed(&owner, nonce, 2, b"v3".to_vec()).unwrap();
        let msg = incoming(
            &sender,
            Body::StoreValueRequest(StoreValueRequest {
                token: fresh_token(&dht, &sender, &target),
                value: v2,
                expected_seq: Some(0),
            }),
        );
        let response = dht
            .handle_request(&msg, Vec::new(), Vec::new(), &mut store)
            .unwrap();
        match response.body {
            Body::Error(e) => assert_eq!(e.code, ErrorCode::CasFail.code()),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn forged_value_rejected() {
        let (mut dht, _) = engine();
        let sender = Keypair::random();
        let owner = Keypair::random();
        let mut store = MemStore::new();

        let mut value = Value::of_signed(&owner, [1u8; 24], 0, b"v1".to_vec()).unwrap();
        value.data = b"forged".to_vec();
        let target = value.id();

        let msg = incoming(
            &sender,
            Body::StoreValueRequest(StoreValueRequest {
                token: fresh_token(&dht, &sender, &target),
                value,
                expected_seq: None,
            }),
        );
        let response = dht
            .handle_request(&msg, Vec::new(), Vec::new(), &mut store)
            .unwrap();
        match response.body {
            Body::Error(e) => assert_eq!(e.code, ErrorCode::InvalidSignature.code()),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn announce_and_find_peer() {
        let (mut dht, _) = engine();
        let announcer = Keypair::random();
        let peer_kp = Keypair::random();
        let mut store = MemStore::new();

        let peer = PeerInfo::of(&peer_kp, announcer.id(), 8888, None);
        let request = crate::messages::AnnouncePeerRequest::from_peer(
            fresh_token(&dht, &announcer, &peer_kp.id()),
            &peer,
        );
        let msg = incoming(&announcer, Body::AnnouncePeerRequest(request));
        let response = dht
            .handle_request(&msg, Vec::new(), Vec::new(), &mut store)
            .unwrap();
        assert_eq!(response.body, Body::AnnouncePeerResponse);

        // And it comes back out of find_peer.
        let msg = incoming(
            &announcer,
            Body::FindPeerRequest(LookupRequest {
                target: peer_kp.id(),
                want: Want { v4: true, v6: false },
            }),
        );
        let response = dht
            .handle_request(&msg, Vec::new(), Vec::new(), &mut store)
            .unwrap();
        match response.body {
            Body::FindPeerResponse(r) => {
                assert_eq!(r.peers4, vec![peer]);
                assert!(r.peers6.is_empty());
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn announce_with_tampered_signature_rejected() {
        let (mut dht, _) = engine();
        let announcer = Keypair::random();
        let peer_kp = Keypair::random();
        let mut store = MemStore::new();

        let peer = PeerInfo::of(&peer_kp, announcer.id(), 8888, None);
        let mut request = crate::messages::AnnouncePeerRequest::from_peer(
            fresh_token(&dht, &announcer, &peer_kp.id()),
            &peer,
        );
        request.port = 9999;
        let msg = incoming(&announcer, Body::AnnouncePeerRequest(request));
        let response = dht
            .handle_request(&msg, Vec::new(), Vec::new(), &mut store)
            .unwrap();
        match response.body {
            Body::Error(e) => assert_eq!(e.code, ErrorCode::InvalidSignature.code()),
            other => panic!("{other:?}"),
        }
        assert_eq!(store.peer_count(), 0);
    }

    #[test]
    fn oversized_response_is_trimmed() {
        let nodes: Vec<NodeInfo> = (0..60)
            .map(|i| {
                NodeInfo::new(
                    Id::random(),
                    format!("10.2.{}.{}:39001", i / 250, i % 250 + 1).parse().unwrap(),
                )
            })
            .collect();
        let mut msg = Message::new(Body::FindNodeResponse(LookupResponse {
            nodes4: nodes,
            nodes6: Vec::new(),
            token: 0,
        }));
        assert!(msg.estimate_size() > MAX_PACKET_BUDGET);
        trim_response(&mut msg);
        assert!(msg.estimate_size() <= MAX_PACKET_BUDGET);
        match &msg.body {
            Body::FindNodeResponse(r) => assert!(!r.nodes4.is_empty()),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn observe_tracks_senders() {
        let (mut dht, _) = engine();
        let sender = Keypair::random();
        let msg = incoming(&sender, Body::PingRequest);

        dht.observe(&msg, false);
        assert_eq!(dht.routing().size(), 1);
        assert!(!dht.routing().get(&sender.id()).unwrap().is_reachable());

        dht.observe(&msg, true);
        assert!(dht.routing().get(&sender.id()).unwrap().is_reachable());
    }

    #[test]
    fn bootstrap_stage_transitions() {
        let (mut dht, _) = engine();
        dht.start(Vec::new());
        assert_eq!(dht.status(), ConnectionStatus::Disconnected);

        let seed = NodeInfo::new(Id::random(), "127.0.0.1:41000".parse().unwrap());
        let transition = dht.begin_bootstrap(vec![seed], Want { v4: true, v6: false });
        assert_eq!(
            transition,
            Some((ConnectionStatus::Disconnected, ConnectionStatus::Connecting))
        );

        // Neighbours discovered during the bootstrap lookups.
        for port in 42000..42006u16 {
            let sender = Keypair::random();
            let mut msg = Message::new(Body::PingResponse);
            msg.id = sender.id();
            msg.origin = Some(format!("127.0.0.1:{port}").parse().unwrap());
            dht.observe(&msg, true);
        }

        // Completing the home task moves to stage two; completing stage two
        // tasks reaches Profound.
        let home = dht.home_task.unwrap();
        let result = TaskResult::Acks(Vec::new());
        dht.on_task_completed(home, &result, Want { v4: true, v6: false });
        let fill: Vec<u64> = dht.fill_tasks.iter().copied().collect();
        assert!(!fill.is_empty());
        for task in fill {
            dht.on_task_completed(task, &result, Want { v4: true, v6: false });
        }
        assert_eq!(dht.status(), ConnectionStatus::Profound);
    }
}
