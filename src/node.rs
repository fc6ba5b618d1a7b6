//! # Node façade
//!
//! A [`Node`] is a cheap-to-clone handle onto the network actor, which owns
//! both per-family engines, the shared RPC server, the data store, and the
//! scheduler. Public calls cross the thread boundary as commands over a
//! bounded channel and resolve through oneshot completions; every mutation
//! of routing tables, the call table, and task state happens on the actor.
//!
//! Public lookups run per family and present both halves as a
//! [`NodeResult`]. Store and announce operations chain two tasks per
//! family: a token-collecting lookup, then the write fan-out to the K
//! closest responders.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dht::{ConnectionStatus, Dht};
use crate::error::{Error, Result};
use crate::identity::{closer_to, Id, Keypair};
use crate::messages::{Message, Want};
use crate::routing::{Network, NodeInfo, K};
use crate::rpc::{
    Incoming, RpcCall, RpcServer, StatsSnapshot, TaskRef, MAX_DATA_PACKET_SIZE, PERIODIC_INTERVAL,
};
use crate::scheduler::Scheduler;
use crate::storage::{DataStore, MemStore};
use crate::task::{LookupOption, TaskAction, TaskResult};
use crate::token::TOKEN_ROTATION_INTERVAL;
use crate::value::{PeerInfo, Value};

/// Command channel depth; back-pressure applies when full.
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Engine upkeep cadence (stale buckets, re-bootstrap checks).
const DHT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Persisted-state write cadence.
const PERSIST_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How often the store is scanned for records due for republish.
const REPUBLISH_SCAN_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Reachability re-evaluation cadence.
const REACHABILITY_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Per-family halves of a dual-stack result.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeResult<T> {
    pub v4: Option<T>,
    pub v6: Option<T>,
}

impl<T> Default for NodeResult<T> {
    fn default() -> Self {
        NodeResult { v4: None, v6: None }
    }
}

impl<T> NodeResult<T> {
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }

    pub fn has_value(&self) -> bool {
        !self.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.v4.is_some() && self.v6.is_some()
    }

    pub fn get(&self, network: Network) -> Option<&T> {
        match network {
            Network::V4 => self.v4.as_ref(),
            Network::V6 => self.v6.as_ref(),
        }
    }

    pub fn set(&mut self, network: Network, value: T) {
        match network {
            Network::V4 => self.v4 = Some(value),
            Network::V6 => self.v6 = Some(value),
        }
    }
}

/// Overall node lifecycle, for [`NodeStatusListener`]s.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeStatus {
    Stopped,
    Initializing,
    Running,
}

/// Connection status events per family. All methods default to no-ops so
/// listeners implement only what they care about.
pub trait ConnectionStatusListener: Send {
    fn status_changed(&mut self, network: Network, new: ConnectionStatus, old: ConnectionStatus) {
        let _ = (network, new, old);
    }
    fn connected(&mut self, network: Network) {
        let _ = network;
    }
    fn profound(&mut self, network: Network) {
        let _ = network;
    }
    fn disconnected(&mut self, network: Network) {
        let _ = network;
    }
}

pub trait NodeStatusListener: Send {
    fn status_changed(&mut self, new: NodeStatus, old: NodeStatus) {
        let _ = (new, old);
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    FindNode {
        target: Id,
        deadline: Option<Duration>,
        reply: Reply<NodeResult<NodeInfo>>,
    },
    FindValue {
        target: Id,
        option: LookupOption,
        deadline: Option<Duration>,
        reply: Reply<Option<Value>>,
    },
    StoreValue {
        value: Value,
        expected_seq: Option<i32>,
        deadline: Option<Duration>,
        reply: Reply<Vec<NodeInfo>>,
    },
    FindPeer {
        target: Id,
        expected: usize,
        deadline: Option<Duration>,
        reply: Reply<Vec<PeerInfo>>,
    },
    AnnouncePeer {
        peer: PeerInfo,
        deadline: Option<Duration>,
        reply: Reply<Vec<NodeInfo>>,
    },
    Bootstrap {
        nodes: Vec<NodeInfo>,
        reply: oneshot::Sender<()>,
    },
    Status {
        network: Network,
        reply: oneshot::Sender<ConnectionStatus>,
    },
    KnownNodes {
        network: Network,
        reply: oneshot::Sender<Vec<NodeInfo>>,
    },
    Stats {
        reply: oneshot::Sender<StatsSnapshot>,
    },
    AddConnectionListener(Box<dyn ConnectionStatusListener>),
    AddNodeListener(Box<dyn NodeStatusListener>),
    Stop {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
enum Job {
    DhtUpdate(Network),
    TokenRotation(Network),
    Persist,
    RepublishScan,
    ReachabilityCheck,
    RateWindow,
    CancelOp(u64),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and starts a [`Node`].
#[derive(Default)]
pub struct NodeBuilder {
    keypair: Option<Keypair>,
    addr4: Option<SocketAddr>,
    addr6: Option<SocketAddr>,
    storage_dir: Option<PathBuf>,
    bootstrap: Vec<NodeInfo>,
}

impl NodeBuilder {
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn addr4(mut self, addr: SocketAddr) -> Self {
        self.addr4 = Some(addr);
        self
    }

    pub fn addr6(mut self, addr: SocketAddr) -> Self {
        self.addr6 = Some(addr);
        self
    }

    /// Enable persistence of routing tables and the data store under `dir`.
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    pub fn bootstrap(mut self, nodes: Vec<NodeInfo>) -> Self {
        self.bootstrap = nodes;
        self
    }

    /// Bind the sockets, start both engines, and spawn the network actor.
    pub async fn build(self) -> Result<Node> {
        let keypair = self.keypair.unwrap_or_else(Keypair::random);
        let id = keypair.id();

        let server = RpcServer::start(&keypair, self.addr4, self.addr6).await?;
        let addr4 = server.bound_addr(Network::V4);
        let addr6 = server.bound_addr(Network::V6);

        let mut store = MemStore::new();
        if let Some(dir) = &self.storage_dir {
            store.load(&dir.join("store.cbor"))?;
        }

        let mut make_dht = |network: Network, addr: SocketAddr| {
            let mut dht = Dht::new(network, id, addr);
            if let Some(dir) = &self.storage_dir {
                let file = match network {
                    Network::V4 => "routing4.cbor",
                    Network::V6 => "routing6.cbor",
                };
                dht.enable_persistence(dir.join(file));
            }
            dht.start(self.bootstrap.clone());
            dht
        };
        let dht4 = addr4.map(|a| make_dht(Network::V4, a));
        let dht6 = addr6.map(|a| make_dht(Network::V6, a));

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let actor = NodeActor {
            local_id: id,
            server,
            dht4,
            dht6,
            store: Box::new(store),
            scheduler: Scheduler::new(),
            ops: HashMap::new(),
            next_op: 1,
            task_ops: HashMap::new(),
            conn_listeners: Vec::new(),
            node_listeners: Vec::new(),
            node_status: NodeStatus::Initializing,
            storage_dir: self.storage_dir,
        };
        tokio::spawn(actor.run(cmd_rx));

        info!(id = %id, ?addr4, ?addr6, "node started");
        Ok(Node {
            id,
            cmd_tx,
            addr4,
            addr6,
        })
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to a running overlay node.
#[derive(Clone)]
pub struct Node {
    id: Id,
    cmd_tx: mpsc::Sender<Command>,
    addr4: Option<SocketAddr>,
    addr6: Option<SocketAddr>,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn local_addr(&self, network: Network) -> Option<SocketAddr> {
        match network {
            Network::V4 => self.addr4,
            Network::V6 => self.addr6,
        }
    }

    /// This node's own contact info for the given family.
    pub fn node_info(&self, network: Network) -> Option<NodeInfo> {
        self.local_addr(network)
            .map(|addr| NodeInfo::new(self.id, addr))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::NotRunning)?;
        rx.await.map_err(|_| Error::NotRunning)?
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::NotRunning)?;
        rx.await.map_err(|_| Error::NotRunning)
    }

    /// Locate a node by id on every configured family.
    pub async fn find_node(&self, target: Id) -> Result<NodeResult<NodeInfo>> {
        self.request(|reply| Command::FindNode {
            target,
            deadline: None,
            reply,
        })
        .await
    }

    pub async fn find_node_with_deadline(
        &self,
        target: Id,
        deadline: Duration,
    ) -> Result<NodeResult<NodeInfo>> {
        self.request(|reply| Command::FindNode {
            target,
            deadline: Some(deadline),
            reply,
        })
        .await
    }

    /// Retrieve a value; `option` picks the completion policy.
    pub async fn find_value(&self, target: Id, option: LookupOption) -> Result<Option<Value>> {
        self.request(|reply| Command::FindValue {
            target,
            option,
            deadline: None,
            reply,
        })
        .await
    }

    pub async fn find_value_with_deadline(
        &self,
        target: Id,
        option: LookupOption,
        deadline: Duration,
    ) -> Result<Option<Value>> {
        self.request(|reply| Command::FindValue {
            target,
            option,
            deadline: Some(deadline),
            reply,
        })
        .await
    }

    /// Store a value on the K closest nodes; returns the acking nodes.
    pub async fn store_value(&self, value: Value) -> Result<Vec<NodeInfo>> {
        self.request(|reply| Command::StoreValue {
            value,
            expected_seq: None,
            deadline: None,
            reply,
        })
        .await
    }

    /// Store with a compare-and-swap guard on the replicas' stored seq.
    pub async fn store_value_with_cas(
        &self,
        value: Value,
        expected_seq: i32,
    ) -> Result<Vec<NodeInfo>> {
        self.request(|reply| Command::StoreValue {
            value,
            expected_seq: Some(expected_seq),
            deadline: None,
            reply,
        })
        .await
    }

    /// Find peers announced under `target`; `expected == 0` runs the full
    /// lookup, a positive count may return early.
    pub async fn find_peer(&self, target: Id, expected: usize) -> Result<Vec<PeerInfo>> {
        self.request(|reply| Command::FindPeer {
            target,
            expected,
            deadline: None,
            reply,
        })
        .await
    }

    /// Publish a peer announcement; returns the acking nodes.
    pub async fn announce_peer(&self, peer: PeerInfo) -> Result<Vec<NodeInfo>> {
        self.request(|reply| Command::AnnouncePeer {
            peer,
            deadline: None,
            reply,
        })
        .await
    }

    /// Merge additional bootstrap nodes and (re)start bootstrapping.
    pub async fn bootstrap(&self, nodes: Vec<NodeInfo>) -> Result<()> {
        self.query(|reply| Command::Bootstrap { nodes, reply }).await
    }

    pub async fn connection_status(&self, network: Network) -> Result<ConnectionStatus> {
        self.query(|reply| Command::Status { network, reply }).await
    }

    /// Snapshot of the routing table's live entries for one family.
    pub async fn known_nodes(&self, network: Network) -> Result<Vec<NodeInfo>> {
        self.query(|reply| Command::KnownNodes { network, reply })
            .await
    }

    pub async fn stats(&self) -> Result<StatsSnapshot> {
        self.query(|reply| Command::Stats { reply }).await
    }

    pub async fn add_connection_status_listener(
        &self,
        listener: Box<dyn ConnectionStatusListener>,
    ) -> Result<()> {
        self.cmd_tx
            .send(Command::AddConnectionListener(listener))
            .await
            .map_err(|_| Error::NotRunning)
    }

    pub async fn add_node_status_listener(
        &self,
        listener: Box<dyn NodeStatusListener>,
    ) -> Result<()> {
        self.cmd_tx
            .send(Command::AddNodeListener(listener))
            .await
            .map_err(|_| Error::NotRunning)
    }

    /// Stop the node: persist state, cancel everything, close the sockets.
    pub async fn stop(&self) -> Result<()> {
        self.query(|reply| Command::Stop { reply }).await
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("v4", &self.addr4)
            .field("v6", &self.addr6)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pending public operations
// ---------------------------------------------------------------------------

enum OpKind {
    FindNode {
        target: Id,
        result: NodeResult<NodeInfo>,
        reply: Reply<NodeResult<NodeInfo>>,
    },
    FindValue {
        best: Option<Value>,
        reply: Reply<Option<Value>>,
    },
    StoreValue {
        value: Value,
        expected_seq: Option<i32>,
        acked: Vec<NodeInfo>,
        reply: Reply<Vec<NodeInfo>>,
    },
    FindPeer {
        peers: Vec<PeerInfo>,
        dedup: HashSet<(Id, Id)>,
        reply: Reply<Vec<PeerInfo>>,
    },
    AnnouncePeer {
        peer: PeerInfo,
        acked: Vec<NodeInfo>,
        reply: Reply<Vec<NodeInfo>>,
    },
}

struct PendingOp {
    kind: OpKind,
    /// Outstanding per-family chains; the op resolves at zero.
    remaining: usize,
}

impl PendingOp {
    fn resolve(self) {
        match self.kind {
            OpKind::FindNode { result, reply, .. } => {
                let _ = reply.send(Ok(result));
            }
            OpKind::FindValue { best, reply } => {
                let _ = reply.send(Ok(best));
            }
            OpKind::StoreValue { acked, reply, .. } => {
                let _ = reply.send(Ok(acked));
            }
            OpKind::FindPeer { peers, reply, .. } => {
                let _ = reply.send(Ok(peers));
            }
            OpKind::AnnouncePeer { acked, reply, .. } => {
                let _ = reply.send(Ok(acked));
            }
        }
    }

    fn resolve_canceled(self) {
        match self.kind {
            OpKind::FindNode { reply, .. } => {
                let _ = reply.send(Err(Error::Canceled));
            }
            OpKind::FindValue { reply, .. } => {
                let _ = reply.send(Err(Error::Canceled));
            }
            OpKind::StoreValue { reply, .. } => {
                let _ = reply.send(Err(Error::Canceled));
            }
            OpKind::FindPeer { reply, .. } => {
                let _ = reply.send(Err(Error::Canceled));
            }
            OpKind::AnnouncePeer { reply, .. } => {
                let _ = reply.send(Err(Error::Canceled));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The actor
// ---------------------------------------------------------------------------

struct NodeActor {
    local_id: Id,
    server: RpcServer,
    dht4: Option<Dht>,
    dht6: Option<Dht>,
    store: Box<dyn DataStore>,
    scheduler: Scheduler<Job>,
    ops: HashMap<u64, PendingOp>,
    next_op: u64,
    task_ops: HashMap<(Network, u64), u64>,
    conn_listeners: Vec<Box<dyn ConnectionStatusListener>>,
    node_listeners: Vec<Box<dyn NodeStatusListener>>,
    node_status: NodeStatus,
    storage_dir: Option<PathBuf>,
}

async fn recv_from_opt(
    sock: &Option<Arc<UdpSocket>>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match sock {
        Some(sock) => sock.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

impl NodeActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let sock4 = self.server.socket(Network::V4);
        let sock6 = self.server.socket(Network::V6);
        let mut buf4 = vec![0u8; MAX_DATA_PACKET_SIZE];
        let mut buf6 = vec![0u8; MAX_DATA_PACKET_SIZE];
        let mut tick = tokio::time::interval(PERIODIC_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.startup();

        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(Command::Stop { reply }) => {
                            self.shutdown();
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }
                received = recv_from_opt(&sock4, &mut buf4) => {
                    match received {
                        Ok((n, from)) => self.on_datagram(Network::V4, &buf4[..n], from),
                        Err(e) => warn!(error = %e, "IPv4 receive error"),
                    }
                }
                received = recv_from_opt(&sock6, &mut buf6) => {
                    match received {
                        Ok((n, from)) => self.on_datagram(Network::V6, &buf6[..n], from),
                        Err(e) => warn!(error = %e, "IPv6 receive error"),
                    }
                }
                _ = tick.tick() => self.on_tick(),
            }
        }
    }

    fn startup(&mut self) {
        for network in [Network::V4, Network::V6] {
            if self.dht_for(network).is_some() {
                self.scheduler.add_periodic(
                    Duration::from_secs(2),
                    DHT_UPDATE_INTERVAL,
                    Job::DhtUpdate(network),
                );
                self.scheduler.add_periodic(
                    TOKEN_ROTATION_INTERVAL,
                    TOKEN_ROTATION_INTERVAL,
                    Job::TokenRotation(network),
                );
            }
        }
        self.scheduler
            .add_periodic(PERSIST_INTERVAL, PERSIST_INTERVAL, Job::Persist);
        self.scheduler.add_periodic(
            REPUBLISH_SCAN_INTERVAL,
            REPUBLISH_SCAN_INTERVAL,
            Job::RepublishScan,
        );
        self.scheduler.add_periodic(
            REACHABILITY_CHECK_INTERVAL,
            REACHABILITY_CHECK_INTERVAL,
            Job::ReachabilityCheck,
        );
        self.scheduler
            .add_periodic(Duration::from_secs(1), Duration::from_secs(1), Job::RateWindow);

        self.set_node_status(NodeStatus::Running);
        self.start_bootstrap(Vec::new());
    }

    fn shutdown(&mut self) {
        debug!("actor shutting down");
        let op_ids: Vec<u64> = self.ops.keys().copied().collect();
        for op_id in op_ids {
            if let Some(op) = self.ops.remove(&op_id) {
                op.resolve_canceled();
            }
        }
        self.persist_all();
        if let Some(dht) = &mut self.dht4 {
            dht.stop();
        }
        if let Some(dht) = &mut self.dht6 {
            dht.stop();
        }
        self.server.stop();
        self.set_node_status(NodeStatus::Stopped);
    }

    // -----------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------

    fn dht_for(&self, network: Network) -> Option<&Dht> {
        match network {
            Network::V4 => self.dht4.as_ref(),
            Network::V6 => self.dht6.as_ref(),
        }
    }

    fn dht_for_mut(&mut self, network: Network) -> Option<&mut Dht> {
        match network {
            Network::V4 => self.dht4.as_mut(),
            Network::V6 => self.dht6.as_mut(),
        }
    }

    fn networks(&self) -> Vec<Network> {
        [Network::V4, Network::V6]
            .into_iter()
            .filter(|n| self.dht_for(*n).is_some())
            .collect()
    }

    fn want(&self) -> Want {
        Want {
            v4: self.dht4.is_some(),
            v6: self.dht6.is_some(),
        }
    }

    fn set_node_status(&mut self, new: NodeStatus) {
        if new == self.node_status {
            return;
        }
        let old = self.node_status;
        self.node_status = new;
        for listener in &mut self.node_listeners {
            listener.status_changed(new, old);
        }
    }

    fn notify_transition(
        &mut self,
        network: Network,
        transition: Option<(ConnectionStatus, ConnectionStatus)>,
    ) {
        let Some((old, new)) = transition else {
            return;
        };
        for listener in &mut self.conn_listeners {
            listener.status_changed(network, new, old);
            match new {
                ConnectionStatus::Connected => listener.connected(network),
                ConnectionStatus::Profound => listener.profound(network),
                ConnectionStatus::Disconnected => listener.disconnected(network),
                ConnectionStatus::Connecting => {}
            }
        }
    }

    // -----------------------------------------------------------------
    // Datagram path
    // -----------------------------------------------------------------

    fn on_datagram(&mut self, network: Network, buf: &[u8], from: SocketAddr) {
        let Some(incoming) = self.server.handle_datagram(buf, from) else {
            return;
        };
        match incoming {
            Incoming::Request(msg) => self.on_request(network, msg),
            Incoming::Response { call, message } => {
                if let Some(dht) = self.dht_for_mut(network) {
                    dht.observe(&message, true);
                }
                if let Some(task_ref) = call.task {
                    if let Some(dht) = self.dht_for_mut(task_ref.network) {
                        let actions =
                            dht.tasks
                                .on_response(task_ref.task_id, &call.target, &message);
                        self.dispatch_actions(task_ref.network, actions);
                    }
                }
            }
            Incoming::Error { call, message } => {
                if let Some(dht) = self.dht_for_mut(network) {
                    dht.observe(&message, true);
                }
                if let crate::messages::Body::Error(e) = &message.body {
                    debug!(
                        from = %from,
                        code = e.code,
                        text = %e.message,
                        "peer reported an error"
                    );
                }
                if let Some(call) = call {
                    if let Some(task_ref) = call.task {
                        if let Some(dht) = self.dht_for_mut(task_ref.network) {
                            let actions =
                                dht.tasks.on_failure(task_ref.task_id, &call.target.id);
                            self.dispatch_actions(task_ref.network, actions);
                        }
                    }
                }
            }
        }
    }

    fn on_request(&mut self, network: Network, msg: Message) {
        let (nodes4, nodes6) = self.closest_for(&msg);
        let dht = match network {
            Network::V4 => self.dht4.as_mut(),
            Network::V6 => self.dht6.as_mut(),
        };
        let Some(dht) = dht else {
            return;
        };
        dht.observe(&msg, false);
        let response = dht.handle_request(&msg, nodes4, nodes6, self.store.as_mut());
        if let Some(mut response) = response {
            if let Err(e) = self.server.send_message(&mut response) {
                debug!(error = %e, "failed to send response");
            }
        }
    }

    /// Assemble the closest-node lists for a request, honoring its want
    /// mask and including ourselves only while reachable.
    fn closest_for(&self, msg: &Message) -> (Vec<NodeInfo>, Vec<NodeInfo>) {
        let Some(target) = msg.target() else {
            return (Vec::new(), Vec::new());
        };
        let want = msg.want();
        let mut out = (Vec::new(), Vec::new());
        for (network, wanted, slot) in [
            (Network::V4, want.v4, &mut out.0),
            (Network::V6, want.v6, &mut out.1),
        ] {
            if !wanted {
                continue;
            }
            let Some(dht) = self.dht_for(network) else {
                continue;
            };
            let mut nodes = dht.routing().closest(&target, K);
            if self.server.is_reachable() {
                if let Some(addr) = self.server.bound_addr(network) {
                    nodes.push(NodeInfo::new(self.local_id, addr));
                    nodes.sort_by(|a, b| closer_to(&target, &a.id, &b.id));
                    nodes.truncate(K);
                }
            }
            *slot = nodes;
        }
        out
    }

    // -----------------------------------------------------------------
    // Task plumbing
    // -----------------------------------------------------------------

    fn pump_tasks(&mut self, network: Network) {
        let Some(dht) = self.dht_for_mut(network) else {
            return;
        };
        let actions = dht.tasks.pump();
        self.dispatch_actions(network, actions);
    }

    fn dispatch_actions(&mut self, network: Network, actions: Vec<TaskAction>) {
        for action in actions {
            match action {
                TaskAction::Send {
                    task_id,
                    node,
                    message,
                } => {
                    let call = RpcCall::new(node.clone(), message).with_task(TaskRef {
                        network,
                        task_id,
                    });
                    match self.server.send_call(call) {
                        Ok(_) => {
                            if let Some(dht) = self.dht_for_mut(network) {
                                dht.on_send(&node.id);
                            }
                        }
                        Err(e) => {
                            debug!(node = %node.id, error = %e, "could not send call");
                            if let Some(dht) = self.dht_for_mut(network) {
                                let follow = dht.tasks.on_failure(task_id, &node.id);
                                self.dispatch_actions(network, follow);
                            }
                        }
                    }
                }
                TaskAction::Completed {
                    task_id,
                    name,
                    result,
                } => {
                    self.on_task_completed(network, task_id, name, result);
                }
            }
        }
    }

    fn on_task_completed(
        &mut self,
        network: Network,
        task_id: u64,
        name: &'static str,
        result: TaskResult,
    ) {
        debug!(network = %network, task = task_id, name, "task completed");

        // Bootstrap progression first; it may enqueue stage-two lookups.
        let want = self.want();
        if let Some(dht) = self.dht_for_mut(network) {
            let transition = dht.on_task_completed(task_id, &result, want);
            self.notify_transition(network, transition);
            self.pump_tasks(network);
        }

        // Then public-operation progression.
        let Some(op_id) = self.task_ops.remove(&(network, task_id)) else {
            return;
        };
        let Some(mut op) = self.ops.remove(&op_id) else {
            return;
        };

        match (&mut op.kind, result) {
            (
                OpKind::FindNode { target, result, .. },
                TaskResult::Lookup { closest, .. },
            ) => {
                if let Some((info, _)) = closest.iter().find(|(n, _)| n.id == *target) {
                    result.set(network, info.clone());
                }
                op.remaining -= 1;
            }
            (OpKind::FindValue { best, .. }, TaskResult::Lookup { value, .. }) => {
                if let Some(candidate) = value {
                    let newer = match best {
                        None => true,
                        Some(current) => {
                            candidate.is_mutable()
                                && candidate.sequence_number() > current.sequence_number()
                        }
                    };
                    if newer {
                        *best = Some(candidate);
                    }
                }
                op.remaining -= 1;
            }
            (
                OpKind::StoreValue {
                    value, expected_seq, ..
                },
                TaskResult::Lookup { closest, .. },
            ) => {
                // Phase two: fan the write out to the closest responders.
                if closest.is_empty() {
                    op.remaining -= 1;
                } else {
                    let value = value.clone();
                    let expected_seq = *expected_seq;
                    if let Some(dht) = self.dht_for_mut(network) {
                        let announce =
                            dht.tasks.add_value_announce(value, expected_seq, closest);
                        self.task_ops.insert((network, announce), op_id);
                    } else {
                        op.remaining -= 1;
                    }
                }
            }
            (OpKind::StoreValue { acked, .. }, TaskResult::Acks(acks)) => {
                acked.extend(acks);
                op.remaining -= 1;
            }
            (
                OpKind::AnnouncePeer { peer, .. },
                TaskResult::Lookup { closest, .. },
            ) => {
                if closest.is_empty() {
                    op.remaining -= 1;
                } else {
                    let peer = peer.clone();
                    if let Some(dht) = self.dht_for_mut(network) {
                        let announce = dht.tasks.add_peer_announce(peer, closest);
                        self.task_ops.insert((network, announce), op_id);
                    } else {
                        op.remaining -= 1;
                    }
                }
            }
            (OpKind::AnnouncePeer { acked, .. }, TaskResult::Acks(acks)) => {
                acked.extend(acks);
                op.remaining -= 1;
            }
            (
                OpKind::FindPeer { peers, dedup, .. },
                TaskResult::Lookup {
                    peers: found,
                    ..
                },
            ) => {
                for peer in found {
                    if dedup.insert((*peer.peer_id(), *peer.node_id())) {
                        peers.push(peer);
                    }
                }
                op.remaining -= 1;
            }
            (_, result) => {
                warn!(task = task_id, ?result, "task result does not match operation");
                op.remaining = op.remaining.saturating_sub(1);
            }
        }

        if op.remaining == 0 {
            op.resolve();
        } else {
            self.ops.insert(op_id, op);
            self.pump_tasks(network);
        }
    }

    // -----------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------

    fn on_tick(&mut self) {
        self.server.flush_queue();

        for call in self.server.check_timeouts() {
            let network = Network::of(&call.target.addr);
            if let Some(dht) = self.dht_for_mut(network) {
                dht.on_timeout(&call.target.id);
            }
            if let Some(task_ref) = call.task {
                if let Some(dht) = self.dht_for_mut(task_ref.network) {
                    let actions = dht.tasks.on_failure(task_ref.task_id, &call.target.id);
                    self.dispatch_actions(task_ref.network, actions);
                }
            }
        }

        self.scheduler.sync_time();
        for job in self.scheduler.run() {
            self.run_job(job);
        }

        for network in self.networks() {
            self.pump_tasks(network);
        }
    }

    fn run_job(&mut self, job: Job) {
        match job {
            Job::DhtUpdate(network) => {
                let want = self.want();
                if let Some(dht) = self.dht_for_mut(network) {
                    let transition = dht.periodic_update(want);
                    self.notify_transition(network, transition);
                    self.pump_tasks(network);
                }
            }
            Job::TokenRotation(network) => {
                if let Some(dht) = self.dht_for_mut(network) {
                    dht.rotate_tokens();
                }
            }
            Job::Persist => self.persist_all(),
            Job::RepublishScan => self.republish_due(),
            Job::ReachabilityCheck => self.server.update_reachability(),
            Job::RateWindow => self.server.stats().update_rates(),
            Job::CancelOp(op_id) => self.cancel_op(op_id),
        }
    }

    fn persist_all(&mut self) {
        if let Some(dir) = &self.storage_dir {
            if let Err(e) = self.store.save(&dir.join("store.cbor")) {
                warn!(error = %e, "data store save failed");
            }
        }
        for network in [Network::V4, Network::V6] {
            if let Some(dht) = self.dht_for(network) {
                if let Err(e) = dht.persist() {
                    warn!(network = %network, error = %e, "routing snapshot save failed");
                }
            }
        }
    }

    fn republish_due(&mut self) {
        let values = self.store.values_to_republish();
        let peers = self.store.peers_to_republish();
        if values.is_empty() && peers.is_empty() {
            return;
        }
        info!(
            values = values.len(),
            peers = peers.len(),
            "republishing owned records"
        );
        for value in values {
            let (tx, _rx) = oneshot::channel();
            self.start_store_value(value, None, None, tx);
        }
        for peer in peers {
            let (tx, _rx) = oneshot::channel();
            self.start_announce_peer(peer, None, tx);
        }
    }

    fn cancel_op(&mut self, op_id: u64) {
        let Some(op) = self.ops.remove(&op_id) else {
            return;
        };
        let tasks: Vec<(Network, u64)> = self
            .task_ops
            .iter()
            .filter(|(_, v)| **v == op_id)
            .map(|(k, _)| *k)
            .collect();
        for (network, task_id) in tasks {
            self.task_ops.remove(&(network, task_id));
            if let Some(dht) = self.dht_for_mut(network) {
                dht.tasks.cancel(task_id);
            }
            self.server.cancel_calls_for(network, task_id);
        }
        debug!(op = op_id, "operation canceled");
        op.resolve_canceled();
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::FindNode {
                target,
                deadline,
                reply,
            } => self.start_find_node(target, deadline, reply),
            Command::FindValue {
                target,
                option,
                deadline,
                reply,
            } => self.start_find_value(target, option, deadline, reply),
            Command::StoreValue {
                value,
                expected_seq,
                deadline,
                reply,
            } => self.start_store_value(value, expected_seq, deadline, reply),
            Command::FindPeer {
                target,
                expected,
                deadline,
                reply,
            } => self.start_find_peer(target, expected, deadline, reply),
            Command::AnnouncePeer {
                peer,
                deadline,
                reply,
            } => self.start_announce_peer(peer, deadline, reply),
            Command::Bootstrap { nodes, reply } => {
                self.start_bootstrap(nodes);
                let _ = reply.send(());
            }
            Command::Status { network, reply } => {
                let status = self
                    .dht_for(network)
                    .map(|d| d.status())
                    .unwrap_or(ConnectionStatus::Disconnected);
                let _ = reply.send(status);
            }
            Command::KnownNodes { network, reply } => {
                let nodes = self
                    .dht_for(network)
                    .map(|d| d.routing().dump())
                    .unwrap_or_default();
                let _ = reply.send(nodes);
            }
            Command::Stats { reply } => {
                let active = self.server.active_calls();
                let _ = reply.send(self.server.stats().snapshot(active));
            }
            Command::AddConnectionListener(listener) => {
                self.conn_listeners.push(listener);
            }
            Command::AddNodeListener(listener) => {
                self.node_listeners.push(listener);
            }
            Command::Stop { .. } => unreachable!("handled in the select loop"),
        }
    }

    fn start_bootstrap(&mut self, nodes: Vec<NodeInfo>) {
        let want = self.want();
        for network in self.networks() {
            let family_nodes: Vec<NodeInfo> = nodes
                .iter()
                .filter(|n| network.can_use(&n.addr))
                .cloned()
                .collect();
            if let Some(dht) = self.dht_for_mut(network) {
                let transition = dht.begin_bootstrap(family_nodes, want);
                self.notify_transition(network, transition);
                self.pump_tasks(network);
            }
        }
    }

    fn register_op(&mut self, kind: OpKind, remaining: usize, deadline: Option<Duration>) -> u64 {
        let op_id = self.next_op;
        self.next_op += 1;
        self.ops.insert(op_id, PendingOp { kind, remaining });
        if let Some(deadline) = deadline {
            self.scheduler.add(deadline, Job::CancelOp(op_id));
        }
        op_id
    }

    fn start_find_node(
        &mut self,
        target: Id,
        deadline: Option<Duration>,
        reply: Reply<NodeResult<NodeInfo>>,
    ) {
        let networks = self.networks();
        if networks.is_empty() {
            let _ = reply.send(Err(Error::NotRunning));
            return;
        }
        let want = self.want();
        let op_id = self.register_op(
            OpKind::FindNode {
                target,
                result: NodeResult::default(),
                reply,
            },
            networks.len(),
            deadline,
        );
        for network in networks {
            if let Some(dht) = self.dht_for_mut(network) {
                let task = dht.start_find_node(target, want);
                self.task_ops.insert((network, task), op_id);
                self.pump_tasks(network);
            }
        }
    }

    fn start_find_value(
        &mut self,
        target: Id,
        option: LookupOption,
        deadline: Option<Duration>,
        reply: Reply<Option<Value>>,
    ) {
        let networks = self.networks();
        if networks.is_empty() {
            let _ = reply.send(Err(Error::NotRunning));
            return;
        }
        let want = self.want();
        let op_id = self.register_op(
            OpKind::FindValue { best: None, reply },
            networks.len(),
            deadline,
        );
        for network in networks {
            if let Some(dht) = self.dht_for_mut(network) {
                let task = dht.start_find_value(target, want, option);
                self.task_ops.insert((network, task), op_id);
                self.pump_tasks(network);
            }
        }
    }

    fn start_store_value(
        &mut self,
        value: Value,
        expected_seq: Option<i32>,
        deadline: Option<Duration>,
        reply: Reply<Vec<NodeInfo>>,
    ) {
        if let Err(e) = value.validate() {
            let _ = reply.send(Err(e));
            return;
        }
        let networks = self.networks();
        if networks.is_empty() {
            let _ = reply.send(Err(Error::NotRunning));
            return;
        }

        // We are a replica of our own records; the local copy obeys the
        // same update rule as remote replicas.
        let local_ok = match self.store.value(&value.id()) {
            Some(existing) => existing.accepts_update(&value).is_ok(),
            None => true,
        };
        if local_ok {
            self.store.put_value(value.clone(), true);
        }

        let target = value.id();
        let want = self.want();
        let op_id = self.register_op(
            OpKind::StoreValue {
                value,
                expected_seq,
                acked: Vec::new(),
                reply,
            },
            networks.len(),
            deadline,
        );
        for network in networks {
            if let Some(dht) = self.dht_for_mut(network) {
                // Token-collecting lookup; the write fans out on completion.
                let task = dht.start_find_value(target, want, LookupOption::Conservative);
                self.task_ops.insert((network, task), op_id);
                self.pump_tasks(network);
            }
        }
    }

    fn start_find_peer(
        &mut self,
        target: Id,
        expected: usize,
        deadline: Option<Duration>,
        reply: Reply<Vec<PeerInfo>>,
    ) {
        let networks = self.networks();
        if networks.is_empty() {
            let _ = reply.send(Err(Error::NotRunning));
            return;
        }
        let want = self.want();
        let op_id = self.register_op(
            OpKind::FindPeer {
                peers: Vec::new(),
                dedup: HashSet::new(),
                reply,
            },
            networks.len(),
            deadline,
        );
        for network in networks {
            if let Some(dht) = self.dht_for_mut(network) {
                let task = dht.start_find_peer(target, want, expected);
                self.task_ops.insert((network, task), op_id);
                self.pump_tasks(network);
            }
        }
    }

    fn start_announce_peer(
        &mut self,
        peer: PeerInfo,
        deadline: Option<Duration>,
        reply: Reply<Vec<NodeInfo>>,
    ) {
        if let Err(e) = peer.verify() {
            let _ = reply.send(Err(e));
            return;
        }
        let networks = self.networks();
        if networks.is_empty() {
            let _ = reply.send(Err(Error::NotRunning));
            return;
        }

        let target = *peer.peer_id();
        for network in &networks {
            self.store.put_peer(peer.clone(), *network, true);
        }

        let want = self.want();
        let op_id = self.register_op(
            OpKind::AnnouncePeer {
                peer,
                acked: Vec::new(),
                reply,
            },
            networks.len(),
            deadline,
        );
        for network in networks {
            if let Some(dht) = self.dht_for_mut(network) {
                let task = dht.start_find_peer(target, want, 0);
                self.task_ops.insert((network, task), op_id);
                self.pump_tasks(network);
            }
        }
    }
}
