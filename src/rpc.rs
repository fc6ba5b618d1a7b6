//! # RPC server
//!
//! UDP I/O for both address families, per-datagram sealing/opening, the
//! table of outstanding calls keyed by transaction id, send/receive
//! statistics, and the server-side reachability heuristic.
//!
//! The server is plain state driven by the network actor's loop: datagrams
//! are fed in through [`RpcServer::handle_datagram`], which yields a typed
//! [`Incoming`] event; the periodic tick drives [`RpcServer::flush_queue`],
//! [`RpcServer::check_timeouts`] and [`RpcServer::update_reachability`].
//!
//! ## Response matching
//!
//! A response is delivered to its call only when the transaction id matches
//! AND the datagram origin equals the request destination AND the sender id
//! is the expected responder. A txid match with the wrong origin marks the
//! call stalled (its timeout still fires) and, on IPv6, sends back a
//! protocol-error explaining multihomed misbinding.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::crypto::CryptoBox;
use crate::error::{Error, ErrorCode, Result};
use crate::identity::{Id, Keypair, ID_BYTES};
use crate::messages::{
    build_version, Body, ErrorBody, Message, Method, MsgKind, NODE_SHORT_NAME, NODE_VERSION,
};
use crate::routing::{Network, NodeInfo};

/// Default deadline for an outstanding call.
pub const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// The event-loop tick driving scheduler, retries, and timeouts.
pub const PERIODIC_INTERVAL: Duration = Duration::from_millis(100);

/// If nothing was received for this long, the server considers itself
/// unreachable and stops advertising its own node info.
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Unmatched responses are only answered with a protocol-error once the
/// server has been up this long (earlier ones are likely restart strays).
const UNSOLICITED_RESPONSE_GRACE: Duration = Duration::from_secs(2 * 60);

/// Receive buffer size per socket.
pub const MAX_DATA_PACKET_SIZE: usize = 0x7FFF;

/// Lifecycle of one outstanding request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CallState {
    Unsent,
    Sent,
    Stalled,
    Responded,
    Timeout,
    Canceled,
}

/// Links a call back to the lookup task that issued it.
#[derive(Clone, Copy, Debug)]
pub struct TaskRef {
    pub network: Network,
    pub task_id: u64,
}

/// One outstanding request and its lifecycle bookkeeping.
#[derive(Debug)]
pub struct RpcCall {
    pub target: NodeInfo,
    pub request: Message,
    pub state: CallState,
    pub sent_at: Option<Instant>,
    pub timeout: Duration,
    pub task: Option<TaskRef>,
    pub socket_mismatches: u32,
}

impl RpcCall {
    pub fn new(target: NodeInfo, request: Message) -> RpcCall {
        RpcCall {
            target,
            request,
            state: CallState::Unsent,
            sent_at: None,
            timeout: RPC_CALL_TIMEOUT,
            task: None,
            socket_mismatches: 0,
        }
    }

    pub fn with_task(mut self, task: TaskRef) -> RpcCall {
        self.task = Some(task);
        self
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.state, CallState::Sent | CallState::Stalled)
            && self
                .sent_at
                .map(|sent| now.duration_since(sent) >= self.timeout)
                .unwrap_or(false)
    }
}

/// What a received datagram turned into.
#[derive(Debug)]
pub enum Incoming {
    /// A request to dispatch to the family's engine.
    Request(Message),
    /// A response matched to its call; the call has left the table.
    Response { call: RpcCall, message: Message },
    /// An error message, with its call if one matched.
    Error {
        call: Option<RpcCall>,
        message: Message,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ServerState {
    Running,
    Stopped,
}

pub struct RpcServer {
    crypto: CryptoBox,
    local_id: Id,
    sock4: Option<Arc<UdpSocket>>,
    sock6: Option<Arc<UdpSocket>>,
    bound4: Option<SocketAddr>,
    bound6: Option<SocketAddr>,
    calls: HashMap<u32, RpcCall>,
    send_queue: VecDeque<(SocketAddr, Vec<u8>)>,
    next_txid: u32,
    state: ServerState,
    stats: RpcStatistics,
    reachable: bool,
    received_messages: u64,
    messages_at_last_check: u64,
    last_reachability_check: Instant,
    start_time: Instant,
}

impl RpcServer {
    /// Bind the configured sockets and enter the running state.
    /// Socket failures here are fatal.
    pub async fn start(
        keypair: &Keypair,
        addr4: Option<SocketAddr>,
        addr6: Option<SocketAddr>,
    ) -> Result<RpcServer> {
        let mut sock4 = None;
        let mut bound4 = None;
        if let Some(addr) = addr4 {
            let sock = UdpSocket::bind(addr).await?;
            bound4 = Some(sock.local_addr()?);
            info!(addr = %bound4.expect("just bound"), "RPC server listening on IPv4");
            sock4 = Some(Arc::new(sock));
        }
        let mut sock6 = None;
        let mut bound6 = None;
        if let Some(addr) = addr6 {
            let sock = UdpSocket::bind(addr).await?;
            bound6 = Some(sock.local_addr()?);
            info!(addr = %bound6.expect("just bound"), "RPC server listening on IPv6");
            sock6 = Some(Arc::new(sock));
        }
        if sock4.is_none() && sock6.is_none() {
            return Err(Error::protocol("no address family configured"));
        }

        let now = Instant::now();
        Ok(RpcServer {
            local_id: keypair.id(),
            crypto: CryptoBox::new(keypair),
            sock4,
            sock6,
            bound4,
            bound6,
            calls: HashMap::new(),
            send_queue: VecDeque::new(),
            next_txid: rand::thread_rng().gen_range(1..32768),
            state: ServerState::Running,
            stats: RpcStatistics::new(),
            reachable: false,
            received_messages: 0,
            messages_at_last_check: 0,
            last_reachability_check: now,
            start_time: now,
        })
    }

    pub fn stop(&mut self) {
        if self.state == ServerState::Stopped {
            return;
        }
        self.state = ServerState::Stopped;
        for (_, mut call) in self.calls.drain() {
            call.state = CallState::Canceled;
        }
        self.sock4 = None;
        self.sock6 = None;
        info!("RPC server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state == ServerState::Running
    }

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    pub fn socket(&self, network: Network) -> Option<Arc<UdpSocket>> {
        match network {
            Network::V4 => self.sock4.clone(),
            Network::V6 => self.sock6.clone(),
        }
    }

    pub fn bound_addr(&self, network: Network) -> Option<SocketAddr> {
        match network {
            Network::V4 => self.bound4,
            Network::V6 => self.bound6,
        }
    }

    pub fn has_network(&self, network: Network) -> bool {
        self.bound_addr(network).is_some()
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn call(&self, txid: u32) -> Option<&RpcCall> {
        self.calls.get(&txid)
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn stats(&mut self) -> &mut RpcStatistics {
        &mut self.stats
    }

    /// Allocate the next transaction id: monotonically increasing, never 0,
    /// never colliding with an outstanding call.
    fn alloc_txid(&mut self) -> u32 {
        loop {
            let txid = self.next_txid;
            self.next_txid = match self.next_txid.wrapping_add(1) {
                0 => 1,
                n if n > i32::MAX as u32 => 1,
                n => n,
            };
            if txid != 0 && !self.calls.contains_key(&txid) {
                return txid;
            }
        }
    }

    /// Register and transmit a call. Returns the allocated txid.
    pub fn send_call(&mut self, mut call: RpcCall) -> Result<u32> {
        let txid = self.alloc_txid();
        call.request.txid = txid;
        call.request.remote = Some((call.target.id, call.target.addr));
        self.send_message(&mut call.request)?;
        call.state = CallState::Sent;
        call.sent_at = Some(Instant::now());
        self.calls.insert(txid, call);
        Ok(txid)
    }

    /// Stamp sender id and version, seal, and transmit.
    pub fn send_message(&mut self, msg: &mut Message) -> Result<()> {
        msg.id = self.local_id;
        msg.version = build_version(NODE_SHORT_NAME, NODE_VERSION);
        let (remote_id, remote_addr) = msg
            .remote
            .ok_or_else(|| Error::protocol("message has no destination"))?;

        let plaintext = msg.serialize();
        let packet = self.crypto.seal_envelope(&remote_id, msg.txid, &plaintext)?;
        trace!(to = %remote_addr, msg = %msg, bytes = packet.len(), "send");
        self.stats.on_sent_message(msg);
        self.transmit(remote_addr, packet);
        Ok(())
    }

    /// Reply to `msg` with a protocol-level error.
    pub fn send_error(&mut self, msg: &Message, code: ErrorCode, text: impl Into<String>) {
        let Some(origin) = msg.origin else {
            return;
        };
        let mut err = Message::new(Body::Error(ErrorBody {
            method: msg.method(),
            code: code.code(),
            message: text.into(),
        }));
        err.txid = msg.txid;
        err.remote = Some((msg.id, origin));
        if let Err(e) = self.send_message(&mut err) {
            debug!(error = %e, "failed to send error reply");
        }
    }

    fn transmit(&mut self, addr: SocketAddr, packet: Vec<u8>) {
        let sock = match Network::of(&addr) {
            Network::V4 => &self.sock4,
            Network::V6 => &self.sock6,
        };
        let Some(sock) = sock else {
            debug!(to = %addr, "no socket for address family, dropping send");
            return;
        };
        match sock.try_send_to(&packet, addr) {
            Ok(sent) => {
                self.stats.on_sent_bytes(sent as u64);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.send_queue.push_back((addr, packet));
            }
            Err(e) => {
                // Transient send failure; retry on the next tick. A dead
                // destination will surface as the call's timeout.
                debug!(to = %addr, error = %e, "send failed, queued for retry");
                self.send_queue.push_back((addr, packet));
            }
        }
    }

    /// Retry queued transmissions; called from the periodic tick.
    pub fn flush_queue(&mut self) {
        let mut remaining = VecDeque::new();
        while let Some((addr, packet)) = self.send_queue.pop_front() {
            let sock = match Network::of(&addr) {
                Network::V4 => &self.sock4,
                Network::V6 => &self.sock6,
            };
            let Some(sock) = sock else {
                continue;
            };
            match sock.try_send_to(&packet, addr) {
                Ok(sent) => self.stats.on_sent_bytes(sent as u64),
                Err(_) => remaining.push_back((addr, packet)),
            }
        }
        self.send_queue = remaining;
    }

    /// Decode one datagram and classify it.
    pub fn handle_datagram(&mut self, buf: &[u8], from: SocketAddr) -> Option<Incoming> {
        if buf.len() < ID_BYTES {
            self.stats.on_dropped_packet(buf.len());
            return None;
        }

        let (sender, plaintext) = match self.crypto.open_envelope(buf) {
            Ok(opened) => opened,
            Err(e) => {
                self.stats.on_dropped_packet(buf.len());
                warn!(from = %from, len = buf.len(), error = %e, "undecryptable packet dropped");
                return None;
            }
        };

        let mut msg = match Message::parse(&plaintext) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.on_dropped_packet(buf.len());
                warn!(from = %from, error = %e, "malformed packet dropped");
                return None;
            }
        };

        self.received_messages += 1;
        self.stats.on_received_bytes(buf.len() as u64);
        self.stats.on_received_message(&msg);
        msg.id = sender;
        msg.origin = Some(from);
        trace!(from = %from, msg = %msg, bytes = buf.len(), "received");

        // Transaction ids must be non-zero everywhere but in error replies.
        if msg.kind() != MsgKind::Error && msg.txid == 0 {
            warn!(from = %from, "message with zero transaction id");
            self.send_error(
                &msg,
                ErrorCode::ProtocolError,
                "expected a non-zero transaction id",
            );
            return None;
        }

        if msg.kind() == MsgKind::Request {
            return Some(Incoming::Request(msg));
        }

        // Response or error: try to match an outstanding call.
        let call_match = self
            .calls
            .get(&msg.txid)
            .map(|call| (call.target.addr == from, call.target.id == sender, call.target.addr));
        if let Some((origin_matches, sender_matches, expected)) = call_match {
            if origin_matches && sender_matches {
                let mut call = self.calls.remove(&msg.txid).expect("present");
                call.state = CallState::Responded;
                return Some(match msg.kind() {
                    MsgKind::Error => Incoming::Error {
                        call: Some(call),
                        message: msg,
                    },
                    _ => Incoming::Response { call, message: msg },
                });
            }

            // txid matched but the origin (or sender id) did not:
            // port-mangling NAT, a multihomed host bound to an any-local
            // address, or an attack. The call stays in the table and its
            // timeout still fires.
            if let Some(call) = self.calls.get_mut(&msg.txid) {
                call.socket_mismatches += 1;
                call.state = CallState::Stalled;
            }
            warn!(
                txid = msg.txid,
                expected = %expected,
                got = %from,
                "transaction id matched but socket address did not; stalling call"
            );
            if msg.kind() == MsgKind::Response && Network::of(&from) == Network::V6 {
                let text = format!(
                    "a request was sent to {expected} and a response with matching \
                     transaction id was received from {from}; multihomed nodes should \
                     bind sockets so responses carry the correct source address \
                     (see BEPs 32 and 45)"
                );
                let mut err = Message::new(Body::Error(ErrorBody {
                    method: msg.method(),
                    code: ErrorCode::ProtocolError.code(),
                    message: text,
                }));
                err.txid = msg.txid;
                err.remote = Some((msg.id, expected));
                let _ = self.send_message(&mut err);
            }
            return None;
        }

        // No call matched.
        if msg.kind() == MsgKind::Response
            && self.start_time.elapsed() > UNSOLICITED_RESPONSE_GRACE
        {
            debug!(txid = msg.txid, from = %from, "unsolicited response");
            self.send_error(
                &msg,
                ErrorCode::ProtocolError,
                "response does not match a pending request, or the transaction expired",
            );
            return None;
        }

        if msg.kind() == MsgKind::Error {
            return Some(Incoming::Error {
                call: None,
                message: msg,
            });
        }

        debug!(msg = %msg, "ignored stray message");
        None
    }

    /// Expire overdue calls; the actor feeds them to routing and tasks.
    pub fn check_timeouts(&mut self) -> Vec<RpcCall> {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .calls
            .iter()
            .filter(|(_, call)| call.is_expired(now))
            .map(|(txid, _)| *txid)
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for txid in expired {
            let mut call = self.calls.remove(&txid).expect("present");
            call.state = CallState::Timeout;
            self.stats.on_timeout_message(call.request.method());
            debug!(txid, target = %call.target.id, "call timed out");
            out.push(call);
        }
        out
    }

    /// Cancel one call; its response, if any, will be treated as unsolicited.
    pub fn cancel_call(&mut self, txid: u32) -> Option<RpcCall> {
        let mut call = self.calls.remove(&txid)?;
        call.state = CallState::Canceled;
        Some(call)
    }

    /// Cancel every outstanding call issued by one task.
    pub fn cancel_calls_for(&mut self, network: Network, task_id: u64) -> usize {
        let txids: Vec<u32> = self
            .calls
            .iter()
            .filter(|(_, call)| {
                call.task
                    .map(|t| t.network == network && t.task_id == task_id)
                    .unwrap_or(false)
            })
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &txids {
            self.cancel_call(*txid);
        }
        txids.len()
    }

    /// Reachability heuristic: reachable while packets keep arriving.
    pub fn update_reachability(&mut self) {
        let now = Instant::now();
        if self.received_messages != self.messages_at_last_check {
            self.reachable = true;
            self.last_reachability_check = now;
            self.messages_at_last_check = self.received_messages;
            return;
        }
        if now.duration_since(self.last_reachability_check) > REACHABILITY_TIMEOUT {
            self.reachable = false;
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("local_id", &self.local_id)
            .field("v4", &self.bound4)
            .field("v6", &self.bound6)
            .field("calls", &self.calls.len())
            .field("reachable", &self.reachable)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Per-(method, kind) counters plus byte totals and moving rates.
pub struct RpcStatistics {
    received_bytes: u64,
    sent_bytes: u64,
    dropped_packets: u32,
    dropped_bytes: u64,
    received: [[u32; MsgKind::COUNT]; Method::COUNT],
    sent: [[u32; MsgKind::COUNT]; Method::COUNT],
    timeouts: [u32; Method::COUNT],
    window_started: Instant,
    window_received: u64,
    window_sent: u64,
    received_per_sec: u32,
    sent_per_sec: u32,
}

impl RpcStatistics {
    fn new() -> RpcStatistics {
        RpcStatistics {
            received_bytes: 0,
            sent_bytes: 0,
            dropped_packets: 0,
            dropped_bytes: 0,
            received: [[0; MsgKind::COUNT]; Method::COUNT],
            sent: [[0; MsgKind::COUNT]; Method::COUNT],
            timeouts: [0; Method::COUNT],
            window_started: Instant::now(),
            window_received: 0,
            window_sent: 0,
            received_per_sec: 0,
            sent_per_sec: 0,
        }
    }

    fn on_received_bytes(&mut self, bytes: u64) {
        self.received_bytes += bytes;
        self.window_received += bytes;
    }

    fn on_sent_bytes(&mut self, bytes: u64) {
        self.sent_bytes += bytes;
        self.window_sent += bytes;
    }

    fn on_received_message(&mut self, msg: &Message) {
        self.received[msg.method().index()][msg.kind().index()] += 1;
    }

    fn on_sent_message(&mut self, msg: &Message) {
        self.sent[msg.method().index()][msg.kind().index()] += 1;
    }

    fn on_timeout_message(&mut self, method: Method) {
        self.timeouts[method.index()] += 1;
    }

    fn on_dropped_packet(&mut self, bytes: usize) {
        self.dropped_packets += 1;
        self.dropped_bytes += bytes as u64;
    }

    /// Roll the 1-second window if due; called from the periodic tick.
    pub fn update_rates(&mut self) {
        let elapsed = self.window_started.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let secs = elapsed.as_secs_f64();
            self.received_per_sec = (self.window_received as f64 / secs) as u32;
            self.sent_per_sec = (self.window_sent as f64 / secs) as u32;
            self.window_received = 0;
            self.window_sent = 0;
            self.window_started = Instant::now();
        }
    }

    pub fn received_messages(&self, method: Method, kind: MsgKind) -> u32 {
        self.received[method.index()][kind.index()]
    }

    pub fn sent_messages(&self, method: Method, kind: MsgKind) -> u32 {
        self.sent[method.index()][kind.index()]
    }

    pub fn timeout_messages(&self, method: Method) -> u32 {
        self.timeouts[method.index()]
    }

    pub fn snapshot(&self, active_calls: usize) -> StatsSnapshot {
        StatsSnapshot {
            received_bytes: self.received_bytes,
            sent_bytes: self.sent_bytes,
            dropped_packets: self.dropped_packets,
            dropped_bytes: self.dropped_bytes,
            received_messages: self.received.iter().flatten().map(|&c| c as u64).sum(),
            sent_messages: self.sent.iter().flatten().map(|&c| c as u64).sum(),
            timeout_messages: self.timeouts.iter().map(|&c| c as u64).sum(),
            received_bytes_per_sec: self.received_per_sec,
            sent_bytes_per_sec: self.sent_per_sec,
            active_calls,
        }
    }
}

/// Public statistics surface.
#[derive(Clone, Debug, Default)]
pub struct StatsSnapshot {
    pub received_bytes: u64,
    pub sent_bytes: u64,
    pub dropped_packets: u32,
    pub dropped_bytes: u64,
    pub received_messages: u64,
    pub sent_messages: u64,
    pub timeout_messages: u64,
    pub received_bytes_per_sec: u32,
    pub sent_bytes_per_sec: u32,
    pub active_calls: usize,
}
