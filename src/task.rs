//! # Lookup task engine
//!
//! Iterative Kademlia lookups as explicit state machines, advanced by call
//! completions and scheduler ticks. A running lookup owns a [`ClosestSet`]
//! (best K responders by distance to the target) and a candidate list
//! (known but unqueried nodes), keeps at most α requests in flight, and
//! terminates when no unqueried candidate could still improve the closest
//! set and nothing is in flight.
//!
//! Task kinds: `node-lookup` (find_node), `value-lookup` (find_value),
//! `peer-lookup` (find_peer), and the post-lookup fan-outs
//! `value-announce` (store_value) and `peer-announce` (announce_peer),
//! which retry each target once before giving up on it.
//!
//! The engine never touches sockets: it emits [`TaskAction`]s, and the
//! network actor turns `Send` actions into registered calls and feeds call
//! completions back in. This keeps the engine single-threaded, synchronous,
//! and directly testable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::identity::{closer_to, distance_cmp, Id};
use crate::messages::{
    AnnouncePeerRequest, Body, LookupRequest, Message, StoreValueRequest, Want,
};
use crate::routing::{Network, NodeInfo, K};
use crate::value::{PeerInfo, Value};

/// Parallelism of iterative lookups.
pub const ALPHA: usize = 3;

/// Upper bound on simultaneously running tasks per family.
const MAX_ACTIVE_TASKS: usize = 16;

/// A task that made no progress for this long is finished with whatever
/// partial result it has.
const TASK_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Completion policy for value lookups.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LookupOption {
    /// Keep looking until the closest set is stable; newest value wins.
    #[default]
    Conservative,
    /// Return as soon as any valid value is found.
    Arbitrary,
    /// Conservative, but short-circuit once two responders agree.
    Optimistic,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    Queued,
    Running,
    Finished,
    Canceled,
}

/// Terminal payload of a finished task.
#[derive(Debug)]
pub enum TaskResult {
    /// Lookup outcome: the closest responders (with their write tokens),
    /// plus whatever the method collects.
    Lookup {
        closest: Vec<(NodeInfo, u32)>,
        value: Option<Value>,
        peers: Vec<PeerInfo>,
    },
    /// Announce outcome: nodes that acknowledged the write.
    Acks(Vec<NodeInfo>),
}

/// Work orders handed back to the network actor.
#[derive(Debug)]
pub enum TaskAction {
    /// Register and transmit this request as a call owned by `task_id`.
    Send {
        task_id: u64,
        node: NodeInfo,
        message: Message,
    },
    /// The task finished (or hit its deadline) with this result.
    Completed {
        task_id: u64,
        name: &'static str,
        result: TaskResult,
    },
}

// ---------------------------------------------------------------------------
// Closest set and candidates
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct ClosestEntry {
    info: NodeInfo,
    token: u32,
}

/// The running best-K responders, ordered by distance to the target.
pub struct ClosestSet {
    target: Id,
    capacity: usize,
    entries: Vec<ClosestEntry>,
}

impl ClosestSet {
    fn new(target: Id, capacity: usize) -> ClosestSet {
        ClosestSet {
            target,
            capacity,
            entries: Vec::with_capacity(capacity + 1),
        }
    }

    fn insert(&mut self, info: NodeInfo, token: u32) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.info.id == info.id) {
            if token != 0 {
                existing.token = token;
            }
            return;
        }
        self.entries.push(ClosestEntry { info, token });
        let target = self.target;
        self.entries
            .sort_by(|a, b| closer_to(&target, &a.info.id, &b.info.id));
        self.entries.truncate(self.capacity);
    }

    /// Could `id` still enter this set?
    fn would_accept(&self, id: &Id) -> bool {
        if self.entries.len() < self.capacity {
            return true;
        }
        let worst = &self.entries[self.entries.len() - 1].info.id;
        distance_cmp(&self.target.distance(id), &self.target.distance(worst))
            == std::cmp::Ordering::Less
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn into_vec(self) -> Vec<(NodeInfo, u32)> {
        self.entries
            .into_iter()
            .map(|e| (e.info, e.token))
            .collect()
    }
}

struct CandidateNode {
    info: NodeInfo,
    queried: bool,
    in_flight: bool,
    unreachable: bool,
}

/// State shared by the three lookup kinds.
struct LookupState {
    target: Id,
    network: Network,
    want: Want,
    closest: ClosestSet,
    candidates: Vec<CandidateNode>,
    seen: HashSet<Id>,
    in_flight: usize,
}

impl LookupState {
    fn new(target: Id, network: Network, want: Want, local_id: Id, seeds: Vec<NodeInfo>) -> Self {
        let mut state = LookupState {
            target,
            network,
            want,
            closest: ClosestSet::new(target, K),
            candidates: Vec::new(),
            seen: HashSet::from([local_id]),
            in_flight: 0,
        };
        state.add_candidates(seeds);
        state
    }

    fn add_candidates(&mut self, nodes: Vec<NodeInfo>) {
        for info in nodes {
            if !self.network.can_use(&info.addr) {
                continue;
            }
            if !self.seen.insert(info.id) {
                continue;
            }
            self.candidates.push(CandidateNode {
                info,
                queried: false,
                in_flight: false,
                unreachable: false,
            });
        }
    }

    /// Pick the unqueried candidate closest to the target that could still
    /// improve the closest set; marks it queried and in flight.
    fn next_candidate(&mut self) -> Option<NodeInfo> {
        let target = self.target;
        let best = self
            .candidates
            .iter_mut()
            .filter(|c| !c.queried && !c.unreachable)
            .filter(|c| self.closest.would_accept(&c.info.id))
            .min_by(|a, b| closer_to(&target, &a.info.id, &b.info.id))?;
        best.queried = true;
        best.in_flight = true;
        self.in_flight += 1;
        Some(best.info.clone())
    }

    /// Returns false for stale events (no such in-flight candidate).
    fn settle(&mut self, id: &Id, ok: bool) -> bool {
        let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| c.info.id == *id && c.in_flight)
        else {
            return false;
        };
        candidate.in_flight = false;
        candidate.unreachable = !ok;
        self.in_flight = self.in_flight.saturating_sub(1);
        true
    }

    fn is_done(&self) -> bool {
        self.in_flight == 0
            && !self.candidates.iter().any(|c| {
                !c.queried && !c.unreachable && self.closest.would_accept(&c.info.id)
            })
    }
}

// ---------------------------------------------------------------------------
// Task kinds
// ---------------------------------------------------------------------------

enum AnnouncePayload {
    Value {
        value: Value,
        expected_seq: Option<i32>,
    },
    Peer(PeerInfo),
}

struct AnnounceState {
    payload: AnnouncePayload,
    todo: VecDeque<(NodeInfo, u32)>,
    pending: HashMap<Id, (NodeInfo, u32)>,
    retried: HashSet<Id>,
    acked: Vec<NodeInfo>,
}

impl AnnounceState {
    fn new(payload: AnnouncePayload, closest: Vec<(NodeInfo, u32)>) -> AnnounceState {
        let todo: VecDeque<_> = closest
            .into_iter()
            .filter(|(node, token)| {
                if *token == 0 {
                    debug!(node = %node.id, "skipping announce target without token");
                    false
                } else {
                    true
                }
            })
            .collect();
        AnnounceState {
            payload,
            todo,
            pending: HashMap::new(),
            retried: HashSet::new(),
            acked: Vec::new(),
        }
    }

    fn request(&self, token: u32) -> Body {
        match &self.payload {
            AnnouncePayload::Value {
                value,
                expected_seq,
            } => Body::StoreValueRequest(StoreValueRequest {
                token,
                value: value.clone(),
                expected_seq: *expected_seq,
            }),
            AnnouncePayload::Peer(peer) => {
                Body::AnnouncePeerRequest(AnnouncePeerRequest::from_peer(token, peer))
            }
        }
    }

    fn is_done(&self) -> bool {
        self.todo.is_empty() && self.pending.is_empty()
    }
}

enum TaskKind {
    NodeLookup(LookupState),
    ValueLookup {
        state: LookupState,
        option: LookupOption,
        found: Option<Value>,
        agreement: u32,
    },
    PeerLookup {
        state: LookupState,
        expected: usize,
        peers: Vec<PeerInfo>,
        dedup: HashSet<(Id, Id)>,
    },
    Announce(AnnounceState),
}

struct Task {
    id: u64,
    name: &'static str,
    state: TaskState,
    started_at: Option<Instant>,
    kind: TaskKind,
}

impl Task {
    fn lookup_state(&mut self) -> Option<&mut LookupState> {
        match &mut self.kind {
            TaskKind::NodeLookup(state) => Some(state),
            TaskKind::ValueLookup { state, .. } => Some(state),
            TaskKind::PeerLookup { state, .. } => Some(state),
            TaskKind::Announce(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task manager
// ---------------------------------------------------------------------------

/// Owns every task of one family's engine; queued tasks start as running
/// ones finish.
pub struct TaskManager {
    next_id: u64,
    tasks: HashMap<u64, Task>,
    queued: VecDeque<u64>,
    running: usize,
}

impl TaskManager {
    pub fn new() -> TaskManager {
        TaskManager {
            next_id: 1,
            tasks: HashMap::new(),
            queued: VecDeque::new(),
            running: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn enqueue(&mut self, name: &'static str, kind: TaskKind) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.insert(
            id,
            Task {
                id,
                name,
                state: TaskState::Queued,
                started_at: None,
                kind,
            },
        );
        self.queued.push_back(id);
        trace!(task = id, name, "task queued");
        id
    }

    pub fn add_node_lookup(
        &mut self,
        target: Id,
        network: Network,
        want: Want,
        local_id: Id,
        seeds: Vec<NodeInfo>,
    ) -> u64 {
        self.enqueue(
            "node-lookup",
            TaskKind::NodeLookup(LookupState::new(target, network, want, local_id, seeds)),
        )
    }

    pub fn add_value_lookup(
        &mut self,
        target: Id,
        network: Network,
        want: Want,
        local_id: Id,
        seeds: Vec<NodeInfo>,
        option: LookupOption,
    ) -> u64 {
        self.enqueue(
            "value-lookup",
            TaskKind::ValueLookup {
                state: LookupState::new(target, network, want, local_id, seeds),
                option,
                found: None,
                agreement: 0,
            },
        )
    }

    pub fn add_peer_lookup(
        &mut self,
        target: Id,
        network: Network,
        want: Want,
        local_id: Id,
        seeds: Vec<NodeInfo>,
        expected: usize,
    ) -> u64 {
        self.enqueue(
            "peer-lookup",
            TaskKind::PeerLookup {
                state: LookupState::new(target, network, want, local_id, seeds),
                expected,
                peers: Vec::new(),
                dedup: HashSet::new(),
            },
        )
    }

    pub fn add_value_announce(
        &mut self,
        value: Value,
        expected_seq: Option<i32>,
        closest: Vec<(NodeInfo, u32)>,
    ) -> u64 {
        self.enqueue(
            "value-announce",
            TaskKind::Announce(AnnounceState::new(
                AnnouncePayload::Value {
                    value,
                    expected_seq,
                },
                closest,
            )),
        )
    }

    pub fn add_peer_announce(&mut self, peer: PeerInfo, closest: Vec<(NodeInfo, u32)>) -> u64 {
        self.enqueue(
            "peer-announce",
            TaskKind::Announce(AnnounceState::new(AnnouncePayload::Peer(peer), closest)),
        )
    }

    /// Cancel a task; the actor discards its outstanding calls.
    pub fn cancel(&mut self, task_id: u64) -> bool {
        if let Some(mut task) = self.tasks.remove(&task_id) {
            task.state = TaskState::Canceled;
            if task.started_at.is_some() {
                self.running = self.running.saturating_sub(1);
            }
            debug!(task = task_id, name = task.name, "task canceled");
            true
        } else {
            false
        }
    }

    /// Promote queued tasks, apply deadlines, and emit any sends due.
    /// Call after adding tasks and from the periodic tick.
    pub fn pump(&mut self) -> Vec<TaskAction> {
        let mut actions = Vec::new();

        // Deadline sweep.
        let now = Instant::now();
        let overdue: Vec<u64> = self
            .tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Running
                    && t.started_at
                        .map(|s| now.duration_since(s) >= TASK_TIMEOUT)
                        .unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();
        for id in overdue {
            warn!(task = id, "task deadline reached, finishing with partial result");
            self.finish(id, &mut actions);
        }

        // Start queued tasks as capacity allows.
        while self.running < MAX_ACTIVE_TASKS {
            let Some(id) = self.queued.pop_front() else {
                break;
            };
            let Some(task) = self.tasks.get_mut(&id) else {
                continue; // canceled while queued
            };
            task.state = TaskState::Running;
            task.started_at = Some(Instant::now());
            self.running += 1;
            debug!(task = id, name = task.name, "task started");
            self.drive(id, &mut actions);
        }

        // Nudge running tasks that may have become done or gained headroom.
        let running: Vec<u64> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .map(|t| t.id)
            .collect();
        for id in running {
            self.drive(id, &mut actions);
        }

        actions
    }

    /// A call owned by `task_id` got a matching response.
    pub fn on_response(
        &mut self,
        task_id: u64,
        responder: &NodeInfo,
        message: &Message,
    ) -> Vec<TaskAction> {
        let mut actions = Vec::new();
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return actions;
        };

        let mut finish_early = false;
        match &mut task.kind {
            TaskKind::NodeLookup(state) => {
                if state.settle(&responder.id, true) {
                    absorb_lookup_response(state, responder, message);
                }
            }
            TaskKind::ValueLookup {
                state,
                option,
                found,
                agreement,
            } => {
                if state.settle(&responder.id, true) {
                    absorb_lookup_response(state, responder, message);
                    if let Body::FindValueResponse(r) = &message.body {
                        if let Some(value) = &r.value {
                            absorb_value(state, value, found, agreement);
                            finish_early = match option {
                                LookupOption::Arbitrary => found.is_some(),
                                LookupOption::Optimistic => *agreement >= 2,
                                LookupOption::Conservative => false,
                            };
                        }
                    }
                }
            }
            TaskKind::PeerLookup {
                state,
                expected,
                peers,
                dedup,
            } => {
                if state.settle(&responder.id, true) {
                    absorb_lookup_response(state, responder, message);
                    if let Body::FindPeerResponse(r) = &message.body {
                        for peer in r.peers4.iter().chain(r.peers6.iter()) {
                            if *peer.peer_id() != state.target {
                                continue;
                            }
                            if peer.verify().is_err() {
                                debug!(peer = %peer.peer_id(), "ignoring peer with bad signature");
                                continue;
                            }
                            if dedup.insert((*peer.peer_id(), *peer.node_id())) {
                                peers.push(peer.clone());
                            }
                        }
                        finish_early = *expected > 0 && peers.len() >= *expected;
                    }
                }
            }
            TaskKind::Announce(state) => {
                if state.pending.remove(&responder.id).is_some() {
                    match &message.body {
                        Body::StoreValueResponse | Body::AnnouncePeerResponse => {
                            state.acked.push(responder.clone());
                        }
                        _ => {
                            debug!(node = %responder.id, "unexpected announce response body");
                        }
                    }
                }
            }
        }

        if finish_early {
            self.finish(task_id, &mut actions);
        } else {
            self.drive(task_id, &mut actions);
        }
        actions
    }

    /// A call owned by `task_id` timed out or came back as an error.
    pub fn on_failure(&mut self, task_id: u64, responder: &Id) -> Vec<TaskAction> {
        let mut actions = Vec::new();
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return actions;
        };

        match &mut task.kind {
            TaskKind::Announce(state) => {
                if let Some((node, token)) = state.pending.remove(responder) {
                    if state.retried.insert(*responder) {
                        state.todo.push_back((node, token));
                    }
                }
            }
            _ => {
                if let Some(state) = task.lookup_state() {
                    state.settle(responder, false);
                }
            }
        }

        self.drive(task_id, &mut actions);
        actions
    }

    /// Emit sends up to α and finish the task when its state says so.
    fn drive(&mut self, task_id: u64, actions: &mut Vec<TaskAction>) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if task.state != TaskState::Running {
            return;
        }

        // Which lookup request to build, decided before borrowing the state.
        enum Probe {
            Node,
            Value,
            Peer,
        }
        let probe = match &task.kind {
            TaskKind::NodeLookup(_) => Some(Probe::Node),
            TaskKind::ValueLookup { .. } => Some(Probe::Value),
            TaskKind::PeerLookup { .. } => Some(Probe::Peer),
            TaskKind::Announce(_) => None,
        };

        let done;
        match (&mut task.kind, probe) {
            (TaskKind::Announce(state), _) => {
                while state.pending.len() < ALPHA {
                    let Some((node, token)) = state.todo.pop_front() else {
                        break;
                    };
                    let message = Message::new(state.request(token));
                    state.pending.insert(node.id, (node.clone(), token));
                    actions.push(TaskAction::Send {
                        task_id,
                        node,
                        message,
                    });
                }
                done = state.is_done();
            }
            (kind, Some(probe)) => {
                let state = match kind {
                    TaskKind::NodeLookup(state) => state,
                    TaskKind::ValueLookup { state, .. } => state,
                    TaskKind::PeerLookup { state, .. } => state,
                    TaskKind::Announce(_) => unreachable!("handled above"),
                };
                let request = LookupRequest {
                    target: state.target,
                    want: state.want,
                };
                while state.in_flight < ALPHA {
                    let Some(node) = state.next_candidate() else {
                        break;
                    };
                    let body = match probe {
                        Probe::Node => Body::FindNodeRequest(request.clone()),
                        Probe::Value => Body::FindValueRequest(request.clone()),
                        Probe::Peer => Body::FindPeerRequest(request.clone()),
                    };
                    actions.push(TaskAction::Send {
                        task_id,
                        node,
                        message: Message::new(body),
                    });
                }
                done = state.is_done();
            }
            (_, None) => unreachable!("announce handled above"),
        }

        if done {
            self.finish(task_id, actions);
        }
    }

    fn finish(&mut self, task_id: u64, actions: &mut Vec<TaskAction>) {
        let Some(mut task) = self.tasks.remove(&task_id) else {
            return;
        };
        if task.started_at.is_some() {
            self.running = self.running.saturating_sub(1);
        }
        task.state = TaskState::Finished;

        let result = match task.kind {
            TaskKind::NodeLookup(state) => TaskResult::Lookup {
                closest: state.closest.into_vec(),
                value: None,
                peers: Vec::new(),
            },
            TaskKind::ValueLookup { state, found, .. } => TaskResult::Lookup {
                closest: state.closest.into_vec(),
                value: found,
                peers: Vec::new(),
            },
            TaskKind::PeerLookup { state, peers, .. } => TaskResult::Lookup {
                closest: state.closest.into_vec(),
                value: None,
                peers,
            },
            TaskKind::Announce(state) => TaskResult::Acks(state.acked),
        };

        debug!(task = task_id, name = task.name, "task finished");
        actions.push(TaskAction::Completed {
            task_id,
            name: task.name,
            result,
        });
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold a lookup response into the shared state: the responder joins the
/// closest set (with its token, if any) and the returned nodes of this
/// family become candidates.
fn absorb_lookup_response(state: &mut LookupState, responder: &NodeInfo, message: &Message) {
    let (token, nodes) = match &message.body {
        Body::FindNodeResponse(r) => (r.token, nodes_for(state.network, r)),
        Body::FindValueResponse(r) => (r.nodes.token, nodes_for(state.network, &r.nodes)),
        Body::FindPeerResponse(r) => (r.nodes.token, nodes_for(state.network, &r.nodes)),
        _ => (0, Vec::new()),
    };
    state.closest.insert(responder.clone(), token);
    state.add_candidates(nodes);
}

fn nodes_for(network: Network, r: &crate::messages::LookupResponse) -> Vec<NodeInfo> {
    match network {
        Network::V4 => r.nodes4.clone(),
        Network::V6 => r.nodes6.clone(),
    }
}

/// Keep the best value seen so far; counts agreeing responders.
fn absorb_value(
    state: &LookupState,
    candidate: &Value,
    found: &mut Option<Value>,
    agreement: &mut u32,
) {
    if candidate.validate().is_err() {
        debug!(target = %state.target, "ignoring invalid value from responder");
        return;
    }
    if candidate.id() != state.target {
        debug!(target = %state.target, "ignoring value with mismatched id");
        return;
    }

    match found {
        None => {
            *found = Some(candidate.clone());
            *agreement = 1;
        }
        Some(current) => {
            if candidate.is_mutable()
                && candidate.sequence_number() > current.sequence_number()
            {
                *found = Some(candidate.clone());
                *agreement = 1;
            } else if candidate.sequence_number() == current.sequence_number() {
                *agreement += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::messages::{FindValueResponse, LookupResponse};

    fn node(n: u16) -> NodeInfo {
        NodeInfo::new(Id::random(), format!("10.1.0.{}:39001", n % 250 + 1).parse().unwrap())
    }

    fn sends(actions: &[TaskAction]) -> Vec<(u64, NodeInfo)> {
        actions
            .iter()
            .filter_map(|a| match a {
                TaskAction::Send { task_id, node, .. } => Some((*task_id, node.clone())),
                _ => None,
            })
            .collect()
    }

    fn completion(actions: &[TaskAction]) -> Option<&TaskResult> {
        actions.iter().find_map(|a| match a {
            TaskAction::Completed { result, .. } => Some(result),
            _ => None,
        })
    }

    fn respond_nodes(
        manager: &mut TaskManager,
        task: u64,
        responder: &NodeInfo,
        nodes4: Vec<NodeInfo>,
        token: u32,
    ) -> Vec<TaskAction> {
        let msg = Message::new(Body::FindNodeResponse(LookupResponse {
            nodes4,
            nodes6: Vec::new(),
            token,
        }));
        manager.on_response(task, responder, &msg)
    }

    #[test]
    fn node_lookup_queries_alpha_at_a_time() {
        let mut manager = TaskManager::new();
        let seeds: Vec<NodeInfo> = (1..=6).map(node).collect();
        let target = Id::random();
        let task = manager.add_node_lookup(
            target,
            Network::V4,
            Want { v4: true, v6: false },
            Id::random(),
            seeds,
        );

        let actions = manager.pump();
        assert_eq!(sends(&actions).len(), ALPHA);
        assert!(completion(&actions).is_none());
        let _ = task;
    }

    #[test]
    fn node_lookup_converges_to_closest_set() {
        let mut manager = TaskManager::new();
        let target = Id::random();
        let seeds: Vec<NodeInfo> = (1..=4).map(node).collect();
        let task = manager.add_node_lookup(
            target,
            Network::V4,
            Want { v4: true, v6: false },
            Id::random(),
            seeds.clone(),
        );

        let mut outstanding = sends(&manager.pump());
        let mut responders: Vec<NodeInfo> = Vec::new();
        let mut guard = 0;
        while !outstanding.is_empty() {
            guard += 1;
            assert!(guard < 100, "lookup did not converge");
            let mut next = Vec::new();
            for (task_id, node_info) in outstanding {
                responders.push(node_info.clone());
                let actions = respond_nodes(&mut manager, task_id, &node_info, Vec::new(), 42);
                if let Some(TaskResult::Lookup { closest, .. }) = completion(&actions) {
                    // Every responder ends up in the closest set with its token.
                    assert_eq!(closest.len(), responders.len().min(K));
                    for (_, token) in closest {
                        assert_eq!(*token, 42);
                    }
                    assert!(manager.is_empty());
                    return;
                }
                next.extend(sends(&actions));
            }
            outstanding = next;
        }
        panic!("lookup finished without completion action");
    }

    #[test]
    fn lookup_learns_new_candidates_from_responses() {
        let mut manager = TaskManager::new();
        let target = Id::random();
        let seed = node(1);
        let task = manager.add_node_lookup(
            target,
            Network::V4,
            Want { v4: true, v6: false },
            Id::random(),
            vec![seed.clone()],
        );

        let actions = manager.pump();
        assert_eq!(sends(&actions).len(), 1);

        // The seed returns three fresh nodes; all become queryable.
        let learned: Vec<NodeInfo> = (10..13).map(node).collect();
        let actions = respond_nodes(&mut manager, task, &seed, learned.clone(), 0);
        let new_sends = sends(&actions);
        assert_eq!(new_sends.len(), 3);
        let sent_ids: HashSet<Id> = new_sends.iter().map(|(_, n)| n.id).collect();
        for n in &learned {
            assert!(sent_ids.contains(&n.id));
        }
    }

    #[test]
    fn lookup_tolerates_timeouts() {
        let mut manager = TaskManager::new();
        let target = Id::random();
        let seeds: Vec<NodeInfo> = (1..=3).map(node).collect();
        let task = manager.add_node_lookup(
            target,
            Network::V4,
            Want { v4: true, v6: false },
            Id::random(),
            seeds.clone(),
        );

        let outstanding = sends(&manager.pump());
        assert_eq!(outstanding.len(), 3);

        let mut completed = false;
        for (i, (task_id, node_info)) in outstanding.into_iter().enumerate() {
            let actions = if i == 0 {
                respond_nodes(&mut manager, task_id, &node_info, Vec::new(), 0)
            } else {
                manager.on_failure(task_id, &node_info.id)
            };
            if let Some(TaskResult::Lookup { closest, .. }) = completion(&actions) {
                // Only the one responder made it into the closest set.
                assert_eq!(closest.len(), 1);
                completed = true;
            }
        }
        assert!(completed);
        let _ = task;
    }

    #[test]
    fn value_lookup_arbitrary_returns_first_valid() {
        let mut manager = TaskManager::new();
        let kp = Keypair::random();
        let value = Value::of_signed(&kp, [1u8; 24], 5, b"payload".to_vec()).unwrap();
        let target = value.id();

        let seeds: Vec<NodeInfo> = (1..=4).map(node).collect();
        let task = manager.add_value_lookup(
            target,
            Network::V4,
            Want { v4: true, v6: false },
            Id::random(),
            seeds,
            LookupOption::Arbitrary,
        );

        let outstanding = sends(&manager.pump());
        let (task_id, responder) = outstanding[0].clone();
        let msg = Message::new(Body::FindValueResponse(FindValueResponse {
            nodes: LookupResponse::default(),
            value: Some(value.clone()),
        }));
        let actions = manager.on_response(task_id, &responder, &msg);
        match completion(&actions) {
            Some(TaskResult::Lookup { value: Some(v), .. }) => assert_eq!(*v, value),
            other => panic!("expected early completion with value, got {other:?}"),
        }
        let _ = task;
    }

    #[test]
    fn value_lookup_conservative_keeps_newest() {
        let mut manager = TaskManager::new();
        let kp = Keypair::random();
        let nonce = [1u8; 24];
        let old = Value::of_signed(&kp, nonce, 1, b"old".to_vec()).unwrap();
        let new = Value::of_signed(&kp, nonce, 2, b"new".to_vec()).unwrap();
        let target = new.id();

        let seeds: Vec<NodeInfo> = (1..=2).map(node).collect();
        let task = manager.add_value_lookup(
            target,
            Network::V4,
            Want { v4: true, v6: false },
            Id::random(),
            seeds,
            LookupOption::Conservative,
        );

        let outstanding = sends(&manager.pump());
        assert_eq!(outstanding.len(), 2);

        let mut final_result = None;
        for (i, (task_id, responder)) in outstanding.into_iter().enumerate() {
            let value = if i == 0 { old.clone() } else { new.clone() };
            let msg = Message::new(Body::FindValueResponse(FindValueResponse {
                nodes: LookupResponse::default(),
                value: Some(value),
            }));
            let actions = manager.on_response(task_id, &responder, &msg);
            if let Some(TaskResult::Lookup { value, .. }) = completion(&actions) {
                final_result = value.clone();
            }
        }
        assert_eq!(final_result, Some(new));
        let _ = task;
    }

    #[test]
    fn value_lookup_rejects_forged_values() {
        let mut manager = TaskManager::new();
        let kp = Keypair::random();
        let value = Value::of_signed(&kp, [1u8; 24], 5, b"payload".to_vec()).unwrap();
        let target = value.id();

        let mut forged = value.clone();
        forged.sequence_number = 9; // signature no longer matches

        let seeds = vec![node(1)];
        let task = manager.add_value_lookup(
            target,
            Network::V4,
            Want { v4: true, v6: false },
            Id::random(),
            seeds,
            LookupOption::Arbitrary,
        );

        let outstanding = sends(&manager.pump());
        let (task_id, responder) = outstanding[0].clone();
        let msg = Message::new(Body::FindValueResponse(FindValueResponse {
            nodes: LookupResponse::default(),
            value: Some(forged),
        }));
        let actions = manager.on_response(task_id, &responder, &msg);
        match completion(&actions) {
            Some(TaskResult::Lookup { value, .. }) => assert!(value.is_none()),
            other => panic!("{other:?}"),
        }
        let _ = task;
    }

    #[test]
    fn announce_fans_out_and_retries_once() {
        let mut manager = TaskManager::new();
        let kp = Keypair::random();
        let value = Value::of_signed(&kp, [2u8; 24], 1, b"stored".to_vec()).unwrap();

        let targets: Vec<(NodeInfo, u32)> =
            (1..=4).map(|n| (node(n), 100 + n as u32)).collect();
        let failing = targets[2].0.id;
        let no_token = (node(9), 0u32);
        let mut closest = targets.clone();
        closest.push(no_token.clone());

        let task = manager.add_value_announce(value, None, closest);
        let ack = Message::new(Body::StoreValueResponse);

        // Process every emitted send: one target fails both attempts, the
        // rest acknowledge.
        let mut queue: VecDeque<NodeInfo> = VecDeque::new();
        let mut sent_total = 0usize;
        let mut actions = manager.pump();
        let mut guard = 0;
        loop {
            guard += 1;
            assert!(guard < 32, "announce did not settle");
            for (_, node_info) in sends(&actions) {
                sent_total += 1;
                queue.push_back(node_info);
            }
            if let Some(TaskResult::Acks(acks)) = completion(&actions) {
                let ids: HashSet<Id> = acks.iter().map(|n| n.id).collect();
                assert_eq!(acks.len(), 3);
                for (node_info, _) in &targets {
                    if node_info.id == failing {
                        assert!(!ids.contains(&node_info.id));
                    } else {
                        assert!(ids.contains(&node_info.id));
                    }
                }
                // The tokenless node was never contacted.
                assert!(!ids.contains(&no_token.0.id));
                // Four targets, one retried once.
                assert_eq!(sent_total, 5);
                return;
            }
            let node_info = queue.pop_front().expect("no completion and nothing to answer");
            actions = if node_info.id == failing {
                manager.on_failure(task, &node_info.id)
            } else {
                manager.on_response(task, &node_info, &ack)
            };
        }
    }

    #[test]
    fn canceled_task_ignores_events() {
        let mut manager = TaskManager::new();
        let seeds = vec![node(1)];
        let task = manager.add_node_lookup(
            Id::random(),
            Network::V4,
            Want { v4: true, v6: false },
            Id::random(),
            seeds.clone(),
        );
        let outstanding = sends(&manager.pump());
        assert_eq!(outstanding.len(), 1);

        assert!(manager.cancel(task));
        let actions = respond_nodes(&mut manager, task, &seeds[0], Vec::new(), 0);
        assert!(actions.is_empty());
        assert!(manager.is_empty());
    }
}
