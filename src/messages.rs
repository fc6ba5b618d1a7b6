//! # Wire protocol messages
//!
//! The CBOR schema shared by every datagram. A message is a small map with
//! single-letter keys:
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `y` | type byte: upper 3 bits = kind (error/request/response), lower 5 = method |
//! | `t` | 31-bit transaction id (never 0) |
//! | `v` | sender software version tag |
//! | `q` / `r` / `e` | exactly one body map, matching the kind |
//!
//! Body maps use a fixed short-key alphabet (`t` target, `w` want mask,
//! `tok` token, `k`/`rec`/`n`/`sig`/`seq`/`v` value fields, `cas` expected
//! seq, `n4`/`n6` node lists, `p4`/`p6` peer lists, `p` port, `alt`
//! alternative URL, `o` delegated origin, `c`/`m` error code and text).
//!
//! Every message kind exposes [`Message::estimate_size`], an upper bound on
//! its serialized form used to keep responses under a single-packet budget;
//! the tests hold `serialize(m).len() <= m.estimate_size()` for all kinds.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ciborium::value::{Integer, Value as Cbor};

use crate::error::{Error, Result};
use crate::identity::Id;
use crate::routing::NodeInfo;
use crate::value::{PeerInfo, Value, SEQ_IMMUTABLE};

const MSG_KIND_MASK: u8 = 0xE0;
const MSG_METHOD_MASK: u8 = 0x1F;

/// Fixed serialization overhead of the outer map (`y`, `t`, `v`).
pub const BASE_SIZE: usize = 56;

/// Single-UDP-packet safety budget for responses carrying lists.
pub const MAX_PACKET_BUDGET: usize = 1400;

const NODE4_SIZE: usize = 44;
const NODE6_SIZE: usize = 56;

/// RPC method selector (low 5 bits of the type byte).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Method {
    Unknown,
    Ping,
    FindNode,
    AnnouncePeer,
    FindPeer,
    StoreValue,
    FindValue,
}

impl Method {
    pub const COUNT: usize = 7;

    pub fn bits(&self) -> u8 {
        match self {
            Method::Unknown => 0x00,
            Method::Ping => 0x01,
            Method::FindNode => 0x02,
            Method::AnnouncePeer => 0x03,
            Method::FindPeer => 0x04,
            Method::StoreValue => 0x05,
            Method::FindValue => 0x06,
        }
    }

    pub fn from_bits(bits: u8) -> Result<Method> {
        Ok(match bits & MSG_METHOD_MASK {
            0x00 => Method::Unknown,
            0x01 => Method::Ping,
            0x02 => Method::FindNode,
            0x03 => Method::AnnouncePeer,
            0x04 => Method::FindPeer,
            0x05 => Method::StoreValue,
            0x06 => Method::FindValue,
            other => return Err(Error::protocol(format!("unknown method {other:#04x}"))),
        })
    }

    pub fn index(&self) -> usize {
        self.bits() as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Unknown => "unknown",
            Method::Ping => "ping",
            Method::FindNode => "find_node",
            Method::AnnouncePeer => "announce_peer",
            Method::FindPeer => "find_peer",
            Method::StoreValue => "store_value",
            Method::FindValue => "find_value",
        }
    }
}

/// Message kind (high 3 bits of the type byte).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MsgKind {
    Error,
    Request,
    Response,
}

impl MsgKind {
    pub const COUNT: usize = 3;

    pub fn bits(&self) -> u8 {
        match self {
            MsgKind::Error => 0x00,
            MsgKind::Request => 0x20,
            MsgKind::Response => 0x40,
        }
    }

    pub fn from_bits(bits: u8) -> Result<MsgKind> {
        Ok(match bits & MSG_KIND_MASK {
            0x00 => MsgKind::Error,
            0x20 => MsgKind::Request,
            0x40 => MsgKind::Response,
            other => return Err(Error::protocol(format!("unknown message kind {other:#04x}"))),
        })
    }

    pub fn index(&self) -> usize {
        (self.bits() >> 5) as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            MsgKind::Error => "e",
            MsgKind::Request => "q",
            MsgKind::Response => "r",
        }
    }
}

/// Which address families the requester wants node lists for.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Want {
    pub v4: bool,
    pub v6: bool,
}

impl Want {
    pub fn both() -> Want {
        Want { v4: true, v6: true }
    }

    pub fn bits(&self) -> u8 {
        (self.v4 as u8) | ((self.v6 as u8) << 1)
    }

    pub fn from_bits(bits: u8) -> Want {
        Want {
            v4: bits & 0x01 != 0,
            v6: bits & 0x02 != 0,
        }
    }
}

/// Common body of the three lookup requests.
#[derive(Clone, PartialEq, Debug)]
pub struct LookupRequest {
    pub target: Id,
    pub want: Want,
}

/// Common body of lookup responses: closest nodes per family plus a token
/// gating subsequent write-class requests.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct LookupResponse {
    pub nodes4: Vec<NodeInfo>,
    pub nodes6: Vec<NodeInfo>,
    /// 0 means "no token issued".
    pub token: u32,
}

#[derive(Clone, PartialEq, Debug)]
pub struct FindValueResponse {
    pub nodes: LookupResponse,
    pub value: Option<Value>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct FindPeerResponse {
    pub nodes: LookupResponse,
    pub peers4: Vec<PeerInfo>,
    pub peers6: Vec<PeerInfo>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct StoreValueRequest {
    pub token: u32,
    pub value: Value,
    /// Compare-and-swap guard: expected stored sequence number.
    pub expected_seq: Option<i32>,
}

/// Announce body. The carried record's `node_id` is implicit: it is the
/// sender id of the datagram, re-attached by the receiving handler.
#[derive(Clone, PartialEq, Debug)]
pub struct AnnouncePeerRequest {
    pub token: u32,
    pub peer_id: Id,
    pub origin: Option<Id>,
    pub port: u16,
    pub alternative_url: Option<String>,
    pub signature: Vec<u8>,
}

impl AnnouncePeerRequest {
    pub fn from_peer(token: u32, peer: &PeerInfo) -> AnnouncePeerRequest {
        AnnouncePeerRequest {
            token,
            peer_id: *peer.peer_id(),
            origin: if peer.is_delegated() {
                Some(*peer.origin())
            } else {
                None
            },
            port: peer.port(),
            alternative_url: peer.alternative_url().map(str::to_owned),
            signature: peer.signature().to_vec(),
        }
    }

    /// Rebuild the announced record; `node_id` is the datagram sender.
    pub fn to_peer(&self, node_id: Id) -> PeerInfo {
        PeerInfo::from_parts(
            self.peer_id,
            node_id,
            self.origin,
            self.port,
            self.alternative_url.clone(),
            self.signature.clone(),
        )
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct ErrorBody {
    pub method: Method,
    pub code: i32,
    pub message: String,
}

/// Typed message body; the variant determines kind and method.
#[derive(Clone, PartialEq, Debug)]
pub enum Body {
    PingRequest,
    PingResponse,
    FindNodeRequest(LookupRequest),
    FindNodeResponse(LookupResponse),
    FindValueRequest(LookupRequest),
    FindValueResponse(FindValueResponse),
    StoreValueRequest(StoreValueRequest),
    StoreValueResponse,
    FindPeerRequest(LookupRequest),
    FindPeerResponse(FindPeerResponse),
    AnnouncePeerRequest(AnnouncePeerRequest),
    AnnouncePeerResponse,
    Error(ErrorBody),
}

/// A wire message plus its transport bookkeeping.
///
/// `id` (the sender) and `origin` are stamped by the server on receive;
/// `remote` is set before send. None of the bookkeeping is serialized.
#[derive(Clone, Debug)]
pub struct Message {
    pub id: Id,
    pub txid: u32,
    pub version: i64,
    pub origin: Option<SocketAddr>,
    pub remote: Option<(Id, SocketAddr)>,
    pub body: Body,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.txid == other.txid
            && self.version == other.version
            && self.body == other.body
    }
}

impl Message {
    pub fn new(body: Body) -> Message {
        Message {
            id: Id::MIN,
            txid: 0,
            version: 0,
            origin: None,
            remote: None,
            body,
        }
    }

    /// Build a response to `request`, addressed back to its origin.
    pub fn respond_to(request: &Message, body: Body) -> Message {
        let mut msg = Message::new(body);
        msg.txid = request.txid;
        if let Some(origin) = request.origin {
            msg.remote = Some((request.id, origin));
        }
        msg
    }

    pub fn kind(&self) -> MsgKind {
        match &self.body {
            Body::PingRequest
            | Body::FindNodeRequest(_)
            | Body::FindValueRequest(_)
            | Body::StoreValueRequest(_)
            | Body::FindPeerRequest(_)
            | Body::AnnouncePeerRequest(_) => MsgKind::Request,
            Body::PingResponse
            | Body::FindNodeResponse(_)
            | Body::FindValueResponse(_)
            | Body::StoreValueResponse
            | Body::FindPeerResponse(_)
            | Body::AnnouncePeerResponse => MsgKind::Response,
            Body::Error(_) => MsgKind::Error,
        }
    }

    pub fn method(&self) -> Method {
        match &self.body {
            Body::PingRequest | Body::PingResponse => Method::Ping,
            Body::FindNodeRequest(_) | Body::FindNodeResponse(_) => Method::FindNode,
            Body::FindValueRequest(_) | Body::FindValueResponse(_) => Method::FindValue,
            Body::StoreValueRequest(_) | Body::StoreValueResponse => Method::StoreValue,
            Body::FindPeerRequest(_) | Body::FindPeerResponse(_) => Method::FindPeer,
            Body::AnnouncePeerRequest(_) | Body::AnnouncePeerResponse => Method::AnnouncePeer,
            Body::Error(e) => e.method,
        }
    }

    fn type_byte(&self) -> u8 {
        self.kind().bits() | self.method().bits()
    }

    /// Lookup target of a request body, if it has one.
    pub fn target(&self) -> Option<Id> {
        match &self.body {
            Body::FindNodeRequest(q) | Body::FindValueRequest(q) | Body::FindPeerRequest(q) => {
                Some(q.target)
            }
            Body::StoreValueRequest(q) => Some(q.value.id()),
            Body::AnnouncePeerRequest(q) => Some(q.peer_id),
            _ => None,
        }
    }

    pub fn want(&self) -> Want {
        match &self.body {
            Body::FindNodeRequest(q) | Body::FindValueRequest(q) | Body::FindPeerRequest(q) => {
                q.want
            }
            _ => Want::default(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut root: Vec<(Cbor, Cbor)> = vec![
            (text("y"), int(self.type_byte() as i128)),
            (text("t"), int(self.txid as i128)),
            (text("v"), int(self.version as i128)),
        ];
        match self.body_cbor() {
            Some(body) => root.push((text(self.kind().name()), body)),
            None => {}
        }

        let mut out = Vec::with_capacity(self.estimate_size().min(4096));
        ciborium::into_writer(&Cbor::Map(root), &mut out).expect("CBOR encoding cannot fail");
        out
    }

    fn body_cbor(&self) -> Option<Cbor> {
        let mut map: Vec<(Cbor, Cbor)> = Vec::new();
        match &self.body {
            Body::PingRequest
            | Body::PingResponse
            | Body::StoreValueResponse
            | Body::AnnouncePeerResponse => return None,
            Body::FindNodeRequest(q) | Body::FindValueRequest(q) | Body::FindPeerRequest(q) => {
                map.push((text("t"), bytes(q.target.as_bytes())));
                map.push((text("w"), int(q.want.bits() as i128)));
            }
            Body::FindNodeResponse(r) => {
                push_nodes(&mut map, r);
            }
            Body::FindValueResponse(r) => {
                push_nodes(&mut map, &r.nodes);
                if let Some(value) = &r.value {
                    push_value(&mut map, value);
                }
            }
            Body::FindPeerResponse(r) => {
                push_nodes(&mut map, &r.nodes);
                if !r.peers4.is_empty() {
                    map.push((text("p4"), peers_cbor(&r.peers4)));
                }
                if !r.peers6.is_empty() {
                    map.push((text("p6"), peers_cbor(&r.peers6)));
                }
            }
            Body::StoreValueRequest(q) => {
                map.push((text("tok"), int(q.token as i128)));
                if let Some(cas) = q.expected_seq {
                    map.push((text("cas"), int(cas as i128)));
                }
                push_value(&mut map, &q.value);
            }
            Body::AnnouncePeerRequest(q) => {
                map.push((text("t"), bytes(q.peer_id.as_bytes())));
                map.push((text("tok"), int(q.token as i128)));
                if let Some(origin) = &q.origin {
                    map.push((text("o"), bytes(origin.as_bytes())));
                }
                map.push((text("p"), int(q.port as i128)));
                if let Some(url) = &q.alternative_url {
                    map.push((text("alt"), Cbor::Text(url.clone())));
                }
                map.push((text("sig"), Cbor::Bytes(q.signature.clone())));
            }
            Body::Error(e) => {
                map.push((text("c"), int(e.code as i128)));
                map.push((text("m"), Cbor::Text(e.message.clone())));
            }
        }
        Some(Cbor::Map(map))
    }

    pub fn parse(buf: &[u8]) -> Result<Message> {
        let root: Cbor = ciborium::from_reader(buf)
            .map_err(|e| Error::protocol(format!("invalid CBOR: {e}")))?;
        let root = as_map(&root)?;

        let mut type_byte: Option<u8> = None;
        let mut txid: u32 = 0;
        let mut version: i64 = 0;
        let mut body_field: Option<(&str, &Cbor)> = None;

        for (key, value) in root {
            match key_str(key) {
                Some("y") => {
                    type_byte = Some(as_int(value)? as u8);
                }
                Some("t") => {
                    let raw = as_int(value)?;
                    if !(0..=i32::MAX as i128).contains(&raw) {
                        return Err(Error::protocol("transaction id out of range"));
                    }
                    txid = raw as u32;
                }
                Some("v") => {
                    version = as_int(value)? as i64;
                }
                Some(k @ ("q" | "r" | "e")) => {
                    body_field = Some((k, value));
                }
                _ => {}
            }
        }

        let type_byte = type_byte.ok_or_else(|| Error::protocol("missing type field"))?;
        let kind = MsgKind::from_bits(type_byte)?;
        let method = Method::from_bits(type_byte)?;

        // The body key must match the kind when present.
        if let Some((key, _)) = body_field {
            if key != kind.name() {
                return Err(Error::protocol(format!(
                    "body key '{key}' does not match message kind '{}'",
                    kind.name()
                )));
            }
        }
        let body_map = body_field.map(|(_, v)| v);

        let body = parse_body(kind, method, body_map)?;
        Ok(Message {
            id: Id::MIN,
            txid,
            version,
            origin: None,
            remote: None,
            body,
        })
    }

    /// Upper bound on the serialized size of this message.
    pub fn estimate_size(&self) -> usize {
        BASE_SIZE
            + match &self.body {
                Body::PingRequest
                | Body::PingResponse
                | Body::StoreValueResponse
                | Body::AnnouncePeerResponse => 0,
                Body::FindNodeRequest(_) | Body::FindValueRequest(_) | Body::FindPeerRequest(_) => {
                    48
                }
                Body::FindNodeResponse(r) => est_nodes(r),
                Body::FindValueResponse(r) => {
                    est_nodes(&r.nodes)
                        + r.value.as_ref().map_or(0, |v| est_value(v.data().len()))
                }
                Body::FindPeerResponse(r) => {
                    est_nodes(&r.nodes) + est_peers(&r.peers4) + est_peers(&r.peers6)
                }
                Body::StoreValueRequest(q) => 24 + est_value(q.value.data().len()),
                Body::AnnouncePeerRequest(q) => {
                    176 + q.alternative_url.as_ref().map_or(0, |u| u.len())
                }
                Body::Error(e) => 24 + e.message.len(),
            }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{},t:{}",
            self.method().name(),
            self.kind().name(),
            self.txid
        )?;
        if self.version != 0 {
            write!(f, ",v:{}", format_version(self.version))?;
        }
        Ok(())
    }
}

fn est_nodes(r: &LookupResponse) -> usize {
    24 + NODE4_SIZE * r.nodes4.len() + NODE6_SIZE * r.nodes6.len()
}

fn est_value(data_len: usize) -> usize {
    192 + data_len
}

fn est_peers(peers: &[PeerInfo]) -> usize {
    if peers.is_empty() {
        return 0;
    }
    8 + peers
        .iter()
        .map(|p| 180 + p.alternative_url().map_or(0, str::len))
        .sum::<usize>()
}

// ---------------------------------------------------------------------------
// CBOR assembly helpers
// ---------------------------------------------------------------------------

fn text(s: &str) -> Cbor {
    Cbor::Text(s.to_owned())
}

fn int(v: i128) -> Cbor {
    Cbor::Integer(Integer::try_from(v).expect("value fits CBOR integer"))
}

fn bytes(b: &[u8]) -> Cbor {
    Cbor::Bytes(b.to_vec())
}

fn push_nodes(map: &mut Vec<(Cbor, Cbor)>, r: &LookupResponse) {
    if !r.nodes4.is_empty() {
        map.push((text("n4"), nodes_cbor(&r.nodes4)));
    }
    if !r.nodes6.is_empty() {
        map.push((text("n6"), nodes_cbor(&r.nodes6)));
    }
    if r.token != 0 {
        map.push((text("tok"), int(r.token as i128)));
    }
}

fn nodes_cbor(nodes: &[NodeInfo]) -> Cbor {
    Cbor::Array(
        nodes
            .iter()
            .map(|n| {
                let ip = match n.addr.ip() {
                    IpAddr::V4(v4) => v4.octets().to_vec(),
                    IpAddr::V6(v6) => v6.octets().to_vec(),
                };
                Cbor::Array(vec![
                    bytes(n.id.as_bytes()),
                    Cbor::Bytes(ip),
                    int(n.addr.port() as i128),
                ])
            })
            .collect(),
    )
}

fn peers_cbor(peers: &[PeerInfo]) -> Cbor {
    Cbor::Array(
        peers
            .iter()
            .map(|p| {
                Cbor::Array(vec![
                    bytes(p.peer_id().as_bytes()),
                    bytes(p.node_id().as_bytes()),
                    if p.is_delegated() {
                        bytes(p.origin().as_bytes())
                    } else {
                        Cbor::Null
                    },
                    int(p.port() as i128),
                    match p.alternative_url() {
                        Some(url) => Cbor::Text(url.to_owned()),
                        None => Cbor::Null,
                    },
                    Cbor::Bytes(p.signature().to_vec()),
                ])
            })
            .collect(),
    )
}

fn push_value(map: &mut Vec<(Cbor, Cbor)>, value: &Value) {
    if let Some(pk) = value.public_key() {
        map.push((text("k"), bytes(pk.as_bytes())));
    }
    if let Some(rec) = value.recipient() {
        map.push((text("rec"), bytes(rec.as_bytes())));
    }
    if let Some(nonce) = value.nonce() {
        map.push((text("n"), bytes(nonce)));
    }
    if let Some(sig) = value.signature() {
        map.push((text("sig"), Cbor::Bytes(sig.to_vec())));
    }
    if value.sequence_number() >= 0 {
        map.push((text("seq"), int(value.sequence_number() as i128)));
    }
    map.push((text("v"), Cbor::Bytes(value.data().to_vec())));
}

// ---------------------------------------------------------------------------
// CBOR parsing helpers
// ---------------------------------------------------------------------------

fn as_map(v: &Cbor) -> Result<&Vec<(Cbor, Cbor)>> {
    match v {
        Cbor::Map(map) => Ok(map),
        _ => Err(Error::protocol("expected CBOR map")),
    }
}

fn key_str(v: &Cbor) -> Option<&str> {
    match v {
        Cbor::Text(s) => Some(s.as_str()),
        _ => None,
    }
}

fn as_int(v: &Cbor) -> Result<i128> {
    match v {
        Cbor::Integer(i) => Ok(i128::from(*i)),
        _ => Err(Error::protocol("expected integer")),
    }
}

fn as_bytes(v: &Cbor) -> Result<&[u8]> {
    match v {
        Cbor::Bytes(b) => Ok(b),
        _ => Err(Error::protocol("expected byte string")),
    }
}

fn as_text(v: &Cbor) -> Result<&str> {
    match v {
        Cbor::Text(s) => Ok(s),
        _ => Err(Error::protocol("expected text string")),
    }
}

fn as_array(v: &Cbor) -> Result<&Vec<Cbor>> {
    match v {
        Cbor::Array(a) => Ok(a),
        _ => Err(Error::protocol("expected array")),
    }
}

fn as_id(v: &Cbor) -> Result<Id> {
    Id::try_from_slice(as_bytes(v)?).ok_or_else(|| Error::protocol("id must be 32 bytes"))
}

fn parse_body(kind: MsgKind, method: Method, body: Option<&Cbor>) -> Result<Body> {
    match kind {
        MsgKind::Error => {
            let mut code = 0i32;
            let mut message = String::new();
            if let Some(body) = body {
                for (key, value) in as_map(body)? {
                    match key_str(key) {
                        Some("c") => code = as_int(value)? as i32,
                        Some("m") => message = as_text(value)?.to_owned(),
                        _ => {}
                    }
                }
            }
            Ok(Body::Error(ErrorBody {
                method,
                code,
                message,
            }))
        }
        MsgKind::Request => parse_request(method, body),
        MsgKind::Response => parse_response(method, body),
    }
}

fn parse_request(method: Method, body: Option<&Cbor>) -> Result<Body> {
    match method {
        Method::Ping => Ok(Body::PingRequest),
        Method::FindNode | Method::FindValue | Method::FindPeer => {
            let body = body.ok_or_else(|| Error::protocol("lookup request without body"))?;
            let mut target = None;
            let mut want = Want::default();
            for (key, value) in as_map(body)? {
                match key_str(key) {
                    Some("t") => target = Some(as_id(value)?),
                    Some("w") => want = Want::from_bits(as_int(value)? as u8),
                    _ => {}
                }
            }
            let q = LookupRequest {
                target: target.ok_or_else(|| Error::protocol("lookup request without target"))?,
                want,
            };
            Ok(match method {
                Method::FindNode => Body::FindNodeRequest(q),
                Method::FindValue => Body::FindValueRequest(q),
                _ => Body::FindPeerRequest(q),
            })
        }
        Method::StoreValue => {
            let body = body.ok_or_else(|| Error::protocol("store request without body"))?;
            let mut token = 0u32;
            let mut expected_seq = None;
            let mut value_fields = ValueFields::default();
            for (key, value) in as_map(body)? {
                match key_str(key) {
                    Some("tok") => token = as_int(value)? as u32,
                    Some("cas") => expected_seq = Some(as_int(value)? as i32),
                    _ => value_fields.absorb(key, value)?,
                }
            }
            Ok(Body::StoreValueRequest(StoreValueRequest {
                token,
                value: value_fields
                    .into_value()?
                    .ok_or_else(|| Error::protocol("store request without value"))?,
                expected_seq,
            }))
        }
        Method::AnnouncePeer => {
            let body = body.ok_or_else(|| Error::protocol("announce request without body"))?;
            let mut token = 0u32;
            let mut peer_id = None;
            let mut origin = None;
            let mut port = 0u16;
            let mut alternative_url = None;
            let mut signature = None;
            for (key, value) in as_map(body)? {
                match key_str(key) {
                    Some("t") => peer_id = Some(as_id(value)?),
                    Some("tok") => token = as_int(value)? as u32,
                    Some("o") => origin = Some(as_id(value)?),
                    Some("p") => port = as_int(value)? as u16,
                    Some("alt") => alternative_url = Some(as_text(value)?.to_owned()),
                    Some("sig") => signature = Some(as_bytes(value)?.to_vec()),
                    _ => {}
                }
            }
            Ok(Body::AnnouncePeerRequest(AnnouncePeerRequest {
                token,
                peer_id: peer_id.ok_or_else(|| Error::protocol("announce without peer id"))?,
                origin,
                port,
                alternative_url,
                signature: signature.ok_or_else(|| Error::protocol("announce without signature"))?,
            }))
        }
        Method::Unknown => Err(Error::protocol("request with unknown method")),
    }
}

fn parse_response(method: Method, body: Option<&Cbor>) -> Result<Body> {
    match method {
        Method::Ping => Ok(Body::PingResponse),
        Method::StoreValue => Ok(Body::StoreValueResponse),
        Method::AnnouncePeer => Ok(Body::AnnouncePeerResponse),
        Method::FindNode | Method::FindValue | Method::FindPeer => {
            let mut nodes = LookupResponse::default();
            let mut value_fields = ValueFields::default();
            let mut peers4 = Vec::new();
            let mut peers6 = Vec::new();
            if let Some(body) = body {
                for (key, value) in as_map(body)? {
                    match key_str(key) {
                        Some("n4") => nodes.nodes4 = parse_nodes(value)?,
                        Some("n6") => nodes.nodes6 = parse_nodes(value)?,
                        Some("tok") => nodes.token = as_int(value)? as u32,
                        Some("p4") => peers4 = parse_peers(value)?,
                        Some("p6") => peers6 = parse_peers(value)?,
                        _ => value_fields.absorb(key, value)?,
                    }
                }
            }
            Ok(match method {
                Method::FindNode => Body::FindNodeResponse(nodes),
                Method::FindValue => Body::FindValueResponse(FindValueResponse {
                    nodes,
                    value: value_fields.into_value()?,
                }),
                _ => Body::FindPeerResponse(FindPeerResponse {
                    nodes,
                    peers4,
                    peers6,
                }),
            })
        }
        Method::Unknown => Err(Error::protocol("response with unknown method")),
    }
}

fn parse_nodes(v: &Cbor) -> Result<Vec<NodeInfo>> {
    let mut nodes = Vec::new();
    for entry in as_array(v)? {
        let fields = as_array(entry)?;
        if fields.len() != 3 {
            return Err(Error::protocol("node entry must have 3 fields"));
        }
        let id = as_id(&fields[0])?;
        let ip_bytes = as_bytes(&fields[1])?;
        let port = as_int(&fields[2])? as u16;
        let ip = match ip_bytes.len() {
            4 => {
                let octets: [u8; 4] = ip_bytes.try_into().expect("length checked");
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = ip_bytes.try_into().expect("length checked");
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(Error::protocol("node address must be 4 or 16 bytes")),
        };
        nodes.push(NodeInfo::new(id, SocketAddr::new(ip, port)));
    }
    Ok(nodes)
}

fn parse_peers(v: &Cbor) -> Result<Vec<PeerInfo>> {
    let mut peers = Vec::new();
    for entry in as_array(v)? {
        let fields = as_array(entry)?;
        if fields.len() != 6 {
            return Err(Error::protocol("peer entry must have 6 fields"));
        }
        let peer_id = as_id(&fields[0])?;
        let node_id = as_id(&fields[1])?;
        let origin = match &fields[2] {
            Cbor::Null => None,
            other => Some(as_id(other)?),
        };
        let port = as_int(&fields[3])? as u16;
        let url = match &fields[4] {
            Cbor::Null => None,
            other => Some(as_text(other)?.to_owned()),
        };
        let signature = as_bytes(&fields[5])?.to_vec();
        peers.push(PeerInfo::from_parts(
            peer_id, node_id, origin, port, url, signature,
        ));
    }
    Ok(peers)
}

/// Accumulates the flat value fields of store requests and value responses.
#[derive(Default)]
struct ValueFields {
    public_key: Option<Id>,
    recipient: Option<Id>,
    nonce: Option<[u8; 24]>,
    signature: Option<Vec<u8>>,
    seq: Option<i32>,
    data: Option<Vec<u8>>,
}

impl ValueFields {
    fn absorb(&mut self, key: &Cbor, value: &Cbor) -> Result<()> {
        match key_str(key) {
            Some("k") => self.public_key = Some(as_id(value)?),
            Some("rec") => self.recipient = Some(as_id(value)?),
            Some("n") => {
                let raw = as_bytes(value)?;
                let nonce: [u8; 24] = raw
                    .try_into()
                    .map_err(|_| Error::protocol("value nonce must be 24 bytes"))?;
                self.nonce = Some(nonce);
            }
            Some("sig") => self.signature = Some(as_bytes(value)?.to_vec()),
            Some("seq") => self.seq = Some(as_int(value)? as i32),
            Some("v") => self.data = Some(as_bytes(value)?.to_vec()),
            _ => {}
        }
        Ok(())
    }

    fn into_value(self) -> Result<Option<Value>> {
        let Some(data) = self.data else {
            return Ok(None);
        };
        let seq = self.seq.unwrap_or(SEQ_IMMUTABLE);
        Ok(Some(Value::from_parts(
            self.public_key,
            self.recipient,
            self.nonce,
            self.signature,
            seq,
            data,
        )))
    }
}

// ---------------------------------------------------------------------------
// Software version tags
// ---------------------------------------------------------------------------

/// Short name announced in the `v` field, 4 ASCII bytes.
pub const NODE_SHORT_NAME: &str = "wrrn";

/// Protocol-visible software version.
pub const NODE_VERSION: u32 = 4;

/// Pack a 4-byte name and numeric version into a version tag.
pub fn build_version(name: &str, version: u32) -> i64 {
    let mut name_bytes = [0u8; 4];
    for (i, b) in name.bytes().take(4).enumerate() {
        name_bytes[i] = b;
    }
    ((u32::from_be_bytes(name_bytes) as i64) << 32) | version as i64
}

/// Render a version tag as `"NAME/version"`, or `"N/A"` when unset.
pub fn format_version(version: i64) -> String {
    if version == 0 {
        return "N/A".to_owned();
    }
    let name_bytes = ((version >> 32) as u32).to_be_bytes();
    let name: String = name_bytes
        .iter()
        .filter(|b| b.is_ascii_graphic())
        .map(|&b| b as char)
        .collect();
    let number = version & 0xFFFF_FFFF;
    if name.is_empty() {
        format!("N/A/{number}")
    } else {
        format!("{name}/{number}")
    }
}
