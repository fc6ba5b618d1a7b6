//! # Warren - Kademlia-style encrypted overlay network
//!
//! Warren provides three services over UDP:
//!
//! - **Node lookup** by 256-bit identifier (Ed25519-derived)
//! - **Distributed value store** with immutable, signed-mutable, and
//!   encrypted-mutable records
//! - **Peer rendezvous**: signed announce/find of application peers under
//!   a resource id
//!
//! Every datagram between nodes is authenticated and encrypted with an
//! X25519-derived per-peer key; write-class requests are gated by
//! short-lived HMAC tokens.
//!
//! ## Architecture
//!
//! The crate uses the **actor pattern** for safe concurrent state: the
//! public [`Node`] handle is cheap to clone and crosses into the network
//! actor over a command channel; the actor owns the UDP sockets, both
//! per-family routing tables, the outstanding-call table, the lookup task
//! engine, and the scheduler. Nothing else mutates them.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API: the `Node` façade and network actor |
//! | `identity` | Ed25519 keypairs, 256-bit ids, the XOR metric |
//! | `crypto` | Per-datagram box encryption and envelope framing |
//! | `messages` | CBOR wire schema with size estimation |
//! | `routing` | Bucketed k-table with splitting and replacement caches |
//! | `rpc` | UDP server, call table, statistics, reachability |
//! | `dht` | Per-family engine: handlers, bootstrap, maintenance |
//! | `task` | Iterative α-parallel lookup state machines |
//! | `token` | Rotating HMAC write tokens |
//! | `value` | Value and peer-announcement records |
//! | `storage` | Data store trait and snapshot persistence |
//! | `scheduler` | Cooperative monotonic-time job queue |
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::builder()
//!     .addr4("0.0.0.0:39001".parse()?)
//!     .bootstrap(vec![known_peer])
//!     .build()
//!     .await?;
//!
//! let value = Value::of_immutable(b"hello".to_vec());
//! node.store_value(value.clone()).await?;
//! let found = node.find_value(value.id(), LookupOption::Conservative).await?;
//! ```

mod crypto;
mod dht;
mod error;
mod identity;
mod messages;
mod routing;
mod rpc;
mod scheduler;
mod storage;
mod task;
mod token;
mod value;

pub mod node;

pub use dht::ConnectionStatus;
pub use error::{Error, ErrorCode, Result};
pub use identity::{Id, Keypair, ID_BYTES};
pub use node::{
    ConnectionStatusListener, Node, NodeBuilder, NodeResult, NodeStatus, NodeStatusListener,
};
pub use routing::{Network, NodeInfo};
pub use rpc::StatsSnapshot;
pub use storage::{DataStore, MemStore};
pub use task::LookupOption;
pub use value::{PeerInfo, Value};
