//! End-to-end tests over loopback UDP: bootstrap convergence, value
//! storage in all three modes, and the peer rendezvous flow.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use warren::{
    ConnectionStatus, Id, Keypair, LookupOption, Network, Node, PeerInfo, Value,
};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(39100);

fn next_addr() -> std::net::SocketAddr {
    let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Start `count` nodes, all bootstrapping off the first, then re-run
/// bootstrap rounds until every table holds every other member.
async fn spawn_network(count: usize) -> Vec<Node> {
    let seed = Node::builder()
        .addr4(next_addr())
        .build()
        .await
        .expect("seed node");
    let seed_info = seed.node_info(Network::V4).expect("seed info");

    let mut nodes = vec![seed];
    for _ in 1..count {
        let node = Node::builder()
            .addr4(next_addr())
            .bootstrap(vec![seed_info.clone()])
            .build()
            .await
            .expect("node");
        nodes.push(node);
    }

    // The seed bootstraps off one of its children.
    let second_info = nodes[1].node_info(Network::V4).expect("info");
    nodes[0].bootstrap(vec![second_info]).await.expect("seed bootstrap");

    let expected = count - 1;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let mut converged = true;
        for node in &nodes {
            let known = node.known_nodes(Network::V4).await.expect("known_nodes");
            if known.len() < expected {
                converged = false;
                // Another round fills whatever the races left out.
                node.bootstrap(vec![seed_info.clone()]).await.expect("bootstrap");
            }
        }
        if converged {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "routing tables did not converge"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    nodes
}

async fn shutdown(nodes: Vec<Node>) {
    for node in nodes {
        let _ = node.stop().await;
    }
}

#[tokio::test]
async fn bootstrap_reaches_profound() {
    let nodes = spawn_network(6).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    for node in &nodes {
        loop {
            let status = node.connection_status(Network::V4).await.unwrap();
            if status == ConnectionStatus::Profound {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "node stuck in {status} instead of Profound"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // Every node knows every other node.
    for node in &nodes {
        let known = node.known_nodes(Network::V4).await.unwrap();
        assert!(known.len() >= nodes.len() - 1);
    }
    shutdown(nodes).await;
}

#[tokio::test]
async fn find_node_locates_every_member() {
    let nodes = spawn_network(5).await;

    let querier = &nodes[0];
    for target in &nodes[1..] {
        let found = querier.find_node(target.id()).await.expect("find_node");
        let info = found.v4.expect("target should be found on v4");
        assert_eq!(info.id, target.id());
        assert_eq!(Some(info.addr), target.local_addr(Network::V4));
    }
    shutdown(nodes).await;
}

#[tokio::test]
async fn store_and_find_immutable_value() {
    let nodes = spawn_network(5).await;

    let value = Value::of_immutable(b"Hello".to_vec());
    let acked = nodes[0].store_value(value.clone()).await.expect("store");
    assert!(!acked.is_empty(), "no node acknowledged the store");

    for node in &nodes[1..] {
        let found = node
            .find_value(value.id(), LookupOption::Conservative)
            .await
            .expect("find_value");
        assert_eq!(found, Some(value.clone()));
    }
    shutdown(nodes).await;
}

#[tokio::test]
async fn signed_mutable_update_and_replay_rejection() {
    let nodes = spawn_network(5).await;
    let owner = Keypair::random();
    let nonce = [7u8; 24];

    let v1 = Value::of_signed(&owner, nonce, 0, b"v1".to_vec()).unwrap();
    let acked = nodes[0].store_value(v1.clone()).await.expect("store v1");
    assert!(!acked.is_empty());

    let read = nodes[2]
        .find_value(v1.id(), LookupOption::Conservative)
        .await
        .expect("read v1");
    assert_eq!(read, Some(v1.clone()));

    // Update with a bumped sequence number propagates everywhere.
    let v2 = Value::of_signed(&owner, nonce, 1, b"v2".to_vec()).unwrap();
    let acked = nodes[0].store_value(v2.clone()).await.expect("store v2");
    assert!(!acked.is_empty());

    for node in &nodes[1..] {
        let found = node
            .find_value(v2.id(), LookupOption::Conservative)
            .await
            .expect("read v2");
        assert_eq!(found, Some(v2.clone()));
    }

    // Replaying the stale version is refused by every replica.
    let acked = nodes[1].store_value(v1.clone()).await.expect("replay");
    assert!(acked.is_empty(), "replay of an old seq must not be acked");

    let still = nodes[3]
        .find_value(v2.id(), LookupOption::Conservative)
        .await
        .expect("read after replay");
    assert_eq!(still, Some(v2.clone()));
    shutdown(nodes).await;
}

#[tokio::test]
async fn encrypted_value_readable_only_by_recipient() {
    let nodes = spawn_network(4).await;
    let owner = Keypair::random();
    let recipient = Keypair::random();

    let value = Value::of_encrypted(&owner, recipient.id(), [9u8; 24], 0, b"for Bob only")
        .expect("encrypt");
    nodes[0].store_value(value.clone()).await.expect("store");

    let fetched = nodes[2]
        .find_value(value.id(), LookupOption::Conservative)
        .await
        .expect("fetch")
        .expect("value present");

    assert_eq!(fetched.decrypt_data(&recipient).unwrap(), b"for Bob only");
    let stranger = Keypair::random();
    assert!(fetched.decrypt_data(&stranger).is_err());
    shutdown(nodes).await;
}

#[tokio::test]
async fn announce_and_find_peer() {
    let nodes = spawn_network(5).await;
    let peer_kp = Keypair::random();

    let peer = PeerInfo::of(&peer_kp, nodes[0].id(), 8888, None);
    let acked = nodes[0].announce_peer(peer.clone()).await.expect("announce");
    assert!(!acked.is_empty());

    for node in &nodes[1..] {
        let found = node.find_peer(peer_kp.id(), 0).await.expect("find_peer");
        assert_eq!(found, vec![peer.clone()]);
    }
    shutdown(nodes).await;
}

#[tokio::test]
async fn lookup_for_absent_value_returns_none() {
    let nodes = spawn_network(4).await;
    let found = nodes[1]
        .find_value(Id::random(), LookupOption::Conservative)
        .await
        .expect("lookup");
    assert!(found.is_none());
    shutdown(nodes).await;
}

#[tokio::test]
async fn persistence_files_written_on_stop() {
    let dir = std::env::temp_dir().join(format!("warren-e2e-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    let node = Node::builder()
        .addr4(next_addr())
        .storage_dir(&dir)
        .build()
        .await
        .expect("node");
    node.store_value(Value::of_immutable(b"kept".to_vec()))
        .await
        .expect("store");
    node.stop().await.expect("stop");

    assert!(dir.join("store.cbor").exists());
    assert!(dir.join("routing4.cbor").exists());
    let _ = std::fs::remove_dir_all(&dir);
}
