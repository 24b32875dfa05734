use meshstore_storage::Store;
use meshstore_sync::{NodeConfig, SyncError, SyncNode};
use meshstore_types::Timestamp;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> NodeConfig {
    NodeConfig {
        poll_interval: Duration::from_millis(20),
        reconnect_interval: Duration::from_millis(50),
        ..NodeConfig::default()
    }
}

fn node() -> SyncNode {
    SyncNode::new(Arc::new(Store::open_in_memory().unwrap()), fast_config())
}

fn write(store: &Store, id: &str, key: &str, value: &str) {
    let mut obj = store.get(id, None).unwrap();
    obj.set_at(key, [value], Timestamp::now());
    store.update(&mut obj).unwrap();
}

fn value(store: &Store, id: &str, key: &str) -> Option<String> {
    store
        .get(id, None)
        .unwrap()
        .get(key)
        .ok()
        .and_then(|tv| tv.single().map(str::to_string))
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ── Sessions ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_establishes_named_sessions() {
    let a = node();
    let b = node();
    let addr = a.listen("127.0.0.1:0").await.unwrap();

    b.connect(&addr.to_string()).await.unwrap();
    eventually("sessions", || {
        a.connected_peers() == vec![b.name().to_string()]
            && b.connected_peers() == vec![a.name().to_string()]
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_push_delivers_updates() {
    let a = node();
    let b = node();
    let addr = a.listen("127.0.0.1:0").await.unwrap();
    b.connect(&addr.to_string()).await.unwrap();
    eventually("session", || b.connected_peers().len() == 1).await;

    assert_eq!(b.push_all().await, 0);
    write(b.store(), "doc", "title", "hello");
    assert_eq!(b.push_all().await, 2);
    eventually("replication", || {
        value(a.store(), "doc", "title").as_deref() == Some("hello")
    })
    .await;
    assert_eq!(b.push_all().await, 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let a = node();
    let err = a.connect(&addr.to_string()).await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn self_connection_never_registers() {
    let a = node();
    let addr = a.listen("127.0.0.1:0").await.unwrap();
    a.add_peer(addr.to_string());
    a.start();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.connected_peers().is_empty());
    a.shutdown().await;
}

// ── Replication ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn started_nodes_replicate_both_ways() {
    let a = node();
    let b = node();
    let addr_a = a.listen("127.0.0.1:0").await.unwrap();
    b.add_peer(addr_a.to_string());
    a.start();
    b.start();

    write(a.store(), "x", "title", "from-a");
    eventually("a to b", || {
        value(b.store(), "x", "title").as_deref() == Some("from-a")
    })
    .await;

    write(b.store(), "y", "title", "from-b");
    eventually("b to a", || {
        value(a.store(), "y", "title").as_deref() == Some("from-b")
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mutual_dialing_keeps_one_working_session() {
    let a = node();
    let b = node();
    let addr_a = a.listen("127.0.0.1:0").await.unwrap();
    let addr_b = b.listen("127.0.0.1:0").await.unwrap();
    a.add_peer(addr_b.to_string());
    b.add_peer(addr_a.to_string());
    a.start();
    b.start();

    eventually("sessions", || {
        a.connected_peers().len() == 1 && b.connected_peers().len() == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    write(a.store(), "k", "v", "1");
    eventually("replication", || value(b.store(), "k", "v").is_some()).await;
    write(b.store(), "k", "w", "2");
    eventually("replication back", || value(a.store(), "k", "w").is_some()).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_target_is_retried() {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let b = node();
    b.add_peer(addr.to_string());
    b.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(b.connected_peers().is_empty());

    let a = node();
    a.listen(addr).await.unwrap();
    eventually("reconnect", || b.connected_peers() == vec![a.name().to_string()]).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresponsive_target_does_not_hold_up_others() {
    let a = node();
    let addr = a.listen("127.0.0.1:0").await.unwrap();

    let b = node();
    // Non-routable: a connect attempt hangs until it times out. It also sorts
    // ahead of the loopback target.
    b.add_peer("10.255.255.1:7070");
    b.add_peer(addr.to_string());
    b.start();
    eventually("session with the reachable target", || {
        b.connected_peers() == vec![a.name().to_string()]
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_nodes_relay_through_the_middle() {
    let a = node();
    let b = node();
    let c = node();
    let addr_b = b.listen("127.0.0.1:0").await.unwrap();
    a.add_peer(addr_b.to_string());
    c.add_peer(addr_b.to_string());
    for n in [&a, &b, &c] {
        n.start();
    }

    write(a.store(), "doc", "from", "a");
    eventually("a to c via b", || {
        value(c.store(), "doc", "from").as_deref() == Some("a")
    })
    .await;

    for n in [&a, &b, &c] {
        n.shutdown().await;
    }
}
