//! Multi-node scenarios over loopback sockets.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::unbounded;

use partisan::config::Config;
use partisan::core::ChannelOptions;
use partisan::{
    ChannelId, FilterDecision, FilterTag, ListenAddr, Node, RemoteRef, SendOptions,
};

fn poll_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    condition()
}

fn test_config(name: &str) -> Config {
    let mut config = Config::default();
    config.name = Some(name.to_string());
    config.listen_addrs = vec![ListenAddr::parse("127.0.0.1:0").unwrap()];
    // Tight timers so scenarios converge well inside their deadlines.
    config.limits.shuffle_interval_ms = 500;
    config.limits.keepalive_ms = 500;
    config.limits.reconnect_base_ms = 50;
    config.limits.reconnect_max_ms = 500;
    config.channels.insert(
        "vnode".to_string(),
        ChannelOptions {
            monotonic: true,
            parallelism: 4,
            compression: None,
        },
    );
    config
}

fn start_node(name: &str) -> Node {
    Node::start(test_config(name)).expect("node starts")
}

fn member_names(node: &Node) -> BTreeSet<String> {
    node.members()
        .into_iter()
        .map(|spec| spec.name.as_str().to_string())
        .collect()
}

fn sees_all(node: &Node, expected: &BTreeSet<String>) -> bool {
    let mut seen = member_names(node);
    seen.insert(node.name().as_str().to_string());
    &seen == expected
}

#[test]
fn four_node_convergence() {
    let s1 = start_node("s1@127.0.0.1");
    let c1 = start_node("c1@127.0.0.1");
    let c2 = start_node("c2@127.0.0.1");
    let c3 = start_node("c3@127.0.0.1");

    c1.join(s1.spec().clone()).expect("c1 joins");
    c2.join(s1.spec().clone()).expect("c2 joins");
    c3.join(s1.spec().clone()).expect("c3 joins");

    let expected: BTreeSet<String> = ["s1@127.0.0.1", "c1@127.0.0.1", "c2@127.0.0.1", "c3@127.0.0.1"]
        .into_iter()
        .map(String::from)
        .collect();

    let nodes = [&s1, &c1, &c2, &c3];
    assert!(
        poll_until(Duration::from_secs(30), || {
            nodes.iter().all(|node| sees_all(node, &expected))
        }),
        "views did not converge: s1={:?} c1={:?} c2={:?} c3={:?}",
        member_names(&s1),
        member_names(&c1),
        member_names(&c2),
        member_names(&c3),
    );

    for node in nodes {
        node.shutdown();
    }
}

#[test]
fn forward_reaches_registered_process() {
    let s1 = start_node("fwd_s1@127.0.0.1");
    let c1 = start_node("fwd_c1@127.0.0.1");
    let c3 = start_node("fwd_c3@127.0.0.1");

    c1.join(s1.spec().clone()).unwrap();
    c3.join(s1.spec().clone()).unwrap();

    let (tx, rx) = unbounded();
    c3.register_proc("store_proc", tx);

    // Wait until c1 can route to c3 directly.
    assert!(poll_until(Duration::from_secs(30), || {
        member_names(&c1).contains("fwd_c3@127.0.0.1")
    }));

    c1.forward(
        c3.name(),
        "store_proc",
        Bytes::from_static(b"store:0.42"),
        SendOptions::default(),
    )
    .expect("forward succeeds");

    let payload = rx.recv_timeout(Duration::from_secs(2)).expect("delivery");
    assert_eq!(&payload[..], b"store:0.42");

    for node in [s1, c1, c3] {
        node.shutdown();
    }
}

#[test]
fn monotonic_channel_preserves_send_order() {
    let c1 = start_node("mono_c1@127.0.0.1");
    let c2 = start_node("mono_c2@127.0.0.1");

    c1.join(c2.spec().clone()).unwrap();
    assert!(poll_until(Duration::from_secs(20), || {
        member_names(&c1).contains("mono_c2@127.0.0.1")
    }));

    let vnode = ChannelId::parse("vnode").unwrap();
    let rx = c2.subscribe_data();

    const COUNT: u64 = 1000;
    for i in 0..COUNT {
        c1.send(
            &RemoteRef::Node(c2.name().clone()),
            Bytes::from(i.to_be_bytes().to_vec()),
            SendOptions {
                channel: Some(vnode.clone()),
                ..SendOptions::default()
            },
        )
        .expect("send");
    }

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(30);
    while received.len() < COUNT as usize && Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok((_, channel, payload)) if channel == vnode => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&payload[..8]);
                received.push(u64::from_be_bytes(buf));
            }
            Ok(_) => {}
            Err(_) => {}
        }
    }

    assert_eq!(received.len(), COUNT as usize, "all messages arrive");
    for (expected, got) in received.iter().enumerate() {
        assert_eq!(*got, expected as u64, "strictly ascending order");
    }

    c1.shutdown();
    c2.shutdown();
}

#[test]
fn killed_node_is_removed_and_on_down_fires_once() {
    let s1 = start_node("kill_s1@127.0.0.1");
    let c1 = start_node("kill_c1@127.0.0.1");
    let c2 = start_node("kill_c2@127.0.0.1");

    c1.join(s1.spec().clone()).unwrap();
    c2.join(s1.spec().clone()).unwrap();

    let expected: BTreeSet<String> = [
        "kill_s1@127.0.0.1",
        "kill_c1@127.0.0.1",
        "kill_c2@127.0.0.1",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    assert!(poll_until(Duration::from_secs(30), || {
        sees_all(&s1, &expected) && sees_all(&c1, &expected)
    }));

    let downs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&downs);
    s1.on_down(
        c2.name().clone(),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    c2.shutdown();

    assert!(
        poll_until(Duration::from_secs(60), || {
            !member_names(&s1).contains("kill_c2@127.0.0.1")
                && !member_names(&c1).contains("kill_c2@127.0.0.1")
        }),
        "dead peer still in views: s1={:?} c1={:?}",
        member_names(&s1),
        member_names(&c1),
    );

    // Give any duplicate transition a chance to fire, then check exactness.
    std::thread::sleep(Duration::from_millis(1_500));
    assert_eq!(downs.load(Ordering::SeqCst), 1, "on_down fired exactly once");

    s1.shutdown();
    c1.shutdown();
}

#[test]
fn interposition_drop_blocks_then_restore_delivers() {
    let c1 = start_node("drop_c1@127.0.0.1");
    let c2 = start_node("drop_c2@127.0.0.1");

    c1.join(c2.spec().clone()).unwrap();
    assert!(poll_until(Duration::from_secs(20), || {
        member_names(&c1).contains("drop_c2@127.0.0.1")
    }));

    let rx = c2.subscribe_data();

    c1.add_interposition_fun(
        c2.name().clone(),
        FilterTag::ForwardMessage,
        Arc::new(|_, _, _| FilterDecision::Drop),
    );

    c1.send(
        &RemoteRef::Node(c2.name().clone()),
        Bytes::from_static(b"swallowed"),
        SendOptions::default(),
    )
    .unwrap();
    assert!(
        rx.recv_timeout(Duration::from_secs(1)).is_err(),
        "dropped message must not arrive"
    );

    c1.remove_interposition_fun(c2.name());
    c1.send(
        &RemoteRef::Node(c2.name().clone()),
        Bytes::from_static(b"delivered"),
        SendOptions::default(),
    )
    .unwrap();
    let (_, _, payload) = rx.recv_timeout(Duration::from_secs(1)).expect("delivery");
    assert_eq!(&payload[..], b"delivered");

    c1.shutdown();
    c2.shutdown();
}

#[test]
fn partition_inject_and_resolve() {
    let s1 = start_node("part_s1@127.0.0.1");
    let c1 = start_node("part_c1@127.0.0.1");

    c1.join(s1.spec().clone()).unwrap();
    assert!(poll_until(Duration::from_secs(20), || {
        member_names(&s1).contains("part_c1@127.0.0.1")
    }));

    let (tx, rx) = unbounded();
    c1.register_proc("sink", tx);

    let reference = s1.inject_partition(vec![c1.name().clone()]);
    assert_eq!(s1.partitions().len(), 1);

    s1.forward(c1.name(), "sink", Bytes::from_static(b"lost"), SendOptions::default())
        .unwrap();
    assert!(
        rx.recv_timeout(Duration::from_secs(1)).is_err(),
        "partitioned traffic must not arrive"
    );

    assert!(s1.resolve_partition(reference));
    assert!(s1.partitions().is_empty());

    s1.forward(
        c1.name(),
        "sink",
        Bytes::from_static(b"healed"),
        SendOptions::default(),
    )
    .unwrap();
    let payload = rx.recv_timeout(Duration::from_secs(2)).expect("delivery");
    assert_eq!(&payload[..], b"healed");

    s1.shutdown();
    c1.shutdown();
}

#[test]
fn acked_send_resolves_on_ack() {
    let c1 = start_node("ack_c1@127.0.0.1");
    let c2 = start_node("ack_c2@127.0.0.1");

    c1.join(c2.spec().clone()).unwrap();
    assert!(poll_until(Duration::from_secs(20), || {
        member_names(&c1).contains("ack_c2@127.0.0.1")
    }));

    let rx = c2.subscribe_data();

    let receipt = c1
        .send(
            &RemoteRef::Node(c2.name().clone()),
            Bytes::from_static(b"important"),
            SendOptions {
                ack: true,
                ..SendOptions::default()
            },
        )
        .unwrap()
        .expect("acked send returns a receipt");

    receipt
        .wait(Duration::from_secs(10))
        .expect("ack arrives within the retry budget");
    let (_, _, payload) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(&payload[..], b"important");

    c1.shutdown();
    c2.shutdown();
}

#[test]
fn leave_removes_peer_from_remote_views() {
    let s1 = start_node("leave_s1@127.0.0.1");
    let c1 = start_node("leave_c1@127.0.0.1");
    let c2 = start_node("leave_c2@127.0.0.1");

    c1.join(s1.spec().clone()).unwrap();
    c2.join(s1.spec().clone()).unwrap();

    let expected: BTreeSet<String> = [
        "leave_s1@127.0.0.1",
        "leave_c1@127.0.0.1",
        "leave_c2@127.0.0.1",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    assert!(poll_until(Duration::from_secs(30), || {
        sees_all(&s1, &expected) && sees_all(&c1, &expected)
    }));

    s1.leave(c2.name());

    assert!(poll_until(Duration::from_secs(10), || {
        !member_names(&s1).contains("leave_c2@127.0.0.1")
    }));
    // The broadcast delta reaches c1 as well.
    assert!(poll_until(Duration::from_secs(10), || {
        !member_names(&c1).contains("leave_c2@127.0.0.1")
    }));

    s1.shutdown();
    c1.shutdown();
    c2.shutdown();
}

#[test]
fn cluster_state_is_persisted_and_deleted_on_self_leave() {
    let data_dir = tempfile::tempdir().unwrap();
    let mut config = test_config("persist_s1@127.0.0.1");
    config.data_dir = Some(data_dir.path().to_path_buf());
    let s1 = Node::start(config).unwrap();
    let c1 = start_node("persist_c1@127.0.0.1");

    let state_path = data_dir.path().join("peer_service").join("cluster_state");
    assert!(!state_path.exists(), "no snapshot before any membership");

    c1.join(s1.spec().clone()).unwrap();
    assert!(
        poll_until(Duration::from_secs(20), || state_path.exists()),
        "snapshot written after membership change"
    );

    let name = s1.name().clone();
    s1.leave(&name);
    assert!(
        poll_until(Duration::from_secs(10), || !state_path.exists()),
        "snapshot deleted on self leave"
    );

    c1.shutdown();
}
