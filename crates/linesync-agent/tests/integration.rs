use linesync_agent::{
    BusEndpoint, Inbound, KeyValueStore, LocalBus, MemoryStore, MqttTransport, PersistenceStore,
    Position, Replica, ReplicaError, SqliteStore, SyncError, Transport,
};
use linesync_proto::{SyncMessage, TopicScheme};
use rumqttc::{Event, EventLoop, Packet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

struct Peer {
    replica: Replica,
    endpoint: BusEndpoint,
}

impl Peer {
    fn open(bus: &LocalBus, store: Box<dyn KeyValueStore + Send>, catch_up: bool) -> Self {
        let endpoint = bus.endpoint();
        let replica = Replica::open(
            Uuid::new_v4(),
            PersistenceStore::new(store, "store"),
            Box::new(endpoint.sender()),
            catch_up,
        );
        Self { replica, endpoint }
    }

    fn in_memory(bus: &LocalBus) -> Self {
        Self::open(bus, Box::new(MemoryStore::new()), false)
    }

    /// Handle every queued frame; returns how many there were.
    fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Some(frame) = self.endpoint.try_recv() {
            let _ = self.replica.receive(&frame);
            handled += 1;
        }
        handled
    }
}

/// Deliver frames until no peer has anything left to handle.
fn settle(peers: &mut [&mut Peer]) {
    loop {
        let handled: usize = peers.iter_mut().map(|peer| peer.drain()).sum();
        if handled == 0 {
            break;
        }
    }
}

#[test]
fn concurrent_edits_converge() {
    let bus = LocalBus::new("converge", 64);
    let mut a = Peer::in_memory(&bus);
    let mut b = Peer::in_memory(&bus);

    a.replica.apply_edited_buffer("a\nb").unwrap();
    b.replica.apply_edited_buffer("c").unwrap();
    settle(&mut [&mut a, &mut b]);

    assert_eq!(a.replica.buffer_text(), b.replica.buffer_text());
    assert_eq!(
        a.replica.version_vector_display(),
        b.replica.version_vector_display()
    );
    let text = a.replica.buffer_text();
    assert_eq!(text.lines().count(), 3);
    for line in ["a", "b", "c"] {
        assert!(text.lines().any(|l| l == line), "missing {line} in {text:?}");
    }

    // One local commit plus one received change each.
    assert_eq!(a.replica.history().len(), 2);
    assert_eq!(b.replica.history().len(), 2);
}

#[test]
fn full_exchange_converges_in_either_order() {
    let bus = LocalBus::new("order", 64);
    let mut a = Peer::in_memory(&bus);
    let mut b = Peer::in_memory(&bus);
    a.replica.apply_edited_buffer("left").unwrap();
    b.replica.apply_edited_buffer("right\nside").unwrap();
    // Discard the live broadcasts and exchange full logs instead.
    a.endpoint.try_recv();
    b.endpoint.try_recv();

    let a_full = SyncMessage::delta(
        a.replica.replica_id(),
        a.replica.document().export_all().unwrap(),
    )
    .to_cbor()
    .unwrap();
    let b_full = SyncMessage::delta(
        b.replica.replica_id(),
        b.replica.document().export_all().unwrap(),
    )
    .to_cbor()
    .unwrap();

    b.replica.receive(&a_full).unwrap();
    a.replica.receive(&b_full).unwrap();

    assert_eq!(a.replica.buffer_text(), b.replica.buffer_text());
}

#[test]
fn out_of_order_deltas_are_buffered() {
    let bus = LocalBus::new("reorder", 64);
    let mut a = Peer::in_memory(&bus);
    let mut b = Peer::in_memory(&bus);

    for text in ["x", "y", "y\nz"] {
        a.replica.apply_edited_buffer(text).unwrap();
    }
    let mut frames = Vec::new();
    while let Some(frame) = b.endpoint.try_recv() {
        frames.push(frame);
    }
    assert_eq!(frames.len(), 3);

    for frame in frames.iter().rev() {
        assert!(matches!(b.replica.receive(frame), Ok(Inbound::Imported(_))));
    }

    assert_eq!(b.replica.buffer_text(), "y\nz");
    assert_eq!(b.replica.document().pending_changes(), 0);
    // Only the delivery that unblocked the buffer produced a change.
    assert_eq!(b.replica.history().len(), 1);
}

#[test]
fn received_changes_are_not_echoed() {
    let bus = LocalBus::new("echo", 64);
    let mut a = Peer::in_memory(&bus);
    let mut b = Peer::in_memory(&bus);

    a.replica.apply_edited_buffer("hello").unwrap();
    assert_eq!(a.endpoint.try_recv(), None);
    assert_eq!(b.drain(), 1);

    assert_eq!(b.replica.buffer_text(), "hello");
    assert_eq!(a.drain(), 0);
}

#[test]
fn own_frames_are_dropped_as_echo() {
    let bus = LocalBus::new("self", 64);
    let mut a = Peer::in_memory(&bus);
    a.replica.apply_edited_buffer("mine").unwrap();

    let frame = SyncMessage::delta(
        a.replica.replica_id(),
        a.replica.document().export_all().unwrap(),
    )
    .to_cbor()
    .unwrap();
    assert!(matches!(a.replica.receive(&frame), Ok(Inbound::Echo)));
    assert_eq!(a.replica.history().len(), 1);
}

#[test]
fn malformed_message_is_dropped() {
    let bus = LocalBus::new("malformed", 64);
    let mut a = Peer::in_memory(&bus);
    let mut b = Peer::in_memory(&bus);
    a.replica.apply_edited_buffer("before").unwrap();
    settle(&mut [&mut a, &mut b]);

    bus.endpoint().sender().send(vec![0x13, 0x37]).unwrap();
    assert!(matches!(
        b.replica.receive(&b.endpoint.try_recv().unwrap()),
        Err(ReplicaError::Sync(SyncError::MalformedDelta(_)))
    ));

    a.replica.apply_edited_buffer("after").unwrap();
    settle(&mut [&mut a, &mut b]);
    assert_eq!(b.replica.buffer_text(), "after");
}

#[test]
fn scrubbing_includes_received_versions() {
    let bus = LocalBus::new("scrub", 64);
    let mut a = Peer::in_memory(&bus);
    let mut b = Peer::in_memory(&bus);

    a.replica.apply_edited_buffer("x").unwrap();
    settle(&mut [&mut a, &mut b]);
    b.replica.apply_edited_buffer("x\ny").unwrap();
    settle(&mut [&mut a, &mut b]);

    assert_eq!(a.replica.version_range(), (-1, 1));
    a.replica.select_version(0).unwrap();
    assert_eq!(a.replica.buffer_text(), "x");

    // Remote changes keep arriving while a past version is shown.
    b.replica.apply_edited_buffer("x\ny\nz").unwrap();
    settle(&mut [&mut a, &mut b]);
    assert_eq!(a.replica.position(), Position::Historical(0));
    assert_eq!(a.replica.buffer_text(), "x");
    assert_eq!(a.replica.version_range(), (-1, 2));

    a.replica.select_version(2).unwrap();
    assert_eq!(a.replica.buffer_text(), "x\ny\nz");
}

#[test]
fn late_joiner_catches_up() {
    let bus = LocalBus::new("late", 64);
    let mut a = Peer::in_memory(&bus);
    a.replica.apply_edited_buffer("written\nbefore\njoin").unwrap();

    let mut b = Peer::open(&bus, Box::new(MemoryStore::new()), true);
    settle(&mut [&mut a, &mut b]);

    assert_eq!(b.replica.buffer_text(), "written\nbefore\njoin");
}

#[test]
fn lost_delta_is_repaired_without_restart() {
    let bus = LocalBus::new("lost", 64);
    let mut a = Peer::in_memory(&bus);
    let mut b = Peer::in_memory(&bus);

    a.replica.apply_edited_buffer("first").unwrap();
    assert!(b.endpoint.try_recv().is_some());

    a.replica.apply_edited_buffer("first\nsecond").unwrap();
    settle(&mut [&mut a, &mut b]);

    assert_eq!(b.replica.document().pending_changes(), 0);
    assert_eq!(b.replica.buffer_text(), "first\nsecond");
    assert_eq!(
        a.replica.version_vector_display(),
        b.replica.version_vector_display()
    );
}

#[test]
fn restore_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let bus = LocalBus::new("restore", 64);

    {
        let mut peer = Peer::open(&bus, Box::new(SqliteStore::open(&path).unwrap()), false);
        peer.replica.apply_edited_buffer("alpha\nbeta").unwrap();
        peer.replica.apply_edited_buffer("alpha\nbeta\ngamma").unwrap();
        peer.replica.close();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert!(store.updated_at("store").unwrap().is_some());

    let mut peer = Peer::open(&bus, Box::new(store), false);
    assert_eq!(peer.replica.buffer_text(), "alpha\nbeta\ngamma");
    // Intermediate versions are not recoverable without persisted history.
    assert_eq!(peer.replica.version_range(), (-1, 0));
    assert!(peer.replica.apply_edited_buffer("alpha").unwrap());
}

#[test]
fn restore_with_persisted_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let bus = LocalBus::new("history", 64);
    let open = |path: &std::path::Path| {
        let endpoint = bus.endpoint();
        let persistence =
            PersistenceStore::new(Box::new(SqliteStore::open(path).unwrap()), "store")
                .with_history(true);
        Replica::open(
            Uuid::new_v4(),
            persistence,
            Box::new(endpoint.sender()),
            false,
        )
    };

    {
        let mut replica = open(&path);
        for text in ["one", "two", "three"] {
            replica.apply_edited_buffer(text).unwrap();
        }
        replica.close();
    }

    let mut replica = open(&path);
    assert_eq!(replica.version_range(), (-1, 2));
    assert_eq!(replica.position(), Position::Live);
    replica.select_version(0).unwrap();
    assert_eq!(replica.buffer_text(), "one");
    replica.select_version(2).unwrap();
    assert_eq!(replica.buffer_text(), "three");
}

#[test]
fn storage_failure_still_syncs() {
    let bus = LocalBus::new("quota", 64);
    let mut a = Peer::open(&bus, Box::new(MemoryStore::with_capacity(8)), false);
    let mut b = Peer::in_memory(&bus);

    a.replica
        .apply_edited_buffer("far more than eight bytes")
        .unwrap();
    settle(&mut [&mut a, &mut b]);

    assert_eq!(a.replica.history().len(), 1);
    assert_eq!(b.replica.buffer_text(), "far more than eight bytes");
}

#[test]
fn reset_replica_rejoins_under_new_id() {
    let bus = LocalBus::new("reset", 64);
    let mut a = Peer::in_memory(&bus);
    let mut b = Peer::in_memory(&bus);
    a.replica.apply_edited_buffer("shared").unwrap();
    settle(&mut [&mut a, &mut b]);

    a.replica.clear_and_reset().unwrap();
    assert_eq!(a.replica.buffer_text(), "");
    a.replica.request_catch_up().unwrap();
    settle(&mut [&mut a, &mut b]);

    assert_eq!(a.replica.buffer_text(), "shared");
}

async fn forward_publishes(mut eventloop: EventLoop, tx: mpsc::UnboundedSender<Vec<u8>>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if tx.send(publish.payload.to_vec()).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_replicas_converge() {
    if std::env::var("LINESYNC_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set LINESYNC_INTEGRATION=1 to run");
        return;
    }

    let broker = std::env::var("LINESYNC_MQTT_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let scheme = TopicScheme::new(format!("integration-{}", Uuid::new_v4()));

    let open = |name: &str| {
        let (transport, eventloop) =
            MqttTransport::connect(&broker, &format!("{name}-{}", Uuid::new_v4()), scheme.clone())
                .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_publishes(eventloop, tx));
        (transport, rx)
    };

    let (transport_a, _rx_a) = open("a");
    let (transport_b, mut rx_b) = open("b");
    transport_b.subscribe().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut a = Replica::open(
        Uuid::new_v4(),
        PersistenceStore::new(Box::new(MemoryStore::new()), "store"),
        Box::new(transport_a),
        false,
    );
    let mut b = Replica::open(
        Uuid::new_v4(),
        PersistenceStore::new(Box::new(MemoryStore::new()), "store"),
        Box::new(transport_b),
        false,
    );

    a.apply_edited_buffer("over\nthe\nwire").unwrap();

    let frame = timeout(Duration::from_secs(5), rx_b.recv())
        .await
        .expect("timed out waiting for delta")
        .expect("eventloop stopped");
    b.receive(&frame).unwrap();

    assert_eq!(b.buffer_text(), "over\nthe\nwire");
}
