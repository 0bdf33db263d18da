//! Two full engines driven against each other over the in-memory net.

use std::time::Duration;

use tokio::sync::broadcast;

use blecomm_core::{
    CommConfig, CommunicatorHandle, Event, FailureReason, Message, Peer, Role, RuntimeBuilder,
};
use blecomm_harness::{expect_event, TestNet};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn spawn_node(
    net: &TestNet,
    address: &str,
    unique_name: &str,
) -> (CommunicatorHandle, broadcast::Receiver<Event>) {
    let endpoint = net.endpoint(address);
    let config = CommConfig::new(&unique_name[..unique_name.len() - 2])
        .with_fragment_payload_size(32)
        .with_connection_complete_timeout(Duration::from_secs(2));
    let (handle, link_tx) = RuntimeBuilder::new(config)
        .with_unique_name(unique_name)
        .spawn(endpoint.clone(), endpoint);
    net.attach(address, link_tx);
    let events = handle.subscribe();
    (handle, events)
}

/// Discover, connect, accept, exchange traffic both ways, disconnect.
#[tokio::test]
async fn discover_connect_exchange_disconnect() {
    init_tracing();
    let net = TestNet::new();
    let (alice, mut alice_events) = spawn_node(&net, "AA", "aliceXY");
    let (bob, mut bob_events) = spawn_node(&net, "BB", "bobZW");

    bob.start_advertising().await.unwrap();
    alice.start_discovery().await.unwrap();

    let found = match expect_event(&mut alice_events, "peer found", |e| {
        matches!(e, Event::PeerFound(peer) if peer.unique_name() == "bobZW")
    })
    .await
    {
        Event::PeerFound(peer) => peer,
        _ => unreachable!(),
    };
    assert_eq!(found.name(), "bob");

    alice.connect(found).await.unwrap();
    let requested = match expect_event(&mut bob_events, "connection request", |e| {
        matches!(e, Event::ConnectionRequested(_))
    })
    .await
    {
        Event::ConnectionRequested(peer) => peer,
        _ => unreachable!(),
    };
    assert_eq!(requested.unique_name(), "aliceXY");
    bob.accept_connection(requested).await.unwrap();

    expect_event(&mut alice_events, "client success", |e| {
        matches!(e, Event::ConnectionSuccess(_, Role::Client))
    })
    .await;
    expect_event(&mut bob_events, "server success", |e| {
        matches!(e, Event::ConnectionSuccess(_, Role::Server))
    })
    .await;

    // A message long enough to fragment, initiator to acceptor.
    let text = "the quick brown fox jumps over the lazy dog, repeatedly and at length";
    alice.send_message(Message::text(b'm', text)).await.unwrap();
    let received = match expect_event(&mut bob_events, "message", |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await
    {
        Event::MessageReceived { message, .. } => message,
        _ => unreachable!(),
    };
    assert_eq!(received.payload_text(), text);
    assert_eq!(received.sender.as_ref().map(|p| p.unique_name()), Some("aliceXY"));

    // Bulk data the other way, over the poke-and-read path.
    let blob: Vec<u8> = (0..=255).collect();
    bob.send_data(Message::new(b'd', blob.clone())).await.unwrap();
    let received = match expect_event(&mut alice_events, "data", |e| {
        matches!(e, Event::DataReceived { .. })
    })
    .await
    {
        Event::DataReceived { message, .. } => message,
        _ => unreachable!(),
    };
    assert_eq!(received.payload, blob);

    // Deliberate disconnect reaches both sides.
    let peer = alice.connected_peers().await.unwrap().remove(0);
    alice.disconnect(peer).await.unwrap();
    let left = match expect_event(&mut alice_events, "disconnected", |e| {
        matches!(e, Event::Disconnected { .. })
    })
    .await
    {
        Event::Disconnected { peers_left, .. } => peers_left,
        _ => unreachable!(),
    };
    assert_eq!(left, 0);
    expect_event(&mut bob_events, "remote disconnected", |e| {
        matches!(e, Event::Disconnected { .. })
    })
    .await;
}

/// Link loss enters reconnection on both sides; traffic queued during the
/// outage flows once the link resumes.
#[tokio::test]
async fn link_loss_resume_and_queued_delivery() {
    init_tracing();
    let net = TestNet::new();
    let (alice, mut alice_events) = spawn_node(&net, "AA", "aliceXY");
    let (bob, mut bob_events) = spawn_node(&net, "BB", "bobZW");

    bob.start_advertising().await.unwrap();
    alice.start_discovery().await.unwrap();
    let found = match expect_event(&mut alice_events, "peer found", |e| {
        matches!(e, Event::PeerFound(_))
    })
    .await
    {
        Event::PeerFound(peer) => peer,
        _ => unreachable!(),
    };
    alice.connect(found).await.unwrap();
    let requested = match expect_event(&mut bob_events, "connection request", |e| {
        matches!(e, Event::ConnectionRequested(_))
    })
    .await
    {
        Event::ConnectionRequested(peer) => peer,
        _ => unreachable!(),
    };
    bob.accept_connection(requested).await.unwrap();
    expect_event(&mut alice_events, "client success", |e| {
        matches!(e, Event::ConnectionSuccess(_, Role::Client))
    })
    .await;

    net.drop_link("AA", "BB");
    expect_event(&mut alice_events, "loss on initiator", |e| {
        matches!(e, Event::ConnectionLost(_))
    })
    .await;
    expect_event(&mut bob_events, "loss on acceptor", |e| {
        matches!(e, Event::ConnectionLost(_))
    })
    .await;

    // Queued while (possibly still) disconnected; must survive the outage.
    alice
        .send_message(Message::text(b'm', "held through the outage"))
        .await
        .unwrap();

    expect_event(&mut alice_events, "resume on initiator", |e| {
        matches!(e, Event::ConnectionResumed(_))
    })
    .await;
    expect_event(&mut bob_events, "resume on acceptor", |e| {
        matches!(e, Event::ConnectionResumed(_))
    })
    .await;
    let received = match expect_event(&mut bob_events, "queued message", |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await
    {
        Event::MessageReceived { message, .. } => message,
        _ => unreachable!(),
    };
    assert_eq!(received.payload_text(), "held through the outage");
}

/// A rejected request fails cleanly on the initiator and leaves nothing
/// connected on either side.
#[tokio::test]
async fn rejected_connection_fails_cleanly() {
    init_tracing();
    let net = TestNet::new();
    let (alice, mut alice_events) = spawn_node(&net, "AA", "aliceXY");
    let (bob, mut bob_events) = spawn_node(&net, "BB", "bobZW");

    bob.start_advertising().await.unwrap();
    alice.start_discovery().await.unwrap();
    let found = match expect_event(&mut alice_events, "peer found", |e| {
        matches!(e, Event::PeerFound(_))
    })
    .await
    {
        Event::PeerFound(peer) => peer,
        _ => unreachable!(),
    };
    alice.connect(found).await.unwrap();
    let requested = match expect_event(&mut bob_events, "connection request", |e| {
        matches!(e, Event::ConnectionRequested(_))
    })
    .await
    {
        Event::ConnectionRequested(peer) => peer,
        _ => unreachable!(),
    };
    bob.reject_connection(requested).await.unwrap();

    let reason = match expect_event(&mut alice_events, "failure", |e| {
        matches!(e, Event::ConnectionFailed { .. })
    })
    .await
    {
        Event::ConnectionFailed { reason, .. } => reason,
        _ => unreachable!(),
    };
    assert_eq!(reason, FailureReason::Rejected);
    assert!(alice.connected_peers().await.unwrap().is_empty());
    assert!(bob.connected_peers().await.unwrap().is_empty());
}

/// Name changes propagate to connected peers and new advertisements.
#[tokio::test]
async fn name_update_propagates() {
    init_tracing();
    let net = TestNet::new();
    let (alice, mut alice_events) = spawn_node(&net, "AA", "aliceXY");
    let (bob, mut bob_events) = spawn_node(&net, "BB", "bobZW");

    bob.start_advertising().await.unwrap();
    alice.start_discovery().await.unwrap();
    let found = match expect_event(&mut alice_events, "peer found", |e| {
        matches!(e, Event::PeerFound(_))
    })
    .await
    {
        Event::PeerFound(peer) => peer,
        _ => unreachable!(),
    };
    alice.connect(found).await.unwrap();
    let requested = match expect_event(&mut bob_events, "connection request", |e| {
        matches!(e, Event::ConnectionRequested(_))
    })
    .await
    {
        Event::ConnectionRequested(peer) => peer,
        _ => unreachable!(),
    };
    bob.accept_connection(requested).await.unwrap();
    expect_event(&mut alice_events, "client success", |e| {
        matches!(e, Event::ConnectionSuccess(_, Role::Client))
    })
    .await;

    alice.set_name("carol").await.unwrap();
    assert_eq!(alice.unique_name().await.unwrap(), "carolXY");
    let updated = match expect_event(&mut bob_events, "peer updated", |e| {
        matches!(e, Event::PeerUpdated { .. })
    })
    .await
    {
        Event::PeerUpdated { current, .. } => current,
        _ => unreachable!(),
    };
    assert_eq!(updated.name(), "carol");
}
