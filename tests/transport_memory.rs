// tests/transport_memory.rs

//! Reference semantics of the in-memory transport.

use bytes::Bytes;
use tokio::time::{timeout, Duration};

use mqtt_gateway::{
    // ---
    Connector,
    GatewayConfig,
    MemoryBroker,
    QosLevel,
    Transport,
    TransportEvent,
};

fn config() -> GatewayConfig {
    // ---
    GatewayConfig::new("mqtt://localhost:1883", "mem-test")
}

async fn next_event(events: &mut mqtt_gateway::EventStream) -> TransportEvent {
    // ---
    timeout(Duration::from_millis(100), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed unexpectedly")
}

#[tokio::test]
async fn connect_emits_connected_and_subscribe_then_publish_delivers() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    let (transport, mut events) = broker.connect(&config()).await.expect("connect failed");

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Connected
    ));

    transport.subscribe("test.topic").await.expect("subscribe failed");

    // ---
    // Act
    // ---
    transport
        .publish("test.topic", Bytes::from_static(b"hello"), QosLevel::AtMostOnce)
        .await
        .expect("publish failed");

    // ---
    // Assert
    // ---
    match next_event(&mut events).await {
        TransportEvent::Message { topic, payload } => {
            assert_eq!(topic, "test.topic");
            assert_eq!(&payload[..], b"hello");
        }
        other => panic!("expected Message, got {other:?}"),
    }
}

#[tokio::test]
async fn publish_without_subscription_is_recorded_but_not_echoed() {
    // ---
    let broker = MemoryBroker::new();
    let (transport, mut events) = broker.connect(&config()).await.expect("connect failed");

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Connected
    ));

    transport
        .publish("nobody.listens", Bytes::from_static(b"x"), QosLevel::AtMostOnce)
        .await
        .expect("publish failed");

    assert_eq!(broker.published().len(), 1);
    assert!(
        timeout(Duration::from_millis(100), events.recv()).await.is_err(),
        "no echo expected without a subscription"
    );
}

#[tokio::test]
async fn unsubscribe_stops_the_echo() {
    // ---
    let broker = MemoryBroker::new();
    let (transport, mut events) = broker.connect(&config()).await.expect("connect failed");
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Connected
    ));

    transport.subscribe("t").await.unwrap();
    transport.unsubscribe("t").await.unwrap();

    transport
        .publish("t", Bytes::from_static(b"x"), QosLevel::AtMostOnce)
        .await
        .unwrap();

    assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());
    assert!(broker.subscribed_topics().is_empty());
}

#[tokio::test]
async fn close_ends_the_event_stream() {
    // ---
    let broker = MemoryBroker::new();
    let (transport, mut events) = broker.connect(&config()).await.expect("connect failed");
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Connected
    ));

    transport.close().await.expect("close failed");

    assert!(
        timeout(Duration::from_millis(100), events.recv())
            .await
            .expect("stream should end, not block")
            .is_none()
    );
}
