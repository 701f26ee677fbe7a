// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! This file contains a broker double implementing the domain-level
//! `Connector` and `Transport` traits using in-process data structures only.
//!
//! The memory transport is the **reference implementation** of transport
//! semantics: subscribe is immediately effective once acknowledged, topic
//! matching is exact string equality, and delivery is deterministic within
//! a single process. It additionally carries test instrumentation (call
//! counters, injectable failures, held acknowledgements, event injection)
//! so gateway behavior can be exercised without a real broker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::{
    // ---
    Connector,
    Error,
    EventStream,
    GatewayConfig,
    QosLevel,
    Result,
    Transport,
    TransportEvent,
    TransportPtr,
};

/// One frame accepted for delivery by the memory broker.
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
}

struct Shared {
    // ---
    connect_calls: AtomicUsize,

    /// Broker-side subscription set for the current connection.
    topics: Mutex<HashSet<String>>,
    subscribe_calls: Mutex<HashMap<String, usize>>,
    unsubscribe_calls: Mutex<HashMap<String, usize>>,
    published: Mutex<Vec<PublishedFrame>>,

    /// Event sender of the most recent connection, used for injection.
    event_tx: Mutex<Option<mpsc::Sender<TransportEvent>>>,

    // Failure injection: `Some(reason)` fails the next matching call once.
    fail_connect: Mutex<Option<String>>,
    fail_subscribe: Mutex<Option<String>>,
    fail_unsubscribe: Mutex<Option<String>>,
    fail_publish: Mutex<Option<String>>,

    /// When true, `connect()` does not emit `Connected` on its own; the test
    /// drives the handshake via `complete_connect()`.
    defer_connack: Mutex<bool>,

    /// While true, subscribe acknowledgements are held in flight.
    hold_subscribe_acks: watch::Sender<bool>,
}

/// In-process broker double.
///
/// Cheap to clone; clones share the same broker state, so tests keep one
/// handle for instrumentation while the gateway owns another as its
/// connector.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    // ---

    pub fn new() -> Self {
        // ---
        let (hold_tx, _hold_rx) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                connect_calls: AtomicUsize::new(0),
                topics: Mutex::new(HashSet::new()),
                subscribe_calls: Mutex::new(HashMap::new()),
                unsubscribe_calls: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                event_tx: Mutex::new(None),
                fail_connect: Mutex::new(None),
                fail_subscribe: Mutex::new(None),
                fail_unsubscribe: Mutex::new(None),
                fail_publish: Mutex::new(None),
                defer_connack: Mutex::new(false),
                hold_subscribe_acks: hold_tx,
            }),
        }
    }

    // --- instrumentation: counters and captures

    /// Number of transport-level connect attempts accepted.
    pub fn connect_count(&self) -> usize {
        // ---
        self.shared.connect_calls.load(Ordering::SeqCst)
    }

    /// Protocol-level subscribes issued for `topic`.
    pub fn subscribe_calls(&self, topic: &str) -> usize {
        // ---
        *lock(&self.shared.subscribe_calls).get(topic).unwrap_or(&0)
    }

    /// Protocol-level unsubscribes issued for `topic`.
    pub fn unsubscribe_calls(&self, topic: &str) -> usize {
        // ---
        *lock(&self.shared.unsubscribe_calls).get(topic).unwrap_or(&0)
    }

    /// Frames accepted for delivery, in publish order.
    pub fn published(&self) -> Vec<PublishedFrame> {
        // ---
        lock(&self.shared.published).clone()
    }

    /// Topics with a broker-side subscription on the current connection.
    pub fn subscribed_topics(&self) -> Vec<String> {
        // ---
        lock(&self.shared.topics).iter().cloned().collect()
    }

    // --- instrumentation: failure and timing control

    /// Reject the next connect attempt with `reason`.
    pub fn fail_next_connect(&self, reason: &str) {
        // ---
        *lock(&self.shared.fail_connect) = Some(reason.to_owned());
    }

    /// Reject the next protocol subscribe with `reason`.
    pub fn fail_next_subscribe(&self, reason: &str) {
        // ---
        *lock(&self.shared.fail_subscribe) = Some(reason.to_owned());
    }

    /// Reject the next protocol unsubscribe with `reason`.
    pub fn fail_next_unsubscribe(&self, reason: &str) {
        // ---
        *lock(&self.shared.fail_unsubscribe) = Some(reason.to_owned());
    }

    /// Reject the next publish with `reason`.
    pub fn fail_next_publish(&self, reason: &str) {
        // ---
        *lock(&self.shared.fail_publish) = Some(reason.to_owned());
    }

    /// Make `connect()` wait for an explicit [`complete_connect`](Self::complete_connect).
    pub fn defer_connack(&self) {
        // ---
        *lock(&self.shared.defer_connack) = true;
    }

    /// Emit the deferred `Connected` event.
    pub async fn complete_connect(&self) {
        // ---
        self.emit(TransportEvent::Connected).await;
    }

    /// Hold subscribe acknowledgements in flight until released.
    pub fn hold_subscribe_acks(&self) {
        // ---
        self.shared.hold_subscribe_acks.send_replace(true);
    }

    /// Release held subscribe acknowledgements.
    pub fn release_subscribe_acks(&self) {
        // ---
        self.shared.hold_subscribe_acks.send_replace(false);
    }

    // --- instrumentation: event injection

    /// Deliver an inbound message event, as if published by another client.
    pub async fn inject_message(&self, topic: &str, payload: impl Into<Bytes>) {
        // ---
        self.emit(TransportEvent::Message {
            topic: topic.to_owned(),
            payload: payload.into(),
        })
        .await;
    }

    /// Signal a transport-internal reconnect.
    pub async fn emit_reconnecting(&self) {
        // ---
        self.emit(TransportEvent::Reconnecting).await;
    }

    /// Signal a fatal connection close.
    pub async fn emit_closed(&self) {
        // ---
        self.emit(TransportEvent::Closed).await;
    }

    /// Signal a transport-level error.
    pub async fn emit_error(&self, msg: &str) {
        // ---
        self.emit(TransportEvent::Error(msg.to_owned())).await;
    }

    async fn emit(&self, event: TransportEvent) {
        // ---
        let tx = lock(&self.shared.event_tx).clone();
        if let Some(tx) = tx {
            // A dropped receiver just means the gateway moved on.
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait::async_trait]
impl Connector for MemoryBroker {
    // ---

    async fn connect(&self, _config: &GatewayConfig) -> Result<(TransportPtr, EventStream)> {
        // ---
        if let Some(reason) = lock(&self.shared.fail_connect).take() {
            return Err(Error::ConnectFailed(reason));
        }

        self.shared.connect_calls.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(64);

        {
            // Fresh connection: no broker-side subscriptions carry over.
            lock(&self.shared.topics).clear();
            *lock(&self.shared.event_tx) = Some(tx.clone());
        }

        if !*lock(&self.shared.defer_connack) {
            let _ = tx.send(TransportEvent::Connected).await;
        }

        let transport = MemoryTransport {
            shared: Arc::clone(&self.shared),
        };

        Ok((Arc::new(transport), rx))
    }
}

/// Connection handle onto the shared broker state.
struct MemoryTransport {
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---

    /// Register a broker-side subscription.
    ///
    /// The call counts as issued before the (possibly held) acknowledgement
    /// resolves, mirroring a real subscribe round-trip.
    async fn subscribe(&self, topic: &str) -> Result<()> {
        // ---
        *lock(&self.shared.subscribe_calls)
            .entry(topic.to_owned())
            .or_insert(0) += 1;

        let mut held = self.shared.hold_subscribe_acks.subscribe();
        while *held.borrow_and_update() {
            if held.changed().await.is_err() {
                break;
            }
        }

        if let Some(reason) = lock(&self.shared.fail_subscribe).take() {
            return Err(Error::SubscribeFailed(reason));
        }

        lock(&self.shared.topics).insert(topic.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        // ---
        *lock(&self.shared.unsubscribe_calls)
            .entry(topic.to_owned())
            .or_insert(0) += 1;

        if let Some(reason) = lock(&self.shared.fail_unsubscribe).take() {
            return Err(Error::UnsubscribeFailed(reason));
        }

        lock(&self.shared.topics).remove(topic);
        Ok(())
    }

    /// Accept a frame for delivery.
    ///
    /// A frame whose topic is subscribed on this connection is also looped
    /// back as an inbound message, matching broker echo behavior.
    async fn publish(&self, topic: &str, payload: Bytes, qos: QosLevel) -> Result<()> {
        // ---
        if let Some(reason) = lock(&self.shared.fail_publish).take() {
            return Err(Error::PublishFailed(reason));
        }

        lock(&self.shared.published).push(PublishedFrame {
            topic: topic.to_owned(),
            payload: payload.clone(),
            qos,
        });

        let tx = {
            let subscribed = lock(&self.shared.topics).contains(topic);
            if subscribed {
                lock(&self.shared.event_tx).clone()
            } else {
                None
            }
        };

        if let Some(tx) = tx {
            let _ = tx
                .send(TransportEvent::Message {
                    topic: topic.to_owned(),
                    payload,
                })
                .await;
        }

        Ok(())
    }

    /// Close the connection: ends the event stream and drops broker-side
    /// subscriptions.
    async fn close(&self) -> Result<()> {
        // ---
        let _ = lock(&self.shared.event_tx).take();
        lock(&self.shared.topics).clear();
        Ok(())
    }
}

/// Poison-ignoring lock helper; instrumentation state has no cross-field
/// invariants worth dying for.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
