// src/client/gateway.rs

//! The shared gateway client.
//!
//! This module contains the core [`GatewayClient`] type: the sole owner of
//! the process's broker connection. It multiplexes topic subscriptions
//! across arbitrarily many independent callers and serializes all state
//! mutation against the asynchronous transport.
//!
//! # Architecture
//!
//! All shared state (connection handle, pending connection attempt, pending
//! first-subscribes, subscription registry) lives behind one mutex. The lock
//! is held only across state transitions, never across a transport
//! round-trip, so a slow broker acknowledgement on one topic does not stall
//! unrelated callers.
//!
//! Each connection attempt carries an epoch. Anything that resolves after a
//! round-trip (a connect, a subscribe acknowledgement) re-checks the epoch
//! before touching state, so a late acknowledgement cannot repopulate state
//! torn down by `disconnect()`.
//!
//! # Caller contract
//!
//! Registered subscriptions are not replayed across a manual disconnect or
//! a fatal connection loss; callers re-subscribe after reconnecting. No
//! timeout is imposed on any operation; wrap calls in `tokio::time::timeout`
//! when bounded latency is required.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    ConnectorPtr,
    Error,
    EventStream,
    GatewayConfig,
    Payload,
    QosLevel,
    Result,
    TransportEvent,
    TransportPtr,
};

use super::pending::{AckResult, WaiterSet};
use super::registry::{MessageCallback, Removal, SubscriptionRegistry, SubscriptionToken};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Mutex poisoning indicates that another task panicked while holding the
/// lock. The protected state here is connection bookkeeping with no
/// invariants spanning an await point, and the dispatcher never runs
/// callbacks under the lock, so the worst outcome of continuing is a stale
/// registry entry. This also avoids propagating non-`Send` poison errors
/// across async boundaries.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared gateway client instance.
///
/// Cheap to clone (internally `Arc`-backed). Construct one per process at
/// startup and hand clones to API handlers and background tasks; an MQTT
/// broker connection is a scarce stateful resource not meant to be
/// duplicated per request.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    connector: ConnectorPtr,
    state: Mutex<State>,
}

/// Connection lifecycle: Disconnected (`transport` absent), Connecting
/// (`transport` present, `connected` false, `connect_waiters` occupied),
/// Connected (`transport` present, `connected` true).
struct State {
    // ---
    /// Bumped on every new connection attempt and on disconnect. Stale
    /// completions compare against this and discard their result.
    epoch: u64,
    transport: Option<TransportPtr>,
    connected: bool,
    default_qos: QosLevel,
    connect_waiters: Option<WaiterSet>,
    /// One waiter set per topic whose first protocol-level subscribe is in
    /// flight. Collapses concurrent first-subscribers onto one round-trip.
    subscribe_waiters: HashMap<String, WaiterSet>,
    registry: SubscriptionRegistry,
}

/// Decision taken under the lock for a subscribe call.
enum SubscribePlan {
    // ---
    /// Topic already live; callback appended, token in hand.
    Registered(SubscriptionToken),
    /// First subscriber: issue the protocol subscribe on this transport.
    Issue { transport: TransportPtr, epoch: u64 },
    /// Another caller's subscribe is in flight; wait for its outcome.
    Wait(oneshot::Receiver<AckResult>),
}

impl GatewayClient {
    // ---

    /// Create a gateway client over the given connector.
    pub fn new(connector: ConnectorPtr) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                connector,
                state: Mutex::new(State {
                    epoch: 0,
                    transport: None,
                    connected: false,
                    default_qos: QosLevel::AtMostOnce,
                    connect_waiters: None,
                    subscribe_waiters: HashMap::new(),
                    registry: SubscriptionRegistry::new(),
                }),
            }),
        }
    }

    /// Whether a live broker connection is currently held.
    pub fn is_connected(&self) -> bool {
        // ---
        lock_ignore_poison(&self.inner.state).connected
    }

    /// Establish the broker connection.
    ///
    /// Idempotent while connected. Concurrent callers during an in-flight
    /// attempt all await the same outcome; at most one transport-level
    /// connect is ever issued at a time.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectFailed` if the transport rejects or cannot
    /// establish the connection. The pending slot is cleared on failure, so
    /// a subsequent call may retry.
    pub async fn connect(&self, config: &GatewayConfig) -> Result<()> {
        // ---
        let (rx, new_attempt) = {
            let mut state = lock_ignore_poison(&self.inner.state);

            if state.connected {
                return Ok(());
            }

            if let Some(waiters) = state.connect_waiters.as_mut() {
                // Attempt already in flight; join it.
                (waiters.register(), None)
            } else {
                let mut waiters = WaiterSet::new();
                let rx = waiters.register();

                state.epoch += 1;
                state.connect_waiters = Some(waiters);
                state.default_qos = config.default_qos;

                (rx, Some(state.epoch))
            }
        };

        if let Some(epoch) = new_attempt {
            if let Err(err) = self.start_attempt(config, epoch).await {
                // Reject everyone who joined this attempt, ourselves included.
                let waiters = {
                    let mut state = lock_ignore_poison(&self.inner.state);
                    if state.epoch == epoch {
                        state.transport = None;
                        state.connect_waiters.take()
                    } else {
                        None
                    }
                };
                if let Some(waiters) = waiters {
                    waiters.resolve(Err(err.detail()));
                }
            }
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(Error::ConnectFailed(msg)),
            Err(_) => Err(Error::ConnectFailed("connection attempt abandoned".into())),
        }
    }

    /// Kick off the transport connect and spawn the event pump for it.
    async fn start_attempt(&self, config: &GatewayConfig, epoch: u64) -> Result<()> {
        // ---
        let (transport, events) = self.inner.connector.connect(config).await?;

        let stale = {
            let mut state = lock_ignore_poison(&self.inner.state);
            if state.epoch == epoch {
                state.transport = Some(Arc::clone(&transport));
                false
            } else {
                true
            }
        };

        if stale {
            // disconnect() raced this attempt; tear the fresh connection down.
            let _ = transport.close().await;
            return Err(Error::ConnectFailed("gateway disconnected during connect".into()));
        }

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(run_events(inner, events, epoch));

        Ok(())
    }

    /// Register `callback` for inbound messages on `topic`.
    ///
    /// The first subscriber for a topic pays one broker round-trip; later
    /// subscribers (and concurrent first-subscribers) share the same
    /// protocol-level subscription. Each registered callback is invoked
    /// independently on every inbound message for the topic.
    ///
    /// Returns a token for targeted removal via [`unsubscribe`](Self::unsubscribe).
    ///
    /// # Errors
    ///
    /// - `Error::NotConnected` if no live connection exists.
    /// - `Error::SubscribeFailed` if the broker rejects the subscription;
    ///   the callback is not registered in that case.
    pub async fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<SubscriptionToken> {
        // ---
        let callback: MessageCallback = Arc::new(callback);

        let plan = {
            let mut state = lock_ignore_poison(&self.inner.state);

            if !state.connected {
                return Err(Error::NotConnected);
            }

            if state.registry.contains(topic) {
                SubscribePlan::Registered(state.registry.insert(topic, Arc::clone(&callback)))
            } else if let Some(waiters) = state.subscribe_waiters.get_mut(topic) {
                SubscribePlan::Wait(waiters.register())
            } else {
                // transport is always present while connected
                let transport = state.transport.clone().ok_or(Error::NotConnected)?;
                state.subscribe_waiters.insert(topic.to_owned(), WaiterSet::new());
                SubscribePlan::Issue {
                    transport,
                    epoch: state.epoch,
                }
            }
        };

        match plan {
            SubscribePlan::Registered(token) => Ok(token),
            SubscribePlan::Issue { transport, epoch } => {
                self.issue_subscribe(topic, callback, transport, epoch).await
            }
            SubscribePlan::Wait(rx) => {
                match rx.await {
                    Ok(Ok(())) => self.register_after_ack(topic, callback),
                    Ok(Err(msg)) => Err(Error::SubscribeFailed(msg)),
                    Err(_) => Err(Error::SubscribeFailed("subscribe attempt abandoned".into())),
                }
            }
        }
    }

    /// First-subscriber path: one protocol subscribe, ack awaited outside
    /// the lock, waiters released with the shared outcome.
    async fn issue_subscribe(
        &self,
        topic: &str,
        callback: MessageCallback,
        transport: TransportPtr,
        epoch: u64,
    ) -> Result<SubscriptionToken> {
        // ---
        let ack = transport.subscribe(topic).await;

        let (outcome, waiters) = {
            let mut state = lock_ignore_poison(&self.inner.state);

            if state.epoch != epoch {
                // Torn down while the ack was in flight. disconnect() already
                // rejected the waiters; discard our result either way.
                drop(state);
                log_debug!("discarding stale subscribe ack for topic {topic}");
                return Err(Error::SubscribeFailed(
                    "gateway disconnected during subscribe".into(),
                ));
            }

            let waiters = state.subscribe_waiters.remove(topic);

            match ack {
                Ok(()) => {
                    let token = state.registry.insert(topic, callback);
                    (Ok(token), waiters)
                }
                Err(err) => (Err(err), waiters),
            }
        };

        if let Some(waiters) = waiters {
            waiters.resolve(match &outcome {
                Ok(_) => Ok(()),
                Err(err) => Err(err.detail()),
            });
        }

        outcome
    }

    /// Late-joiner path: the shared subscribe succeeded, append under the
    /// lock if the world has not changed since.
    fn register_after_ack(&self, topic: &str, callback: MessageCallback) -> Result<SubscriptionToken> {
        // ---
        let mut state = lock_ignore_poison(&self.inner.state);

        if !state.connected {
            return Err(Error::NotConnected);
        }
        if !state.registry.contains(topic) {
            // Subscription vanished between ack and append (unsubscribed or
            // torn down). Treat as a failed subscribe rather than silently
            // re-creating a key with no protocol-level subscription.
            return Err(Error::SubscribeFailed(format!(
                "subscription for topic {topic} was removed before registration"
            )));
        }

        Ok(state.registry.insert(topic, callback))
    }

    /// Remove a callback (by token) or all callbacks for `topic`.
    ///
    /// When the last callback goes, the protocol-level unsubscribe is
    /// issued. A protocol failure is reported as `Error::UnsubscribeFailed`,
    /// but the local entry stays removed regardless: a spurious broker-side
    /// subscription is harmless since dispatch finds no registry entry.
    ///
    /// Unknown topics and unknown tokens are no-ops.
    pub async fn unsubscribe(
        &self,
        topic: &str,
        token: Option<SubscriptionToken>,
    ) -> Result<()> {
        // ---
        let transport = {
            let mut state = lock_ignore_poison(&self.inner.state);

            match state.registry.remove(topic, token) {
                Removal::NotRegistered | Removal::Retained => return Ok(()),
                Removal::TopicEmptied => state.transport.clone(),
            }
        };

        // Transport may already be gone after a connection loss; local
        // removal above is all there is to do then.
        if let Some(transport) = transport {
            if let Err(err) = transport.unsubscribe(topic).await {
                log_warn!("protocol unsubscribe failed for topic {topic}: {err}");
                return Err(Error::UnsubscribeFailed(err.detail()));
            }
        }

        Ok(())
    }

    /// Publish a payload to `topic` at the configured default QoS.
    ///
    /// Accepts pre-serialized text (sent unchanged) or a `serde_json::Value`
    /// (JSON-encoded before transmission).
    ///
    /// # Errors
    ///
    /// - `Error::NotConnected` if no live connection exists.
    /// - `Error::Serialization` if JSON encoding fails.
    /// - `Error::PublishFailed` on transport-level failure.
    pub async fn publish(&self, topic: &str, payload: impl Into<Payload>) -> Result<()> {
        // ---
        let qos = lock_ignore_poison(&self.inner.state).default_qos;
        self.publish_with_qos(topic, payload, qos).await
    }

    /// Publish at an explicit QoS.
    pub async fn publish_with_qos(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        qos: QosLevel,
    ) -> Result<()> {
        // ---
        let transport = {
            let state = lock_ignore_poison(&self.inner.state);
            if !state.connected {
                return Err(Error::NotConnected);
            }
            state.transport.clone().ok_or(Error::NotConnected)?
        };

        let bytes = payload.into().into_bytes()?;
        transport.publish(topic, bytes, qos).await
    }

    /// Publish any serializable value as a JSON payload.
    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<()> {
        // ---
        let value = serde_json::to_value(value)?;
        self.publish(topic, Payload::Json(value)).await
    }

    /// Tear down the connection and drop all registered subscriptions.
    ///
    /// Idempotent. Callers must re-subscribe after a manual disconnect.
    /// Any in-flight connect or first-subscribe is rejected, and late
    /// acknowledgements from operations started before this call are
    /// discarded via the epoch bump.
    pub async fn disconnect(&self) -> Result<()> {
        // ---
        let (transport, connect_waiters, subscribe_waiters) = {
            let mut state = lock_ignore_poison(&self.inner.state);

            state.epoch += 1;
            state.connected = false;
            state.registry.clear();

            (
                state.transport.take(),
                state.connect_waiters.take(),
                std::mem::take(&mut state.subscribe_waiters),
            )
        };

        if let Some(waiters) = connect_waiters {
            waiters.resolve(Err("gateway disconnected".into()));
        }
        for (_, waiters) in subscribe_waiters {
            waiters.resolve(Err("gateway disconnected".into()));
        }

        if let Some(transport) = transport {
            if let Err(_err) = transport.close().await {
                log_warn!("transport close failed: {_err}");
            }
            log_info!("mqtt gateway disconnected");
        }

        Ok(())
    }
}

/// Per-connection event pump.
///
/// Registered exactly once per underlying connection. Owns pending-connect
/// resolution, inbound message dispatch, and the Disconnected transition on
/// fatal close. Exits as soon as its epoch goes stale or the stream ends.
async fn run_events(inner: Weak<Inner>, mut events: EventStream, epoch: u64) {
    // ---
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            TransportEvent::Connected => {
                let waiters = {
                    let mut state = lock_ignore_poison(&inner.state);
                    if state.epoch != epoch {
                        return;
                    }
                    state.connected = true;
                    state.connect_waiters.take()
                };

                log_info!("mqtt gateway connected");
                if let Some(waiters) = waiters {
                    waiters.resolve(Ok(()));
                }
            }

            TransportEvent::Message { topic, payload } => {
                let callbacks = {
                    let state = lock_ignore_poison(&inner.state);
                    if state.epoch != epoch {
                        return;
                    }
                    state.registry.callbacks(&topic)
                };

                // Unknown topic: silent drop (e.g. a race during unsubscribe).
                if let Some(callbacks) = callbacks {
                    dispatch(&topic, &payload, callbacks);
                }
            }

            TransportEvent::Reconnecting => {
                // Transport-internal reconnect; our Connected state stands.
                log_info!("mqtt transport reconnecting");
            }

            TransportEvent::Closed => {
                let waiters = {
                    let mut state = lock_ignore_poison(&inner.state);
                    if state.epoch != epoch {
                        return;
                    }
                    state.connected = false;
                    state.transport = None;
                    // Registry deliberately left alone: re-subscription after
                    // a connection loss is the caller's contract.
                    state.connect_waiters.take()
                };

                log_info!("mqtt connection closed");
                if let Some(waiters) = waiters {
                    waiters.resolve(Err("connection closed".into()));
                }
                return;
            }

            TransportEvent::Error(msg) => {
                let waiters = {
                    let mut state = lock_ignore_poison(&inner.state);
                    if state.epoch != epoch {
                        return;
                    }
                    if state.connected {
                        // Post-connect transport error; the transport handles
                        // its own recovery.
                        None
                    } else {
                        let _ = state.transport.take();
                        state.connect_waiters.take()
                    }
                };

                match waiters {
                    Some(waiters) => {
                        log_error!("mqtt connection error: {msg}");
                        waiters.resolve(Err(msg));
                        return;
                    }
                    None => log_error!("mqtt transport error: {msg}"),
                }
            }
        }
    }
}

/// Invoke every callback for one inbound message, isolating failures.
///
/// A panicking callback is caught and logged; the remaining callbacks still
/// run and the registry is untouched.
fn dispatch(topic: &str, payload: &Bytes, callbacks: Vec<MessageCallback>) {
    // ---
    let text = String::from_utf8_lossy(payload);

    for callback in callbacks {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&text)));
        if result.is_err() {
            log_error!("subscriber callback panicked for topic {topic}");
        }
    }
}
