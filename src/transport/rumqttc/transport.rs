// src/transport/rumqttc/transport.rs

//! MQTT transport implementation using `rumqttc`.
//!
//! This module implements the domain-level `Connector` and `Transport`
//! traits against a real broker. It follows an **actor-based concurrency
//! model** to safely integrate with the underlying MQTT client:
//!
//! - A single background actor task owns the MQTT `EventLoop`.
//! - The actor publishes outbound messages, registers and removes broker
//!   subscriptions, polls for incoming packets, and performs clean shutdown.
//! - All interaction with the MQTT client is serialized through this actor;
//!   no other task ever touches the event loop directly.
//!
//! ## Connection behavior
//!
//! Connection to the broker is **lazy**: it happens when the EventLoop first
//! polls after transport creation. The outcome is reported on the event
//! stream (`Connected` on ConnAck success, `Error` otherwise); the gateway
//! resolves its pending connection attempt from those events.
//!
//! ## Acknowledgement correlation
//!
//! rumqttc's SubAck and UnsubAck packets carry only packet IDs, not topic
//! names. Since a v4 broker acknowledges in submission order, pending
//! subscribes and unsubscribes are each kept in a FIFO queue and resolved
//! front-first as their acks arrive.
//!
//! ## Scope and limitations
//!
//! - One transport instance corresponds to a single broker connection.
//! - Inbound publishes are forwarded raw on the event stream; topic fanout
//!   and payload interpretation are the gateway's business.
//! - QoS 1/2 publishes resolve once accepted by the client; retransmission
//!   and ack tracking are handled inside rumqttc's event loop.
//! - After a connection drop the event loop keeps retrying on its own;
//!   `Reconnecting` is surfaced, and broker subscriptions are NOT replayed
//!   here. Re-subscription is the caller's contract.

use rumqttc::{
    //
    AsyncClient,
    ConnectReturnCode,
    Event,
    EventLoop,
    MqttOptions,
    Packet,
    QoS,
};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
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

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Actor commands issued by the `Transport` facade.
enum Cmd {
    //
    Publish {
        topic: String,
        payload: Bytes,
        qos: QosLevel,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        topic: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        topic: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Continue,
    Stop,
}

/// Connector backed by rumqttc.
///
/// `connect()` spawns the event-loop actor; the broker handshake outcome
/// arrives on the returned event stream.
pub struct RumqttcConnector;

#[async_trait::async_trait]
impl Connector for RumqttcConnector {
    // ---

    async fn connect(&self, config: &GatewayConfig) -> Result<(TransportPtr, EventStream)> {
        // ---
        let (client, event_loop) = create_mqtt_client(config)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);

        let actor = MqttActor {
            client_id: config.client_id.clone(),
            client,
            event_loop,
            cmd_rx,
            event_tx,
            pending_subscribes: VecDeque::new(),
            pending_unsubscribes: VecDeque::new(),
            connected_once: false,
        };

        tokio::spawn(actor.run());

        Ok((Arc::new(RumqttcTransport { cmd_tx }), event_rx))
    }
}

/// rumqttc-backed implementation of the `Transport` trait.
///
/// Every method is a command round-trip into the actor.
struct RumqttcTransport {
    // ---
    cmd_tx: mpsc::Sender<Cmd>,
}

#[async_trait::async_trait]
impl Transport for RumqttcTransport {
    // ---

    async fn subscribe(&self, topic: &str) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(Cmd::Subscribe {
                topic: topic.to_owned(),
                resp: tx,
            })
            .await
            .map_err(|_| Error::SubscribeFailed("transport closed".into()))?;

        rx.await
            .map_err(|_| Error::SubscribeFailed("transport closed".into()))?
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(Cmd::Unsubscribe {
                topic: topic.to_owned(),
                resp: tx,
            })
            .await
            .map_err(|_| Error::UnsubscribeFailed("transport closed".into()))?;

        rx.await
            .map_err(|_| Error::UnsubscribeFailed("transport closed".into()))?
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QosLevel) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(Cmd::Publish {
                topic: topic.to_owned(),
                payload,
                qos,
                resp: tx,
            })
            .await
            .map_err(|_| Error::PublishFailed("transport closed".into()))?;

        rx.await
            .map_err(|_| Error::PublishFailed("transport closed".into()))?
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        let _ = self.cmd_tx.send(Cmd::Close { resp: tx }).await;
        let _ = rx.await;

        Ok(())
    }
}

struct MqttActor {
    // ---
    client_id: String, // for logging only
    client: AsyncClient,
    event_loop: EventLoop,
    cmd_rx: mpsc::Receiver<Cmd>,
    event_tx: mpsc::Sender<TransportEvent>,
    /// FIFO of subscribes awaiting SUBACK, front = oldest.
    pending_subscribes: VecDeque<(String, oneshot::Sender<Result<()>>)>,
    /// FIFO of unsubscribes awaiting UNSUBACK.
    pending_unsubscribes: VecDeque<(String, oneshot::Sender<Result<()>>)>,
    connected_once: bool,
}

impl MqttActor {
    // ---

    async fn run(mut self) {
        // ---

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if matches!(self.handle_cmd(cmd).await, ActorStep::Stop) {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                event = self.event_loop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                            self.handle_connack(connack).await;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let _ = self.event_tx.send(TransportEvent::Message {
                                topic: publish.topic,
                                payload: publish.payload,
                            }).await;
                        }
                        Ok(Event::Incoming(Packet::SubAck(suback))) => {
                            self.handle_suback(suback);
                        }
                        Ok(Event::Incoming(Packet::UnsubAck(_unsuback))) => {
                            if let Some((_topic, resp)) = self.pending_unsubscribes.pop_front() {
                                log_debug!("{}: unsubscribed from {_topic}", self.client_id);
                                let _ = resp.send(Ok(()));
                            }
                        }
                        Ok(_event) => {
                            // PingResp, PubAck, etc.
                            log_debug!("{}: mqtt event (ignored): {:?}", self.client_id, _event);
                        }
                        Err(err) => {
                            self.handle_poll_error(err).await;
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
            }
        }
    }

    /// Dispatches an actor command to the correct handler.
    async fn handle_cmd(&mut self, cmd: Cmd) -> ActorStep {
        // ---
        match cmd {
            Cmd::Publish {
                topic,
                payload,
                qos,
                resp,
            } => {
                let result = self.handle_publish(&topic, payload, qos).await;
                let _ = resp.send(result);
                ActorStep::Continue
            }
            Cmd::Subscribe { topic, resp } => {
                self.handle_subscribe(topic, resp).await;
                ActorStep::Continue
            }
            Cmd::Unsubscribe { topic, resp } => {
                self.handle_unsubscribe(topic, resp).await;
                ActorStep::Continue
            }
            Cmd::Close { resp } => {
                self.handle_close().await;
                let _ = resp.send(Ok(()));
                ActorStep::Stop
            }
        }
    }

    async fn handle_publish(&mut self, topic: &str, payload: Bytes, qos: QosLevel) -> Result<()> {
        // ---
        self.client
            .publish(topic, map_qos(qos), false, payload.to_vec())
            .await
            .map_err(|err| {
                log_error!("{}: publish failed for topic {topic}: {err}", self.client_id);
                Error::PublishFailed(err.to_string())
            })
    }

    /// Sends the subscribe and queues it for SUBACK correlation.
    async fn handle_subscribe(&mut self, topic: String, resp: oneshot::Sender<Result<()>>) {
        // ---
        if let Err(err) = self.client.subscribe(&topic, QoS::AtMostOnce).await {
            log_error!(
                "{}: failed to send subscribe for topic {topic}: {err}",
                self.client_id
            );
            let _ = resp.send(Err(Error::SubscribeFailed(err.to_string())));
            return;
        }

        self.pending_subscribes.push_back((topic, resp));
    }

    /// Sends the unsubscribe and queues it for UNSUBACK correlation.
    async fn handle_unsubscribe(&mut self, topic: String, resp: oneshot::Sender<Result<()>>) {
        // ---
        if let Err(err) = self.client.unsubscribe(&topic).await {
            log_error!(
                "{}: failed to send unsubscribe for topic {topic}: {err}",
                self.client_id
            );
            let _ = resp.send(Err(Error::UnsubscribeFailed(err.to_string())));
            return;
        }

        self.pending_unsubscribes.push_back((topic, resp));
    }

    /// Resolves the oldest pending subscribe from a SUBACK's return codes.
    fn handle_suback(&mut self, suback: rumqttc::SubAck) {
        // ---
        let Some((topic, resp)) = self.pending_subscribes.pop_front() else {
            log_debug!("{}: SUBACK with no pending subscribe", self.client_id);
            return;
        };

        let rejected = suback
            .return_codes
            .iter()
            .any(|code| matches!(code, rumqttc::SubscribeReasonCode::Failure));

        if rejected {
            log_error!(
                "{}: broker rejected subscription to {topic}: {:?}",
                self.client_id,
                suback.return_codes
            );
            let _ = resp.send(Err(Error::SubscribeFailed(format!(
                "broker rejected subscription to {topic}"
            ))));
        } else {
            log_info!("{}: subscribed to {topic}", self.client_id);
            let _ = resp.send(Ok(()));
        }
    }

    async fn handle_connack(&mut self, connack: rumqttc::ConnAck) {
        // ---
        if connack.code == ConnectReturnCode::Success {
            log_info!("{}: connected to broker", self.client_id);
            self.connected_once = true;
            let _ = self.event_tx.send(TransportEvent::Connected).await;
        } else {
            log_error!("{}: connection refused: {:?}", self.client_id, connack.code);
            let _ = self
                .event_tx
                .send(TransportEvent::Error(format!(
                    "connection refused: {:?}",
                    connack.code
                )))
                .await;
        }
    }

    /// Classifies a poll error: a drop after a successful connect surfaces
    /// as `Reconnecting` (the gateway stays Connected while the event loop
    /// retries); before any ConnAck it is fatal for the attempt.
    async fn handle_poll_error(&mut self, err: rumqttc::ConnectionError) {
        // ---
        // A subscribe or unsubscribe in flight will never see its ack on
        // this connection; fail them rather than leave callers parked.
        for (topic, resp) in self.pending_subscribes.drain(..) {
            let _ = resp.send(Err(Error::SubscribeFailed(format!(
                "connection lost before SUBACK for {topic}"
            ))));
        }
        for (topic, resp) in self.pending_unsubscribes.drain(..) {
            let _ = resp.send(Err(Error::UnsubscribeFailed(format!(
                "connection lost before UNSUBACK for {topic}"
            ))));
        }

        if self.connected_once && is_disconnect(&err) {
            log_error!("{}: broker connection lost: {err}", self.client_id);
            let _ = self.event_tx.send(TransportEvent::Reconnecting).await;
        } else {
            log_error!("{}: mqtt error: {err}", self.client_id);
            let _ = self
                .event_tx
                .send(TransportEvent::Error(err.to_string()))
                .await;
        }
    }

    async fn handle_close(&mut self) {
        // ---
        log_debug!("{}: disconnecting mqtt client", self.client_id);

        if let Err(_err) = self.client.disconnect().await {
            log_debug!("{}: mqtt disconnect failed: {_err}", self.client_id);
        }

        let _ = self.event_tx.send(TransportEvent::Closed).await;
    }
} // MqttActor

fn is_disconnect(err: &rumqttc::ConnectionError) -> bool {
    // ---
    matches!(
        err,
        rumqttc::ConnectionError::Io(_) | rumqttc::ConnectionError::MqttState(_)
    )
}

fn map_qos(qos: QosLevel) -> QoS {
    // ---
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Creates an MQTT client and event loop from the gateway configuration.
///
/// Fallible only due to URL parsing; the `AsyncClient::new()` call itself is
/// infallible and the connection happens lazily on first poll.
fn create_mqtt_client(config: &GatewayConfig) -> Result<(AsyncClient, EventLoop)> {
    // ---
    let broker_url = &config.broker_url;

    // Accept "mqtt://host:port", "tcp://host:port", or bare "host:port".
    let url = broker_url
        .strip_prefix("mqtt://")
        .or_else(|| broker_url.strip_prefix("tcp://"))
        .unwrap_or(broker_url);

    let (host, port) = match url.split_once(':') {
        Some((host, port)) => (
            host,
            port.parse().map_err(|err| {
                Error::ConnectFailed(format!("invalid port in broker URL {broker_url}: {err}"))
            })?,
        ),
        None => (url, 1883),
    };

    let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        mqtt_options.set_credentials(username, password);
    }

    if let Some(keep_alive_secs) = config.keep_alive_secs {
        mqtt_options.set_keep_alive(Duration::from_secs(keep_alive_secs as u64));
    }

    let (client, event_loop) = AsyncClient::new(mqtt_options, 10);

    Ok((client, event_loop))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn url_parsing_accepts_schemes_and_defaults_port() {
        // ---
        for url in ["mqtt://broker.local:1884", "tcp://broker.local:1884"] {
            let config = GatewayConfig::new(url, "c1");
            assert!(create_mqtt_client(&config).is_ok());
        }

        // Bare host defaults to 1883.
        let config = GatewayConfig::new("broker.local", "c1");
        assert!(create_mqtt_client(&config).is_ok());
    }

    #[test]
    fn invalid_port_is_a_connect_error() {
        // ---
        let config = GatewayConfig::new("mqtt://broker.local:not-a-port", "c1");
        assert!(matches!(
            create_mqtt_client(&config),
            Err(Error::ConnectFailed(_))
        ));
    }
}
