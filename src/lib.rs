//! Shared MQTT gateway client: one broker connection per process, topic
//! subscriptions multiplexed across arbitrarily many independent callers.
//!
//! MQTT protocol-level subscriptions are per-connection, not per-caller;
//! without multiplexing, N callers wanting the same topic would need N
//! connections or would silently overwrite each other's handlers. The
//! [`GatewayClient`] guarantees at most one live protocol subscription per
//! topic regardless of application-level subscriber count, deduplicates
//! concurrent connection attempts, and serializes all shared-state mutation
//! against the asynchronous transport.
//!
//! Construct one client at process startup and pass clones to callers:
//!
//! ```no_run
//! use mqtt_gateway::{create_connector, GatewayClient, GatewayConfig};
//!
//! # async fn example() -> mqtt_gateway::Result<()> {
//! let gateway = GatewayClient::new(create_connector());
//!
//! let config = GatewayConfig::new("mqtt://localhost:1883", "dashboard-server");
//! gateway.connect(&config).await?;
//!
//! let token = gateway
//!     .subscribe("devices/42/telemetry", |payload| {
//!         println!("telemetry: {payload}");
//!     })
//!     .await?;
//!
//! gateway.publish("devices/42/cmd", r#"{"led":"on"}"#).await?;
//!
//! gateway.unsubscribe("devices/42/telemetry", Some(token)).await?;
//! gateway.disconnect().await?;
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod client;
mod domain;
mod transport;

mod gateway_config;

mod error;
mod macros;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::{GatewayClient, SubscriptionToken};

pub use gateway_config::GatewayConfig;

pub use error::{Error, Result};

pub use transport::{MemoryBroker, PublishedFrame};

#[cfg(feature = "transport_rumqttc")]
pub use transport::RumqttcConnector;

// --- public re-exports
pub use domain::{
    //
    Connector,
    ConnectorPtr,
    EventStream,
    Payload,
    QosLevel,
    Transport,
    TransportEvent,
    TransportPtr,
};

use std::sync::Arc;

/// Create the crate-default connector.
///
/// With the `transport_rumqttc` feature (the default) this is the real
/// broker transport; otherwise it falls back to the in-memory broker
/// double.
pub fn create_connector() -> ConnectorPtr {
    // ---
    #[cfg(feature = "transport_rumqttc")]
    {
        return Arc::new(RumqttcConnector);
    }

    // Fallback / default
    #[cfg(not(feature = "transport_rumqttc"))]
    {
        Arc::new(MemoryBroker::new())
    }
}
