// src/client/mod.rs

//! Gateway client: connection lifecycle, subscription multiplexing,
//! publish/dispatch. See [`gateway::GatewayClient`].

mod gateway;
mod pending;
mod registry;

pub use gateway::GatewayClient;
pub use registry::SubscriptionToken;
