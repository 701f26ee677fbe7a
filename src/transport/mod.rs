// src/transport/mod.rs

//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Connector`/`Transport` traits. The real broker transport is hidden
//! behind a feature flag; the in-memory broker double is always available.
//!
//! Gateway code must not depend on transport-specific types.

mod memory;

#[cfg(feature = "transport_rumqttc")]
mod rumqttc;

pub use memory::{MemoryBroker, PublishedFrame};

#[cfg(feature = "transport_rumqttc")]
pub use rumqttc::RumqttcConnector;
