// src/transport/rumqttc/mod.rs

mod transport;

pub use transport::RumqttcConnector;
