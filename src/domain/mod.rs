// src/domain/mod.rs

//! Domain abstractions shared by the gateway client and the transports.

mod transport;

pub use transport::{
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
