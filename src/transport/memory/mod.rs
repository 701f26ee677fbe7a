// src/transport/memory/mod.rs

mod transport;

pub use transport::{MemoryBroker, PublishedFrame};
