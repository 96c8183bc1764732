//! Cluster layer: replica placement, the peer protocol client and the
//! quorum coordinator.

pub mod client;
pub mod coordinator;
pub mod placement;
pub mod pool;

pub use client::Client;
pub use coordinator::Coordinator;
pub use placement::replicas;
