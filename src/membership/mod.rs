//! Membership & Failure Detection Module
//!
//! Tracks which content nodes are alive from the heartbeats they push over UDP.
//!
//! ## Core Mechanisms
//! - **Heartbeat Ingestion**: Each datagram creates or refreshes one `NodeRecord`; reordered
//!   datagrams never move `last_heartbeat` backwards.
//! - **Failure Detection**: A periodic sweep demotes nodes silent for longer than the timeout
//!   to DEAD and publishes exactly one `ServerDown` per transition.
//! - **Snapshots**: Readers get an immutable copy whose liveness is re-derived at read time,
//!   so routing stays correct even between sweeps.
//! - **Push Notification**: Index servers registered with `REGISTER_INDEX` receive `SERVER_DOWN`
//!   lines for faster observability.

pub mod detector;
pub mod notifier;
pub mod protocol;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod types;
