//! Micro-CDN Library
//!
//! This library crate defines the core modules of a small content delivery
//! network. It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! The system is built around two coupled services and two thin collaborators:
//!
//! - **`membership`**: The monitor. Ingests UDP heartbeats into the membership store, runs
//!   the failure detector and pushes `SERVER_DOWN` to registered index servers.
//! - **`directory`**: The index. Keeps per-node file catalogs and routes every lookup to the
//!   least-loaded node that the latest membership snapshot considers alive.
//! - **`content`**: A content node. Serves file bytes, registers its catalog and heartbeats.
//! - **`client`**: Locates a file through the index and downloads it from a content node.
//!
//! Shared plumbing lives in `transport` (line protocol over TCP), `config`, `error`,
//! `runtime` (task ownership and shutdown) and `telemetry`.

pub mod client;
pub mod config;
pub mod content;
pub mod directory;
pub mod error;
pub mod membership;
pub mod runtime;
pub mod telemetry;
pub mod transport;
