//! Directory & Routing Module
//!
//! Maps file names to the content nodes hosting them and sends each client
//! to the least-loaded node that membership currently considers alive.
//!
//! ## Core Mechanisms
//! - **Catalog Replace**: A node's `DONE_FILES` swaps its whole catalog in one step; readers
//!   see the old catalog or the new one, never a mix.
//! - **Read-time Filtering**: Every lookup cross-checks candidate rows against the latest
//!   membership snapshot, so dead nodes are never returned even if their rows linger.
//! - **Membership Sources**: In-process the store is read directly; across processes a cached
//!   `LIST_SERVERS` view is refreshed periodically and patched by `SERVER_DOWN` pushes.
//! - **Status Surface**: An optional axum router exposes the same views as JSON.

pub mod catalog;
pub mod http;
pub mod protocol;
pub mod server;
pub mod service;
pub mod source;
pub mod types;

#[cfg(test)]
mod tests;
