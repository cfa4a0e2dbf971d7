//! Content Node Module
//!
//! A content node serves the files of one directory over TCP, announces its
//! catalog to the index with the `REGISTER`/`ADD_FILE`/`DONE_FILES` handshake
//! and pushes a heartbeat carrying its load (transfers in flight) to the
//! monitor every few seconds.

pub mod files;
pub mod node;
pub mod protocol;
