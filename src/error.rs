//! Error taxonomy shared by the monitor, the index and their collaborators.
//!
//! Every variant maps onto a single wire token so that a failure reaching a
//! peer is always an explicit `ERROR <TOKEN>` line, never a silent hang.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum CdnError {
    /// Malformed arguments for a known verb.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Verb not understood by this endpoint.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// File-catalog rows sent before a `REGISTER` line.
    #[error("no registration in progress")]
    NotRegistered,

    /// The requested file name has no entry in the directory.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Entries exist for the file but every hosting node is dead.
    #[error("no live server hosts {0}")]
    Unavailable(String),

    /// A peer stalled longer than the configured I/O timeout.
    #[error("peer timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A content node or monitor could not be reached.
    #[error("{0} is unreachable")]
    Unreachable(String),

    /// The listener is shedding load.
    #[error("too many concurrent connections")]
    Busy,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CdnError {
    /// Token written after `ERROR ` when this failure is reported to a peer.
    pub fn wire_token(&self) -> &'static str {
        match self {
            CdnError::InvalidFormat(_) => "INVALID_FORMAT",
            CdnError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            CdnError::NotRegistered => "NOT_REGISTERED",
            CdnError::NotFound(_) => "FILE_NOT_FOUND",
            CdnError::Unavailable(_) => "NO_LIVE_SERVER",
            CdnError::Timeout(_) => "TIMEOUT",
            CdnError::Unreachable(_) => "UNREACHABLE",
            CdnError::Busy => "BUSY",
            CdnError::Config(_) | CdnError::Io(_) => "INTERNAL",
        }
    }

    /// Protocol-level rejections keep the connection open for follow-ups.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CdnError::InvalidFormat(_)
                | CdnError::UnknownCommand(_)
                | CdnError::NotRegistered
                | CdnError::NotFound(_)
                | CdnError::Unavailable(_)
        )
    }

    /// Renders the full `ERROR <TOKEN>` line (without newline).
    pub fn to_wire(&self) -> String {
        format!("ERROR {}", self.wire_token())
    }
}

pub type Result<T> = std::result::Result<T, CdnError>;
