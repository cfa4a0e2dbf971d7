use std::time::Duration;

use crate::directory::protocol::{
    GET, HELLO, LIST_FILES, WELCOME, parse_file_row, parse_routing,
};
use crate::directory::types::{FileListing, RoutingDecision};
use crate::error::{CdnError, Result};
use crate::membership::protocol::{LIST_SERVERS, ServerRow};
use crate::transport::{LineConn, request_rows};

/// Talks to the index on behalf of a client.
#[derive(Debug, Clone)]
pub struct IndexClient {
    index_addr: String,
    timeout: Duration,
}

impl IndexClient {
    pub fn new(index_addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            index_addr: index_addr.into(),
            timeout,
        }
    }

    /// `HELLO` handshake; confirms the peer is a micro-CDN index.
    pub async fn hello(&self) -> Result<()> {
        let mut conn = LineConn::connect(&self.index_addr, self.timeout).await?;
        conn.write_line(HELLO).await?;
        let reply = conn.read_line().await?;
        conn.shutdown().await;

        match reply.as_deref() {
            Some(WELCOME) => Ok(()),
            Some(other) => Err(CdnError::InvalidFormat(format!(
                "unexpected greeting: {}",
                other
            ))),
            None => Err(CdnError::Unreachable(self.index_addr.clone())),
        }
    }

    /// Asks the index where to fetch `file_name` from.
    pub async fn locate(&self, file_name: &str) -> Result<RoutingDecision> {
        let mut conn = LineConn::connect(&self.index_addr, self.timeout).await?;
        conn.write_line(&format!("{} {}", GET, file_name)).await?;
        let reply = conn.read_line().await?;
        conn.shutdown().await;

        match reply {
            Some(line) => parse_routing(&line, file_name),
            None => Err(CdnError::Unreachable(self.index_addr.clone())),
        }
    }

    pub async fn list_files(&self) -> Result<Vec<FileListing>> {
        let rows = request_rows(&self.index_addr, LIST_FILES, self.timeout).await?;
        rows.iter().map(|row| parse_file_row(row)).collect()
    }

    pub async fn list_servers(&self) -> Result<Vec<ServerRow>> {
        let rows = request_rows(&self.index_addr, LIST_SERVERS, self.timeout).await?;
        rows.iter().map(|row| ServerRow::parse(row)).collect()
    }
}
