//! Client side of the micro-CDN: ask the index where a file lives, then
//! fetch its bytes straight from that content node.

pub mod download;
pub mod index;


use std::path::PathBuf;

use crate::config::ClientConfig;
use crate::directory::types::RoutingDecision;
use crate::error::Result;
use index::IndexClient;

pub struct Client {
    index: IndexClient,
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            index: IndexClient::new(config.index_addr.clone(), config.io_timeout),
            config,
        }
    }

    pub fn index(&self) -> &IndexClient {
        &self.index
    }

    /// Resolves `file_name` and downloads it into the output directory.
    pub async fn fetch<F>(&self, file_name: &str, progress: F) -> Result<(RoutingDecision, PathBuf)>
    where
        F: FnMut(u64, u64),
    {
        let decision = self.index.locate(file_name).await?;
        tracing::info!(
            "Index routed {} to {} at {}",
            file_name,
            decision.node_id,
            decision.address
        );

        let path = download::download(
            &decision,
            &self.config.output_dir,
            self.config.io_timeout,
            self.config.transfer_timeout,
            progress,
        )
        .await?;

        Ok((decision, path))
    }
}
