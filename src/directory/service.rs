use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use super::catalog::Directory;
use super::http;
use super::server::{HandshakeLimits, IndexState};
use super::source::{MembershipSource, RemoteMembership};
use crate::config::IndexConfig;
use crate::membership::store::MembershipStore;
use crate::runtime::ServiceHandle;
use crate::transport::accept_loop;

/// The index: directory, client/registration endpoint, notification
/// endpoint and optional HTTP status surface.
pub struct IndexService {
    pub state: Arc<IndexState>,
    remote: Option<Arc<RemoteMembership>>,
    config: IndexConfig,
}

/// A running index and the addresses it actually bound.
pub struct IndexHandle {
    pub state: Arc<IndexState>,
    pub client_addr: SocketAddr,
    pub notify_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    handle: ServiceHandle,
}

impl IndexHandle {
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

impl IndexService {
    /// Index reading membership from a monitor in another process.
    pub fn with_remote_monitor(config: IndexConfig) -> Arc<Self> {
        let remote = RemoteMembership::new(config.monitor_addr.clone(), config.io_timeout);
        let membership: Arc<dyn MembershipSource> = remote.clone();

        Arc::new(Self {
            state: index_state(&config, membership),
            remote: Some(remote),
            config,
        })
    }

    /// Index sharing the monitor's store in the same process.
    pub fn with_local_membership(config: IndexConfig, store: Arc<MembershipStore>) -> Arc<Self> {
        let membership: Arc<dyn MembershipSource> = store;

        Arc::new(Self {
            state: index_state(&config, membership),
            remote: None,
            config,
        })
    }

    pub async fn start(self: Arc<Self>) -> Result<IndexHandle> {
        self.config.validate()?;
        info!("Starting index service...");

        let client_listener = TcpListener::bind(self.config.client_bind)
            .await
            .with_context(|| format!("binding client endpoint {}", self.config.client_bind))?;
        let client_addr = client_listener.local_addr()?;

        let notify_listener = TcpListener::bind(self.config.notify_bind)
            .await
            .with_context(|| format!("binding notification endpoint {}", self.config.notify_bind))?;
        let notify_addr = notify_listener.local_addr()?;

        let http_listener = match self.config.http_bind {
            Some(bind) => Some(
                TcpListener::bind(bind)
                    .await
                    .with_context(|| format!("binding HTTP status surface {}", bind))?,
            ),
            None => None,
        };
        let http_addr = match &http_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let mut handle = ServiceHandle::new("index");

        {
            let state = self.state.clone();
            handle.spawn(accept_loop(
                "index client",
                client_listener,
                self.config.max_connections,
                handle.signal(),
                move |stream, peer| state.clone().handle_session(stream, peer),
            ));
        }

        {
            let state = self.state.clone();
            handle.spawn(accept_loop(
                "index notification",
                notify_listener,
                self.config.max_connections,
                handle.signal(),
                move |stream, peer| state.clone().handle_notification(stream, peer),
            ));
        }

        if let Some(remote) = &self.remote {
            let target = (self.config.advertise_host.clone(), notify_addr.port());
            handle.spawn(remote.clone().run(
                self.config.refresh_interval,
                Some(target),
                handle.signal(),
            ));
        }

        if let Some(purge_after) = self.config.purge_after {
            let service = self.clone();
            let shutdown = handle.signal();
            handle.spawn(async move {
                service.purge_loop(purge_after, shutdown).await;
            });
        }

        if let Some(listener) = http_listener {
            let app = http::router(self.state.clone());
            let mut shutdown = handle.signal();
            handle.spawn(async move {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.changed().await;
                    })
                    .await;
                if let Err(e) = served {
                    tracing::error!("HTTP status surface failed: {}", e);
                }
            });
        }

        info!(
            "Index listening: clients on tcp/{}, notifications on tcp/{}",
            client_addr, notify_addr
        );
        if let Some(addr) = http_addr {
            info!("HTTP status surface on http://{}", addr);
        }

        Ok(IndexHandle {
            state: self.state.clone(),
            client_addr,
            notify_addr,
            http_addr,
            handle,
        })
    }

    async fn purge_loop(&self, purge_after: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.refresh_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.changed() => break,
            }

            let snapshot = self.state.membership.snapshot();
            let purged = self.state.directory.purge_dead(&snapshot, purge_after);
            if !purged.is_empty() {
                info!("Purged {} dead node catalogs", purged.len());
            }
        }
    }
}

fn index_state(config: &IndexConfig, membership: Arc<dyn MembershipSource>) -> Arc<IndexState> {
    let handshake = HandshakeLimits {
        timeout: config.handshake_timeout,
        max_files: config.max_catalog_files,
    };
    IndexState::new(
        Arc::new(Directory::new()),
        membership,
        config.io_timeout,
        handshake,
    )
}
