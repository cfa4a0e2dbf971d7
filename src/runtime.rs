use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Owns the background tasks of one running service and the signal that
/// stops them.
pub struct ServiceHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    pub fn new(name: &'static str) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name,
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task));
    }

    /// Signals every task to stop and waits for them, aborting stragglers.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down {}", self.name);
        let _ = self.shutdown.send(true);

        for mut task in self.tasks {
            if tokio::time::timeout(JOIN_GRACE, &mut task).await.is_err() {
                tracing::warn!("{} task did not stop in time, aborting", self.name);
                task.abort();
            }
        }

        tracing::info!("{} stopped", self.name);
    }
}
