//! Process supervisor
//!
//! Runs the source adapter, the target adapter and a termination-signal
//! watcher as three tasks reporting into one channel. The first report
//! decides the shutdown cause; shutdown is then broadcast, every task is
//! awaited and both adapters are closed before returning. Tasks still
//! running when the join grace runs out are aborted.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use crate::adapter::{Adapter, AdapterError};

/// Why the supervisor stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// Termination signal received
    Signal(&'static str),
    /// An adapter's run returned without error
    Finished(String),
    /// An adapter's run failed
    Failed { adapter: String, error: AdapterError },
    /// Every task ended without reporting
    Aborted,
}

impl ShutdownCause {
    pub fn is_error(&self) -> bool {
        matches!(self, ShutdownCause::Failed { .. } | ShutdownCause::Aborted)
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Signal(name) => write!(f, "received {}", name),
            ShutdownCause::Finished(adapter) => write!(f, "adapter '{}' stopped", adapter),
            ShutdownCause::Failed { adapter, error } => {
                write!(f, "adapter '{}' failed: {}", adapter, error)
            }
            ShutdownCause::Aborted => write!(f, "all tasks ended without a result"),
        }
    }
}

enum Report {
    Adapter(String, Result<(), AdapterError>),
    Signal(&'static str),
}

/// How long supervised tasks get to acknowledge shutdown
pub const DEFAULT_JOIN_GRACE: Duration = Duration::from_secs(2);

pub struct Supervisor {
    source: Arc<dyn Adapter>,
    target: Arc<dyn Adapter>,
    shutdown: broadcast::Sender<()>,
    join_grace: Duration,
}

impl Supervisor {
    pub fn new(source: Arc<dyn Adapter>, target: Arc<dyn Adapter>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            source,
            target,
            shutdown,
            join_grace: DEFAULT_JOIN_GRACE,
        }
    }

    pub fn with_join_grace(mut self, grace: Duration) -> Self {
        self.join_grace = grace;
        self
    }

    /// Receiver fired when the supervisor starts shutting down
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Run until the first task reports, then tear everything down
    pub async fn run<S>(self, signal: S) -> ShutdownCause
    where
        S: Future<Output = &'static str> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(3);
        let mut tasks = Vec::with_capacity(3);

        for adapter in [self.source.clone(), self.target.clone()] {
            let tx = tx.clone();
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let result = adapter.run(shutdown).await;
                let _ = tx
                    .send(Report::Adapter(adapter.name().to_string(), result))
                    .await;
            }));
        }

        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                name = signal => {
                    let _ = tx.send(Report::Signal(name)).await;
                }
                _ = shutdown.recv() => {}
            }
        }));

        let cause = match rx.recv().await {
            Some(Report::Signal(name)) => ShutdownCause::Signal(name),
            Some(Report::Adapter(adapter, Ok(()))) => ShutdownCause::Finished(adapter),
            Some(Report::Adapter(adapter, Err(error))) => ShutdownCause::Failed { adapter, error },
            None => ShutdownCause::Aborted,
        };
        info!("Shutting down: {}", cause);

        let _ = self.shutdown.send(());
        let deadline = Instant::now() + self.join_grace;
        for mut task in tasks {
            match timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Supervised task ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Supervised task ignored shutdown for {:?}, aborting",
                        self.join_grace
                    );
                    task.abort();
                }
            }
        }

        // Later reports only matter for the log
        while let Ok(report) = rx.try_recv() {
            if let Report::Adapter(adapter, Err(e)) = report {
                warn!("Adapter '{}' also failed: {}", adapter, e);
            }
        }

        self.source.close().await;
        self.target.close().await;

        cause
    }
}

/// Resolves on SIGINT or SIGTERM with the signal's name
pub async fn termination_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    name = ctrl_c() => name,
                    _ = term.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c().await
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
