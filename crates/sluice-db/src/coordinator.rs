//! Pipeline coordinator.
//!
//! Owns the lifecycle of one replication stream: the DDL job puller, the
//! owner-side DDL puller, the source manager, and the sink workers, each
//! in its own tokio task with a child cancellation token. The first fatal
//! error wins; peers are then cancelled in reverse startup order and the
//! source manager is closed last.

use std::sync::Arc;
use std::time::Duration;

use sluice_model::{RawKvEntry, TxnCallbackableEvent};
use sluice_puller::ddl_puller::{DdlEntry, DdlJobPuller, DdlPuller};
use sluice_puller::SourceManager;
use sluice_sink::backend::MysqlBackend;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ReplicationConfig;
use crate::error::ReplicationError;

/// Max interval between sink flushes while events trickle in.
const SINK_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// One sink worker: a backend plus its event channel.
pub struct SinkWorker {
    /// The batching backend.
    pub backend: MysqlBackend,
    /// Transaction events routed to this worker.
    pub events: mpsc::Receiver<TxnCallbackableEvent>,
}

/// Coordinates one replication stream's component tasks.
pub struct PipelineCoordinator {
    cfg: ReplicationConfig,
    root: CancellationToken,
}

impl PipelineCoordinator {
    /// Create a coordinator with a fresh root token.
    #[must_use]
    pub fn new(cfg: ReplicationConfig) -> Self {
        Self {
            cfg,
            root: CancellationToken::new(),
        }
    }

    /// A handle that cancels the whole stream.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Run the stream until a component fails or the root token fires.
    ///
    /// Components start leaves-first: DDL job puller, owner DDL puller,
    /// source manager, sink workers. On the first fatal error (or
    /// cancellation) the remaining components are stopped in reverse
    /// order, then the source manager is closed.
    ///
    /// # Errors
    ///
    /// Returns the first fatal component error.
    pub async fn run(
        self,
        job_puller: DdlJobPuller,
        sorted_ddl_rx: mpsc::Receiver<RawKvEntry>,
        ddl_entries_rx: mpsc::Receiver<DdlEntry>,
        ddl_puller: Arc<DdlPuller>,
        source_manager: Arc<SourceManager>,
        sink_workers: Vec<SinkWorker>,
    ) -> Result<(), ReplicationError> {
        tracing::info!(
            changefeed = %self.cfg.changefeed,
            sink_workers = sink_workers.len(),
            multiplexing = self.cfg.enable_multiplexing,
            "Pipeline starting"
        );

        let (err_tx, mut err_rx) = mpsc::channel::<ReplicationError>(8);
        let mut tokens: Vec<CancellationToken> = Vec::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let mut spawn = |name: &'static str,
                         token: CancellationToken,
                         task: tokio::task::JoinHandle<Result<(), ReplicationError>>| {
            let err_tx = err_tx.clone();
            tokens.push(token);
            handles.push(tokio::spawn(async move {
                let result = match task.await {
                    Ok(result) => result,
                    Err(join_err) => Err(ReplicationError::Task(join_err.to_string())),
                };
                if let Err(err) = result {
                    if err.is_cancellation() {
                        tracing::debug!(component = name, "Component stopped by cancellation");
                    } else {
                        tracing::error!(component = name, error = %err, "Component failed");
                        let _ = err_tx.send(err).await;
                    }
                }
            }));
        };

        let job_token = self.root.child_token();
        spawn("ddl-job-puller", job_token.clone(), {
            let token = job_token.clone();
            tokio::spawn(async move {
                job_puller
                    .run(sorted_ddl_rx, token)
                    .await
                    .map_err(ReplicationError::from)
            })
        });

        let ddl_token = self.root.child_token();
        spawn("ddl-puller", ddl_token.clone(), {
            let token = ddl_token.clone();
            let puller = Arc::clone(&ddl_puller);
            tokio::spawn(async move {
                puller
                    .run(ddl_entries_rx, token)
                    .await
                    .map_err(ReplicationError::from)
            })
        });

        let source_token = self.root.child_token();
        spawn("source-manager", source_token.clone(), {
            let token = source_token.clone();
            let manager = Arc::clone(&source_manager);
            tokio::spawn(async move {
                manager.run(token).await.map_err(ReplicationError::from)
            })
        });

        for (idx, worker) in sink_workers.into_iter().enumerate() {
            let sink_token = self.root.child_token();
            spawn("sink-worker", sink_token.clone(), {
                let token = sink_token.clone();
                tokio::spawn(async move { run_sink_worker(idx, worker, token).await })
            });
        }
        drop(spawn);
        drop(err_tx);

        // Park until a component fails or every error sender is gone
        // (orderly completion).
        let first_error = tokio::select! {
            biased;
            () = self.root.cancelled() => None,
            err = err_rx.recv() => err,
        };

        // Stop components in reverse startup order.
        for token in tokens.iter().rev() {
            token.cancel();
        }
        for handle in handles {
            let _ = handle.await;
        }

        let close_result = source_manager.close().map_err(ReplicationError::from);

        tracing::info!(
            changefeed = %self.cfg.changefeed,
            failed = first_error.is_some(),
            "Pipeline stopped"
        );
        match first_error {
            Some(err) => Err(err),
            None => close_result,
        }
    }
}

/// One sink worker's event loop: buffer events, flush on demand and on a
/// short interval, drain on shutdown.
async fn run_sink_worker(
    worker_id: usize,
    mut worker: SinkWorker,
    cancel: CancellationToken,
) -> Result<(), ReplicationError> {
    tracing::debug!(worker_id, "Sink worker started");
    let mut flush_timer = tokio::time::interval(SINK_FLUSH_INTERVAL);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    flush_timer.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                // Drain what is buffered before stopping.
                worker.backend.flush().await.map_err(ReplicationError::from)?;
                worker.backend.close();
                tracing::debug!(worker_id, "Sink worker stopped");
                return Ok(());
            }
            event = worker.events.recv() => {
                let Some(event) = event else {
                    worker.backend.flush().await.map_err(ReplicationError::from)?;
                    worker.backend.close();
                    return Ok(());
                };
                if worker.backend.on_txn_event(event) {
                    worker.backend.flush().await.map_err(ReplicationError::from)?;
                }
            }
            _ = flush_timer.tick() => {
                worker.backend.flush().await.map_err(ReplicationError::from)?;
            }
        }
    }
}
