use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::{NotificationOutbox, OutboxError, SenderIdentity};

/// Totals for one sweep over every tenant with pending work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPass {
    pub requeued: usize,
    pub tenants: usize,
    pub sent: usize,
    pub failed: usize,
}

pub struct OutboxWorker;

impl OutboxWorker {
    /// Requeue stale claims, then run one batch per tenant with eligible
    /// rows. A tenant whose batch fails is logged and skipped.
    pub async fn run_once(
        outbox: &NotificationOutbox,
        sender: &SenderIdentity,
    ) -> Result<WorkerPass, OutboxError> {
        let mut pass = WorkerPass {
            requeued: outbox.requeue_stale().await?,
            ..WorkerPass::default()
        };

        let limit = outbox.settings().batch_limit;
        for tenant_id in outbox.tenants_with_work().await? {
            match outbox.process_batch(&tenant_id, sender, limit).await {
                Ok(outcome) => {
                    pass.tenants += 1;
                    pass.sent += outcome.sent;
                    pass.failed += outcome.failed;
                }
                Err(e) => tracing::error!("outbox batch for tenant {tenant_id} failed: {e}"),
            }
        }
        Ok(pass)
    }

    /// Spawn a background task that sweeps the outbox every `poll_interval`
    /// until the returned handle is shut down.
    pub fn start(
        outbox: NotificationOutbox,
        sender: SenderIdentity,
        poll_interval: Duration,
    ) -> WorkerHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            tracing::info!("outbox worker started, polling every {poll_interval:?}");
            let mut interval = time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        match Self::run_once(&outbox, &sender).await {
                            Ok(pass) if pass.sent + pass.failed > 0 => {
                                tracing::debug!(
                                    "outbox pass: {} tenants, {} sent, {} failed",
                                    pass.tenants, pass.sent, pass.failed
                                );
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!("outbox pass failed: {e}"),
                        }
                    }
                }
            }
            tracing::info!("outbox worker stopped");
        });

        WorkerHandle {
            stop: Some(stop_tx),
            join,
        }
    }
}

pub struct WorkerHandle {
    stop: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop after the current pass completes and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.join).await {
            tracing::warn!("outbox worker ended abnormally: {e}");
        }
    }
}
