//! Dispatcher: claims queued tasks and runs execution engines under a
//! concurrency limit.
//!
//! A single long-lived loop polls the store on a ticker, acquires a
//! semaphore slot per claim, and spawns one engine per task into a
//! [`JoinSet`]. Shutdown stops claiming, fans cancellation out to every
//! in-flight engine, drains with a grace deadline, and re-queues anything
//! still `running` so a restart can pick it up with its retry budget intact.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::task::{LogLevel, TaskLogEntry, TaskStatus};
use crate::engine::{Engine, EngineDeps, EngineError};
use crate::io::store::SqliteStore;

/// How long shutdown waits for in-flight engines before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Dispatcher {
    deps: EngineDeps,
    abort_poll: Option<Duration>,
}

impl Dispatcher {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            deps,
            abort_poll: None,
        }
    }

    /// Override the engines' store-abort polling period (used by tests).
    pub fn with_abort_poll(mut self, interval: Duration) -> Self {
        self.abort_poll = Some(interval);
        self
    }

    /// Run until `shutdown` fires. On return no engine is running and no
    /// task is left in `running`.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let cfg = &self.deps.config;
        info!(
            max_concurrency = cfg.max_concurrency,
            poll_interval_secs = cfg.poll_interval_secs,
            "dispatcher started"
        );

        self.recovery_sweep().await;

        let semaphore = Arc::new(Semaphore::new(cfg.max_concurrency));
        let mut engines: JoinSet<(String, Result<TaskStatus, EngineError>)> = JoinSet::new();
        let mut tick = tokio::time::interval(cfg.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, stopping dispatch");
                    break;
                }
                _ = tick.tick() => {
                    reap_finished(&mut engines);
                    self.claim_batch(&semaphore, &shutdown, &mut engines).await;
                }
            }
        }

        self.drain(&mut engines).await;
        self.requeue_in_flight().await;
        info!("dispatcher stopped");
        Ok(())
    }

    /// Claim as many queued tasks as there are free slots this tick.
    async fn claim_batch(
        &self,
        semaphore: &Arc<Semaphore>,
        shutdown: &CancellationToken,
        engines: &mut JoinSet<(String, Result<TaskStatus, EngineError>)>,
    ) {
        loop {
            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                // All slots busy; this tick is a no-op.
                return;
            };
            let task = match self.deps.store.claim_next().await {
                Ok(Some(task)) => task,
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "claim failed");
                    return;
                }
            };

            debug!(id = %task.id, "claimed task");
            append_log(
                &self.deps.store,
                &task.id,
                LogLevel::Info,
                "task claimed for execution",
            )
            .await;

            let mut engine = Engine::new(self.deps.clone());
            if let Some(interval) = self.abort_poll {
                engine = engine.with_abort_poll(interval);
            }
            let cancel = shutdown.child_token();
            let task_id = task.id.clone();
            engines.spawn(async move {
                let result = engine.run(task, cancel).await;
                drop(permit);
                (task_id, result)
            });
        }
    }

    /// Startup recovery: tasks stuck in `running` past the liveness threshold
    /// are re-queued with their attempt counters intact.
    async fn recovery_sweep(&self) {
        let threshold = self.deps.config.liveness_threshold();
        match self.deps.store.requeue_stuck(threshold).await {
            Ok(recovered) => {
                for task in &recovered {
                    warn!(id = %task.id, "recovered stuck task");
                    append_log(
                        &self.deps.store,
                        &task.id,
                        LogLevel::Warn,
                        "task was stuck in running; re-queued by recovery sweep",
                    )
                    .await;
                }
            }
            Err(err) => warn!(error = %err, "recovery sweep failed"),
        }
    }

    /// Give in-flight engines a grace window to observe cancellation and
    /// clean up, then abort stragglers.
    async fn drain(&self, engines: &mut JoinSet<(String, Result<TaskStatus, EngineError>)>) {
        if engines.is_empty() {
            return;
        }
        info!(count = engines.len(), "waiting for in-flight engines");
        let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = engines.join_next() => {
                    match joined {
                        Some(result) => log_engine_result(result),
                        None => break,
                    }
                }
                _ = &mut deadline => {
                    warn!(remaining = engines.len(), "drain deadline elapsed, aborting engines");
                    engines.abort_all();
                    while let Some(result) = engines.join_next().await {
                        if let Err(err) = result {
                            if !err.is_cancelled() {
                                warn!(error = %err, "engine task error during abort");
                            }
                        }
                    }
                    break;
                }
            }
        }
    }

    /// Re-queue every task still `running` after drain so the shutdown
    /// postcondition holds and a restart resumes the work.
    async fn requeue_in_flight(&self) {
        match self.deps.store.requeue_stuck(Duration::ZERO).await {
            Ok(requeued) => {
                for task in &requeued {
                    append_log(
                        &self.deps.store,
                        &task.id,
                        LogLevel::Info,
                        "dispatcher shut down mid-run; task re-queued",
                    )
                    .await;
                }
            }
            Err(err) => warn!(error = %err, "shutdown requeue failed"),
        }
    }
}

fn reap_finished(engines: &mut JoinSet<(String, Result<TaskStatus, EngineError>)>) {
    while let Some(result) = engines.try_join_next() {
        log_engine_result(result);
    }
}

fn log_engine_result(
    result: Result<(String, Result<TaskStatus, EngineError>), tokio::task::JoinError>,
) {
    match result {
        Ok((id, Ok(status))) => debug!(id = %id, status = %status, "engine finished"),
        Ok((id, Err(EngineError::Cancelled))) => debug!(id = %id, "engine cancelled"),
        Ok((id, Err(err))) => warn!(id = %id, error = %err, "engine failed"),
        Err(err) if err.is_cancelled() => {}
        Err(err) => warn!(error = %err, "engine task panicked"),
    }
}

async fn append_log(store: &Arc<SqliteStore>, task_id: &str, level: LogLevel, message: &str) {
    let entry = TaskLogEntry {
        task_id: task_id.to_string(),
        level,
        message: message.to_string(),
        timestamp: Utc::now(),
    };
    if let Err(err) = store.append_log(&entry).await {
        warn!(error = %err, "failed to append task log");
    }
}
