use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle};

use crate::config::Config;
use crate::models::answer::AbandonedAnswer;
use crate::models::sync::{SyncOutcome, SyncState};
use crate::services::{
    answer_queue::{DurableAnswerQueue, QueueStorage},
    api_client::AttemptApi,
    network_monitor::{HealthProbe, NetworkMonitor},
    sync_scheduler::SyncScheduler,
    telemetry_recorder::TelemetryRecorder,
};

/// Everything that lives for exactly one attempt: the durable answer queue,
/// its scheduler, the telemetry recorder and their background tasks.
pub struct AttemptSession {
    attempt_id: String,
    config: Config,
    monitor: NetworkMonitor,
    scheduler: Arc<SyncScheduler>,
    recorder: Arc<TelemetryRecorder>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    probe: Option<JoinHandle<()>>,
}

impl AttemptSession {
    /// Must be called from within a tokio runtime; spawns the sync worker, the
    /// telemetry flush timer and, when enabled, the health probe.
    pub fn start(
        config: Config,
        api: Arc<dyn AttemptApi>,
        storage: Arc<dyn QueueStorage>,
        monitor: NetworkMonitor,
        attempt_id: impl Into<String>,
    ) -> Self {
        let attempt_id = attempt_id.into();
        tracing::info!(
            "Starting attempt session: attempt={}, online={}",
            attempt_id,
            monitor.is_online()
        );

        let queue = Arc::new(DurableAnswerQueue::open(storage, attempt_id.clone()));
        let scheduler = Arc::new(SyncScheduler::new(
            api.clone(),
            queue,
            monitor.clone(),
            config.sync.clone(),
        ));
        let recorder = Arc::new(TelemetryRecorder::new(
            api.clone(),
            attempt_id.clone(),
            config.telemetry.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = vec![
            tokio::spawn(scheduler.clone().run(shutdown_rx.clone())),
            tokio::spawn(recorder.clone().run_flush_timer(shutdown_rx)),
        ];

        let probe = config.health.enabled.then(|| {
            HealthProbe::spawn(
                monitor.clone(),
                api,
                Duration::from_secs(config.health.interval_secs),
            )
        });

        Self {
            attempt_id,
            config,
            monitor,
            scheduler,
            recorder,
            shutdown_tx,
            workers,
            probe,
        }
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn recorder(&self) -> &Arc<TelemetryRecorder> {
        &self.recorder
    }

    /// Saves the latest value for a question. False means "saved offline":
    /// the value waits in the durable queue.
    pub async fn save_answer(
        &self,
        question_id: &str,
        value: serde_json::Value,
        time_spent: u64,
    ) -> bool {
        self.scheduler
            .attempt_online_save(question_id, value, time_spent)
            .await
    }

    pub async fn sync_now(&self) -> SyncOutcome {
        self.scheduler.sync_all().await
    }

    pub fn set_question(&self, question_id: &str) {
        self.recorder.set_question(question_id);
    }

    pub fn state(&self) -> SyncState {
        self.scheduler.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.scheduler.subscribe_state()
    }

    pub fn abandoned_answers(&self) -> Vec<AbandonedAnswer> {
        self.scheduler.abandoned_answers()
    }

    /// Tears the session down: stops background tasks, makes one
    /// deadline-bounded attempt to ship buffered telemetry and, when online with
    /// answers pending, starts a final sync pass without waiting for it. Queued
    /// answers stay on disk for the next session of this attempt.
    pub async fn end(mut self) -> SyncState {
        self.stop().await;

        let state = self.scheduler.state();
        if state.is_online && state.pending_sync > 0 {
            let scheduler = self.scheduler.clone();
            let deadline = self.config.sync.sync_timeout();
            tokio::spawn(async move {
                if tokio::time::timeout(deadline, scheduler.sync_all())
                    .await
                    .is_err()
                {
                    tracing::debug!("Final sync pass cut off; answers stay queued");
                }
            });
        }
        state
    }

    /// Ends the attempt for good. After a final sync pass the persisted queue
    /// is purged, but only when every answer reached the server; otherwise it
    /// is kept so nothing is dropped silently.
    pub async fn complete(mut self) -> SyncState {
        self.stop().await;

        // One last pass while online; skipped without side effects otherwise
        self.scheduler.sync_all().await;

        let queue = self.scheduler.queue();
        if queue.pending_count() == 0 {
            queue.purge();
        } else {
            tracing::warn!(
                "Attempt completed with {} answers still unsynced: attempt={}",
                queue.pending_count(),
                self.attempt_id
            );
        }
        self.scheduler.state()
    }

    async fn stop(&mut self) {
        if let Some(probe) = self.probe.take() {
            probe.abort();
            let _ = probe.await;
        }

        // Workers finish the pass or flush they are in, up to the unload deadline
        let _ = self.shutdown_tx.send(true);
        let deadline = self.config.telemetry.unload_deadline();
        for mut worker in self.workers.drain(..) {
            if tokio::time::timeout(deadline, &mut worker).await.is_err() {
                tracing::warn!(
                    "Background worker did not stop within {:?}: attempt={}",
                    deadline,
                    self.attempt_id
                );
                worker.abort();
                let _ = worker.await;
            }
        }

        self.recorder.flush_on_unload(deadline).await;

        tracing::info!(
            "Attempt session ended: attempt={}, pending={}",
            self.attempt_id,
            self.scheduler.queue().pending_count()
        );
    }
}

impl Drop for AttemptSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers.iter().chain(&self.probe) {
            worker.abort();
        }
    }
}
