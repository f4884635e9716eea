use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tokio::{
    sync::{mpsc, watch},
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::config::SyncSettings;
use crate::metrics::{
    ANSWERS_ABANDONED_TOTAL, ANSWERS_QUEUED_TOTAL, ANSWER_SAVES_TOTAL, SYNC_PASSES_TOTAL,
};
use crate::models::answer::{AbandonedAnswer, AnswerRecord};
use crate::models::sync::{SkipReason, SyncOutcome, SyncReport, SyncState, SyncTrigger};
use crate::services::answer_queue::{Delivery, DurableAnswerQueue};
use crate::services::api_client::AttemptApi;
use crate::services::network_monitor::NetworkMonitor;

/// Clears the busy flag when a pass ends, including when the pass future is
/// dropped mid-flight.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-question bookkeeping for online saves. `captured` counts every value
/// seen for the question; `in_flight` counts direct saves awaiting a response.
#[derive(Debug, Default)]
struct QuestionSaves {
    captured: u64,
    in_flight: usize,
}

type QuestionTable = Mutex<HashMap<String, QuestionSaves>>;

fn lock_questions(questions: &QuestionTable) -> MutexGuard<'_, HashMap<String, QuestionSaves>> {
    questions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases a question's in-flight slot when the direct save finishes or is
/// dropped.
struct InFlightSave<'a> {
    questions: &'a QuestionTable,
    question_id: &'a str,
}

impl Drop for InFlightSave<'_> {
    fn drop(&mut self) {
        if let Some(entry) = lock_questions(self.questions).get_mut(self.question_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }
}

enum SaveRoute {
    Queued,
    Send { generation: u64 },
}

/// Delivers answers to the server: optimistically on every change, and by
/// draining the durable queue whenever connectivity allows.
pub struct SyncScheduler {
    api: Arc<dyn AttemptApi>,
    queue: Arc<DurableAnswerQueue>,
    monitor: NetworkMonitor,
    settings: SyncSettings,
    syncing: AtomicBool,
    questions: QuestionTable,
    abandoned: Mutex<Vec<AbandonedAnswer>>,
    state_tx: watch::Sender<SyncState>,
    trigger_tx: mpsc::UnboundedSender<SyncTrigger>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncTrigger>>>,
}

impl SyncScheduler {
    pub fn new(
        api: Arc<dyn AttemptApi>,
        queue: Arc<DurableAnswerQueue>,
        monitor: NetworkMonitor,
        settings: SyncSettings,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let initial = SyncState {
            is_online: monitor.is_online(),
            pending_sync: queue.pending_count(),
            is_syncing: false,
            abandoned: 0,
        };
        let (state_tx, _) = watch::channel(initial);

        Self {
            api,
            queue,
            monitor,
            settings,
            syncing: AtomicBool::new(false),
            questions: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(Vec::new()),
            state_tx,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }
    }

    pub fn queue(&self) -> &Arc<DurableAnswerQueue> {
        &self.queue
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SyncState {
        SyncState {
            is_online: self.monitor.is_online(),
            pending_sync: self.queue.pending_count(),
            is_syncing: self.is_syncing(),
            abandoned: self.abandoned_lock().len(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn abandoned_answers(&self) -> Vec<AbandonedAnswer> {
        self.abandoned_lock().clone()
    }

    fn abandoned_lock(&self) -> MutexGuard<'_, Vec<AbandonedAnswer>> {
        self.abandoned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_state(&self) {
        let next = self.state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Asks the worker loop for a pass. No-op when the worker is gone.
    pub fn request_sync(&self) {
        if self.trigger_tx.send(SyncTrigger::Manual).is_err() {
            tracing::debug!("Sync worker not running; manual sync request dropped");
        }
    }

    /// Primary save path, called on every answer change. Returns true only when
    /// the server acknowledged the value; otherwise the value is in the durable
    /// queue, or was superseded by a newer value for the same question.
    pub async fn attempt_online_save(
        &self,
        question_id: &str,
        value: serde_json::Value,
        time_spent: u64,
    ) -> bool {
        let record = AnswerRecord::new(self.queue.attempt_id(), question_id, value, time_spent);

        // Routing and enqueueing happen under the question lock so that values
        // for one question enter the queue in capture order.
        let route = {
            let mut questions = lock_questions(&self.questions);
            let entry = questions.entry(question_id.to_string()).or_default();
            entry.captured += 1;

            if !self.monitor.is_online() {
                tracing::debug!(
                    "Offline, queueing answer without network attempt: question={}",
                    question_id
                );
                ANSWER_SAVES_TOTAL
                    .with_label_values(&["online", "skipped_offline"])
                    .inc();
                self.enqueue(record.clone(), "offline");
                SaveRoute::Queued
            } else if entry.in_flight > 0 || self.has_pending_for(question_id) {
                // Sending directly would race the older value still on its way
                tracing::debug!(
                    "Answer queued behind earlier values for question={}",
                    question_id
                );
                ANSWER_SAVES_TOTAL
                    .with_label_values(&["online", "queued_behind"])
                    .inc();
                self.enqueue(record.clone(), "ordering");
                SaveRoute::Queued
            } else {
                entry.in_flight += 1;
                SaveRoute::Send {
                    generation: entry.captured,
                }
            }
        };

        let generation = match route {
            SaveRoute::Queued => {
                if self.monitor.is_online() {
                    self.request_sync();
                }
                return false;
            }
            SaveRoute::Send { generation } => generation,
        };

        let _in_flight = InFlightSave {
            questions: &self.questions,
            question_id,
        };

        match self
            .api
            .save_answer(
                &record.attempt_id,
                &record.to_request(),
                self.settings.online_save_timeout(),
            )
            .await
        {
            Ok(()) => {
                ANSWER_SAVES_TOTAL
                    .with_label_values(&["online", "success"])
                    .inc();
                tracing::debug!("Answer saved online: question={}", question_id);
                true
            }
            Err(err) => {
                let questions = lock_questions(&self.questions);
                let superseded = questions
                    .get(question_id)
                    .is_some_and(|entry| entry.captured > generation);

                if superseded {
                    ANSWER_SAVES_TOTAL
                        .with_label_values(&["online", "superseded"])
                        .inc();
                    tracing::debug!(
                        "Online save failed but a newer value is already queued: question={}, error={}",
                        question_id,
                        err
                    );
                } else {
                    ANSWER_SAVES_TOTAL
                        .with_label_values(&["online", "error"])
                        .inc();
                    tracing::warn!(
                        "Online save failed, answer queued: question={}, error={}",
                        question_id,
                        err
                    );
                    self.enqueue(record, err.label());
                }
                false
            }
        }
    }

    fn questions_in_flight(&self) -> HashSet<String> {
        lock_questions(&self.questions)
            .iter()
            .filter(|(_, entry)| entry.in_flight > 0)
            .map(|(question_id, _)| question_id.clone())
            .collect()
    }

    fn has_pending_for(&self, question_id: &str) -> bool {
        self.queue
            .viable(self.settings.max_retry_count)
            .iter()
            .any(|record| record.question_id == question_id)
    }

    fn enqueue(&self, record: AnswerRecord, reason: &str) {
        ANSWERS_QUEUED_TOTAL.with_label_values(&[reason]).inc();
        self.queue.enqueue(record);
        self.publish_state();
    }

    /// One pass over the durable queue. Skipped without side effects when a
    /// pass is already in flight or the client is offline.
    pub async fn sync_all(&self) -> SyncOutcome {
        let Some(guard) = BusyGuard::acquire(&self.syncing) else {
            tracing::debug!("Sync pass already in flight; skipping");
            return self.record_outcome(SyncOutcome::Skipped(SkipReason::AlreadySyncing));
        };

        if !self.monitor.is_online() {
            drop(guard);
            return self.record_outcome(SyncOutcome::Skipped(SkipReason::Offline));
        }

        self.publish_state();

        let max_retry_count = self.settings.max_retry_count;
        let candidates = self.queue.viable(max_retry_count);
        tracing::info!("Sync pass started: {} queued answers", candidates.len());

        let mut report = SyncReport::default();
        let mut results = Vec::with_capacity(candidates.len());
        // A direct save still in flight may land after anything sent now
        let mut blocked_questions = self.questions_in_flight();

        for record in candidates {
            if blocked_questions.contains(&record.question_id) {
                report.held_back += 1;
                continue;
            }

            if !self.monitor.is_online() {
                tracing::info!("Went offline mid-pass; remaining answers wait for reconnect");
                break;
            }

            report.attempted += 1;
            match self
                .api
                .save_answer(
                    &record.attempt_id,
                    &record.to_request(),
                    self.settings.sync_timeout(),
                )
                .await
            {
                Ok(()) => {
                    ANSWER_SAVES_TOTAL
                        .with_label_values(&["sync", "success"])
                        .inc();
                    tracing::debug!(
                        "Queued answer delivered: question={}, record={}",
                        record.question_id,
                        record.id
                    );
                    report.synced += 1;
                    results.push((record.id, Delivery::Delivered));
                }
                Err(err) => {
                    ANSWER_SAVES_TOTAL
                        .with_label_values(&["sync", "error"])
                        .inc();
                    tracing::warn!(
                        "Queued answer delivery failed: question={}, retry={}, error={}",
                        record.question_id,
                        record.retry_count + 1,
                        err
                    );
                    report.failed += 1;
                    results.push((record.id, Delivery::Failed));
                    blocked_questions.insert(record.question_id);
                }
            }
        }

        let abandoned = self.queue.apply_pass(&results, max_retry_count);
        if !abandoned.is_empty() {
            for lost in &abandoned {
                tracing::error!(
                    "Answer could not be saved after {} attempts and was discarded: question={}, captured_at={}",
                    lost.retry_count,
                    lost.question_id,
                    lost.captured_at
                );
            }
            ANSWERS_ABANDONED_TOTAL.inc_by(abandoned.len() as u64);
            self.abandoned_lock().extend(abandoned.iter().cloned());
        }

        report.abandoned = abandoned;
        report.remaining = self.queue.pending_count();

        drop(guard);
        self.publish_state();

        tracing::info!(
            "Sync pass finished: synced={}, failed={}, held_back={}, abandoned={}, remaining={}",
            report.synced,
            report.failed,
            report.held_back,
            report.abandoned.len(),
            report.remaining
        );

        self.record_outcome(SyncOutcome::Completed(report))
    }

    fn record_outcome(&self, outcome: SyncOutcome) -> SyncOutcome {
        SYNC_PASSES_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();
        outcome
    }

    /// Worker loop: a pass on every offline→online transition, on each timer
    /// tick while answers are pending, and on manual requests. Exits when
    /// `shutdown` flips or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut triggers) = self
            .trigger_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            tracing::warn!("Sync worker already started for attempt={}", self.queue.attempt_id());
            return;
        };

        let mut network = self.monitor.subscribe();
        let period = self.settings.sync_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Sync worker started: attempt={}, interval={}s",
            self.queue.attempt_id(),
            period.as_secs()
        );

        // Answers left behind by a previous process
        if self.monitor.is_online() && self.queue.pending_count() > 0 {
            self.sync_all().await;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = network.borrow_and_update().is_online();
                    self.publish_state();
                    if online {
                        self.handle_trigger(SyncTrigger::CameOnline).await;
                    }
                }
                _ = ticker.tick() => {
                    if self.monitor.is_online() && self.queue.pending_count() > 0 {
                        self.handle_trigger(SyncTrigger::Timer).await;
                    }
                }
                Some(trigger) = triggers.recv() => {
                    self.handle_trigger(trigger).await;
                }
            }
        }

        tracing::info!("Sync worker stopped: attempt={}", self.queue.attempt_id());
    }

    async fn handle_trigger(&self, trigger: SyncTrigger) {
        tracing::debug!("Sync triggered: {:?}", trigger);
        self.sync_all().await;
    }
}
