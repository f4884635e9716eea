use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use chrono::Utc;
use tokio::{
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::config::TelemetrySettings;
use crate::metrics::{
    TELEMETRY_EVENTS_DROPPED_TOTAL, TELEMETRY_EVENTS_TOTAL, TELEMETRY_FLUSHES_TOTAL,
};
use crate::models::telemetry::{
    content_preview, sanitize_key, CodeEdit, EventMetadata, InputTarget, Modifiers,
    TelemetryEvent, TelemetryEventType,
};
use crate::services::api_client::AttemptApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    BatchFull,
    Timer,
    QuestionChange,
    Manual,
    Unload,
}

impl FlushTrigger {
    fn label(&self) -> &'static str {
        match self {
            FlushTrigger::BatchFull => "batch_full",
            FlushTrigger::Timer => "timer",
            FlushTrigger::QuestionChange => "question_change",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Unload => "unload",
        }
    }
}

#[derive(Default)]
struct RecorderState {
    question_id: Option<String>,
    batch: Vec<TelemetryEvent>,
    last_pointer_move: Option<Instant>,
}

/// Buffers behavioral events in memory and ships them in batches.
///
/// Input handlers never wait on the network: batches are swapped out under
/// the lock and sent from a spawned task. Failed batches are dropped, never
/// retried, so the audit trail is never duplicated or reordered.
pub struct TelemetryRecorder {
    api: Arc<dyn AttemptApi>,
    attempt_id: String,
    settings: TelemetrySettings,
    enabled: AtomicBool,
    state: Mutex<RecorderState>,
}

impl TelemetryRecorder {
    pub fn new(
        api: Arc<dyn AttemptApi>,
        attempt_id: impl Into<String>,
        settings: TelemetrySettings,
    ) -> Self {
        Self {
            api,
            attempt_id: attempt_id.into(),
            enabled: AtomicBool::new(settings.enabled),
            settings,
            state: Mutex::new(RecorderState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        tracing::debug!("Telemetry recording enabled={}", enabled);
    }

    pub fn batch_len(&self) -> usize {
        self.lock().batch.len()
    }

    pub fn question_id(&self) -> Option<String> {
        self.lock().question_id.clone()
    }

    /// Switches the active question. Whatever was captured under the previous
    /// question is flushed in the background first.
    pub fn set_question(&self, question_id: impl Into<String>) {
        let question_id = question_id.into();
        let previous = {
            let mut state = self.lock();
            if state.question_id.as_deref() == Some(question_id.as_str()) {
                return;
            }
            state.question_id = Some(question_id.clone());
            mem::take(&mut state.batch)
        };

        tracing::debug!("Telemetry question changed: question={}", question_id);
        self.spawn_flush(previous, FlushTrigger::QuestionChange);
    }

    /// Appends an event to the current batch. When the batch reaches
    /// `batch_size` it is handed to a background flush before this returns.
    pub fn queue_event(&self, event_type: TelemetryEventType, metadata: EventMetadata) {
        if !self.is_enabled() {
            return;
        }

        let full_batch = {
            let mut state = self.lock();
            let Some(question_id) = state.question_id.clone() else {
                tracing::debug!("No active question; dropping {} event", event_type.as_str());
                return;
            };

            state.batch.push(TelemetryEvent {
                event_type,
                question_id,
                timestamp: Utc::now(),
                metadata,
            });
            TELEMETRY_EVENTS_TOTAL
                .with_label_values(&[event_type.as_str()])
                .inc();

            if state.batch.len() >= self.settings.batch_size {
                Some(mem::take(&mut state.batch))
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            self.spawn_flush(batch, FlushTrigger::BatchFull);
        }
    }

    pub fn record_key_down(&self, key: &str, target: InputTarget, modifiers: Modifiers) {
        if target == InputTarget::Password {
            return;
        }
        self.queue_event(
            TelemetryEventType::Keystroke,
            EventMetadata::Key {
                key: sanitize_key(key),
                ctrl: modifiers.ctrl,
                alt: modifiers.alt,
                shift: modifiers.shift,
                meta: modifiers.meta,
            },
        );
    }

    /// Throttled to one event per `pointer_throttle_ms`
    pub fn record_pointer_move(&self, x: f64, y: f64) {
        if !self.is_enabled() {
            return;
        }

        let now = Instant::now();
        {
            let mut state = self.lock();
            if let Some(last) = state.last_pointer_move {
                if now.duration_since(last) < self.settings.pointer_throttle() {
                    return;
                }
            }
            state.last_pointer_move = Some(now);
        }

        self.queue_event(TelemetryEventType::MouseMove, EventMetadata::Pointer { x, y });
    }

    pub fn record_click(&self, x: f64, y: f64, button: u8) {
        self.queue_event(
            TelemetryEventType::MouseClick,
            EventMetadata::Click { x, y, button },
        );
    }

    pub fn record_scroll(&self, scroll_x: f64, scroll_y: f64) {
        self.queue_event(
            TelemetryEventType::MouseScroll,
            EventMetadata::Scroll { scroll_x, scroll_y },
        );
    }

    pub fn record_code_edit(&self, edit: &CodeEdit) {
        self.queue_event(
            edit.kind.event_type(),
            EventMetadata::CodeEdit {
                position: edit.position,
                length: edit.length,
                preview: content_preview(&edit.content),
            },
        );
    }

    fn take_batch(&self) -> Vec<TelemetryEvent> {
        mem::take(&mut self.lock().batch)
    }

    /// Sends the current batch and waits for the result. Returns false when a
    /// non-empty batch failed to upload (its events are gone).
    pub async fn flush_events(&self) -> bool {
        self.flush_with(FlushTrigger::Manual).await
    }

    async fn flush_with(&self, trigger: FlushTrigger) -> bool {
        let batch = self.take_batch();
        send_batch(self.api.clone(), self.attempt_id.clone(), batch, trigger).await
    }

    fn spawn_flush(&self, batch: Vec<TelemetryEvent>, trigger: FlushTrigger) {
        if batch.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(send_batch(
                    self.api.clone(),
                    self.attempt_id.clone(),
                    batch,
                    trigger,
                ));
            }
            Err(_) => {
                tracing::warn!(
                    "No async runtime available; dropping {} telemetry events",
                    batch.len()
                );
                TELEMETRY_EVENTS_DROPPED_TOTAL
                    .with_label_values(&["no_runtime"])
                    .inc_by(batch.len() as u64);
            }
        }
    }

    /// Last-chance delivery on shutdown. Uses the token-in-query endpoint and
    /// gives up after `deadline`.
    pub async fn flush_on_unload(&self, deadline: Duration) -> bool {
        let batch = self.take_batch();
        if batch.is_empty() {
            return true;
        }

        let count = batch.len();
        let delivery = tokio::time::timeout(
            deadline,
            self.api
                .beacon_audit_events(&self.attempt_id, &batch, deadline),
        )
        .await;

        let delivered = matches!(delivery, Ok(Ok(())));
        record_flush(FlushTrigger::Unload, count, delivered);
        if delivered {
            tracing::debug!("Unload flush delivered {} telemetry events", count);
        } else {
            tracing::warn!("Unload flush lost {} telemetry events", count);
        }
        delivered
    }

    /// Periodic flush loop; exits when `shutdown` flips or its sender is dropped
    pub async fn run_flush_timer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.flush_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.flush_with(FlushTrigger::Timer).await;
                }
            }
        }

        tracing::debug!("Telemetry flush timer stopped: attempt={}", self.attempt_id);
    }
}

async fn send_batch(
    api: Arc<dyn AttemptApi>,
    attempt_id: String,
    batch: Vec<TelemetryEvent>,
    trigger: FlushTrigger,
) -> bool {
    if batch.is_empty() {
        return true;
    }

    let count = batch.len();
    match api.post_audit_events(&attempt_id, &batch).await {
        Ok(()) => {
            tracing::debug!(
                "Telemetry batch delivered: attempt={}, events={}, trigger={}",
                attempt_id,
                count,
                trigger.label()
            );
            record_flush(trigger, count, true);
            true
        }
        Err(err) => {
            tracing::warn!(
                "Telemetry batch dropped: attempt={}, events={}, trigger={}, error={}",
                attempt_id,
                count,
                trigger.label(),
                err
            );
            record_flush(trigger, count, false);
            false
        }
    }
}

fn record_flush(trigger: FlushTrigger, count: usize, delivered: bool) {
    let status = if delivered { "success" } else { "error" };
    TELEMETRY_FLUSHES_TOTAL
        .with_label_values(&[trigger.label(), status])
        .inc();
    if !delivered {
        TELEMETRY_EVENTS_DROPPED_TOTAL
            .with_label_values(&["delivery_failed"])
            .inc_by(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::models::answer::SaveAnswerRequest;
    use crate::models::telemetry::CodeEditKind;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingApi {
        batches: Mutex<Vec<Vec<TelemetryEvent>>>,
        beacons: Mutex<Vec<Vec<TelemetryEvent>>>,
        fail: AtomicBool,
        hang_beacon: bool,
    }

    impl RecordingApi {
        fn batches(&self) -> Vec<Vec<TelemetryEvent>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AttemptApi for RecordingApi {
        async fn save_answer(
            &self,
            _attempt_id: &str,
            _request: &SaveAnswerRequest,
            _timeout: Duration,
        ) -> Result<(), ApiError> {
            Ok(())
        }

        async fn post_audit_events(
            &self,
            _attempt_id: &str,
            events: &[TelemetryEvent],
        ) -> Result<(), ApiError> {
            self.batches.lock().unwrap().push(events.to_vec());
            if self.fail.load(Ordering::SeqCst) {
                Err(ApiError::Connection("reset".to_string()))
            } else {
                Ok(())
            }
        }

        async fn beacon_audit_events(
            &self,
            _attempt_id: &str,
            events: &[TelemetryEvent],
            _deadline: Duration,
        ) -> Result<(), ApiError> {
            self.beacons.lock().unwrap().push(events.to_vec());
            if self.hang_beacon {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn health_check(&self) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn recorder(api: Arc<RecordingApi>) -> Arc<TelemetryRecorder> {
        let recorder = TelemetryRecorder::new(api, "attempt-1", TelemetrySettings::default());
        recorder.set_question("q-1");
        Arc::new(recorder)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn twentieth_event_triggers_exactly_one_flush() {
        let api = Arc::new(RecordingApi::default());
        let recorder = recorder(api.clone());

        for i in 0..19 {
            recorder.record_click(i as f64, 0.0, 0);
        }
        assert_eq!(recorder.batch_len(), 19);

        recorder.record_click(19.0, 0.0, 0);
        assert_eq!(recorder.batch_len(), 0);

        recorder.record_click(20.0, 0.0, 0);
        assert_eq!(recorder.batch_len(), 1);

        settle().await;
        let batches = api.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 20);
        assert_eq!(
            batches[0][0].metadata,
            EventMetadata::Click {
                x: 0.0,
                y: 0.0,
                button: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pointer_moves_are_throttled() {
        let api = Arc::new(RecordingApi::default());
        let recorder = recorder(api.clone());

        recorder.record_pointer_move(1.0, 1.0);
        tokio::time::advance(Duration::from_millis(400)).await;
        recorder.record_pointer_move(2.0, 2.0);
        assert_eq!(recorder.batch_len(), 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        recorder.record_pointer_move(3.0, 3.0);
        assert_eq!(recorder.batch_len(), 2);
    }

    #[tokio::test]
    async fn clicks_and_scrolls_are_not_throttled() {
        let api = Arc::new(RecordingApi::default());
        let recorder = recorder(api.clone());

        recorder.record_click(1.0, 1.0, 0);
        recorder.record_click(1.0, 1.0, 0);
        recorder.record_scroll(0.0, 10.0);
        recorder.record_scroll(0.0, 20.0);
        assert_eq!(recorder.batch_len(), 4);
    }

    #[tokio::test]
    async fn password_keystrokes_are_excluded() {
        let api = Arc::new(RecordingApi::default());
        let recorder = recorder(api.clone());

        recorder.record_key_down("s", InputTarget::Password, Modifiers::NONE);
        recorder.record_key_down("AudioVolumeMute", InputTarget::Text, Modifiers::NONE);
        recorder.record_key_down("x", InputTarget::CodeEditor, Modifiers::NONE);

        assert!(recorder.flush_events().await);
        let batch = &api.batches()[0];
        assert_eq!(batch.len(), 2);
        match &batch[0].metadata {
            EventMetadata::Key { key, .. } => assert_eq!(key, "AudioVolum"),
            other => panic!("unexpected metadata: {:?}", other),
        }
    }

    #[tokio::test]
    async fn code_edit_preview_is_truncated() {
        let api = Arc::new(RecordingApi::default());
        let recorder = recorder(api.clone());

        recorder.record_code_edit(&CodeEdit {
            kind: CodeEditKind::Paste,
            position: 42,
            length: 300,
            content: "y".repeat(300),
        });

        recorder.flush_events().await;
        let event = &api.batches()[0][0];
        assert_eq!(event.event_type, TelemetryEventType::CodePaste);
        match &event.metadata {
            EventMetadata::CodeEdit {
                position,
                length,
                preview,
            } => {
                assert_eq!(*position, 42);
                assert_eq!(*length, 300);
                assert_eq!(preview.chars().count(), 100);
            }
            other => panic!("unexpected metadata: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_batch_is_not_requeued() {
        let api = Arc::new(RecordingApi::default());
        api.fail.store(true, Ordering::SeqCst);
        let recorder = recorder(api.clone());

        recorder.record_scroll(0.0, 1.0);
        recorder.record_scroll(0.0, 2.0);
        assert!(!recorder.flush_events().await);
        assert_eq!(recorder.batch_len(), 0);

        api.fail.store(false, Ordering::SeqCst);
        recorder.record_scroll(0.0, 3.0);
        assert!(recorder.flush_events().await);

        let batches = api.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[tokio::test]
    async fn empty_flush_sends_nothing() {
        let api = Arc::new(RecordingApi::default());
        let recorder = recorder(api.clone());

        assert!(recorder.flush_events().await);
        assert!(api.batches().is_empty());
    }

    #[tokio::test]
    async fn question_change_flushes_previous_batch() {
        let api = Arc::new(RecordingApi::default());
        let recorder = recorder(api.clone());

        recorder.record_click(1.0, 1.0, 0);
        recorder.set_question("q-2");
        recorder.record_click(2.0, 2.0, 0);
        settle().await;

        let batches = api.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].question_id, "q-1");
        assert_eq!(recorder.batch_len(), 1);
        assert_eq!(recorder.question_id().as_deref(), Some("q-2"));
    }

    #[tokio::test]
    async fn disabled_recorder_drops_input() {
        let api = Arc::new(RecordingApi::default());
        let recorder = recorder(api.clone());
        recorder.set_enabled(false);

        recorder.record_click(1.0, 1.0, 0);
        recorder.record_pointer_move(1.0, 1.0);
        assert_eq!(recorder.batch_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_periodically() {
        let api = Arc::new(RecordingApi::default());
        let recorder = recorder(api.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timer = tokio::spawn(recorder.clone().run_flush_timer(shutdown_rx));

        recorder.record_click(1.0, 1.0, 0);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(api.batches().len(), 1);

        shutdown_tx.send(true).unwrap();
        timer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unload_flush_respects_deadline() {
        let api = Arc::new(RecordingApi {
            hang_beacon: true,
            ..Default::default()
        });
        let recorder = recorder(api.clone());
        recorder.record_click(1.0, 1.0, 0);

        let delivered = recorder.flush_on_unload(Duration::from_millis(500)).await;

        assert!(!delivered);
        assert_eq!(api.beacons.lock().unwrap().len(), 1);
        assert_eq!(recorder.batch_len(), 0);
    }
}
