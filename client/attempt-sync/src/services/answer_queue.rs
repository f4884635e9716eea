use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use uuid::Uuid;

use crate::error::StorageError;
use crate::metrics::{ANSWERS_PENDING, QUEUE_STORAGE_ERRORS_TOTAL};
use crate::models::answer::{AbandonedAnswer, AnswerRecord};

const KEY_PREFIX: &str = "pending_answers_";

const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Durable key/value backend for the answer queue. Every write replaces the
/// whole list stored under `key`.
pub trait QueueStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<AnswerRecord>>, StorageError>;
    fn write(&self, key: &str, records: &[AnswerRecord]) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// One JSON file per key inside `dir`
#[derive(Debug, Clone)]
pub struct FileQueueStorage {
    dir: PathBuf,
}

impl FileQueueStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl QueueStorage for FileQueueStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<AnswerRecord>>, StorageError> {
        let path = self.path_for(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    fn write(&self, key: &str, records: &[AnswerRecord]) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        let payload = serde_json::to_vec(records)?;

        // Write-then-rename so a crash mid-write never leaves a truncated queue
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueueStorage {
    entries: Mutex<HashMap<String, Vec<AnswerRecord>>>,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Vec<AnswerRecord>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl QueueStorage for MemoryQueueStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<AnswerRecord>>, StorageError> {
        Ok(self.entries().get(key).cloned())
    }

    fn write(&self, key: &str, records: &[AnswerRecord]) -> Result<(), StorageError> {
        self.entries().insert(key.to_string(), records.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries().remove(key);
        Ok(())
    }
}

/// Storage key for one attempt. The id is percent-encoded, which keeps it
/// usable as a file name and maps distinct ids to distinct keys.
pub fn storage_key(attempt_id: &str) -> String {
    format!(
        "{}{}",
        KEY_PREFIX,
        utf8_percent_encode(attempt_id, KEY_ENCODE_SET)
    )
}

/// Result of delivering one record during a sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Failed,
}

/// Ordered list of unconfirmed answers for one attempt.
///
/// The in-memory list is authoritative for the running session; storage is a
/// best-effort mirror rewritten in full on every mutation. Storage failures are
/// logged and swallowed.
///
/// Writes are synchronous and happen under the list lock, so callers on the
/// async runtime block a worker thread for one small file write per mutation.
/// The list holds one attempt's unsynced answers, typically a handful of
/// records.
pub struct DurableAnswerQueue {
    storage: Arc<dyn QueueStorage>,
    attempt_id: String,
    key: String,
    records: Mutex<Vec<AnswerRecord>>,
}

impl DurableAnswerQueue {
    /// Opens the queue for `attempt_id`, picking up anything a previous
    /// process left behind.
    pub fn open(storage: Arc<dyn QueueStorage>, attempt_id: impl Into<String>) -> Self {
        let attempt_id = attempt_id.into();
        let key = storage_key(&attempt_id);

        let queue = Self {
            storage,
            attempt_id,
            key,
            records: Mutex::new(Vec::new()),
        };

        let restored = queue.load();
        if !restored.is_empty() {
            tracing::info!(
                "Restored {} queued answers for attempt={}",
                restored.len(),
                queue.attempt_id
            );
        }
        *queue.lock() = restored;
        queue.update_gauge();
        queue
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn storage_key(&self) -> &str {
        &self.key
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AnswerRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads the persisted list. Unreadable storage yields an empty list.
    pub fn load(&self) -> Vec<AnswerRecord> {
        match self.storage.read(&self.key) {
            Ok(Some(records)) => {
                let total = records.len();
                let scoped: Vec<AnswerRecord> = records
                    .into_iter()
                    .filter(|record| record.attempt_id == self.attempt_id)
                    .collect();
                if scoped.len() != total {
                    tracing::warn!(
                        "Ignoring {} persisted answers belonging to other attempts (key={})",
                        total - scoped.len(),
                        self.key
                    );
                }
                scoped
            }
            Ok(None) => Vec::new(),
            Err(err) => {
                QUEUE_STORAGE_ERRORS_TOTAL.with_label_values(&["read"]).inc();
                tracing::warn!("Failed to load answer queue (key={}): {}", self.key, err);
                Vec::new()
            }
        }
    }

    /// Rewrites the persisted list. Returns false when storage rejected the write.
    pub fn persist(&self, records: &[AnswerRecord]) -> bool {
        let result = if records.is_empty() {
            self.storage.remove(&self.key)
        } else {
            self.storage.write(&self.key, records)
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                QUEUE_STORAGE_ERRORS_TOTAL.with_label_values(&["write"]).inc();
                tracing::warn!(
                    "Failed to persist answer queue (key={}, records={}): {}",
                    self.key,
                    records.len(),
                    err
                );
                false
            }
        }
    }

    /// Appends a fresh copy of `record`. Never deduplicates by question: every
    /// captured value is kept and delivered in order.
    pub fn enqueue(&self, mut record: AnswerRecord) {
        record.synced = false;
        record.retry_count = 0;

        let mut records = self.lock();
        tracing::debug!(
            "Queueing answer: attempt={}, question={}, position={}",
            record.attempt_id,
            record.question_id,
            records.len()
        );
        records.push(record);
        self.persist(&records);
        ANSWERS_PENDING.set(records.iter().filter(|r| !r.synced).count() as i64);
    }

    pub fn pending_count(&self) -> usize {
        self.lock().iter().filter(|record| !record.synced).count()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<AnswerRecord> {
        self.lock().clone()
    }

    /// Records still worth a delivery attempt, in enqueue order
    pub fn viable(&self, max_retry_count: u32) -> Vec<AnswerRecord> {
        self.lock()
            .iter()
            .filter(|record| record.is_viable(max_retry_count))
            .cloned()
            .collect()
    }

    /// Applies the results of a sync pass, then persists only records that are
    /// still unsynced and under the retry ceiling. Records enqueued while the
    /// pass was in flight have no result and are kept untouched.
    ///
    /// Returns the records retired for exhausting their retries.
    pub fn apply_pass(
        &self,
        results: &[(Uuid, Delivery)],
        max_retry_count: u32,
    ) -> Vec<AbandonedAnswer> {
        let results: HashMap<Uuid, Delivery> = results.iter().copied().collect();

        let mut records = self.lock();
        for record in records.iter_mut() {
            match results.get(&record.id) {
                Some(Delivery::Delivered) => record.synced = true,
                Some(Delivery::Failed) => record.retry_count += 1,
                None => {}
            }
        }

        let mut abandoned = Vec::new();
        records.retain(|record| {
            if record.synced {
                return false;
            }
            if record.retry_count >= max_retry_count {
                abandoned.push(AbandonedAnswer::from(record));
                return false;
            }
            true
        });

        self.persist(&records);
        ANSWERS_PENDING.set(records.len() as i64);
        abandoned
    }

    /// Drops the attempt's persisted queue entirely
    pub fn purge(&self) {
        let mut records = self.lock();
        if !records.is_empty() {
            tracing::warn!(
                "Purging {} unsynced answers for attempt={}",
                records.len(),
                self.attempt_id
            );
        }
        records.clear();
        if let Err(err) = self.storage.remove(&self.key) {
            QUEUE_STORAGE_ERRORS_TOTAL.with_label_values(&["remove"]).inc();
            tracing::warn!("Failed to purge answer queue (key={}): {}", self.key, err);
        }
        ANSWERS_PENDING.set(0);
    }

    fn update_gauge(&self) {
        ANSWERS_PENDING.set(self.pending_count() as i64);
    }
}
