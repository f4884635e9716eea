use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One answer submission waiting for server acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub id: Uuid,
    pub attempt_id: String,
    pub question_id: String,
    pub value: serde_json::Value,
    pub time_spent: u64,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub retry_count: u32,
}

impl AnswerRecord {
    pub fn new(
        attempt_id: impl Into<String>,
        question_id: impl Into<String>,
        value: serde_json::Value,
        time_spent: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt_id: attempt_id.into(),
            question_id: question_id.into(),
            value,
            time_spent,
            captured_at: Utc::now(),
            synced: false,
            retry_count: 0,
        }
    }

    /// Still worth another delivery attempt under the given retry ceiling
    pub fn is_viable(&self, max_retry_count: u32) -> bool {
        !self.synced && self.retry_count < max_retry_count
    }

    pub fn to_request(&self) -> SaveAnswerRequest {
        SaveAnswerRequest {
            question_id: self.question_id.clone(),
            answer: self.value.clone(),
            time_spent: self.time_spent,
        }
    }
}

/// Body of `PUT /attempts/{attemptId}/answer`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveAnswerRequest {
    pub question_id: String,
    pub answer: serde_json::Value,
    pub time_spent: u64,
}

/// A record retired after exhausting its retries. Surfaced to the UI so the
/// candidate can be warned that not every answer reached the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbandonedAnswer {
    pub record_id: Uuid,
    pub question_id: String,
    pub retry_count: u32,
    pub captured_at: DateTime<Utc>,
}

impl From<&AnswerRecord> for AbandonedAnswer {
    fn from(record: &AnswerRecord) -> Self {
        Self {
            record_id: record.id,
            question_id: record.question_id.clone(),
            retry_count: record.retry_count,
            captured_at: record.captured_at,
        }
    }
}
