mod common;

use std::time::Duration;

use attempt_sync::{
    error::ApiError,
    models::{
        answer::SaveAnswerRequest,
        telemetry::{EventMetadata, TelemetryEvent, TelemetryEventType},
    },
    services::{AttemptApi, HttpAttemptApi},
};
use chrono::Utc;
use serde_json::json;

fn answer(question_id: &str) -> SaveAnswerRequest {
    SaveAnswerRequest {
        question_id: question_id.to_string(),
        answer: json!({"code": "print(42)"}),
        time_spent: 75,
    }
}

fn keystroke() -> TelemetryEvent {
    TelemetryEvent {
        event_type: TelemetryEventType::Keystroke,
        question_id: "q-1".to_string(),
        timestamp: Utc::now(),
        metadata: EventMetadata::Key {
            key: "a".to_string(),
            ctrl: false,
            alt: false,
            shift: false,
            meta: false,
        },
    }
}

#[tokio::test]
async fn test_save_answer_sends_bearer_and_camel_case_body() {
    let server = common::spawn_mock_server().await;
    let api =
        HttpAttemptApi::new(&server.base_url, Some(common::TEST_TOKEN.to_string())).unwrap();

    api.save_answer("attempt-42", &answer("q-1"), Duration::from_secs(5))
        .await
        .unwrap();

    let received = server.state.answers();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].attempt_id, "attempt-42");
    assert_eq!(
        received[0].authorization.as_deref(),
        Some("Bearer test-token")
    );
    assert_eq!(
        received[0].body,
        json!({"questionId": "q-1", "answer": {"code": "print(42)"}, "timeSpent": 75})
    );
}

#[tokio::test]
async fn test_save_answer_maps_non_2xx_to_status_error() {
    let server = common::spawn_mock_server().await;
    server.state.fail_question("q-1");
    let api = HttpAttemptApi::new(&server.base_url, None).unwrap();

    let err = api
        .save_answer("attempt-42", &answer("q-1"), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Status(503)));
}

#[tokio::test]
async fn test_save_answer_times_out() {
    let server = common::spawn_mock_server().await;
    server.state.set_answer_delay(Duration::from_millis(1_000));
    let api = HttpAttemptApi::new(&server.base_url, None).unwrap();

    let err = api
        .save_answer("attempt-42", &answer("q-1"), Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Timeout));
}

#[tokio::test]
async fn test_unreachable_server_is_connection_error() {
    // Port 9 (discard) on localhost is not listening in test environments
    let api = HttpAttemptApi::new("http://127.0.0.1:9", None).unwrap();

    let err = api
        .save_answer("attempt-42", &answer("q-1"), Duration::from_secs(2))
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Connection(_) | ApiError::Timeout));
}

#[tokio::test]
async fn test_post_audit_events_wraps_batch() {
    let server = common::spawn_mock_server().await;
    let api =
        HttpAttemptApi::new(&server.base_url, Some(common::TEST_TOKEN.to_string())).unwrap();

    api.post_audit_events("attempt-42", &[keystroke(), keystroke()])
        .await
        .unwrap();

    let batches = server.state.audit_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].body["events"].as_array().unwrap().len(), 2);
    assert_eq!(batches[0].body["events"][0]["type"], json!("keystroke"));
    assert_eq!(
        batches[0].authorization.as_deref(),
        Some("Bearer test-token")
    );
    assert!(batches[0].query.is_empty());
}

#[tokio::test]
async fn test_beacon_carries_token_in_query_only() {
    let server = common::spawn_mock_server().await;
    let api =
        HttpAttemptApi::new(&server.base_url, Some(common::TEST_TOKEN.to_string())).unwrap();

    api.beacon_audit_events("attempt-42", &[keystroke()], Duration::from_secs(1))
        .await
        .unwrap();

    let batches = server.state.audit_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0].query.get("token").map(String::as_str),
        Some(common::TEST_TOKEN)
    );
    assert!(batches[0].authorization.is_none());
}

#[tokio::test]
async fn test_health_check_follows_server_status() {
    let server = common::spawn_mock_server().await;
    let api = HttpAttemptApi::new(&server.base_url, None).unwrap();

    assert!(api.health_check().await.is_ok());

    server
        .state
        .unhealthy
        .store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(api.health_check().await.is_err());
}
