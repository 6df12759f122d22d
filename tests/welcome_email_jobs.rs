mod common;

use common::*;
use filejobs::email::{WelcomeEmailProcessor, WELCOME_SUBJECT};
use filejobs::processor::JobProcessor;
use filejobs::{JobError, EMAIL_QUEUE};
use serde_json::json;
use std::sync::Arc;

fn setup(mailer: RecordingMailer) -> (Arc<CountingGateway>, Arc<RecordingMailer>, WelcomeEmailProcessor) {
    let gateway = shared(CountingGateway::default());
    gateway
        .inner
        .insert_user(user_record("u1", "a@example.com", Some("Ada")))
        .unwrap();
    let mailer = shared(mailer);
    let processor = WelcomeEmailProcessor::new(gateway.clone(), mailer.clone());
    (gateway, mailer, processor)
}

#[tokio::test]
async fn sends_exactly_one_welcome_mail() {
    let (_, mailer, processor) = setup(RecordingMailer::new());

    processor
        .process(&job(EMAIL_QUEUE, json!({ "userId": "u1" })))
        .await
        .unwrap();

    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "a@example.com");
    assert_eq!(sent[0].subject, WELCOME_SUBJECT);
    assert_eq!(sent[0].from, "noreply@files.example");
    assert!(sent[0].html_body.contains("Hello Ada,"));
}

#[tokio::test]
async fn missing_user_id_fails_before_lookup_or_dispatch() {
    let (gateway, mailer, processor) = setup(RecordingMailer::new());

    for payload in [json!({}), json!({ "userId": null }), json!({ "userId": ["u1"] })] {
        let err = processor.process(&job(EMAIL_QUEUE, payload)).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)), "got {err}");
    }

    assert_eq!(gateway.lookups(), 0);
    assert!(mailer.sent().is_empty());
}

#[tokio::test]
async fn unknown_user_is_not_found_and_sends_nothing() {
    let (_, mailer, processor) = setup(RecordingMailer::new());

    let err = processor
        .process(&job(EMAIL_QUEUE, json!({ "userId": "ghost" })))
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::NotFound { entity: "user", .. }), "got {err}");
    assert!(mailer.sent().is_empty());
}

#[tokio::test]
async fn dispatch_error_surfaces_as_processing_failure() {
    let (_, mailer, processor) = setup(RecordingMailer::failing("smtp relay unreachable"));

    let err = processor
        .process(&job(EMAIL_QUEUE, json!({ "userId": "u1" })))
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Processing { .. }));
    assert!(err.is_retryable());
    let report = err.report();
    assert!(report.contains("a@example.com"), "{report}");
    assert!(report.contains("smtp relay unreachable"), "{report}");
    assert_eq!(mailer.sent().len(), 1);
}

#[tokio::test]
async fn nameless_user_is_greeted_by_email() {
    let (gateway, mailer, processor) = setup(RecordingMailer::new());
    gateway
        .inner
        .insert_user(user_record("u2", "b@example.com", None))
        .unwrap();

    processor
        .process(&job(EMAIL_QUEUE, json!({ "userId": "u2" })))
        .await
        .unwrap();

    assert!(mailer.sent()[0].html_body.contains("Hello b@example.com,"));
}
