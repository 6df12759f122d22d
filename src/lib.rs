use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod gateway;
pub mod mail;
pub mod payload;
pub mod processor;
pub mod queue;
pub mod server;
pub mod telemetry;
pub mod thumbnail;
pub mod worker;

pub use error::JobError;
pub use payload::Identifier;

/// Queue consumed by the thumbnail processor.
pub const THUMBNAIL_QUEUE: &str = "thumbnail generation";

/// Queue consumed by the welcome email processor.
pub const EMAIL_QUEUE: &str = "email sending";

/// Key-value body of a job, as submitted by the producer.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub queue: String,
    pub payload: Payload,
}

impl JobRequest {
    pub fn new(queue: impl Into<String>, payload: Payload) -> Self {
        JobRequest {
            queue: queue.into(),
            payload,
        }
    }

    pub fn thumbnail(file_id: &Identifier, user_id: &Identifier) -> Self {
        let payload = payload::ThumbnailJobPayload {
            file_id: file_id.clone(),
            user_id: user_id.clone(),
        };
        Self::new(THUMBNAIL_QUEUE, payload.into_payload())
    }

    pub fn welcome_email(user_id: &Identifier) -> Self {
        let payload = payload::WelcomeEmailJobPayload {
            user_id: user_id.clone(),
        };
        Self::new(EMAIL_QUEUE, payload.into_payload())
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload: Payload,
    pub status: Status,
    /// Number of deliveries so far, including the one in progress.
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "queue_status_enum", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Processing,
    Completed,
    /// Dead-letter state: retries exhausted or the job can never succeed.
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Queued => "queued",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        };
        f.write_str(name)
    }
}
