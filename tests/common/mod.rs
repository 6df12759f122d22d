#![allow(dead_code)]

use anyhow::Error;
use async_trait::async_trait;
use chrono::Utc;
use filejobs::gateway::{DataGateway, FileRecord, MemoryGateway, UserRecord};
use filejobs::mail::{MailError, Mailer, Message};
use filejobs::thumbnail::{ImageThumbnailer, ThumbnailError, ThumbnailGenerator};
use filejobs::{Identifier, Job, Payload, Status};
use image::{ImageFormat, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub fn id(raw: &str) -> Identifier {
    Identifier::parse(raw).unwrap()
}

pub fn job(queue: &str, payload: serde_json::Value) -> Job {
    let payload: Payload = match payload {
        serde_json::Value::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    };
    Job {
        id: Uuid::new_v4(),
        queue: queue.to_string(),
        payload,
        status: Status::Processing,
        attempts: 1,
        max_attempts: 3,
        last_error: None,
        created_at: Utc::now(),
        run_at: Utc::now(),
        started_at: Some(Utc::now()),
    }
}

/// Writes a small extensionless PNG whose pixels depend on `seed`.
pub fn write_image(path: &Path, width: u32, height: u32, seed: u8) {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x as u8).wrapping_add(seed),
            (y as u8).wrapping_mul(3),
            seed,
        ])
    })
    .save_with_format(path, ImageFormat::Png)
    .unwrap();
}

pub fn file_record(file_id: &str, user_id: &str, local_path: PathBuf) -> FileRecord {
    FileRecord {
        id: id(file_id),
        user_id: id(user_id),
        name: format!("{file_id}.png"),
        local_path,
    }
}

pub fn user_record(user_id: &str, email: &str, name: Option<&str>) -> UserRecord {
    UserRecord {
        id: id(user_id),
        email: email.to_string(),
        name: name.map(str::to_string),
    }
}

/// Gateway wrapper counting every lookup.
#[derive(Default)]
pub struct CountingGateway {
    pub inner: MemoryGateway,
    pub lookups: AtomicUsize,
}

impl CountingGateway {
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataGateway for CountingGateway {
    async fn find_file_by_id(
        &self,
        file_id: &Identifier,
        user_id: &Identifier,
    ) -> Result<Option<FileRecord>, Error> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.find_file_by_id(file_id, user_id).await
    }

    async fn find_user_by_id(&self, user_id: &Identifier) -> Result<Option<UserRecord>, Error> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.find_user_by_id(user_id).await
    }
}

/// Real thumbnailer that fails for one width and counts resize calls.
pub struct FlakyThumbnailer {
    pub failing_width: Option<u32>,
    pub calls: AtomicUsize,
}

impl FlakyThumbnailer {
    pub fn failing_at(width: u32) -> Self {
        FlakyThumbnailer {
            failing_width: Some(width),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn reliable() -> Self {
        FlakyThumbnailer {
            failing_width: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ThumbnailGenerator for FlakyThumbnailer {
    async fn resize(&self, source: &Path, width: u32) -> Result<Vec<u8>, ThumbnailError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_width == Some(width) {
            return Err(ThumbnailError::Read {
                path: source.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Interrupted, "transient read error"),
            });
        }
        ImageThumbnailer.resize(source, width).await
    }
}

/// Mailer that keeps every message it is asked to send.
pub struct RecordingMailer {
    pub sent: Mutex<Vec<Message>>,
    pub fail_with: Option<String>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        RecordingMailer {
            sent: Mutex::new(Vec::new()),
            fail_with: None,
        }
    }

    pub fn failing(reason: &str) -> Self {
        RecordingMailer {
            sent: Mutex::new(Vec::new()),
            fail_with: Some(reason.to_string()),
        }
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    fn sender(&self) -> &str {
        "noreply@files.example"
    }

    async fn send_mail(&self, message: Message) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(message);
        match &self.fail_with {
            Some(reason) => Err(MailError::Transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                reason.clone(),
            ))),
            None => Ok(()),
        }
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
