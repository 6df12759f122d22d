//! Outgoing mail.
//!
//! Transports are shared by every concurrent job and must not keep per-message
//! state. [`OutboxMailer`] drops RFC 5322 messages into a pickup directory for
//! an MTA to relay; [`LogMailer`] only logs them.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tracing::*;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

impl Message {
    /// Renders the message as an RFC 5322 document with an HTML body.
    pub fn to_rfc5322(&self) -> String {
        let domain = self.from.rsplit('@').next().unwrap_or("localhost");
        let headers = [
            ("From", self.from.clone()),
            ("To", self.to.clone()),
            ("Subject", self.subject.clone()),
            ("Date", Utc::now().to_rfc2822()),
            ("Message-ID", format!("<{}@{}>", Uuid::new_v4(), domain)),
            ("MIME-Version", "1.0".to_string()),
            ("Content-Type", "text/html; charset=utf-8".to_string()),
        ];

        let mut out = String::new();
        for (name, value) in headers {
            // Header injection guard
            let value = value.replace(['\r', '\n'], " ");
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        out.push_str(&self.html_body.replace("\r\n", "\n").replace('\n', "\r\n"));
        out.push_str("\r\n");
        out
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid recipient address {0:?}")]
    InvalidRecipient(String),

    #[error("mail transport failed")]
    Transport(#[from] std::io::Error),
}

fn check_recipient(address: &str) -> Result<(), MailError> {
    let valid = match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !address.chars().any(|c| c.is_whitespace() || c.is_control())
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(MailError::InvalidRecipient(address.to_string()))
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    fn sender(&self) -> &str;

    fn build_message(&self, to: &str, subject: &str, html_body: &str) -> Message {
        Message {
            from: self.sender().to_string(),
            to: to.to_string(),
            subject: subject.to_string(),
            html_body: html_body.to_string(),
        }
    }

    async fn send_mail(&self, message: Message) -> Result<(), MailError>;
}

pub struct LogMailer {
    from: String,
}

impl LogMailer {
    pub fn new(from: impl Into<String>) -> Self {
        LogMailer { from: from.into() }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    fn sender(&self) -> &str {
        &self.from
    }

    async fn send_mail(&self, message: Message) -> Result<(), MailError> {
        check_recipient(&message.to)?;
        info!(message = "Mail not delivered, no outbox configured", to = %message.to, subject = %message.subject);
        Ok(())
    }
}

pub struct OutboxMailer {
    from: String,
    dir: PathBuf,
}

impl OutboxMailer {
    pub fn new(from: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        OutboxMailer {
            from: from.into(),
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    fn sender(&self) -> &str {
        &self.from
    }

    async fn send_mail(&self, message: Message) -> Result<(), MailError> {
        check_recipient(&message.to)?;

        fs::create_dir_all(&self.dir).await?;
        let name = Uuid::new_v4().simple().to_string();
        let partial = self.dir.join(format!(".{name}.partial"));
        let target = self.dir.join(format!("{name}.eml"));

        fs::write(&partial, message.to_rfc5322()).await?;
        fs::rename(&partial, &target).await?;

        debug!(message = "Mail queued in outbox", to = %message.to, path = %target.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn recipients_need_local_part_and_domain() {
        assert!(check_recipient("a@example.com").is_ok());
        assert!(check_recipient("example.com").is_err());
        assert!(check_recipient("@example.com").is_err());
        assert!(check_recipient("a@").is_err());
        assert!(check_recipient("a b@example.com").is_err());
    }

    #[test]
    fn rfc5322_rendering_strips_header_line_breaks() {
        let mailer = LogMailer::new("noreply@files.example");
        let message = mailer.build_message("a@example.com", "Hi\r\nBcc: x@evil", "<p>one\ntwo</p>");
        let raw = message.to_rfc5322();

        assert!(raw.starts_with("From: noreply@files.example\r\nTo: a@example.com\r\n"));
        assert!(raw.contains("Subject: Hi  Bcc: x@evil\r\n"));
        assert!(raw.contains("Message-ID: <"));
        assert!(raw.contains("@files.example>\r\n"));
        assert!(raw.ends_with("\r\n\r\n<p>one\r\ntwo</p>\r\n"));
    }

    #[tokio::test]
    async fn outbox_writes_one_eml_per_message() {
        let dir = TempDir::new().unwrap();
        let outbox = dir.path().join("outbox");
        let mailer = OutboxMailer::new("noreply@files.example", &outbox);

        let message = mailer.build_message("a@example.com", "Welcome", "<p>hello</p>");
        mailer.send_mail(message).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(&outbox)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].extension().unwrap(), "eml");
        let raw = std::fs::read_to_string(&entries[0]).unwrap();
        assert!(raw.contains("To: a@example.com\r\n"));
        assert!(raw.contains("<p>hello</p>"));
    }

    #[tokio::test]
    async fn invalid_recipient_is_rejected_before_writing() {
        let dir = TempDir::new().unwrap();
        let mailer = OutboxMailer::new("noreply@files.example", dir.path());

        let message = mailer.build_message("nobody", "Welcome", "<p>hello</p>");
        let err = mailer.send_mail(message).await.unwrap_err();
        assert!(matches!(err, MailError::InvalidRecipient(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
