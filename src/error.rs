//! Failure classification for job processors.

use std::error::Error as StdError;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum JobError {
    /// Required payload field missing or malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced record does not exist, or does not belong to the claimed owner.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The side-effecting step failed; `source` carries the underlying cause.
    #[error("processing failed: {context}")]
    Processing {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn processing(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Processing {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Whether another delivery could succeed without the producer changing the payload.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::Validation(_))
    }

    /// Short classification used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "validation",
            JobError::NotFound { .. } => "not_found",
            JobError::Processing { .. } => "processing",
        }
    }

    /// Message including the whole source chain, stored as the job's last error.
    pub fn report(&self) -> String {
        let mut msg = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            msg.push_str(": ");
            msg.push_str(&cause.to_string());
            source = cause.source();
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn report_includes_cause_chain() {
        let err = JobError::processing(
            "writing thumbnail",
            io::Error::new(io::ErrorKind::PermissionDenied, "read-only filesystem"),
        );
        assert_eq!(
            err.report(),
            "processing failed: writing thumbnail: read-only filesystem"
        );
    }

    #[test]
    fn only_validation_is_permanent() {
        assert!(!JobError::validation("missing fileId").is_retryable());
        assert!(JobError::not_found("file", "f1").is_retryable());
        assert!(JobError::processing("x", "boom").is_retryable());
        assert_eq!(JobError::not_found("user", "u1").to_string(), "user not found: u1");
    }
}
