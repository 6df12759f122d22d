//! Typed views over the JSON payloads carried by each queue.

use crate::{JobError, Payload};
use serde_json::Value;
use std::fmt;

const MAX_IDENTIFIER_LEN: usize = 64;

/// Opaque record identifier: 1 to 64 ASCII alphanumerics, `-` or `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed = !raw.is_empty()
            && raw.len() <= MAX_IDENTIFIER_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        well_formed.then(|| Identifier(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Identifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Identifier::parse(s).ok_or_else(|| format!("malformed identifier {s:?}"))
    }
}

fn required_id(payload: &Payload, field: &str) -> Result<Identifier, JobError> {
    match payload.get(field) {
        None | Some(Value::Null) => Err(JobError::validation(format!("missing {field}"))),
        Some(Value::String(raw)) => {
            Identifier::parse(raw).ok_or_else(|| JobError::validation(format!("malformed {field}")))
        }
        Some(_) => Err(JobError::validation(format!("malformed {field}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailJobPayload {
    pub file_id: Identifier,
    pub user_id: Identifier,
}

impl ThumbnailJobPayload {
    pub fn from_payload(payload: &Payload) -> Result<Self, JobError> {
        let file_id = required_id(payload, "fileId")?;
        let user_id = required_id(payload, "userId")?;
        Ok(ThumbnailJobPayload { file_id, user_id })
    }

    pub fn into_payload(self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("fileId".into(), Value::String(self.file_id.0));
        payload.insert("userId".into(), Value::String(self.user_id.0));
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeEmailJobPayload {
    pub user_id: Identifier,
}

impl WelcomeEmailJobPayload {
    pub fn from_payload(payload: &Payload) -> Result<Self, JobError> {
        let user_id = required_id(payload, "userId")?;
        Ok(WelcomeEmailJobPayload { user_id })
    }

    pub fn into_payload(self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("userId".into(), Value::String(self.user_id.0));
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn identifier_accepts_object_ids_uuids_and_short_keys() {
        assert!(Identifier::parse("5f1e7d8c9a0b1c2d3e4f5a6b").is_some());
        assert!(Identifier::parse("0b8a3c52-2f4e-4a51-9d0c-8d6f2d0f1e11").is_some());
        assert!(Identifier::parse("u1").is_some());
    }

    #[test]
    fn identifier_rejects_malformed_input() {
        assert!(Identifier::parse("").is_none());
        assert!(Identifier::parse("../etc/passwd").is_none());
        assert!(Identifier::parse("has space").is_none());
        assert!(Identifier::parse(&"a".repeat(65)).is_none());
    }

    #[test]
    fn thumbnail_payload_reports_first_missing_field() {
        let err = ThumbnailJobPayload::from_payload(&payload(json!({}))).unwrap_err();
        assert_eq!(err.to_string(), "validation failed: missing fileId");

        let err = ThumbnailJobPayload::from_payload(&payload(json!({ "fileId": "f1" }))).unwrap_err();
        assert_eq!(err.to_string(), "validation failed: missing userId");

        let err = ThumbnailJobPayload::from_payload(&payload(json!({ "fileId": "f1", "userId": null })))
            .unwrap_err();
        assert_eq!(err.to_string(), "validation failed: missing userId");
    }

    #[test]
    fn non_string_identifiers_are_malformed() {
        let err = WelcomeEmailJobPayload::from_payload(&payload(json!({ "userId": 42 }))).unwrap_err();
        assert_eq!(err.to_string(), "validation failed: malformed userId");

        let err = ThumbnailJobPayload::from_payload(&payload(json!({ "fileId": "", "userId": "u1" })))
            .unwrap_err();
        assert_eq!(err.to_string(), "validation failed: malformed fileId");
    }

    #[test]
    fn wire_payload_uses_camel_case_keys() {
        let typed = ThumbnailJobPayload {
            file_id: Identifier::parse("f1").unwrap(),
            user_id: Identifier::parse("u1").unwrap(),
        };
        let wire = typed.clone().into_payload();
        assert_eq!(Value::Object(wire.clone()), json!({ "fileId": "f1", "userId": "u1" }));
        assert_eq!(ThumbnailJobPayload::from_payload(&wire).unwrap(), typed);
    }
}
