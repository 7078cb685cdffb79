//! Upload events and the object references they carry.
//!
//! The upload sink publishes S3-style notifications:
//!
//! ```json
//! {"Records": [{"eventTime": "2026-01-01T00:00:00.000Z",
//!               "s3": {"bucket": {"name": "uploads"},
//!                      "object": {"key": "my+report.pdf", "size": 1024}}}]}
//! ```
//!
//! Keys arrive form-url-encoded and are decoded here, once, so every later
//! component (run ids, storage lookups, image keys) sees the real key.

use crate::config::RunIdStrategy;
use crate::error::PipelineError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content type enforced by the upload credential.
pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Identifies an uploaded source document. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadObjectRef {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
}

impl UploadObjectRef {
    pub fn pdf(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            content_type: PDF_CONTENT_TYPE.to_string(),
        }
    }
}

impl fmt::Display for UploadObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// One object-creation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadEvent {
    pub bucket: String,
    pub key: String,
    pub event_time: DateTime<Utc>,
}

impl UploadEvent {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, event_time: DateTime<Utc>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            event_time,
        }
    }

    pub fn object_ref(&self) -> UploadObjectRef {
        UploadObjectRef::pdf(&self.bucket, &self.key)
    }

    /// Render the event as a notification body with the key url-encoded,
    /// exactly as the upload sink would publish it.
    pub fn to_notification(&self) -> String {
        let body = serde_json::json!({
            "Records": [{
                "eventSource": "pdfvision:local",
                "eventName": "ObjectCreated:Put",
                "eventTime": self.event_time.to_rfc3339_opts(SecondsFormat::Millis, true),
                "s3": {
                    "bucket": { "name": self.bucket },
                    "object": { "key": encode_key(&self.key) }
                }
            }]
        });
        body.to_string()
    }
}

/// Run identifier, derived deterministically from the upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the run id for an event under the given strategy.
    pub fn derive(event: &UploadEvent, strategy: RunIdStrategy) -> Self {
        match strategy {
            RunIdStrategy::ObjectKey => Self(event.key.clone()),
            RunIdStrategy::KeyAndEventTime => Self(format!(
                "{}@{}",
                event.key,
                event.event_time.format("%Y%m%dT%H%M%S%3fZ")
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Notification parsing ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct Notification {
    #[serde(rename = "Records")]
    records: Option<Vec<NotificationRecord>>,
}

#[derive(Deserialize)]
struct NotificationRecord {
    #[serde(rename = "eventTime")]
    event_time: Option<DateTime<Utc>>,
    s3: S3Entity,
}

#[derive(Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Deserialize)]
struct S3Object {
    key: String,
}

/// Parse a queue message body into upload events.
///
/// A body without `Records` (e.g. a storage test notification) is malformed.
/// Records without `eventTime` are stamped with the current time.
pub fn parse_notification(body: &str) -> Result<Vec<UploadEvent>, PipelineError> {
    let notification: Notification = serde_json::from_str(body)
        .map_err(|e| PipelineError::MalformedEvent(format!("invalid JSON: {e}")))?;

    let records = notification
        .records
        .ok_or_else(|| PipelineError::MalformedEvent("missing 'Records'".into()))?;
    if records.is_empty() {
        return Err(PipelineError::MalformedEvent("empty 'Records'".into()));
    }

    records
        .into_iter()
        .map(|r| {
            let key = decode_key(&r.s3.object.key);
            if key.is_empty() || r.s3.bucket.name.is_empty() {
                return Err(PipelineError::MalformedEvent(
                    "record without bucket or key".into(),
                ));
            }
            Ok(UploadEvent {
                bucket: r.s3.bucket.name,
                key,
                event_time: r.event_time.unwrap_or_else(Utc::now),
            })
        })
        .collect()
}

/// Decode a form-url-encoded object key (`+` → space, `%XX` → byte).
///
/// Malformed escapes are kept literally rather than rejected.
pub fn decode_key(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Inverse of [`decode_key`]; keeps `/` and unreserved characters.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b' ' => out.push('+'),
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
