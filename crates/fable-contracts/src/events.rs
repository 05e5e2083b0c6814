use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::session::OperationId;

/// Which operation an entry is about. `reference` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationRef {
    pub operation: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<usize>,
}

impl From<OperationId> for OperationRef {
    fn from(id: OperationId) -> Self {
        Self {
            operation: id.to_string(),
            kind: id.kind.tag(),
            reference: id.target.map(|index| index + 1),
        }
    }
}

/// One line of the operation journal. Image payloads never appear here,
/// only their fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEntry {
    OperationStarted {
        #[serde(flatten)]
        op: OperationRef,
        model: String,
    },
    OperationSucceeded {
        #[serde(flatten)]
        op: OperationRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_count: Option<usize>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        fingerprints: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text_chars: Option<usize>,
    },
    OperationFailed {
        #[serde(flatten)]
        op: OperationRef,
        error: String,
    },
}

impl JournalEntry {
    pub fn images(op: OperationRef, images: &[String]) -> Self {
        JournalEntry::OperationSucceeded {
            op,
            image_count: Some(images.len()),
            fingerprints: images.iter().map(|image| fingerprint(image)).collect(),
            text_chars: None,
        }
    }

    pub fn text(op: OperationRef, text: &str) -> Self {
        JournalEntry::OperationSucceeded {
            op,
            image_count: None,
            fingerprints: Vec::new(),
            text_chars: Some(text.chars().count()),
        }
    }
}

/// Append-only JSONL journal shared by every clone.
///
/// Each line is the entry plus `session_id` and `ts`.
#[derive(Debug, Clone)]
pub struct OperationJournal {
    shared: Arc<JournalFile>,
}

#[derive(Debug)]
struct JournalFile {
    path: PathBuf,
    session_id: String,
    append: Mutex<()>,
}

impl OperationJournal {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(JournalFile {
                path: path.into(),
                session_id: session_id.into(),
                append: Mutex::new(()),
            }),
        }
    }

    pub fn with_random_session(path: impl Into<PathBuf>) -> Self {
        Self::new(path, uuid::Uuid::new_v4().to_string())
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn record(&self, entry: &JournalEntry) -> anyhow::Result<Value> {
        let Value::Object(fields) = serde_json::to_value(entry)? else {
            anyhow::bail!("journal entry did not serialize to an object");
        };
        let mut line = Map::new();
        line.insert(
            "session_id".to_string(),
            Value::String(self.shared.session_id.clone()),
        );
        line.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        line.extend(fields);

        if let Some(parent) = self.shared.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');
        let _append = self
            .shared
            .append
            .lock()
            .map_err(|_| anyhow::anyhow!("journal lock poisoned"))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.shared.path)?
            .write_all(&encoded)?;
        Ok(Value::Object(line))
    }
}

/// First four bytes of the SHA-256 of a data URL, hex encoded.
pub fn fingerprint(data_url: &str) -> String {
    let digest = Sha256::digest(data_url.as_bytes());
    hex::encode(&digest[..4])
}
