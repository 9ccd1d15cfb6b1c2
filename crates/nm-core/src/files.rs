//! Stored-file value objects. `BlobFile` is an object that has not reached
//! the blob store yet; `UploadedFile` is its stored counterpart. The two are
//! distinct types on purpose so a not-yet-uploaded file cannot be passed
//! where a stored one is expected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn new(value: String) -> Result<Self, String> {
        if value.trim().is_empty() {
            return Err("file id cannot be empty".to_string());
        }
        Ok(Self(value))
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<FileId> for String {
    fn from(id: FileId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone)]
pub struct BlobFile {
    pub id: FileId,
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl BlobFile {
    pub fn new(
        bytes: Vec<u8>,
        bucket: impl Into<String>,
        key_prefix: &str,
        content_type: impl Into<String>,
    ) -> Self {
        let id = FileId::generate();
        let key = format!("{key_prefix}/{id}");
        Self {
            id,
            bucket: bucket.into(),
            key,
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn size(&self) -> i64 {
        self.bytes.len() as i64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub id: FileId,
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub size: i64,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadedFile {
    pub fn from_blob(file: &BlobFile, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            id: file.id.clone(),
            bucket: file.bucket.clone(),
            key: file.key.clone(),
            content_type: file.content_type.clone(),
            size: file.size(),
            uploaded_at,
        }
    }
}
