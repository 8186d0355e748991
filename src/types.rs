use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;

/// tus protocol version recorded on every upload.
pub const TUS_RESUMABLE: &str = "1.0.0";

/// Stream of bytes for upload content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// The logical upload record, serialized as the body of the info object.
///
/// `size` is absent while the upload was created with the
/// `creation-defer-length` extension and the client has not yet declared a
/// length. `offset` counts bytes durably accepted so far; on disk it equals
/// the sum of all uploaded part sizes plus the carry length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default)]
    pub offset: u64,

    /// User-supplied tus metadata, exact and non-ASCII-capable. A recognized
    /// `contentType` key (and `cacheControl`) is propagated to the final S3
    /// object.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Upload {
    /// Create a new upload record with a known total length.
    pub fn new<S: Into<String>>(id: S, size: u64) -> Self {
        Self {
            id: id.into(),
            size: Some(size),
            offset: 0,
            metadata: BTreeMap::new(),
            created_at: Some(Utc::now()),
        }
    }

    /// Create a new upload record whose length will be declared later
    /// (`creation-defer-length`).
    pub fn deferred<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            size: None,
            offset: 0,
            metadata: BTreeMap::new(),
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Content type recognized from the tus metadata, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.metadata.get("contentType").map(String::as_str)
    }

    /// Cache-control directive recognized from the tus metadata, if any.
    pub fn cache_control(&self) -> Option<&str> {
        self.metadata.get("cacheControl").map(String::as_str)
    }
}
