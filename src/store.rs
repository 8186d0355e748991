use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{ByteStream, Upload};

/// The store interface consumed by the tus HTTP layer.
///
/// One upload id moves through create → write (one or more PATCHes) →
/// completion, with `remove` legal at any point before removal. The outer
/// server is responsible for serializing `write` calls per upload id;
/// concurrent writes to the same id corrupt part numbering and the carry
/// object. Different ids are fully independent.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Register a new upload and return it unchanged.
    async fn create(&self, upload: Upload) -> StoreResult<Upload>;

    /// Append the request body at `offset` and return the new offset.
    async fn write(&self, readable: ByteStream, id: &str, offset: u64) -> StoreResult<u64>;

    /// Stream the completed upload's content.
    async fn read(&self, id: &str) -> StoreResult<ByteStream>;

    /// Resolve the upload record, with `offset` recomputed from durable
    /// state.
    async fn get_upload(&self, id: &str) -> StoreResult<Upload>;

    /// Declare the total length of a `creation-defer-length` upload. Must
    /// happen before its first `write`.
    async fn declare_upload_length(&self, id: &str, length: u64) -> StoreResult<()>;

    /// Terminate the upload and delete everything stored for it.
    async fn remove(&self, id: &str) -> StoreResult<()>;

    /// tus protocol extensions this store supports.
    fn extensions(&self) -> Extensions;
}

/// tus protocol extensions supported by a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extensions {
    pub creation: bool,
    pub creation_with_upload: bool,
    pub creation_defer_length: bool,
    pub termination: bool,
}

impl Extensions {
    pub fn none() -> Self {
        Self {
            creation: false,
            creation_with_upload: false,
            creation_defer_length: false,
            termination: false,
        }
    }

    pub fn with_creation(mut self) -> Self {
        self.creation = true;
        self.creation_with_upload = true;
        self.creation_defer_length = true;
        self
    }

    pub fn with_termination(mut self) -> Self {
        self.termination = true;
        self
    }
}

impl std::fmt::Display for Extensions {
    /// Renders the comma-separated form used by the `Tus-Extension` header.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.creation {
            names.push("creation");
        }
        if self.creation_with_upload {
            names.push("creation-with-upload");
        }
        if self.creation_defer_length {
            names.push("creation-defer-length");
        }
        if self.termination {
            names.push("termination");
        }
        write!(f, "{}", names.join(","))
    }
}
