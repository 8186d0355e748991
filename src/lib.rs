//! # tus-s3-store: S3-backed resumable upload storage
//!
//! `tus-s3-store` persists arbitrarily large tus-protocol uploads to any
//! S3-compatible object store by mapping the resumable semantics
//! (create / offset / append / terminate) onto S3 multipart uploads, while
//! tolerating PATCH request boundaries that rarely line up with S3's 5 MiB
//! minimum part size.
//!
//! ## Key features
//!
//! - **Streaming-first**: request bodies of unknown length are chopped into
//!   part-sized temp files and uploaded concurrently, never buffered whole
//! - **Carry-over of short tails**: a PATCH ending below the 5 MiB part
//!   minimum parks its tail as a sibling object and the next PATCH absorbs it
//! - **Resumable after any failure**: uploaded parts stay durable; a resumed
//!   PATCH discovers them via `ListParts` and continues
//! - **Provider tolerant**: accepts `NoSuchKey`/`NoSuchUpload`/`NotFound`
//!   interchangeably for the S3-compatible services that confuse them
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tus_s3_store::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> StoreResult<()> {
//! let config = S3StoreConfig::new("my-upload-bucket");
//! let store = S3Store::from_env(config).await?;
//!
//! let upload = Upload::new("d73a1938", 12 * 1024 * 1024)
//!     .with_metadata("filename", "talk.mp4")
//!     .with_metadata("contentType", "video/mp4");
//! store.create(upload).await?;
//!
//! // One PATCH body per call; the tus server serializes them per id.
//! # let body: ByteStream = todo!();
//! let new_offset = store.write(body, "d73a1938", 0).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Layout inside the bucket
//!
//! ```text
//! <id>        target object (assembled on completion)
//! <id>.info   JSON upload record + multipart binding
//! <id>.part   carry: trailing sub-minimum bytes of the last PATCH
//! ```

mod cache;
mod config;
mod error;
mod incomplete_part;
mod part_size;
mod s3_store;
mod splitter;
mod store;
mod types;

pub use cache::{CachedUpload, MemoryMetadataCache, MetadataCache};
pub use config::S3StoreConfig;
pub use error::{StoreError, StoreResult};
pub use part_size::{
    calc_optimal_part_size, DEFAULT_PART_SIZE, MAX_MULTIPART_PARTS, MAX_PART_SIZE, MIN_PART_SIZE,
};
pub use s3_store::S3Store;
pub use splitter::{ChunkEvent, StreamSplitter};
pub use store::{Extensions, UploadStore};
pub use types::{ByteStream, Upload, TUS_RESUMABLE};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ByteStream, Extensions, S3Store, S3StoreConfig, StoreError, StoreResult, Upload,
        UploadStore,
    };
}
