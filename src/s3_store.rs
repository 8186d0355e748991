//! S3-backed implementation of the upload store.
//!
//! Each upload id `X` owns three keys in the configured bucket: `X` (the
//! multipart target object), `X.info` (JSON `Upload` record with the
//! multipart binding in user-metadata) and `X.part` (the carry: trailing
//! bytes of a PATCH that were too small to upload as a part). PATCH bodies
//! are split into temp chunk files, each chunk becomes either an
//! `UploadPart` or the new carry, and the multipart upload is completed once
//! the offset reaches the declared length.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier, Part};
use aws_sdk_s3::Client;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::cache::{CachedUpload, MemoryMetadataCache, MetadataCache};
use crate::config::S3StoreConfig;
use crate::error::{is_not_found_code, sdk_error_code, StoreError, StoreResult};
use crate::incomplete_part::prepend_incomplete_part;
use crate::part_size::{calc_optimal_part_size, MIN_PART_SIZE};
use crate::splitter::{ChunkEvent, StreamSplitter};
use crate::store::{Extensions, UploadStore};
use crate::types::{ByteStream, Upload, TUS_RESUMABLE};

/// Capacity of the splitter's chunk-event channel. Keeps the splitter from
/// racing more than a few chunk files ahead of the part uploads.
const CHUNK_EVENT_BUFFER: usize = 8;

/// Upload store persisting to an S3-compatible bucket via multipart uploads
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    config: S3StoreConfig,
    cache: Arc<dyn MetadataCache>,
}

impl S3Store {
    /// Build a store over an existing SDK client. Validates the
    /// configuration.
    pub fn new(client: Client, config: S3StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            cache: Arc::new(MemoryMetadataCache::new()),
        })
    }

    /// Build a store from the standard AWS environment (credentials chain,
    /// region, endpoint overrides).
    pub async fn from_env(config: S3StoreConfig) -> StoreResult<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::new(Client::new(&aws_config), config)
    }

    /// Swap the metadata cache, e.g. for a shared backing in multi-instance
    /// deployments.
    pub fn with_cache<C: MetadataCache + 'static>(mut self, cache: C) -> Self {
        self.cache = Arc::new(cache);
        self
    }

    fn info_key(id: &str) -> String {
        format!("{id}.info")
    }

    fn part_key(id: &str) -> String {
        format!("{id}.part")
    }

    /// Write the info object: JSON `Upload` body (exact, non-ASCII-capable
    /// metadata) with the multipart binding in user-metadata. Refreshes the
    /// cache.
    async fn save_metadata(&self, upload: &Upload, multipart_id: &str) -> StoreResult<()> {
        let body = serde_json::to_vec(upload)?;

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(Self::info_key(&upload.id))
            .body(AwsByteStream::from(body))
            .content_type("application/json")
            .metadata("upload-id", multipart_id)
            .metadata("tus-version", TUS_RESUMABLE)
            .send()
            .await
            .map_err(StoreError::storage)?;

        self.cache
            .set(
                &upload.id,
                CachedUpload {
                    upload: upload.clone(),
                    multipart_id: multipart_id.to_string(),
                    tus_version: TUS_RESUMABLE.to_string(),
                },
            )
            .await;
        Ok(())
    }

    /// Resolve the upload record and its multipart binding, from cache when
    /// possible. A missing info object is `FileNotFound`.
    async fn get_metadata(&self, id: &str) -> StoreResult<CachedUpload> {
        if let Some(entry) = self.cache.get(id).await {
            return Ok(entry);
        }

        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(Self::info_key(id))
            .send()
            .await
            .map_err(|err| {
                if is_not_found_code(sdk_error_code(&err)) {
                    StoreError::file_not_found(id)
                } else {
                    StoreError::storage(err)
                }
            })?;

        let multipart_id = output
            .metadata()
            .and_then(|metadata| metadata.get("upload-id"))
            .cloned()
            .ok_or_else(|| {
                StoreError::invalid(format!(
                    "info object for {id} is missing its upload-id binding"
                ))
            })?;
        let tus_version = output
            .metadata()
            .and_then(|metadata| metadata.get("tus-version"))
            .cloned()
            .unwrap_or_else(|| TUS_RESUMABLE.to_string());

        let body = output
            .body
            .collect()
            .await
            .map_err(StoreError::storage_source)?;
        let upload: Upload = serde_json::from_slice(&body.into_bytes())?;

        let entry = CachedUpload {
            upload,
            multipart_id,
            tus_version,
        };
        self.cache.set(id, entry.clone()).await;
        Ok(entry)
    }

    /// Persist the carry object at `{id}.part` from a finished chunk file.
    async fn upload_incomplete_part(&self, id: &str, chunk_path: &Path) -> StoreResult<()> {
        let body = AwsByteStream::from_path(chunk_path)
            .await
            .map_err(StoreError::storage_source)?;

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(Self::part_key(id))
            .body(body)
            .send()
            .await
            .map_err(StoreError::storage)?;
        Ok(())
    }

    /// Stream the carry object, or `None` when no carry exists. Only
    /// not-found is swallowed; everything else propagates.
    async fn get_incomplete_part(&self, id: &str) -> StoreResult<Option<ByteStream>> {
        match self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(Self::part_key(id))
            .send()
            .await
        {
            Ok(output) => Ok(Some(Box::pin(ReaderStream::new(
                output.body.into_async_read(),
            )))),
            Err(err) if is_not_found_code(sdk_error_code(&err)) => Ok(None),
            Err(err) => Err(StoreError::storage(err)),
        }
    }

    /// Length of the carry object, or `None` when no carry exists.
    async fn head_incomplete_part(&self, id: &str) -> StoreResult<Option<u64>> {
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(Self::part_key(id))
            .send()
            .await
        {
            Ok(output) => Ok(Some(output.content_length.unwrap_or(0).max(0) as u64)),
            Err(err) if is_not_found_code(sdk_error_code(&err)) => Ok(None),
            Err(err) => Err(StoreError::storage(err)),
        }
    }

    async fn delete_incomplete_part(&self, id: &str) -> StoreResult<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(Self::part_key(id))
            .send()
            .await
            .map_err(StoreError::storage)?;
        Ok(())
    }

    /// Collect every uploaded part, paging `ListParts` until the marker goes
    /// terminal, then reduce to the dense `1..=k` prefix the resumable
    /// protocol relies on.
    async fn retrieve_parts(&self, entry: &CachedUpload) -> StoreResult<Vec<Part>> {
        let mut parts: Vec<Part> = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_parts()
                .bucket(&self.config.bucket)
                .key(&entry.upload.id)
                .upload_id(&entry.multipart_id);
            if let Some(marker) = &marker {
                request = request.part_number_marker(marker);
            }

            let output = request.send().await.map_err(StoreError::storage)?;
            parts.extend(output.parts.unwrap_or_default());

            marker = next_marker(output.next_part_number_marker);
            if marker.is_none() {
                break;
            }
        }

        parts.sort_by_key(|part| part.part_number.unwrap_or(0));
        Ok(contiguous_prefix(parts))
    }

    /// Assemble the target object from the uploaded parts. Afterwards the
    /// multipart upload no longer exists; the info object is retained.
    async fn finish_multipart_upload(
        &self,
        entry: &CachedUpload,
        parts: &[Part],
    ) -> StoreResult<Option<String>> {
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .set_part_number(part.part_number)
                    .set_e_tag(part.e_tag.clone())
                    .build()
            })
            .collect();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&entry.upload.id)
            .upload_id(&entry.multipart_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(StoreError::storage)?;

        Ok(output.location)
    }

    async fn upload_part(
        &self,
        entry: &CachedUpload,
        chunk_path: &Path,
        part_number: i32,
    ) -> StoreResult<()> {
        let body = AwsByteStream::from_path(chunk_path)
            .await
            .map_err(StoreError::storage_source)?;

        self.client
            .upload_part()
            .bucket(&self.config.bucket)
            .key(&entry.upload.id)
            .upload_id(&entry.multipart_id)
            .part_number(part_number)
            .body(body)
            .send()
            .await
            .map_err(StoreError::storage)?;
        Ok(())
    }

    /// Ship one finished chunk: the first chunk of a PATCH absorbs any carry
    /// left by the previous PATCH, then the combined bytes go out as a
    /// numbered part if they reach the part minimum (or close the upload), or
    /// become the new carry otherwise. Returns the chunk's own byte count for
    /// offset accounting.
    async fn process_chunk(
        &self,
        entry: &CachedUpload,
        chunk_path: &Path,
        chunk_size: u64,
        part_number: i32,
        is_first_chunk: bool,
        is_final_part: bool,
    ) -> StoreResult<u64> {
        let id = entry.upload.id.as_str();

        let mut incomplete_part_size = 0u64;
        if is_first_chunk {
            if let Some(carry) = self.get_incomplete_part(id).await? {
                incomplete_part_size = prepend_incomplete_part(chunk_path, carry).await?;
                self.delete_incomplete_part(id).await?;
                debug!(
                    "prepended {} carry bytes ahead of part {} for {}",
                    incomplete_part_size, part_number, id
                );
            }
        }

        if chunk_size + incomplete_part_size >= MIN_PART_SIZE || is_final_part {
            self.upload_part(entry, chunk_path, part_number).await?;
        } else {
            self.upload_incomplete_part(id, chunk_path).await?;
            debug!(
                "stored {} trailing bytes of {} as carry",
                chunk_size + incomplete_part_size,
                id
            );
        }

        Ok(chunk_size)
    }
}

#[async_trait]
impl UploadStore for S3Store {
    async fn create(&self, upload: Upload) -> StoreResult<Upload> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&upload.id)
            .metadata("tus-version", TUS_RESUMABLE);
        if let Some(content_type) = upload.content_type() {
            request = request.content_type(content_type);
        }
        if let Some(cache_control) = upload.cache_control() {
            request = request.cache_control(cache_control);
        }

        let output = request.send().await.map_err(StoreError::storage)?;
        let multipart_id = output.upload_id.ok_or_else(|| {
            StoreError::upload_failed("multipart upload response is missing an upload id")
        })?;

        debug!("created multipart upload {} for {}", multipart_id, upload.id);
        self.save_metadata(&upload, &multipart_id).await?;
        Ok(upload)
    }

    async fn write(&self, readable: ByteStream, id: &str, offset: u64) -> StoreResult<u64> {
        let entry = Arc::new(self.get_metadata(id).await?);
        let size = entry.upload.size.ok_or_else(|| {
            StoreError::invalid(format!(
                "upload {id} has no declared length; declare it before writing"
            ))
        })?;

        let parts = match self.retrieve_parts(&entry).await {
            Ok(parts) => parts,
            // The multipart upload is gone but the info object is intact:
            // the upload already completed and there is nothing to append.
            Err(err) if err.is_not_found() => return Ok(size),
            Err(err) => return Err(err),
        };
        let mut part_number = parts.len() as i32;

        let chunk_size = calc_optimal_part_size(size, self.config.part_size).max(1);
        let (events_tx, mut events_rx) = mpsc::channel(CHUNK_EVENT_BUFFER);
        let splitter = StreamSplitter::new(chunk_size, &self.config.tmp_dir);
        let splitter_task = tokio::spawn(async move { splitter.split(readable, events_tx).await });

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_part_uploads));
        let mut tasks: JoinSet<StoreResult<u64>> = JoinSet::new();
        let mut pending_chunk: Option<PathBuf> = None;
        let mut chunk_number = 0u32;
        let mut running_offset = offset;

        while let Some(event) = events_rx.recv().await {
            match event {
                ChunkEvent::Started { path } => pending_chunk = Some(path),
                ChunkEvent::Finished { path, size: chunk_bytes } => {
                    pending_chunk = None;
                    part_number += 1;
                    running_offset += chunk_bytes;
                    let is_first_chunk = chunk_number == 0;
                    chunk_number += 1;
                    let is_final_part = running_offset == size;

                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| StoreError::upload_failed("part upload scheduler stopped"))?;
                    let store = self.clone();
                    let entry = entry.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let result = store
                            .process_chunk(
                                &entry,
                                &path,
                                chunk_bytes,
                                part_number,
                                is_first_chunk,
                                is_final_part,
                            )
                            .await;
                        if let Err(err) = tokio::fs::remove_file(&path).await {
                            debug!("could not remove chunk file {}: {}", path.display(), err);
                        }
                        result
                    });
                }
            }
        }

        let split_result = match splitter_task.await {
            Ok(result) => result,
            Err(err) => Err(StoreError::upload_failed(format!(
                "splitter task failed: {err}"
            ))),
        };

        // Every scheduled part task is awaited, success or failure; parts
        // already uploaded stay durable so the client can resume.
        let mut bytes_uploaded = 0u64;
        let mut first_task_error: Option<StoreError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(uploaded)) => bytes_uploaded += uploaded,
                Ok(Err(err)) => {
                    if first_task_error.is_none() {
                        first_task_error = Some(err);
                    }
                }
                Err(err) => {
                    if first_task_error.is_none() {
                        first_task_error =
                            Some(StoreError::upload_failed(format!("part task failed: {err}")));
                    }
                }
            }
        }

        if let Err(err) = split_result {
            if let Some(path) = pending_chunk.take() {
                if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                    warn!(
                        "could not remove interrupted chunk file {}: {}",
                        path.display(),
                        remove_err
                    );
                }
            }
            return Err(err);
        }
        if let Some(err) = first_task_error {
            return Err(err);
        }

        let new_offset = offset + bytes_uploaded;
        if new_offset == size {
            let parts = self.retrieve_parts(&entry).await?;
            self.finish_multipart_upload(&entry, &parts).await?;
            self.cache.remove(id).await;
            info!("upload {} completed at {} bytes", id, new_offset);
        }

        Ok(new_offset)
    }

    async fn read(&self, id: &str) -> StoreResult<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(id)
            .send()
            .await
            .map_err(|err| {
                if is_not_found_code(sdk_error_code(&err)) {
                    StoreError::file_not_found(id)
                } else {
                    StoreError::storage(err)
                }
            })?;

        Ok(Box::pin(ReaderStream::new(output.body.into_async_read())))
    }

    async fn get_upload(&self, id: &str) -> StoreResult<Upload> {
        let entry = self.get_metadata(id).await?;

        let parts = match self.retrieve_parts(&entry).await {
            Ok(parts) => parts,
            Err(err) if err.is_not_found() => {
                // The multipart upload no longer exists while the info object
                // does: the upload completed.
                let mut upload = entry.upload;
                upload.offset = upload.size.unwrap_or(upload.offset);
                return Ok(upload);
            }
            Err(err) => return Err(err),
        };

        let mut offset: u64 = parts
            .iter()
            .map(|part| part.size.unwrap_or(0).max(0) as u64)
            .sum();
        if let Some(carry) = self.head_incomplete_part(id).await? {
            offset += carry;
        }

        let mut upload = entry.upload;
        upload.offset = offset;
        Ok(upload)
    }

    async fn declare_upload_length(&self, id: &str, length: u64) -> StoreResult<()> {
        let entry = self.get_metadata(id).await?;

        let mut upload = entry.upload;
        upload.size = Some(length);
        self.save_metadata(&upload, &entry.multipart_id).await
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        let entry = self.get_metadata(id).await?;

        if let Err(err) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.config.bucket)
            .key(id)
            .upload_id(&entry.multipart_id)
            .send()
            .await
        {
            // A completed (or already-aborted) multipart upload has nothing
            // left to abort; the object cleanup below still applies.
            if !is_not_found_code(sdk_error_code(&err)) {
                return Err(StoreError::storage(err));
            }
            debug!("abort for {} found no open multipart upload", id);
        }

        let keys = [id.to_string(), Self::info_key(id), Self::part_key(id)];
        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            objects.push(
                ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .map_err(|err| StoreError::invalid(err.to_string()))?,
            );
        }
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|err| StoreError::invalid(err.to_string()))?;

        self.client
            .delete_objects()
            .bucket(&self.config.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(StoreError::storage)?;

        self.cache.remove(id).await;
        info!("removed upload {}", id);
        Ok(())
    }

    fn extensions(&self) -> Extensions {
        Extensions::none().with_creation().with_termination()
    }
}

/// Some S3 implementations return a `"0"` marker forever instead of
/// omitting it; zero is terminal, as is anything that does not parse as a
/// number.
fn next_marker(marker: Option<String>) -> Option<String> {
    marker.filter(|marker| marker.parse::<i64>().map(|n| n != 0).unwrap_or(false))
}

/// Keep the longest prefix with `parts[i].part_number == i + 1`. A gap means
/// a preceding part upload failed; everything past it is ignored so the
/// reported offset stays a contiguous prefix of the client's bytes.
fn contiguous_prefix(parts: Vec<Part>) -> Vec<Part> {
    let mut prefix = Vec::with_capacity(parts.len());
    for (index, part) in parts.into_iter().enumerate() {
        if part.part_number != Some(index as i32 + 1) {
            break;
        }
        prefix.push(part);
    }
    prefix
}
