use std::path::PathBuf;

use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::types::ByteStream;

/// Lifecycle of one temporary chunk file.
///
/// `Started` is emitted when the first byte of a chunk arrives and its file
/// has been created; `Finished` is emitted after the file is closed, before
/// the next chunk opens. A chunk that never sees `Finished` was interrupted
/// by an input error and must be deleted by the consumer.
#[derive(Debug)]
pub enum ChunkEvent {
    Started { path: PathBuf },
    Finished { path: PathBuf, size: u64 },
}

/// Splits an incoming byte stream into temporary files of a fixed target
/// size; the last file may be smaller. Zero-sized chunks are never emitted
/// because files are only created once a byte arrives for them.
pub struct StreamSplitter {
    chunk_size: u64,
    directory: PathBuf,
}

struct OpenChunk {
    file: File,
    path: PathBuf,
    written: u64,
}

impl StreamSplitter {
    pub fn new<P: Into<PathBuf>>(chunk_size: u64, directory: P) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            directory: directory.into(),
        }
    }

    /// Consume `input`, writing chunk files and reporting their lifecycle on
    /// `events`. Returns the total number of bytes read from `input`.
    ///
    /// Byte order is preserved and the sum of all `Finished` sizes equals the
    /// returned total. On input error the error propagates immediately; the
    /// in-flight file keeps its `Started`-only state.
    pub async fn split(
        &self,
        mut input: ByteStream,
        events: mpsc::Sender<ChunkEvent>,
    ) -> StoreResult<u64> {
        let mut current: Option<OpenChunk> = None;
        let mut total = 0u64;

        while let Some(chunk) = input.next().await {
            let mut buf = chunk?;

            while !buf.is_empty() {
                if current.is_none() {
                    let path = self
                        .directory
                        .join(format!("tus-chunk-{}", Uuid::new_v4().simple()));
                    let file = File::create(&path).await?;
                    send_event(&events, ChunkEvent::Started { path: path.clone() }).await?;
                    current = Some(OpenChunk {
                        file,
                        path,
                        written: 0,
                    });
                }

                let mut chunk_full = false;
                if let Some(open) = current.as_mut() {
                    let remaining = (self.chunk_size - open.written).min(buf.len() as u64) as usize;
                    let piece = buf.split_to(remaining);
                    open.file.write_all(&piece).await?;
                    open.written += remaining as u64;
                    total += remaining as u64;
                    chunk_full = open.written == self.chunk_size;
                }

                if chunk_full {
                    if let Some(open) = current.take() {
                        close_chunk(open, &events).await?;
                    }
                }
            }
        }

        if let Some(open) = current.take() {
            if open.written > 0 {
                close_chunk(open, &events).await?;
            } else {
                drop(open.file);
                let _ = tokio::fs::remove_file(&open.path).await;
            }
        }

        Ok(total)
    }
}

async fn close_chunk(mut open: OpenChunk, events: &mpsc::Sender<ChunkEvent>) -> StoreResult<()> {
    open.file.flush().await?;
    drop(open.file);
    send_event(
        events,
        ChunkEvent::Finished {
            path: open.path,
            size: open.written,
        },
    )
    .await
}

async fn send_event(events: &mpsc::Sender<ChunkEvent>, event: ChunkEvent) -> StoreResult<()> {
    events
        .send(event)
        .await
        .map_err(|_| StoreError::upload_failed("chunk consumer stopped"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;

    fn byte_stream(buffers: Vec<Vec<u8>>) -> ByteStream {
        Box::pin(stream::iter(
            buffers.into_iter().map(|buf| Ok(Bytes::from(buf))),
        ))
    }

    fn failing_stream(prefix: Vec<u8>) -> ByteStream {
        let items: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(prefix)),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "client went away",
            )),
        ];
        Box::pin(stream::iter(items))
    }

    async fn collect(
        splitter: &StreamSplitter,
        input: ByteStream,
    ) -> (StoreResult<u64>, Vec<ChunkEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = splitter.split(input, tx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    fn finished_sizes(events: &[ChunkEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|event| match event {
                ChunkEvent::Finished { size, .. } => Some(*size),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn splits_exact_multiple_into_full_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let splitter = StreamSplitter::new(4, dir.path());

        let (result, events) = collect(&splitter, byte_stream(vec![b"abcdefgh".to_vec()])).await;

        assert_eq!(result.unwrap(), 8);
        assert_eq!(finished_sizes(&events), vec![4, 4]);

        let mut content = Vec::new();
        for event in &events {
            if let ChunkEvent::Finished { path, .. } = event {
                content.extend(std::fs::read(path).unwrap());
            }
        }
        assert_eq!(content, b"abcdefgh");
    }

    #[tokio::test]
    async fn trailing_remainder_becomes_a_smaller_final_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let splitter = StreamSplitter::new(4, dir.path());

        let (result, events) = collect(&splitter, byte_stream(vec![b"abcdefghij".to_vec()])).await;

        assert_eq!(result.unwrap(), 10);
        assert_eq!(finished_sizes(&events), vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn buffers_spanning_chunk_boundaries_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let splitter = StreamSplitter::new(5, dir.path());

        let buffers = vec![b"ab".to_vec(), b"cdefg".to_vec(), b"hij".to_vec()];
        let (result, events) = collect(&splitter, byte_stream(buffers)).await;

        assert_eq!(result.unwrap(), 10);
        assert_eq!(finished_sizes(&events), vec![5, 5]);

        let mut content = Vec::new();
        for event in &events {
            if let ChunkEvent::Finished { path, .. } = event {
                content.extend(std::fs::read(path).unwrap());
            }
        }
        assert_eq!(content, b"abcdefghij");
    }

    #[tokio::test]
    async fn each_chunk_finishes_before_the_next_starts() {
        let dir = tempfile::tempdir().unwrap();
        let splitter = StreamSplitter::new(3, dir.path());

        let (result, events) = collect(&splitter, byte_stream(vec![b"abcdefg".to_vec()])).await;
        assert_eq!(result.unwrap(), 7);

        let shape: Vec<&str> = events
            .iter()
            .map(|event| match event {
                ChunkEvent::Started { .. } => "started",
                ChunkEvent::Finished { .. } => "finished",
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                "started", "finished", "started", "finished", "started", "finished"
            ]
        );
    }

    #[tokio::test]
    async fn empty_input_emits_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let splitter = StreamSplitter::new(4, dir.path());

        let (result, events) = collect(&splitter, byte_stream(vec![])).await;

        assert_eq!(result.unwrap(), 0);
        assert!(events.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn input_error_leaves_the_pending_chunk_unfinished() {
        let dir = tempfile::tempdir().unwrap();
        let splitter = StreamSplitter::new(8, dir.path());

        let (result, events) = collect(&splitter, failing_stream(b"abc".to_vec())).await;

        assert!(matches!(result, Err(StoreError::Stream { .. })));
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChunkEvent::Started { path } => {
                // The partial file is surfaced for the coordinator to delete.
                assert_eq!(std::fs::read(path).unwrap(), b"abc");
            }
            other => panic!("expected Started, got {:?}", other),
        }
    }
}
