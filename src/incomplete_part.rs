use std::path::Path;

use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::StoreResult;
use crate::types::ByteStream;

/// Prepend `carry` to the file at `chunk_path`, in place.
///
/// The combined content is staged in a sibling file and renamed over the
/// original, so a crash leaves either the old chunk or the new one on disk,
/// never a torn file. Returns the number of carry bytes prepended. On failure
/// the staging file is removed best-effort and the error propagates.
pub(crate) async fn prepend_incomplete_part(
    chunk_path: &Path,
    carry: ByteStream,
) -> StoreResult<u64> {
    let staging_path = chunk_path.with_extension("prepend");

    let staged = write_staging(&staging_path, chunk_path, carry).await;
    match staged {
        Ok(carried) => {
            tokio::fs::rename(&staging_path, chunk_path).await?;
            Ok(carried)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&staging_path).await;
            Err(err)
        }
    }
}

async fn write_staging(
    staging_path: &Path,
    chunk_path: &Path,
    mut carry: ByteStream,
) -> StoreResult<u64> {
    let mut staging = File::create(staging_path).await?;

    let mut carried = 0u64;
    while let Some(chunk) = carry.next().await {
        let chunk = chunk?;
        staging.write_all(&chunk).await?;
        carried += chunk.len() as u64;
    }

    let mut original = File::open(chunk_path).await?;
    tokio::io::copy(&mut original, &mut staging).await?;
    staging.flush().await?;

    Ok(carried)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;

    fn carry_stream(content: &[u8]) -> ByteStream {
        let content = Bytes::copy_from_slice(content);
        Box::pin(stream::iter(vec![Ok(content)]))
    }

    fn failing_carry(prefix: &[u8]) -> ByteStream {
        let items: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::copy_from_slice(prefix)),
            Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "carry download interrupted",
            )),
        ];
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn carry_ends_up_in_front_of_the_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_path = dir.path().join("tus-chunk-abc123");
        std::fs::write(&chunk_path, b"world").unwrap();

        let carried = prepend_incomplete_part(&chunk_path, carry_stream(b"hello "))
            .await
            .unwrap();

        assert_eq!(carried, 6);
        assert_eq!(std::fs::read(&chunk_path).unwrap(), b"hello world");
        // Nothing staged left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn empty_carry_leaves_the_chunk_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_path = dir.path().join("tus-chunk-def456");
        std::fs::write(&chunk_path, b"payload").unwrap();

        let carried = prepend_incomplete_part(&chunk_path, carry_stream(b""))
            .await
            .unwrap();

        assert_eq!(carried, 0);
        assert_eq!(std::fs::read(&chunk_path).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn failed_carry_keeps_the_original_and_cleans_the_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_path = dir.path().join("tus-chunk-ghi789");
        std::fs::write(&chunk_path, b"payload").unwrap();

        let result = prepend_incomplete_part(&chunk_path, failing_carry(b"par")).await;

        assert!(result.is_err());
        assert_eq!(std::fs::read(&chunk_path).unwrap(), b"payload");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
