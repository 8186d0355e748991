use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Provider codes that all mean "the thing is not there". Some
/// S3-compatible services (DigitalOcean Spaces among them) answer
/// `NoSuchKey` where AWS answers `NoSuchUpload`, and `HeadObject` reports
/// `NotFound`; comparison is case-insensitive because providers disagree on
/// casing too.
const NOT_FOUND_CODES: &[&str] = &["NotFound", "NoSuchKey", "NoSuchUpload"];

/// Errors surfaced by the upload store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("upload not found: {id}")]
    FileNotFound { id: String },

    #[error("invalid request: {message}")]
    Invalid { message: String },

    #[error("upload failed: {reason}")]
    UploadFailed { reason: String },

    #[error("storage backend error: {source}")]
    Storage {
        /// Provider error code (`NoSuchKey`, `NoSuchUpload`, ...) when the
        /// service returned one.
        code: Option<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("stream error: {source}")]
    Stream {
        #[from]
        source: std::io::Error,
    },

    #[error("metadata serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn file_not_found<S: Into<String>>(id: S) -> Self {
        Self::FileNotFound { id: id.into() }
    }

    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn upload_failed<S: Into<String>>(reason: S) -> Self {
        Self::UploadFailed {
            reason: reason.into(),
        }
    }

    /// Wrap an SDK error, preserving the provider error code.
    pub(crate) fn storage<E, R>(err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug + Send + Sync + 'static,
    {
        let code = err
            .as_service_error()
            .and_then(|service| service.code())
            .map(str::to_string);
        Self::Storage {
            code,
            source: Box::new(err),
        }
    }

    /// Wrap a non-service storage failure (body transfer, byte-stream
    /// construction) that carries no provider code.
    pub(crate) fn storage_source<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            code: None,
            source: Box::new(err),
        }
    }

    /// True when the underlying provider code says the object or multipart
    /// upload does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::FileNotFound { .. } => true,
            Self::Storage { code, .. } => is_not_found_code(code.as_deref()),
            _ => false,
        }
    }
}

pub(crate) fn is_not_found_code(code: Option<&str>) -> bool {
    code.is_some_and(|code| {
        NOT_FOUND_CODES
            .iter()
            .any(|known| code.eq_ignore_ascii_case(known))
    })
}

/// Extract the provider error code from an SDK error, if any.
pub(crate) fn sdk_error_code<E, R>(err: &SdkError<E, R>) -> Option<&str>
where
    E: ProvideErrorMetadata,
{
    err.as_service_error().and_then(|service| service.code())
}
