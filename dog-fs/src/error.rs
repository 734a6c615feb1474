use std::io;
use thiserror::Error;

/// Result type for asset storage operations
pub type FsResult<T> = Result<T, FsError>;

/// Errors surfaced by the storage contract.
///
/// Backend-native errors (`std::io::Error`, S3 SDK errors) never cross the
/// contract boundary directly; they are folded into one of these variants.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("Object not found: {name}")]
    NotFound { name: String },

    #[error("Object already exists: {name}")]
    AlreadyExists { name: String },

    #[error("Invalid object name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid range for {name}: {reason}")]
    InvalidRange { name: String, reason: String },

    #[error("Storage backend unavailable: {source}")]
    BackendUnavailable {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Upload aborted: {reason}")]
    Aborted { reason: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },
}

impl FsError {
    /// Create a not found error
    pub fn not_found<S: Into<String>>(name: S) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create an already exists error
    pub fn already_exists<S: Into<String>>(name: S) -> Self {
        Self::AlreadyExists { name: name.into() }
    }

    /// Create an invalid name error
    pub fn invalid_name<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid range error
    pub fn invalid_range<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::InvalidRange {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Wrap any transport error as `BackendUnavailable`
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::BackendUnavailable {
            source: Box::new(error),
        }
    }

    /// Create an aborted error
    pub fn aborted<S: Into<String>>(reason: S) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Translate an I/O error raised while operating on `name`.
    pub fn from_io<S: Into<String>>(name: S, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => Self::not_found(name),
            io::ErrorKind::AlreadyExists => Self::already_exists(name),
            _ => Self::backend(error),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

impl From<FsError> for io::Error {
    fn from(error: FsError) -> Self {
        let kind = match &error {
            FsError::NotFound { .. } => io::ErrorKind::NotFound,
            FsError::AlreadyExists { .. } => io::ErrorKind::AlreadyExists,
            FsError::InvalidName { .. } | FsError::InvalidRange { .. } | FsError::Config { .. } => {
                io::ErrorKind::InvalidInput
            }
            FsError::Aborted { .. } => io::ErrorKind::ConnectionAborted,
            FsError::BackendUnavailable { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, error)
    }
}

/// Recovers the `FsError` carried by a stream error, so `?` on stream I/O
/// keeps the same taxonomy.
impl From<io::Error> for FsError {
    fn from(error: io::Error) -> Self {
        if !error.get_ref().map_or(false, |inner| inner.is::<FsError>()) {
            return Self::backend(error);
        }
        match error.into_inner().map(|inner| inner.downcast::<FsError>()) {
            Some(Ok(inner)) => *inner,
            _ => Self::aborted("stream failed"),
        }
    }
}
