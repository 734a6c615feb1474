use bytes::Bytes;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

use crate::{FsError, FsResult};

/// Writable handle for a single object. `shutdown()` commits, dropping abandons.
pub type WriteStream = Pin<Box<dyn AsyncWrite + Send>>;

/// Readable handle for a single object. End of object is a clean `Ok(0)` read.
pub type ReadStream = Pin<Box<dyn AsyncRead + Send>>;

/// Stream of bytes, for consumers that speak `Stream` rather than `AsyncRead`
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Expose a read stream as a `Stream` of chunks (e.g. for an HTTP response body).
pub fn into_byte_stream(reader: ReadStream) -> ByteStream {
    Box::pin(ReaderStream::new(reader))
}

/// Expose a chunk stream as an `AsyncRead`.
pub fn from_byte_stream(stream: ByteStream) -> ReadStream {
    Box::pin(StreamReader::new(stream))
}

/// Validated object name.
///
/// Names are slash-separated relative paths. Empty segments and `.` are
/// dropped; absolute paths, `..`, backslashes and NUL bytes are rejected so a
/// name can never escape the backend's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectName(String);

impl ObjectName {
    pub fn parse<S: AsRef<str>>(raw: S) -> FsResult<Self> {
        let raw = raw.as_ref();
        if raw.is_empty() {
            return Err(FsError::invalid_name(raw, "name is empty"));
        }
        if raw.contains('\0') {
            return Err(FsError::invalid_name(raw, "name contains a NUL byte"));
        }
        if raw.contains('\\') {
            return Err(FsError::invalid_name(raw, "name contains a backslash"));
        }
        if raw.starts_with('/') {
            return Err(FsError::invalid_name(raw, "name is an absolute path"));
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(FsError::invalid_name(raw, "name escapes the storage root")),
                s => segments.push(s),
            }
        }

        if segments.is_empty() {
            return Err(FsError::invalid_name(raw, "name has no path segments"));
        }

        Ok(Self(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Relative filesystem path for this name
    pub fn to_relative_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ObjectName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ObjectName {
    type Error = FsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ObjectName> for String {
    fn from(name: ObjectName) -> Self {
        name.0
    }
}

/// Unique identifier for a multipart upload session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Generate a new random upload ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Create from an ID issued by the object store
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte range for partial reads (inclusive end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>, // None means "to end of object"
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes the range covers in an object of `total_size`
    pub fn length(&self, total_size: u64) -> u64 {
        let last = match self.end {
            Some(end) => end.min(total_size.saturating_sub(1)),
            None => total_size.saturating_sub(1),
        };
        if self.start >= total_size || last < self.start {
            0
        } else {
            last - self.start + 1
        }
    }

    pub fn is_valid(&self, total_size: u64) -> bool {
        if self.start >= total_size {
            return false;
        }
        match self.end {
            Some(end) => end >= self.start,
            None => true,
        }
    }

    /// `Range` header value
    pub fn to_http_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// What `create` does when the name already holds an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overwrite {
    /// Replace the previous content once the new content is committed
    #[default]
    Replace,
    /// Fail with `AlreadyExists`
    Reject,
}

/// Options for `create_with`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub overwrite: Overwrite,
    /// Declared object size. Writes past it are refused, and a remote upload
    /// completes on its own once this many bytes have arrived.
    pub content_length: Option<u64>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_existing(mut self) -> Self {
        self.overwrite = Overwrite::Reject;
        self
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }
}
