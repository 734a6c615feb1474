use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ByteRange, CreateOptions, FsResult, ObjectName, ReadStream, WriteStream};

/// Backend-agnostic storage contract - implemented by every backend.
///
/// Policies shared by all implementations:
/// - `create` replaces existing content unless `Overwrite::Reject` is asked for.
/// - Nothing written becomes readable before the write stream shuts down
///   successfully. Dropping a write stream early discards what was written.
/// - `remove` of a missing object fails with `NotFound`.
#[async_trait]
pub trait AssetFs: Send + Sync {
    /// Open a new write stream for `name`
    async fn create(&self, name: &ObjectName) -> FsResult<WriteStream> {
        self.create_with(name, CreateOptions::default()).await
    }

    /// Open a new write stream for `name` with explicit options
    async fn create_with(&self, name: &ObjectName, options: CreateOptions) -> FsResult<WriteStream>;

    /// Open `name` for reading
    async fn open(&self, name: &ObjectName) -> FsResult<ReadStream>;

    /// Open a byte range of `name` for reading
    async fn open_range(&self, name: &ObjectName, range: ByteRange) -> FsResult<ReadStream>;

    /// Delete `name`
    async fn remove(&self, name: &ObjectName) -> FsResult<()>;

    /// Check whether `name` currently holds a committed object
    async fn exists(&self, name: &ObjectName) -> FsResult<bool>;

    /// Describe the backend
    fn capabilities(&self) -> FsCapabilities;
}

/// Which medium a backend stores objects on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    S3,
}

/// Backend capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsCapabilities {
    pub backend: BackendKind,
    pub supports_range: bool,
    pub multipart: bool,
    pub part_size: Option<u64>,
    pub max_parts: Option<u32>,
}

impl FsCapabilities {
    pub fn basic(backend: BackendKind) -> Self {
        Self {
            backend,
            supports_range: false,
            multipart: false,
            part_size: None,
            max_parts: None,
        }
    }

    pub fn with_range(mut self) -> Self {
        self.supports_range = true;
        self
    }

    pub fn with_multipart(mut self, part_size: u64, max_parts: u32) -> Self {
        self.multipart = true;
        self.part_size = Some(part_size);
        self.max_parts = Some(max_parts);
        self
    }
}
