use async_trait::async_trait;
use bytes::Bytes;

use crate::{ByteRange, ByteStream, FsResult, UploadId};

/// Object store primitives the remote backend is built on.
///
/// Implementations translate their native errors into `FsError` and must
/// treat aborting an unknown or already finished upload as success.
#[async_trait]
pub trait ObjectClient: Send + Sync + 'static {
    /// Start a multipart upload for `key`
    async fn create_multipart(&self, key: &str) -> FsResult<UploadId>;

    /// Upload one part. Part numbers start at 1.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        part_number: u32,
        body: Bytes,
    ) -> FsResult<CompletedPart>;

    /// Assemble the acknowledged parts into the final object
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: Vec<CompletedPart>,
    ) -> FsResult<()>;

    /// Discard every part of an in-progress upload
    async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> FsResult<()>;

    /// Fetch an object (or a range of it) as a byte stream
    async fn get_object(&self, key: &str, range: Option<ByteRange>) -> FsResult<ByteStream>;

    /// Object metadata, `None` when the key does not exist
    async fn head_object(&self, key: &str) -> FsResult<Option<ObjectHead>>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete_object(&self, key: &str) -> FsResult<()>;

    /// Smallest part size the store accepts for non-final parts
    fn min_part_size(&self) -> usize {
        0
    }
}

/// Acknowledged part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Metadata about a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub last_modified: Option<i64>,
}
