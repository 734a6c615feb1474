use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    ByteRange, ByteStream, CompletedPart, FsError, FsResult, ObjectClient, ObjectHead, UploadId,
};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: HashMap<String, (Bytes, String, i64)>,
    uploads: HashMap<String, PendingUpload>,
    aborted: Vec<UploadId>,
    completed: Vec<UploadId>,
    failing_parts: HashSet<u32>,
}

/// In-process object store with multipart semantics.
///
/// Parts stay invisible until `complete_multipart`; `abort_multipart`
/// throws them away. Useful for tests and local development.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectClient {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upload of `part_number` fail with `BackendUnavailable`
    pub fn fail_part(&self, part_number: u32) {
        self.state.lock().failing_parts.insert(part_number);
    }

    /// Uploads that are started but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Uploads whose parts were discarded by an abort
    pub fn aborted_uploads(&self) -> Vec<UploadId> {
        self.state.lock().aborted.clone()
    }

    /// Uploads that were assembled into objects
    pub fn completed_uploads(&self) -> Vec<UploadId> {
        self.state.lock().completed.clone()
    }

    /// Number of committed objects
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }
}

fn transport_error(message: String) -> FsError {
    FsError::backend(std::io::Error::new(std::io::ErrorKind::Other, message))
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn create_multipart(&self, key: &str) -> FsResult<UploadId> {
        let upload_id = UploadId::new();
        self.state.lock().uploads.insert(
            upload_id.as_str().to_string(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        part_number: u32,
        body: Bytes,
    ) -> FsResult<CompletedPart> {
        let mut state = self.state.lock();
        if state.failing_parts.contains(&part_number) {
            return Err(transport_error(format!("injected failure for part {}", part_number)));
        }
        let upload = state
            .uploads
            .get_mut(upload_id.as_str())
            .filter(|upload| upload.key == key)
            .ok_or_else(|| transport_error(format!("no such upload: {}", upload_id)))?;

        let etag = format!("\"{}\"", Uuid::new_v4().simple());
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: Vec<CompletedPart>,
    ) -> FsResult<()> {
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .remove(upload_id.as_str())
            .filter(|upload| upload.key == key)
            .ok_or_else(|| transport_error(format!("no such upload: {}", upload_id)))?;

        let mut content = Vec::new();
        for part in &parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, body)) if *etag == part.etag => content.extend_from_slice(body),
                _ => {
                    return Err(transport_error(format!(
                        "invalid part {} for upload {}",
                        part.part_number, upload_id
                    )))
                }
            }
        }

        let etag = format!("\"{}-{}\"", Uuid::new_v4().simple(), parts.len());
        let now = chrono::Utc::now().timestamp();
        state
            .objects
            .insert(key.to_string(), (Bytes::from(content), etag, now));
        state.completed.push(upload_id.clone());
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &UploadId) -> FsResult<()> {
        let mut state = self.state.lock();
        if state.uploads.remove(upload_id.as_str()).is_some() {
            state.aborted.push(upload_id.clone());
        }
        Ok(())
    }

    async fn get_object(&self, key: &str, range: Option<ByteRange>) -> FsResult<ByteStream> {
        let content = self
            .state
            .lock()
            .objects
            .get(key)
            .map(|(content, _, _)| content.clone())
            .ok_or_else(|| FsError::not_found(key))?;

        let size = content.len() as u64;
        let content = match range {
            Some(range) if !range.is_valid(size) => {
                return Err(FsError::invalid_range(
                    key,
                    format!("{} not satisfiable for {} bytes", range.to_http_header(), size),
                ))
            }
            Some(range) => {
                let start = range.start as usize;
                content.slice(start..start + range.length(size) as usize)
            }
            None => content,
        };

        let stream = async_stream::stream! {
            let mut rest = content;
            while !rest.is_empty() {
                let chunk = rest.split_to(rest.len().min(READ_CHUNK));
                yield Ok::<_, std::io::Error>(chunk);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn head_object(&self, key: &str) -> FsResult<Option<ObjectHead>> {
        Ok(self
            .state
            .lock()
            .objects
            .get(key)
            .map(|(content, etag, modified)| ObjectHead {
                size_bytes: content.len() as u64,
                etag: Some(etag.clone()),
                last_modified: Some(*modified),
            }))
    }

    async fn delete_object(&self, key: &str) -> FsResult<()> {
        self.state.lock().objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn read_all(stream: ByteStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn parts_are_invisible_until_complete() {
        let client = MemoryObjectClient::new();
        let id = client.create_multipart("a.bin").await.unwrap();
        let p1 = client.upload_part("a.bin", &id, 1, Bytes::from_static(b"hello ")).await.unwrap();
        let p2 = client.upload_part("a.bin", &id, 2, Bytes::from_static(b"world")).await.unwrap();

        assert!(client.head_object("a.bin").await.unwrap().is_none());

        client.complete_multipart("a.bin", &id, vec![p1, p2]).await.unwrap();
        let content = read_all(client.get_object("a.bin", None).await.unwrap()).await;
        assert_eq!(content, b"hello world");
        assert_eq!(client.completed_uploads(), vec![id]);
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let client = MemoryObjectClient::new();
        let id = client.create_multipart("a.bin").await.unwrap();
        client.upload_part("a.bin", &id, 1, Bytes::from_static(b"x")).await.unwrap();

        client.abort_multipart("a.bin", &id).await.unwrap();
        client.abort_multipart("a.bin", &id).await.unwrap();

        assert_eq!(client.aborted_uploads(), vec![id]);
        assert_eq!(client.pending_uploads(), 0);
        assert_eq!(client.object_count(), 0);
    }

    #[tokio::test]
    async fn ranged_reads() {
        let client = MemoryObjectClient::new();
        let id = client.create_multipart("r.bin").await.unwrap();
        let part = client.upload_part("r.bin", &id, 1, Bytes::from_static(b"0123456789")).await.unwrap();
        client.complete_multipart("r.bin", &id, vec![part]).await.unwrap();

        let content = read_all(client.get_object("r.bin", Some(ByteRange::new(2, Some(4)))).await.unwrap()).await;
        assert_eq!(content, b"234");

        let err = client.get_object("r.bin", Some(ByteRange::from_start(10))).await.err().unwrap();
        assert!(matches!(err, FsError::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn missing_objects() {
        let client = MemoryObjectClient::new();
        assert!(client.get_object("nope", None).await.err().unwrap().is_not_found());
        assert!(client.head_object("nope").await.unwrap().is_none());
        client.delete_object("nope").await.unwrap();
    }
}
