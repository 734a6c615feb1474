use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard, PollSender};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{
    AssetFs, BackendKind, ByteRange, CompletedPart, CreateOptions, FsCapabilities, FsError,
    FsResult, ObjectClient, ObjectName, Overwrite, ReadStream, RemoteConfig, UploadEffect,
    UploadEvent, UploadId, UploadSession, UploadStatus, UploadTracker, WriteStream,
};

/// Storage backend over a remote object store.
///
/// Every write stream is backed by a multipart upload driven by one upload
/// task. The task owns every call to the store for that upload and is the
/// only place upload events are applied.
pub struct RemoteFs<C: ObjectClient> {
    client: Arc<C>,
    config: RemoteConfig,
    tasks: TaskTracker,
}

impl<C: ObjectClient> RemoteFs<C> {
    pub fn new(client: C, config: RemoteConfig) -> FsResult<Self> {
        config.validate(client.min_part_size())?;
        Ok(Self {
            client: Arc::new(client),
            config,
            tasks: TaskTracker::new(),
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Number of upload tasks that have not resolved yet
    pub fn active_uploads(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until no upload task is running.
    ///
    /// The tracker stays closed afterwards; uploads created later are still
    /// tracked, and concurrent callers all resolve once the tracker drains.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Like `create_with`, but returns the concrete writer so the caller can
    /// keep an `UploadHandle` on the session.
    pub async fn create_upload(&self, name: &ObjectName, options: CreateOptions) -> FsResult<RemoteWriter> {
        let key = name.as_str().to_string();

        if options.overwrite == Overwrite::Reject && self.client.head_object(&key).await?.is_some() {
            return Err(FsError::already_exists(key));
        }

        let tracker = Arc::new(UploadTracker::new(key.clone()));
        let upload_id = match self.client.create_multipart(&key).await {
            Ok(upload_id) => upload_id,
            Err(e) => {
                tracker.apply(UploadEvent::Failed(e.to_string()));
                return Err(e);
            }
        };
        tracker.set_upload_id(upload_id.clone());
        tracker.apply(UploadEvent::Started);

        let (tx, rx) = mpsc::channel(self.config.queue_depth);
        let cancel = CancellationToken::new();

        let task = UploadTask {
            client: self.client.clone(),
            key: key.clone(),
            upload_id: upload_id.clone(),
            tracker: tracker.clone(),
            cancel: cancel.clone(),
            part_size: self.config.part_size,
            max_parts: self.config.max_parts,
            content_length: options.content_length,
            buffer: BytesMut::new(),
            received: 0,
            parts: Vec::new(),
        };
        self.tasks.spawn(task.run(rx));

        debug!(key = %key, upload_id = %upload_id, "created remote write stream");

        Ok(RemoteWriter {
            sender: PollSender::new(tx),
            handle: UploadHandle {
                tracker,
                cancel: cancel.clone(),
            },
            _guard: cancel.drop_guard(),
            max_chunk: self.config.part_size,
            remaining: options.content_length,
            finish_sent: false,
            completion: None,
        })
    }
}

#[async_trait]
impl<C: ObjectClient> AssetFs for RemoteFs<C> {
    async fn create_with(&self, name: &ObjectName, options: CreateOptions) -> FsResult<WriteStream> {
        Ok(Box::pin(self.create_upload(name, options).await?))
    }

    async fn open(&self, name: &ObjectName) -> FsResult<ReadStream> {
        let stream = self.client.get_object(name.as_str(), None).await?;
        debug!(name = %name, "opened remote object");
        Ok(crate::from_byte_stream(stream))
    }

    async fn open_range(&self, name: &ObjectName, range: ByteRange) -> FsResult<ReadStream> {
        let stream = self.client.get_object(name.as_str(), Some(range)).await?;
        Ok(crate::from_byte_stream(stream))
    }

    /// Checks for the object before deleting it; the check and the delete are not atomic.
    async fn remove(&self, name: &ObjectName) -> FsResult<()> {
        if self.client.head_object(name.as_str()).await?.is_none() {
            return Err(FsError::not_found(name.as_str()));
        }
        self.client.delete_object(name.as_str()).await?;
        debug!(name = %name, "removed remote object");
        Ok(())
    }

    async fn exists(&self, name: &ObjectName) -> FsResult<bool> {
        Ok(self.client.head_object(name.as_str()).await?.is_some())
    }

    fn capabilities(&self) -> FsCapabilities {
        FsCapabilities::basic(BackendKind::S3)
            .with_range()
            .with_multipart(self.config.part_size as u64, self.config.max_parts)
    }
}

/// Observer for one upload session
#[derive(Debug, Clone)]
pub struct UploadHandle {
    tracker: Arc<UploadTracker>,
    cancel: CancellationToken,
}

impl UploadHandle {
    pub fn status(&self) -> UploadStatus {
        self.tracker.status()
    }

    pub fn session(&self) -> UploadSession {
        self.tracker.snapshot()
    }

    /// Resolve once the upload is completed, aborted or failed
    pub async fn wait(&self) -> UploadStatus {
        self.tracker.wait_terminal().await
    }

    /// Cancel the upload. A no-op once the session is terminal.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

enum Chunk {
    Data(Bytes),
    Finish,
}

/// Caller-facing half of a remote upload.
///
/// Bytes are handed to the upload task through a bounded channel, so a slow
/// store pushes back on the writer. Dropping the writer before the upload
/// completes cancels the session and the task aborts it on the store.
pub struct RemoteWriter {
    sender: PollSender<Chunk>,
    handle: UploadHandle,
    _guard: DropGuard,
    max_chunk: usize,
    remaining: Option<u64>,
    finish_sent: bool,
    completion: Option<BoxFuture<'static, UploadStatus>>,
}

impl RemoteWriter {
    pub fn handle(&self) -> UploadHandle {
        self.handle.clone()
    }

    fn terminal_error(status: &UploadStatus) -> io::Error {
        match status {
            UploadStatus::Failed { reason } => FsError::aborted(reason.clone()).into(),
            UploadStatus::Aborted => FsError::aborted("upload was cancelled").into(),
            _ => io::Error::new(io::ErrorKind::BrokenPipe, "upload task stopped"),
        }
    }
}

impl AsyncWrite for RemoteWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match this.handle.status() {
            UploadStatus::Completed => return Poll::Ready(Ok(0)),
            status @ (UploadStatus::Aborted | UploadStatus::Failed { .. }) => {
                return Poll::Ready(Err(Self::terminal_error(&status)))
            }
            _ => {}
        }
        if this.finish_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write stream is closed",
            )));
        }

        let mut len = buf.len().min(this.max_chunk);
        if let Some(remaining) = this.remaining {
            if remaining == 0 {
                return Poll::Ready(Ok(0));
            }
            len = len.min(remaining as usize);
        }
        if len == 0 {
            return Poll::Ready(Ok(0));
        }

        if ready!(this.sender.poll_reserve(cx)).is_err() {
            // The task hung up, which only happens once the session is terminal
            return Poll::Ready(match this.handle.status() {
                UploadStatus::Completed => Ok(0),
                status => Err(Self::terminal_error(&status)),
            });
        }
        if this
            .sender
            .send_item(Chunk::Data(Bytes::copy_from_slice(&buf[..len])))
            .is_err()
        {
            return Poll::Ready(Err(Self::terminal_error(&this.handle.status())));
        }

        if let Some(remaining) = this.remaining.as_mut() {
            *remaining -= len as u64;
        }
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.finish_sent && !this.handle.status().is_terminal() {
            // A closed channel means the task already stopped; its status says why.
            if ready!(this.sender.poll_reserve(cx)).is_ok() {
                let _ = this.sender.send_item(Chunk::Finish);
            }
            this.sender.close();
        }
        this.finish_sent = true;

        let tracker = this.handle.tracker.clone();
        let completion = this
            .completion
            .get_or_insert_with(|| async move { tracker.wait_terminal().await }.boxed());
        let status = ready!(completion.poll_unpin(cx));

        match status {
            UploadStatus::Completed => Poll::Ready(Ok(())),
            status => Poll::Ready(Err(Self::terminal_error(&status))),
        }
    }
}

/// Drives one multipart upload from the channel to the store
struct UploadTask<C: ObjectClient> {
    client: Arc<C>,
    key: String,
    upload_id: UploadId,
    tracker: Arc<UploadTracker>,
    cancel: CancellationToken,
    part_size: usize,
    max_parts: u32,
    content_length: Option<u64>,
    buffer: BytesMut,
    received: u64,
    parts: Vec<CompletedPart>,
}

/// Why the upload task stopped pulling chunks
enum Stop {
    Finished,
    Cancelled,
    Failed(FsError),
}

impl<C: ObjectClient> UploadTask<C> {
    async fn run(mut self, mut rx: mpsc::Receiver<Chunk>) {
        let stop = match self.receive(&mut rx).await {
            Stop::Finished => self.finish().await,
            other => other,
        };

        let effect = match &stop {
            Stop::Finished => self.tracker.apply(UploadEvent::AllPartsAcknowledged),
            Stop::Cancelled => self.tracker.apply(UploadEvent::CallerClosed),
            Stop::Failed(e) => self.tracker.apply(UploadEvent::Failed(e.to_string())),
        };

        match effect {
            UploadEffect::EndStream => {
                rx.close();
                info!(
                    key = %self.key,
                    upload_id = %self.upload_id,
                    bytes = self.received,
                    parts = self.parts.len(),
                    "upload completed"
                );
            }
            UploadEffect::AbortRemote => {
                rx.close();
                if let Stop::Failed(e) = &stop {
                    warn!(key = %self.key, upload_id = %self.upload_id, error = %e, "upload failed");
                }
                self.abort_remote().await;
            }
            UploadEffect::None => {}
        }
    }

    /// Pull chunks until the caller finishes, goes away, or a part fails
    async fn receive(&mut self, rx: &mut mpsc::Receiver<Chunk>) -> Stop {
        if self.content_length == Some(0) {
            return Stop::Finished;
        }
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Stop::Cancelled,
                chunk = rx.recv() => chunk,
            };

            match chunk {
                Some(Chunk::Data(bytes)) => {
                    self.received += bytes.len() as u64;
                    self.tracker.record_received(bytes.len() as u64);
                    self.buffer.extend_from_slice(&bytes);

                    while self.buffer.len() >= self.part_size {
                        let part = self.buffer.split_to(self.part_size).freeze();
                        if let Err(stop) = self.send_part(part).await {
                            return stop;
                        }
                    }

                    if self.content_length == Some(self.received) {
                        return Stop::Finished;
                    }
                }
                Some(Chunk::Finish) => return Stop::Finished,
                None => return Stop::Cancelled,
            }
        }
    }

    /// Upload whatever is buffered and assemble the object
    async fn finish(&mut self) -> Stop {
        if let Some(expected) = self.content_length {
            if self.received != expected {
                return Stop::Failed(FsError::aborted(format!(
                    "{} closed after {} of {} bytes",
                    self.key, self.received, expected
                )));
            }
        }

        // The store needs at least one part, even for an empty object
        if !self.buffer.is_empty() || self.parts.is_empty() {
            let part = self.buffer.split().freeze();
            if let Err(stop) = self.send_part(part).await {
                return stop;
            }
        }

        let complete = self
            .client
            .complete_multipart(&self.key, &self.upload_id, self.parts.clone());
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Stop::Cancelled,
            result = complete => match result {
                Ok(()) => Stop::Finished,
                Err(e) => Stop::Failed(e),
            },
        }
    }

    async fn send_part(&mut self, body: Bytes) -> Result<(), Stop> {
        let part_number = self.parts.len() as u32 + 1;
        if part_number > self.max_parts {
            return Err(Stop::Failed(FsError::aborted(format!(
                "{} exceeds the limit of {} parts",
                self.key, self.max_parts
            ))));
        }

        let size = body.len() as u64;
        let upload = self
            .client
            .upload_part(&self.key, &self.upload_id, part_number, body);
        let part = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
            result = upload => result.map_err(Stop::Failed)?,
        };

        debug!(key = %self.key, part_number, size, "uploaded part");
        self.tracker.record_part(size);
        self.parts.push(part);
        Ok(())
    }

    async fn abort_remote(&self) {
        match self.client.abort_multipart(&self.key, &self.upload_id).await {
            Ok(()) => warn!(key = %self.key, upload_id = %self.upload_id, "upload aborted"),
            Err(e) => warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                error = %e,
                "failed to abort upload; parts may linger in the store"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryObjectClient;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const PART: usize = 64 * 1024;

    fn store() -> RemoteFs<MemoryObjectClient> {
        RemoteFs::new(
            MemoryObjectClient::new(),
            RemoteConfig::new().with_part_size(PART).with_queue_depth(4),
        )
        .unwrap()
    }

    fn name(raw: &str) -> ObjectName {
        ObjectName::parse(raw).unwrap()
    }

    async fn wait(handle: &UploadHandle) -> UploadStatus {
        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("upload did not settle")
    }

    #[tokio::test]
    async fn shutdown_completes_the_upload() {
        let fs = store();
        let mut writer = fs.create_upload(&name("a.bin"), CreateOptions::new()).await.unwrap();
        let handle = writer.handle();

        writer.write_all(&vec![1u8; PART * 2 + 10]).await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(handle.status(), UploadStatus::Completed);
        let session = handle.session();
        assert_eq!(session.parts_acknowledged, 3);
        assert_eq!(session.bytes_uploaded, (PART * 2 + 10) as u64);
        assert_eq!(fs.client().completed_uploads().len(), 1);
    }

    #[tokio::test]
    async fn dropping_the_writer_aborts() {
        let fs = store();
        let mut writer = fs.create_upload(&name("a.bin"), CreateOptions::new()).await.unwrap();
        let handle = writer.handle();

        writer.write_all(&vec![1u8; PART + 1]).await.unwrap();
        drop(writer);

        assert_eq!(wait(&handle).await, UploadStatus::Aborted);
        fs.wait_idle().await;
        assert_eq!(fs.client().aborted_uploads().len(), 1);
        assert_eq!(fs.client().pending_uploads(), 0);
        assert!(!fs.exists(&name("a.bin")).await.unwrap());
    }

    #[tokio::test]
    async fn explicit_abort_is_idempotent() {
        let fs = store();
        let mut writer = fs.create_upload(&name("a.bin"), CreateOptions::new()).await.unwrap();
        let handle = writer.handle();
        writer.write_all(b"some bytes").await.unwrap();

        handle.abort();
        handle.abort();
        assert_eq!(wait(&handle).await, UploadStatus::Aborted);
        fs.wait_idle().await;

        let err = writer.shutdown().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(fs.client().aborted_uploads().len(), 1);
    }

    #[tokio::test]
    async fn sized_upload_ends_the_stream_on_completion() {
        let fs = store();
        let payload = vec![9u8; PART + 100];
        let mut writer = fs
            .create_upload(
                &name("sized.bin"),
                CreateOptions::new().with_content_length(payload.len() as u64),
            )
            .await
            .unwrap();
        let handle = writer.handle();

        writer.write_all(&payload).await.unwrap();

        // No shutdown: the session completes on its own once every byte arrived
        assert_eq!(wait(&handle).await, UploadStatus::Completed);
        assert_eq!(writer.write(b"more").await.unwrap(), 0);
        writer.shutdown().await.unwrap();
        drop(writer);

        fs.wait_idle().await;
        assert!(fs.client().aborted_uploads().is_empty());

        let mut content = Vec::new();
        fs.open(&name("sized.bin")).await.unwrap().read_to_end(&mut content).await.unwrap();
        assert_eq!(content, payload);
    }

    #[tokio::test]
    async fn failed_part_aborts_and_surfaces_on_the_stream() {
        let fs = store();
        fs.client().fail_part(2);

        let mut writer = fs.create_upload(&name("a.bin"), CreateOptions::new()).await.unwrap();
        let handle = writer.handle();

        let _ = writer.write_all(&vec![1u8; PART * 3]).await;
        let err = writer.shutdown().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        assert!(matches!(handle.status(), UploadStatus::Failed { .. }));
        fs.wait_idle().await;
        assert_eq!(fs.client().aborted_uploads().len(), 1);
        assert!(fs.client().completed_uploads().is_empty());
        assert!(!fs.exists(&name("a.bin")).await.unwrap());
    }

    #[tokio::test]
    async fn short_sized_upload_fails() {
        let fs = store();
        let mut writer = fs
            .create_upload(&name("a.bin"), CreateOptions::new().with_content_length(100))
            .await
            .unwrap();
        let handle = writer.handle();

        writer.write_all(&[0u8; 10]).await.unwrap();
        assert!(writer.shutdown().await.is_err());
        assert!(matches!(handle.status(), UploadStatus::Failed { .. }));
        fs.wait_idle().await;
        assert_eq!(fs.client().aborted_uploads().len(), 1);
    }

    #[tokio::test]
    async fn reject_policy_checks_the_store() {
        let fs = store();
        let mut writer = fs.create(&name("a.bin")).await.unwrap();
        writer.write_all(b"v1").await.unwrap();
        writer.shutdown().await.unwrap();

        let err = fs
            .create_with(&name("a.bin"), CreateOptions::new().reject_existing())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FsError::AlreadyExists { .. }));
    }

    /// Store whose part uploads never resolve
    struct StallingClient(MemoryObjectClient);

    #[async_trait]
    impl ObjectClient for StallingClient {
        async fn create_multipart(&self, key: &str) -> FsResult<UploadId> {
            self.0.create_multipart(key).await
        }

        async fn upload_part(&self, _: &str, _: &UploadId, _: u32, _: Bytes) -> FsResult<CompletedPart> {
            futures::future::pending().await
        }

        async fn complete_multipart(&self, key: &str, upload_id: &UploadId, parts: Vec<CompletedPart>) -> FsResult<()> {
            self.0.complete_multipart(key, upload_id, parts).await
        }

        async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> FsResult<()> {
            self.0.abort_multipart(key, upload_id).await
        }

        async fn get_object(&self, key: &str, range: Option<ByteRange>) -> FsResult<crate::ByteStream> {
            self.0.get_object(key, range).await
        }

        async fn head_object(&self, key: &str) -> FsResult<Option<crate::ObjectHead>> {
            self.0.head_object(key).await
        }

        async fn delete_object(&self, key: &str) -> FsResult<()> {
            self.0.delete_object(key).await
        }
    }

    #[tokio::test]
    async fn slow_store_pushes_back_and_drop_cancels_in_flight_part() {
        let fs = RemoteFs::new(
            StallingClient(MemoryObjectClient::new()),
            RemoteConfig::new().with_part_size(PART).with_queue_depth(1),
        )
        .unwrap();
        let mut writer = fs.create_upload(&name("slow.bin"), CreateOptions::new()).await.unwrap();
        let handle = writer.handle();
        let chunk = vec![3u8; PART];

        // First chunk is taken by the task, which then blocks on the part upload
        assert_eq!(writer.write(&chunk).await.unwrap(), PART);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Second chunk fills the queue
        assert_eq!(writer.write(&chunk).await.unwrap(), PART);

        {
            let mut third = tokio_test::task::spawn(writer.write(&chunk));
            tokio_test::assert_pending!(third.poll());
        }
        assert_eq!(handle.status(), UploadStatus::Uploading);

        drop(writer);
        assert_eq!(wait(&handle).await, UploadStatus::Aborted);
        fs.wait_idle().await;
        assert_eq!(fs.client().0.aborted_uploads().len(), 1);
    }

    #[tokio::test]
    async fn overlapping_idle_waits_all_resolve() {
        let fs = store();
        let mut writer = fs.create_upload(&name("a.bin"), CreateOptions::new()).await.unwrap();
        writer.write_all(b"abandoned").await.unwrap();
        drop(writer);

        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(fs.wait_idle(), fs.wait_idle(), fs.wait_idle());
        })
        .await
        .expect("idle waiters hung");

        // Uploads started after an idle wait are still tracked
        let mut writer = fs.create_upload(&name("b.bin"), CreateOptions::new()).await.unwrap();
        writer.write_all(b"kept").await.unwrap();
        writer.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), fs.wait_idle())
            .await
            .expect("idle wait hung");
        assert_eq!(fs.active_uploads(), 0);
        assert!(fs.exists(&name("b.bin")).await.unwrap());
    }

    #[test]
    fn rejects_invalid_tuning() {
        let err = RemoteFs::new(MemoryObjectClient::new(), RemoteConfig::new().with_queue_depth(0))
            .err()
            .unwrap();
        assert!(matches!(err, FsError::Config { .. }));
    }
}
