use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    AssetFs, BackendKind, ByteRange, CreateOptions, FsCapabilities, FsError, FsResult,
    LocalConfig, ObjectName, Overwrite, ReadStream, WriteStream,
};

/// Storage backend over a local directory tree.
///
/// Writes go to a hidden sibling temp file and are renamed into place on
/// shutdown, so a reader never sees a half-written object.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Create a backend rooted at `root` without touching the filesystem
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Create a backend from configuration, preparing the root directory
    pub async fn from_config(config: &LocalConfig) -> FsResult<Self> {
        match fs::metadata(&config.root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(FsError::config(format!(
                    "storage root {} is not a directory",
                    config.root.display()
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && config.create_root => {
                fs::create_dir_all(&config.root).await.map_err(FsError::backend)?;
                debug!(root = %config.root.display(), "created storage root");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FsError::config(format!(
                    "storage root {} does not exist",
                    config.root.display()
                )))
            }
            Err(e) => return Err(FsError::backend(e)),
        }
        Ok(Self::new(config.root.clone()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for `name`. `ObjectName` has already rejected traversal.
    pub fn resolve(&self, name: &ObjectName) -> PathBuf {
        self.root.join(name.to_relative_path())
    }

    async fn open_file(&self, name: &ObjectName) -> FsResult<(File, u64)> {
        let path = self.resolve(name);
        let file = File::open(&path)
            .await
            .map_err(|e| FsError::from_io(name.as_str(), e))?;
        let meta = file.metadata().await.map_err(FsError::backend)?;
        if !meta.is_file() {
            return Err(FsError::not_found(name.as_str()));
        }
        Ok((file, meta.len()))
    }
}

#[async_trait]
impl AssetFs for LocalFs {
    async fn create_with(&self, name: &ObjectName, options: CreateOptions) -> FsResult<WriteStream> {
        let target = self.resolve(name);

        if options.overwrite == Overwrite::Reject && self.exists(name).await? {
            return Err(FsError::already_exists(name.as_str()));
        }

        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await.map_err(FsError::backend)?;

        let temp_path = parent.join(format!(
            ".{}.{}.partial",
            name.file_name(),
            Uuid::new_v4().simple()
        ));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(FsError::backend)?;

        debug!(name = %name, temp = %temp_path.display(), "created local write stream");

        Ok(Box::pin(LocalWriter {
            file: Some(file),
            temp_path,
            target,
            name: name.clone(),
            options,
            written: 0,
            state: WriterState::Open,
        }))
    }

    async fn open(&self, name: &ObjectName) -> FsResult<ReadStream> {
        let (file, _) = self.open_file(name).await?;
        debug!(name = %name, "opened local object");
        Ok(Box::pin(file))
    }

    async fn open_range(&self, name: &ObjectName, range: ByteRange) -> FsResult<ReadStream> {
        let (mut file, size) = self.open_file(name).await?;
        if !range.is_valid(size) {
            return Err(FsError::invalid_range(
                name.as_str(),
                format!("{} not satisfiable for {} bytes", range.to_http_header(), size),
            ));
        }
        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(FsError::backend)?;
        Ok(Box::pin(file.take(range.length(size))))
    }

    async fn remove(&self, name: &ObjectName) -> FsResult<()> {
        let path = self.resolve(name);
        if !self.exists(name).await? {
            return Err(FsError::not_found(name.as_str()));
        }
        fs::remove_file(&path)
            .await
            .map_err(|e| FsError::from_io(name.as_str(), e))?;
        debug!(name = %name, "removed local object");
        Ok(())
    }

    async fn exists(&self, name: &ObjectName) -> FsResult<bool> {
        match fs::metadata(self.resolve(name)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FsError::backend(e)),
        }
    }

    fn capabilities(&self) -> FsCapabilities {
        FsCapabilities::basic(BackendKind::Local).with_range()
    }
}

enum WriterState {
    Open,
    Committing(BoxFuture<'static, FsResult<()>>),
    Committed,
    Failed,
}

/// Write stream over a temp file, committed into place on shutdown
struct LocalWriter {
    file: Option<File>,
    temp_path: PathBuf,
    target: PathBuf,
    name: ObjectName,
    options: CreateOptions,
    written: u64,
    state: WriterState,
}

impl LocalWriter {
    /// Give up on the write after an I/O error. The temp file may hold a
    /// prefix of the content, so it must never reach `commit`.
    fn discard(&mut self) {
        self.state = WriterState::Failed;
        drop(self.file.take());
        match std::fs::remove_file(&self.temp_path) {
            Ok(()) => debug!(name = %self.name, "discarded local write"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(temp = %self.temp_path.display(), error = %e, "failed to remove temp file"),
        }
    }

    fn commit(&self, file: File) -> BoxFuture<'static, FsResult<()>> {
        let temp = self.temp_path.clone();
        let target = self.target.clone();
        let name = self.name.clone();
        let overwrite = self.options.overwrite;
        let expected = self.options.content_length;
        let written = self.written;

        Box::pin(async move {
            let result = async {
                if let Some(len) = expected {
                    if written != len {
                        return Err(FsError::aborted(format!(
                            "{} closed after {} of {} bytes",
                            name, written, len
                        )));
                    }
                }
                file.sync_all().await.map_err(FsError::backend)?;
                drop(file);

                match overwrite {
                    Overwrite::Replace => fs::rename(&temp, &target)
                        .await
                        .map_err(FsError::backend),
                    // hard_link refuses to clobber, which makes the check atomic
                    Overwrite::Reject => {
                        fs::hard_link(&temp, &target)
                            .await
                            .map_err(|e| FsError::from_io(name.as_str(), e))?;
                        fs::remove_file(&temp).await.map_err(FsError::backend)
                    }
                }
            }
            .await;

            match &result {
                Ok(()) => debug!(name = %name, bytes = written, "committed local object"),
                Err(e) => {
                    warn!(name = %name, error = %e, "discarding local write");
                    if let Err(e) = fs::remove_file(&temp).await {
                        if e.kind() != io::ErrorKind::NotFound {
                            warn!(temp = %temp.display(), error = %e, "failed to remove temp file");
                        }
                    }
                }
            }
            result
        })
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "write stream is closed")
}

impl AsyncWrite for LocalWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !matches!(this.state, WriterState::Open) {
            return Poll::Ready(Err(closed_error()));
        }

        let mut buf = buf;
        if let Some(len) = this.options.content_length {
            let remaining = len.saturating_sub(this.written);
            if remaining == 0 {
                return Poll::Ready(Ok(0));
            }
            buf = &buf[..buf.len().min(remaining as usize)];
        }

        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(closed_error()));
        };
        match ready!(Pin::new(file).poll_write(cx, buf)) {
            Ok(n) => {
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            Err(e) => {
                warn!(name = %this.name, error = %e, "local write failed");
                this.discard();
                Poll::Ready(Err(e))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = match (&this.state, this.file.as_mut()) {
            (WriterState::Open, Some(file)) => ready!(Pin::new(file).poll_flush(cx)),
            _ => return Poll::Ready(Ok(())),
        };
        if let Err(e) = &result {
            warn!(name = %this.name, error = %e, "local flush failed");
            this.discard();
        }
        Poll::Ready(result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                WriterState::Open => {
                    if let Some(file) = this.file.as_mut() {
                        if let Err(e) = ready!(Pin::new(file).poll_flush(cx)) {
                            warn!(name = %this.name, error = %e, "local flush failed");
                            this.discard();
                            return Poll::Ready(Err(e));
                        }
                    }
                    let Some(file) = this.file.take() else {
                        return Poll::Ready(Err(closed_error()));
                    };
                    this.state = WriterState::Committing(this.commit(file));
                }
                WriterState::Committing(fut) => {
                    let result = ready!(fut.poll_unpin(cx));
                    this.state = match result {
                        Ok(()) => WriterState::Committed,
                        Err(_) => WriterState::Failed,
                    };
                    return Poll::Ready(result.map_err(io::Error::from));
                }
                WriterState::Committed => return Poll::Ready(Ok(())),
                WriterState::Failed => return Poll::Ready(Err(closed_error())),
            }
        }
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        if matches!(self.state, WriterState::Open | WriterState::Committing(_)) {
            drop(self.file.take());
            match std::fs::remove_file(&self.temp_path) {
                Ok(()) => debug!(name = %self.name, "discarded abandoned local write"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(temp = %self.temp_path.display(), error = %e, "failed to remove temp file"),
            }
        }
    }
}
