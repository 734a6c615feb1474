//! # dog-fs: Streaming asset storage for DogRS applications
//!
//! `dog-fs` gives services one contract for creating, reading and deleting
//! named binary objects ("assets"), whether they live on a local disk or in an
//! S3-compatible object store.
//!
//! ## Key Features
//!
//! - **Streaming-first**: objects are written through `AsyncWrite` and read
//!   through `AsyncRead`; nothing is buffered whole in memory
//! - **No half-written objects**: local writes are renamed into place on
//!   shutdown, remote writes only become visible when the multipart upload
//!   completes
//! - **Deterministic cleanup**: dropping a write stream removes the temp file
//!   or aborts the multipart upload, without any extra call from the caller
//! - **One backend per process**: selected from configuration at startup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_fs::prelude::*;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # #[tokio::main]
//! # async fn main() -> FsResult<()> {
//! // DOG_FS_BACKEND=local DOG_FS_ROOT=/srv/assets
//! let fs = AnyFs::from_env().await?;
//! let name = ObjectName::parse("upload/photo1.jpg")?;
//!
//! let mut writer = fs.create(&name).await?;
//! writer.write_all(b"...jpeg bytes...").await?;
//! writer.shutdown().await?; // commit
//!
//! let mut content = Vec::new();
//! fs.open(&name).await?.read_to_end(&mut content).await?;
//!
//! fs.remove(&name).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Your Service  │  ← holds an AnyFs
//! ├─────────────────┤
//! │     AssetFs     │  ← create / open / remove
//! ├────────┬────────┤
//! │LocalFs │RemoteFs│  ← RemoteFs drives uploads over an ObjectClient
//! └────────┴────────┘
//! ```

mod backend;
mod client;
mod config;
mod error;
mod local;
mod memory;
mod remote;
mod s3;
pub mod store;
mod types;
mod upload;

pub use backend::AnyFs;
pub use client::{CompletedPart, ObjectClient, ObjectHead};
pub use config::{FsConfig, LocalConfig, RemoteConfig};
pub use error::{FsError, FsResult};
pub use local::LocalFs;
pub use memory::MemoryObjectClient;
pub use remote::{RemoteFs, RemoteWriter, UploadHandle};
pub use s3::{S3Client, S3Config, S3_MIN_PART_SIZE};
pub use store::{AssetFs, BackendKind, FsCapabilities};
pub use types::{
    from_byte_stream, into_byte_stream, ByteRange, ByteStream, CreateOptions, ObjectName,
    Overwrite, ReadStream, UploadId, WriteStream,
};
pub use upload::{UploadEffect, UploadEvent, UploadSession, UploadStatus, UploadTracker};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        AnyFs, AssetFs, ByteRange, CreateOptions, FsConfig, FsError, FsResult, ObjectName,
        ReadStream, WriteStream,
    };
}
