use async_trait::async_trait;
use tracing::info;

use crate::{
    AssetFs, ByteRange, CreateOptions, FsCapabilities, FsConfig, FsResult, LocalFs, ObjectName,
    ReadStream, RemoteFs, S3Client, WriteStream,
};

/// The one storage backend an application runs with, chosen at startup.
pub enum AnyFs {
    Local(LocalFs),
    S3(RemoteFs<S3Client>),
}

impl AnyFs {
    /// Build the backend described by `config`
    pub async fn from_config(config: FsConfig) -> FsResult<Self> {
        match config {
            FsConfig::Local(local) => {
                let fs = LocalFs::from_config(&local).await?;
                info!(root = %local.root.display(), "using local asset storage");
                Ok(Self::Local(fs))
            }
            FsConfig::S3 { s3, upload } => {
                let client = S3Client::new(&s3).await?;
                let fs = RemoteFs::new(client, upload)?;
                info!(bucket = %s3.bucket, part_size = fs.config().part_size, "using S3 asset storage");
                Ok(Self::S3(fs))
            }
        }
    }

    /// Build the backend described by `DOG_FS_*` environment variables
    pub async fn from_env() -> FsResult<Self> {
        Self::from_config(FsConfig::from_env()?).await
    }

    fn inner(&self) -> &dyn AssetFs {
        match self {
            Self::Local(fs) => fs,
            Self::S3(fs) => fs,
        }
    }
}

#[async_trait]
impl AssetFs for AnyFs {
    async fn create_with(&self, name: &ObjectName, options: CreateOptions) -> FsResult<WriteStream> {
        self.inner().create_with(name, options).await
    }

    async fn open(&self, name: &ObjectName) -> FsResult<ReadStream> {
        self.inner().open(name).await
    }

    async fn open_range(&self, name: &ObjectName, range: ByteRange) -> FsResult<ReadStream> {
        self.inner().open_range(name, range).await
    }

    async fn remove(&self, name: &ObjectName) -> FsResult<()> {
        self.inner().remove(name).await
    }

    async fn exists(&self, name: &ObjectName) -> FsResult<bool> {
        self.inner().exists(name).await
    }

    fn capabilities(&self) -> FsCapabilities {
        self.inner().capabilities()
    }
}
