use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{FsError, FsResult, S3Config};

/// Which backend to construct, and how. Chosen once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum FsConfig {
    Local(LocalConfig),
    S3 {
        s3: S3Config,
        #[serde(default)]
        upload: RemoteConfig,
    },
}

impl FsConfig {
    /// Local backend rooted at `root`
    pub fn local<P: Into<PathBuf>>(root: P) -> Self {
        Self::Local(LocalConfig::new(root))
    }

    /// S3 backend with default upload tuning
    pub fn s3(s3: S3Config) -> Self {
        Self::S3 {
            s3,
            upload: RemoteConfig::default(),
        }
    }

    /// Load from `DOG_FS_*` environment variables.
    ///
    /// `DOG_FS_BACKEND` selects `local` (default) or `s3`. The local backend
    /// needs `DOG_FS_ROOT`; the S3 backend reads `DOG_FS_S3_*` and the
    /// optional `DOG_FS_PART_SIZE` / `DOG_FS_QUEUE_DEPTH` tuning knobs.
    pub fn from_env() -> FsResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> FsResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = lookup("DOG_FS_BACKEND").unwrap_or_else(|| "local".to_string());
        match backend.to_ascii_lowercase().as_str() {
            "local" => {
                let root = lookup("DOG_FS_ROOT")
                    .ok_or_else(|| FsError::config("DOG_FS_ROOT environment variable required"))?;
                let mut local = LocalConfig::new(root);
                if let Some(flag) = lookup("DOG_FS_CREATE_ROOT") {
                    local.create_root = parse_flag("DOG_FS_CREATE_ROOT", &flag)?;
                }
                Ok(Self::Local(local))
            }
            "s3" => {
                let s3 = S3Config::from_lookup(&lookup)?;
                let mut upload = RemoteConfig::default();
                if let Some(size) = lookup("DOG_FS_PART_SIZE") {
                    upload.part_size = parse_number("DOG_FS_PART_SIZE", &size)?;
                }
                if let Some(depth) = lookup("DOG_FS_QUEUE_DEPTH") {
                    upload.queue_depth = parse_number("DOG_FS_QUEUE_DEPTH", &depth)?;
                }
                Ok(Self::S3 { s3, upload })
            }
            other => Err(FsError::config(format!(
                "Unknown DOG_FS_BACKEND {:?} (expected \"local\" or \"s3\")",
                other
            ))),
        }
    }
}

/// Configuration for the local filesystem backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory every object name is resolved under
    pub root: PathBuf,

    /// Create `root` if it does not exist yet
    #[serde(default = "default_create_root")]
    pub create_root: bool,
}

fn default_create_root() -> bool {
    true
}

impl LocalConfig {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            create_root: true,
        }
    }

    /// Fail at construction when the root directory is missing
    pub fn require_existing_root(mut self) -> Self {
        self.create_root = false;
        self
    }
}

/// Upload tuning for the remote object backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Size of every multipart part except the last (bytes)
    pub part_size: usize,

    /// Upper bound on parts per upload
    pub max_parts: u32,

    /// Chunks buffered between the caller and the upload task
    pub queue_depth: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            part_size: 8 * 1024 * 1024, // 8MB
            max_parts: 10_000,
            queue_depth: 16,
        }
    }
}

impl RemoteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_part_size(mut self, bytes: usize) -> Self {
        self.part_size = bytes;
        self
    }

    pub fn with_max_parts(mut self, max: u32) -> Self {
        self.max_parts = max;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Check the tuning against the store's minimum part size
    pub fn validate(&self, min_part_size: usize) -> FsResult<()> {
        if self.part_size == 0 || self.part_size < min_part_size {
            return Err(FsError::config(format!(
                "part_size {} is below the store minimum of {} bytes",
                self.part_size, min_part_size
            )));
        }
        if self.max_parts == 0 || self.max_parts > 10_000 {
            return Err(FsError::config(format!(
                "max_parts {} must be within 1-10000",
                self.max_parts
            )));
        }
        if self.queue_depth == 0 {
            return Err(FsError::config("queue_depth must be at least 1"));
        }
        Ok(())
    }
}

pub(crate) fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> FsResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| FsError::config(format!("{} must be a number, got {:?}", key, raw)))
}

pub(crate) fn parse_flag(key: &str, raw: &str) -> FsResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(FsError::config(format!("{} must be a boolean, got {:?}", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn local_is_the_default_backend() {
        let config = FsConfig::from_lookup(lookup(&[("DOG_FS_ROOT", "/srv/assets")])).unwrap();
        assert_eq!(config, FsConfig::local("/srv/assets"));
    }

    #[test]
    fn local_requires_root() {
        let err = FsConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, FsError::Config { .. }));
    }

    #[test]
    fn s3_from_env() {
        let config = FsConfig::from_lookup(lookup(&[
            ("DOG_FS_BACKEND", "S3"),
            ("DOG_FS_S3_BUCKET", "assets"),
            ("DOG_FS_S3_REGION", "eu-west-1"),
            ("DOG_FS_PART_SIZE", "16777216"),
        ]))
        .unwrap();

        match config {
            FsConfig::S3 { s3, upload } => {
                assert_eq!(s3.bucket, "assets");
                assert_eq!(s3.region.as_deref(), Some("eu-west-1"));
                assert_eq!(upload.part_size, 16 * 1024 * 1024);
                assert_eq!(upload.queue_depth, RemoteConfig::default().queue_depth);
            }
            other => panic!("expected s3 config, got {:?}", other),
        }
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = FsConfig::from_lookup(lookup(&[("DOG_FS_BACKEND", "ftp")])).unwrap_err();
        assert!(matches!(err, FsError::Config { .. }));
    }

    #[test]
    fn deserializes_tagged_config() {
        let config: FsConfig = serde_json::from_value(serde_json::json!({
            "backend": "s3",
            "s3": { "bucket": "media", "force_path_style": true },
            "upload": { "part_size": 5242880 }
        }))
        .unwrap();

        match config {
            FsConfig::S3 { s3, upload } => {
                assert_eq!(s3.bucket, "media");
                assert!(s3.force_path_style);
                assert_eq!(upload.part_size, 5 * 1024 * 1024);
                assert_eq!(upload.max_parts, 10_000);
            }
            other => panic!("expected s3 config, got {:?}", other),
        }

        let config: FsConfig =
            serde_json::from_value(serde_json::json!({ "backend": "local", "root": "/data" })).unwrap();
        assert_eq!(config, FsConfig::local("/data"));
    }

    #[test]
    fn remote_config_validation() {
        assert!(RemoteConfig::default().validate(5 * 1024 * 1024).is_ok());
        assert!(RemoteConfig::new().with_part_size(1024).validate(5 * 1024 * 1024).is_err());
        assert!(RemoteConfig::new().with_queue_depth(0).validate(0).is_err());
        assert!(RemoteConfig::new().with_max_parts(20_000).validate(0).is_err());
    }
}
