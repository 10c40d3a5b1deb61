//! Object store access for incident extracts: S3 and local-directory backends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fdwh-storage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("s3 {operation} on bucket {bucket} failed: {message}")]
    S3 {
        operation: &'static str,
        bucket: String,
        message: String,
    },
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, bucket: &str) -> Result<Vec<ObjectInfo>, StoreError>;
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// Newest object by modification time; equal timestamps resolve to the
/// greatest key.
pub fn latest_object(objects: &[ObjectInfo]) -> Option<&ObjectInfo> {
    objects
        .iter()
        .max_by(|a, b| a.last_modified.cmp(&b.last_modified).then_with(|| a.key.cmp(&b.key)))
}

pub async fn find_latest(
    store: &dyn ObjectStore,
    bucket: &str,
) -> Result<Option<ObjectInfo>, StoreError> {
    let objects = store.list(bucket).await?;
    Ok(latest_object(&objects).cloned())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Where extracts live: bucket name plus either S3 coordinates or a local
/// directory standing in for the object store.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub bucket: String,
    pub s3: S3Settings,
    pub local_dir: Option<PathBuf>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            bucket: "fire-department".to_string(),
            s3: S3Settings::default(),
            local_dir: None,
        }
    }
}

impl StoreSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bucket: std::env::var("FD_BUCKET").unwrap_or(defaults.bucket),
            s3: S3Settings {
                region: std::env::var("FD_REGION").unwrap_or(defaults.s3.region),
                endpoint: match std::env::var("FD_S3_ENDPOINT") {
                    Ok(v) if v.is_empty() => None,
                    Ok(v) => Some(v),
                    Err(_) => defaults.s3.endpoint,
                },
            },
            local_dir: std::env::var("FD_LOCAL_STORE_DIR").ok().map(PathBuf::from),
        }
    }

    pub async fn connect(&self) -> Box<dyn ObjectStore> {
        match &self.local_dir {
            Some(dir) => Box::new(LocalObjectStore::new(dir.clone())),
            None => Box::new(S3ObjectStore::connect(&self.s3).await),
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub region: String,
    /// Endpoint override, e.g. LocalStack at `http://localhost:4566`.
    pub endpoint: Option<String>,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: Some("http://localhost:4566".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub async fn connect(settings: &S3Settings) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            // LocalStack and MinIO do not serve virtual-hosted bucket names
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::from_client(aws_sdk_s3::Client::from_conf(builder.build()))
    }

    pub fn from_client(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, bucket: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        let mut objects = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|err| StoreError::S3 {
                operation: "list_objects_v2",
                bucket: bucket.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            })?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let last_modified = object
                    .last_modified()
                    .and_then(|ts| DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()))
                    .unwrap_or(DateTime::UNIX_EPOCH);
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    last_modified,
                    size: object.size().unwrap_or(0).max(0) as u64,
                });
            }

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    StoreError::S3 {
                        operation: "get_object",
                        bucket: bucket.to_string(),
                        message: DisplayErrorContext(&err).to_string(),
                    }
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|err| StoreError::S3 {
                operation: "get_object body",
                bucket: bucket.to_string(),
                message: err.to_string(),
            })?
            .into_bytes()
            .to_vec();
        debug!(bucket, key, bytes = bytes.len(), "object read");
        Ok(bytes)
    }

    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type("text/csv")
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|err| StoreError::S3 {
                operation: "put_object",
                bucket: bucket.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            })?;
        Ok(())
    }
}

/// Directory-backed store laid out as `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let valid = |s: &str| {
            !s.is_empty() && !s.starts_with('.') && !s.contains('/') && !s.contains('\\')
        };
        if !valid(bucket) {
            return Err(StoreError::InvalidKey(bucket.to_string()));
        }
        if !valid(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(bucket).join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list(&self, bucket: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        let dir = self.root.join(bucket);
        if !fs::try_exists(&dir)
            .await
            .map_err(|e| StoreError::io("checking bucket directory", &dir, e))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| StoreError::io("reading bucket directory", &dir, e))?;
        let mut objects = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io("reading bucket directory", &dir, e))?
        {
            let key = entry.file_name().to_string_lossy().to_string();
            if key.starts_with('.') {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| StoreError::io("reading metadata of", &entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }
            let last_modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(DateTime::UNIX_EPOCH);
            objects.push(ObjectInfo {
                key,
                last_modified,
                size: metadata.len(),
            });
        }
        Ok(objects)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(err) => Err(StoreError::io("reading object", &path, err)),
        }
    }

    /// Write through a temp file and rename so readers never see a partial
    /// object.
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        let dir = self.root.join(bucket);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io("creating bucket directory", &dir, e))?;

        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io("opening temp object", &temp_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io("writing temp object", &temp_path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io("flushing temp object", &temp_path, e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io("renaming temp object to", &path, err));
        }
        debug!(bucket, key, bytes = bytes.len(), "object written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn info(key: &str, hour: u32) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            last_modified: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).single().unwrap(),
            size: 0,
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn latest_object_is_newest_by_modification_time() {
        let objects = vec![
            info("fire_incidents_20240101_000000.csv", 9),
            info("fire_incidents_20240301_000000.csv", 11),
            info("fire_incidents_20240201_000000.csv", 10),
        ];
        assert_eq!(
            latest_object(&objects).map(|o| o.key.as_str()),
            Some("fire_incidents_20240301_000000.csv")
        );
        assert!(latest_object(&[]).is_none());
    }

    #[test]
    fn latest_object_ties_resolve_by_key() {
        let objects = vec![info("b.csv", 9), info("c.csv", 9), info("a.csv", 9)];
        assert_eq!(latest_object(&objects).unwrap().key, "c.csv");
    }

    #[tokio::test]
    async fn local_store_round_trips_objects_and_lists_them() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());

        assert!(store.list("fire-department").await.unwrap().is_empty());

        store
            .put("fire-department", "extract_a.csv", b"id\n1\n")
            .await
            .expect("put");
        store
            .put("fire-department", "extract_a.csv", b"id\n1\n2\n")
            .await
            .expect("overwrite");

        let listed = store.list("fire-department").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "extract_a.csv");
        assert_eq!(listed[0].size, 7);

        let bytes = store.get("fire-department", "extract_a.csv").await.unwrap();
        assert_eq!(bytes, b"id\n1\n2\n");

        let latest = find_latest(&store, "fire-department").await.unwrap();
        assert_eq!(latest.map(|o| o.key), Some("extract_a.csv".to_string()));
    }

    #[tokio::test]
    async fn local_store_reports_missing_objects_and_bad_keys() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());

        let err = store.get("fire-department", "nope.csv").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        let err = store.put("fire-department", "../escape.csv", b"x").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
