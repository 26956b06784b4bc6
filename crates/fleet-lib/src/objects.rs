//! Scenario file storage
//!
//! File bytes live in an [`ObjectStore`] under `scenario_{id}/{name}` keys;
//! the metadata record (size, SHA-256, inline copy of small text files)
//! lives in the [`FleetStore`].

use crate::error::{FleetError, Result};
use crate::models::{FileId, ScenarioFile, ScenarioId};
use crate::store::{write_atomically, FleetStore};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Default upload limit (10 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Files below this size that decode as UTF-8 keep an inline copy
const INLINE_CONTENT_LIMIT: usize = 1024 * 1024;

pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "java", "go", "rs", "sh", "bat", "txt", "json", "yaml", "yml",
];

const SCRIPT_EXTENSIONS: &[&str] = &["py", "js", "ts", "java", "go", "rs", "sh", "bat"];

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("object {0} not found")]
    NotFound(String),

    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ObjectStoreError> for FleetError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::InvalidKey(_) => FleetError::Validation(err.to_string()),
            other => FleetError::Storage(other.to_string()),
        }
    }
}

/// Flat key/value blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
}

/// Objects stored as files below a root directory
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys are relative `/`-separated paths without `.` or `..` segments
    fn path_for(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        let relative = Path::new(key);
        let plain = !key.is_empty()
            && !key.contains('\\')
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !plain {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key)?;
        write_atomically(&path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => ObjectStoreError::NotFound(key.to_string()),
            _ => ObjectStoreError::Io(e),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => ObjectStoreError::NotFound(key.to_string()),
            _ => ObjectStoreError::Io(e),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

/// An upload as received from a client
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub description: Option<String>,
}

/// Hex-encoded SHA-256
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn is_script_file(file_name: &str) -> bool {
    extension(file_name).is_some_and(|ext| SCRIPT_EXTENSIONS.contains(&ext.as_str()))
}

fn inline_copy(bytes: &[u8]) -> Option<String> {
    if bytes.len() < INLINE_CONTENT_LIMIT {
        String::from_utf8(bytes.to_vec()).ok()
    } else {
        None
    }
}

/// Upload, read, verify and delete scenario files
pub struct ScenarioFileService {
    store: Arc<dyn FleetStore>,
    objects: Arc<dyn ObjectStore>,
    max_file_size: u64,
}

impl ScenarioFileService {
    pub fn new(store: Arc<dyn FleetStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            objects,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size as u64 > self.max_file_size {
            return Err(FleetError::Validation(format!(
                "file size {} bytes exceeds limit of {} bytes",
                size, self.max_file_size
            )));
        }
        Ok(())
    }

    fn check_name(&self, file_name: &str) -> Result<()> {
        let plain = !file_name.trim().is_empty()
            && !file_name.contains('/')
            && !file_name.contains('\\')
            && file_name != "."
            && file_name != "..";
        if !plain {
            return Err(FleetError::Validation(format!(
                "invalid file name: {:?}",
                file_name
            )));
        }

        match extension(file_name) {
            Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
            Some(ext) => Err(FleetError::Validation(format!(
                "file type .{} is not allowed",
                ext
            ))),
            None => Err(FleetError::Validation(format!(
                "file {} has no extension",
                file_name
            ))),
        }
    }

    /// First free key of the form `scenario_{id}/{stem}[_{n}].{ext}`
    async fn free_key(&self, scenario_id: ScenarioId, file_name: &str) -> Result<String> {
        let path = Path::new(file_name);
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name);
        let suffix = extension(file_name)
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();

        let mut key = format!("scenario_{}/{}{}", scenario_id, stem, suffix);
        let mut counter = 1;
        while self.objects.exists(&key).await? {
            key = format!("scenario_{}/{}_{}{}", scenario_id, stem, counter, suffix);
            counter += 1;
        }
        Ok(key)
    }

    pub async fn upload(&self, scenario_id: ScenarioId, upload: FileUpload) -> Result<ScenarioFile> {
        self.store.get_scenario(scenario_id).await?;
        self.check_name(&upload.file_name)?;
        self.check_size(upload.bytes.len())?;

        let object_key = self.free_key(scenario_id, &upload.file_name).await?;
        self.objects.put(&object_key, &upload.bytes).await?;

        let now = Utc::now();
        let record = ScenarioFile {
            id: 0,
            scenario_id,
            is_script: is_script_file(&upload.file_name),
            file_name: upload.file_name,
            object_key: object_key.clone(),
            file_size: upload.bytes.len() as u64,
            content_type: upload
                .content_type
                .filter(|ct| !ct.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            content_hash: content_hash(&upload.bytes),
            content: inline_copy(&upload.bytes),
            description: upload.description,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_file(record).await {
            Ok(stored) => {
                info!(
                    file_id = stored.id,
                    scenario_id,
                    object_key = %stored.object_key,
                    size = stored.file_size,
                    "Scenario file stored"
                );
                Ok(stored)
            }
            Err(e) => {
                if let Err(cleanup) = self.objects.delete(&object_key).await {
                    warn!(object_key = %object_key, error = %cleanup, "Orphaned object left behind");
                }
                Err(e)
            }
        }
    }

    pub async fn get(&self, file_id: FileId) -> Result<ScenarioFile> {
        self.store.get_file(file_id).await
    }

    pub async fn list(&self, scenario_id: ScenarioId) -> Result<Vec<ScenarioFile>> {
        self.store.list_files(scenario_id).await
    }

    /// File bytes, served from the inline copy when there is one
    pub async fn read(&self, file_id: FileId) -> Result<Vec<u8>> {
        let file = self.store.get_file(file_id).await?;
        if let Some(content) = file.content {
            return Ok(content.into_bytes());
        }
        Ok(self.objects.get(&file.object_key).await?)
    }

    /// Replace a file's content in place, keeping its key
    pub async fn update_content(&self, file_id: FileId, content: String) -> Result<ScenarioFile> {
        let mut file = self.store.get_file(file_id).await?;
        self.check_size(content.len())?;

        let bytes = content.into_bytes();
        self.objects.put(&file.object_key, &bytes).await?;

        file.file_size = bytes.len() as u64;
        file.content_hash = content_hash(&bytes);
        file.content = inline_copy(&bytes);
        self.store.update_file(file).await
    }

    /// Whether the stored object still matches the recorded hash
    pub async fn verify(&self, file_id: FileId) -> Result<bool> {
        let file = self.store.get_file(file_id).await?;
        let bytes = self.objects.get(&file.object_key).await?;
        let intact = content_hash(&bytes) == file.content_hash;
        if !intact {
            warn!(file_id, object_key = %file.object_key, "Scenario file failed integrity check");
        }
        Ok(intact)
    }

    pub async fn delete(&self, file_id: FileId) -> Result<()> {
        let file = self.store.get_file(file_id).await?;
        match self.objects.delete(&file.object_key).await {
            Ok(()) => {}
            Err(ObjectStoreError::NotFound(key)) => {
                warn!(file_id, object_key = %key, "Object already gone, removing record");
            }
            Err(e) => return Err(e.into()),
        }
        self.store.delete_file(file_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InterfaceScenario;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        objects: Arc<FsObjectStore>,
        service: ScenarioFileService,
        scenario_id: ScenarioId,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        let scenario = store
            .insert_scenario(InterfaceScenario::new(1, "login", "/login", "POST"))
            .await
            .unwrap();
        let objects = Arc::new(FsObjectStore::new(dir.path()));
        let service = ScenarioFileService::new(store, objects.clone()).with_max_file_size(64);
        Fixture {
            _dir: dir,
            objects,
            service,
            scenario_id: scenario.id,
        }
    }

    fn upload(name: &str, bytes: &[u8]) -> FileUpload {
        FileUpload {
            file_name: name.to_string(),
            content_type: None,
            bytes: bytes.to_vec(),
            description: None,
        }
    }

    #[tokio::test]
    async fn test_upload_records_hash_and_inline_content() {
        let f = fixture().await;
        let file = f
            .service
            .upload(f.scenario_id, upload("users.json", b"[\"alice\"]"))
            .await
            .unwrap();

        assert_eq!(file.object_key, format!("scenario_{}/users.json", f.scenario_id));
        assert_eq!(file.file_size, 9);
        assert_eq!(file.content_hash, content_hash(b"[\"alice\"]"));
        assert_eq!(file.content.as_deref(), Some("[\"alice\"]"));
        assert_eq!(file.content_type, DEFAULT_CONTENT_TYPE);
        assert!(!file.is_script);
        assert!(f.objects.exists(&file.object_key).await.unwrap());
        assert!(f.service.verify(file.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_names_get_numbered_keys() {
        let f = fixture().await;
        let first = f
            .service
            .upload(f.scenario_id, upload("load.py", b"print(1)"))
            .await
            .unwrap();
        let second = f
            .service
            .upload(f.scenario_id, upload("load.py", b"print(2)"))
            .await
            .unwrap();

        assert!(first.is_script);
        assert_eq!(second.object_key, format!("scenario_{}/load_1.py", f.scenario_id));
        assert_eq!(f.service.read(second.id).await.unwrap(), b"print(2)");
        assert_eq!(f.service.list(f.scenario_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upload_limits() {
        let f = fixture().await;
        let too_big = vec![b'a'; 65];
        assert!(matches!(
            f.service.upload(f.scenario_id, upload("big.txt", &too_big)).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            f.service.upload(f.scenario_id, upload("tool.exe", b"MZ")).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            f.service.upload(f.scenario_id, upload("Makefile", b"all:")).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            f.service.upload(f.scenario_id, upload("../escape.sh", b"x")).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            f.service.upload(999, upload("ok.txt", b"x")).await,
            Err(FleetError::NotFound { kind: "scenario", .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_object_fails_verification() {
        let f = fixture().await;
        let file = f
            .service
            .upload(f.scenario_id, upload("data.yaml", b"a: 1"))
            .await
            .unwrap();

        f.objects.put(&file.object_key, b"a: 2").await.unwrap();
        assert!(!f.service.verify(file.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_content_rehashes() {
        let f = fixture().await;
        let file = f
            .service
            .upload(f.scenario_id, upload("run.sh", b"echo one"))
            .await
            .unwrap();

        let updated = f
            .service
            .update_content(file.id, "echo two".to_string())
            .await
            .unwrap();
        assert_eq!(updated.object_key, file.object_key);
        assert_eq!(updated.content_hash, content_hash(b"echo two"));
        assert_eq!(f.objects.get(&file.object_key).await.unwrap(), b"echo two");
        assert!(f.service.verify(file.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_object() {
        let f = fixture().await;
        let file = f
            .service
            .upload(f.scenario_id, upload("notes.txt", b"hi"))
            .await
            .unwrap();

        f.objects.delete(&file.object_key).await.unwrap();
        f.service.delete(file.id).await.unwrap();
        assert!(matches!(
            f.service.get(file.id).await,
            Err(FleetError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_object_keys_cannot_escape_root() {
        let dir = TempDir::new().unwrap();
        let objects = FsObjectStore::new(dir.path());
        for key in ["", "/etc/passwd", "a/../../b", "./a", "a\\b"] {
            assert!(
                matches!(objects.put(key, b"x").await, Err(ObjectStoreError::InvalidKey(_))),
                "{}",
                key
            );
        }
        assert!(matches!(
            objects.get("missing/file.txt").await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }
}
