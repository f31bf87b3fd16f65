//! Module storage: uploaded wasm binaries keyed by name. Last write wins.

use crate::error::{Result, SandtraceError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MAX_MODULE_NAME_LEN: usize = 128;

/// Rejects names that could escape the store directory or are unreasonable
/// as identifiers.
pub fn validate_module_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SandtraceError::InvalidUpload("module name is empty".to_string()));
    }
    if name.len() > MAX_MODULE_NAME_LEN {
        return Err(SandtraceError::InvalidUpload(format!(
            "module name exceeds {} characters",
            MAX_MODULE_NAME_LEN
        )));
    }
    if name.starts_with('.') {
        return Err(SandtraceError::InvalidUpload(format!("module name '{}' starts with '.'", name)));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(SandtraceError::InvalidUpload(format!(
            "module name '{}' contains invalid character {:?}",
            name, c
        )));
    }
    Ok(())
}

#[async_trait]
pub trait ModuleStore: Send + Sync {
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// `ModuleNotFound` when nothing was ever stored under `name`.
    async fn load(&self, name: &str) -> Result<Vec<u8>>;
}

/// One file per module in a directory.
pub struct FsModuleStore {
    dir: PathBuf,
}

impl FsModuleStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandtraceError::Storage(format!("Failed to create {}: {}", dir.display(), e)))?;
        info!(dir = %dir.display(), "module store ready");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.wasm", name))
    }
}

#[async_trait]
impl ModuleStore for FsModuleStore {
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<()> {
        validate_module_name(name)?;
        let path = self.path_for(name);
        let staging = self.dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| SandtraceError::Storage(format!("Failed to write module {}: {}", name, e)))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| SandtraceError::Storage(format!("Failed to store module {}: {}", name, e)))?;
        debug!(module = name, bytes = bytes.len(), path = %path.display(), "module stored");
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Vec<u8>> {
        validate_module_name(name).map_err(|_| SandtraceError::ModuleNotFound(name.to_string()))?;
        match tokio::fs::read(self.path_for(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SandtraceError::ModuleNotFound(name.to_string())),
            Err(e) => Err(SandtraceError::Storage(format!("Failed to read module {}: {}", name, e))),
        }
    }
}

#[derive(Default)]
pub struct MemoryModuleStore {
    modules: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryModuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModuleStore for MemoryModuleStore {
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<()> {
        validate_module_name(name)?;
        self.modules.write().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Vec<u8>> {
        self.modules
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SandtraceError::ModuleNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_module_name("demo").is_ok());
        assert!(validate_module_name("demo-v1.2_final").is_ok());
        assert!(validate_module_name("").is_err());
        assert!(validate_module_name(".hidden").is_err());
        assert!(validate_module_name("../etc/passwd").is_err());
        assert!(validate_module_name("a/b").is_err());
        assert!(validate_module_name(&"x".repeat(129)).is_err());
    }

    #[tokio::test]
    async fn test_fs_store_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsModuleStore::open(dir.path().join("modules")).await.unwrap();
        store.store("demo", b"first").await.unwrap();
        store.store("demo", b"second").await.unwrap();
        assert_eq!(store.load("demo").await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_fs_store_missing_module() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsModuleStore::open(dir.path()).await.unwrap();
        assert!(matches!(store.load("nope").await, Err(SandtraceError::ModuleNotFound(_))));
        assert!(matches!(store.load("../nope").await, Err(SandtraceError::ModuleNotFound(_))));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryModuleStore::new();
        assert!(matches!(store.store("bad name", b"x").await, Err(SandtraceError::InvalidUpload(_))));
        store.store("demo", b"wasm").await.unwrap();
        assert_eq!(store.load("demo").await.unwrap(), b"wasm");
    }
}
