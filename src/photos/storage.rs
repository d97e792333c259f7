/// Photo storage backends
use crate::error::{HoleError, HoleResult};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Storage backend for photo bytes
///
/// Keys are relative paths of the form `{pothole_id}/{photo_id}.{ext}`.
#[async_trait]
pub trait PhotoBackend: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> HoleResult<()>;

    async fn get(&self, key: &str) -> HoleResult<Option<Vec<u8>>>;

    /// Missing keys are not an error
    async fn delete(&self, key: &str) -> HoleResult<()>;
}

/// Photos on the local filesystem, one directory per pothole
#[derive(Clone)]
pub struct DiskPhotoBackend {
    base_path: PathBuf,
}

impl DiskPhotoBackend {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Resolve a key, refusing anything that could leave the base directory
    fn path_for(&self, key: &str) -> HoleResult<PathBuf> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(HoleError::Validation(format!("Invalid photo key: {}", key)));
        }
        Ok(self.base_path.join(relative))
    }
}

#[async_trait]
impl PhotoBackend for DiskPhotoBackend {
    async fn put(&self, key: &str, data: &[u8]) -> HoleResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> HoleResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> HoleResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let backend = DiskPhotoBackend::new(dir.path().to_path_buf());

        backend.put("pothole-1/photo.jpg", b"jpeg bytes").await.unwrap();
        assert_eq!(
            backend.get("pothole-1/photo.jpg").await.unwrap(),
            Some(b"jpeg bytes".to_vec())
        );
        assert!(dir.path().join("pothole-1").is_dir());

        backend.delete("pothole-1/photo.jpg").await.unwrap();
        assert_eq!(backend.get("pothole-1/photo.jpg").await.unwrap(), None);
        backend.delete("pothole-1/photo.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempdir().unwrap();
        let backend = DiskPhotoBackend::new(dir.path().to_path_buf());

        assert!(backend.put("../outside.jpg", b"x").await.is_err());
        assert!(backend.put("/etc/passwd", b"x").await.is_err());
        assert!(backend.get("").await.is_err());
    }
}
