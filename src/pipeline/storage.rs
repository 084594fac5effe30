//! Object storage used to persist generated images

use anyhow::{bail, Context, Result};
use log::debug;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `path` and return a URL for it
    fn put(&self, bytes: &[u8], path: &str, content_type: &str) -> Result<String>;

    fn get(&self, path: &str) -> Result<Vec<u8>>;
}

/// Filesystem-backed store rooted at a directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            bail!("invalid object path '{}'", path);
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, bytes: &[u8], path: &str, content_type: &str) -> Result<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&target, bytes).with_context(|| format!("Failed to write {}", target.display()))?;
        debug!("Stored {} bytes ({}) at {}", bytes.len(), content_type, target.display());

        Ok(match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), path),
            None => {
                let absolute = fs::canonicalize(&target).unwrap_or(target);
                format!("file://{}", absolute.display())
            }
        })
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        fs::read(&target).with_context(|| format!("Failed to read {}", target.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_get() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalObjectStore::new(dir.path(), Some("https://cdn.example.com/".to_string()));
        let url = store.put(b"abc", "ai_generated/minimal_1.jpg", "image/jpeg")?;
        assert_eq!(url, "https://cdn.example.com/ai_generated/minimal_1.jpg");
        assert_eq!(store.get("ai_generated/minimal_1.jpg")?, b"abc");
        Ok(())
    }

    #[test]
    fn test_file_url_without_base() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalObjectStore::new(dir.path(), None);
        let url = store.put(b"x", "a.png", "image/png")?;
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("a.png"));
        Ok(())
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let store = LocalObjectStore::new("/tmp/unused", None);
        assert!(store.put(b"x", "../evil.jpg", "image/jpeg").is_err());
        assert!(store.put(b"x", "/etc/evil.jpg", "image/jpeg").is_err());
        assert!(store.get("").is_err());
    }
}
