//! Object storage on a mounted durable volume.
//!
//! Each key is a relative path under the root. Object metadata is kept in
//! `.meta/<key>.json` beside the data tree so listings only see objects.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::core::platform::{Metadata, ObjectInfo, ObjectStorage};

const META_DIR: &str = ".meta";

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && relative.components().next() != Some(Component::Normal(META_DIR.as_ref()));
        if !clean {
            bail!("invalid object key '{key}'");
        }
        Ok(self.root.join(relative))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    fn uri(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }

    async fn write_meta(&self, key: &str, metadata: &Metadata) -> Result<()> {
        let path = self.meta_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec(metadata)?).await?;
        Ok(())
    }

    async fn read_meta(&self, key: &str) -> Metadata {
        let path = self.meta_path(key);
        match tokio::fs::read(&path).await {
            Ok(body) => serde_json::from_slice(&body).unwrap_or_else(|e| {
                warn!(key, error = %e, "Unreadable object metadata");
                Metadata::new()
            }),
            Err(_) => Metadata::new(),
        }
    }
}

/// Temporary sibling the object is written to before the rename.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

#[async_trait]
impl ObjectStorage for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: Metadata) -> Result<String> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let partial = partial_path(&path);
        tokio::task::spawn_blocking({
            let partial = partial.clone();
            move || -> Result<()> {
                use std::io::Write;
                let mut file = fs::File::create(&partial)?;
                file.write_all(&bytes)?;
                file.sync_all()?;
                Ok(())
            }
        })
        .await??;
        tokio::fs::rename(&partial, &path).await?;
        self.write_meta(key, &metadata).await?;

        debug!(key, "Object stored");
        Ok(self.uri(key))
    }

    async fn put_file(&self, key: &str, source: &Path, metadata: Metadata) -> Result<String> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&path);
        tokio::fs::copy(source, &partial)
            .await
            .with_context(|| format!("Failed to copy {}", source.display()))?;
        tokio::fs::rename(&partial, &path).await?;
        self.write_meta(key, &metadata).await?;

        debug!(key, "Object stored from file");
        Ok(self.uri(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read object {key}"))
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let path = self.object_path(key)?;
        tokio::fs::copy(&path, dest)
            .await
            .with_context(|| format!("Failed to read object {key}"))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let root = self.root.clone();
        let mut found = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            if root.is_dir() {
                walk(&root, &root, &mut found)?;
            }
            Ok::<_, anyhow::Error>(found)
        })
        .await??;

        found.retain(|(key, _)| key.starts_with(prefix));
        found.sort();

        let mut objects = Vec::with_capacity(found.len());
        for (key, size_bytes) in found {
            let metadata = self.read_meta(&key).await;
            objects.push(ObjectInfo {
                key,
                size_bytes,
                metadata,
            });
        }
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(anyhow!("Failed to delete object {key}: {e}")),
        }
        let _ = tokio::fs::remove_file(self.meta_path(key)).await;

        // Drop directories the deletion left empty, stopping at the root
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root.as_path() || tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .with_context(|| format!("Storage root {} is not mounted", self.root.display()))?;
        if !meta.is_dir() {
            bail!("Storage root {} is not a directory", self.root.display());
        }
        Ok(())
    }
}

fn walk(base: &Path, current: &Path, found: &mut Vec<(String, u64)>) -> Result<()> {
    for entry in fs::read_dir(current)
        .with_context(|| format!("Failed to read directory {}", current.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let meta = path.symlink_metadata()?;

        if meta.is_dir() {
            if current == base && entry.file_name() == META_DIR {
                continue;
            }
            walk(base, &path, found)?;
        } else if meta.is_file() {
            if path.extension().is_some_and(|e| e == "partial") {
                continue;
            }
            let relative = path.strip_prefix(base)?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            found.push((key, meta.len()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_list_get_delete() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        let mut meta = Metadata::new();
        meta.insert("component".into(), "database".into());
        let uri = store
            .put("prod/m1/database.dump.enc", b"abc".to_vec(), meta.clone())
            .await
            .unwrap();
        assert!(uri.starts_with("file://"));
        store
            .put("prod/m1/manifest.json", b"{}".to_vec(), Metadata::new())
            .await
            .unwrap();
        store
            .put("staging/m2/manifest.json", b"{}".to_vec(), Metadata::new())
            .await
            .unwrap();

        let listed = store.list("prod/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["prod/m1/database.dump.enc", "prod/m1/manifest.json"]);
        assert_eq!(listed[0].size_bytes, 3);
        assert_eq!(listed[0].metadata, meta);

        assert_eq!(store.get("prod/m1/database.dump.enc").await.unwrap(), b"abc");

        store.delete("prod/m1/database.dump.enc").await.unwrap();
        store.delete("prod/m1/manifest.json").await.unwrap();
        assert!(store.list("prod/").await.unwrap().is_empty());
        assert!(!dir.path().join("prod").exists());
    }

    #[tokio::test]
    async fn missing_root_lists_empty() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("not-mounted"));
        assert!(store.list("prod/").await.unwrap().is_empty());
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    async fn keys_cannot_escape_root() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.put("../x", vec![], Metadata::new()).await.is_err());
        assert!(store.put("/etc/x", vec![], Metadata::new()).await.is_err());
        assert!(store.put(".meta/x", vec![], Metadata::new()).await.is_err());
    }
}
