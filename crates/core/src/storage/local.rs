use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use super::{AppData, Folder, StorageError, StorageResult};
use crate::util::write_atomic;

/// [`AppData`] rooted in a directory on the local filesystem.
#[derive(Clone, Debug)]
pub struct LocalAppData {
    base: PathBuf,
}

impl LocalAppData {
    #[must_use]
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    #[must_use]
    pub fn base(&self) -> &PathBuf {
        &self.base
    }

    fn resolve(&self, folder: &Folder) -> PathBuf {
        self.base.join(folder.path().trim_start_matches('/'))
    }
}

#[async_trait]
impl AppData for LocalAppData {
    async fn new_folder(&self, path: &str) -> StorageResult<Folder> {
        let folder = Folder::new(path)?;
        let dir = self.resolve(&folder);
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::from_io(folder.path(), err))?;
        }
        fs::create_dir(&dir)
            .await
            .map_err(|err| StorageError::from_io(folder.path(), err))?;
        Ok(folder)
    }

    async fn get_folder(&self, path: &str) -> StorageResult<Folder> {
        let folder = Folder::new(path)?;
        let meta = fs::metadata(self.resolve(&folder))
            .await
            .map_err(|err| StorageError::from_io(folder.path(), err))?;
        if meta.is_dir() {
            Ok(folder)
        } else {
            Err(StorageError::NotFound(folder.path().to_string()))
        }
    }

    async fn ensure_folder(&self, path: &str) -> StorageResult<Folder> {
        let folder = Folder::new(path)?;
        fs::create_dir_all(self.resolve(&folder))
            .await
            .map_err(|err| StorageError::from_io(folder.path(), err))?;
        Ok(folder)
    }

    async fn put_content(&self, folder: &Folder, name: &str, data: &[u8]) -> StorageResult<()> {
        let entry = folder.child(name)?;
        write_atomic(&self.resolve(&entry), data)
            .await
            .map_err(|err| StorageError::from_io(entry.path(), err))
    }

    async fn get_content(&self, folder: &Folder, name: &str) -> StorageResult<Vec<u8>> {
        let entry = folder.child(name)?;
        fs::read(self.resolve(&entry))
            .await
            .map_err(|err| StorageError::from_io(entry.path(), err))
    }

    async fn file_exists(&self, folder: &Folder, name: &str) -> StorageResult<bool> {
        let entry = folder.child(name)?;
        match fs::metadata(self.resolve(&entry)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::from_io(entry.path(), err)),
        }
    }

    async fn delete_file(&self, folder: &Folder, name: &str) -> StorageResult<()> {
        let entry = folder.child(name)?;
        fs::remove_file(self.resolve(&entry))
            .await
            .map_err(|err| StorageError::from_io(entry.path(), err))
    }

    async fn delete_folder(&self, folder: &Folder) -> StorageResult<()> {
        if *folder == Folder::root() {
            return Err(StorageError::NotPermitted(folder.path().to_string()));
        }
        fs::remove_dir_all(self.resolve(folder))
            .await
            .map_err(|err| StorageError::from_io(folder.path(), err))
    }

    async fn list_folders(&self, folder: &Folder) -> StorageResult<Vec<String>> {
        let mut entries = fs::read_dir(self.resolve(folder))
            .await
            .map_err(|err| StorageError::from_io(folder.path(), err))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StorageError::from_io(folder.path(), err))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|err| StorageError::from_io(folder.path(), err))?
                .is_dir();
            if is_dir {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn new_folder_refuses_existing() {
        let dir = tempdir().unwrap();
        let data = LocalAppData::new(dir.path().to_path_buf());
        data.new_folder("/point").await.unwrap();
        let err = data.new_folder("/point").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn ensure_folder_is_idempotent_under_concurrency() {
        let dir = tempdir().unwrap();
        let data = LocalAppData::new(dir.path().to_path_buf());
        let (a, b) = tokio::join!(data.ensure_folder("/"), data.ensure_folder("/"));
        assert_eq!(a.unwrap(), b.unwrap());
        data.ensure_folder("/").await.unwrap();
    }

    #[tokio::test]
    async fn put_get_and_missing_files() {
        let dir = tempdir().unwrap();
        let data = LocalAppData::new(dir.path().to_path_buf());
        let folder = data.new_folder("/p").await.unwrap();
        data.put_content(&folder, "data/a.zip", b"bytes").await.unwrap();
        assert_eq!(
            data.get_content(&folder, "data/a.zip").await.unwrap(),
            b"bytes"
        );
        assert!(data.file_exists(&folder, "data/a.zip").await.unwrap());
        assert!(!data.file_exists(&folder, "data/b.zip").await.unwrap());

        let err = data.get_content(&folder, "data/b.zip").await.unwrap_err();
        assert!(err.is_not_found());

        let err = data.get_folder("/nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_and_delete_folders() {
        let dir = tempdir().unwrap();
        let data = LocalAppData::new(dir.path().to_path_buf());
        let root = data.ensure_folder("/").await.unwrap();
        data.put_content(&root, ".nobackup", b"").await.unwrap();
        let b = data.new_folder("/b").await.unwrap();
        data.new_folder("/a").await.unwrap();
        assert_eq!(data.list_folders(&root).await.unwrap(), vec!["a", "b"]);

        data.delete_folder(&b).await.unwrap();
        assert_eq!(data.list_folders(&root).await.unwrap(), vec!["a"]);
        assert!(data.delete_folder(&root).await.is_err());
    }
}
