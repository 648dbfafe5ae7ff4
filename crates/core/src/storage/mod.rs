use std::io;

use async_trait::async_trait;
use thiserror::Error;

pub mod local;

pub use local::LocalAppData;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("not permitted to access {0}")]
    NotPermitted(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Maps an I/O failure on `path`, keeping absence and permission distinct.
    #[must_use]
    pub fn from_io(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::NotPermitted(path.to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            _ => Self::Io {
                path: path.to_string(),
                source: err,
            },
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Handle on a folder inside the app-data root. Paths are `/`-separated and
/// rooted, e.g. `/20240101000000-abc`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Folder {
    path: String,
}

impl Folder {
    /// Normalises `path`; `..` components are refused.
    ///
    /// # Errors
    /// Returns [`StorageError::NotPermitted`] for paths escaping the root.
    pub fn new(path: &str) -> StorageResult<Self> {
        let segments = path
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .collect::<Vec<_>>();
        if segments.iter().any(|segment| *segment == "..") {
            return Err(StorageError::NotPermitted(path.to_string()));
        }
        Ok(Self {
            path: format!("/{}", segments.join("/")),
        })
    }

    #[must_use]
    pub fn root() -> Self {
        Self {
            path: "/".to_string(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path of an entry below this folder.
    ///
    /// # Errors
    /// Returns [`StorageError::NotPermitted`] for names escaping the folder.
    pub fn child(&self, name: &str) -> StorageResult<Self> {
        Self::new(&format!("{}/{name}", self.path))
    }
}

/// Application data storage: atomic put/get of blobs keyed by path.
#[async_trait]
pub trait AppData: Send + Sync {
    /// Creates a folder that must not exist yet.
    async fn new_folder(&self, path: &str) -> StorageResult<Folder>;
    /// Opens an existing folder.
    async fn get_folder(&self, path: &str) -> StorageResult<Folder>;
    /// Returns the folder, creating it when absent. Safe under concurrent first use.
    async fn ensure_folder(&self, path: &str) -> StorageResult<Folder>;
    /// Writes a file below `folder`, replacing previous content. `name` may
    /// contain `/` to address nested entries.
    async fn put_content(&self, folder: &Folder, name: &str, data: &[u8]) -> StorageResult<()>;
    async fn get_content(&self, folder: &Folder, name: &str) -> StorageResult<Vec<u8>>;
    async fn file_exists(&self, folder: &Folder, name: &str) -> StorageResult<bool>;
    async fn delete_file(&self, folder: &Folder, name: &str) -> StorageResult<()>;
    async fn delete_folder(&self, folder: &Folder) -> StorageResult<()>;
    /// Names of the sub-folders of `folder`, sorted.
    async fn list_folders(&self, folder: &Folder) -> StorageResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_paths_are_normalised() {
        assert_eq!(Folder::new("abc/").unwrap().path(), "/abc");
        assert_eq!(Folder::new("//a/./b").unwrap().path(), "/a/b");
        assert_eq!(Folder::new("/").unwrap(), Folder::root());
        assert_eq!(
            Folder::new("/p").unwrap().child("data/x.zip").unwrap().path(),
            "/p/data/x.zip"
        );
    }

    #[test]
    fn parent_components_are_refused() {
        assert!(matches!(
            Folder::new("/a/../../etc"),
            Err(StorageError::NotPermitted(_))
        ));
        assert!(Folder::root().child("../x").is_err());
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let err = StorageError::from_io("/x", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        let err = StorageError::from_io("/x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, StorageError::NotPermitted(_)));
        let err = StorageError::from_io("/x", io::Error::other("disk on fire"));
        assert!(matches!(err, StorageError::Io { .. }));
    }
}
