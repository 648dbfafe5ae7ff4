use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::{ArchiveConfig, SystemConfig};
use crate::model::{ChunkBuilder, ChunkKey, ModelError, RestoringChunk, RestoringData, RestoringPoint, RootType};
use crate::store::{PointError, PointStore, NOBACKUP_FILE};
use crate::storage::StorageError;
use crate::util::checksum_hex;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to create archive: {0}")]
    Create(String),
    #[error("failed to delete archive: {0}")]
    Delete(String),
    #[error("archive not found: {0}")]
    NotFound(String),
    #[error("failed to copy application code: {0}")]
    AppCopy(String),
    #[error("restore script not found at {}", .0.display())]
    ScriptNotFound(PathBuf),
    #[error(transparent)]
    Corrupted(#[from] ModelError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<PointError> for ArchiveError {
    fn from(err: PointError) -> Self {
        match err {
            PointError::Storage(err) => Self::Storage(err),
            PointError::NotFound(id) => Self::NotFound(id),
            other => Self::Create(other.to_string()),
        }
    }
}

/// Packages datasets into chunks and reads chunk payloads back.
#[async_trait]
pub trait ArchiveService: Send + Sync {
    /// Packages the host application code into the point.
    async fn copy_app(&self, point_id: &str) -> Result<(), ArchiveError>;

    /// Packages the files of `data` into zero or more stored chunks.
    async fn create_chunks(
        &self,
        point_id: &str,
        data: &RestoringData,
    ) -> Result<Vec<RestoringChunk>, ArchiveError>;

    /// Stores `content` as a single chunk named `filename`.
    async fn create_content_chunk(
        &self,
        point_id: &str,
        data: &RestoringData,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<RestoringChunk, ArchiveError>;

    /// Returns the chunk with its stored payload attached.
    async fn get_chunk_content(
        &self,
        point: &RestoringPoint,
        data_name: &str,
        chunk_name: &str,
    ) -> Result<RestoringChunk, ArchiveError>;

    /// Removes every chunk payload of a point.
    async fn delete_chunks(&self, point_id: &str) -> Result<(), ArchiveError>;
}

/// Filesystem roots datasets are resolved against.
#[derive(Clone, Debug, Default)]
pub struct SourceRoots {
    pub data_dir: PathBuf,
    pub install_root: PathBuf,
    pub config_dir: PathBuf,
}

impl SourceRoots {
    #[must_use]
    pub fn from_system(system: &SystemConfig) -> Self {
        Self {
            data_dir: system.datadirectory.clone(),
            install_root: system.install_root.clone(),
            config_dir: system.config_dir.clone(),
        }
    }

    /// Directory holding the files of `data`.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Create`] for datasets that are not file based.
    pub fn resolve(&self, data: &RestoringData) -> Result<PathBuf, ArchiveError> {
        let relative = data.path().trim_start_matches('/');
        match data.root_type() {
            RootType::Data => Ok(self.data_dir.join(relative)),
            RootType::Nextcloud => Ok(self.install_root.join(relative)),
            RootType::FileConfig => Ok(self.config_dir.join(relative)),
            RootType::Disk => Ok(PathBuf::from(data.path())),
            RootType::SqlDump => Err(ArchiveError::Create(format!(
                "dataset {} has no file root",
                data.name()
            ))),
        }
    }
}

#[derive(Debug)]
struct SourceFile {
    relative: String,
    absolute: PathBuf,
    size: u64,
}

/// [`ArchiveService`] writing zip chunks into a [`PointStore`].
#[derive(Clone, Debug)]
pub struct ZipArchiver {
    store: PointStore,
    roots: SourceRoots,
    chunk_size: u64,
    app_dir: Option<PathBuf>,
    restore_script: String,
}

impl ZipArchiver {
    #[must_use]
    pub fn new(store: PointStore, roots: SourceRoots, config: &ArchiveConfig) -> Self {
        Self {
            store,
            roots,
            chunk_size: config.chunk_size.max(1),
            app_dir: config.app_dir.clone(),
            restore_script: config.restore_script.clone(),
        }
    }

    async fn collect_files(root: PathBuf) -> Result<Vec<SourceFile>, ArchiveError> {
        tokio::task::spawn_blocking(move || walk_sources(&root))
            .await
            .map_err(|err| ArchiveError::Create(format!("walker task failed: {err}")))?
    }

    async fn pack(files: Vec<SourceFile>) -> Result<Vec<u8>, ArchiveError> {
        tokio::task::spawn_blocking(move || zip_files(&files))
            .await
            .map_err(|err| ArchiveError::Create(format!("zip task failed: {err}")))?
    }
}

/// Walks `root` in name order, skipping folders marked with `.nobackup`.
/// Any unreadable entry fails the walk.
fn walk_sources(root: &Path) -> Result<Vec<SourceFile>, ArchiveError> {
    if !root.is_dir() {
        return Err(ArchiveError::NotFound(root.display().to_string()));
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !(entry.file_type().is_dir() && entry.path().join(NOBACKUP_FILE).exists()));
    for entry in walker {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(root).display().to_string();
            ArchiveError::Create(format!("{path}: {err}"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| ArchiveError::Create(err.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry
            .metadata()
            .map_err(|err| ArchiveError::Create(format!("{}: {err}", entry.path().display())))?
            .len();
        files.push(SourceFile {
            relative,
            absolute: entry.into_path(),
            size,
        });
    }
    Ok(files)
}

/// Splits files into consecutive batches of at most `limit` raw bytes. A
/// single larger file gets a batch of its own.
fn batch_files(files: Vec<SourceFile>, limit: u64) -> Vec<Vec<SourceFile>> {
    let mut batches = Vec::new();
    let mut current: Vec<SourceFile> = Vec::new();
    let mut current_size = 0_u64;
    for file in files {
        if !current.is_empty() && current_size + file.size > limit {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += file.size;
        current.push(file);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn zip_files(files: &[SourceFile]) -> Result<Vec<u8>, ArchiveError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut buffer = Vec::new();
    for file in files {
        buffer.clear();
        std::fs::File::open(&file.absolute)
            .and_then(|mut handle| handle.read_to_end(&mut buffer))
            .map_err(|err| ArchiveError::Create(format!("{}: {err}", file.absolute.display())))?;
        zip.start_file(file.relative.as_str(), options)
            .map_err(|err| ArchiveError::Create(format!("{}: {err}", file.relative)))?;
        zip.write_all(&buffer)
            .map_err(|err| ArchiveError::Create(format!("{}: {err}", file.relative)))?;
    }
    let cursor = zip
        .finish()
        .map_err(|err| ArchiveError::Create(err.to_string()))?;
    Ok(cursor.into_inner())
}

#[async_trait]
impl ArchiveService for ZipArchiver {
    async fn copy_app(&self, point_id: &str) -> Result<(), ArchiveError> {
        let Some(app_dir) = self.app_dir.clone() else {
            info!(point = %point_id, "no application directory configured, skipping app copy");
            return Ok(());
        };
        let script = app_dir.join(&self.restore_script);
        if !script.is_file() {
            return Err(ArchiveError::ScriptNotFound(script));
        }
        let files = Self::collect_files(app_dir.clone())
            .await
            .map_err(|err| ArchiveError::AppCopy(err.to_string()))?;
        let archive = Self::pack(files)
            .await
            .map_err(|err| ArchiveError::AppCopy(err.to_string()))?;
        self.store
            .put_app_archive(point_id, &archive)
            .await
            .map_err(|err| ArchiveError::AppCopy(err.to_string()))?;
        debug!(point = %point_id, bytes = archive.len(), "copied application code");
        Ok(())
    }

    async fn create_chunks(
        &self,
        point_id: &str,
        data: &RestoringData,
    ) -> Result<Vec<RestoringChunk>, ArchiveError> {
        let root = self.roots.resolve(data)?;
        let files = Self::collect_files(root).await?;
        let mut chunks = Vec::new();
        for batch in batch_files(files, self.chunk_size) {
            let names = batch.iter().map(|f| f.relative.clone()).collect::<Vec<_>>();
            let payload = Self::pack(batch).await?;
            let chunk = ChunkBuilder::generated(data.name())
                .files(names)
                .packaged(payload.len() as u64, checksum_hex(&payload));
            self.store
                .put_chunk(point_id, data.name(), &chunk.filename(), &payload)
                .await?;
            debug!(point = %point_id, data = %data.name(), chunk = %chunk.name(), files = chunk.count(), "stored chunk");
            chunks.push(chunk.into_stored());
        }
        Ok(chunks)
    }

    async fn create_content_chunk(
        &self,
        point_id: &str,
        data: &RestoringData,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<RestoringChunk, ArchiveError> {
        let chunk = ChunkBuilder::fixed(filename).count(1).with_content(content);
        self.store
            .put_chunk(point_id, data.name(), &chunk.filename(), chunk.content())
            .await?;
        Ok(chunk.without_content().into_stored())
    }

    async fn get_chunk_content(
        &self,
        point: &RestoringPoint,
        data_name: &str,
        chunk_name: &str,
    ) -> Result<RestoringChunk, ArchiveError> {
        let key = ChunkKey::new(data_name, chunk_name);
        let chunk = point
            .find_chunk(&key)
            .ok_or_else(|| ArchiveError::NotFound(key.to_string()))?
            .clone();
        let payload = match self
            .store
            .read_chunk(point.id(), data_name, &chunk.filename())
            .await
        {
            Ok(payload) => payload,
            Err(PointError::Storage(StorageError::NotFound(_))) => {
                return Err(ArchiveError::NotFound(key.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(chunk.with_loaded_content(payload)?)
    }

    async fn delete_chunks(&self, point_id: &str) -> Result<(), ArchiveError> {
        self.store
            .remove_chunks(point_id)
            .await
            .map_err(|err| ArchiveError::Delete(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;

    fn archiver(appdata: &Path, source: &Path, chunk_size: u64) -> (PointStore, ZipArchiver) {
        let store = PointStore::local(appdata.to_path_buf());
        let roots = SourceRoots {
            data_dir: source.join("data"),
            install_root: source.join("www"),
            config_dir: source.join("www/config"),
        };
        let config = ArchiveConfig {
            chunk_size,
            app_dir: Some(source.join("app")),
            restore_script: "restore.sh".into(),
        };
        (store.clone(), ZipArchiver::new(store, roots, &config))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_folder_fails_chunking() {
        use std::os::unix::fs::PermissionsExt;

        let appdata = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        source.child("data/alice/a.txt").write_str("aaaa").unwrap();
        source.child("data/locked/b.txt").write_str("bbbb").unwrap();
        let locked = source.path().join("data/locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        if std::fs::read_dir(&locked).is_ok() {
            // permission bits are not enforced for this user
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let (store, archiver) = archiver(appdata.path(), source.path(), 1024);
        store.reserve("p1").await.unwrap();
        let data = RestoringData::new(RootType::Data, "", RestoringData::DATA);
        let result = archiver.create_chunks("p1", &data).await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        match result {
            Err(ArchiveError::Create(msg)) => assert!(msg.contains("locked"), "{msg}"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn data_is_split_into_sized_chunks() {
        let appdata = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        source.child("data/alice/a.txt").write_str("aaaaaaaaaa").unwrap();
        source.child("data/alice/b.txt").write_str("bbbbbbbbbb").unwrap();
        source.child("data/bob/c.txt").write_str("cccccccccc").unwrap();
        source.child("data/skip/.nobackup").touch().unwrap();
        source.child("data/skip/secret.txt").write_str("nope").unwrap();

        let (store, archiver) = archiver(appdata.path(), source.path(), 20);
        store.reserve("p1").await.unwrap();
        let data = RestoringData::new(RootType::Data, "", RestoringData::DATA);
        let chunks = archiver.create_chunks("p1", &data).await.unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].files(), ["alice/a.txt", "alice/b.txt"]);
        assert_eq!(chunks[1].files(), ["bob/c.txt"]);
        assert_eq!(chunks[0].count(), 2);
        assert!(chunks.iter().all(RestoringChunk::is_stored));
        assert!(chunks[0].name().starts_with("data-"));

        let stored = store
            .read_chunk("p1", "data", &chunks[1].filename())
            .await
            .unwrap();
        assert_eq!(checksum_hex(&stored), chunks[1].checksum());
        assert_eq!(stored.len() as u64, chunks[1].size());
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let appdata = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let (store, archiver) = archiver(appdata.path(), source.path(), 20);
        store.reserve("p1").await.unwrap();
        let data = RestoringData::new(RootType::Disk, "/nonexistent/custom_apps", "apps_x");
        let err = archiver.create_chunks("p1", &data).await.unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }

    #[tokio::test]
    async fn content_chunk_round_trips_through_storage() {
        let appdata = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let (store, archiver) = archiver(appdata.path(), source.path(), 20);
        store.reserve("p1").await.unwrap();
        let dump = RestoringData::new(RootType::SqlDump, "", RestoringData::SQL_DUMP);
        let chunk = archiver
            .create_content_chunk("p1", &dump, "backup_sql", b"CREATE TABLE t;".to_vec())
            .await
            .unwrap();
        assert_eq!(chunk.count(), 1);
        assert!(chunk.is_static_name());
        assert!(!chunk.has_content());
        assert_eq!(chunk.filename(), "backup_sql");

        let mut draft = crate::model::PointDraft::with_id("p1", 0, "25", true);
        draft.add_data(dump);
        draft.add_chunks(RestoringData::SQL_DUMP, [chunk]);
        let point = draft.seal();
        let loaded = archiver
            .get_chunk_content(&point, "sqldump", "backup_sql")
            .await
            .unwrap();
        assert_eq!(loaded.content(), b"CREATE TABLE t;");

        let err = archiver
            .get_chunk_content(&point, "sqldump", "other")
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }

    #[tokio::test]
    async fn app_copy_requires_restore_script() {
        let appdata = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        source.child("app/lib/main.txt").write_str("code").unwrap();
        let (store, archiver) = archiver(appdata.path(), source.path(), 20);
        store.reserve("p1").await.unwrap();

        let err = archiver.copy_app("p1").await.unwrap_err();
        assert!(matches!(err, ArchiveError::ScriptNotFound(_)));

        source.child("app/restore.sh").write_str("#!/bin/sh").unwrap();
        archiver.copy_app("p1").await.unwrap();
        assert!(appdata.path().join("p1").join("app.zip").exists());
    }

    #[tokio::test]
    async fn delete_chunks_keeps_metadata() {
        let appdata = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        source.child("www/config/config.php").write_str("<?php").unwrap();
        let (store, archiver) = archiver(appdata.path(), source.path(), 20);
        store.reserve("p1").await.unwrap();
        let config = RestoringData::new(RootType::FileConfig, "", RestoringData::CONFIG);
        archiver.create_chunks("p1", &config).await.unwrap();
        assert!(appdata.path().join("p1/config").is_dir());

        archiver.delete_chunks("p1").await.unwrap();
        assert!(!appdata.path().join("p1/config").exists());
        assert!(appdata.path().join("p1/metadata.json").exists());
    }

    #[test]
    fn oversized_file_gets_its_own_batch() {
        let file = |name: &str, size| SourceFile {
            relative: name.into(),
            absolute: PathBuf::from(name),
            size,
        };
        let batches = batch_files(vec![file("a", 5), file("big", 50), file("c", 5)], 10);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
    }
}
