use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::health::{classify, ChunkIndex};
use crate::journal::{AssemblyStage, Journal};
use crate::model::{ChunkKey, RestoringChunk, RestoringHealth, RestoringPoint};
use crate::storage::{AppData, Folder, LocalAppData, StorageError};
use crate::util::checksum_hex;

pub const METADATA_FILE: &str = "metadata.json";
pub const NOBACKUP_FILE: &str = ".nobackup";
pub const APP_ARCHIVE: &str = "app.zip";

#[derive(Debug, Error)]
pub enum PointError {
    #[error("restoring point {0} not found")]
    NotFound(String),
    #[error("restoring point {id} is incomplete (assembly stopped at stage {stage})")]
    Incomplete { id: String, stage: AssemblyStage },
    #[error("metadata of restoring point {id} is corrupted: {source}")]
    Corrupted {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("chunk {0} is not part of the restoring point")]
    UnknownChunk(ChunkKey),
    #[error("payload of chunk {0} does not match its recorded checksum")]
    ChecksumMismatch(ChunkKey),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Restoring points kept in an app-data root.
///
/// Layout: `/.nobackup`, `/<id>/metadata.json`, `/<id>/<dataset>/<chunk file>`
/// and `/<id>/app.zip`.
#[derive(Clone)]
pub struct PointStore {
    data: Arc<dyn AppData>,
    meta_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for PointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointStore").finish_non_exhaustive()
    }
}

impl PointStore {
    #[must_use]
    pub fn new(data: Arc<dyn AppData>) -> Self {
        Self {
            data,
            meta_lock: Arc::new(Mutex::new(())),
        }
    }

    /// A store over a directory of the local filesystem.
    #[must_use]
    pub fn local(base: PathBuf) -> Self {
        Self::new(Arc::new(LocalAppData::new(base)))
    }

    #[must_use]
    pub fn data(&self) -> &dyn AppData {
        self.data.as_ref()
    }

    #[must_use]
    pub fn chunk_path(data_name: &str, filename: &str) -> String {
        format!("{data_name}/{filename}")
    }

    /// Creates the storage root and its `.nobackup` marker when absent.
    /// Concurrent first use by several assemblies is safe.
    ///
    /// # Errors
    /// Returns an error if the root or marker cannot be created.
    pub async fn init_root(&self) -> Result<Folder, StorageError> {
        let root = self.data.ensure_folder("/").await?;
        if self.data.file_exists(&root, NOBACKUP_FILE).await? {
            return Ok(root);
        }
        if let Err(err) = self.data.put_content(&root, NOBACKUP_FILE, b"").await {
            // another writer may have won the race
            if !self.data.file_exists(&root, NOBACKUP_FILE).await? {
                return Err(err);
            }
        }
        Ok(root)
    }

    /// Creates the folder of a new point and an empty metadata placeholder.
    ///
    /// # Errors
    /// Returns [`StorageError::AlreadyExists`] when the id is taken.
    pub async fn reserve(&self, id: &str) -> Result<Folder, PointError> {
        let folder = self.data.new_folder(&format!("/{id}")).await?;
        self.data.put_content(&folder, METADATA_FILE, b"").await?;
        debug!(point = %id, "reserved point folder");
        Ok(folder)
    }

    async fn folder(&self, id: &str) -> Result<Folder, PointError> {
        self.data
            .get_folder(&format!("/{id}"))
            .await
            .map_err(|err| match err {
                StorageError::NotFound(_) => PointError::NotFound(id.to_string()),
                other => PointError::Storage(other),
            })
    }

    /// Opens the assembly journal of a point.
    ///
    /// # Errors
    /// Returns [`PointError::NotFound`] if the point folder does not exist.
    pub async fn journal(&self, id: &str) -> Result<Journal, PointError> {
        let folder = self.folder(id).await?;
        Ok(Journal::load(self.data.as_ref(), &folder).await?)
    }

    /// Records an assembly stage in the point's journal.
    ///
    /// # Errors
    /// Returns an error if the journal cannot be written.
    pub async fn record_stage(&self, id: &str, stage: AssemblyStage) -> Result<(), PointError> {
        let mut journal = self.journal(id).await?;
        journal.record(self.data.as_ref(), stage).await?;
        Ok(())
    }

    /// Writes the pretty-printed point into its metadata file, replacing the
    /// placeholder.
    ///
    /// # Errors
    /// Returns an error if the point folder is missing or the write fails.
    pub async fn write_metadata(&self, point: &RestoringPoint) -> Result<(), PointError> {
        let _guard = self.meta_lock.lock().await;
        self.write_metadata_locked(point).await
    }

    async fn write_metadata_locked(&self, point: &RestoringPoint) -> Result<(), PointError> {
        let folder = self.folder(point.id()).await?;
        let bytes = serde_json::to_vec_pretty(point).map_err(|source| PointError::Corrupted {
            id: point.id().to_string(),
            source,
        })?;
        self.data.put_content(&folder, METADATA_FILE, &bytes).await?;
        Ok(())
    }

    /// Loads a sealed point.
    ///
    /// # Errors
    /// Returns [`PointError::NotFound`] when no such point exists,
    /// [`PointError::Incomplete`] when its metadata is still the empty
    /// placeholder and [`PointError::Corrupted`] on unparsable metadata.
    pub async fn load(&self, id: &str) -> Result<RestoringPoint, PointError> {
        let folder = self.folder(id).await?;
        let bytes = match self.data.get_content(&folder, METADATA_FILE).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => return Err(PointError::NotFound(id.to_string())),
            Err(err) => return Err(err.into()),
        };
        if bytes.is_empty() {
            let journal = Journal::load(self.data.as_ref(), &folder).await?;
            return Err(PointError::Incomplete {
                id: id.to_string(),
                stage: journal.current_stage(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|source| PointError::Corrupted {
            id: id.to_string(),
            source,
        })
    }

    /// Sealed points sorted by id, which is creation order.
    ///
    /// # Errors
    /// Returns an error if the root cannot be listed.
    pub async fn list(&self) -> Result<Vec<RestoringPoint>, PointError> {
        let names = match self.data.list_folders(&Folder::root()).await {
            Ok(names) => names,
            Err(StorageError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut points = Vec::with_capacity(names.len());
        for name in names {
            match self.load(&name).await {
                Ok(point) => points.push(point),
                Err(PointError::NotFound(_)) => {}
                Err(err) => warn!(point = %name, error = %err, "skipping unreadable point"),
            }
        }
        points.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(points)
    }

    /// Stores a chunk payload at `<id>/<dataset>/<filename>`.
    ///
    /// # Errors
    /// Returns an error if the point folder is missing or the write fails.
    pub async fn put_chunk(
        &self,
        point_id: &str,
        data_name: &str,
        filename: &str,
        payload: &[u8],
    ) -> Result<(), PointError> {
        let folder = self.folder(point_id).await?;
        self.data
            .put_content(&folder, &Self::chunk_path(data_name, filename), payload)
            .await?;
        Ok(())
    }

    /// Reads a chunk payload.
    ///
    /// # Errors
    /// Returns [`StorageError::NotFound`] (wrapped) when the payload is absent.
    pub async fn read_chunk(
        &self,
        point_id: &str,
        data_name: &str,
        filename: &str,
    ) -> Result<Vec<u8>, PointError> {
        let folder = self.folder(point_id).await?;
        Ok(self
            .data
            .get_content(&folder, &Self::chunk_path(data_name, filename))
            .await?)
    }

    /// Stores the packaged application code of a point.
    ///
    /// # Errors
    /// Returns an error if the point folder is missing or the write fails.
    pub async fn put_app_archive(&self, point_id: &str, archive: &[u8]) -> Result<(), PointError> {
        let folder = self.folder(point_id).await?;
        self.data.put_content(&folder, APP_ARCHIVE, archive).await?;
        Ok(())
    }

    /// Removes every dataset folder of a point, keeping its metadata.
    ///
    /// # Errors
    /// Returns an error if a dataset folder cannot be removed.
    pub async fn remove_chunks(&self, point_id: &str) -> Result<(), PointError> {
        let folder = self.folder(point_id).await?;
        for name in self.data.list_folders(&folder).await? {
            let dataset = folder.child(&name)?;
            self.data.delete_folder(&dataset).await?;
        }
        Ok(())
    }

    /// Index of the checksums of the chunk payloads actually stored for `point`.
    ///
    /// # Errors
    /// Returns an error on storage failures other than absent payloads.
    pub async fn stored_index(&self, point: &RestoringPoint) -> Result<ChunkIndex, PointError> {
        let folder = self.folder(point.id()).await?;
        let mut index = ChunkIndex::new();
        for (key, chunk) in point.chunk_entries() {
            let path = Self::chunk_path(&key.data, &chunk.filename());
            match self.data.get_content(&folder, &path).await {
                Ok(bytes) => index.insert(key, checksum_hex(&bytes)),
                Err(StorageError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(index)
    }

    /// Computes the health of `point` against the payloads held by this store.
    ///
    /// # Errors
    /// Returns an error on storage failures other than absent payloads.
    pub async fn verify(&self, point: &RestoringPoint) -> Result<RestoringHealth, PointError> {
        let index = self.stored_index(point).await?;
        let health = classify(point, &index);
        debug!(point = %point.id(), status = ?health.status(), "verified stored chunks");
        Ok(health)
    }

    /// Verifies a stored point and persists the resulting health in its metadata.
    ///
    /// # Errors
    /// Returns an error if the point cannot be loaded, verified or rewritten.
    pub async fn refresh_health(&self, id: &str) -> Result<RestoringPoint, PointError> {
        let point = self.load(id).await?;
        let health = self.verify(&point).await?;
        let point = point.with_health(health);
        self.store_health(&point).await?;
        Ok(point)
    }

    /// Rewrites the metadata of a stored point with the health attached to `point`.
    ///
    /// # Errors
    /// Returns an error if the metadata cannot be written.
    pub async fn store_health(&self, point: &RestoringPoint) -> Result<(), PointError> {
        self.write_metadata(point).await
    }

    /// Accepts a point pushed by another instance. Existing points are kept
    /// as they are; health is never taken from the sender.
    ///
    /// # Errors
    /// Returns an error if the point cannot be written.
    pub async fn receive_point(&self, point: &RestoringPoint) -> Result<RestoringPoint, PointError> {
        let _guard = self.meta_lock.lock().await;
        match self.load(point.id()).await {
            Ok(existing) => return Ok(existing),
            Err(PointError::NotFound(_) | PointError::Incomplete { .. }) => {}
            Err(err) => return Err(err),
        }
        self.data.ensure_folder(&format!("/{}", point.id())).await?;
        let stored = point.clone().without_health();
        self.write_metadata_locked(&stored).await?;
        Ok(stored)
    }

    /// Accepts an uploaded chunk payload carried inline in `chunk`. The
    /// payload must match the checksum recorded by the stored point. Stored
    /// health is dropped since it no longer describes the payloads.
    ///
    /// # Errors
    /// Returns [`PointError::UnknownChunk`] for chunks the point does not
    /// record and [`PointError::ChecksumMismatch`] for altered payloads.
    pub async fn receive_chunk(
        &self,
        point_id: &str,
        data_name: &str,
        chunk: &RestoringChunk,
    ) -> Result<(), PointError> {
        let _guard = self.meta_lock.lock().await;
        let mut stored = self.load(point_id).await?;
        let key = ChunkKey::new(data_name, chunk.name());
        let recorded = stored
            .find_chunk(&key)
            .ok_or_else(|| PointError::UnknownChunk(key.clone()))?;
        if checksum_hex(chunk.content()) != recorded.checksum() {
            return Err(PointError::ChecksumMismatch(key));
        }
        let filename = recorded.filename();
        self.put_chunk(point_id, data_name, &filename, chunk.content())
            .await?;
        if stored.has_health() {
            stored.clear_health();
            self.write_metadata_locked(&stored).await?;
        }
        debug!(point = %point_id, chunk = %key, "received chunk");
        Ok(())
    }
}
