//! Fixtures shared by unit tests and the CLI integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::archive::{ArchiveError, ArchiveService};
use crate::dump::{DbParams, SqlDump, SqlDumpError};
use crate::model::{ChunkBuilder, ChunkKey, PointDraft, RestoringChunk, RestoringData, RestoringPoint, RootType};
use crate::remote::{LocalRemote, RemoteRegistry};
use crate::store::{PointError, PointStore};

pub const FIXTURE_POINT_ID: &str = "20240101000000-fixturepoint001";

/// Dump that always yields the same payload.
#[derive(Clone, Debug, Default)]
pub struct FixedDump {
    payload: Vec<u8>,
}

impl FixedDump {
    #[must_use]
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

#[async_trait]
impl SqlDump for FixedDump {
    async fn export(&self, _params: &DbParams) -> Result<Vec<u8>, SqlDumpError> {
        Ok(self.payload.clone())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FailingDump;

#[async_trait]
impl SqlDump for FailingDump {
    async fn export(&self, _params: &DbParams) -> Result<Vec<u8>, SqlDumpError> {
        Err(SqlDumpError::Failed {
            program: "mysqldump".into(),
            code: "2".into(),
            stderr: "access denied".into(),
        })
    }
}

/// A sealed point together with the payload of every chunk.
#[derive(Clone, Debug)]
pub struct PointFixture {
    pub point: RestoringPoint,
    payloads: BTreeMap<ChunkKey, Vec<u8>>,
}

/// Builds a complete point whose `data` dataset holds one fixed-name chunk
/// per entry.
pub fn seeded_point<P: AsRef<[u8]>>(chunks: &[(&str, P)]) -> PointFixture {
    let mut draft = PointDraft::with_id(FIXTURE_POINT_ID, 1_704_067_200, "25.0.2", true);
    draft.add_data(RestoringData::new(RootType::Data, "", RestoringData::DATA));
    let mut payloads = BTreeMap::new();
    let mut recorded = Vec::new();
    for (name, payload) in chunks {
        let chunk = ChunkBuilder::fixed(*name)
            .count(1)
            .with_content(payload.as_ref().to_vec());
        payloads.insert(
            ChunkKey::new(RestoringData::DATA, *name),
            payload.as_ref().to_vec(),
        );
        recorded.push(chunk.without_content().into_stored());
    }
    draft.add_chunks(RestoringData::DATA, recorded);
    PointFixture {
        point: draft.seal(),
        payloads,
    }
}

impl PointFixture {
    /// Writes the point and every payload into `store`, as a local point.
    ///
    /// # Errors
    /// Returns the first store failure.
    pub async fn write_to(&self, store: &PointStore) -> Result<(), PointError> {
        store.init_root().await?;
        store.reserve(self.point.id()).await?;
        for (key, chunk) in self.point.chunk_entries() {
            if let Some(payload) = self.payloads.get(&key) {
                store
                    .put_chunk(self.point.id(), &key.data, &chunk.filename(), payload)
                    .await?;
            }
        }
        store.write_metadata(&self.point).await
    }

    /// Creates the point on `store` as a remote would and uploads the named
    /// chunks of the `data` dataset.
    ///
    /// # Panics
    /// Panics if the store rejects the point or a chunk.
    pub async fn push_to(&self, store: &PointStore, chunk_names: &[&str]) {
        store.init_root().await.expect("init remote root");
        store
            .receive_point(&self.point)
            .await
            .expect("create remote point");
        for name in chunk_names {
            let key = ChunkKey::new(RestoringData::DATA, *name);
            let chunk = self.loaded(&key).expect("fixture chunk");
            store
                .receive_chunk(self.point.id(), &key.data, &chunk)
                .await
                .expect("upload fixture chunk");
        }
    }

    fn loaded(&self, key: &ChunkKey) -> Option<RestoringChunk> {
        let chunk = self.point.find_chunk(key)?.clone();
        let payload = self.payloads.get(key)?.clone();
        chunk.with_loaded_content(payload).ok()
    }
}

/// Archive serving chunk payloads from memory. Creation is a no-op.
#[derive(Debug, Default)]
pub struct StaticArchiver {
    payloads: BTreeMap<ChunkKey, Vec<u8>>,
    corrupt: BTreeSet<String>,
    pub reads: AtomicUsize,
}

impl StaticArchiver {
    #[must_use]
    pub fn new(fixture: &PointFixture) -> Self {
        Self {
            payloads: fixture.payloads.clone(),
            ..Self::default()
        }
    }

    /// Serves altered bytes for `chunk_name`, so its checksum no longer matches.
    #[must_use]
    pub fn corrupting(mut self, chunk_name: &str) -> Self {
        self.corrupt.insert(chunk_name.to_string());
        self
    }
}

#[async_trait]
impl ArchiveService for StaticArchiver {
    async fn copy_app(&self, _point_id: &str) -> Result<(), ArchiveError> {
        Ok(())
    }

    async fn create_chunks(
        &self,
        _point_id: &str,
        _data: &RestoringData,
    ) -> Result<Vec<RestoringChunk>, ArchiveError> {
        Ok(Vec::new())
    }

    async fn create_content_chunk(
        &self,
        _point_id: &str,
        _data: &RestoringData,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<RestoringChunk, ArchiveError> {
        Ok(ChunkBuilder::fixed(filename)
            .count(1)
            .with_content(content)
            .without_content())
    }

    async fn get_chunk_content(
        &self,
        point: &RestoringPoint,
        data_name: &str,
        chunk_name: &str,
    ) -> Result<RestoringChunk, ArchiveError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let key = ChunkKey::new(data_name, chunk_name);
        let chunk = point
            .find_chunk(&key)
            .ok_or_else(|| ArchiveError::NotFound(key.to_string()))?
            .clone();
        let mut payload = self
            .payloads
            .get(&key)
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound(key.to_string()))?;
        if self.corrupt.contains(chunk_name) {
            payload.push(b'!');
        }
        Ok(chunk.with_loaded_content(payload)?)
    }

    async fn delete_chunks(&self, _point_id: &str) -> Result<(), ArchiveError> {
        Ok(())
    }
}

/// A registry of `file`-backed instances, one temporary store per name.
/// Keep the returned directories alive for the duration of the test.
///
/// # Panics
/// Panics if a temporary directory cannot be created.
#[must_use]
pub fn local_registry(names: &[&str]) -> (RemoteRegistry, Vec<PointStore>, Vec<TempDir>) {
    let mut registry = RemoteRegistry::new();
    let mut stores = Vec::with_capacity(names.len());
    let mut dirs = Vec::with_capacity(names.len());
    for name in names {
        let dir = TempDir::new().expect("remote tempdir");
        let store = PointStore::local(dir.path().to_path_buf());
        registry.insert(*name, Arc::new(LocalRemote::new(store.clone())));
        stores.push(store);
        dirs.push(dir);
    }
    (registry, stores, dirs)
}
