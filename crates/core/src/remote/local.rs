use async_trait::async_trait;

use super::{RemoteError, RemoteInstance};
use crate::model::{RestoringChunk, RestoringPoint};
use crate::store::{PointError, PointStore};
use crate::storage::StorageError;

/// Remote instance backed by a [`PointStore`] reachable from this process,
/// e.g. a mounted backup disk.
#[derive(Clone, Debug)]
pub struct LocalRemote {
    store: PointStore,
}

impl LocalRemote {
    #[must_use]
    pub fn new(store: PointStore) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &PointStore {
        &self.store
    }
}

fn remote_error(err: PointError) -> RemoteError {
    match err {
        PointError::NotFound(id) => RemoteError::PointNotFound(id),
        PointError::UnknownChunk(key) => RemoteError::ResourceNotFound(key.to_string()),
        PointError::ChecksumMismatch(key) => RemoteError::InvalidItem(format!("chunk {key}")),
        PointError::Storage(StorageError::NotFound(path)) => RemoteError::ResourceNotFound(path),
        other => RemoteError::Instance(other.to_string()),
    }
}

#[async_trait]
impl RemoteInstance for LocalRemote {
    async fn get_point(
        &self,
        point_id: &str,
        force_health_refresh: bool,
    ) -> Result<RestoringPoint, RemoteError> {
        if force_health_refresh {
            self.store.refresh_health(point_id).await.map_err(remote_error)
        } else {
            self.store.load(point_id).await.map_err(remote_error)
        }
    }

    async fn create_point(&self, point: &RestoringPoint) -> Result<RestoringPoint, RemoteError> {
        self.store.init_root().await.map_err(|err| remote_error(err.into()))?;
        self.store.receive_point(point).await.map_err(remote_error)
    }

    async fn upload_chunk(
        &self,
        point: &RestoringPoint,
        data_name: &str,
        chunk: &RestoringChunk,
    ) -> Result<(), RemoteError> {
        self.store
            .receive_chunk(point.id(), data_name, chunk)
            .await
            .map_err(remote_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkBuilder, ChunkStatus, PointDraft, RestoringData, RootType};
    use tempfile::tempdir;

    #[tokio::test]
    async fn health_is_computed_only_on_request() {
        let dir = tempdir().unwrap();
        let remote = LocalRemote::new(PointStore::local(dir.path().to_path_buf()));
        let chunk = ChunkBuilder::fixed("a").count(1).with_content(b"one".to_vec());
        let mut draft = PointDraft::with_id("20240101000000-abc", 0, "25", true);
        draft.add_data(RestoringData::new(RootType::Data, "", RestoringData::DATA));
        draft.add_chunks(RestoringData::DATA, [chunk.clone().without_content()]);
        let point = draft.seal();

        let err = remote.get_point(point.id(), false).await.unwrap_err();
        assert!(matches!(err, RemoteError::PointNotFound(_)));

        let created = remote.create_point(&point).await.unwrap();
        assert!(!created.has_health());
        assert!(!remote.get_point(point.id(), false).await.unwrap().has_health());

        let refreshed = remote.get_point(point.id(), true).await.unwrap();
        let health = refreshed.health().unwrap();
        assert_eq!(
            health.status_of(&crate::model::ChunkKey::new("data", "a")),
            ChunkStatus::Missing
        );

        remote.upload_chunk(&point, "data", &chunk).await.unwrap();
        assert!(!remote.get_point(point.id(), false).await.unwrap().has_health());
        assert!(remote
            .get_point(point.id(), true)
            .await
            .unwrap()
            .health()
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn upload_of_unknown_chunk_is_resource_not_found() {
        let dir = tempdir().unwrap();
        let remote = LocalRemote::new(PointStore::local(dir.path().to_path_buf()));
        let point = PointDraft::with_id("20240101000000-abc", 0, "25", true).seal();
        remote.create_point(&point).await.unwrap();
        let stray = ChunkBuilder::fixed("zz").with_content(b"z".to_vec());
        let err = remote.upload_chunk(&point, "data", &stray).await.unwrap_err();
        assert!(matches!(err, RemoteError::ResourceNotFound(_)));
    }
}
