//! Classification of a point's chunks against what a store actually holds.

use std::collections::BTreeMap;

use crate::model::{
    ChunkKey, ChunkStatus, RestoringChunkHealth, RestoringHealth, RestoringPoint,
};

/// Checksums of the chunks a store holds, keyed by dataset and chunk name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkIndex {
    entries: BTreeMap<ChunkKey, String>,
}

impl ChunkIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the checksums a point records for itself.
    #[must_use]
    pub fn from_point(point: &RestoringPoint) -> Self {
        point
            .chunk_entries()
            .into_iter()
            .map(|(key, chunk)| (key, chunk.checksum().to_string()))
            .collect()
    }

    pub fn insert(&mut self, key: ChunkKey, checksum: impl Into<String>) {
        self.entries.insert(key, checksum.into());
    }

    #[must_use]
    pub fn get(&self, key: &ChunkKey) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(ChunkKey, String)> for ChunkIndex {
    fn from_iter<T: IntoIterator<Item = (ChunkKey, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Status of one chunk given the checksum a store reports for it.
#[must_use]
pub fn chunk_status(expected: &str, reported: Option<&str>) -> ChunkStatus {
    match reported {
        None => ChunkStatus::Missing,
        Some(actual) if actual == expected => ChunkStatus::Ok,
        Some(_) => ChunkStatus::Checksum,
    }
}

/// Classifies every chunk of `local` against `remote`.
#[must_use]
pub fn classify(local: &RestoringPoint, remote: &ChunkIndex) -> RestoringHealth {
    RestoringHealth::from_chunks(local.chunk_entries().into_iter().map(|(key, chunk)| {
        let status = chunk_status(chunk.checksum(), remote.get(&key));
        RestoringChunkHealth::new(&key, status)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkBuilder, HealthStatus, PointDraft, RestoringData, RootType};

    fn point() -> RestoringPoint {
        let mut draft = PointDraft::with_id("20240101000000-p", 0, "25", true);
        draft.add_data(RestoringData::new(RootType::Data, "", RestoringData::DATA));
        draft.add_chunks(
            RestoringData::DATA,
            [
                ChunkBuilder::fixed("a").packaged(1, "x1"),
                ChunkBuilder::fixed("b").packaged(1, "x2"),
            ],
        );
        draft.seal()
    }

    fn index(entries: &[(&str, &str)]) -> ChunkIndex {
        entries
            .iter()
            .map(|(chunk, sum)| (ChunkKey::new(RestoringData::DATA, *chunk), (*sum).to_string()))
            .collect()
    }

    #[test]
    fn missing_chunk_is_reported() {
        let health = classify(&point(), &index(&[("a", "x1")]));
        assert_eq!(health.status(), HealthStatus::Degraded);
        assert_eq!(health.status_of(&ChunkKey::new("data", "a")), ChunkStatus::Ok);
        assert_eq!(
            health.status_of(&ChunkKey::new("data", "b")),
            ChunkStatus::Missing
        );
    }

    #[test]
    fn corrupt_chunk_is_reported() {
        let health = classify(&point(), &index(&[("a", "x1"), ("b", "corrupt")]));
        assert_eq!(health.status(), HealthStatus::Degraded);
        assert_eq!(
            health.status_of(&ChunkKey::new("data", "b")),
            ChunkStatus::Checksum
        );
        assert_eq!(health.counts().faulty, 1);
    }

    #[test]
    fn matching_index_is_ok() {
        let local = point();
        let health = classify(&local, &ChunkIndex::from_point(&local));
        assert!(health.is_ok());
        assert_eq!(health.counts().ok, 2);
    }

    #[test]
    fn classification_is_pure() {
        let local = point();
        let remote = index(&[("b", "x2")]);
        assert_eq!(classify(&local, &remote), classify(&local, &remote));
    }

    #[test]
    fn extra_remote_chunks_are_ignored() {
        let remote = index(&[("a", "x1"), ("b", "x2"), ("stale", "zz")]);
        let health = classify(&point(), &remote);
        assert!(health.is_ok());
        assert_eq!(health.chunks().len(), 2);
    }

    #[test]
    fn point_without_chunks_is_ok() {
        let empty = PointDraft::with_id("20240101000000-e", 0, "25", true).seal();
        assert!(classify(&empty, &ChunkIndex::new()).is_ok());
    }
}
