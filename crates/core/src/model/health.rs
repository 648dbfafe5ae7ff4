use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ModelError;

/// Identifies a chunk inside a point: dataset name plus chunk name.
///
/// Neither name holds a `/` when built through the model constructors, so
/// the `data/chunk` display form is unambiguous.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkKey {
    pub data: String,
    pub chunk: String,
}

impl ChunkKey {
    #[must_use]
    pub fn new(data: impl Into<String>, chunk: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            chunk: chunk.into(),
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.data, self.chunk)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChunkStatus {
    #[default]
    Unknown,
    Ok,
    Missing,
    Checksum,
}

impl ChunkStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Ok => "OK",
            Self::Missing => "MISSING",
            Self::Checksum => "CHECKSUM",
        }
    }

    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl TryFrom<&str> for ChunkStatus {
    type Error = ModelError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "UNKNOWN" => Ok(Self::Unknown),
            "OK" => Ok(Self::Ok),
            "MISSING" => Ok(Self::Missing),
            "CHECKSUM" => Ok(Self::Checksum),
            other => Err(ModelError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Unknown,
    Ok,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoringChunkHealth {
    data_name: String,
    chunk_name: String,
    status: ChunkStatus,
}

impl RestoringChunkHealth {
    #[must_use]
    pub fn new(key: &ChunkKey, status: ChunkStatus) -> Self {
        Self {
            data_name: key.data.clone(),
            chunk_name: key.chunk.clone(),
            status,
        }
    }

    #[must_use]
    pub fn data_name(&self) -> &str {
        &self.data_name
    }

    #[must_use]
    pub fn chunk_name(&self) -> &str {
        &self.chunk_name
    }

    #[must_use]
    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(&self.data_name, &self.chunk_name)
    }

    #[must_use]
    pub fn status(&self) -> ChunkStatus {
        self.status
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthCounts {
    pub unknown: usize,
    pub ok: usize,
    pub missing: usize,
    pub faulty: usize,
}

impl fmt::Display for HealthCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} uploaded, {} missing and {} faulty files",
            self.ok, self.missing, self.faulty
        )?;
        if self.unknown > 0 {
            write!(f, " ({} unchecked)", self.unknown)?;
        }
        Ok(())
    }
}

/// Per-chunk classification of a point plus the aggregate status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoringHealth {
    status: HealthStatus,
    chunks: BTreeMap<String, RestoringChunkHealth>,
}

impl RestoringHealth {
    /// Builds a health record; the aggregate is derived from the worst chunk.
    pub fn from_chunks(chunks: impl IntoIterator<Item = RestoringChunkHealth>) -> Self {
        let chunks: BTreeMap<String, RestoringChunkHealth> = chunks
            .into_iter()
            .map(|entry| (entry.key().to_string(), entry))
            .collect();
        let status = aggregate(chunks.values().map(RestoringChunkHealth::status));
        Self { status, chunks }
    }

    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }

    #[must_use]
    pub fn chunks(&self) -> &BTreeMap<String, RestoringChunkHealth> {
        &self.chunks
    }

    #[must_use]
    pub fn get(&self, key: &ChunkKey) -> Option<&RestoringChunkHealth> {
        self.chunks.get(&key.to_string())
    }

    /// Status recorded for `key`, `Unknown` when the chunk was never checked.
    #[must_use]
    pub fn status_of(&self, key: &ChunkKey) -> ChunkStatus {
        self.get(key)
            .map_or(ChunkStatus::Unknown, RestoringChunkHealth::status)
    }

    #[must_use]
    pub fn counts(&self) -> HealthCounts {
        let mut counts = HealthCounts::default();
        for entry in self.chunks.values() {
            match entry.status {
                ChunkStatus::Unknown => counts.unknown += 1,
                ChunkStatus::Ok => counts.ok += 1,
                ChunkStatus::Missing => counts.missing += 1,
                ChunkStatus::Checksum => counts.faulty += 1,
            }
        }
        counts
    }
}

fn aggregate(statuses: impl Iterator<Item = ChunkStatus>) -> HealthStatus {
    let mut result = HealthStatus::Ok;
    for status in statuses {
        match status {
            ChunkStatus::Missing | ChunkStatus::Checksum => return HealthStatus::Degraded,
            ChunkStatus::Unknown => result = HealthStatus::Unknown,
            ChunkStatus::Ok => {}
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkBuilder, RestoringData, RootType};

    fn entry(data: &str, chunk: &str, status: ChunkStatus) -> RestoringChunkHealth {
        RestoringChunkHealth::new(&ChunkKey::new(data, chunk), status)
    }

    #[test]
    fn built_names_keep_keys_distinct() {
        let data = RestoringData::new(RootType::Data, "", "a/b");
        let first = ChunkBuilder::fixed("c").packaged(0, "");
        let second = ChunkBuilder::fixed("b/c").packaged(0, "");
        let health = RestoringHealth::from_chunks([
            entry(data.name(), first.name(), ChunkStatus::Ok),
            entry("a", second.name(), ChunkStatus::Missing),
        ]);
        assert_eq!(health.chunks().len(), 2);
        assert!(health.chunks().contains_key("a_b/c"));
        assert!(health.chunks().contains_key("a/b_c"));
    }

    #[test]
    fn aggregate_is_ok_only_when_every_chunk_is_ok() {
        let health = RestoringHealth::from_chunks([
            entry("data", "a", ChunkStatus::Ok),
            entry("data", "b", ChunkStatus::Ok),
        ]);
        assert!(health.is_ok());

        let health = RestoringHealth::from_chunks([
            entry("data", "a", ChunkStatus::Ok),
            entry("data", "b", ChunkStatus::Unknown),
        ]);
        assert_eq!(health.status(), HealthStatus::Unknown);

        let health = RestoringHealth::from_chunks([
            entry("data", "a", ChunkStatus::Unknown),
            entry("data", "b", ChunkStatus::Checksum),
        ]);
        assert_eq!(health.status(), HealthStatus::Degraded);
    }

    #[test]
    fn counts_and_lookup() {
        let health = RestoringHealth::from_chunks([
            entry("data", "a", ChunkStatus::Ok),
            entry("data", "b", ChunkStatus::Missing),
            entry("apps", "c", ChunkStatus::Checksum),
            entry("apps", "d", ChunkStatus::Missing),
        ]);
        let counts = health.counts();
        assert_eq!(counts.ok, 1);
        assert_eq!(counts.missing, 2);
        assert_eq!(counts.faulty, 1);
        assert_eq!(
            counts.to_string(),
            "1 uploaded, 2 missing and 1 faulty files"
        );

        assert_eq!(
            health.status_of(&ChunkKey::new("apps", "c")),
            ChunkStatus::Checksum
        );
        assert_eq!(
            health.status_of(&ChunkKey::new("apps", "zzz")),
            ChunkStatus::Unknown
        );
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ChunkStatus::Unknown,
            ChunkStatus::Ok,
            ChunkStatus::Missing,
            ChunkStatus::Checksum,
        ] {
            assert_eq!(ChunkStatus::try_from(status.as_str()).unwrap(), status);
        }
        assert!(ChunkStatus::try_from("STALE").is_err());
    }

    #[test]
    fn health_json_is_keyed_by_dataset_and_chunk() {
        let health = RestoringHealth::from_chunks([entry("data", "a", ChunkStatus::Missing)]);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "DEGRADED");
        assert_eq!(json["chunks"]["data/a"]["status"], "MISSING");
        assert_eq!(json["chunks"]["data/a"]["dataName"], "data");

        let back: RestoringHealth = serde_json::from_value(json).unwrap();
        assert_eq!(back, health);
    }
}
