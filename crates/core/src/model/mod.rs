//! Restoring point data model: datasets, chunks, parts and health records.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod chunk;
mod health;
mod point;

pub use chunk::{ChunkBuilder, RestoringChunk, RestoringChunkPart};
pub use health::{
    ChunkKey, ChunkStatus, HealthCounts, HealthStatus, RestoringChunkHealth, RestoringHealth,
};
pub use point::{PointDraft, RestoringPoint};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("part {0} is not encrypted but carries an encrypted checksum")]
    PlainPartWithEncryptedChecksum(String),
    #[error("payload of chunk {name} does not match its checksum (expected {expected}, got {actual})")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("invalid chunk status '{0}'")]
    InvalidStatus(String),
}

/// Where a dataset's source root lives on the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RootType {
    /// The configured data directory.
    #[serde(rename = "ROOT_DATA")]
    Data,
    /// The host installation root.
    #[serde(rename = "ROOT_NEXTCLOUD")]
    Nextcloud,
    /// An absolute path on disk.
    #[serde(rename = "ROOT_DISK")]
    Disk,
    FileConfig,
    SqlDump,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoringData {
    #[serde(rename = "type")]
    root_type: RootType,
    path: String,
    name: String,
}

impl RestoringData {
    pub const DATA: &'static str = "data";
    pub const APPS: &'static str = "apps";
    pub const CONFIG: &'static str = "config";
    pub const SQL_DUMP: &'static str = "sqldump";

    /// `/` in `name` becomes `_`, so the name never splits a chunk key.
    #[must_use]
    pub fn new(root_type: RootType, path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            root_type,
            path: path.into(),
            name: flat_name(name.into()),
        }
    }

    #[must_use]
    pub fn root_type(&self) -> RootType {
        self.root_type
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Base64 transport for inline payloads; an absent key decodes to an empty payload.
pub(crate) mod content_b64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(content))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Replaces path separators so a name stays a single path segment.
pub(crate) fn flat_name(name: String) -> String {
    if name.contains('/') {
        name.replace('/', "_")
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restoring_data_uses_legacy_type_names() {
        let data = RestoringData::new(RootType::Nextcloud, "apps/", RestoringData::APPS);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "ROOT_NEXTCLOUD");
        assert_eq!(json["path"], "apps/");
        assert_eq!(json["name"], "apps");

        let dump = serde_json::to_value(RestoringData::new(
            RootType::SqlDump,
            "",
            RestoringData::SQL_DUMP,
        ))
        .unwrap();
        assert_eq!(dump["type"], "SQL_DUMP");

        let back: RestoringData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn dataset_names_are_single_segments() {
        let data = RestoringData::new(RootType::Disk, "/srv/apps", "apps/extra");
        assert_eq!(data.name(), "apps_extra");
        assert_eq!(data.path(), "/srv/apps");
    }
}
