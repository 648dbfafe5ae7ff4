use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{content_b64, flat_name, ModelError};
use crate::util::checksum_hex;

const ARCHIVE_EXTENSION: &str = "zip";

/// A packaged, checksummed unit of a dataset.
///
/// Instances are produced by [`ChunkBuilder`]; `name`, `size` and `checksum`
/// cannot be edited afterwards. Replacing the payload goes through
/// [`RestoringChunk::with_content`], which recomputes both size and checksum.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoringChunk {
    name: String,
    count: u64,
    size: u64,
    #[serde(default)]
    static_name: bool,
    checksum: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "content_b64")]
    content: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parts: Vec<RestoringChunkPart>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    stored: bool,
}

impl RestoringChunk {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_static_name(&self) -> bool {
        self.static_name
    }

    /// Name of the payload in backing storage.
    #[must_use]
    pub fn filename(&self) -> String {
        if self.static_name {
            self.name.clone()
        } else {
            format!("{}.{ARCHIVE_EXTENSION}", self.name)
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    #[must_use]
    pub fn files(&self) -> &[String] {
        &self.files
    }

    #[must_use]
    pub fn parts(&self) -> &[RestoringChunkPart] {
        &self.parts
    }

    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    #[must_use]
    pub fn is_stored(&self) -> bool {
        self.stored
    }

    /// Marks the payload as durably written.
    #[must_use]
    pub fn into_stored(mut self) -> Self {
        self.stored = true;
        self
    }

    /// Replaces the inline payload, recomputing `size` and `checksum` from it.
    #[must_use]
    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.size = content.len() as u64;
        self.checksum = checksum_hex(&content);
        self.content = content;
        self
    }

    /// Attaches a payload read back from storage without altering the recorded
    /// checksum.
    ///
    /// # Errors
    /// Returns [`ModelError::ChecksumMismatch`] when the payload does not hash to
    /// the recorded checksum.
    pub fn with_loaded_content(mut self, content: Vec<u8>) -> Result<Self, ModelError> {
        let actual = checksum_hex(&content);
        if actual != self.checksum {
            return Err(ModelError::ChecksumMismatch {
                name: self.name,
                expected: self.checksum,
                actual,
            });
        }
        self.content = content;
        Ok(self)
    }

    /// Drops the transient inline payload.
    #[must_use]
    pub fn without_content(mut self) -> Self {
        self.content = Vec::new();
        self
    }

    /// Whether the inline payload matches the recorded checksum.
    #[must_use]
    pub fn content_matches(&self) -> bool {
        checksum_hex(&self.content) == self.checksum
    }
}

/// Assembles a [`RestoringChunk`].
#[derive(Clone, Debug)]
pub struct ChunkBuilder {
    name: String,
    static_name: bool,
    files: Vec<String>,
    parts: Vec<RestoringChunkPart>,
    count: Option<u64>,
}

impl ChunkBuilder {
    /// A per-point unique name: `base-<uuid>`, or the bare uuid when `base` is empty.
    #[must_use]
    pub fn generated(base: &str) -> Self {
        let suffix = Uuid::new_v4().to_string();
        let name = if base.is_empty() {
            suffix
        } else {
            format!("{base}-{suffix}")
        };
        Self::with_name(name, false)
    }

    /// A caller-assigned name that stays stable across points.
    #[must_use]
    pub fn fixed(name: impl Into<String>) -> Self {
        Self::with_name(name.into(), true)
    }

    fn with_name(name: String, static_name: bool) -> Self {
        Self {
            name: flat_name(name),
            static_name,
            files: Vec::new(),
            parts: Vec::new(),
            count: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn file(mut self, path: impl Into<String>) -> Self {
        self.files.push(path.into());
        self
    }

    #[must_use]
    pub fn files<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files.extend(paths.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn part(mut self, part: RestoringChunkPart) -> Self {
        self.parts.push(part);
        self
    }

    /// Overrides the file count, for payloads not assembled from files.
    #[must_use]
    pub fn count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Finishes a chunk whose payload was written elsewhere.
    #[must_use]
    pub fn packaged(self, size: u64, checksum: impl Into<String>) -> RestoringChunk {
        let count = self.count.unwrap_or(self.files.len() as u64);
        RestoringChunk {
            name: self.name,
            count,
            size,
            static_name: self.static_name,
            checksum: checksum.into(),
            content: Vec::new(),
            files: self.files,
            parts: self.parts,
            stored: false,
        }
    }

    /// Finishes a chunk carrying its payload inline.
    #[must_use]
    pub fn with_content(self, content: Vec<u8>) -> RestoringChunk {
        self.packaged(0, String::new()).with_content(content)
    }
}

/// A sub-unit of a chunk, optionally stored encrypted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "PartRecord")]
pub struct RestoringChunkPart {
    name: String,
    encrypted: bool,
    checksum: String,
    encrypted_checksum: String,
    #[serde(skip_serializing_if = "Vec::is_empty", with = "content_b64")]
    content: Vec<u8>,
}

impl RestoringChunkPart {
    /// A plaintext part described by the checksum of `plaintext`.
    #[must_use]
    pub fn from_plaintext(name: impl Into<String>, plaintext: &[u8]) -> Self {
        Self {
            name: name.into(),
            encrypted: false,
            checksum: checksum_hex(plaintext),
            encrypted_checksum: String::new(),
            content: Vec::new(),
        }
    }

    /// Records the encrypted form of the part. The plaintext checksum is kept.
    #[must_use]
    pub fn into_encrypted(mut self, ciphertext: &[u8]) -> Self {
        self.encrypted = true;
        self.encrypted_checksum = checksum_hex(ciphertext);
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical name of the part under the given extension; an empty extension
    /// yields the bare name.
    #[must_use]
    pub fn filename(&self, ext: &str) -> String {
        if ext.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{ext}", self.name)
        }
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    #[must_use]
    pub fn encrypted_checksum(&self) -> &str {
        &self.encrypted_checksum
    }

    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Checks stored bytes against the checksum of the form they are stored in.
    #[must_use]
    pub fn matches(&self, stored: &[u8]) -> bool {
        let expected = if self.encrypted {
            &self.encrypted_checksum
        } else {
            &self.checksum
        };
        checksum_hex(stored) == *expected
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartRecord {
    name: String,
    #[serde(default)]
    encrypted: bool,
    #[serde(default)]
    checksum: String,
    #[serde(default)]
    encrypted_checksum: String,
    #[serde(default, with = "content_b64")]
    content: Vec<u8>,
}

impl TryFrom<PartRecord> for RestoringChunkPart {
    type Error = ModelError;

    fn try_from(record: PartRecord) -> Result<Self, Self::Error> {
        if !record.encrypted && !record.encrypted_checksum.is_empty() {
            return Err(ModelError::PlainPartWithEncryptedChecksum(record.name));
        }
        Ok(Self {
            name: record.name,
            encrypted: record.encrypted,
            checksum: record.checksum,
            encrypted_checksum: record.encrypted_checksum,
            content: record.content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_follows_files_unless_overridden() {
        let chunk = ChunkBuilder::generated("data")
            .files(["a.txt", "b/c.txt"])
            .packaged(10, "abc");
        assert_eq!(chunk.count(), 2);

        let dump = ChunkBuilder::fixed("backup_sql")
            .count(1)
            .with_content(b"CREATE TABLE t;".to_vec());
        assert_eq!(dump.count(), 1);
        assert!(dump.files().is_empty());

        let json = serde_json::to_string(&dump).unwrap();
        let back: RestoringChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back.count(), 1);
    }

    #[test]
    fn generated_names_are_unique_and_zipped() {
        let a = ChunkBuilder::generated("data").packaged(0, "");
        let b = ChunkBuilder::generated("data").packaged(0, "");
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("data-"));
        assert_eq!(a.filename(), format!("{}.zip", a.name()));
        assert!(!a.is_static_name());

        let bare = ChunkBuilder::generated("").packaged(0, "");
        assert!(!bare.name().starts_with('-'));

        let fixed = ChunkBuilder::fixed("backup_sql").packaged(0, "");
        assert_eq!(fixed.filename(), "backup_sql");
    }

    #[test]
    fn chunk_names_never_hold_separators() {
        let fixed = ChunkBuilder::fixed("b/c").packaged(0, "");
        assert_eq!(fixed.name(), "b_c");
        assert_eq!(fixed.filename(), "b_c");

        let generated = ChunkBuilder::generated("apps/x").packaged(0, "");
        assert!(generated.name().starts_with("apps_x-"));
    }

    #[test]
    fn content_replacement_recomputes_size_and_checksum() {
        let chunk = ChunkBuilder::fixed("dump").with_content(b"first".to_vec());
        let first_sum = chunk.checksum().to_string();
        assert_eq!(chunk.size(), 5);

        let chunk = chunk.with_content(b"second payload".to_vec());
        assert_eq!(chunk.size(), 14);
        assert_ne!(chunk.checksum(), first_sum);
        assert!(chunk.content_matches());
    }

    #[test]
    fn loaded_content_must_match_checksum() {
        let chunk = ChunkBuilder::fixed("dump")
            .with_content(b"payload".to_vec())
            .without_content();
        assert!(!chunk.has_content());

        let loaded = chunk.clone().with_loaded_content(b"payload".to_vec()).unwrap();
        assert_eq!(loaded.content(), b"payload");

        let err = chunk.with_loaded_content(b"tampered".to_vec()).unwrap_err();
        assert!(matches!(err, ModelError::ChecksumMismatch { .. }));
    }

    #[test]
    fn chunk_json_omits_empty_content() {
        let chunk = ChunkBuilder::generated("apps")
            .file("apps/files/appinfo.xml")
            .packaged(42, "deadbeef")
            .into_stored();
        let json = serde_json::to_value(&chunk).unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(json["staticName"], false);
        assert_eq!(json["count"], 1);

        let back: RestoringChunk = serde_json::from_value(json).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn chunk_without_content_key_decodes() {
        let json = r#"{"name":"backup_sql","count":1,"size":3,"staticName":true,"checksum":"x"}"#;
        let chunk: RestoringChunk = serde_json::from_str(json).unwrap();
        assert!(!chunk.has_content());
        assert!(chunk.is_static_name());
        assert_eq!(chunk.filename(), "backup_sql");
    }

    #[test]
    fn chunk_with_inline_content_round_trips() {
        let chunk = ChunkBuilder::fixed("backup_sql")
            .count(1)
            .with_content(b"INSERT INTO t VALUES (1);".to_vec());
        let json = serde_json::to_string_pretty(&chunk).unwrap();
        assert!(json.contains("\"content\""));
        let back: RestoringChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn part_filename_uses_caller_extension() {
        let part = RestoringChunkPart::from_plaintext("data-1-00", b"abc");
        assert_eq!(part.filename(""), "data-1-00");
        assert_eq!(part.filename("zip"), "data-1-00.zip");
        assert_eq!(part.filename("enc"), "data-1-00.enc");
    }

    #[test]
    fn plain_part_has_no_encrypted_checksum() {
        let part = RestoringChunkPart::from_plaintext("p", b"abc");
        assert!(!part.is_encrypted());
        assert!(part.encrypted_checksum().is_empty());
        assert!(part.matches(b"abc"));

        let sealed = part.into_encrypted(b"\x01\x02\x03");
        assert!(sealed.is_encrypted());
        assert_eq!(sealed.checksum(), checksum_hex(b"abc"));
        assert!(sealed.matches(b"\x01\x02\x03"));
        assert!(!sealed.matches(b"abc"));
    }

    #[test]
    fn chunk_parts_keep_order_through_json() {
        let chunk = ChunkBuilder::generated("data")
            .file("alice/a.txt")
            .part(RestoringChunkPart::from_plaintext("data-00", b"first"))
            .part(RestoringChunkPart::from_plaintext("data-01", b"second").into_encrypted(b"enc"))
            .packaged(11, checksum_hex(b"whole"));
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["parts"][0]["name"], "data-00");
        assert_eq!(json["parts"][1]["encrypted"], true);

        let back: RestoringChunk = serde_json::from_value(json).unwrap();
        assert_eq!(back, chunk);
        let names: Vec<&str> = back.parts().iter().map(RestoringChunkPart::name).collect();
        assert_eq!(names, ["data-00", "data-01"]);
        assert_eq!(back.count(), 1);
    }

    #[test]
    fn part_round_trip_and_validation() {
        let part = RestoringChunkPart::from_plaintext("p", b"abc")
            .into_encrypted(b"xyz")
            .with_content(b"xyz".to_vec());
        let json = serde_json::to_string(&part).unwrap();
        let back: RestoringChunkPart = serde_json::from_str(&json).unwrap();
        assert_eq!(back, part);

        let plain = RestoringChunkPart::from_plaintext("q", b"abc");
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(json["encryptedChecksum"], "");

        let invalid = r#"{"name":"bad","encrypted":false,"checksum":"a","encryptedChecksum":"b"}"#;
        assert!(serde_json::from_str::<RestoringChunkPart>(invalid).is_err());
    }
}
