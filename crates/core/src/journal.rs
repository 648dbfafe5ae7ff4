use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::{AppData, Folder, StorageError, StorageResult};
use crate::util::utc_now;

pub const JOURNAL_FILE: &str = "journal.json";

/// Stages of point assembly, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyStage {
    Start,
    Reserved,
    Composed,
    AppCopied,
    Chunked,
    Dumped,
    Sealed,
}

impl AssemblyStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Reserved => "reserved",
            Self::Composed => "composed",
            Self::AppCopied => "app_copied",
            Self::Chunked => "chunked",
            Self::Dumped => "dumped",
            Self::Sealed => "sealed",
        }
    }
}

impl fmt::Display for AssemblyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub stage: AssemblyStage,
    pub updated_at: DateTime<Utc>,
}

/// Stage log kept next to a point's metadata while it is being assembled.
#[derive(Debug)]
pub struct Journal {
    folder: Folder,
    entries: Vec<JournalEntry>,
}

impl Journal {
    /// Loads the journal of `folder`, or starts an empty one when none exists.
    ///
    /// # Errors
    /// Returns an error if an existing journal cannot be read. Unparsable
    /// content is logged and treated as an empty journal.
    pub async fn load(data: &dyn AppData, folder: &Folder) -> StorageResult<Self> {
        let entries = if data.file_exists(folder, JOURNAL_FILE).await? {
            let bytes = data.get_content(folder, JOURNAL_FILE).await?;
            match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(folder = %folder.path(), error = %err, "discarding unreadable journal");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        Ok(Self {
            folder: folder.clone(),
            entries,
        })
    }

    /// Returns the most recently recorded stage, defaulting to `AssemblyStage::Start`.
    #[must_use]
    pub fn current_stage(&self) -> AssemblyStage {
        self.entries
            .last()
            .map_or(AssemblyStage::Start, |entry| entry.stage)
    }

    #[must_use]
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Appends a stage transition and persists the journal.
    ///
    /// # Errors
    /// Returns an error if the journal cannot be written.
    pub async fn record(&mut self, data: &dyn AppData, stage: AssemblyStage) -> StorageResult<()> {
        self.entries.push(JournalEntry {
            stage,
            updated_at: utc_now(),
        });
        let bytes = serde_json::to_vec_pretty(&self.entries).map_err(|err| {
            StorageError::from_io(&format!("{}/{JOURNAL_FILE}", self.folder.path()), err.into())
        })?;
        data.put_content(&self.folder, JOURNAL_FILE, &bytes).await
    }
}
