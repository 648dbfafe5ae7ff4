//! File-change notifications decoded into a fixed shape and recorded for
//! incremental composition.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::db::Database;
use crate::util::utc_now;

/// A node event as delivered by the host, reduced to the paths involved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    Created { path: String },
    Written { path: String },
    Renamed { source: String, target: String },
}

impl NodeEvent {
    /// The file whose content changed. Renames resolve to their target.
    #[must_use]
    pub fn changed_file(&self) -> ChangedFile {
        let path = match self {
            Self::Created { path } | Self::Written { path } => path,
            Self::Renamed { target, .. } => target,
        };
        ChangedFile::new(path.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedFile {
    path: String,
}

impl ChangedFile {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Records changed files into the state database.
#[derive(Clone)]
pub struct ChangeTracker {
    db: Database,
}

impl ChangeTracker {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Records the file changed by `event`.
    ///
    /// # Errors
    /// Returns an error if the change cannot be stored.
    pub async fn record(&self, event: &NodeEvent) -> Result<ChangedFile> {
        let changed = event.changed_file();
        self.db.record_changed(changed.path(), utc_now()).await?;
        debug!(path = %changed.path(), "recorded file change");
        Ok(changed)
    }

    /// Files changed at or after `since`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn changed_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangedFile>> {
        Ok(self
            .db
            .changed_since(since)
            .await?
            .into_iter()
            .map(ChangedFile::new)
            .collect())
    }

    /// Forgets recorded changes, typically after a complete point was sealed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn clear(&self) -> Result<()> {
        self.db.clear_changed().await
    }
}
