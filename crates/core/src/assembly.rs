use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::archive::{ArchiveError, ArchiveService};
use crate::config::SystemConfig;
use crate::db::{Database, PointRecord};
use crate::dump::{SqlDump, SqlDumpError};
use crate::journal::AssemblyStage;
use crate::model::{PointDraft, RestoringData, RestoringPoint, RootType};
use crate::store::{PointError, PointStore};
use crate::storage::StorageError;
use crate::util::short_hex;

/// Name of the database dump chunk inside the `sqldump` dataset.
pub const SQL_DUMP_FILE: &str = "backup_sql";

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("filesystem error: {0}")]
    Filesystem(String),
    #[error("failed to create archive: {0}")]
    ArchiveCreate(String),
    #[error("failed to delete archive: {0}")]
    ArchiveDelete(String),
    #[error("archive not found: {0}")]
    ArchiveNotFound(String),
    #[error("failed to copy application code: {0}")]
    AppCopy(String),
    #[error("restore script not found at {}", .0.display())]
    ScriptNotFound(PathBuf),
    #[error("sql dump failed: {0}")]
    SqlDump(#[from] SqlDumpError),
    #[error("state database error: {0}")]
    State(String),
}

fn filesystem(err: impl Display) -> AssemblyError {
    AssemblyError::Filesystem(err.to_string())
}

impl From<StorageError> for AssemblyError {
    fn from(err: StorageError) -> Self {
        filesystem(err)
    }
}

impl From<PointError> for AssemblyError {
    fn from(err: PointError) -> Self {
        filesystem(err)
    }
}

impl From<ArchiveError> for AssemblyError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Create(msg) => Self::ArchiveCreate(msg),
            ArchiveError::Delete(msg) => Self::ArchiveDelete(msg),
            ArchiveError::NotFound(msg) => Self::ArchiveNotFound(msg),
            ArchiveError::AppCopy(msg) => Self::AppCopy(msg),
            ArchiveError::ScriptNotFound(path) => Self::ScriptNotFound(path),
            ArchiveError::Corrupted(err) => Self::ArchiveCreate(err.to_string()),
            ArchiveError::Storage(err) => filesystem(err),
        }
    }
}

/// Computes the datasets of a non-complete point.
pub trait IncrementalStrategy: Send + Sync {
    fn incremental_data(&self, last_complete: Option<&PointRecord>) -> Vec<RestoringData>;
}

/// Contributes no datasets; partial points then hold only apps, config and dump.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIncrement;

impl IncrementalStrategy for NoIncrement {
    fn incremental_data(&self, last_complete: Option<&PointRecord>) -> Vec<RestoringData> {
        info!(
            base = last_complete.map_or("none", |record| record.id.as_str()),
            "incremental composition is not available, adding no user data"
        );
        Vec::new()
    }
}

/// Builds restoring points in a fixed sequence of stages.
pub struct PointAssembly {
    store: PointStore,
    archive: Arc<dyn ArchiveService>,
    dump: Arc<dyn SqlDump>,
    system: SystemConfig,
    db: Option<Database>,
    incremental: Arc<dyn IncrementalStrategy>,
}

impl PointAssembly {
    #[must_use]
    pub fn new(
        store: PointStore,
        archive: Arc<dyn ArchiveService>,
        dump: Arc<dyn SqlDump>,
        system: SystemConfig,
    ) -> Self {
        Self {
            store,
            archive,
            dump,
            system,
            db: None,
            incremental: Arc::new(NoIncrement),
        }
    }

    #[must_use]
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    #[must_use]
    pub fn with_incremental(mut self, strategy: Arc<dyn IncrementalStrategy>) -> Self {
        self.incremental = strategy;
        self
    }

    /// Creates and seals a new restoring point. Any failure aborts the
    /// assembly; the chunks written so far are removed and the point keeps
    /// its empty metadata placeholder, so it never loads as complete.
    ///
    /// # Errors
    /// Returns the [`AssemblyError`] of the first failing stage.
    pub async fn create(&self, complete: bool) -> Result<RestoringPoint, AssemblyError> {
        self.store.init_root().await?;

        let draft = PointDraft::new(self.system.version.clone(), complete);
        let id = draft.id().to_string();
        self.store.reserve(&id).await?;
        self.store.record_stage(&id, AssemblyStage::Reserved).await?;
        if let Some(db) = &self.db {
            db.register_point(&id, draft.date(), draft.nc_version(), complete)
                .await
                .map_err(|err| AssemblyError::State(format!("{err:#}")))?;
        }
        info!(point = %id, complete, "reserved restoring point");

        match self.assemble(draft).await {
            Ok(point) => Ok(point),
            Err(err) => {
                warn!(point = %id, error = %err, "assembly failed, discarding chunks");
                self.discard(&id).await;
                Err(err)
            }
        }
    }

    async fn assemble(&self, mut draft: PointDraft) -> Result<RestoringPoint, AssemblyError> {
        let id = draft.id().to_string();

        self.compose(&mut draft).await?;
        self.store.record_stage(&id, AssemblyStage::Composed).await?;
        info!(point = %id, datasets = draft.restoring_data().len(), "composed datasets");

        self.archive.copy_app(&id).await?;
        self.store.record_stage(&id, AssemblyStage::AppCopied).await?;

        let datasets = draft.restoring_data().to_vec();
        for data in &datasets {
            let chunks = self.archive.create_chunks(&id, data).await?;
            info!(point = %id, data = %data.name(), chunks = chunks.len(), "packaged dataset");
            draft.add_chunks(data.name(), chunks);
        }
        self.store.record_stage(&id, AssemblyStage::Chunked).await?;

        let content = self.dump.export(&self.system.db_params()).await?;
        let dump_data = RestoringData::new(RootType::SqlDump, "", RestoringData::SQL_DUMP);
        let chunk = self
            .archive
            .create_content_chunk(&id, &dump_data, SQL_DUMP_FILE, content)
            .await?;
        info!(point = %id, bytes = chunk.size(), "stored sql dump");
        draft.add_data(dump_data);
        draft.add_chunks(RestoringData::SQL_DUMP, [chunk]);
        self.store.record_stage(&id, AssemblyStage::Dumped).await?;

        let point = draft.seal();
        self.store.write_metadata(&point).await?;
        self.store.record_stage(&id, AssemblyStage::Sealed).await?;
        if let Some(db) = &self.db {
            db.mark_sealed(&id)
                .await
                .map_err(|err| AssemblyError::State(format!("{err:#}")))?;
        }
        info!(point = %id, chunks = point.chunk_count(), "sealed restoring point");
        Ok(point)
    }

    async fn compose(&self, draft: &mut PointDraft) -> Result<(), AssemblyError> {
        if draft.is_complete() {
            draft.add_data(RestoringData::new(RootType::Data, "", RestoringData::DATA));
        } else {
            let last = match &self.db {
                Some(db) => db
                    .last_complete()
                    .await
                    .map_err(|err| AssemblyError::State(format!("{err:#}")))?,
                None => None,
            };
            for data in self.incremental.incremental_data(last.as_ref()) {
                draft.add_data(data);
            }
        }

        draft.add_data(RestoringData::new(
            RootType::Nextcloud,
            "apps/",
            RestoringData::APPS,
        ));
        draft.add_data(RestoringData::new(
            RootType::FileConfig,
            "",
            RestoringData::CONFIG,
        ));

        for apps in &self.system.apps_paths {
            let name = format!("apps_{}", short_hex(4));
            draft.add_data(RestoringData::new(
                RootType::Disk,
                apps.path.to_string_lossy(),
                name,
            ));
        }
        Ok(())
    }

    async fn discard(&self, id: &str) {
        if let Err(err) = self.archive.delete_chunks(id).await {
            let err = AssemblyError::from(err);
            warn!(point = %id, error = %err, "failed to remove chunks of aborted point");
        }
        if let Some(db) = &self.db {
            if let Err(err) = db.forget_point(id).await {
                warn!(point = %id, error = %err, "failed to forget aborted point");
            }
        }
    }
}
