//! Brings remote instances up to date with a local restoring point by
//! uploading only the chunks they are missing or hold corrupted.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::archive::{ArchiveError, ArchiveService};
use crate::config::SyncConfig;
use crate::model::{ChunkKey, HealthCounts, RestoringHealth, RestoringPoint};
use crate::remote::{Fetched, RemoteError, RemoteService};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncOptions {
    pub instance_concurrency: usize,
    pub upload_concurrency: usize,
    pub timeout: Duration,
    pub force_health_refresh: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            instance_concurrency: config.instance_concurrency.max(1),
            upload_concurrency: config.upload_concurrency.max(1),
            timeout: config.timeout(),
            force_health_refresh: config.force_health_refresh,
        }
    }
}

/// Final state of one instance after a reconciliation run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceOutcome {
    Converged,
    Pending(HealthCounts),
    Unreachable(String),
    CreateFailed(String),
    HealthUnavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadResult {
    pub key: ChunkKey,
    pub error: Option<String>,
}

impl UploadResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for UploadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "Uploading {}: ok", self.key),
            Some(err) => write!(f, "Uploading {}: {err}", self.key),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceReport {
    pub instance: String,
    /// Whether the point had to be created on the instance during this run.
    pub created: bool,
    pub outcome: InstanceOutcome,
    pub uploads: Vec<UploadResult>,
}

impl InstanceReport {
    fn new(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            created: false,
            outcome: InstanceOutcome::Converged,
            uploads: Vec::new(),
        }
    }

    fn finish(mut self, outcome: InstanceOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.outcome == InstanceOutcome::Converged
    }

    #[must_use]
    pub fn failed_uploads(&self) -> usize {
        self.uploads.iter().filter(|upload| !upload.is_ok()).count()
    }
}

impl fmt::Display for InstanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            InstanceOutcome::Converged => write!(
                f,
                "{}: RestoringPoint is fully uploaded to {}",
                self.instance, self.instance
            ),
            InstanceOutcome::Pending(counts) => write!(f, "{}: {counts}", self.instance),
            InstanceOutcome::Unreachable(err) => {
                write!(f, "{}: instance unreachable ({err})", self.instance)
            }
            InstanceOutcome::CreateFailed(err) => write!(
                f,
                "{}: could not create restoring point on remote instance ({err})",
                self.instance
            ),
            InstanceOutcome::HealthUnavailable(err) => write!(
                f,
                "{}: could not generate health status on remote instance ({err})",
                self.instance
            ),
        }
    }
}

/// Drives reconciliation of a point against remote instances.
pub struct Reconciler {
    archive: Arc<dyn ArchiveService>,
    remote: Arc<dyn RemoteService>,
    options: SyncOptions,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        archive: Arc<dyn ArchiveService>,
        remote: Arc<dyn RemoteService>,
        options: SyncOptions,
    ) -> Self {
        Self {
            archive,
            remote,
            options,
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        tokio::time::timeout(self.options.timeout, call)
            .await
            .unwrap_or(Err(RemoteError::Timeout(self.options.timeout)))
    }

    /// Reconciles `point` with every instance, at most
    /// `instance_concurrency` at a time. Reports follow the order of `instances`.
    pub async fn reconcile_all(
        &self,
        instances: &[String],
        point: &RestoringPoint,
    ) -> Vec<InstanceReport> {
        let mut reports = stream::iter(instances.iter().enumerate())
            .map(|(index, instance)| async move { (index, self.reconcile(instance, point).await) })
            .buffer_unordered(self.options.instance_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        reports.sort_by_key(|(index, _)| *index);
        reports.into_iter().map(|(_, report)| report).collect()
    }

    /// Reconciles `point` with one instance. Failures are captured in the
    /// report; nothing here aborts other instances.
    pub async fn reconcile(&self, instance: &str, point: &RestoringPoint) -> InstanceReport {
        let mut report = InstanceReport::new(instance);
        let force = self.options.force_health_refresh;

        let fetched = Fetched::from_result(
            self.bounded(self.remote.get_point(instance, point.id(), force))
                .await,
        );
        let remote = match fetched {
            Fetched::Found(remote) => remote,
            Fetched::NotFound => {
                info!(instance = %instance, point = %point.id(), "creating restoring point on remote instance");
                let pushed = point.clone().without_health();
                match self.bounded(self.remote.create_point(instance, &pushed)).await {
                    Ok(created) => {
                        report.created = true;
                        created
                    }
                    Err(err) => {
                        warn!(instance = %instance, error = %err, "failed to create remote point");
                        return report.finish(InstanceOutcome::CreateFailed(err.to_string()));
                    }
                }
            }
            Fetched::Unreachable(err) => {
                warn!(instance = %instance, error = %err, "remote instance unreachable");
                return report.finish(InstanceOutcome::Unreachable(err.to_string()));
            }
        };

        // a freshly created point holds no chunks yet, whatever it echoes back
        let known = if report.created { None } else { remote.health() };
        let health = match known {
            Some(health) => health.clone(),
            None => match self.refreshed_health(instance, point).await {
                Ok(health) => health,
                Err(err) => {
                    warn!(instance = %instance, error = %err, "health status unavailable");
                    return report.finish(InstanceOutcome::HealthUnavailable(err));
                }
            },
        };

        if health.is_ok() {
            info!(instance = %instance, point = %point.id(), "remote instance is up to date");
            return report.finish(InstanceOutcome::Converged);
        }

        report.uploads = self.upload_pending(instance, point, &health).await;
        if report.uploads.is_empty() {
            return report.finish(InstanceOutcome::Pending(health.counts()));
        }

        let outcome = match self.refreshed_health(instance, point).await {
            Ok(after) if after.is_ok() => InstanceOutcome::Converged,
            Ok(after) => InstanceOutcome::Pending(after.counts()),
            Err(err) => {
                warn!(instance = %instance, error = %err, "could not confirm health after upload");
                InstanceOutcome::Pending(health.counts())
            }
        };
        info!(
            instance = %instance,
            point = %point.id(),
            uploaded = report.uploads.len() - report.failed_uploads(),
            failed = report.failed_uploads(),
            "reconciliation finished"
        );
        report.finish(outcome)
    }

    async fn refreshed_health(
        &self,
        instance: &str,
        point: &RestoringPoint,
    ) -> Result<RestoringHealth, String> {
        let refreshed = self
            .bounded(self.remote.get_point(instance, point.id(), true))
            .await
            .map_err(|err| err.to_string())?;
        refreshed
            .health()
            .cloned()
            .ok_or_else(|| "no health status attached".to_string())
    }

    /// Uploads every local chunk the remote health does not report as OK,
    /// in recorded chunk order. Each upload fails on its own.
    async fn upload_pending(
        &self,
        instance: &str,
        point: &RestoringPoint,
        health: &RestoringHealth,
    ) -> Vec<UploadResult> {
        let pending: Vec<ChunkKey> = point
            .chunk_entries()
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| !health.status_of(key).is_ok())
            .collect();

        stream::iter(pending)
            .map(|key| async move {
                let error = self.upload_one(instance, point, &key).await.err();
                if let Some(err) = &error {
                    warn!(instance = %instance, chunk = %key, error = %err, "chunk upload failed");
                } else {
                    info!(instance = %instance, chunk = %key, "uploaded chunk");
                }
                UploadResult { key, error }
            })
            .buffered(self.options.upload_concurrency.max(1))
            .collect()
            .await
    }

    async fn upload_one(
        &self,
        instance: &str,
        point: &RestoringPoint,
        key: &ChunkKey,
    ) -> Result<(), String> {
        let read = self
            .archive
            .get_chunk_content(point, &key.data, &key.chunk);
        let chunk = match tokio::time::timeout(self.options.timeout, read).await {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(ArchiveError::Corrupted(err))) => {
                return Err(format!("local chunk corrupted: {err}"))
            }
            Ok(Err(err)) => return Err(err.to_string()),
            Err(_) => return Err(RemoteError::Timeout(self.options.timeout).to_string()),
        };
        self.bounded(self.remote.upload_chunk(instance, point, &key.data, &chunk))
            .await
            .map_err(|err| err.to_string())
    }
}
