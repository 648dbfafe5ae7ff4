use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::config::InstanceConfig;
use crate::model::{RestoringChunk, RestoringPoint};
use crate::store::PointStore;

pub mod http;
pub mod local;

pub use http::HttpRemote;
pub use local::LocalRemote;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("restoring point {0} not found on remote instance")]
    PointNotFound(String),
    #[error("remote instance {0} not found")]
    InstanceNotFound(String),
    #[error("remote instance error: {0}")]
    Instance(String),
    #[error("remote resource {0} not found")]
    ResourceNotFound(String),
    #[error("invalid item: {0}")]
    InvalidItem(String),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of a remote lookup, forcing callers to handle absence.
#[derive(Debug)]
pub enum Fetched<T> {
    Found(T),
    NotFound,
    Unreachable(RemoteError),
}

impl<T> Fetched<T> {
    /// Sorts a lookup result: a missing point is `NotFound`, any other
    /// failure is `Unreachable`.
    #[must_use]
    pub fn from_result(result: Result<T, RemoteError>) -> Self {
        match result {
            Ok(value) => Self::Found(value),
            Err(RemoteError::PointNotFound(_)) => Self::NotFound,
            Err(err) => Self::Unreachable(err),
        }
    }
}

/// One remote instance holding copies of restoring points.
#[async_trait]
pub trait RemoteInstance: Send + Sync {
    /// Fetches the remote copy of a point. With `force_health_refresh` the
    /// instance recomputes health against the chunks it stores.
    async fn get_point(
        &self,
        point_id: &str,
        force_health_refresh: bool,
    ) -> Result<RestoringPoint, RemoteError>;

    /// Pushes point metadata (no chunk payloads).
    async fn create_point(&self, point: &RestoringPoint) -> Result<RestoringPoint, RemoteError>;

    /// Uploads the payload carried inline by `chunk`.
    async fn upload_chunk(
        &self,
        point: &RestoringPoint,
        data_name: &str,
        chunk: &RestoringChunk,
    ) -> Result<(), RemoteError>;
}

/// Remote instances addressed by name.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn get_point(
        &self,
        instance: &str,
        point_id: &str,
        force_health_refresh: bool,
    ) -> Result<RestoringPoint, RemoteError>;

    async fn create_point(
        &self,
        instance: &str,
        point: &RestoringPoint,
    ) -> Result<RestoringPoint, RemoteError>;

    async fn upload_chunk(
        &self,
        instance: &str,
        point: &RestoringPoint,
        data_name: &str,
        chunk: &RestoringChunk,
    ) -> Result<(), RemoteError>;

    async fn fetch_point(
        &self,
        instance: &str,
        point_id: &str,
        force_health_refresh: bool,
    ) -> Fetched<RestoringPoint> {
        Fetched::from_result(
            self.get_point(instance, point_id, force_health_refresh)
                .await,
        )
    }
}

/// Configured instances by name.
#[derive(Clone, Default)]
pub struct RemoteRegistry {
    instances: BTreeMap<String, Arc<dyn RemoteInstance>>,
}

impl RemoteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, instance: Arc<dyn RemoteInstance>) {
        self.instances.insert(name.into(), instance);
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Builds instances from configuration: `http(s)://` endpoints talk to a
    /// remote service, `file://` endpoints mirror into a local store.
    ///
    /// # Errors
    /// Returns an error for unsupported or malformed endpoints.
    pub fn from_config(instances: &[InstanceConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in instances {
            let url = Url::parse(&config.endpoint)
                .with_context(|| format!("parsing endpoint of instance {}", config.name))?;
            let instance: Arc<dyn RemoteInstance> = match url.scheme() {
                "http" | "https" => Arc::new(HttpRemote::new(&config.endpoint, &config.token)?),
                "file" => {
                    let path = url
                        .to_file_path()
                        .map_err(|()| anyhow!("invalid file endpoint {}", config.endpoint))?;
                    Arc::new(LocalRemote::new(PointStore::local(path)))
                }
                scheme => anyhow::bail!(
                    "unsupported endpoint scheme {scheme} for instance {}",
                    config.name
                ),
            };
            registry.insert(config.name.clone(), instance);
        }
        Ok(registry)
    }

    fn instance(&self, name: &str) -> Result<&Arc<dyn RemoteInstance>, RemoteError> {
        self.instances
            .get(name)
            .ok_or_else(|| RemoteError::InstanceNotFound(name.to_string()))
    }
}

#[async_trait]
impl RemoteService for RemoteRegistry {
    async fn get_point(
        &self,
        instance: &str,
        point_id: &str,
        force_health_refresh: bool,
    ) -> Result<RestoringPoint, RemoteError> {
        self.instance(instance)?
            .get_point(point_id, force_health_refresh)
            .await
    }

    async fn create_point(
        &self,
        instance: &str,
        point: &RestoringPoint,
    ) -> Result<RestoringPoint, RemoteError> {
        self.instance(instance)?.create_point(point).await
    }

    async fn upload_chunk(
        &self,
        instance: &str,
        point: &RestoringPoint,
        data_name: &str,
        chunk: &RestoringChunk,
    ) -> Result<(), RemoteError> {
        self.instance(instance)?
            .upload_chunk(point, data_name, chunk)
            .await
    }
}
