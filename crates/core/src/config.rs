use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::dump::DbParams;

const DEFAULT_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Settings of this tool, read from `<home>/config.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Location of the host [`SystemConfig`] document.
    #[serde(default)]
    pub system_config: Option<PathBuf>,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    /// `http(s)://` for a remote service, `file://` for a locally mounted store.
    pub endpoint: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub instance_concurrency: usize,
    pub upload_concurrency: usize,
    pub timeout_secs: u64,
    pub force_health_refresh: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            instance_concurrency: 4,
            upload_concurrency: 2,
            timeout_secs: 300,
            force_health_refresh: false,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Upper bound of raw file bytes packed into one chunk.
    pub chunk_size: u64,
    /// Directory holding this tool's own code, copied into every point.
    pub app_dir: Option<PathBuf>,
    pub restore_script: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            app_dir: None,
            restore_script: "restore.sh".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads the configuration, falling back to defaults when the file is absent.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read, parsed or validated.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing config json {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates limits and instance names.
    ///
    /// # Errors
    /// Returns an error on zero limits or duplicate instance names.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.sync.instance_concurrency > 0,
            "sync.instance_concurrency must be > 0"
        );
        anyhow::ensure!(
            self.sync.upload_concurrency > 0,
            "sync.upload_concurrency must be > 0"
        );
        anyhow::ensure!(self.sync.timeout_secs > 0, "sync.timeout_secs must be > 0");
        anyhow::ensure!(self.archive.chunk_size > 0, "archive.chunk_size must be > 0");

        let mut seen = HashSet::new();
        for instance in &self.instances {
            anyhow::ensure!(!instance.name.is_empty(), "instance name cannot be empty");
            anyhow::ensure!(
                seen.insert(instance.name.as_str()),
                "duplicate instance '{}'",
                instance.name
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn instance_names(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.name.clone()).collect()
    }
}

/// Host system configuration consumed by point assembly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub version: String,
    pub datadirectory: PathBuf,
    pub install_root: PathBuf,
    pub config_dir: PathBuf,
    #[serde(default)]
    pub apps_paths: Vec<AppsPath>,
    #[serde(default)]
    pub dbtype: String,
    #[serde(default)]
    pub dbname: String,
    #[serde(default)]
    pub dbhost: String,
    #[serde(default)]
    pub dbport: String,
    #[serde(default)]
    pub dbuser: String,
    #[serde(default)]
    pub dbpassword: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppsPath {
    pub path: PathBuf,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub writable: bool,
}

impl SystemConfig {
    /// Reads the system configuration document.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading system config {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing system config json {}", path.display()))
    }

    #[must_use]
    pub fn db_params(&self) -> DbParams {
        DbParams {
            dbname: self.dbname.clone(),
            dbhost: self.dbhost.clone(),
            dbport: self.dbport.clone(),
            dbuser: self.dbuser.clone(),
            dbpassword: self.dbpassword.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("config.json")).await.unwrap();
        assert!(config.instances.is_empty());
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.archive.restore_script, "restore.sh");
    }

    #[tokio::test]
    async fn partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"instances":[{"name":"backup2","endpoint":"https://b2.example"}],"sync":{"upload_concurrency":8}}"#,
        )
        .unwrap();
        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.instance_names(), vec!["backup2"]);
        assert_eq!(config.sync.upload_concurrency, 8);
        assert_eq!(config.sync.instance_concurrency, 4);
        assert_eq!(config.sync.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn validation_rejects_duplicates_and_zero_limits() {
        let mut config = AppConfig::default();
        config.instances = vec![
            InstanceConfig {
                name: "a".into(),
                endpoint: "https://a".into(),
                token: String::new(),
            },
            InstanceConfig {
                name: "a".into(),
                endpoint: "https://b".into(),
                token: String::new(),
            },
        ];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sync.upload_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn system_config_yields_db_params() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system.json");
        std::fs::write(
            &path,
            r#"{
                "version": "25.0.2.3",
                "datadirectory": "/srv/data",
                "install_root": "/srv/www",
                "config_dir": "/srv/www/config",
                "apps_paths": [{"path": "/srv/www/apps"}, {"path": "/srv/custom_apps", "writable": true}],
                "dbname": "cloud", "dbhost": "localhost", "dbport": "3306",
                "dbuser": "cloud", "dbpassword": "secret"
            }"#,
        )
        .unwrap();
        let system = SystemConfig::load(&path).await.unwrap();
        assert_eq!(system.apps_paths.len(), 2);
        let params = system.db_params();
        assert_eq!(params.dbname, "cloud");
        assert_eq!(params.dbport, "3306");
    }
}
