use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use directories::BaseDirs;
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const ENV_HOME: &str = "POINTSYNC_HOME";

const POINT_TOKEN_LEN: usize = 15;

#[derive(Clone, Debug)]
pub struct HomePaths {
    pub base: PathBuf,
    pub appdata_dir: PathBuf,
    pub state_db_path: PathBuf,
    pub config_path: PathBuf,
}

impl HomePaths {
    #[must_use]
    pub fn new(base: PathBuf) -> Self {
        let appdata_dir = base.join("appdata");
        let state_db_path = base.join("state.db");
        let config_path = base.join("config.json");
        Self {
            base,
            appdata_dir,
            state_db_path,
            config_path,
        }
    }

    /// Ensures the home and app-data directories exist.
    ///
    /// # Errors
    /// Returns an error if the directories cannot be created.
    pub async fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.base)
            .await
            .with_context(|| format!("creating home directory at {}", self.base.display()))?;
        fs::create_dir_all(&self.appdata_dir)
            .await
            .with_context(|| {
                format!(
                    "creating app-data directory at {}",
                    self.appdata_dir.display()
                )
            })?;
        Ok(())
    }
}

/// Resolves the workspace home directory using overrides, environment, or defaults.
///
/// # Errors
/// Returns an error if the user's home directory cannot be determined.
pub fn resolve_home(home_override: Option<&Path>) -> Result<HomePaths> {
    if let Some(path) = home_override {
        return Ok(HomePaths::new(expand_path(path)?));
    }

    if let Ok(env_path) = env::var(ENV_HOME) {
        return Ok(HomePaths::new(PathBuf::from(env_path)));
    }

    let base_dirs = BaseDirs::new().context("resolving user home directory")?;
    let default = base_dirs.home_dir().join(".pointsync");
    Ok(HomePaths::new(default))
}

/// Expands a filesystem path, handling a leading tilde to the current user's home.
///
/// # Errors
/// Returns an error if the home directory cannot be determined.
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    let text = path.to_string_lossy();
    if let Some(stripped) = text.strip_prefix('~') {
        let base_dirs = BaseDirs::new().context("resolving user home directory")?;
        let home = base_dirs.home_dir();
        let joined = if stripped.is_empty() {
            home.to_path_buf()
        } else {
            home.join(stripped.trim_start_matches('/'))
        };
        Ok(joined)
    } else {
        Ok(PathBuf::from(path))
    }
}

#[must_use]
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Renders the BLAKE3 digest of `data` as lowercase hex.
#[must_use]
pub fn checksum_hex(data: &[u8]) -> String {
    let hash: [u8; 32] = blake3::hash(data).into();
    hex::encode(hash)
}

/// Random alphanumeric token appended to point ids.
#[must_use]
pub fn point_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(POINT_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Short random hex label, `len` bytes of entropy.
#[must_use]
pub fn short_hex(len: usize) -> String {
    let mut buf = vec![0_u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Writes data to a temporary file and renames it into place to provide atomic semantics.
///
/// # Errors
/// Returns an error if the temporary file cannot be written or renamed.
pub async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map_or_else(|| "write".into(), |name| name.to_string_lossy());
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}
