use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Default timeout for a dump run (1 hour).
pub const DUMP_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum SqlDumpError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} failed (exit code {code}): {stderr}")]
    Failed {
        program: String,
        code: String,
        stderr: String,
    },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("missing connection parameter {0}")]
    MissingParam(&'static str),
}

/// Connection parameters read from the host system configuration.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DbParams {
    pub dbname: String,
    pub dbhost: String,
    pub dbport: String,
    pub dbuser: String,
    pub dbpassword: String,
}

impl fmt::Debug for DbParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbParams")
            .field("dbname", &self.dbname)
            .field("dbhost", &self.dbhost)
            .field("dbport", &self.dbport)
            .field("dbuser", &self.dbuser)
            .field("dbpassword", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait SqlDump: Send + Sync {
    async fn export(&self, params: &DbParams) -> Result<Vec<u8>, SqlDumpError>;
}

/// Dumps a MySQL/MariaDB database through the `mysqldump` client.
#[derive(Clone, Debug)]
pub struct MysqlDump {
    program: String,
    timeout: Duration,
}

impl Default for MysqlDump {
    fn default() -> Self {
        Self {
            program: "mysqldump".to_string(),
            timeout: DUMP_TIMEOUT,
        }
    }
}

impl MysqlDump {
    #[must_use]
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn args(params: &DbParams) -> Result<Vec<String>, SqlDumpError> {
        if params.dbname.is_empty() {
            return Err(SqlDumpError::MissingParam("dbname"));
        }
        let mut args = vec![
            "--single-transaction".to_string(),
            "--skip-lock-tables".to_string(),
        ];
        let (host, port_in_host) = match params.dbhost.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (params.dbhost.as_str(), None),
        };
        if !host.is_empty() {
            args.push(format!("--host={host}"));
        }
        let port = if params.dbport.is_empty() {
            port_in_host
        } else {
            Some(params.dbport.as_str())
        };
        if let Some(port) = port.filter(|p| !p.is_empty()) {
            args.push(format!("--port={port}"));
        }
        if !params.dbuser.is_empty() {
            args.push(format!("--user={}", params.dbuser));
        }
        args.push(params.dbname.clone());
        Ok(args)
    }
}

#[async_trait]
impl SqlDump for MysqlDump {
    async fn export(&self, params: &DbParams) -> Result<Vec<u8>, SqlDumpError> {
        let args = Self::args(params)?;
        info!(program = %self.program, db = %params.dbname, "running sql dump");

        let child = Command::new(&self.program)
            .args(&args)
            .env("MYSQL_PWD", &params.dbpassword)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SqlDumpError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SqlDumpError::Timeout {
                program: self.program.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| SqlDumpError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "unknown".to_string(), |c| c.to_string());
            return Err(SqlDumpError::Failed {
                program: self.program.clone(),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if output.stdout.is_empty() {
            warn!(db = %params.dbname, "sql dump produced empty output");
        }
        Ok(output.stdout)
    }
}
