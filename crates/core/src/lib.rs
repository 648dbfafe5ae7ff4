#![warn(clippy::pedantic)]

//! Restoring points built from checksummed chunks, their health, and their
//! reconciliation with remote instances.

pub mod archive;
pub mod assembly;
pub mod config;
pub mod db;
pub mod dump;
pub mod events;
pub mod health;
pub mod journal;
pub mod model;
pub mod remote;
pub mod storage;
pub mod store;
pub mod sync;
pub mod util;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use archive::{ArchiveError, ArchiveService, SourceRoots, ZipArchiver};
pub use assembly::{AssemblyError, IncrementalStrategy, NoIncrement, PointAssembly};
pub use config::{AppConfig, InstanceConfig, SyncConfig, SystemConfig};
pub use model::{RestoringChunk, RestoringHealth, RestoringPoint};
pub use remote::{RemoteError, RemoteRegistry, RemoteService};
pub use store::{PointError, PointStore};
pub use sync::{InstanceOutcome, InstanceReport, Reconciler, SyncOptions};
