//! Backup sidecar library
//!
//! Periodically quiesces a live game server, snapshots its data volume into
//! a checksummed `tar.zst` artifact, rotates local and remote copies, pushes
//! them to Google Drive and reports through Discord and an HTTP probe.

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod gateway;
pub mod health;
pub mod notify;
pub mod record;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod upload;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use record::{BackupKind, BackupRecord, BackupStatus};
pub use scheduler::Scheduler;
