//! # skiff-sftp — Remote file access and the transfer engine
//!
//! Architecture:
//! - `types` — remote filesystem entry metadata
//! - `fs` — the `RemoteFs` access trait and its ssh2 backend
//! - `file_ops` — per-session remote filesystem operations
//! - `transfer` — progress tracking and the upload/download engine
//! - `service` — per-session channel registry and the task registry
//!
//! Each interactive session gets its own file-access channel, opened on
//! a sibling transport under the same connection identity. Transfer
//! tasks run concurrently off the service lock; each owns its byte
//! counter and cancellation flag, and the shared task registry exists
//! only so cancellation can find them.

pub mod file_ops;
pub mod fs;
pub mod service;
pub mod transfer;
pub mod types;

pub use fs::{RemoteFs, Ssh2RemoteFs};
pub use service::{SftpService, SftpServiceState};
pub use transfer::local_dir_size;
pub use types::RemoteEntry;
