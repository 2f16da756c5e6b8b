//! # Skiff – SFTP
//!
//! Remote filesystem operations and concurrent, cancellable file
//! transfers with live progress reporting.

pub mod sftp;
