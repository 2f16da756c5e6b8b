//! # Skiff
//!
//! Session and transfer management core for a remote-shell client:
//! pooled SSH transports, pty sessions with ordered output, inline
//! binary transfers on the terminal stream, and a concurrent,
//! cancellable file transfer engine over SFTP.
//!
//! The embedder implements the collaborator traits (event sinks, path
//! dialogs, secret prompts) and drives everything through [`Client`].

pub mod client;

pub use client::Client;
pub use skiff_core::{
    ErrorKind, PathDialogs, SecretPrompt, SessionClosed, SessionOutput, SkiffError, SkiffResult,
    TerminalEvents, TransferDirection, TransferEvents, TransferProgress,
};
pub use skiff_sftp::sftp::{local_dir_size, RemoteEntry};
pub use skiff_ssh::ssh::{SessionInfo, SessionState, SshConnectionConfig, TerminalSize};
