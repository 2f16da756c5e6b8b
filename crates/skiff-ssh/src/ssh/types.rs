//! Connection and session data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_test_timeout() -> u64 {
    10
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_true() -> bool {
    true
}

/// Everything needed to reach and authenticate against one host.
///
/// Credentials: a non-empty `password`, inline `key_data` (PEM text), or
/// a `key_path`. At least one must be present or connecting fails before
/// any dialing happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    /// Password authentication. Empty means "not provided".
    #[serde(default)]
    pub password: String,
    /// Private key material (PEM text). Takes precedence over `key_path`.
    #[serde(default)]
    pub key_data: Option<String>,
    /// Path to a private key file; a leading `~` is expanded.
    #[serde(default)]
    pub key_path: Option<String>,
    /// Key passphrase when known up front; otherwise requested on demand
    /// through the secret-prompt collaborator.
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Shorter bound used by connectivity tests.
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_term")]
    pub term: String,
    /// Scan the output stream for inline binary transfers.
    #[serde(default = "default_true")]
    pub inline_transfers: bool,
}

impl SshConnectionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: String::new(),
            key_data: None,
            key_path: None,
            passphrase: None,
            connect_timeout_secs: default_connect_timeout(),
            test_timeout_secs: default_test_timeout(),
            term: default_term(),
            inline_transfers: default_true(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_key_data(mut self, key: impl Into<String>) -> Self {
        self.key_data = Some(key.into());
        self
    }
}

/// Session lifecycle. `Started` is entered at most once; `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Started,
    Closed,
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Embedder-facing session summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
}
