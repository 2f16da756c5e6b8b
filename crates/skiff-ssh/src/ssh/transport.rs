//! Reference-counted cache of authenticated transports.
//!
//! One identity (username + host + port + credential digest) maps to at
//! most one live `ssh2::Session`; sessions opened against the same
//! identity share it. The map and the per-entry refcounts live behind a
//! single mutex so a transport can never be disconnected while another
//! caller is being handed a reference to it.
//!
//! Host identity verification is deliberately permissive: no host-key
//! pinning is performed, and connects succeed against previously unseen
//! hosts.

use crate::ssh::types::SshConnectionConfig;
use sha2::{Digest, Sha256};
use skiff_core::{SkiffError, SkiffResult};
use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// What a transport is used for. Interactive shells switch their
/// transport to non-blocking mode when the first shell starts, so file
/// access rides a sibling connection under the same identity instead of
/// fighting over the blocking flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportScope {
    Interactive,
    Files,
}

impl TransportScope {
    fn tag(self) -> &'static str {
        match self {
            TransportScope::Interactive => "shell",
            TransportScope::Files => "files",
        }
    }
}

/// Connection identity: who, where, and with which credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportKey {
    pub username: String,
    pub host: String,
    pub port: u16,
    digest: String,
}

impl TransportKey {
    /// Derive the identity from a config, rejecting credential-less
    /// configs before anything is dialed.
    pub fn from_config(config: &SshConnectionConfig) -> SkiffResult<Self> {
        if config.password.is_empty() && config.key_data.is_none() && config.key_path.is_none() {
            return Err(SkiffError::auth_failed("empty password and no key"));
        }
        let mut hasher = Sha256::new();
        hasher.update(config.password.as_bytes());
        hasher.update([0]);
        hasher.update(config.key_data.as_deref().unwrap_or("").as_bytes());
        hasher.update([0]);
        hasher.update(config.key_path.as_deref().unwrap_or("").as_bytes());
        Ok(Self {
            username: config.username.clone(),
            host: config.host.clone(),
            port: config.port,
            digest: hex::encode(hasher.finalize()),
        })
    }

    /// Human-readable identity for logs. Never includes credentials.
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Map key: label, credential digest and scope. The same endpoint
    /// reached with different credentials, or for a different purpose,
    /// gets its own transport.
    pub fn cache_key(&self, scope: TransportScope) -> String {
        format!("{}#{}#{}", self.label(), &self.digest[..16], scope.tag())
    }
}

/// A transport handed out by [`TransportManager::acquire`]. The session
/// is a shared handle onto the cached connection.
pub struct AcquiredTransport {
    pub session: ssh2::Session,
    pub key: String,
}

struct TransportEntry {
    session: ssh2::Session,
    refs: usize,
}

/// The cache itself. All mutation happens through `&mut self`, so the
/// owning mutex serialises refcount and map updates together.
pub struct TransportManager {
    entries: HashMap<String, TransportEntry>,
}

impl TransportManager {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Return a transport for the identity and scope, dialing only when
    /// none is cached. The refcount is incremented either way.
    pub fn acquire(
        &mut self,
        config: &SshConnectionConfig,
        passphrase: Option<&str>,
        scope: TransportScope,
    ) -> SkiffResult<AcquiredTransport> {
        let key = TransportKey::from_config(config)?;
        let cache_key = key.cache_key(scope);

        if let Some(entry) = self.entries.get_mut(&cache_key) {
            entry.refs += 1;
            log::debug!(
                "transport {} reused (refs {})",
                key.label(),
                entry.refs
            );
            return Ok(AcquiredTransport {
                session: entry.session.clone(),
                key: cache_key,
            });
        }

        let session = Self::establish(config, passphrase, config.connect_timeout_secs)?;
        log::info!("transport {} established", key.label());
        let handle = session.clone();
        self.entries.insert(
            cache_key.clone(),
            TransportEntry { session, refs: 1 },
        );
        Ok(AcquiredTransport {
            session: handle,
            key: cache_key,
        })
    }

    /// Drop one reference; the last one disconnects and evicts.
    pub fn release(&mut self, cache_key: &str) {
        let Some(entry) = self.entries.get_mut(cache_key) else {
            log::warn!("release for unknown transport {}", cache_key);
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = self.entries.remove(cache_key) {
                let _ = entry.session.disconnect(
                    Some(ssh2::DisconnectCode::ByApplication),
                    "client disconnect",
                    None,
                );
            }
            log::info!("transport {} disconnected", cache_key);
        } else {
            log::debug!("transport {} released (refs {})", cache_key, entry.refs);
        }
    }

    /// Dial and authenticate without touching the cache, then disconnect
    /// right away. Uses the shorter test timeout.
    pub fn test_connect(config: &SshConnectionConfig) -> SkiffResult<()> {
        TransportKey::from_config(config)?;
        let session = Self::establish(
            config,
            config.passphrase.as_deref(),
            config.test_timeout_secs,
        )?;
        let _ = session.disconnect(
            Some(ssh2::DisconnectCode::ByApplication),
            "connectivity test",
            None,
        );
        Ok(())
    }

    fn establish(
        config: &SshConnectionConfig,
        passphrase: Option<&str>,
        timeout_secs: u64,
    ) -> SkiffResult<ssh2::Session> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| {
                SkiffError::connection_failed(format!(
                    "failed to resolve {}:{}: {}",
                    config.host, config.port, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                SkiffError::connection_failed(format!(
                    "no address for {}:{}",
                    config.host, config.port
                ))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, Duration::from_secs(timeout_secs))
            .map_err(|e| {
                SkiffError::connection_failed(format!("failed to connect to {}: {}", addr, e))
            })?;

        let mut session = ssh2::Session::new()
            .map_err(|e| SkiffError::handshake_failed(format!("session init failed: {}", e)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| SkiffError::handshake_failed(format!("ssh handshake failed: {}", e)))?;

        Self::authenticate(&session, config, passphrase)?;
        Ok(session)
    }

    fn authenticate(
        session: &ssh2::Session,
        config: &SshConnectionConfig,
        passphrase: Option<&str>,
    ) -> SkiffResult<()> {
        let passphrase = passphrase.or(config.passphrase.as_deref());

        if !config.password.is_empty() {
            session
                .userauth_password(&config.username, &config.password)
                .map_err(|e| {
                    SkiffError::auth_failed(format!("password authentication failed: {}", e))
                })?;
        } else if let Some(key) = &config.key_data {
            session
                .userauth_pubkey_memory(&config.username, None, key, passphrase)
                .map_err(|e| SkiffError::auth_failed(format!("key authentication failed: {}", e)))?;
        } else if let Some(path) = &config.key_path {
            let path = expand_home(path);
            session
                .userauth_pubkey_file(&config.username, None, &path, passphrase)
                .map_err(|e| {
                    SkiffError::auth_failed(format!(
                        "key authentication with {} failed: {}",
                        path.display(),
                        e
                    ))
                })?;
        }

        if !session.authenticated() {
            return Err(SkiffError::auth_failed("server rejected authentication"));
        }
        Ok(())
    }
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new()
    }
}

// Test support: entries seeded without dialing, so refcount behaviour
// is checkable offline.
#[cfg(test)]
impl TransportManager {
    pub(crate) fn seed_entry(&mut self, cache_key: &str) {
        self.entries.insert(
            cache_key.to_string(),
            TransportEntry {
                session: ssh2::Session::new().unwrap(),
                refs: 1,
            },
        );
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn refs_of(&self, cache_key: &str) -> Option<usize> {
        self.entries.get(cache_key).map(|e| e.refs)
    }
}

/// Expand a leading `~` against the home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Deferred release of one transport reference. Moved into whatever
/// finishes a session so the refcount drops exactly once per session.
pub struct TransportRelease {
    transports: Arc<Mutex<TransportManager>>,
    key: String,
}

impl TransportRelease {
    pub fn new(transports: Arc<Mutex<TransportManager>>, key: String) -> Self {
        Self { transports, key }
    }

    pub async fn release(self) {
        self.transports.lock().await.release(&self.key);
    }
}
