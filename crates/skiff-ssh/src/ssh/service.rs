//! # Skiff – SSH Service
//!
//! High-level session orchestrator. Owns the session registry and the
//! shared transport cache, and wires each started shell to the event
//! sink and dialog collaborators handed in at construction.
//!
//! Closing runs in two halves so an embedder can slot its own work in
//! between: [`SshService::begin_close`] unregisters the session (input
//! stops routing immediately), and [`ClosingSession::finish`] tears the
//! shell down and returns the transport reference. Callers without
//! anything to interleave use [`SshService::close_session`].

use crate::ssh::session::{open_channel, spawn_shell, ShellParams, ShellRuntime};
use crate::ssh::transport::{TransportManager, TransportRelease, TransportScope};
use crate::ssh::types::{SessionInfo, SessionState, SshConnectionConfig, TerminalSize};
use chrono::{DateTime, Utc};
use skiff_core::{
    request_secret_timed, ErrorKind, PathDialogs, SecretPrompt, SkiffError, SkiffResult,
    TerminalEvents,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SshServiceState = Arc<Mutex<SshService>>;

struct SessionEntry {
    config: SshConnectionConfig,
    transport: ssh2::Session,
    opened_at: DateTime<Utc>,
    shell: Option<ShellRuntime>,
    /// Held while no shell runs; once the shell starts, the watcher
    /// owns the reference instead.
    release: Option<TransportRelease>,
}

impl SessionEntry {
    fn state(&self) -> SessionState {
        match &self.shell {
            None => SessionState::Created,
            Some(shell) if shell.is_closed() => SessionState::Closed,
            Some(_) => SessionState::Started,
        }
    }

    fn info(&self, id: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            state: self.state(),
            opened_at: self.opened_at,
        }
    }
}

/// A session pulled out of the registry, ready to be torn down.
pub struct ClosingSession {
    session_id: String,
    shell: Option<ShellRuntime>,
    release: Option<TransportRelease>,
}

impl ClosingSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Close the remote shell (if one started) and wait for the close
    /// tail to run, or give the transport reference back directly for
    /// sessions that never started one.
    pub async fn finish(self) {
        if let Some(shell) = self.shell {
            shell.shutdown().await;
        }
        if let Some(release) = self.release {
            release.release().await;
        }
        log::debug!("session {} teardown finished", self.session_id);
    }
}

pub struct SshService {
    sessions: HashMap<String, SessionEntry>,
    transports: Arc<Mutex<TransportManager>>,
    events: Arc<dyn TerminalEvents>,
    dialogs: Arc<dyn PathDialogs>,
    secrets: Arc<dyn SecretPrompt>,
}

impl SshService {
    // ─── Construction ────────────────────────────────────────────

    pub fn new(
        transports: Arc<Mutex<TransportManager>>,
        events: Arc<dyn TerminalEvents>,
        dialogs: Arc<dyn PathDialogs>,
        secrets: Arc<dyn SecretPrompt>,
    ) -> SshServiceState {
        Arc::new(Mutex::new(Self {
            sessions: HashMap::new(),
            transports,
            events,
            dialogs,
            secrets,
        }))
    }

    // ─── Connection lifecycle ────────────────────────────────────

    /// Open (or join) a transport for the config and register a new
    /// session against it. The shell is not started yet.
    ///
    /// A key that turns out to need a passphrase triggers one prompt
    /// through the secret collaborator before giving up.
    pub async fn connect(&mut self, mut config: SshConnectionConfig) -> SkiffResult<String> {
        let first = self
            .transports
            .lock()
            .await
            .acquire(&config, None, TransportScope::Interactive);
        let acquired = match first {
            Ok(acquired) => acquired,
            Err(e) if e.kind == ErrorKind::AuthFailed && key_may_need_passphrase(&config) => {
                let prompt = format!("passphrase for {}@{}", config.username, config.host);
                match request_secret_timed(self.secrets.as_ref(), &prompt).await? {
                    Some(passphrase) => {
                        let acquired = self.transports.lock().await.acquire(
                            &config,
                            Some(&passphrase),
                            TransportScope::Interactive,
                        )?;
                        // Remember it so sibling channels for this
                        // session authenticate without a second prompt.
                        config.passphrase = Some(passphrase);
                        acquired
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let session_id = skiff_core::ids::session_id();
        let release = TransportRelease::new(self.transports.clone(), acquired.key.clone());
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                config,
                transport: acquired.session,
                opened_at: Utc::now(),
                shell: None,
                release: Some(release),
            },
        );
        log::info!("session {} connected", session_id);
        Ok(session_id)
    }

    /// Dial and authenticate with the shorter test timeout, bypassing
    /// the cache, then disconnect. Nothing is registered.
    pub async fn test_connection(&self, config: &SshConnectionConfig) -> SkiffResult<()> {
        TransportManager::test_connect(config)
    }

    /// Start the remote shell for a connected session. Allowed once.
    pub async fn open_shell(&mut self, session_id: &str, size: TerminalSize) -> SkiffResult<()> {
        let events = self.events.clone();
        let dialogs = self.dialogs.clone();
        let entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SkiffError::session_not_found(session_id))?;
        if entry.shell.is_some() {
            return Err(
                SkiffError::session_failed("shell already started").with_session(session_id)
            );
        }

        let params = ShellParams {
            session_id: session_id.to_string(),
            size,
            term: entry.config.term.clone(),
            inline_transfers: entry.config.inline_transfers,
        };
        let channel = open_channel(&entry.transport, &params)?;
        let Some(release) = entry.release.take() else {
            return Err(
                SkiffError::session_failed("transport reference missing").with_session(session_id)
            );
        };
        entry.shell = Some(spawn_shell(channel, params, events, dialogs, release));
        Ok(())
    }

    /// Pull a session out of the registry. Input stops routing to it as
    /// soon as this returns; the caller finishes the teardown through
    /// the returned handle. `None` when the id is unknown (e.g. a
    /// repeated close).
    pub fn begin_close(&mut self, session_id: &str) -> Option<ClosingSession> {
        let entry = self.sessions.remove(session_id)?;
        log::info!("session {} closing", session_id);
        Some(ClosingSession {
            session_id: session_id.to_string(),
            shell: entry.shell,
            release: entry.release,
        })
    }

    /// Close a session end to end. Repeated closes are no-ops.
    pub async fn close_session(&mut self, session_id: &str) {
        match self.begin_close(session_id) {
            Some(closing) => closing.finish().await,
            None => log::debug!("close of unknown session {} ignored", session_id),
        }
    }

    pub async fn close_all(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            if let Some(closing) = self.begin_close(&id) {
                closing.finish().await;
            }
        }
    }

    // ─── Shell operations ────────────────────────────────────────

    /// Relays input to the session's running shell. Bytes that match no
    /// running shell (unknown id, shell not started, already closed)
    /// are dropped with a debug log; keystrokes routinely race a close.
    pub fn write_input(&self, session_id: &str, data: Vec<u8>) {
        match self.sessions.get(session_id) {
            Some(entry) => match &entry.shell {
                Some(shell) if !shell.is_closed() => {
                    if let Err(e) = shell.send_input(data) {
                        log::debug!("input for session {} dropped: {}", session_id, e);
                    }
                }
                _ => log::debug!(
                    "input for session {} dropped (no running shell)",
                    session_id
                ),
            },
            None => log::debug!("input for unknown session {} dropped", session_id),
        }
    }

    pub fn resize(&self, session_id: &str, size: TerminalSize) -> SkiffResult<()> {
        match &self.entry(session_id)?.shell {
            Some(shell) if !shell.is_closed() => shell.resize(size),
            _ => Err(SkiffError::no_active_session(session_id)),
        }
    }

    // ─── Introspection ───────────────────────────────────────────

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|(id, entry)| entry.info(id))
            .collect()
    }

    pub fn session_info(&self, session_id: &str) -> SkiffResult<SessionInfo> {
        Ok(self.entry(session_id)?.info(session_id))
    }

    /// The config a session was connected with. Sibling services use
    /// this to join the same transport identity.
    pub fn session_config(&self, session_id: &str) -> SkiffResult<SshConnectionConfig> {
        Ok(self.entry(session_id)?.config.clone())
    }

    fn entry(&self, session_id: &str) -> SkiffResult<&SessionEntry> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| SkiffError::session_not_found(session_id))
    }
}

fn key_may_need_passphrase(config: &SshConnectionConfig) -> bool {
    config.password.is_empty()
        && (config.key_data.is_some() || config.key_path.is_some())
        && config.passphrase.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::session::ShellCommand;
    use async_trait::async_trait;
    use skiff_core::{SessionClosed, SessionOutput};
    use std::path::PathBuf;

    struct NullEvents;
    impl TerminalEvents for NullEvents {
        fn output(&self, _event: SessionOutput) {}
        fn closed(&self, _event: SessionClosed) {}
    }

    struct NullDialogs;
    #[async_trait]
    impl PathDialogs for NullDialogs {
        async fn pick_file(&self) -> SkiffResult<Option<PathBuf>> {
            Ok(None)
        }
        async fn pick_directory(&self) -> SkiffResult<Option<PathBuf>> {
            Ok(None)
        }
        async fn pick_save(&self, _suggested: &str) -> SkiffResult<Option<PathBuf>> {
            Ok(None)
        }
    }

    struct NullSecrets;
    #[async_trait]
    impl SecretPrompt for NullSecrets {
        async fn request_secret(&self, _prompt: &str) -> SkiffResult<Option<String>> {
            Ok(None)
        }
    }

    fn service(transports: Arc<Mutex<TransportManager>>) -> SshService {
        SshService {
            sessions: HashMap::new(),
            transports,
            events: Arc::new(NullEvents),
            dialogs: Arc::new(NullDialogs),
            secrets: Arc::new(NullSecrets),
        }
    }

    fn entry_for(transports: &Arc<Mutex<TransportManager>>, key: &str) -> SessionEntry {
        SessionEntry {
            config: SshConnectionConfig::new("host.example", "deploy").with_password("pw"),
            transport: ssh2::Session::new().unwrap(),
            opened_at: Utc::now(),
            shell: None,
            release: Some(TransportRelease::new(transports.clone(), key.to_string())),
        }
    }

    // ── Guards ───────────────────────────────────────────────────

    #[tokio::test]
    async fn operations_on_unknown_sessions_fail() {
        let svc = service(Arc::new(Mutex::new(TransportManager::new())));
        let err = svc.resize("nope", TerminalSize::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionNotFound);
        let err = svc.session_info("nope").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionNotFound);
        // Input to an unknown session is dropped, not an error.
        svc.write_input("nope", b"x".to_vec());
    }

    #[tokio::test]
    async fn resize_before_shell_start_reports_no_active_session() {
        let transports = Arc::new(Mutex::new(TransportManager::new()));
        let mut svc = service(transports.clone());
        svc.sessions
            .insert("s1".into(), entry_for(&transports, "k1"));

        svc.write_input("s1", b"ls\n".to_vec());
        let err = svc
            .resize("s1", TerminalSize { cols: 100, rows: 30 })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoActiveSession);
    }

    #[tokio::test]
    async fn closed_shells_take_no_input_and_refuse_resize() {
        let transports = Arc::new(Mutex::new(TransportManager::new()));
        let mut svc = service(transports.clone());
        let mut entry = entry_for(&transports, "k1");
        let (runtime, mut rx) = ShellRuntime::test_stub("s1", true);
        entry.shell = Some(runtime);
        entry.release = None;
        svc.sessions.insert("s1".into(), entry);

        svc.write_input("s1", b"x".to_vec());
        assert!(rx.try_recv().is_err(), "nothing reaches a closed shell");
        let err = svc.resize("s1", TerminalSize::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoActiveSession);
    }

    #[tokio::test]
    async fn second_shell_start_is_rejected() {
        let transports = Arc::new(Mutex::new(TransportManager::new()));
        let mut svc = service(transports.clone());
        let mut entry = entry_for(&transports, "k1");
        let (runtime, _rx) = ShellRuntime::test_stub("s1", false);
        entry.shell = Some(runtime);
        svc.sessions.insert("s1".into(), entry);

        let err = svc
            .open_shell("s1", TerminalSize::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionFailed);
        assert!(err.message.contains("already started"));
    }

    // ── Routing ──────────────────────────────────────────────────

    #[tokio::test]
    async fn input_routes_to_the_running_shell() {
        let transports = Arc::new(Mutex::new(TransportManager::new()));
        let mut svc = service(transports.clone());
        let mut entry = entry_for(&transports, "k1");
        let (runtime, mut rx) = ShellRuntime::test_stub("s1", false);
        entry.shell = Some(runtime);
        svc.sessions.insert("s1".into(), entry);

        svc.write_input("s1", b"ls\n".to_vec());
        match rx.try_recv() {
            Ok(ShellCommand::Input(data)) => assert_eq!(data, b"ls\n".to_vec()),
            _ => panic!("expected queued input"),
        }

        svc.resize("s1", TerminalSize { cols: 132, rows: 43 }).unwrap();
        match rx.try_recv() {
            Ok(ShellCommand::Resize(size)) => {
                assert_eq!((size.cols, size.rows), (132, 43));
            }
            _ => panic!("expected queued resize"),
        }
    }

    // ── Closing ──────────────────────────────────────────────────

    #[tokio::test]
    async fn begin_close_unregisters_immediately() {
        let transports = Arc::new(Mutex::new(TransportManager::new()));
        transports.lock().await.seed_entry("k1");
        let mut svc = service(transports.clone());
        let mut entry = entry_for(&transports, "k1");
        let (runtime, mut rx) = ShellRuntime::test_stub("s1", false);
        entry.shell = Some(runtime);
        svc.sessions.insert("s1".into(), entry);

        let closing = svc.begin_close("s1").expect("first close wins");
        assert_eq!(closing.session_id(), "s1");
        svc.write_input("s1", b"x".to_vec());
        assert!(
            rx.try_recv().is_err(),
            "input stops routing before teardown finishes"
        );
        assert!(svc.begin_close("s1").is_none(), "second close finds nothing");

        closing.finish().await;
        assert_eq!(transports.lock().await.entry_count(), 0);
    }

    #[tokio::test]
    async fn close_session_is_idempotent() {
        let transports = Arc::new(Mutex::new(TransportManager::new()));
        transports.lock().await.seed_entry("k1");
        let mut svc = service(transports.clone());
        svc.sessions
            .insert("s1".into(), entry_for(&transports, "k1"));

        svc.close_session("s1").await;
        assert_eq!(transports.lock().await.entry_count(), 0);
        svc.close_session("s1").await;
    }

    #[tokio::test]
    async fn close_all_drains_every_session() {
        let transports = Arc::new(Mutex::new(TransportManager::new()));
        transports.lock().await.seed_entry("k1");
        transports.lock().await.seed_entry("k2");
        let mut svc = service(transports.clone());
        svc.sessions
            .insert("a".into(), entry_for(&transports, "k1"));
        svc.sessions
            .insert("b".into(), entry_for(&transports, "k2"));

        svc.close_all().await;
        assert!(svc.sessions.is_empty());
        assert_eq!(transports.lock().await.entry_count(), 0);
    }

    // ── Introspection ────────────────────────────────────────────

    #[tokio::test]
    async fn session_info_reports_lifecycle_state() {
        let transports = Arc::new(Mutex::new(TransportManager::new()));
        let mut svc = service(transports.clone());
        svc.sessions
            .insert("fresh".into(), entry_for(&transports, "k1"));
        let mut done = entry_for(&transports, "k2");
        let (runtime, _rx) = ShellRuntime::test_stub("done", true);
        done.shell = Some(runtime);
        done.release = None;
        svc.sessions.insert("done".into(), done);

        let info = svc.session_info("fresh").unwrap();
        assert_eq!(info.state, SessionState::Created);
        assert_eq!(info.host, "host.example");
        assert_eq!(info.username, "deploy");

        let info = svc.session_info("done").unwrap();
        assert_eq!(info.state, SessionState::Closed);

        assert_eq!(svc.list_sessions().len(), 2);
    }

    #[tokio::test]
    async fn session_config_round_trips() {
        let transports = Arc::new(Mutex::new(TransportManager::new()));
        let mut svc = service(transports.clone());
        svc.sessions
            .insert("s1".into(), entry_for(&transports, "k1"));

        let config = svc.session_config("s1").unwrap();
        assert_eq!(config.host, "host.example");
        assert_eq!(config.password, "pw");
    }
}
