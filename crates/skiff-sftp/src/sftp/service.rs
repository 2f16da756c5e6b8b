//! Per-session SFTP channels and the task registry they share.

use crate::sftp::fs::{RemoteFs, Ssh2RemoteFs};
use crate::sftp::transfer::TaskHandle;
use log::info;
use skiff_core::{PathDialogs, SkiffError, SkiffResult, TransferEvents};
use skiff_ssh::ssh::{SshConnectionConfig, TransportManager, TransportRelease, TransportScope};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

pub type SftpServiceState = Arc<Mutex<SftpService>>;

/// One session's file-access channel: the remote filesystem handle plus
/// the pooled-transport lease backing it.
pub(crate) struct SftpChannel {
    pub(crate) fs: Arc<dyn RemoteFs>,
    pub(crate) release: Option<TransportRelease>,
}

/// Remote file access for every open session, plus the transfer task
/// registry. Shares the transport pool with the shell service, so an
/// SFTP channel rides a sibling transport of the session's shell.
pub struct SftpService {
    pub(crate) channels: HashMap<String, SftpChannel>,
    pub(crate) transports: Arc<Mutex<TransportManager>>,
    pub(crate) events: Arc<dyn TransferEvents>,
    pub(crate) dialogs: Arc<dyn PathDialogs>,
    pub(crate) tasks: Arc<StdMutex<HashMap<String, TaskHandle>>>,
}

impl SftpService {
    pub fn new(
        transports: Arc<Mutex<TransportManager>>,
        events: Arc<dyn TransferEvents>,
        dialogs: Arc<dyn PathDialogs>,
    ) -> SftpServiceState {
        Arc::new(Mutex::new(Self {
            channels: HashMap::new(),
            transports,
            events,
            dialogs,
            tasks: Arc::new(StdMutex::new(HashMap::new())),
        }))
    }

    /// Opens the file-access channel for a session. A second open for
    /// the same session is a no-op, keeping the transport refcount at
    /// one lease per channel.
    pub async fn open(&mut self, session_id: &str, config: &SshConnectionConfig) -> SkiffResult<()> {
        if self.channels.contains_key(session_id) {
            return Ok(());
        }

        let acquired =
            self.transports
                .lock()
                .await
                .acquire(config, None, TransportScope::Files)?;
        let release = TransportRelease::new(self.transports.clone(), acquired.key.clone());

        let sftp = match acquired.session.sftp() {
            Ok(sftp) => sftp,
            Err(e) => {
                release.release().await;
                return Err(
                    SkiffError::sftp_failed(format!("sftp subsystem failed: {}", e))
                        .with_session(session_id),
                );
            }
        };

        self.channels.insert(
            session_id.to_string(),
            SftpChannel {
                fs: Arc::new(Ssh2RemoteFs::new(sftp)),
                release: Some(release),
            },
        );
        info!("SFTP channel open for session {}", session_id);
        Ok(())
    }

    /// Drops a session's channel, cancelling its in-flight transfers
    /// and returning the transport lease. Unknown ids are a no-op.
    pub async fn close(&mut self, session_id: &str) {
        let Some(channel) = self.channels.remove(session_id) else {
            return;
        };
        self.cancel_session_tasks(session_id);
        if let Some(release) = channel.release {
            release.release().await;
        }
        info!("SFTP channel closed for session {}", session_id);
    }

    pub async fn close_all(&mut self) {
        let ids: Vec<String> = self.channels.keys().cloned().collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.channels.contains_key(session_id)
    }

    pub(crate) fn remote(&self, session_id: &str) -> SkiffResult<Arc<dyn RemoteFs>> {
        self.channels
            .get(session_id)
            .map(|channel| channel.fs.clone())
            .ok_or_else(|| SkiffError::session_not_found(session_id))
    }
}

// ─── Test fixtures ───────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::testing::{mem_service, PresetDialogs};
    use skiff_core::ErrorKind;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn close_cancels_the_sessions_tasks() {
        let (mut service, _fs, _events) = mem_service(PresetDialogs::new(None, None));
        let cancel = service.register_task("t1", "s1");
        let other = service.register_task("t2", "elsewhere");

        assert!(service.is_open("s1"));
        service.close("s1").await;

        assert!(!service.is_open("s1"));
        assert!(cancel.load(Ordering::SeqCst));
        assert!(!other.load(Ordering::SeqCst));

        // A second close of the same id is a no-op.
        service.close("s1").await;
    }

    #[tokio::test]
    async fn close_all_empties_the_channel_map() {
        let (mut service, _fs, _events) = mem_service(PresetDialogs::new(None, None));
        service.close_all().await;
        assert!(!service.is_open("s1"));
    }

    #[tokio::test]
    async fn unknown_sessions_are_rejected() {
        let (service, _fs, _events) = mem_service(PresetDialogs::new(None, None));
        let err = service.remote("ghost").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionNotFound);
        assert!(service.remote("s1").is_ok());
    }
}
