//! The embedder-facing client.
//!
//! One [`Client`] owns both services around a shared transport pool
//! and runs every cross-service sequence (connect, close, shutdown) in
//! the right order. Methods return `Result<_, String>` so bridge
//! layers can hand messages straight to the surface above them.

use log::warn;
use skiff_core::{PathDialogs, SecretPrompt, TerminalEvents, TransferEvents};
use skiff_sftp::sftp::{RemoteEntry, SftpService, SftpServiceState};
use skiff_ssh::ssh::{
    SessionInfo, SshConnectionConfig, SshService, SshServiceState, TerminalSize, TransportManager,
};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Client {
    ssh: SshServiceState,
    sftp: SftpServiceState,
}

impl Client {
    /// Wires both services around one shared transport pool, so a
    /// session's shell and its file-access channel are siblings in the
    /// same refcounted cache.
    pub fn new(
        terminal: Arc<dyn TerminalEvents>,
        transfers: Arc<dyn TransferEvents>,
        dialogs: Arc<dyn PathDialogs>,
        secrets: Arc<dyn SecretPrompt>,
    ) -> Self {
        let transports = Arc::new(Mutex::new(TransportManager::new()));
        Self {
            ssh: SshService::new(transports.clone(), terminal, dialogs.clone(), secrets),
            sftp: SftpService::new(transports, transfers, dialogs),
        }
    }

    // ─── Connection lifecycle ────────────────────────────────────

    /// Connects and opens the session's file-access channel. A session
    /// that cannot get its SFTP channel is rolled back, so a
    /// successful connect always has both sides.
    pub async fn connect(&self, config: SshConnectionConfig) -> Result<String, String> {
        let session_id = self.ssh.lock().await.connect(config).await?;
        // The stored config may carry a passphrase collected during
        // connect; the sibling channel reuses it.
        let stored = self.ssh.lock().await.session_config(&session_id)?;
        if let Err(e) = self.sftp.lock().await.open(&session_id, &stored).await {
            warn!(
                "sftp channel for session {} failed: {}",
                session_id, e.message
            );
            self.close_session(&session_id).await;
            return Err(e.into());
        }
        Ok(session_id)
    }

    /// Probes connectivity with the short test timeout. Nothing is
    /// registered either way.
    pub async fn test_connection(&self, config: &SshConnectionConfig) -> Result<bool, String> {
        Ok(self.ssh.lock().await.test_connection(config).await.is_ok())
    }

    /// Starts the remote shell for a connected session. Allowed once
    /// per session.
    pub async fn open_shell(&self, session_id: &str, size: TerminalSize) -> Result<(), String> {
        Ok(self.ssh.lock().await.open_shell(session_id, size).await?)
    }

    /// Tears a session down across both services: the shell side first
    /// leaves the registry (no more input relay), then the SFTP
    /// channel goes with its transfers cancelled, then the shell and
    /// its transport lease wind down. Unknown ids and repeated closes
    /// are no-ops.
    pub async fn close_session(&self, session_id: &str) {
        let closing = self.ssh.lock().await.begin_close(session_id);
        self.sftp.lock().await.close(session_id).await;
        if let Some(closing) = closing {
            closing.finish().await;
        }
    }

    /// Closes every session and its transfers. Used at shutdown.
    pub async fn shutdown(&self) {
        self.sftp.lock().await.close_all().await;
        self.ssh.lock().await.close_all().await;
    }

    // ─── Terminal I/O ────────────────────────────────────────────

    /// Relays terminal keystrokes. Bytes addressed to a session with
    /// no running shell behind it are dropped quietly.
    pub async fn write_input(&self, session_id: &str, data: Vec<u8>) {
        self.ssh.lock().await.write_input(session_id, data)
    }

    pub async fn resize(&self, session_id: &str, size: TerminalSize) -> Result<(), String> {
        Ok(self.ssh.lock().await.resize(session_id, size)?)
    }

    // ─── Session queries ─────────────────────────────────────────

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.ssh.lock().await.list_sessions()
    }

    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo, String> {
        Ok(self.ssh.lock().await.session_info(session_id)?)
    }

    // ─── Remote files ────────────────────────────────────────────

    pub async fn list_dir(
        &self,
        session_id: &str,
        path: &str,
        show_hidden: bool,
    ) -> Result<Vec<RemoteEntry>, String> {
        Ok(self
            .sftp
            .lock()
            .await
            .list_dir(session_id, path, show_hidden)
            .await?)
    }

    pub async fn stat(&self, session_id: &str, path: &str) -> Result<RemoteEntry, String> {
        Ok(self.sftp.lock().await.stat(session_id, path).await?)
    }

    pub async fn getwd(&self, session_id: &str) -> Result<String, String> {
        Ok(self.sftp.lock().await.getwd(session_id).await?)
    }

    pub async fn create_file(&self, session_id: &str, path: &str) -> Result<(), String> {
        Ok(self.sftp.lock().await.create_file(session_id, path).await?)
    }

    pub async fn create_dir(&self, session_id: &str, path: &str) -> Result<(), String> {
        Ok(self.sftp.lock().await.create_dir(session_id, path).await?)
    }

    pub async fn rename(&self, session_id: &str, from: &str, to: &str) -> Result<(), String> {
        Ok(self.sftp.lock().await.rename(session_id, from, to).await?)
    }

    pub async fn delete(&self, session_id: &str, path: &str) -> Result<(), String> {
        Ok(self.sftp.lock().await.delete(session_id, path).await?)
    }

    pub async fn dir_size(&self, session_id: &str, path: &str) -> Result<u64, String> {
        Ok(self.sftp.lock().await.dir_size(session_id, path).await?)
    }

    // ─── Transfers ───────────────────────────────────────────────

    /// Starts an upload task; `None` when the file picker was
    /// dismissed and nothing happened.
    pub async fn upload_file(
        &self,
        session_id: &str,
        local_path: Option<String>,
        remote_dir: &str,
    ) -> Result<Option<String>, String> {
        Ok(self
            .sftp
            .lock()
            .await
            .upload_file(session_id, local_path, remote_dir)
            .await?)
    }

    /// Starts a download task; `None` when the save dialog was
    /// dismissed and nothing happened.
    pub async fn download_file(
        &self,
        session_id: &str,
        remote_path: &str,
        local_path: Option<String>,
    ) -> Result<Option<String>, String> {
        Ok(self
            .sftp
            .lock()
            .await
            .download_file(session_id, remote_path, local_path)
            .await?)
    }

    pub async fn upload_directory(
        &self,
        session_id: &str,
        local_path: Option<String>,
        remote_dir: &str,
    ) -> Result<Option<String>, String> {
        Ok(self
            .sftp
            .lock()
            .await
            .upload_directory(session_id, local_path, remote_dir)
            .await?)
    }

    pub async fn download_directory(
        &self,
        session_id: &str,
        remote_path: &str,
        local_dir: Option<String>,
    ) -> Result<Option<String>, String> {
        Ok(self
            .sftp
            .lock()
            .await
            .download_directory(session_id, remote_path, local_dir)
            .await?)
    }

    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<(), String> {
        Ok(self.sftp.lock().await.cancel_transfer(transfer_id)?)
    }

    pub async fn active_transfers(&self) -> Vec<String> {
        self.sftp.lock().await.active_transfers()
    }
}
