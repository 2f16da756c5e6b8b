//! Collaborator traits for user-facing prompts.
//!
//! The embedder implements these against its own dialog machinery. The
//! core never blocks indefinitely on a collaborator: secret requests are
//! bounded by [`SECRET_PROMPT_TIMEOUT`].

use crate::error::{SkiffError, SkiffResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// How long a secret request may wait for the user.
pub const SECRET_PROMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// File and directory selection.
///
/// `Ok(None)` means the user dismissed the dialog without choosing;
/// `Err` is reserved for presentation failures. Callers treat `None` as
/// a normal abort, never as an error.
#[async_trait]
pub trait PathDialogs: Send + Sync {
    async fn pick_file(&self) -> SkiffResult<Option<PathBuf>>;
    async fn pick_directory(&self) -> SkiffResult<Option<PathBuf>>;
    async fn pick_save(&self, suggested: &str) -> SkiffResult<Option<PathBuf>>;
}

/// On-demand secret input (key passphrases and the like).
///
/// `Ok(None)` means the user declined to supply one.
#[async_trait]
pub trait SecretPrompt: Send + Sync {
    async fn request_secret(&self, prompt: &str) -> SkiffResult<Option<String>>;
}

/// Ask for a secret, giving up after [`SECRET_PROMPT_TIMEOUT`].
pub async fn request_secret_timed(
    prompt: &dyn SecretPrompt,
    text: &str,
) -> SkiffResult<Option<String>> {
    match tokio::time::timeout(SECRET_PROMPT_TIMEOUT, prompt.request_secret(text)).await {
        Ok(result) => result,
        Err(_) => Err(SkiffError::timeout(format!(
            "secret prompt unanswered after {}s",
            SECRET_PROMPT_TIMEOUT.as_secs()
        ))),
    }
}
