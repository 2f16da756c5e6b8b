//! # Skiff – Core
//!
//! Shared building blocks for the skiff service crates: the categorised
//! error type, strongly-typed notification payloads and sink traits,
//! collaborator traits for user-facing prompts, and id generation.

pub mod dialogs;
pub mod error;
pub mod events;
pub mod ids;

pub use dialogs::{request_secret_timed, PathDialogs, SecretPrompt, SECRET_PROMPT_TIMEOUT};
pub use error::{ErrorKind, SkiffError, SkiffResult};
pub use events::{
    SessionClosed, SessionOutput, TerminalEvents, TransferDirection, TransferEvents,
    TransferProgress,
};
