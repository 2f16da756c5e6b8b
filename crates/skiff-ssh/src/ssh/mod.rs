//! # skiff-ssh — Transport pooling and pty session management
//!
//! Architecture:
//! - `types` — connection config, session lifecycle, terminal geometry
//! - `transport` — reference-counted cache of authenticated transports
//! - `session` — channel pump, per-stream read loops, close tail
//! - `inline` — inline binary-transfer decorator on the output stream
//! - `service` — high-level orchestrator (owns transports + sessions)
//!
//! One transport (an authenticated `ssh2::Session`) can host many pty
//! sessions; the transport is dialed on first use per identity and
//! disconnected when the last session referencing it goes away.

pub mod inline;
pub mod service;
pub mod session;
pub mod transport;
pub mod types;

pub use inline::{InlineTransferFilter, OutputFilter, Passthrough};
pub use service::{ClosingSession, SshService, SshServiceState};
pub use session::SessionLink;
pub use transport::{TransportManager, TransportRelease, TransportScope};
pub use types::{SessionInfo, SessionState, SshConnectionConfig, TerminalSize};
