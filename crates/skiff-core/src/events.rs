//! Strongly-typed notification payloads and the sinks that receive them.
//!
//! Every payload crossing the core boundary is a concrete serde struct;
//! sinks are object-safe traits registered explicitly (per session at
//! shell open, per service at construction) and dropped on close. There
//! is no string-keyed event bus anywhere in the core.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a file transfer, from the local machine's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "upload"),
            TransferDirection::Download => write!(f, "download"),
        }
    }
}

/// One chunk of session output.
///
/// `sequence` is strictly increasing per session while the shell runs;
/// consumers use it to detect gaps, not to interleave the primary and
/// diagnostic streams deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutput {
    pub session_id: String,
    pub sequence: u64,
    pub data: Vec<u8>,
}

/// Emitted exactly once when a session transitions to `Closed`, whatever
/// the path there (explicit close, remote EOF, startup failure after open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClosed {
    pub session_id: String,
}

/// Progress snapshot for one transfer task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub id: String,
    pub session_id: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub total_bytes: u64,
    /// Percentage in `[0, 100]`, rounded to two decimal places.
    pub rate: f64,
    pub done: bool,
    /// Empty on success; cancellation or failure text otherwise.
    #[serde(default)]
    pub error: String,
}

/// Receiver for one session's terminal events.
pub trait TerminalEvents: Send + Sync {
    fn output(&self, event: SessionOutput);
    fn closed(&self, event: SessionClosed);
}

/// Receiver for transfer progress notifications.
pub trait TransferEvents: Send + Sync {
    fn progress(&self, event: TransferProgress);
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Wire format ──────────────────────────────────────────────

    #[test]
    fn session_output_uses_camel_case_keys() {
        let event = SessionOutput {
            session_id: "s1".into(),
            sequence: 7,
            data: b"hello".to_vec(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"sequence\":7"));
    }

    #[test]
    fn direction_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&TransferDirection::Upload).unwrap(),
            "\"upload\""
        );
        assert_eq!(TransferDirection::Download.to_string(), "download");
    }

    #[test]
    fn progress_error_defaults_to_empty() {
        let json = r#"{
            "id": "t1", "sessionId": "s1", "direction": "download",
            "localPath": "/tmp/a", "remotePath": "/srv/a",
            "totalBytes": 10, "rate": 0.0, "done": false
        }"#;
        let p: TransferProgress = serde_json::from_str(json).unwrap();
        assert_eq!(p.error, "");
        assert_eq!(p.total_bytes, 10);
    }

    #[test]
    fn progress_round_trip() {
        let p = TransferProgress {
            id: "t2".into(),
            session_id: "s2".into(),
            direction: TransferDirection::Upload,
            local_path: "/home/u/a.txt".into(),
            remote_path: "/srv/a.txt".into(),
            total_bytes: 30,
            rate: 33.33,
            done: true,
            error: "transfer cancelled by user".into(),
        };
        let back: TransferProgress =
            serde_json::from_str(&serde_json::to_string(&p).unwrap()).unwrap();
        assert_eq!(back, p);
    }
}
