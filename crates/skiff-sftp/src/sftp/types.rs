//! Remote filesystem metadata types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata mirror of one remote filesystem entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    /// Full remote path of the entry.
    pub path: String,
    pub is_dir: bool,
    /// Byte size; zero for directories.
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// `drwxr-xr-x`-style mode string.
    pub permissions: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_uses_camel_case_keys() {
        let entry = RemoteEntry {
            name: "notes.txt".into(),
            path: "/home/deploy/notes.txt".into(),
            is_dir: false,
            size: 42,
            modified: None,
            permissions: "-rw-r--r--".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"isDir\":false"));
        assert!(json.contains("\"permissions\""));
    }

    #[test]
    fn entry_round_trip() {
        let entry = RemoteEntry {
            name: "srv".into(),
            path: "/srv".into(),
            is_dir: true,
            size: 0,
            modified: Some(Utc::now()),
            permissions: "drwxr-xr-x".into(),
        };
        let back: RemoteEntry =
            serde_json::from_str(&serde_json::to_string(&entry).unwrap()).unwrap();
        assert_eq!(back, entry);
    }
}
