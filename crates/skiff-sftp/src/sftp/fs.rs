//! The remote file-access contract and its ssh2 backend.
//!
//! Everything the transfer engine and the filesystem operations need
//! from the remote side goes through [`RemoteFs`], so the engine can be
//! exercised against an in-memory double without a live server. The
//! trait is synchronous: callers that must not block the runtime run it
//! under `spawn_blocking`.

use crate::sftp::types::RemoteEntry;
use chrono::{TimeZone, Utc};
use skiff_core::{SkiffError, SkiffResult};
use std::io::{Read, Write};
use std::path::Path;

/// File-oriented access to one remote host, bound to one session.
pub trait RemoteFs: Send + Sync {
    /// All entries of a directory, unfiltered and unsorted.
    fn list_dir(&self, path: &str) -> SkiffResult<Vec<RemoteEntry>>;
    fn stat(&self, path: &str) -> SkiffResult<RemoteEntry>;
    /// Resolved path of the remote working directory.
    fn getwd(&self) -> SkiffResult<String>;
    fn exists(&self, path: &str) -> SkiffResult<bool>;
    /// Create an empty file. Fails if the path already exists.
    fn create_file(&self, path: &str) -> SkiffResult<()>;
    /// Create one directory. Fails if the path already exists.
    fn create_dir(&self, path: &str) -> SkiffResult<()>;
    /// Create a directory and any missing parents.
    fn create_dir_all(&self, path: &str) -> SkiffResult<()>;
    /// Rename without clobbering: fails if the target exists.
    fn rename(&self, from: &str, to: &str) -> SkiffResult<()>;
    fn remove_file(&self, path: &str) -> SkiffResult<()>;
    /// Remove one empty directory.
    fn remove_dir(&self, path: &str) -> SkiffResult<()>;
    fn open_read(&self, path: &str) -> SkiffResult<Box<dyn Read + Send>>;
    /// Create (or truncate) a file for writing.
    fn create_write(&self, path: &str) -> SkiffResult<Box<dyn Write + Send>>;
}

#[cfg(test)]
impl std::fmt::Debug for dyn RemoteFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn RemoteFs")
    }
}

// ─── ssh2 backend ────────────────────────────────────────────────────

/// [`RemoteFs`] over an ssh2 SFTP channel.
pub struct Ssh2RemoteFs {
    sftp: ssh2::Sftp,
}

impl Ssh2RemoteFs {
    pub fn new(sftp: ssh2::Sftp) -> Self {
        Self { sftp }
    }
}

impl RemoteFs for Ssh2RemoteFs {
    fn list_dir(&self, path: &str) -> SkiffResult<Vec<RemoteEntry>> {
        let raw = self
            .sftp
            .readdir(Path::new(path))
            .map_err(|e| sftp_err("list", path, e))?;
        Ok(raw
            .iter()
            .map(|(entry_path, stat)| entry_from_stat(entry_path, stat))
            .collect())
    }

    fn stat(&self, path: &str) -> SkiffResult<RemoteEntry> {
        let stat = self
            .sftp
            .stat(Path::new(path))
            .map_err(|e| sftp_err("stat", path, e))?;
        Ok(entry_from_stat(Path::new(path), &stat))
    }

    fn getwd(&self) -> SkiffResult<String> {
        let resolved = self
            .sftp
            .realpath(Path::new("."))
            .map_err(|e| sftp_err("realpath", ".", e))?;
        Ok(resolved.to_string_lossy().to_string())
    }

    fn exists(&self, path: &str) -> SkiffResult<bool> {
        match self.sftp.stat(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(sftp_err("stat", path, e)),
        }
    }

    fn create_file(&self, path: &str) -> SkiffResult<()> {
        self.sftp
            .open_mode(
                Path::new(path),
                ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::EXCLUSIVE,
                0o644,
                ssh2::OpenType::File,
            )
            .map(drop)
            .map_err(|e| sftp_err("create", path, e))
    }

    fn create_dir(&self, path: &str) -> SkiffResult<()> {
        if self.exists(path)? {
            return Err(SkiffError::sftp_failed(format!("'{}' already exists", path)));
        }
        self.sftp
            .mkdir(Path::new(path), 0o755)
            .map_err(|e| sftp_err("mkdir", path, e))
    }

    fn create_dir_all(&self, path: &str) -> SkiffResult<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(part);
            if self.sftp.stat(Path::new(&current)).is_ok() {
                continue;
            }
            self.sftp
                .mkdir(Path::new(&current), 0o755)
                .map_err(|e| sftp_err("mkdir", &current, e))?;
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> SkiffResult<()> {
        if self.exists(to)? {
            return Err(SkiffError::sftp_failed(format!("'{}' already exists", to)));
        }
        self.sftp
            .rename(Path::new(from), Path::new(to), None)
            .map_err(|e| sftp_err("rename", from, e))
    }

    fn remove_file(&self, path: &str) -> SkiffResult<()> {
        self.sftp
            .unlink(Path::new(path))
            .map_err(|e| sftp_err("remove", path, e))
    }

    fn remove_dir(&self, path: &str) -> SkiffResult<()> {
        self.sftp
            .rmdir(Path::new(path))
            .map_err(|e| sftp_err("rmdir", path, e))
    }

    fn open_read(&self, path: &str) -> SkiffResult<Box<dyn Read + Send>> {
        let file = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| sftp_err("open", path, e))?;
        Ok(Box::new(file))
    }

    fn create_write(&self, path: &str) -> SkiffResult<Box<dyn Write + Send>> {
        let file = self
            .sftp
            .open_mode(
                Path::new(path),
                ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::TRUNCATE,
                0o644,
                ssh2::OpenType::File,
            )
            .map_err(|e| sftp_err("create", path, e))?;
        Ok(Box::new(file))
    }
}

fn sftp_err(op: &str, path: &str, e: ssh2::Error) -> SkiffError {
    SkiffError::sftp_failed(format!("{} '{}' failed: {}", op, path, e))
}

// LIBSSH2_FX_NO_SUCH_FILE / LIBSSH2_FX_NO_SUCH_PATH
fn is_missing(e: &ssh2::Error) -> bool {
    matches!(e.code(), ssh2::ErrorCode::SFTP(2) | ssh2::ErrorCode::SFTP(10))
}

pub(crate) fn entry_from_stat(path: &Path, stat: &ssh2::FileStat) -> RemoteEntry {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());
    RemoteEntry {
        name,
        path: path.to_string_lossy().to_string(),
        is_dir: stat.is_dir(),
        size: stat.size.unwrap_or(0),
        modified: stat
            .mtime
            .and_then(|t| Utc.timestamp_opt(t as i64, 0).single()),
        permissions: format_mode(stat.perm.unwrap_or(0)),
    }
}

/// Render a mode word as the usual `ls -l` string.
pub(crate) fn format_mode(mode: u32) -> String {
    let kind = match mode & 0o170000 {
        0o040000 => 'd',
        0o120000 => 'l',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

// ─── In-memory double ────────────────────────────────────────────────
