//! The concurrent, cancellable transfer engine.
//!
//! Totals are fixed before any byte moves: single-file tasks take the
//! source's size, directory tasks walk the tree first and sum it. Data
//! moves in 4 KiB chunks with a cancellation check in front of every
//! read. Progress goes to the [`TransferEvents`] sink as an immediate
//! zero snapshot, a 500 ms cadence while the copy runs, and exactly one
//! terminal snapshot with `done` set, whatever way the task ended.

use crate::sftp::fs::RemoteFs;
use crate::sftp::service::SftpService;
use crate::sftp::types::RemoteEntry;
use log::warn;
use skiff_core::{
    ids, SkiffError, SkiffResult, TransferDirection, TransferEvents, TransferProgress,
};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const COPY_CHUNK: usize = 4096;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

// ─── Progress arithmetic ─────────────────────────────────────────────

/// Completion percentage, rounded to two decimals and clamped to
/// `[0, 100]`. An empty transfer is complete from the start.
pub(crate) fn rate(transferred: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let pct = transferred as f64 * 100.0 / total as f64;
    (pct.clamp(0.0, 100.0) * 100.0).round() / 100.0
}

/// Chunked copy that honours the task's cancellation flag. The flag is
/// checked before every read, so at most one chunk moves after a
/// cancel. Counts bytes into `counter` as they are written.
pub(crate) fn copy_with_cancel(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    counter: &AtomicU64,
    cancel: &AtomicBool,
) -> SkiffResult<()> {
    let mut chunk = [0u8; COPY_CHUNK];
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(SkiffError::cancelled());
        }
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        writer.write_all(&chunk[..n])?;
        counter.fetch_add(n as u64, Ordering::SeqCst);
    }
    writer.flush()?;
    Ok(())
}

// ─── Task bookkeeping ────────────────────────────────────────────────

/// Everything about a task that never changes after creation.
#[derive(Clone)]
pub(crate) struct TaskDescriptor {
    pub(crate) id: String,
    pub(crate) session_id: String,
    pub(crate) direction: TransferDirection,
    pub(crate) local_path: String,
    pub(crate) remote_path: String,
    pub(crate) total_bytes: u64,
}

fn snapshot(
    desc: &TaskDescriptor,
    transferred: u64,
    done: bool,
    error: Option<String>,
) -> TransferProgress {
    TransferProgress {
        id: desc.id.clone(),
        session_id: desc.session_id.clone(),
        direction: desc.direction,
        local_path: desc.local_path.clone(),
        remote_path: desc.remote_path.clone(),
        total_bytes: desc.total_bytes,
        rate: rate(transferred, desc.total_bytes),
        done,
        error: error.unwrap_or_default(),
    }
}

/// Emits progress for one task: a zero snapshot up front, periodic
/// snapshots while the copy runs, and one terminal snapshot from
/// [`ProgressTracker::finish`].
pub(crate) struct ProgressTracker {
    desc: TaskDescriptor,
    counter: Arc<AtomicU64>,
    events: Arc<dyn TransferEvents>,
    ticker: tokio::task::JoinHandle<()>,
}

impl ProgressTracker {
    pub(crate) fn start(desc: TaskDescriptor, events: Arc<dyn TransferEvents>) -> Self {
        let counter = Arc::new(AtomicU64::new(0));
        events.progress(snapshot(&desc, 0, false, None));

        let ticker = {
            let desc = desc.clone();
            let counter = counter.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(PROGRESS_INTERVAL);
                // The first tick completes immediately; the initial
                // snapshot already covered that instant.
                tick.tick().await;
                loop {
                    tick.tick().await;
                    events.progress(snapshot(
                        &desc,
                        counter.load(Ordering::SeqCst),
                        false,
                        None,
                    ));
                }
            })
        };

        Self {
            desc,
            counter,
            events,
            ticker,
        }
    }

    pub(crate) fn counter(&self) -> Arc<AtomicU64> {
        self.counter.clone()
    }

    /// Emits the terminal snapshot. The ticker is stopped and awaited
    /// first, so no periodic event can land after the terminal one.
    pub(crate) async fn finish(self, error: Option<String>) {
        let Self {
            desc,
            counter,
            events,
            ticker,
        } = self;
        ticker.abort();
        let _ = ticker.await;
        events.progress(snapshot(
            &desc,
            counter.load(Ordering::SeqCst),
            true,
            error,
        ));
    }
}

/// Registry entry for a live task.
pub(crate) struct TaskHandle {
    pub(crate) session_id: String,
    pub(crate) cancel: Arc<AtomicBool>,
}

// ─── The engine ──────────────────────────────────────────────────────

impl SftpService {
    /// Puts a task into the registry before its job is spawned, so a
    /// cancel that arrives immediately after the id is handed out
    /// already has a flag to flip.
    pub(crate) fn register_task(&self, id: &str, session_id: &str) -> Arc<AtomicBool> {
        let cancel = Arc::new(AtomicBool::new(false));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(
                id.to_string(),
                TaskHandle {
                    session_id: session_id.to_string(),
                    cancel: cancel.clone(),
                },
            );
        }
        cancel
    }

    /// Flags every task of one session for cancellation. The tasks
    /// unregister themselves when their jobs wind down.
    pub(crate) fn cancel_session_tasks(&self, session_id: &str) {
        if let Ok(tasks) = self.tasks.lock() {
            for handle in tasks.values().filter(|h| h.session_id == session_id) {
                handle.cancel.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Flags one task for cancellation. The task itself reports the
    /// cancellation through its terminal progress event.
    pub fn cancel_transfer(&self, transfer_id: &str) -> SkiffResult<()> {
        if let Ok(tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.get(transfer_id) {
                handle.cancel.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }
        Err(SkiffError::transfer_not_found(transfer_id))
    }

    /// Ids of every task still in flight, sorted.
    pub fn active_transfers(&self) -> Vec<String> {
        if let Ok(tasks) = self.tasks.lock() {
            let mut ids: Vec<String> = tasks.keys().cloned().collect();
            ids.sort();
            return ids;
        }
        Vec::new()
    }

    /// Runs a transfer job on the blocking pool with progress tracking
    /// around it. The job's error (or panic) becomes the terminal
    /// event's text; the registry entry goes away afterwards.
    fn spawn_transfer<F>(&self, desc: TaskDescriptor, job: F)
    where
        F: FnOnce(Arc<AtomicU64>, Arc<AtomicBool>) -> SkiffResult<()> + Send + 'static,
    {
        let cancel = self.register_task(&desc.id, &desc.session_id);
        let task_id = desc.id.clone();
        let tracker = ProgressTracker::start(desc, self.events.clone());
        let counter = tracker.counter();
        let tasks = self.tasks.clone();

        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || job(counter, cancel)).await;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.message),
                Err(e) => {
                    warn!("transfer task {} died: {}", task_id, e);
                    Some("transfer task failed".to_string())
                }
            };
            tracker.finish(error).await;
            if let Ok(mut tasks) = tasks.lock() {
                tasks.remove(&task_id);
            }
        });
    }

    // ── File transfers ───────────────────────────────────────────

    /// Uploads one local file into `remote_dir`, creating that
    /// directory if it is absent. With no explicit source the file
    /// picker decides; a dismissed picker means no task and
    /// `Ok(None)`. Returns the task id otherwise.
    pub async fn upload_file(
        &self,
        session_id: &str,
        local_path: Option<String>,
        remote_dir: &str,
    ) -> SkiffResult<Option<String>> {
        let fs = self.remote(session_id)?;
        let Some(local) = self.resolve_local_file(local_path).await? else {
            return Ok(None);
        };

        let total = std::fs::metadata(&local)?.len();
        let dir = remote_dir.to_string();
        let target = join_remote(remote_dir, &local_basename(&local));
        let desc = TaskDescriptor {
            id: ids::task_id(),
            session_id: session_id.to_string(),
            direction: TransferDirection::Upload,
            local_path: local.display().to_string(),
            remote_path: target.clone(),
            total_bytes: total,
        };
        let task_id = desc.id.clone();

        self.spawn_transfer(desc, move |counter, cancel| {
            fs.create_dir_all(&dir)?;
            let mut reader = std::fs::File::open(&local)?;
            let mut writer = fs.create_write(&target)?;
            copy_with_cancel(&mut reader, &mut *writer, &counter, &cancel)
        });
        Ok(Some(task_id))
    }

    /// Downloads one remote file, creating the local parent directory
    /// if it is absent. With no explicit target the save dialog
    /// decides (suggesting the remote name); a dismissed dialog means
    /// no task and `Ok(None)`.
    pub async fn download_file(
        &self,
        session_id: &str,
        remote_path: &str,
        local_path: Option<String>,
    ) -> SkiffResult<Option<String>> {
        let fs = self.remote(session_id)?;
        let entry = fs.stat(remote_path)?;
        if entry.is_dir {
            return Err(SkiffError::sftp_failed(format!(
                "'{}' is a directory",
                remote_path
            )));
        }
        let Some(target) = self
            .resolve_local_save(local_path, remote_basename(remote_path))
            .await?
        else {
            return Ok(None);
        };

        let remote = remote_path.to_string();
        let desc = TaskDescriptor {
            id: ids::task_id(),
            session_id: session_id.to_string(),
            direction: TransferDirection::Download,
            local_path: target.display().to_string(),
            remote_path: remote.clone(),
            total_bytes: entry.size,
        };
        let task_id = desc.id.clone();

        self.spawn_transfer(desc, move |counter, cancel| {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut reader = fs.open_read(&remote)?;
            let mut writer = std::fs::File::create(&target)?;
            copy_with_cancel(&mut *reader, &mut writer, &counter, &cancel)
        });
        Ok(Some(task_id))
    }

    // ── Directory transfers ──────────────────────────────────────

    /// Uploads a local directory tree under `remote_dir`. The tree is
    /// walked up front, so the task's total is fixed before the first
    /// byte moves.
    pub async fn upload_directory(
        &self,
        session_id: &str,
        local_path: Option<String>,
        remote_dir: &str,
    ) -> SkiffResult<Option<String>> {
        let fs = self.remote(session_id)?;
        let Some(local) = self.resolve_local_dir(local_path).await? else {
            return Ok(None);
        };

        let tree = walk_local(&local)?;
        let remote_root = join_remote(remote_dir, &local_basename(&local));
        let desc = TaskDescriptor {
            id: ids::task_id(),
            session_id: session_id.to_string(),
            direction: TransferDirection::Upload,
            local_path: local.display().to_string(),
            remote_path: remote_root.clone(),
            total_bytes: tree.total,
        };
        let task_id = desc.id.clone();

        self.spawn_transfer(desc, move |counter, cancel| {
            fs.create_dir_all(&remote_root)?;
            for dir in &tree.dirs {
                fs.create_dir_all(&join_remote(&remote_root, dir))?;
            }
            for (rel, _) in &tree.files {
                let mut reader = std::fs::File::open(local.join(rel))?;
                let mut writer = fs.create_write(&join_remote(&remote_root, rel))?;
                copy_with_cancel(&mut reader, &mut *writer, &counter, &cancel)?;
            }
            Ok(())
        });
        Ok(Some(task_id))
    }

    /// Downloads a remote directory tree into a local parent
    /// directory, keeping the tree's own name as the new root.
    pub async fn download_directory(
        &self,
        session_id: &str,
        remote_path: &str,
        local_dir: Option<String>,
    ) -> SkiffResult<Option<String>> {
        let fs = self.remote(session_id)?;
        let root = fs.stat(remote_path)?;
        if !root.is_dir {
            return Err(SkiffError::sftp_failed(format!(
                "'{}' is not a directory",
                remote_path
            )));
        }
        let Some(parent) = self.resolve_local_dir(local_dir).await? else {
            return Ok(None);
        };

        let tree = walk_remote(fs.as_ref(), remote_path)?;
        let local_root = parent.join(remote_basename(remote_path));
        let remote_root = remote_path.to_string();
        let desc = TaskDescriptor {
            id: ids::task_id(),
            session_id: session_id.to_string(),
            direction: TransferDirection::Download,
            local_path: local_root.display().to_string(),
            remote_path: remote_root.clone(),
            total_bytes: tree.total,
        };
        let task_id = desc.id.clone();

        self.spawn_transfer(desc, move |counter, cancel| {
            std::fs::create_dir_all(&local_root)?;
            for dir in &tree.dirs {
                std::fs::create_dir_all(local_root.join(dir))?;
            }
            for (rel, _) in &tree.files {
                let mut reader = fs.open_read(&join_remote(&remote_root, rel))?;
                let mut writer = std::fs::File::create(local_root.join(rel))?;
                copy_with_cancel(&mut *reader, &mut writer, &counter, &cancel)?;
            }
            Ok(())
        });
        Ok(Some(task_id))
    }

    // ── Dialog resolution ────────────────────────────────────────

    async fn resolve_local_file(&self, local_path: Option<String>) -> SkiffResult<Option<PathBuf>> {
        match local_path {
            Some(path) => Ok(Some(PathBuf::from(path))),
            None => self.dialogs.pick_file().await,
        }
    }

    async fn resolve_local_dir(&self, local_path: Option<String>) -> SkiffResult<Option<PathBuf>> {
        match local_path {
            Some(path) => Ok(Some(PathBuf::from(path))),
            None => self.dialogs.pick_directory().await,
        }
    }

    async fn resolve_local_save(
        &self,
        local_path: Option<String>,
        suggested: &str,
    ) -> SkiffResult<Option<PathBuf>> {
        match local_path {
            Some(path) => Ok(Some(PathBuf::from(path))),
            None => self.dialogs.pick_save(suggested).await,
        }
    }
}

// ─── Tree walks ──────────────────────────────────────────────────────

/// A directory tree flattened for transfer: relative paths (always
/// `/`-separated) with directories listed parent before child, file
/// sizes, and the summed total.
pub(crate) struct WalkedTree {
    pub(crate) dirs: Vec<String>,
    pub(crate) files: Vec<(String, u64)>,
    pub(crate) total: u64,
}

pub(crate) fn walk_local(root: &Path) -> SkiffResult<WalkedTree> {
    let mut tree = WalkedTree {
        dirs: Vec::new(),
        files: Vec::new(),
        total: 0,
    };
    let mut stack = vec![String::new()];
    while let Some(rel) = stack.pop() {
        let abs = if rel.is_empty() {
            root.to_path_buf()
        } else {
            root.join(&rel)
        };
        for entry in std::fs::read_dir(&abs)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let child = if rel.is_empty() {
                name
            } else {
                format!("{}/{}", rel, name)
            };
            let meta = entry.metadata()?;
            if meta.is_dir() {
                tree.dirs.push(child.clone());
                stack.push(child);
            } else {
                tree.total += meta.len();
                tree.files.push((child, meta.len()));
            }
        }
    }
    tree.dirs.sort();
    tree.files.sort();
    Ok(tree)
}

pub(crate) fn walk_remote(fs: &dyn RemoteFs, root: &str) -> SkiffResult<WalkedTree> {
    let mut tree = WalkedTree {
        dirs: Vec::new(),
        files: Vec::new(),
        total: 0,
    };
    let mut stack = vec![String::new()];
    while let Some(rel) = stack.pop() {
        let abs = if rel.is_empty() {
            root.to_string()
        } else {
            join_remote(root, &rel)
        };
        for entry in fs.list_dir(&abs)? {
            let child = if rel.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", rel, entry.name)
            };
            if entry.is_dir {
                tree.dirs.push(child.clone());
                stack.push(child);
            } else {
                tree.total += entry.size;
                tree.files.push((child, entry.size));
            }
        }
    }
    tree.dirs.sort();
    tree.files.sort();
    Ok(tree)
}

/// Total size in bytes of a local directory tree, the fixed
/// denominator an upload of that tree would use.
pub fn local_dir_size(path: &str) -> SkiffResult<u64> {
    Ok(walk_local(Path::new(path))?.total)
}

pub(crate) fn collect_remote_entries(
    fs: &dyn RemoteFs,
    root: &str,
) -> SkiffResult<Vec<RemoteEntry>> {
    let mut collected = Vec::new();
    let mut stack = vec![root.to_string()];
    while let Some(dir) = stack.pop() {
        for entry in fs.list_dir(&dir)? {
            if entry.is_dir {
                stack.push(entry.path.clone());
            }
            collected.push(entry);
        }
    }
    Ok(collected)
}

fn join_remote(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

fn remote_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name,
        _ => trimmed,
    }
}

fn local_basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
