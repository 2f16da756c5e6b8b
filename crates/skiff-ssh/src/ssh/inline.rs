//! Inline file transfers over the interactive session itself.
//!
//! A remote helper program talks to the client by embedding frames in
//! the ordinary output stream. Each frame is a lead-in marker followed
//! by a newline-terminated header and, for data frames, a payload:
//!
//! ```text
//! R            remote is ready to receive; pick a local file and send it
//! S size name  remote offers a file of `size` bytes
//! D len        `len` payload bytes follow the header
//! E            end of content
//! O            transfer acknowledged
//! K            skipped, the destination already exists
//! A            abort
//! ```
//!
//! The filter decorates the primary output stream: bytes that are not
//! part of a frame pass through untouched, including lead-in lookalikes
//! and frames split across read chunks. Transfer failures are reported
//! as status lines in the terminal and never take the session down; a
//! dismissed file dialog is a normal abort, not an error.

use crate::ssh::session::SessionLink;
use async_trait::async_trait;
use skiff_core::PathDialogs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const LEAD: &[u8] = b"\x18skx";
/// Longest accepted frame header (after the lead-in, before `\n`).
const MAX_HEADER: usize = 512;
const DATA_CHUNK: usize = 4096;
/// Progress status cadence for both directions, in bytes.
const STATUS_EVERY: u64 = 64 * 1024;

/// Transformation applied to one output stream before it reaches the
/// sink. Stateful: implementations may hold bytes back between chunks.
#[async_trait]
pub trait OutputFilter: Send {
    async fn on_output(&mut self, chunk: Vec<u8>) -> Vec<u8>;

    /// Called once when the stream ends; returns anything still held.
    async fn flush(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

/// Filter for sessions with inline transfers disabled.
pub struct Passthrough;

#[async_trait]
impl OutputFilter for Passthrough {
    async fn on_output(&mut self, chunk: Vec<u8>) -> Vec<u8> {
        chunk
    }
}

// ─── Inline transfer filter ──────────────────────────────────────────

enum FilterState {
    Idle,
    /// Sent our content, waiting for the remote `O` or `K`.
    AwaitAck { name: String, size: u64 },
    Receiving(ReceiveJob),
}

struct ReceiveJob {
    name: String,
    path: PathBuf,
    file: tokio::fs::File,
    expected: u64,
    received: u64,
    last_status: u64,
}

/// The decorator itself: scans for frames, runs the transfer protocol,
/// and passes everything else through.
pub struct InlineTransferFilter {
    session_id: String,
    link: Arc<dyn SessionLink>,
    dialogs: Arc<dyn PathDialogs>,
    state: FilterState,
    /// Bytes that might still turn into a frame once more input arrives.
    carry: Vec<u8>,
    /// Payload bytes still owed to the current data frame.
    pending_data: u64,
}

impl InlineTransferFilter {
    pub fn new(
        session_id: String,
        link: Arc<dyn SessionLink>,
        dialogs: Arc<dyn PathDialogs>,
    ) -> Self {
        Self {
            session_id,
            link,
            dialogs,
            state: FilterState::Idle,
            carry: Vec::new(),
            pending_data: 0,
        }
    }

    // ── Frame handling ───────────────────────────────────────────

    async fn handle_frame(&mut self, header: &str, out: &mut Vec<u8>) {
        let (kind, args) = match header.split_once(' ') {
            Some((kind, args)) => (kind, args),
            None => (header, ""),
        };
        match kind {
            "R" => self.start_upload(out).await,
            "S" => self.start_download(args, out).await,
            "D" => self.begin_data(args, out).await,
            "E" => self.finish_receive(out).await,
            "O" => self.acknowledge(out),
            "K" => self.remote_skipped(out),
            "A" => self.remote_aborted(out).await,
            other => {
                log::debug!(
                    "session {} unknown transfer frame '{}' ignored",
                    self.session_id,
                    other
                );
            }
        }
    }

    /// `R`: the remote side wants a file from us.
    async fn start_upload(&mut self, out: &mut Vec<u8>) {
        if !matches!(self.state, FilterState::Idle) {
            log::debug!(
                "session {} upload request during active transfer ignored",
                self.session_id
            );
            return;
        }
        status(out, "remote requested a file upload");
        let dialogs = self.dialogs.clone();
        match dialogs.pick_file().await {
            Ok(Some(path)) => self.upload_file(path, out).await,
            Ok(None) => {
                self.send_frame("A");
                status(out, "upload cancelled");
            }
            Err(e) => {
                self.send_frame("A");
                status(out, &format!("file selection failed: {}", e));
            }
        }
    }

    async fn upload_file(&mut self, path: PathBuf, out: &mut Vec<u8>) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                self.send_frame("A");
                status(out, &format!("cannot read '{}': {}", path.display(), e));
                return;
            }
        };
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                self.send_frame("A");
                status(out, &format!("cannot open '{}': {}", path.display(), e));
                return;
            }
        };

        let size = meta.len();
        self.send_frame(&format!("S {} {}", size, name));
        status(out, &format!("sending '{}' ({} bytes)", name, size));

        let mut buf = vec![0u8; DATA_CHUNK];
        let mut sent: u64 = 0;
        let mut last_note: u64 = 0;
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    self.send_data(&buf[..n]);
                    sent += n as u64;
                    if sent - last_note >= STATUS_EVERY {
                        last_note = sent;
                        status(out, &format!("sent {} of {} bytes", sent, size));
                        tokio::task::yield_now().await;
                    }
                }
                Err(e) => {
                    self.send_frame("A");
                    status(out, &format!("upload of '{}' failed: {}", name, e));
                    return;
                }
            }
        }
        self.send_frame("E");
        self.state = FilterState::AwaitAck { name, size };
    }

    /// `S size name`: the remote side offers a file.
    async fn start_download(&mut self, args: &str, out: &mut Vec<u8>) {
        if !matches!(self.state, FilterState::Idle) {
            log::debug!(
                "session {} offer during active transfer ignored",
                self.session_id
            );
            return;
        }
        let Some((size, name)) = parse_offer(args) else {
            self.send_frame("A");
            status(out, "malformed transfer offer, refusing");
            return;
        };
        status(out, &format!("remote offers '{}' ({} bytes)", name, size));
        let dialogs = self.dialogs.clone();
        match dialogs.pick_save(&name).await {
            Ok(Some(path)) => self.begin_receive(name, size, path, out).await,
            Ok(None) => {
                self.send_frame("A");
                status(out, "download cancelled");
            }
            Err(e) => {
                self.send_frame("A");
                status(out, &format!("save dialog failed: {}", e));
            }
        }
    }

    async fn begin_receive(&mut self, name: String, size: u64, path: PathBuf, out: &mut Vec<u8>) {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.send_frame("K");
            status(out, &format!("'{}' already exists, skipping", path.display()));
            return;
        }
        match tokio::fs::File::create(&path).await {
            Ok(file) => {
                self.send_frame("R");
                status(out, &format!("receiving '{}' ({} bytes)", name, size));
                self.state = FilterState::Receiving(ReceiveJob {
                    name,
                    path,
                    file,
                    expected: size,
                    received: 0,
                    last_status: 0,
                });
            }
            Err(e) => {
                self.send_frame("A");
                status(out, &format!("cannot create '{}': {}", path.display(), e));
            }
        }
    }

    /// `D len`: `len` payload bytes follow.
    async fn begin_data(&mut self, args: &str, out: &mut Vec<u8>) {
        match args.trim().parse::<u64>() {
            Ok(len) => {
                if !matches!(self.state, FilterState::Receiving(_)) {
                    log::debug!(
                        "session {} stray data frame ({} bytes) swallowed",
                        self.session_id,
                        len
                    );
                }
                self.pending_data = len;
            }
            Err(_) => {
                if matches!(self.state, FilterState::Receiving(_)) {
                    self.abort_receive("malformed data frame", true, out).await;
                }
            }
        }
    }

    async fn consume_payload(&mut self, bytes: &[u8], out: &mut Vec<u8>) {
        let failed = {
            let FilterState::Receiving(job) = &mut self.state else {
                // Payload without an open receive; swallow it rather
                // than spilling binary into the terminal.
                return;
            };
            match job.file.write_all(bytes).await {
                Ok(()) => {
                    job.received += bytes.len() as u64;
                    if job.received - job.last_status >= STATUS_EVERY {
                        job.last_status = job.received;
                        status(
                            out,
                            &format!(
                                "received {} of {} bytes for '{}'",
                                job.received, job.expected, job.name
                            ),
                        );
                    }
                    false
                }
                Err(e) => {
                    status(out, &format!("write to '{}' failed: {}", job.path.display(), e));
                    true
                }
            }
        };
        if failed {
            self.abort_receive("local write failed", true, out).await;
        }
    }

    /// `E`: content complete.
    async fn finish_receive(&mut self, out: &mut Vec<u8>) {
        match std::mem::replace(&mut self.state, FilterState::Idle) {
            FilterState::Receiving(mut job) => {
                if let Err(e) = job.file.flush().await {
                    log::warn!(
                        "session {} flush of '{}' failed: {}",
                        self.session_id,
                        job.path.display(),
                        e
                    );
                }
                if job.received != job.expected {
                    status(
                        out,
                        &format!(
                            "size mismatch for '{}': expected {}, received {}",
                            job.name, job.expected, job.received
                        ),
                    );
                }
                self.send_frame("O");
                status(
                    out,
                    &format!(
                        "saved '{}' ({} bytes) to {}",
                        job.name,
                        job.received,
                        job.path.display()
                    ),
                );
            }
            other => self.state = other,
        }
    }

    /// `O`: the remote side confirmed our upload.
    fn acknowledge(&mut self, out: &mut Vec<u8>) {
        if let FilterState::AwaitAck { name, size } = &self.state {
            let (name, size) = (name.clone(), *size);
            self.state = FilterState::Idle;
            status(out, &format!("upload of '{}' complete ({} bytes)", name, size));
        }
    }

    /// `K`: the remote side already has the file.
    fn remote_skipped(&mut self, out: &mut Vec<u8>) {
        if let FilterState::AwaitAck { name, .. } = &self.state {
            let name = name.clone();
            self.state = FilterState::Idle;
            status(out, &format!("remote already has '{}', skipped", name));
        }
    }

    /// `A`: the remote side gave up on the current transfer.
    async fn remote_aborted(&mut self, out: &mut Vec<u8>) {
        if matches!(self.state, FilterState::Receiving(_)) {
            self.abort_receive("remote aborted", false, out).await;
            return;
        }
        if let FilterState::AwaitAck { name, .. } = &self.state {
            let name = name.clone();
            self.state = FilterState::Idle;
            status(out, &format!("upload of '{}' rejected by remote", name));
        }
    }

    /// Tear down an open receive, removing the partial file.
    async fn abort_receive(&mut self, reason: &str, notify_remote: bool, out: &mut Vec<u8>) {
        match std::mem::replace(&mut self.state, FilterState::Idle) {
            FilterState::Receiving(job) => {
                drop(job.file);
                if let Err(e) = tokio::fs::remove_file(&job.path).await {
                    log::warn!(
                        "session {} could not remove partial '{}': {}",
                        self.session_id,
                        job.path.display(),
                        e
                    );
                }
                status(out, &format!("download of '{}' aborted ({})", job.name, reason));
            }
            other => self.state = other,
        }
        if notify_remote {
            self.send_frame("A");
        }
    }

    // ── Frame output ─────────────────────────────────────────────

    fn send_frame(&self, body: &str) {
        let mut frame = Vec::with_capacity(LEAD.len() + body.len() + 1);
        frame.extend_from_slice(LEAD);
        frame.extend_from_slice(body.as_bytes());
        frame.push(b'\n');
        if let Err(e) = self.link.send(frame) {
            log::warn!(
                "session {} failed to answer transfer frame: {}",
                self.session_id,
                e
            );
        }
    }

    fn send_data(&self, payload: &[u8]) {
        let header = format!("D {}\n", payload.len());
        let mut frame = Vec::with_capacity(LEAD.len() + header.len() + payload.len());
        frame.extend_from_slice(LEAD);
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(payload);
        if let Err(e) = self.link.send(frame) {
            log::warn!(
                "session {} failed to send transfer data: {}",
                self.session_id,
                e
            );
        }
    }
}

#[async_trait]
impl OutputFilter for InlineTransferFilter {
    async fn on_output(&mut self, chunk: Vec<u8>) -> Vec<u8> {
        let mut input = std::mem::take(&mut self.carry);
        input.extend_from_slice(&chunk);
        let mut out = Vec::new();
        let mut pos = 0;

        while pos < input.len() {
            // Payload owed to an open data frame comes before scanning.
            if self.pending_data > 0 {
                let take = (input.len() - pos).min(self.pending_data as usize);
                self.consume_payload(&input[pos..pos + take], &mut out).await;
                self.pending_data -= take as u64;
                pos += take;
                continue;
            }

            match find_lead(&input[pos..]) {
                Lead::None => {
                    out.extend_from_slice(&input[pos..]);
                    pos = input.len();
                }
                Lead::Partial(at) => {
                    out.extend_from_slice(&input[pos..pos + at]);
                    self.carry = input[pos + at..].to_vec();
                    break;
                }
                Lead::At(at) => {
                    out.extend_from_slice(&input[pos..pos + at]);
                    pos += at;
                    match read_header(&input[pos..]) {
                        Header::Line { text, consumed } => {
                            pos += consumed;
                            self.handle_frame(&text, &mut out).await;
                        }
                        Header::Incomplete => {
                            self.carry = input[pos..].to_vec();
                            break;
                        }
                        Header::Oversized => {
                            // Not a frame after all; let the marker
                            // through and keep scanning behind it.
                            out.extend_from_slice(LEAD);
                            pos += LEAD.len();
                        }
                    }
                }
            }
        }
        out
    }

    async fn flush(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.carry);
        if matches!(self.state, FilterState::Receiving(_)) {
            let mut note = Vec::new();
            self.abort_receive("session closed", false, &mut note).await;
            out.extend_from_slice(&note);
        }
        out
    }
}

// ─── Scanning helpers ────────────────────────────────────────────────

enum Lead {
    /// Full lead-in at this offset.
    At(usize),
    /// A lead-in prefix runs to the end of input; needs more bytes.
    Partial(usize),
    None,
}

fn find_lead(input: &[u8]) -> Lead {
    for i in 0..input.len() {
        if input[i] != LEAD[0] {
            continue;
        }
        let remaining = input.len() - i;
        if remaining >= LEAD.len() {
            if input[i..i + LEAD.len()] == *LEAD {
                return Lead::At(i);
            }
        } else if LEAD[..remaining] == input[i..] {
            return Lead::Partial(i);
        }
    }
    Lead::None
}

enum Header {
    Line { text: String, consumed: usize },
    /// No terminator yet, still within bounds.
    Incomplete,
    /// No terminator within [`MAX_HEADER`] bytes.
    Oversized,
}

fn read_header(input: &[u8]) -> Header {
    let body = &input[LEAD.len()..];
    let bound = body.len().min(MAX_HEADER);
    match body[..bound].iter().position(|&b| b == b'\n') {
        Some(nl) => Header::Line {
            text: String::from_utf8_lossy(&body[..nl]).trim_end().to_string(),
            consumed: LEAD.len() + nl + 1,
        },
        None if body.len() > MAX_HEADER => Header::Oversized,
        None => Header::Incomplete,
    }
}

fn parse_offer(args: &str) -> Option<(u64, String)> {
    let (size, name) = args.split_once(' ')?;
    let size = size.parse().ok()?;
    let name = sanitize_name(name)?;
    Some((size, name))
}

/// Reduce an offered name to its final path component. Offers that do
/// not resolve to a plain file name are refused.
fn sanitize_name(offered: &str) -> Option<String> {
    let trimmed = offered.trim();
    if trimmed.is_empty() {
        return None;
    }
    let name = std::path::Path::new(trimmed)
        .file_name()?
        .to_string_lossy()
        .into_owned();
    Some(name)
}

fn status(out: &mut Vec<u8>, msg: &str) {
    out.extend_from_slice(format!("\r\n[skiff] {}\r\n", msg).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::{SkiffError, SkiffResult};
    use std::sync::Mutex as StdMutex;

    struct RecLink {
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl RecLink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl SessionLink for RecLink {
        fn send(&self, data: Vec<u8>) -> SkiffResult<()> {
            self.sent.lock().unwrap().push(data);
            Ok(())
        }
    }

    struct StubDialogs {
        file: Option<PathBuf>,
        save: Option<PathBuf>,
        save_suggestions: StdMutex<Vec<String>>,
    }

    impl StubDialogs {
        fn new(file: Option<PathBuf>, save: Option<PathBuf>) -> Arc<Self> {
            Arc::new(Self {
                file,
                save,
                save_suggestions: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PathDialogs for StubDialogs {
        async fn pick_file(&self) -> SkiffResult<Option<PathBuf>> {
            Ok(self.file.clone())
        }
        async fn pick_directory(&self) -> SkiffResult<Option<PathBuf>> {
            Err(SkiffError::invalid_config("not used here"))
        }
        async fn pick_save(&self, suggested: &str) -> SkiffResult<Option<PathBuf>> {
            self.save_suggestions.lock().unwrap().push(suggested.to_string());
            Ok(self.save.clone())
        }
    }

    fn filter_with(dialogs: Arc<StubDialogs>) -> (InlineTransferFilter, Arc<RecLink>) {
        let link = RecLink::new();
        let filter = InlineTransferFilter::new("s1".into(), link.clone(), dialogs);
        (filter, link)
    }

    fn frame(body: &str) -> Vec<u8> {
        let mut f = LEAD.to_vec();
        f.extend_from_slice(body.as_bytes());
        f.push(b'\n');
        f
    }

    fn data_frame(payload: &[u8]) -> Vec<u8> {
        let mut f = frame(&format!("D {}", payload.len()));
        f.extend_from_slice(payload);
        f
    }

    fn text(out: &[u8]) -> String {
        String::from_utf8_lossy(out).into_owned()
    }

    // ── Passthrough scanning ─────────────────────────────────────

    #[tokio::test]
    async fn plain_output_passes_through_unchanged() {
        let (mut filter, link) = filter_with(StubDialogs::new(None, None));
        let out = filter.on_output(b"drwxr-xr-x  2 tuf tuf\r\n$ ".to_vec()).await;
        assert_eq!(out, b"drwxr-xr-x  2 tuf tuf\r\n$ ".to_vec());
        assert!(link.frames().is_empty());
        assert!(filter.flush().await.is_empty());
    }

    #[tokio::test]
    async fn split_lead_in_is_reassembled_across_chunks() {
        let dialogs = StubDialogs::new(None, None);
        let (mut filter, link) = filter_with(dialogs);

        let out = filter.on_output(b"hello\x18s".to_vec()).await;
        assert_eq!(out, b"hello".to_vec(), "possible lead-in tail is held back");

        let out = filter.on_output(b"kxS 5 a.txt\n".to_vec()).await;
        // Offer recognised; save dialog dismissed, so the remote gets an
        // abort and the terminal a status line.
        assert!(text(&out).contains("download cancelled"));
        assert_eq!(link.frames(), vec![frame("A")]);
    }

    #[tokio::test]
    async fn lead_in_lookalike_passes_through() {
        let (mut filter, _) = filter_with(StubDialogs::new(None, None));
        let mut out = filter.on_output(b"ab\x18s".to_vec()).await;
        out.extend(filter.on_output(b"top".to_vec()).await);
        assert_eq!(out, b"ab\x18stop".to_vec());
    }

    #[tokio::test]
    async fn oversized_header_is_not_a_frame() {
        let (mut filter, link) = filter_with(StubDialogs::new(None, None));
        let mut noise = LEAD.to_vec();
        noise.extend(std::iter::repeat(b'x').take(MAX_HEADER + 40));

        let mut out = filter.on_output(noise[..200].to_vec()).await;
        out.extend(filter.on_output(noise[200..].to_vec()).await);
        out.extend(filter.flush().await);

        assert_eq!(out, noise, "marker and noise reach the terminal untouched");
        assert!(link.frames().is_empty());
    }

    #[tokio::test]
    async fn incomplete_header_is_flushed_at_stream_end() {
        let (mut filter, _) = filter_with(StubDialogs::new(None, None));
        let mut chunk = b"bye".to_vec();
        chunk.extend_from_slice(LEAD);
        chunk.extend_from_slice(b"S 10 part");

        let out = filter.on_output(chunk.clone()).await;
        assert_eq!(out, b"bye".to_vec());
        let mut held = LEAD.to_vec();
        held.extend_from_slice(b"S 10 part");
        assert_eq!(filter.flush().await, held);
    }

    // ── Upload (remote requests a file) ──────────────────────────

    #[tokio::test]
    async fn upload_streams_the_picked_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("notes.txt");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &content).unwrap();

        let (mut filter, link) = filter_with(StubDialogs::new(Some(src), None));
        let out = filter.on_output(frame("R")).await;
        assert!(text(&out).contains("sending 'notes.txt' (10000 bytes)"));

        let frames = link.frames();
        assert_eq!(frames[0], frame(&format!("S {} notes.txt", content.len())));
        assert_eq!(*frames.last().unwrap(), frame("E"));

        // Concatenated data payloads match the file exactly.
        let mut sent = Vec::new();
        for f in &frames[1..frames.len() - 1] {
            let body = &f[LEAD.len()..];
            let nl = body.iter().position(|&b| b == b'\n').unwrap();
            let header = std::str::from_utf8(&body[..nl]).unwrap();
            let len: usize = header.strip_prefix("D ").unwrap().parse().unwrap();
            assert_eq!(body.len(), nl + 1 + len);
            sent.extend_from_slice(&body[nl + 1..]);
        }
        assert_eq!(sent, content);

        // Remote confirms.
        let out = filter.on_output(frame("O")).await;
        assert!(text(&out).contains("upload of 'notes.txt' complete"));
    }

    #[tokio::test]
    async fn dismissed_file_dialog_aborts_the_upload() {
        let (mut filter, link) = filter_with(StubDialogs::new(None, None));
        let out = filter.on_output(frame("R")).await;
        assert!(text(&out).contains("upload cancelled"));
        assert_eq!(link.frames(), vec![frame("A")]);

        // The session keeps working afterwards.
        let out = filter.on_output(b"$ ".to_vec()).await;
        assert_eq!(out, b"$ ".to_vec());
    }

    #[tokio::test]
    async fn remote_skip_resolves_a_pending_upload() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("dup.bin");
        std::fs::write(&src, b"same bytes").unwrap();

        let (mut filter, _link) = filter_with(StubDialogs::new(Some(src), None));
        filter.on_output(frame("R")).await;
        let out = filter.on_output(frame("K")).await;
        assert!(text(&out).contains("remote already has 'dup.bin', skipped"));
    }

    // ── Download (remote offers a file) ──────────────────────────

    #[tokio::test]
    async fn download_reassembles_split_frames() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("in.bin");
        let dialogs = StubDialogs::new(None, Some(dest.clone()));
        let (mut filter, link) = filter_with(dialogs.clone());

        let out = filter.on_output(frame("S 12 in.bin")).await;
        assert!(text(&out).contains("receiving 'in.bin' (12 bytes)"));
        assert_eq!(link.frames(), vec![frame("R")]);
        assert_eq!(*dialogs.save_suggestions.lock().unwrap(), ["in.bin"]);

        // Two data frames, delivered in awkward slices.
        let mut wire = data_frame(b"hello ");
        wire.extend(data_frame(b"world!"));
        wire.extend(frame("E"));
        let mut terminal = Vec::new();
        for piece in wire.chunks(5) {
            terminal.extend(filter.on_output(piece.to_vec()).await);
        }

        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world!");
        assert_eq!(*link.frames().last().unwrap(), frame("O"));
        let shown = text(&terminal);
        assert!(shown.contains("saved 'in.bin' (12 bytes)"));
        assert!(
            !shown.contains("hello"),
            "payload must not leak into the terminal"
        );
    }

    #[tokio::test]
    async fn existing_destination_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("keep.txt");
        std::fs::write(&dest, b"do not touch").unwrap();

        let (mut filter, link) = filter_with(StubDialogs::new(None, Some(dest.clone())));
        let out = filter.on_output(frame("S 4 keep.txt")).await;

        assert!(text(&out).contains("already exists, skipping"));
        assert_eq!(link.frames(), vec![frame("K")]);
        assert_eq!(std::fs::read(&dest).unwrap(), b"do not touch");
    }

    #[tokio::test]
    async fn remote_abort_removes_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("half.bin");
        let (mut filter, _link) = filter_with(StubDialogs::new(None, Some(dest.clone())));

        filter.on_output(frame("S 100 half.bin")).await;
        filter.on_output(data_frame(b"first part")).await;
        let out = filter.on_output(frame("A")).await;

        assert!(text(&out).contains("aborted (remote aborted)"));
        assert!(!dest.exists(), "partial file is removed");
    }

    #[tokio::test]
    async fn stream_end_mid_receive_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cut.bin");
        let (mut filter, _link) = filter_with(StubDialogs::new(None, Some(dest.clone())));

        filter.on_output(frame("S 50 cut.bin")).await;
        filter.on_output(data_frame(b"only this")).await;
        let out = filter.flush().await;

        assert!(text(&out).contains("aborted (session closed)"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn offered_names_are_reduced_to_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("passwd");
        let dialogs = StubDialogs::new(None, Some(dest));
        let (mut filter, _link) = filter_with(dialogs.clone());

        filter.on_output(frame("S 4 ../../etc/passwd")).await;
        assert_eq!(*dialogs.save_suggestions.lock().unwrap(), ["passwd"]);
    }

    #[tokio::test]
    async fn malformed_offer_is_refused_and_session_survives() {
        let (mut filter, link) = filter_with(StubDialogs::new(None, None));
        let out = filter.on_output(frame("S twelve a.txt")).await;
        assert!(text(&out).contains("malformed transfer offer"));
        assert_eq!(link.frames(), vec![frame("A")]);

        let out = filter.on_output(b"still alive\r\n".to_vec()).await;
        assert_eq!(out, b"still alive\r\n".to_vec());
    }

    // ── Helpers ──────────────────────────────────────────────────

    #[test]
    fn sanitize_name_rejects_what_cannot_be_a_file() {
        assert_eq!(sanitize_name("a.txt").as_deref(), Some("a.txt"));
        assert_eq!(sanitize_name("dir/b.log").as_deref(), Some("b.log"));
        assert_eq!(sanitize_name("  "), None);
        assert_eq!(sanitize_name(".."), None);
        assert_eq!(sanitize_name("trailing/"), Some("trailing".to_string()));
    }

    #[test]
    fn parse_offer_requires_size_then_name() {
        assert_eq!(parse_offer("10 a b.txt"), Some((10, "a b.txt".to_string())));
        assert_eq!(parse_offer("x a.txt"), None);
        assert_eq!(parse_offer("10"), None);
    }
}
