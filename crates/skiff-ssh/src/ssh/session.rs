//! Shell session runtime: one pump thread per session plus the async
//! tasks that fan its output out to the registered sink.
//!
//! The pump owns the ssh2 channel. It drains queued commands (input,
//! resize, close), then polls the primary and diagnostic streams in
//! non-blocking mode and hands each chunk to the matching forwarder
//! task. The two forwarders are independent: each preserves its own
//! stream's order, and both stamp through a shared [`OrderedSink`] so
//! every event carries a per-session strictly-increasing sequence
//! number. A watcher task waits for both forwarders to finish and then
//! runs the close tail exactly once: closed notification first, then
//! the transport reference is given back.

use crate::ssh::inline::{InlineTransferFilter, OutputFilter, Passthrough};
use crate::ssh::transport::TransportRelease;
use crate::ssh::types::TerminalSize;
use skiff_core::{PathDialogs, SessionClosed, SessionOutput, SkiffError, SkiffResult, TerminalEvents};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const READ_BUF_SIZE: usize = 32 * 1024;
const MIN_SLEEP_MS: u64 = 1;
const MAX_SLEEP_MS: u64 = 10;
const IDLE_THRESHOLD: u32 = 10;
/// Bound on waiting out `WouldBlock` during channel setup and teardown.
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_RETRY_LIMIT: u32 = 400;
const CLOSE_RETRY_SLEEP: Duration = Duration::from_millis(5);

/// Commands accepted by the pump thread.
pub(crate) enum ShellCommand {
    Input(Vec<u8>),
    Resize(TerminalSize),
    Close,
}

/// Write side of a live shell, as seen by output filters. Filters use
/// this to answer the remote peer without going through the service.
pub trait SessionLink: Send + Sync {
    /// Queue bytes for delivery to the remote side.
    fn send(&self, data: Vec<u8>) -> SkiffResult<()>;
}

struct CmdLink {
    session_id: String,
    commands: mpsc::UnboundedSender<ShellCommand>,
}

impl SessionLink for CmdLink {
    fn send(&self, data: Vec<u8>) -> SkiffResult<()> {
        self.commands
            .send(ShellCommand::Input(data))
            .map_err(|_| {
                SkiffError::session_failed("shell is no longer running")
                    .with_session(&self.session_id)
            })
    }
}

// ─── Ordered sink ────────────────────────────────────────────────────

/// Stamps output events with a per-session sequence number and delivers
/// them while the counter lock is held, so delivery order matches stamp
/// order even with both forwarders emitting.
struct OrderedSink {
    session_id: String,
    events: Arc<dyn TerminalEvents>,
    seq: tokio::sync::Mutex<u64>,
}

impl OrderedSink {
    fn new(session_id: String, events: Arc<dyn TerminalEvents>) -> Self {
        Self {
            session_id,
            events,
            seq: tokio::sync::Mutex::new(0),
        }
    }

    async fn emit(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let mut seq = self.seq.lock().await;
        let sequence = *seq;
        *seq += 1;
        self.events.output(SessionOutput {
            session_id: self.session_id.clone(),
            sequence,
            data,
        });
    }
}

// ─── Shell runtime ───────────────────────────────────────────────────

/// Parameters for opening the remote shell of an existing session.
pub struct ShellParams {
    pub session_id: String,
    pub size: TerminalSize,
    pub term: String,
    pub inline_transfers: bool,
}

/// Handle onto a running shell: the command queue plus the watcher that
/// completes once the session is fully torn down.
pub struct ShellRuntime {
    session_id: String,
    commands: mpsc::UnboundedSender<ShellCommand>,
    watcher: JoinHandle<()>,
    closed: Arc<AtomicBool>,
}

impl ShellRuntime {
    pub fn send_input(&self, data: Vec<u8>) -> SkiffResult<()> {
        self.commands.send(ShellCommand::Input(data)).map_err(|_| {
            SkiffError::session_failed("shell is no longer running")
                .with_session(&self.session_id)
        })
    }

    pub fn resize(&self, size: TerminalSize) -> SkiffResult<()> {
        self.commands.send(ShellCommand::Resize(size)).map_err(|_| {
            SkiffError::session_failed("shell is no longer running")
                .with_session(&self.session_id)
        })
    }

    /// Whether the close tail has already run (remote EOF, read failure
    /// or explicit close).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ask the pump to close the remote channel, then wait for the
    /// watcher to finish the close tail. Safe to call after the remote
    /// side already went away.
    pub async fn shutdown(self) {
        let _ = self.commands.send(ShellCommand::Close);
        if let Err(e) = self.watcher.await {
            log::warn!("session {} watcher ended abnormally: {}", self.session_id, e);
        }
    }
}

// Test support: a runtime with no pump behind it, so service-level
// guards are checkable offline.
#[cfg(test)]
impl ShellRuntime {
    pub(crate) fn test_stub(
        session_id: &str,
        closed: bool,
    ) -> (ShellRuntime, mpsc::UnboundedReceiver<ShellCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let runtime = ShellRuntime {
            session_id: session_id.to_string(),
            commands,
            watcher: tokio::spawn(async {}),
            closed: Arc::new(AtomicBool::new(closed)),
        };
        (runtime, rx)
    }
}

/// Open a pty shell channel on the transport. The transport stays in
/// non-blocking mode from here on. Fallible setup is kept apart from
/// [`spawn_shell`] so a failure here leaves the caller holding its
/// transport reference.
pub fn open_channel(transport: &ssh2::Session, params: &ShellParams) -> SkiffResult<ssh2::Channel> {
    transport.set_blocking(false);
    let mut channel = retry_would_block(|| transport.channel_session()).map_err(|e| {
        SkiffError::session_failed(format!("failed to open channel: {}", e))
            .with_session(&params.session_id)
    })?;

    let mut modes = ssh2::PtyModes::new();
    modes.set_boolean(ssh2::PtyModeOpcode::ECHO, true);
    modes.set_u32(ssh2::PtyModeOpcode::TTY_OP_ISPEED, 14400);
    modes.set_u32(ssh2::PtyModeOpcode::TTY_OP_OSPEED, 14400);

    let (cols, rows) = (u32::from(params.size.cols), u32::from(params.size.rows));
    retry_would_block(|| {
        channel.request_pty(&params.term, Some(modes.clone()), Some((cols, rows, 0, 0)))
    })
    .map_err(|e| {
        SkiffError::session_failed(format!("pty allocation failed: {}", e))
            .with_session(&params.session_id)
    })?;
    retry_would_block(|| channel.shell()).map_err(|e| {
        SkiffError::session_failed(format!("failed to start remote shell: {}", e))
            .with_session(&params.session_id)
    })?;
    Ok(channel)
}

/// Start the pump, forwarders and watcher for an opened channel. The
/// transport reference moves into the watcher, which gives it back in
/// the close tail. The returned runtime is the only way to talk to the
/// shell.
pub fn spawn_shell(
    channel: ssh2::Channel,
    params: ShellParams,
    events: Arc<dyn TerminalEvents>,
    dialogs: Arc<dyn PathDialogs>,
    release: TransportRelease,
) -> ShellRuntime {
    let session_id = params.session_id.clone();

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (err_tx, err_rx) = mpsc::unbounded_channel();

    let sink = Arc::new(OrderedSink::new(session_id.clone(), events.clone()));
    let closed = Arc::new(AtomicBool::new(false));

    let filter: Box<dyn OutputFilter> = if params.inline_transfers {
        let link = Arc::new(CmdLink {
            session_id: session_id.clone(),
            commands: cmd_tx.clone(),
        });
        Box::new(InlineTransferFilter::new(session_id.clone(), link, dialogs))
    } else {
        Box::new(Passthrough)
    };

    let pump_id = session_id.clone();
    std::thread::spawn(move || pump(pump_id, channel, cmd_rx, out_tx, err_tx));

    let primary = tokio::spawn(forward_output(out_rx, sink.clone(), filter));
    let diagnostic = tokio::spawn(forward_output(err_rx, sink, Box::new(Passthrough)));
    let watcher = tokio::spawn(close_tail(
        session_id.clone(),
        primary,
        diagnostic,
        closed.clone(),
        events,
        release,
    ));

    log::info!(
        "session {} shell started ({}x{})",
        session_id,
        params.size.cols,
        params.size.rows
    );
    ShellRuntime {
        session_id,
        commands: cmd_tx,
        watcher,
        closed,
    }
}

// ─── Pump thread ─────────────────────────────────────────────────────

/// Poll loop owning the channel. Commands are drained first so input
/// latency stays low, then both streams are read non-blocking. The
/// sleep backs off while the channel is quiet.
fn pump(
    session_id: String,
    mut channel: ssh2::Channel,
    mut commands: mpsc::UnboundedReceiver<ShellCommand>,
    stdout: mpsc::UnboundedSender<Vec<u8>>,
    stderr: mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut idle: u32 = 0;
    let mut running = true;

    loop {
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                ShellCommand::Input(data) => {
                    if let Err(e) = write_accepted(&mut channel, &data) {
                        log::warn!("session {} write failed: {}", session_id, e);
                        running = false;
                    }
                }
                ShellCommand::Resize(size) => {
                    let _ = channel.request_pty_size(
                        u32::from(size.cols),
                        u32::from(size.rows),
                        None,
                        None,
                    );
                }
                ShellCommand::Close => {
                    drain_close(&mut channel);
                    running = false;
                }
            }
        }
        if !running {
            break;
        }

        let mut progressed = false;

        match channel.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                progressed = true;
                if stdout.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::warn!("session {} read failed: {}", session_id, e);
                let _ = stdout.send(format!("\r\n[session read failed: {}]\r\n", e).into_bytes());
                break;
            }
        }

        match channel.stderr().read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                progressed = true;
                if stderr.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::warn!("session {} diagnostic read failed: {}", session_id, e);
                break;
            }
        }

        // Drain whatever arrived alongside the EOF before leaving.
        if channel.eof() && !progressed {
            log::info!("session {} remote eof", session_id);
            break;
        }

        if progressed {
            idle = 0;
        } else {
            idle = idle.saturating_add(1);
        }
        let sleep_ms = if idle > IDLE_THRESHOLD {
            MAX_SLEEP_MS
        } else {
            MIN_SLEEP_MS
        };
        std::thread::sleep(Duration::from_millis(sleep_ms));
    }
    // Dropping the senders here ends both forwarders, which in turn
    // lets the watcher run the close tail.
    log::debug!("session {} pump stopped", session_id);
}

/// Write the whole buffer, waiting out `WouldBlock` without losing the
/// partial-write offset. Bounded so a wedged connection cannot stall
/// the pump forever.
fn write_accepted(channel: &mut ssh2::Channel, data: &[u8]) -> std::io::Result<()> {
    let deadline = Instant::now() + SETUP_TIMEOUT;
    let mut offset = 0;
    while offset < data.len() {
        match channel.write(&data[offset..]) {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => offset += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(std::io::ErrorKind::TimedOut.into());
                }
                std::thread::sleep(Duration::from_millis(MIN_SLEEP_MS));
            }
            Err(e) => return Err(e),
        }
    }
    let _ = channel.flush();
    Ok(())
}

/// Close the channel and wait for the remote side to confirm, retrying
/// through `WouldBlock` a bounded number of times.
fn drain_close(channel: &mut ssh2::Channel) {
    for _ in 0..CLOSE_RETRY_LIMIT {
        match channel.close() {
            Ok(()) => break,
            Err(e) if is_would_block(&e) => std::thread::sleep(CLOSE_RETRY_SLEEP),
            Err(e) => {
                log::debug!("channel close: {}", e);
                break;
            }
        }
    }
    for _ in 0..CLOSE_RETRY_LIMIT {
        match channel.wait_close() {
            Ok(()) => break,
            Err(e) if is_would_block(&e) => std::thread::sleep(CLOSE_RETRY_SLEEP),
            Err(e) => {
                log::debug!("channel wait_close: {}", e);
                break;
            }
        }
    }
}

/// Run one ssh2 call against the non-blocking transport, waiting out
/// `WouldBlock` until it completes or [`SETUP_TIMEOUT`] elapses.
fn retry_would_block<T>(
    mut op: impl FnMut() -> Result<T, ssh2::Error>,
) -> Result<T, ssh2::Error> {
    let deadline = Instant::now() + SETUP_TIMEOUT;
    loop {
        match op() {
            Err(e) if is_would_block(&e) && Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(MIN_SLEEP_MS));
            }
            other => return other,
        }
    }
}

fn is_would_block(e: &ssh2::Error) -> bool {
    // LIBSSH2_ERROR_EAGAIN
    matches!(e.code(), ssh2::ErrorCode::Session(-37))
}

// ─── Forwarders and close tail ───────────────────────────────────────

/// One read loop: drains a stream's chunks through its filter into the
/// shared sink, preserving the stream's own order. Ends when the pump
/// drops the sender, flushing whatever the filter still holds.
async fn forward_output(
    mut source: mpsc::UnboundedReceiver<Vec<u8>>,
    sink: Arc<OrderedSink>,
    mut filter: Box<dyn OutputFilter>,
) {
    while let Some(chunk) = source.recv().await {
        let out = filter.on_output(chunk).await;
        sink.emit(out).await;
    }
    let tail = filter.flush().await;
    sink.emit(tail).await;
}

/// Wait for both forwarders, then finish the session exactly once: one
/// closed notification, then the transport reference goes back to the
/// cache. The latch keeps repeated closes silent.
async fn close_tail(
    session_id: String,
    primary: JoinHandle<()>,
    diagnostic: JoinHandle<()>,
    closed: Arc<AtomicBool>,
    events: Arc<dyn TerminalEvents>,
    release: TransportRelease,
) {
    let _ = primary.await;
    let _ = diagnostic.await;
    if !closed.swap(true, Ordering::SeqCst) {
        events.closed(SessionClosed {
            session_id: session_id.clone(),
        });
        release.release().await;
        log::info!("session {} closed", session_id);
    }
}
