//! Frame transport over one connected TCP socket.
//!
//! The read loop and the write loop run as separate tasks. Inbound frames are
//! handed to the owning engine through a bounded channel (in arrival order);
//! outbound frames go through an unbounded queue so `send` never blocks.

use crate::config::EngineConfig;
use crate::error::TransportError;
use crate::frame::{encode_frame, FrameDecoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Name used in transport diagnostics.
pub const TRANSPORT_NAME: &str = "BufferTcpClient";

const READ_CHUNK: usize = 8 * 1024;

/// Inbound frames, in the order the peer wrote them.
pub type FrameStream = ReceiverStream<Vec<u8>>;

/// How the inbound side of a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The peer closed its write side (a zero-byte read).
    EndOfStream,
    /// Reset, I/O failure or protocol violation before local close.
    Failed(String),
    /// Local close was initiated first; later failures were suppressed.
    Closed,
    /// The peer did not finish within the shutdown wait.
    TimedOut,
}

impl Termination {
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

struct Shared {
    label: String,
    closing: AtomicBool,
    termination: Mutex<Option<Termination>>,
}

impl Shared {
    /// First outcome wins.
    fn record(&self, termination: Termination) {
        let mut slot = lock(&self.termination);
        if slot.is_none() {
            *slot = Some(termination);
        }
    }

    fn fail(&self, reason: String) {
        if self.closing.load(Ordering::Acquire) {
            debug!(transport = %self.label, error = %reason, "io failure after local close");
            self.record(Termination::Closed);
        } else {
            warn!(transport = %self.label, error = %reason, "abnormal termination of pipe");
            self.record(Termination::Failed(reason));
        }
    }
}

struct Unstarted {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub struct FrameTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    max_frame_len: usize,
    frame_buffer: usize,
    drain_timeout: Duration,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    unstarted: Mutex<Option<Unstarted>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FrameTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTransport")
            .field("label", &self.shared.label)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl FrameTransport {
    /// Wrap an already connected socket. `label` is the role-qualified name
    /// used in diagnostics, e.g. `runner::1r`.
    pub fn new(
        label: impl Into<String>,
        stream: TcpStream,
        config: &EngineConfig,
    ) -> Result<Self, TransportError> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }

        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            shared: Arc::new(Shared {
                label: label.into(),
                closing: AtomicBool::new(false),
                termination: Mutex::new(None),
            }),
            local_addr,
            peer_addr,
            max_frame_len: config.max_frame_len,
            frame_buffer: config.frame_buffer.max(1),
            drain_timeout: config.shutdown_timeout(),
            outbound: Mutex::new(Some(tx)),
            unstarted: Mutex::new(Some(Unstarted {
                read,
                write,
                outbound: rx,
            })),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Start the read and write loops. Callable once.
    pub fn start(&self) -> Result<FrameStream, TransportError> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let parts = lock(&self.unstarted)
            .take()
            .ok_or(TransportError::AlreadyStarted)?;

        let (frame_tx, frame_rx) = mpsc::channel(self.frame_buffer);

        let reader = tokio::spawn(read_loop(
            Arc::clone(&self.shared),
            parts.read,
            frame_tx,
            self.max_frame_len,
        ));
        let writer = tokio::spawn(write_loop(
            Arc::clone(&self.shared),
            parts.write,
            parts.outbound,
        ));

        *lock(&self.reader) = Some(reader);
        *lock(&self.writer) = Some(writer);

        Ok(ReceiverStream::new(frame_rx))
    }

    /// Queue one frame. Frames are written in call order.
    pub fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let outbound = lock(&self.outbound);
        match outbound.as_ref() {
            Some(tx) => tx
                .send(encode_frame(payload))
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    /// Half-close: refuse new sends, drain the queue, then shut down the
    /// write side. Reading continues.
    pub fn finish_sending(&self) {
        lock(&self.outbound).take();
    }

    /// Half-close and wait for the peer to end its stream.
    pub async fn wait_for_peer(&self, timeout: Duration) -> Termination {
        self.finish_sending();
        let deadline = Instant::now() + timeout;

        let writer = lock(&self.writer).take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout_at(deadline, &mut writer).await.is_err() {
                writer.abort();
            }
        }

        let reader = lock(&self.reader).take();
        match reader {
            Some(mut reader) => {
                if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                    warn!(transport = %self.shared.label, "peer did not close its stream in time");
                    reader.abort();
                    let _ = reader.await;
                    self.shared.record(Termination::TimedOut);
                }
            }
            None => self.shared.record(Termination::Closed),
        }

        self.termination().unwrap_or(Termination::Closed)
    }

    /// Stop the read loop, drain queued sends and close the socket.
    /// Idempotent.
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.finish_sending();
        lock(&self.unstarted).take();

        let writer = lock(&self.writer).take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(self.drain_timeout, &mut writer)
                .await
                .is_err()
            {
                debug!(transport = %self.shared.label, "dropping unsent frames on close");
                writer.abort();
            }
        }

        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }

        self.shared.record(Termination::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// How the inbound side ended, once it has.
    pub fn termination(&self) -> Option<Termination> {
        lock(&self.shared.termination).clone()
    }

    /// Diagnostic text for a connection that died without the cooperative
    /// close sequence.
    pub fn abnormal_termination_message(&self) -> String {
        format!(
            "{}({}): abnormal termination of pipe",
            TRANSPORT_NAME, self.shared.label
        )
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        // Best-effort cleanup when the owner never closed us.
        for slot in [&self.reader, &self.writer] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut read: OwnedReadHalf,
    frames: mpsc::Sender<Vec<u8>>,
    max_frame_len: usize,
) {
    let mut decoder = FrameDecoder::new(max_frame_len);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        match read.read(&mut buf).await {
            Ok(0) => {
                if decoder.pending_len() > 0 {
                    debug!(
                        transport = %shared.label,
                        bytes = decoder.pending_len(),
                        "discarding partial frame at end of stream"
                    );
                }
                shared.record(Termination::EndOfStream);
                return;
            }
            Ok(n) => {
                let (complete, violation) = decoder.push(&buf[..n]);
                for frame in complete {
                    if frames.send(frame).await.is_err() {
                        debug!(transport = %shared.label, "frame receiver dropped");
                        shared.record(Termination::Closed);
                        return;
                    }
                }
                if let Some(e) = violation {
                    shared.fail(e.to_string());
                    return;
                }
            }
            Err(e) => {
                shared.fail(e.to_string());
                return;
            }
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut write: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write.write_all(&frame).await {
            shared.fail(e.to_string());
            return;
        }
    }
    if let Err(e) = write.shutdown().await {
        debug!(transport = %shared.label, error = %e, "write shutdown failed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
