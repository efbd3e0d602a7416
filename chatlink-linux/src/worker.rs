//! Connection worker: owns one peer's stream. A reader task runs the framer over
//! incoming bytes and reports events; a writer task drains an ordered outbound queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chatlink_core::{encode_frame, encode_message, FrameDecoder, FrameEvent, Framer, Framing, Message};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::Connection;

/// Per-connection I/O settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub framing: Framing,
    /// Size of one read, and of each raw write when sending a file.
    pub read_chunk_size: usize,
    /// Gap between a FILE_START header and the file bytes, so the receiver is in file mode first.
    pub file_start_delay: Duration,
    /// Gap between replayed history messages.
    pub history_spacing: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            framing: Framing::Legacy,
            read_chunk_size: 1024,
            file_start_delay: Duration::from_millis(100),
            history_spacing: Duration::from_millis(100),
        }
    }
}

/// Receives what a worker's reader decodes.
#[async_trait]
pub trait PeerEvents: Send + Sync + 'static {
    async fn on_frame(&self, worker_id: u64, address: &str, event: FrameEvent);

    /// The read loop ended (EOF, read error or bad frame). Not called after `close`.
    async fn on_closed(&self, worker_id: u64, address: &str);
}

enum Outbound {
    Payload(Bytes),
    Pause(Duration),
}

/// Handle to the tasks serving one connection.
pub struct ConnectionWorker {
    id: u64,
    settings: WorkerSettings,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectionWorker {
    pub fn spawn(
        id: u64,
        conn: Connection,
        settings: WorkerSettings,
        events: Arc<dyn PeerEvents>,
    ) -> Self {
        let Connection {
            address, stream, ..
        } = conn;
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write_half, rx, settings.framing, address.clone()));
        let reader = tokio::spawn(read_loop(id, address, read_half, settings, events));
        Self {
            id,
            settings,
            outbound,
            reader,
            writer,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue raw bytes. Write failures are logged by the writer; the reader notices dead links.
    pub fn send(&self, payload: Bytes) {
        let _ = self.outbound.send(Outbound::Payload(payload));
    }

    pub fn send_message(&self, msg: &Message) {
        match encode_message(msg) {
            Ok(bytes) => self.send(Bytes::from(bytes)),
            Err(e) => warn!(error = %e, "failed to encode message"),
        }
    }

    /// FILE_START header, a fixed pause, then the contents in chunk-sized writes.
    pub fn send_file(&self, header: &Message, contents: Bytes) {
        self.send_message(header);
        let _ = self
            .outbound
            .send(Outbound::Pause(self.settings.file_start_delay));
        let step = self.settings.read_chunk_size.max(1);
        let mut start = 0;
        while start < contents.len() {
            let end = (start + step).min(contents.len());
            self.send(contents.slice(start..end));
            start = end;
        }
    }

    /// Replay messages oldest first, spaced so a fresh peer's reads see one message each.
    pub fn send_history(&self, messages: &[Message]) {
        for (i, msg) in messages.iter().enumerate() {
            if i > 0 {
                let _ = self
                    .outbound
                    .send(Outbound::Pause(self.settings.history_spacing));
            }
            self.send_message(msg);
        }
    }

    /// Force-close: both tasks are aborted and the stream is dropped.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Wait for both tasks to finish (after `close`, or after the peer went away).
    pub async fn join(self) {
        let _ = self.reader.await;
        self.writer.abort();
        let _ = self.writer.await;
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    id: u64,
    address: String,
    mut reader: R,
    settings: WorkerSettings,
    events: Arc<dyn PeerEvents>,
) {
    let mut buf = vec![0u8; settings.read_chunk_size.max(1)];
    let mut decoder = FrameDecoder::new(settings.framing);
    let mut framer = Framer::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                info!(peer = %address, "connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %address, error = %e, "read failed");
                break;
            }
        };
        let payloads = match decoder.push(&buf[..n]) {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %address, error = %e, "bad frame; dropping connection");
                break;
            }
        };
        for payload in payloads {
            for event in framer.on_payload(&payload) {
                events.on_frame(id, &address, event).await;
            }
        }
    }
    if let Some((received, expected)) = framer.file_progress() {
        debug!(peer = %address, received, expected, "discarding partial file");
        framer.reset();
    }
    // Reported from a fresh task: the handler shuts this worker down.
    tokio::spawn(async move {
        events.on_closed(id, &address).await;
    });
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    framing: Framing,
    address: String,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Outbound::Pause(d) => tokio::time::sleep(d).await,
            Outbound::Payload(payload) => {
                let frame = match framing {
                    Framing::Legacy => payload,
                    Framing::LengthPrefixed => match encode_frame(&payload, framing) {
                        Ok(f) => Bytes::from(f),
                        Err(e) => {
                            warn!(peer = %address, error = %e, "dropping outbound payload");
                            continue;
                        }
                    },
                };
                if let Err(e) = write_flush(&mut writer, &frame).await {
                    warn!(peer = %address, error = %e, "write failed");
                }
            }
        }
    }
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
