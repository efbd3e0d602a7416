//! Per-connection decoder: turns payloads read off one stream into chat events.
//!
//! Host-driven like the rest of the crate. The host reads a payload (one read in
//! legacy framing, one frame otherwise), calls [`Framer::on_payload`], and acts
//! on the returned events. Nothing here fails: payloads that are not structured
//! messages come back as [`FrameEvent::Relay`].

use serde_json::Deserializer;
use tracing::{debug, warn};

use crate::protocol::{Message, MessageKind};

/// Name used when a FILE_START header carries an empty file name.
pub const DEFAULT_FILE_NAME: &str = "tmp.txt";

/// What the host should do with a decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A TEXT message: notify locally and relay to the other peers.
    Message(Message),
    /// A FILE_START header switched the connection into file-receive mode.
    FileStarted {
        file_name: String,
        author: String,
        expected_size: u64,
    },
    /// The declared byte count has arrived.
    FileReceived(ReceivedFile),
    /// Opaque bytes: forward verbatim to every other peer.
    Relay(Vec<u8>),
}

/// A completed inbound file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_name: String,
    pub author: String,
    pub data: Vec<u8>,
}

/// File-receive mode state; exists only between FILE_START and completion.
#[derive(Debug)]
struct FileReceiveState {
    expected_size: u64,
    received: u64,
    accumulator: Vec<u8>,
    file_name: String,
    author: String,
}

impl FileReceiveState {
    fn new(header: Message, expected_size: u64) -> Self {
        let file_name = if header.text.is_empty() {
            DEFAULT_FILE_NAME.to_string()
        } else {
            header.text
        };
        Self {
            expected_size,
            received: 0,
            // Declared sizes come off the wire; do not trust them for allocation.
            accumulator: Vec::with_capacity(expected_size.min(64 * 1024) as usize),
            file_name,
            author: header.author,
        }
    }

    fn is_complete(&self) -> bool {
        self.received >= self.expected_size
    }

    fn into_received(self) -> ReceivedFile {
        ReceivedFile {
            file_name: self.file_name,
            author: self.author,
            data: self.accumulator,
        }
    }
}

/// Stream decoder for one connection.
#[derive(Debug, Default)]
pub struct Framer {
    file: Option<FileReceiveState>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_receiving_file(&self) -> bool {
        self.file.is_some()
    }

    /// Bytes received so far and bytes declared, while in file-receive mode.
    pub fn file_progress(&self) -> Option<(u64, u64)> {
        self.file.as_ref().map(|f| (f.received, f.expected_size))
    }

    /// Drop any half-received file.
    pub fn reset(&mut self) {
        self.file = None;
    }

    /// Decode one payload.
    ///
    /// In file-receive mode the whole payload is file data and is never parsed.
    /// Otherwise leading JSON messages are taken in order; bytes after a
    /// FILE_START are file data, and any other unparsed tail is relayed as is.
    pub fn on_payload(&mut self, payload: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        if self.file.is_some() {
            self.accept_file_bytes(payload, &mut events);
            return events;
        }

        let mut offset = 0;
        let mut stream = Deserializer::from_slice(payload).into_iter::<Message>();
        while let Some(Ok(msg)) = stream.next() {
            let start = offset;
            let end = stream.byte_offset();
            offset = end;
            match msg.kind {
                MessageKind::Text => events.push(FrameEvent::Message(msg)),
                MessageKind::FileStart => match msg.declared_size() {
                    Some(expected_size) => {
                        let state = FileReceiveState::new(msg, expected_size);
                        debug!(
                            file = %state.file_name,
                            author = %state.author,
                            expected_size,
                            "file transfer started"
                        );
                        events.push(FrameEvent::FileStarted {
                            file_name: state.file_name.clone(),
                            author: state.author.clone(),
                            expected_size,
                        });
                        self.file = Some(state);
                        self.accept_file_bytes(&payload[end..], &mut events);
                        return events;
                    }
                    None => {
                        warn!(size = %msg.timestamp, "FILE_START with invalid size; relaying as bytes");
                        events.push(FrameEvent::Relay(payload[start..end].to_vec()));
                    }
                },
                MessageKind::Bytes | MessageKind::FileEnd => {
                    events.push(FrameEvent::Relay(payload[start..end].to_vec()));
                }
            }
        }

        // Whitespace after a decoded message is separator, not payload.
        let rest = &payload[offset..];
        let separator = offset > 0 && rest.iter().all(u8::is_ascii_whitespace);
        if !rest.is_empty() && !separator {
            events.push(FrameEvent::Relay(rest.to_vec()));
        }
        events
    }

    fn accept_file_bytes(&mut self, bytes: &[u8], events: &mut Vec<FrameEvent>) {
        let Some(state) = self.file.as_mut() else {
            return;
        };
        state.accumulator.extend_from_slice(bytes);
        state.received += bytes.len() as u64;
        if state.is_complete() {
            if let Some(done) = self.file.take() {
                events.push(FrameEvent::FileReceived(done.into_received()));
            }
        }
    }
}
