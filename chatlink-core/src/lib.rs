//! Chatlink relay protocol reference implementation.
//! Host-driven: no I/O; host feeds bytes read from a connection and receives events.

pub mod framer;
pub mod history;
pub mod integrity;
pub mod protocol;
pub mod session;
pub mod wire;

pub use framer::{FrameEvent, Framer, ReceivedFile, DEFAULT_FILE_NAME};
pub use history::{HistoryBuffer, HISTORY_CAPACITY};
pub use protocol::{Message, MessageKind};
pub use session::{SessionEvent, SessionState};
pub use wire::{
    encode_frame, encode_message, FrameDecodeError, FrameDecoder, FrameEncodeError, Framing,
    WireError,
};
