//! Session state and the notifications a host pushes to its UI.

use std::fmt;

use crate::protocol::Message;

/// Toast shown when a dial attempt fails.
pub const TOAST_CONNECT_FAILED: &str = "Unable to connect device";
/// Toast shown when an established connection drops.
pub const TOAST_CONNECTION_LOST: &str = "Device connection was lost";

/// Connection phase of the local session. `Connected` means at least one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    None,
    Listening,
    Connecting,
    Connected,
}

impl SessionState {
    pub fn as_u8(self) -> u8 {
        match self {
            SessionState::None => 0,
            SessionState::Listening => 1,
            SessionState::Connecting => 2,
            SessionState::Connected => 3,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::None => "none",
            SessionState::Listening => "listening",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Discrete notification for the UI boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Display name of a newly registered peer.
    DeviceConnected(String),
    Toast(String),
    /// A chat message from a peer, or a synthetic "file … sent" notice.
    MessageReceived(Message),
    /// Wire bytes of a locally authored message, after it was sent.
    OutboundEcho(Vec<u8>),
}

/// Text of the notice emitted when a file finishes arriving.
pub fn file_received_text(file_name: &str) -> String {
    format!("file {} sent", file_name)
}
