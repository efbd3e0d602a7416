//! Chatlink wire message: flat JSON object `{author, date, text, type}`.

use serde::{Deserialize, Serialize};

/// Message kind. Encoded on the wire as an integer (`type` field).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    /// Opaque payload; also the fallback when a payload fails to parse.
    #[default]
    Bytes,
    /// Chat text.
    Text,
    /// File header: `text` = file name, `timestamp` = byte length, `author` = sender.
    FileStart,
    /// Reserved file trailer. Never produced locally; relayed opaquely.
    FileEnd,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        match kind {
            MessageKind::Bytes => 0,
            MessageKind::Text => 1,
            MessageKind::FileStart => 2,
            MessageKind::FileEnd => 3,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MessageKind::Bytes),
            1 => Ok(MessageKind::Text),
            2 => Ok(MessageKind::FileStart),
            3 => Ok(MessageKind::FileEnd),
            other => Err(format!("unknown message type {}", other)),
        }
    }
}

/// Application message. A missing `type` field decodes as [`MessageKind::Bytes`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub author: String,
    #[serde(rename = "date")]
    pub timestamp: String,
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

impl Message {
    pub fn text(
        author: impl Into<String>,
        timestamp: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            author: author.into(),
            timestamp: timestamp.into(),
            text: text.into(),
            kind: MessageKind::Text,
        }
    }

    /// FILE_START header announcing `size` bytes of `file_name` from `author`.
    pub fn file_start(author: impl Into<String>, file_name: impl Into<String>, size: u64) -> Self {
        Self {
            author: author.into(),
            timestamp: size.to_string(),
            text: file_name.into(),
            kind: MessageKind::FileStart,
        }
    }

    /// Declared byte length of a FILE_START header. `None` if the field is not a non-negative integer.
    pub fn declared_size(&self) -> Option<u64> {
        self.timestamp.trim().parse().ok()
    }

    /// Decode a whole payload. Never fails: anything that is not exactly one
    /// structured message comes back as an empty message of kind `Bytes`.
    pub fn decode(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_default()
    }

    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text
    }
}
