use std::fmt;

use bytes::Bytes;

/// Identifier of one of the backend's data centers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DcId(pub i32);

impl fmt::Display for DcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DC{}", self.0)
    }
}

/// Peer discriminant used by chat-photo locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    User { user_id: i64, access_hash: i64 },
    Chat { chat_id: i64 },
    Channel { channel_id: i64, access_hash: i64 },
}

/// Wire-level location handed to `GetFile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLocation {
    Document {
        id: i64,
        access_hash: i64,
        file_reference: Bytes,
        thumb_size: String,
    },
    Photo {
        id: i64,
        access_hash: i64,
        file_reference: Bytes,
        thumb_size: String,
    },
    PeerPhoto {
        peer: Peer,
        volume_id: i64,
        local_id: i32,
        big: bool,
    },
}

impl FileLocation {
    /// The file reference carried by this location, if the shape has one.
    pub fn file_reference(&self) -> Option<&Bytes> {
        match self {
            FileLocation::Document { file_reference, .. }
            | FileLocation::Photo { file_reference, .. } => Some(file_reference),
            FileLocation::PeerPhoto { .. } => None,
        }
    }
}

/// Cross-DC authorization blob issued by the home DC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedAuth {
    pub id: i64,
    pub bytes: Bytes,
}

/// Message-level media classification, used for filename fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Document,
    Photo,
}

impl MediaKind {
    /// Default filename when the message carries none.
    pub fn default_file_name(self) -> &'static str {
        match self {
            MediaKind::Video => "video.mp4",
            MediaKind::Audio => "audio.mp3",
            MediaKind::Document => "document.pdf",
            MediaKind::Photo => "photo.jpg",
        }
    }
}

/// Metadata of a media attachment, as reported by the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMeta {
    pub size: u64,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub kind: MediaKind,
}

/// A message's media attachment: the opaque file-id plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMessage {
    pub file_id: String,
    pub meta: MediaMeta,
}

/// Result sum of every backend invocation.
///
/// The in-band signals (`Migrate`, `FloodWait`, `FileReferenceExpired`,
/// `AuthBytesInvalid`) drive the streaming state machine; `Rpc` and
/// `Transport` are terminal for the call and subject to the caller's retry
/// policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("file lives on {0}")]
    Migrate(DcId),
    #[error("rate limited for {seconds} s")]
    FloodWait { seconds: u32 },
    #[error("file reference expired")]
    FileReferenceExpired,
    #[error("authorization bytes rejected by target DC")]
    AuthBytesInvalid,
    #[error("rpc error {name} ({code})")]
    Rpc { name: String, code: i32 },
    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    /// Whether the error is worth retrying on the same session.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}
