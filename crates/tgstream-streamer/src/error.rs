use std::time::Duration;

use tgstream_mtproto::{DcId, FileIdError, RpcError};

/// Everything that can abort a stream or its setup, by kind.
///
/// The HTTP layer maps these onto status codes before any bytes flow; once
/// the body has started, an error simply truncates it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The message is missing or carries no media attachment.
    #[error("no streamable media in chat {chat_id} message {message_id}")]
    NotFound { chat_id: i64, message_id: i32 },

    /// The home session has not come up yet.
    #[error("home session not started")]
    NotReady,

    /// The DC is under a back-off deadline; fail fast instead of queueing.
    #[error("{dc} rate limited for another {}s", .remaining.as_secs())]
    BackoffActive { dc: DcId, remaining: Duration },

    /// The message's file-id did not decode.
    #[error("file id: {0}")]
    FileId(#[from] FileIdError),

    /// Terminal backend failure, after any applicable retries.
    #[error("backend: {0}")]
    Upstream(RpcError),

    /// Transient transport retries were exhausted.
    #[error("transport failed {attempts} times, last: {last}")]
    TransportExhausted { attempts: u32, last: String },
}
