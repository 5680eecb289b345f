use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::proto::{DcId, ExportedAuth, FileLocation, MediaMessage, RpcError};

/// Identity reported by the backend after a successful sign-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionUser {
    pub user_id: i64,
    pub is_bot: bool,
}

/// The MTProto dialer: everything below the typed RPC surface.
///
/// `connect` opens a transport to the given DC and runs auth-key
/// negotiation, resuming persisted session material when it has any. The
/// returned session is safe for concurrent `invoke`s; the library multiplexes
/// RPC calls internally.
#[async_trait]
pub trait Mtproto: Send + Sync + 'static {
    async fn connect(&self, dc_id: DcId) -> Result<Arc<dyn MediaSession>, RpcError>;
}

/// One live session against one DC.
///
/// All methods suspend; none of them require exclusive access. Sessions are
/// cheap handles onto the library's connection state, so cloning the `Arc`
/// and invoking from many streams at once is the intended usage.
#[async_trait]
pub trait MediaSession: Send + Sync + std::fmt::Debug + 'static {
    fn dc_id(&self) -> DcId;

    /// Authorizes this session as the bot. Home-DC only.
    async fn sign_in_bot(&self, token: &str) -> Result<SessionUser, RpcError>;

    /// Fetches a message; `None` when the message is missing or carries no
    /// media attachment.
    async fn get_message(
        &self,
        chat_id: i64,
        message_id: i32,
    ) -> Result<Option<MediaMessage>, RpcError>;

    /// One block fetch. `offset` and `limit` must satisfy the backend's
    /// 4096-alignment rules; violations surface as `Rpc` errors.
    async fn get_file(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: u32,
    ) -> Result<Bytes, RpcError>;

    /// Issues a cross-DC authorization for `target_dc`. Home-DC only.
    async fn export_authorization(&self, target_dc: DcId) -> Result<ExportedAuth, RpcError>;

    /// Installs an authorization previously exported for this DC.
    async fn import_authorization(&self, auth: &ExportedAuth) -> Result<(), RpcError>;

    /// Tears the session down. Idempotent.
    async fn stop(&self);
}
