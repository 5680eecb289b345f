//! The typed surface this gateway consumes from the MTProto layer.
//!
//! The actual MTProto dialer (transport framing, auth-key negotiation,
//! request encryption) lives outside this workspace; everything above it is
//! programmed against the [`Mtproto`] / [`MediaSession`] traits defined here.
//! The crate also owns the pieces of that boundary that are pure data: the
//! opaque file-id codec ([`file_id`]), the [`FileLocation`] wire shapes, the
//! [`RpcError`] result sum, and JSON session-file persistence ([`SessionStore`]).
//!
//! [`emulated`] provides an in-process cluster implementing the same traits,
//! which backs every integration test and the development binary.

pub mod emulated;
pub mod file_id;

mod proto;
mod session;
mod store;

pub use file_id::{FileHandle, FileIdError, FileKind};
pub use proto::{
    DcId, ExportedAuth, FileLocation, MediaKind, MediaMessage, MediaMeta, Peer, RpcError,
};
pub use session::{MediaSession, Mtproto, SessionUser};
pub use store::{SessionData, SessionStore, StoreError};
