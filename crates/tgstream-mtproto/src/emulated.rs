//! In-process emulation of a small DC cluster.
//!
//! Implements [`Mtproto`]/[`MediaSession`] over in-memory state so the whole
//! gateway can be exercised without a network: files live on a specific DC,
//! fetching them from the wrong DC migrates, stale file references expire,
//! and cross-DC authorization follows the export/import dance. Faults
//! (flood waits, transport drops, hangs) are injected per operation.
//!
//! The cluster is deliberately strict — misaligned offsets, unauthorized
//! sessions and unknown locations fail the way the real backend fails — so
//! tests catch protocol misuse, not just happy paths.

use std::collections::{HashMap, VecDeque};
use std::future::pending;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::file_id::{self, FileHandle, FileKind};
use crate::proto::{
    DcId, ExportedAuth, FileLocation, MediaKind, MediaMessage, MediaMeta, RpcError,
};
use crate::session::{MediaSession, Mtproto, SessionUser};
use crate::store::{SessionData, SessionStore};

const BOT_USER_ID: i64 = 7_000_001;
const MAX_LIMIT: u32 = 1024 * 1024;

/// One observed (and served) `GetFile` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetFileCall {
    pub dc_id: DcId,
    pub offset: u64,
    pub limit: u32,
}

#[derive(Default)]
struct Counters {
    connects: Mutex<HashMap<i32, usize>>,
    sign_ins: AtomicUsize,
    exports: AtomicUsize,
    imports: AtomicUsize,
    migrations: AtomicUsize,
    served: Mutex<Vec<GetFileCall>>,
}

struct StoredFile {
    dc: DcId,
    content: Arc<Vec<u8>>,
    reference: Bytes,
}

struct StoredMessage {
    media_id: i64,
    advertised_dc: DcId,
    meta: MediaMeta,
}

#[derive(Default)]
struct Faults {
    connect: HashMap<i32, VecDeque<RpcError>>,
    export: VecDeque<RpcError>,
    import: VecDeque<RpcError>,
    get_file: VecDeque<RpcError>,
    get_message: VecDeque<RpcError>,
    get_file_hangs: usize,
}

struct ClusterState {
    files: HashMap<i64, StoredFile>,
    messages: HashMap<(i64, i32), StoredMessage>,
    issued_auths: Vec<(DcId, i64, Bytes)>,
    next_media_id: i64,
    next_auth_id: i64,
    next_reference: u64,
    faults: Faults,
    session_store: Option<SessionStore>,
}

struct Inner {
    home_dc: DcId,
    bot_token: String,
    test_mode: bool,
    state: Mutex<ClusterState>,
    counters: Counters,
}

/// The emulated cluster. Cheap to clone; hand the same instance to the
/// gateway and to the test making assertions.
#[derive(Clone)]
pub struct EmulatedTelegram {
    inner: Arc<Inner>,
}

impl EmulatedTelegram {
    pub fn new(home_dc: DcId, bot_token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                home_dc,
                bot_token: bot_token.into(),
                test_mode: true,
                state: Mutex::new(ClusterState {
                    files: HashMap::new(),
                    messages: HashMap::new(),
                    issued_auths: Vec::new(),
                    next_media_id: 1_000,
                    next_auth_id: 1,
                    next_reference: 1,
                    faults: Faults::default(),
                    session_store: None,
                }),
                counters: Counters::default(),
            }),
        }
    }

    pub fn home_dc(&self) -> DcId {
        self.inner.home_dc
    }

    /// Enables session-file persistence; resumed sessions skip sign-in.
    pub fn set_session_store(&self, store: SessionStore) {
        self.inner.state.lock().unwrap().session_store = Some(store);
    }

    // ── media population ────────────────────────────────────────────────

    /// Stores media on `stored_on` while the minted file-id advertises
    /// `advertised_dc`; a mismatch reproduces the migration dance.
    #[allow(clippy::too_many_arguments)]
    pub fn add_media(
        &self,
        chat_id: i64,
        message_id: i32,
        kind: MediaKind,
        content: Vec<u8>,
        mime_type: Option<&str>,
        file_name: Option<&str>,
        stored_on: DcId,
        advertised_dc: DcId,
    ) -> i64 {
        let mut state = self.inner.state.lock().unwrap();
        let media_id = state.next_media_id;
        state.next_media_id += 1;
        let reference = mint_reference(state.next_reference);
        state.next_reference += 1;

        let meta = MediaMeta {
            size: content.len() as u64,
            mime_type: mime_type.map(str::to_owned),
            file_name: file_name.map(str::to_owned),
            kind,
        };
        state.files.insert(
            media_id,
            StoredFile {
                dc: stored_on,
                content: Arc::new(content),
                reference,
            },
        );
        state.messages.insert(
            (chat_id, message_id),
            StoredMessage {
                media_id,
                advertised_dc,
                meta,
            },
        );
        media_id
    }

    /// A document-kind message stored and advertised on the home DC.
    pub fn add_document(
        &self,
        chat_id: i64,
        message_id: i32,
        content: Vec<u8>,
        mime_type: &str,
        file_name: &str,
    ) -> i64 {
        self.add_media(
            chat_id,
            message_id,
            MediaKind::Document,
            content,
            Some(mime_type),
            Some(file_name),
            self.home_dc(),
            self.home_dc(),
        )
    }

    /// A video stored on a foreign DC but advertised as home: the first
    /// fetch is answered with a migration.
    pub fn add_video_on(
        &self,
        dc: DcId,
        chat_id: i64,
        message_id: i32,
        content: Vec<u8>,
        file_name: &str,
    ) -> i64 {
        self.add_media(
            chat_id,
            message_id,
            MediaKind::Video,
            content,
            Some("video/mp4"),
            Some(file_name),
            dc,
            self.home_dc(),
        )
    }

    /// Invalidates every previously minted file-id for this media: old
    /// references now expire, re-reading the message yields a fresh one.
    pub fn rotate_file_reference(&self, media_id: i64) {
        let mut state = self.inner.state.lock().unwrap();
        let next = mint_reference(state.next_reference);
        state.next_reference += 1;
        if let Some(file) = state.files.get_mut(&media_id) {
            file.reference = next;
        }
    }

    pub fn remove_message(&self, chat_id: i64, message_id: i32) {
        self.inner
            .state
            .lock()
            .unwrap()
            .messages
            .remove(&(chat_id, message_id));
    }

    // ── fault injection ─────────────────────────────────────────────────

    pub fn inject_connect_error(&self, dc: DcId, err: RpcError) {
        self.inner
            .state
            .lock()
            .unwrap()
            .faults
            .connect
            .entry(dc.0)
            .or_default()
            .push_back(err);
    }

    pub fn inject_export_error(&self, err: RpcError) {
        self.inner.state.lock().unwrap().faults.export.push_back(err);
    }

    pub fn inject_import_errors(&self, err: RpcError, count: usize) {
        let mut state = self.inner.state.lock().unwrap();
        for _ in 0..count {
            state.faults.import.push_back(err.clone());
        }
    }

    pub fn inject_get_file_error(&self, err: RpcError) {
        self.inner.state.lock().unwrap().faults.get_file.push_back(err);
    }

    pub fn inject_get_message_error(&self, err: RpcError) {
        self.inner
            .state
            .lock()
            .unwrap()
            .faults
            .get_message
            .push_back(err);
    }

    /// Makes the next `GetFile` hang forever (for timeout handling tests).
    pub fn inject_get_file_hang(&self) {
        self.inner.state.lock().unwrap().faults.get_file_hangs += 1;
    }

    // ── observability ───────────────────────────────────────────────────

    pub fn connect_count(&self, dc: DcId) -> usize {
        *self
            .inner
            .counters
            .connects
            .lock()
            .unwrap()
            .get(&dc.0)
            .unwrap_or(&0)
    }

    pub fn sign_in_count(&self) -> usize {
        self.inner.counters.sign_ins.load(Ordering::SeqCst)
    }

    pub fn export_count(&self) -> usize {
        self.inner.counters.exports.load(Ordering::SeqCst)
    }

    pub fn import_count(&self) -> usize {
        self.inner.counters.imports.load(Ordering::SeqCst)
    }

    pub fn migration_count(&self) -> usize {
        self.inner.counters.migrations.load(Ordering::SeqCst)
    }

    /// Every served (byte-yielding) `GetFile`, in arrival order.
    pub fn served_calls(&self) -> Vec<GetFileCall> {
        self.inner.counters.served.lock().unwrap().clone()
    }
}

fn message_to_media(msg: &StoredMessage, file: &StoredFile) -> MediaMessage {
    let (kind, raw_type) = match msg.meta.kind {
        MediaKind::Photo => (FileKind::Photo, file_id::TYPE_PHOTO),
        MediaKind::Video => (FileKind::Document, file_id::TYPE_VIDEO),
        MediaKind::Audio => (FileKind::Document, file_id::TYPE_AUDIO),
        MediaKind::Document => (FileKind::Document, file_id::TYPE_DOCUMENT),
    };
    let handle = FileHandle {
        kind,
        raw_type,
        dc_id: msg.advertised_dc,
        media_id: msg.media_id,
        access_hash: msg.media_id.wrapping_mul(0x5851_F42D_4C95_7F2D),
        file_reference: file.reference.clone(),
        thumb_size: String::new(),
        volume_id: matches!(kind, FileKind::Photo).then_some(msg.media_id),
        local_id: matches!(kind, FileKind::Photo).then_some(1),
        chat_id: None,
        chat_access_hash: None,
        big_photo: false,
        // Not serialised; decoding derives the canonical value.
        unique_id: String::new(),
    };
    MediaMessage {
        file_id: file_id::encode(&handle),
        meta: msg.meta.clone(),
    }
}

fn mint_reference(counter: u64) -> Bytes {
    let mut reference = Vec::with_capacity(12);
    reference.extend_from_slice(b"ref:");
    reference.extend_from_slice(&counter.to_le_bytes());
    Bytes::from(reference)
}

#[async_trait]
impl Mtproto for EmulatedTelegram {
    async fn connect(&self, dc_id: DcId) -> Result<Arc<dyn MediaSession>, RpcError> {
        let resumed = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(err) = state
                .faults
                .connect
                .get_mut(&dc_id.0)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            state
                .session_store
                .as_ref()
                .and_then(|store| store.load(dc_id).ok().flatten())
                .is_some()
        };
        *self
            .inner
            .counters
            .connects
            .lock()
            .unwrap()
            .entry(dc_id.0)
            .or_default() += 1;
        debug!(dc = dc_id.0, resumed, "emulated connect");

        Ok(Arc::new(EmulatedSession {
            cluster: self.inner.clone(),
            dc_id,
            authorized: AtomicBool::new(resumed),
            stopped: AtomicBool::new(false),
        }))
    }
}

struct EmulatedSession {
    cluster: Arc<Inner>,
    dc_id: DcId,
    authorized: AtomicBool,
    stopped: AtomicBool,
}

impl std::fmt::Debug for EmulatedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedSession")
            .field("dc_id", &self.dc_id)
            .field("authorized", &self.authorized)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl EmulatedSession {
    fn check_alive(&self) -> Result<(), RpcError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("session stopped".into()));
        }
        Ok(())
    }

    fn check_authorized(&self) -> Result<(), RpcError> {
        if !self.authorized.load(Ordering::SeqCst) {
            return Err(RpcError::Rpc {
                name: "AUTH_KEY_UNREGISTERED".into(),
                code: 401,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSession for EmulatedSession {
    fn dc_id(&self) -> DcId {
        self.dc_id
    }

    async fn sign_in_bot(&self, token: &str) -> Result<SessionUser, RpcError> {
        self.check_alive()?;
        if self.dc_id != self.cluster.home_dc {
            return Err(RpcError::Rpc {
                name: "USER_MIGRATE".into(),
                code: 303,
            });
        }
        if token != self.cluster.bot_token {
            return Err(RpcError::Rpc {
                name: "ACCESS_TOKEN_INVALID".into(),
                code: 401,
            });
        }
        self.authorized.store(true, Ordering::SeqCst);
        self.cluster.counters.sign_ins.fetch_add(1, Ordering::SeqCst);

        let state = self.cluster.state.lock().unwrap();
        if let Some(store) = state.session_store.as_ref() {
            let _ = store.save(&SessionData {
                dc_id: self.dc_id.0,
                auth_key: vec![0xA5; 32],
                test_mode: self.cluster.test_mode,
                user_id: Some(BOT_USER_ID),
                is_bot: true,
            });
        }
        Ok(SessionUser {
            user_id: BOT_USER_ID,
            is_bot: true,
        })
    }

    async fn get_message(
        &self,
        chat_id: i64,
        message_id: i32,
    ) -> Result<Option<MediaMessage>, RpcError> {
        self.check_alive()?;
        self.check_authorized()?;
        let state = &mut *self.cluster.state.lock().unwrap();
        if let Some(err) = state.faults.get_message.pop_front() {
            return Err(err);
        }
        let Some(msg) = state.messages.get(&(chat_id, message_id)) else {
            return Ok(None);
        };
        let file = state
            .files
            .get(&msg.media_id)
            .expect("message points at a stored file");
        Ok(Some(message_to_media(msg, file)))
    }

    async fn get_file(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: u32,
    ) -> Result<Bytes, RpcError> {
        self.check_alive()?;
        self.check_authorized()?;

        let hang = {
            let state = &mut *self.cluster.state.lock().unwrap();
            if state.faults.get_file_hangs > 0 {
                state.faults.get_file_hangs -= 1;
                true
            } else {
                false
            }
        };
        if hang {
            pending::<()>().await;
        }

        if let Some(err) = self
            .cluster
            .state
            .lock()
            .unwrap()
            .faults
            .get_file
            .pop_front()
        {
            return Err(err);
        }

        if offset % 4096 != 0 {
            return Err(RpcError::Rpc {
                name: "OFFSET_INVALID".into(),
                code: 400,
            });
        }
        if limit == 0 || limit % 4096 != 0 || limit > MAX_LIMIT {
            return Err(RpcError::Rpc {
                name: "LIMIT_INVALID".into(),
                code: 400,
            });
        }

        let (id, reference) = match location {
            FileLocation::Document {
                id, file_reference, ..
            }
            | FileLocation::Photo {
                id, file_reference, ..
            } => (*id, file_reference.clone()),
            FileLocation::PeerPhoto { .. } => {
                return Err(RpcError::Rpc {
                    name: "LOCATION_INVALID".into(),
                    code: 400,
                })
            }
        };

        let content = {
            let state = self.cluster.state.lock().unwrap();
            let Some(file) = state.files.get(&id) else {
                return Err(RpcError::Rpc {
                    name: "LOCATION_INVALID".into(),
                    code: 400,
                });
            };
            if file.dc != self.dc_id {
                self.cluster
                    .counters
                    .migrations
                    .fetch_add(1, Ordering::SeqCst);
                return Err(RpcError::Migrate(file.dc));
            }
            if reference != file.reference {
                return Err(RpcError::FileReferenceExpired);
            }
            file.content.clone()
        };

        self.cluster
            .counters
            .served
            .lock()
            .unwrap()
            .push(GetFileCall {
                dc_id: self.dc_id,
                offset,
                limit,
            });

        let start = (offset as usize).min(content.len());
        let end = (start + limit as usize).min(content.len());
        Ok(Bytes::copy_from_slice(&content[start..end]))
    }

    async fn export_authorization(&self, target_dc: DcId) -> Result<ExportedAuth, RpcError> {
        self.check_alive()?;
        self.check_authorized()?;
        if self.dc_id != self.cluster.home_dc {
            return Err(RpcError::Rpc {
                name: "DC_ID_INVALID".into(),
                code: 400,
            });
        }
        let state = &mut *self.cluster.state.lock().unwrap();
        if let Some(err) = state.faults.export.pop_front() {
            return Err(err);
        }
        let id = state.next_auth_id;
        state.next_auth_id += 1;
        let bytes = Bytes::from(format!("auth:{}:{}", target_dc.0, id).into_bytes());
        state.issued_auths.push((target_dc, id, bytes.clone()));
        self.cluster.counters.exports.fetch_add(1, Ordering::SeqCst);
        Ok(ExportedAuth { id, bytes })
    }

    async fn import_authorization(&self, auth: &ExportedAuth) -> Result<(), RpcError> {
        self.check_alive()?;
        let state = &mut *self.cluster.state.lock().unwrap();
        if let Some(err) = state.faults.import.pop_front() {
            return Err(err);
        }
        let valid = state
            .issued_auths
            .iter()
            .any(|(dc, id, bytes)| *dc == self.dc_id && *id == auth.id && *bytes == auth.bytes);
        if !valid {
            return Err(RpcError::AuthBytesInvalid);
        }
        self.authorized.store(true, Ordering::SeqCst);
        self.cluster.counters.imports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
