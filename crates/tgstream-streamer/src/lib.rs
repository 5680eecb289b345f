//! The streaming engine: everything between the HTTP range adapter and the
//! typed MTProto surface.
//!
//! A [`Streamer`] owns one [`SessionRegistry`] (at most one live media
//! session per DC, with back-off tracking and single-flight creation), a
//! [`MediaCache`] of decoded file handles, and a [`FileDcMap`] memoising
//! where each file was last served from. [`Streamer::stream`] produces the
//! lazy byte sequence for a [`tgstream_range::BlockPlan`], reacting to
//! migrations, flood waits, expired references and transport drops without
//! the caller seeing anything but bytes.

mod dc_map;
mod error;
mod media_cache;
mod registry;
mod stream;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tgstream_mtproto::{file_id, DcId, Mtproto, RpcError};
use tokio::task::JoinHandle;
use tracing::debug;

pub use dc_map::{FileDcMap, MappingStats};
pub use error::StreamError;
pub use media_cache::{CachedMedia, MediaCache};
pub use registry::SessionRegistry;

/// Engine knobs. Retry budgets are fixed policy; these are the deployment-
/// dependent values.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// DC to connect the bot to first; the effective home DC is whatever the
    /// established session reports.
    pub home_dc: DcId,
    pub bot_token: String,
    /// Flood waits up to this long are slept through mid-stream; longer ones
    /// install a DC back-off and abort.
    pub flood_wait_cap: Duration,
    /// Media cache wholesale-clear interval.
    pub sweep_interval: Duration,
    /// Sanity timeout per block fetch.
    pub block_timeout: Duration,
}

impl StreamerConfig {
    pub fn new(home_dc: DcId, bot_token: impl Into<String>) -> Self {
        Self {
            home_dc,
            bot_token: bot_token.into(),
            flood_wait_cap: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30 * 60),
            block_timeout: Duration::from_secs(30),
        }
    }
}

pub(crate) struct Engine {
    pub(crate) registry: SessionRegistry,
    pub(crate) cache: MediaCache,
    pub(crate) dc_map: FileDcMap,
    pub(crate) config: StreamerConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Resolves the media behind a message: cached when possible, otherwise
    /// fetched from the home DC and decoded.
    pub(crate) async fn media(
        &self,
        chat_id: i64,
        message_id: i32,
    ) -> Result<CachedMedia, StreamError> {
        if let Some(hit) = self.cache.get(chat_id, message_id) {
            return Ok(hit);
        }
        let home = self.registry.home().ok_or(StreamError::NotReady)?;
        let message = home
            .get_message(chat_id, message_id)
            .await
            .map_err(StreamError::Upstream)?;
        let Some(message) = message else {
            return Err(StreamError::NotFound {
                chat_id,
                message_id,
            });
        };
        let handle = file_id::decode(&message.file_id)?;
        debug!(chat_id, message_id, %handle, "decoded media handle");
        let cached = CachedMedia {
            handle,
            meta: message.meta,
        };
        self.cache.insert(chat_id, message_id, cached.clone());
        Ok(cached)
    }
}

/// The engine context. Constructed once at startup and cloned into handlers;
/// tests build their own over an emulated transport.
#[derive(Clone)]
pub struct Streamer {
    pub(crate) inner: Arc<Engine>,
}

impl Streamer {
    pub fn new(transport: Arc<dyn Mtproto>, config: StreamerConfig) -> Self {
        Self {
            inner: Arc::new(Engine {
                registry: SessionRegistry::new(
                    transport,
                    config.home_dc,
                    config.bot_token.clone(),
                ),
                cache: MediaCache::default(),
                dc_map: FileDcMap::default(),
                config,
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Starts the periodic cache sweeper. Holds only a weak reference, so an
    /// abandoned engine is dropped rather than pinned by its own task.
    pub fn spawn_sweeper(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(engine) => engine.cache.clear(),
                    None => break,
                }
            }
        });
        *self.inner.sweeper.lock().unwrap() = Some(handle);
    }

    /// One attempt to bring the home session up. Callers own the retry
    /// policy (the server bootstraps in a loop around flood waits).
    pub async fn connect_home(&self) -> Result<(), RpcError> {
        self.inner.registry.start_home().await
    }

    pub fn is_ready(&self) -> bool {
        self.inner.registry.is_ready()
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &MediaCache {
        &self.inner.cache
    }

    pub fn dc_map(&self) -> &FileDcMap {
        &self.inner.dc_map
    }

    pub fn stats(&self) -> MappingStats {
        self.inner.dc_map.stats()
    }

    /// See [`Engine::media`].
    pub async fn media(
        &self,
        chat_id: i64,
        message_id: i32,
    ) -> Result<CachedMedia, StreamError> {
        self.inner.media(chat_id, message_id).await
    }

    /// Stops the sweeper and every session.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.registry.shutdown().await;
    }
}
