//! The block-fetch loop: one finite, single-pass byte sequence per request.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use futures_core::Stream;
use tgstream_mtproto::{FileHandle, MediaSession, RpcError};
use tgstream_range::BlockPlan;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::media_cache::CachedMedia;
use crate::{Engine, Streamer};

/// A migration may chain (the target migrates again); give up after this
/// many re-routes of the same part.
const MAX_MIGRATE_RETRIES: u32 = 3;
/// Reference refreshes per part before the expiry is treated as terminal.
const MAX_REFERENCE_REFRESHES: u32 = 2;
/// Transient transport retries per part, with linearly growing sleeps.
const MAX_TRANSPORT_RETRIES: u32 = 5;
const TRANSPORT_RETRY_STEP: Duration = Duration::from_secs(1);

impl Streamer {
    /// Produces the lazy byte sequence for `plan` over `media`'s file.
    ///
    /// Blocks are fetched in strictly increasing offset order and yielded in
    /// arrival order; back-pressure comes from the consumer, as nothing is
    /// prefetched. The sequence is not restartable: after an error item the
    /// stream is over.
    pub fn stream(
        &self,
        chat_id: i64,
        message_id: i32,
        media: CachedMedia,
        plan: BlockPlan,
    ) -> impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static {
        let engine = Arc::clone(&self.inner);
        stream! {
            let outcome = 'body: {
                let mut handle = media.handle;
                let mut session = match engine
                    .initial_session(chat_id, message_id, &handle)
                    .await
                {
                    Ok(session) => session,
                    Err(err) => break 'body Err(err),
                };
                let mut location = handle.location();

                let mut recorded = false;
                let mut part: u32 = 1;
                let mut migrate_retries = 0u32;
                let mut reference_refreshes = 0u32;
                let mut transport_failures = 0u32;
                let mut yielded: u64 = 0;

                while part <= plan.part_count {
                    let offset = plan.offset_of_part(part);
                    let result = timeout(
                        engine.config.block_timeout,
                        session.get_file(&location, offset, plan.chunk_size as u32),
                    )
                    .await
                    .unwrap_or_else(|_| {
                        Err(RpcError::Transport("block fetch timed out".into()))
                    });

                    match result {
                        Ok(chunk) => {
                            if !recorded {
                                engine.dc_map.set(chat_id, message_id, session.dc_id());
                                recorded = true;
                            }
                            let (cut_start, cut_end) = plan.trim_bounds(part, chunk.len());
                            let piece = chunk.slice(cut_start..cut_end);
                            if piece.is_empty() {
                                // Upstream ran out of bytes before the plan did.
                                warn!(
                                    chat_id,
                                    message_id,
                                    part,
                                    yielded,
                                    expected = plan.requested_len,
                                    "upstream EOF before plan completion"
                                );
                                break;
                            }
                            yielded += piece.len() as u64;
                            yield Ok(piece);
                            part += 1;
                            migrate_retries = 0;
                            reference_refreshes = 0;
                            transport_failures = 0;
                        }
                        Err(RpcError::Migrate(target)) => {
                            migrate_retries += 1;
                            if migrate_retries > MAX_MIGRATE_RETRIES {
                                break 'body Err(StreamError::Upstream(RpcError::Migrate(target)));
                            }
                            debug!(chat_id, message_id, part, target = target.0, "re-routing after migration");
                            engine.dc_map.set(chat_id, message_id, target);
                            session = match engine.registry.session(target).await {
                                Ok(session) => session,
                                Err(err) => break 'body Err(err),
                            };
                            location = handle.location();
                        }
                        Err(RpcError::FloodWait { seconds }) => {
                            let wait = Duration::from_secs(u64::from(seconds));
                            if wait <= engine.config.flood_wait_cap {
                                warn!(chat_id, message_id, part, seconds, "sleeping through flood wait");
                                sleep(wait).await;
                            } else {
                                let dc = session.dc_id();
                                engine.registry.set_backoff(dc, wait);
                                break 'body Err(StreamError::BackoffActive { dc, remaining: wait });
                            }
                        }
                        Err(RpcError::FileReferenceExpired) => {
                            reference_refreshes += 1;
                            if reference_refreshes > MAX_REFERENCE_REFRESHES {
                                break 'body Err(StreamError::Upstream(RpcError::FileReferenceExpired));
                            }
                            debug!(chat_id, message_id, part, "file reference expired, refreshing handle");
                            engine.cache.remove(chat_id, message_id);
                            handle = match engine.media(chat_id, message_id).await {
                                Ok(fresh) => fresh.handle,
                                Err(err) => break 'body Err(err),
                            };
                            location = handle.location();
                        }
                        Err(RpcError::Transport(message)) => {
                            transport_failures += 1;
                            if transport_failures > MAX_TRANSPORT_RETRIES {
                                break 'body Err(StreamError::TransportExhausted {
                                    attempts: transport_failures - 1,
                                    last: message,
                                });
                            }
                            warn!(
                                chat_id,
                                message_id,
                                part,
                                attempt = transport_failures,
                                error = %message,
                                "transport error, retrying"
                            );
                            sleep(TRANSPORT_RETRY_STEP * transport_failures).await;
                        }
                        Err(other) => {
                            break 'body Err(StreamError::Upstream(other));
                        }
                    }
                }
                debug!(chat_id, message_id, yielded, parts = plan.part_count, "stream complete");
                Ok(())
            };

            if let Err(err) = outcome {
                yield Err(err);
            }
        }
    }
}

impl Engine {
    /// Picks the session for the first fetch: the memoised DC when known,
    /// otherwise the DC the handle advertises.
    ///
    /// A back-off on the advertised DC falls back to the home session once;
    /// a back-off on a memoised DC fails fast instead, since the file is
    /// known to live there and home would only bounce us straight back.
    pub(crate) async fn initial_session(
        &self,
        chat_id: i64,
        message_id: i32,
        handle: &FileHandle,
    ) -> Result<Arc<dyn MediaSession>, StreamError> {
        let mapped = self.dc_map.get(chat_id, message_id);
        let dc = mapped.unwrap_or(handle.dc_id);
        match self.registry.session(dc).await {
            Ok(session) => Ok(session),
            Err(StreamError::BackoffActive { dc, .. }) if mapped.is_none() => {
                warn!(chat_id, message_id, dc = dc.0, "initial DC backing off, using home");
                self.registry.home().ok_or(StreamError::NotReady)
            }
            Err(err) => Err(err),
        }
    }
}
