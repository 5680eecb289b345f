use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tgstream_mtproto::{DcId, MediaSession, Mtproto, RpcError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::StreamError;

/// Total import attempts before a foreign session is torn down.
const AUTH_IMPORT_ATTEMPTS: u32 = 6;

/// Owns at most one live media session per DC.
///
/// The home session is signed in as the bot; foreign sessions are authorized
/// by exporting from home and importing on the target. Creation is
/// single-flight per DC, and DCs under a flood-wait deadline fail fast
/// without touching the transport.
pub struct SessionRegistry {
    transport: Arc<dyn Mtproto>,
    bot_token: String,
    seed_home_dc: DcId,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    home: Option<Arc<dyn MediaSession>>,
    home_dc: Option<DcId>,
    sessions: HashMap<i32, Arc<dyn MediaSession>>,
    backoff: HashMap<i32, Instant>,
    // Per-DC creation barriers; the only locks held across an await.
    creating: HashMap<i32, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn Mtproto>, seed_home_dc: DcId, bot_token: String) -> Self {
        Self {
            transport,
            bot_token,
            seed_home_dc,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Connects and signs in the home session. One attempt; the caller owns
    /// the retry policy around flood waits.
    pub async fn start_home(&self) -> Result<(), RpcError> {
        if self.home().is_some() {
            return Ok(());
        }
        let session = self.transport.connect(self.seed_home_dc).await?;
        if let Err(err) = session.sign_in_bot(&self.bot_token).await {
            session.stop().await;
            return Err(err);
        }
        // Trust the session's own DC over the configured seed; deployments
        // get this wrong often enough that it must not be hard-coded.
        let effective_dc = session.dc_id();
        if effective_dc != self.seed_home_dc {
            warn!(
                seed = self.seed_home_dc.0,
                effective = effective_dc.0,
                "home DC differs from configured seed"
            );
        }
        let mut inner = self.inner.lock().unwrap();
        inner.home = Some(session.clone());
        inner.home_dc = Some(effective_dc);
        inner.sessions.insert(effective_dc.0, session);
        info!(dc = effective_dc.0, "home session started");
        Ok(())
    }

    pub fn home(&self) -> Option<Arc<dyn MediaSession>> {
        self.inner.lock().unwrap().home.clone()
    }

    pub fn home_dc(&self) -> Option<DcId> {
        self.inner.lock().unwrap().home_dc
    }

    pub fn is_ready(&self) -> bool {
        self.home().is_some()
    }

    /// Remaining back-off for `dc`, if a deadline is live.
    pub fn backoff_remaining(&self, dc: DcId) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        let deadline = inner.backoff.get(&dc.0)?;
        deadline.checked_duration_since(Instant::now())
    }

    /// Installs a back-off deadline `wait` from now.
    pub fn set_backoff(&self, dc: DcId, wait: Duration) {
        warn!(dc = dc.0, wait_secs = wait.as_secs(), "DC back-off installed");
        self.inner
            .lock()
            .unwrap()
            .backoff
            .insert(dc.0, Instant::now() + wait);
    }

    /// Returns the session for `dc`, creating and authorizing one if needed.
    pub async fn session(&self, dc: DcId) -> Result<Arc<dyn MediaSession>, StreamError> {
        let barrier = {
            let mut inner = self.inner.lock().unwrap();
            if inner.home_dc == Some(dc) {
                return inner.home.clone().ok_or(StreamError::NotReady);
            }
            if let Some(remaining) = backoff_remaining_locked(&inner, dc) {
                return Err(StreamError::BackoffActive { dc, remaining });
            }
            if let Some(session) = inner.sessions.get(&dc.0) {
                return Ok(session.clone());
            }
            inner
                .creating
                .entry(dc.0)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        // Single-flight: losers of the race wait here, then pick up the
        // winner's session on the re-check.
        let _guard = barrier.lock().await;
        {
            let inner = self.inner.lock().unwrap();
            if let Some(session) = inner.sessions.get(&dc.0) {
                return Ok(session.clone());
            }
            if let Some(remaining) = backoff_remaining_locked(&inner, dc) {
                return Err(StreamError::BackoffActive { dc, remaining });
            }
        }

        let session = self.create_foreign(dc).await?;
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(dc.0, session.clone());
        info!(dc = dc.0, "media session ready");
        Ok(session)
    }

    /// Opens a transport to a foreign DC and installs authorization from the
    /// home session.
    async fn create_foreign(&self, dc: DcId) -> Result<Arc<dyn MediaSession>, StreamError> {
        let home = self.home().ok_or(StreamError::NotReady)?;

        let session = match self.transport.connect(dc).await {
            Ok(session) => session,
            Err(RpcError::FloodWait { seconds }) => {
                let wait = Duration::from_secs(u64::from(seconds));
                self.set_backoff(dc, wait);
                return Err(StreamError::BackoffActive {
                    dc,
                    remaining: wait,
                });
            }
            Err(err) => return Err(StreamError::Upstream(err)),
        };

        for attempt in 1..=AUTH_IMPORT_ATTEMPTS {
            let exported = match home.export_authorization(dc).await {
                Ok(exported) => exported,
                Err(err) => {
                    session.stop().await;
                    return Err(self.auth_failure(dc, err));
                }
            };
            match session.import_authorization(&exported).await {
                Ok(()) => return Ok(session),
                Err(RpcError::AuthBytesInvalid) if attempt < AUTH_IMPORT_ATTEMPTS => {
                    debug!(dc = dc.0, attempt, "auth bytes rejected, re-exporting");
                }
                Err(err) => {
                    session.stop().await;
                    return Err(self.auth_failure(dc, err));
                }
            }
        }
        unreachable!("import loop returns on the final attempt");
    }

    fn auth_failure(&self, dc: DcId, err: RpcError) -> StreamError {
        match err {
            RpcError::FloodWait { seconds } => {
                let wait = Duration::from_secs(u64::from(seconds));
                self.set_backoff(dc, wait);
                StreamError::BackoffActive {
                    dc,
                    remaining: wait,
                }
            }
            other => StreamError::Upstream(other),
        }
    }

    /// Drops and stops the session for `dc`, forcing a reconnect next time.
    pub async fn invalidate(&self, dc: DcId) {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            if inner.home_dc == Some(dc) {
                return;
            }
            inner.sessions.remove(&dc.0)
        };
        if let Some(session) = session {
            warn!(dc = dc.0, "invalidating media session");
            session.stop().await;
        }
    }

    /// Stops every session. Called once on shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.home = None;
            inner.home_dc = None;
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.stop().await;
        }
    }
}

fn backoff_remaining_locked(inner: &Inner, dc: DcId) -> Option<Duration> {
    inner
        .backoff
        .get(&dc.0)?
        .checked_duration_since(Instant::now())
}
