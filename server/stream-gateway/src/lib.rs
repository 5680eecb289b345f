//! HTTP gateway that republishes backend-hosted media as streamable URLs.
//!
//! `GET /stream/{chat_id}/{message_id}` serves the media attachment of a
//! message, honouring HTTP `Range` requests by translating them into the
//! backend's block-aligned fetch API. The listener comes up immediately;
//! the bot's home session is brought up behind it and requests are answered
//! with 503 until it is ready.
//!
//! The crate is generic over the MTProto dialer: production embeds
//! [`start`] with a real transport, while the bundled binary and the test
//! suite run over [`tgstream_mtproto::emulated::EmulatedTelegram`].

mod media_type;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tgstream_mtproto::{DcId, Mtproto, RpcError};
use tgstream_streamer::{Streamer, StreamerConfig};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub use routes::{app, AppState, SERVICE_NAME};

/// Deployment configuration (see the binary for the env-var spellings).
///
/// Session persistence is a transport concern: hand the dialer a
/// `SessionStore` before calling [`start`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// Externally visible base URL, used when printing stream links.
    pub public_url: String,
    /// DC the bot connects to first; the effective home DC is read back from
    /// the established session.
    pub home_dc: DcId,
    pub bot_token: String,
    /// Mid-stream flood waits up to this long are slept through.
    pub flood_wait_cap: Duration,
}

/// Bootstrap attempts before the gateway resigns itself to serving 503s.
const BOOTSTRAP_ATTEMPTS: u32 = 3;
const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_secs(5);

/// A started gateway: HTTP listener plus the background home-session
/// bootstrap.
pub struct RunningGateway {
    addr: SocketAddr,
    streamer: Streamer,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    server_task: JoinHandle<std::io::Result<()>>,
    bootstrap_task: JoinHandle<()>,
}

impl RunningGateway {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn streamer(&self) -> &Streamer {
        &self.streamer
    }

    /// Graceful shutdown: stop accepting, drain, stop every DC session.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.bootstrap_task.abort();
        let _ = self.shutdown_tx.send(());
        self.server_task.await??;
        self.streamer.shutdown().await;
        Ok(())
    }
}

/// Binds the listener and spawns the serve loop and home-session bootstrap.
pub async fn start(
    config: GatewayConfig,
    transport: Arc<dyn Mtproto>,
) -> anyhow::Result<RunningGateway> {
    let mut engine_config = StreamerConfig::new(config.home_dc, config.bot_token.clone());
    engine_config.flood_wait_cap = config.flood_wait_cap;
    let streamer = Streamer::new(transport, engine_config);
    streamer.spawn_sweeper();

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;
    info!(%addr, url = %config.public_url, "gateway listening");

    let router = app(AppState {
        streamer: streamer.clone(),
    });
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let bootstrap_task = tokio::spawn(bootstrap_home(streamer.clone()));

    Ok(RunningGateway {
        addr,
        streamer,
        shutdown_tx,
        server_task,
        bootstrap_task,
    })
}

/// Brings the home session up behind the already-live listener, retrying
/// around flood waits the backend is fond of issuing at login.
async fn bootstrap_home(streamer: Streamer) {
    for attempt in 1..=BOOTSTRAP_ATTEMPTS {
        match streamer.connect_home().await {
            Ok(()) => {
                info!("home session ready, streaming enabled");
                return;
            }
            Err(RpcError::FloodWait { seconds }) => {
                let jitter = rand::thread_rng().gen_range(0..500);
                let wait = Duration::from_secs(u64::from(seconds))
                    + Duration::from_millis(jitter);
                warn!(attempt, seconds, "flood wait at sign-in, holding off");
                tokio::time::sleep(wait).await;
            }
            Err(err) => {
                error!(attempt, error = %err, "home session start failed");
                if attempt < BOOTSTRAP_ATTEMPTS {
                    tokio::time::sleep(BOOTSTRAP_RETRY_DELAY).await;
                }
            }
        }
    }
    error!("home session never came up; all stream requests will see 503");
}
