//! Development entry point.
//!
//! Serves the files in `--media-dir` through the full engine over the
//! in-process emulated cluster, so range handling, session management and
//! player behaviour can be exercised without backend credentials.
//! Production deployments embed [`stream_gateway::start`] with a real
//! MTProto dialer instead.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tgstream_mtproto::emulated::EmulatedTelegram;
use tgstream_mtproto::{DcId, SessionStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stream_gateway::{start, GatewayConfig};

/// Chat the dev binary files its media under.
const DEV_CHAT_ID: i64 = -1_001_000_000_001;

#[derive(Debug, Parser)]
#[command(name = "stream-gateway", about = "HTTP range gateway for backend-hosted media")]
struct Cli {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,
    /// Externally visible base URL used when printing stream links.
    #[arg(long, env = "URL", default_value = "http://localhost:8080")]
    url: String,
    /// Backend application id (unused by the emulated cluster).
    #[arg(long, env = "API_ID", default_value_t = 0)]
    api_id: i32,
    /// Backend application secret (unused by the emulated cluster).
    #[arg(long, env = "API_HASH", default_value = "", hide_env_values = true)]
    api_hash: String,
    #[arg(long, env = "BOT_TOKEN", default_value = "dev-token", hide_env_values = true)]
    bot_token: String,
    #[arg(long, env = "SESSION_DIR", default_value = "./sessions")]
    session_dir: PathBuf,
    #[arg(long, env = "HOME_DC", default_value_t = 2)]
    home_dc: i32,
    #[arg(long, env = "FLOOD_WAIT_CAP_SECS", default_value_t = 30)]
    flood_wait_cap_secs: u64,
    /// Directory whose files are loaded into the emulated cluster.
    #[arg(long, env = "MEDIA_DIR", default_value = "./media")]
    media_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let bind_addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .context("HOST/PORT do not form a bind address")?;

    info!(
        api_id = cli.api_id,
        has_api_hash = !cli.api_hash.is_empty(),
        "backend credentials loaded (ignored by the emulated cluster)"
    );
    let cluster = EmulatedTelegram::new(DcId(cli.home_dc), &cli.bot_token);
    cluster.set_session_store(SessionStore::new(&cli.session_dir));
    let served = load_media_dir(&cluster, &cli.media_dir, &cli.url)?;
    info!(
        media_dir = %cli.media_dir.display(),
        files = served,
        "emulated cluster populated"
    );

    let gateway = start(
        GatewayConfig {
            bind_addr,
            public_url: cli.url,
            home_dc: DcId(cli.home_dc),
            bot_token: cli.bot_token,
            flood_wait_cap: Duration::from_secs(cli.flood_wait_cap_secs),
        },
        Arc::new(cluster),
    )
    .await?;

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    info!("shutting down");
    gateway.shutdown().await
}

/// Loads every regular file in `dir` as a message in the dev chat and prints
/// its stream URL. Message ids are assigned in name order, starting at 1.
fn load_media_dir(
    cluster: &EmulatedTelegram,
    dir: &std::path::Path,
    base_url: &str,
) -> anyhow::Result<usize> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading media dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    for (index, path) in paths.iter().enumerate() {
        let message_id = index as i32 + 1;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let content =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        cluster.add_document(DEV_CHAT_ID, message_id, content, "application/octet-stream", &name);
        info!(
            "serving {name} at {base_url}/stream/{DEV_CHAT_ID}/{message_id}"
        );
    }
    Ok(paths.len())
}
