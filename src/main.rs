//! devlink - QR-based device linking server
//!
//! Opens short-lived linking sessions, serves their QR codes and streams
//! their progress to waiting clients until a device is linked.

use anyhow::{Context, Result};
use clap::Parser;
use devlink_auth::{ExpirySweeper, LinkController, Stores};
use devlink_core::{Config, ProviderKind};
use devlink_provider::CONNECTING_PAYLOAD;
use devlink_server::{create_router, qr, AppState, CreateSession, LinkService};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// devlink - Link devices by scanning a QR code
#[derive(Parser, Debug)]
#[command(name = "devlink")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags override its values
    #[arg(short, long, env = "DEVLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Server port
    #[arg(short, long, env = "DEVLINK_PORT")]
    port: Option<u16>,

    /// Public base URL embedded in static QR payloads
    #[arg(long, env = "DEVLINK_PUBLIC_URL")]
    public_url: Option<String>,

    /// Session lifetime in seconds
    #[arg(long, env = "DEVLINK_SESSION_TTL")]
    session_ttl: Option<i64>,

    /// Live pairing endpoint (ws://)
    #[arg(long, env = "DEVLINK_LIVE_ENDPOINT")]
    live_endpoint: Option<String>,

    /// Provider used when a request does not name one (static, live)
    #[arg(long, env = "DEVLINK_PROVIDER")]
    provider: Option<ProviderKind>,

    /// Stream poll interval in milliseconds
    #[arg(long, env = "DEVLINK_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Expiry sweep interval in seconds
    #[arg(long, env = "DEVLINK_SWEEP_INTERVAL")]
    sweep_interval: Option<u64>,

    /// Disable the periodic expiry sweep (reads still expire sessions)
    #[arg(long)]
    no_sweep: bool,

    /// Storage directory (default: ~/.config/devlink)
    #[arg(long, env = "DEVLINK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Keep all state in memory
    #[arg(long)]
    ephemeral: bool,

    /// Open a session for this tenant at start-up and print its QR code
    #[arg(long)]
    tenant: Option<Uuid>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Defaults, then the config file, then flags
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => Config::new(),
        };

        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(url) = &self.public_url {
            config = config.with_public_url(url.clone());
        }
        if let Some(ttl) = self.session_ttl {
            config = config.with_session_ttl_secs(ttl);
        }
        if let Some(endpoint) = &self.live_endpoint {
            config = config.with_live_endpoint(endpoint.clone());
        }
        if let Some(kind) = self.provider {
            config = config.with_default_provider(kind);
        }
        if let Some(ms) = self.poll_interval_ms {
            config = config.with_poll_interval_ms(ms);
        }
        if let Some(secs) = self.sweep_interval {
            config = config.with_sweep_interval_secs(Some(secs));
        }
        if self.no_sweep {
            config = config.with_sweep_interval_secs(None);
        }
        if let Some(dir) = &self.data_dir {
            config = config.with_data_dir(dir.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("devlink v{}", env!("CARGO_PKG_VERSION"));

    let config = args.config()?;

    // Storage
    let stores = if args.ephemeral {
        info!("Ephemeral mode: sessions and devices are kept in memory");
        Stores::in_memory()
    } else {
        let dir = match &config.data_dir {
            Some(dir) => dir.clone(),
            None => devlink_auth::storage::default_dir()?,
        };
        info!("Storage directory: {:?}", dir);
        Stores::open(&dir).await?
    };

    let controller = Arc::new(LinkController::new(stores).with_ttl(config.session_ttl()));
    let service = Arc::new(LinkService::new(controller.clone(), config.clone())?);

    info!(
        "Providers: {:?} (default {})",
        service.available_providers(),
        config.default_provider
    );

    let sweeper = config
        .sweep_interval()
        .map(|interval| ExpirySweeper::new(controller.clone(), interval).spawn());

    let state = Arc::new(AppState::new(config.clone(), service.clone()));
    let router = create_router(state);

    // Start HTTP server
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    if let Some(tenant_id) = args.tenant {
        match service
            .create_session(CreateSession {
                tenant_id,
                provider: None,
                device_info: None,
            })
            .await
        {
            Ok(session) => {
                println!();
                println!("  Scan to link a device (session {}):", session.id);
                println!();
                if session.qr_payload == CONNECTING_PAYLOAD {
                    println!("  Live provider is still connecting; the QR code will follow on the stream.");
                } else {
                    display_qr_code(&session.qr_payload);
                }
                println!();
                println!(
                    "  Expires in {}s. Follow progress at {}/api/sessions/{}/stream",
                    session.expires_in(chrono::Utc::now()),
                    config.base_url().replacen("http", "ws", 1),
                    session.id
                );
                println!();
            }
            Err(e) => warn!("Failed to open start-up session: {}", e),
        }
    }

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Goodbye!");
    Ok(())
}

/// Display a QR code in the terminal
fn display_qr_code(data: &str) {
    let rendered = match qr::render_terminal(data) {
        Ok(rendered) => rendered,
        Err(e) => {
            warn!("Failed to generate QR code: {}", e);
            return;
        }
    };

    for line in rendered.lines() {
        println!("  {}", line);
    }
}
