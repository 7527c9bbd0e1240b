//! keylink - Device authorization for detached clients
//!
//! Lets a browser or editor extension obtain a long-lived API key by pairing
//! with a browser session that is already logged in.

use anyhow::Result;
use clap::Parser;
use keylink_auth::{
    CredentialGenerator, DeviceAuthSettings, DeviceAuthorizer, FixedWindowLimiter, JsonStore,
    KeyHasher, OsRandom, SystemClock,
};
use keylink_core::{Config, Error, RateLimitPolicy};
use keylink_server::{create_router, AppState, HeaderSessionResolver};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// keylink - Pair devices with accounts and issue API keys
#[derive(Parser, Debug)]
#[command(name = "keylink")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind
    #[arg(short, long, default_value = "127.0.0.1", env = "KEYLINK_BIND")]
    bind: String,

    /// Server port
    #[arg(short, long, default_value = "8787", env = "KEYLINK_PORT")]
    port: u16,

    /// Store file (default: ~/.config/keylink/store.json)
    #[arg(short, long, env = "KEYLINK_DATA")]
    data: Option<PathBuf>,

    /// Pairing lifetime in seconds
    #[arg(long, default_value = "900", env = "KEYLINK_PAIRING_TTL")]
    pairing_ttl: u64,

    /// Initiate budget per client IP, as <max>/<seconds>
    #[arg(long, default_value = "5/60")]
    initiate_limit: RateLimitPolicy,

    /// Poll budget per client IP, as <max>/<seconds>
    #[arg(long, default_value = "30/60")]
    poll_limit: RateLimitPolicy,

    /// Approve budget per user, as <max>/<seconds>
    #[arg(long, default_value = "10/60")]
    approve_limit: RateLimitPolicy,

    /// Tag issued keys start with
    #[arg(long, default_value = "kl", env = "KEYLINK_KEY_TAG")]
    key_tag: String,

    /// Label for keys when the device does not name itself
    #[arg(long, default_value = "Browser Extension")]
    key_name: String,

    /// Header carrying the logged-in user id, set by the web app gateway
    #[arg(long, default_value = "x-keylink-user", env = "KEYLINK_SESSION_HEADER")]
    session_header: String,

    /// Use X-Forwarded-For as the client address (only behind a trusted proxy)
    #[arg(long)]
    trust_forwarded_for: bool,

    /// Seconds between expired-pairing sweeps (0 disables)
    #[arg(long, default_value = "60")]
    sweep_interval: u64,

    /// Hashing secret for API keys (default: generated next to the store file)
    #[arg(long, env = "KEYLINK_HASH_SECRET", hide_env_values = true)]
    hash_secret: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
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

    info!("keylink v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::new()
        .with_bind(args.bind)
        .with_port(args.port)
        .with_data_path(args.data)
        .with_pairing_ttl(args.pairing_ttl)
        .with_initiate_limit(args.initiate_limit)
        .with_poll_limit(args.poll_limit)
        .with_approve_limit(args.approve_limit)
        .with_api_key_tag(args.key_tag)
        .with_key_name(args.key_name)
        .with_session_header(args.session_header)
        .with_trust_forwarded_for(args.trust_forwarded_for)
        .with_sweep_interval(args.sweep_interval);
    config.validate()?;

    // Initialize storage
    let data_path = config.resolve_data_path()?;
    info!("Using store at {:?}", data_path);
    let store = Arc::new(
        JsonStore::with_path(data_path.clone())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?,
    );

    let hasher = match &args.hash_secret {
        Some(secret) => KeyHasher::new(secret.as_bytes())?,
        None => {
            let secret_path = data_path.with_file_name("hash.secret");
            KeyHasher::load_or_create(&secret_path, &OsRandom).await?
        }
    };

    let settings = DeviceAuthSettings::try_from(&config)?;
    let clock = Arc::new(SystemClock);
    let credentials =
        CredentialGenerator::new(Arc::new(OsRandom), hasher, config.api_key_tag.clone());
    let authorizer = Arc::new(DeviceAuthorizer::new(
        store.clone(),
        store.clone(),
        Arc::new(FixedWindowLimiter::new(clock.clone())),
        credentials,
        clock,
        settings,
    ));

    let sessions = Arc::new(
        HeaderSessionResolver::new(&config.session_header)
            .map_err(|e| anyhow::anyhow!("Invalid session header: {}", e))?,
    );
    if config.trust_forwarded_for {
        warn!("Client addresses taken from X-Forwarded-For; run behind a trusted proxy");
    }

    let state = Arc::new(AppState::new(
        authorizer.clone(),
        sessions,
        config.trust_forwarded_for,
    ));
    let router = create_router(state);

    // Sweep expired pairings even when no device is initiating
    let sweeper = config.sweep_interval().map(|period| {
        let authorizer = authorizer.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match authorizer.sweep_expired().await {
                    Ok(0) => {}
                    Ok(n) => debug!("Swept {} expired pairing(s)", n),
                    Err(e) => warn!("Expired pairing sweep failed: {}", e),
                }
            }
        })
    });

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid bind address {}: {}", config.bind, e)))?;
    info!("Starting server on {}...", addr);
    info!("  Pairing TTL: {}s", config.pairing_ttl().as_secs());
    info!(
        "  Limits: initiate {}, poll {}, approve {}",
        config.initiate_limit, config.poll_limit, config.approve_limit
    );
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Server(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }

    info!("Goodbye!");
    Ok(())
}
