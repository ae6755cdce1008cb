use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use kirimwa::client::RelayClientFactory;
use kirimwa::config::{Config, LogFormat};
use kirimwa::dispatch::MessageDispatcher;
#[cfg(feature = "postgres")]
use kirimwa::error::ConfigError;
use kirimwa::gateway::{AppState, GatewayConfig, GatewayServer, build_router};
use kirimwa::pairing::{PairingFlow, QrPngRenderer};
use kirimwa::session::SessionManager;
use kirimwa::store::{DeviceStore, MemoryDeviceStore};

#[derive(Parser, Debug)]
#[command(name = "kirimwa")]
#[command(about = "HTTP bridge over a single messaging session: pair by QR code, send text, log out")]
#[command(version)]
struct Cli {
    /// Address to listen on (overrides KIRIMWA_LISTEN_ADDR)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Base URL of the protocol relay (overrides KIRIMWA_RELAY_URL)
    #[arg(long)]
    relay_url: Option<String>,

    /// Keep the device identity in memory instead of PostgreSQL
    #[arg(long)]
    no_db: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// What to do when a paired device fails to reconnect: fail or repair
    #[arg(long)]
    reconnect_fallback: Option<String>,
}

impl Cli {
    fn overrides(&self) -> HashMap<&'static str, String> {
        let mut overrides = HashMap::new();
        if let Some(listen) = self.listen {
            overrides.insert("KIRIMWA_LISTEN_ADDR", listen.to_string());
        }
        if let Some(url) = &self.relay_url {
            overrides.insert("KIRIMWA_RELAY_URL", url.clone());
        }
        if let Some(fallback) = &self.reconnect_fallback {
            overrides.insert("KIRIMWA_RECONNECT_FALLBACK", fallback.clone());
        }
        if self.log_json {
            overrides.insert("KIRIMWA_LOG_FORMAT", "json".to_string());
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env(&cli.overrides())?;

    init_tracing(config.log_format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_addr,
        relay = %config.relay_url,
        "Starting kirimwa"
    );

    let store = open_store(&config, cli.no_db).await?;

    let request_timeout = config
        .session
        .connect_timeout
        .max(config.session.send_timeout)
        .max(config.session.logout_timeout);
    let factory = RelayClientFactory::new(config.relay_url.clone(), request_timeout)
        .context("failed to build relay client")?;

    let pairing = PairingFlow::new(
        Arc::new(QrPngRenderer::new(config.session.qr_size)),
        config.session.pairing_timeout,
    );
    let sessions = SessionManager::new(
        store.clone(),
        Arc::new(factory),
        pairing,
        config.session.clone(),
    );
    let dispatcher = MessageDispatcher::new(
        sessions.clone(),
        config.session.address_domain.clone(),
        config.session.send_timeout,
    );

    let app = build_router(AppState {
        sessions: sessions.clone(),
        dispatcher,
        store,
    });

    let mut server = GatewayServer::new(GatewayConfig {
        addr: config.listen_addr,
    });
    server.start(app).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    server.shutdown().await;
    sessions.shutdown().await;

    tracing::info!("Stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kirimwa=info,tower_http=info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn open_store(config: &Config, no_db: bool) -> anyhow::Result<Arc<dyn DeviceStore>> {
    if no_db {
        tracing::warn!("Running without a database; the device must be paired again after restart");
        return Ok(Arc::new(MemoryDeviceStore::new()));
    }

    #[cfg(feature = "postgres")]
    {
        let database = config
            .database
            .as_ref()
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;
        let store = kirimwa::store::PgDeviceStore::connect(database)
            .await
            .context("device store unavailable")?;
        tracing::info!("Device store ready");
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "postgres"))]
    {
        if config.database.is_some() {
            tracing::warn!("DATABASE_URL is set but the postgres feature is disabled");
        }
        Ok(Arc::new(MemoryDeviceStore::new()))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
