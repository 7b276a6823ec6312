use routesmith::config::Config;
use routesmith::db::Database;
use routesmith::server::{ConfigServer, CONFIG_PATH, PKG_NAME, VERSION};
use routesmith::traefik::ProviderSettings;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routesmith=info".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let database = Database::open(&config.server.database_path).map_err(|e| {
        error!(path = %config.server.database_path, error = %e, "Failed to open database");
        e
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = ConfigServer::new(
        bind_addr,
        Arc::new(database),
        ProviderSettings::from_config(&config),
        shutdown_rx,
    );

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Config provider error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting config provider");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        path = CONFIG_PATH,
        database = %config.server.database_path,
        "Server configuration"
    );
    info!(
        cert_resolver = %config.traefik.cert_resolver,
        http_entrypoint = %config.traefik.http_entrypoint,
        https_entrypoint = %config.traefik.https_entrypoint,
        prefer_wildcard_cert = config.traefik.prefer_wildcard_cert,
        "Data plane settings"
    );
    info!(
        api_base_url = %config.server.internal_api_base_url(),
        resource_session_cookie = %config.badger.resource_session_cookie_name,
        session_cookie = %config.server.session_cookie_name,
        "Auth gateway settings"
    );
}
