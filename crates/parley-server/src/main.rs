use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};

use parley_db::Database;
use parley_gateway::auth::JwtVerifier;
use parley_gateway::connection::Heartbeat;
use parley_gateway::registry::ConnectionRegistry;
use parley_gateway::router::MessageRouter;
use parley_gateway::store::SqliteStore;
use parley_server::config::Config;
use parley_server::routes::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            error!("Set it in your .env file and restart.");
            std::process::exit(1);
        }
    };

    let db = Arc::new(Database::open(&config.db_path)?);
    info!(path = %config.db_path.display(), "Database ready");

    let router = MessageRouter::new(
        Arc::new(SqliteStore::new(db)),
        ConnectionRegistry::new(),
        config.typing_timeout,
    );

    let state = AppState {
        router: router.clone(),
        verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
        heartbeat: Heartbeat {
            interval: config.heartbeat_interval,
            ..Heartbeat::default()
        },
    };
    let app = routes::build_router(state);

    let addr: SocketAddr = config.bind_addr().parse()?;
    info!("Parley gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received");
            // Closes every live socket and cancels pending typing timers
            router.shutdown();
        })
        .await?;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
