use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cv_gateway::cli::{self, Cli, Command, ConfigCommand};
use cv_gateway::{api, bootstrap};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cv_gateway=info,tower_http=info")))
        .json()
        .init();

    let cli = Cli::parse();
    let (config, config_path) = cli::load_config()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Doctor => {
            let passed = cli::doctor::run(&config, &config_path).await?;
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Validate) => {
            if !cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Show) => {
            cli::config::show(&config);
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: cv_domain::Config) -> anyhow::Result<()> {
    let errors = config.validate();
    for e in &errors {
        tracing::warn!("{e}");
    }
    if errors.iter().any(|e| e.severity == cv_domain::ConfigSeverity::Error) {
        anyhow::bail!("invalid configuration, see warnings above");
    }

    let config = Arc::new(config);
    let bootstrap::Bootstrapped { state } = bootstrap::build(config.clone())?;

    tracing::info!(
        db_path = %config.store.db_path.display(),
        host = %config.server.host,
        port = config.server.port,
        "conversation orchestrator starting"
    );

    // Resumption (§4.4): every active conversation with a registry row
    // gets its workers re-ensured before new RPCs are accepted.
    state.host.resume_from_registry().await?;
    state.host.spawn_completion_watcher();
    spawn_idempotency_sweeper(state.store.clone(), &config);

    let app = api::router(state.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, stopping agent workers");
    state.host.stop_all().await;

    Ok(())
}

/// Background sweeper (§4.3, §5): vacuums idempotency keys older than the
/// configured TTL on a fixed interval so the table doesn't grow unbounded.
fn spawn_idempotency_sweeper(store: Arc<cv_store::EventStore>, config: &cv_domain::Config) {
    let interval = std::time::Duration::from_secs(config.store.sweep_interval_secs);
    let ttl_hours = config.store.idempotency_ttl_hours;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let cutoff = chrono::Utc::now() - chrono::Duration::hours(ttl_hours);
            match store.vacuum_idempotency_keys(cutoff) {
                Ok(removed) if removed > 0 => tracing::debug!(removed, "swept expired idempotency keys"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "idempotency sweep failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
