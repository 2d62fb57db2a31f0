//! Compliance attachment server
//!
//! Serves the attach/detach and purge routes over a PostgreSQL store and
//! runs the retention jobs on a timer when one is configured.

use compliance_core::compliance::ComplianceService;
use compliance_core::config::{LogFormat, Settings};
use compliance_core::db::{self, schema, PgGateway};
use compliance_core::notify::{relay::RelayNotifier, LogNotifier, Notifier};
use compliance_core::purge::scheduler::PurgeScheduler;
use compliance_core::routes::create_router;
use compliance_core::session::SessionFactory;
use compliance_core::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first so the log format is known
    let settings = Settings::load()?;
    init_tracing(settings.log_format);

    info!("Starting compliance attachment server...");

    let pool = db::create_pool(&settings.database)?;
    db::verify_pool(&pool).await?;
    info!(tls = settings.database.use_tls, "Database pool created successfully");

    if settings.database.bootstrap_schema {
        schema::create_tables(&pool).await?;
        info!("Schema bootstrap complete");
    }

    let notifier: Arc<dyn Notifier> = match &settings.relay.url {
        Some(url) => {
            info!(url = %url, "Publishing change events to relay");
            Arc::new(RelayNotifier::new(
                url.clone(),
                settings.relay.key.clone(),
                settings.sync.notify_timeout,
            )?)
        }
        None => {
            warn!("RELAY_URL not set, change events will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let sessions = SessionFactory::new(
        Arc::new(PgGateway::new(pool)),
        notifier,
        settings.sync.session_config(),
    );
    let compliance = ComplianceService::new(sessions.clone());

    let scheduler = settings.purge.interval.map(|interval| {
        info!(interval_secs = interval.as_secs(), "Purge scheduler enabled");
        PurgeScheduler::spawn(sessions, interval)
    });

    let state = Arc::new(AppState::new(compliance));
    let app = create_router(state, &settings);

    let addr = SocketAddr::from((settings.server.host, settings.server.port));
    info!("Server listening on http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,compliance_core=debug,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init(),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
