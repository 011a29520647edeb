use anyhow::Context;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use giftcards::api::{self, AppState};
use giftcards::config::Config;
use giftcards::db;
use giftcards::services::code_generator::SecureCodeGenerator;
use giftcards::services::holders::PgHolderDirectory;
use giftcards::services::ledger::GiftCardLedger;
use giftcards::services::mailer::{HttpMailer, LogMailer, Mailer};
use giftcards::services::notifier::{EmailComposer, NotificationDispatcher};
use giftcards::services::store::PgGiftCardStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "giftcards=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting gift card service...");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    let logo_png = match &config.company_logo_path {
        Some(path) => Some(
            tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read company logo at {}", path))?,
        ),
        None => None,
    };
    let company = config.company_info(logo_png);

    let mailer: Arc<dyn Mailer> = match (&config.mail_api_url, &config.mail_api_token) {
        (Some(url), Some(token)) => {
            tracing::info!(mail_api_url = %url, "Using HTTP mail API");
            Arc::new(HttpMailer::new(url, token.clone(), &config.mail_from))
        }
        _ => {
            tracing::warn!("Mail API not configured, notifications will only be logged");
            Arc::new(LogMailer)
        }
    };

    let (dispatcher, worker) = NotificationDispatcher::start(
        mailer,
        EmailComposer::new(company.clone()),
        config.retry_policy(),
        config.dispatcher_limits(),
    );

    let ledger = GiftCardLedger::new(
        Arc::new(PgGiftCardStore::new(pool.clone())),
        Arc::new(PgHolderDirectory::new(pool.clone())),
        Arc::new(SecureCodeGenerator::new()),
        dispatcher,
        company,
    );

    let state = AppState {
        ledger,
        pool: Some(pool),
    };

    let app = api::router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Deliver whatever is still queued before exiting
    worker.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C signal handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, cleaning up...");
}
