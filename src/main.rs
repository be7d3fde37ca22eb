use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use llemmy::agent::OllamaClient;
use llemmy::config::AppConfig;
use llemmy::db::{ConversationRepository, MessageRepository, PgMessageSink};
use llemmy::routes;
use llemmy::service::ChatService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llemmy=debug,tower_http=debug".into()),
        )
        .init();

    let config = AppConfig::from_env().context("Invalid configuration")?;

    // ── Model server ──────────────────────────────────────────────────────────
    let client = OllamaClient::new(config.ollama.clone()).context("Failed to build the Ollama client")?;
    info!("Using model '{}' at {}", client.config().model, client.config().base_url());
    let mut chat_service = ChatService::new(Arc::new(client), config.user_name.clone(), config.system_prompt.clone());

    // ── Database (optional) ───────────────────────────────────────────────────
    match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("Failed to connect to PostgreSQL")?;

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run database migrations")?;

            info!("Database connection established and migrations applied");

            let conversation_repo = ConversationRepository::new(pool.clone());
            let message_repo = MessageRepository::new(pool);
            let sink = PgMessageSink::spawn(conversation_repo.clone(), message_repo.clone());
            chat_service = chat_service.with_persistence(conversation_repo, message_repo, sink);
        }
        None => warn!("DATABASE_URL not set; conversations will not be stored"),
    }

    // ── Listen ────────────────────────────────────────────────────────────────
    let app = routes::router(chat_service);
    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}
