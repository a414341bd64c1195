use std::sync::Arc;

use opsboard::state::{AppState, DEFAULT_NOTIFY_QUEUE_CAP};
use opsboard::store::{EntityStore, MemoryStore, PgEntityStore};
use opsboard::{db, routes};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");
    let notify_queue_cap: usize = std::env::var("NOTIFY_QUEUE_CAP")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_NOTIFY_QUEUE_CAP);

    let store: Arc<dyn EntityStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = db::init_pool(&database_url).await.expect("database init failed");
            tracing::info!("using postgres entity store");
            Arc::new(PgEntityStore::new(pool))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set — using in-memory entity store");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::new(store, notify_queue_cap);
    let app = routes::app(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");
    tracing::info!(%port, "opsboard listening");
    axum::serve(listener, app).await.expect("server failed");
}
