//! Web server - management UI and JSON API
//!
//! Provides:
//! - Mapping list, creation, deletion and retry
//! - Sync state per mapping
//! - Discovery suggestions to accept or dismiss
//!
//! The daemon runs in another process; the JSON files in the data directory
//! are the only state the two share.

pub mod routes;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::ebook::EbookParser;
use crate::models::{MappingDb, SuggestionDb, SyncStateDb};
use crate::store::JsonStore;

/// State shared across handlers
pub struct WebState {
    pub mappings: JsonStore<MappingDb>,
    pub state: JsonStore<SyncStateDb>,
    pub suggestions: JsonStore<SuggestionDb>,
    pub ebooks: EbookParser,
    pub storyteller_configured: bool,
    pub hardcover_configured: bool,
    pub started_at: Instant,
}

impl WebState {
    pub fn new(config: &Config) -> Self {
        let paths = &config.paths;
        Self {
            mappings: JsonStore::new(paths.mapping_db()),
            state: JsonStore::new(paths.state_file()),
            suggestions: JsonStore::new(paths.suggestions_file()),
            ebooks: EbookParser::new(&paths.books_dir),
            storyteller_configured: config.storyteller.api_credentials().is_some()
                || config.storyteller.db_path.exists(),
            hardcover_configured: config.hardcover.token.as_deref().map_or(false, |t| !t.is_empty()),
            started_at: Instant::now(),
        }
    }
}

pub type SharedState = Arc<RwLock<WebState>>;

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(routes::index))
        .route("/health", get(routes::health))
        .route("/api/status", get(routes::api_status))
        .route(
            "/api/mappings",
            get(routes::api_list_mappings).post(routes::api_create_mapping),
        )
        .route("/api/mappings/:abs_id", delete(routes::api_delete_mapping))
        .route("/api/mappings/:abs_id/retry", post(routes::api_retry_mapping))
        .route("/api/state", get(routes::api_state))
        .route("/api/suggestions", get(routes::api_suggestions))
        .route("/api/suggestions/:key/dismiss", post(routes::api_dismiss_suggestion))
        .route("/api/suggestions/:key/accept", post(routes::api_accept_suggestion))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(config: &Config, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(RwLock::new(WebState::new(config)));
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.web.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Web server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Web server stopped");
    Ok(())
}
