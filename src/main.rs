mod auth;
mod http;
mod registry;
mod types;
mod ws;

use std::sync::{atomic::AtomicUsize, Arc};

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::types::{AppState, Registry};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8000);
    let jwt_secret =
        std::env::var("CHAT_SECRET_KEY").unwrap_or_else(|_| "change-me-in-production".to_string());
    let deploy_secret = std::env::var("DEPLOY_WEBHOOK_SECRET").unwrap_or_default();
    let seed_password =
        std::env::var("SEED_AGENT_PASSWORD").unwrap_or_else(|_| "changeme".to_string());

    let state = Arc::new(AppState {
        registry: Mutex::new(Registry::default()),
        users: Mutex::new(auth::seed_users(&seed_password)),
        next_conn_id: AtomicUsize::new(0),
        jwt_secret,
        deploy_secret,
    });

    let app = Router::new()
        .route("/health", get(http::health))
        .route("/token", post(http::login))
        .route("/register", post(http::register))
        .route("/users/me", get(http::me))
        .route("/conversations", get(http::get_conversations))
        .route("/templates", get(http::get_templates))
        .route("/agents", get(http::get_agents))
        .route("/hooks/deploy", post(http::deploy_webhook))
        .route("/ws/chat", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!(%addr, "livechat server listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
