//! Giftbox Relay Server
//!
//! The HTTP and WebSocket front end of a birthday-gift site:
//!
//! 1. **Accounts and friends**: register, log in, send and answer friend
//!    requests over a small JSON API.
//!
//! 2. **Realtime chat**: clients register a WebSocket with their session
//!    token and get messages and friend-request updates pushed as they happen.
//!    Every message is stored first; pushes are best effort and clients
//!    catch up from history after reconnecting.
//!
//! 3. **Wish pages**: upload photos, videos, voice notes and letters, write a note,
//!    and share a public page built from them.

mod api;
mod handler;
mod protocol;
mod state;

use std::path::PathBuf;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use clap::{Parser, ValueEnum};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};

/// Largest accepted request body: the biggest upload plus multipart overhead.
const MAX_UPLOAD_BODY: usize = giftbox_core::media::MAX_VIDEO_SIZE + 1024 * 1024;

const DEFAULT_LOG_FILTER: &str = "giftbox_relay=info,giftbox_core=info,tower_http=info";

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "giftbox-relay", version, about = "Giftbox HTTP and WebSocket server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "GIFTBOX_PORT")]
    port: u16,

    /// Directory for uploaded media and the default database file
    #[arg(long, default_value = "./data", env = "GIFTBOX_DATA_DIR")]
    data_dir: PathBuf,

    /// SQLite database path. Defaults to <data-dir>/giftbox.db
    #[arg(long, env = "GIFTBOX_DATABASE")]
    database: Option<String>,

    /// Session TTL in seconds
    #[arg(long, default_value_t = 24 * 3600, env = "SESSION_TTL_SECS")]
    session_ttl_secs: i64,

    /// Pending pushes buffered per connection before new ones are dropped
    #[arg(long, default_value_t = 256, env = "PUSH_QUEUE_CAPACITY")]
    push_queue_capacity: usize,

    /// How long a message write may take before the send fails
    #[arg(long, default_value_t = 5000, env = "PERSIST_TIMEOUT_MS")]
    persist_timeout_ms: u64,

    /// Cleanup interval in seconds
    #[arg(long, default_value_t = 300, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,

    /// Only allow direct messages between accepted friends
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "FRIENDS_ONLY_MESSAGING"
    )]
    friends_only_messaging: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    log_format: LogFormat,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        let database = self.database.or_else(|| {
            Some(self.data_dir.join("giftbox.db").to_string_lossy().into_owned())
        });
        RelayConfig {
            port: self.port,
            data_dir: self.data_dir,
            database,
            session_ttl_secs: self.session_ttl_secs,
            push_queue_capacity: self.push_queue_capacity,
            persist_timeout_ms: self.persist_timeout_ms,
            friends_only_messaging: self.friends_only_messaging,
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    let cleanup_interval = args.cleanup_interval_secs;
    let config = args.into_config();

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        tracing::error!(
            error = %e,
            data_dir = %config.data_dir.display(),
            "Failed to create data directory"
        );
        std::process::exit(1);
    }

    let port = config.port;
    let state = match RelayState::new(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, code = e.code(), "Failed to open Giftbox core");
            std::process::exit(1);
        }
    };

    // Spawn periodic cleanup task
    let cleanup_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            cleanup_state.cleanup_expired();
        }
    });

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Giftbox relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app(state))
        .await
        .expect("Server error");
}

/// Build the router with every route and layer.
pub(crate) fn app(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    Router::new()
        // Accounts
        .route("/api/register", post(api::register))
        .route("/api/login", post(api::login))
        .route("/api/logout", post(api::logout))
        // Friends
        .route("/api/friends", get(api::list_friends))
        .route("/api/friends/pending", get(api::list_pending))
        .route("/api/friends/outgoing", get(api::list_outgoing))
        .route("/api/friends/requests", post(api::request_friend))
        .route("/api/friends/requests/:from/respond", post(api::respond_friend))
        // Messages
        .route("/api/messages", post(api::send_message))
        .route("/api/messages/:peer", get(api::peer_history))
        .route("/api/rooms/:room/messages", get(api::room_history))
        // Media
        .route(
            "/api/media/:kind",
            get(api::list_media)
                .post(api::upload_media)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY)),
        )
        .route("/api/media/:kind/:id/poster", put(api::set_poster))
        .route("/media/:owner/:filename", get(api::serve_media))
        // Wish pages
        .route("/api/wish", put(api::set_wish))
        .route("/api/wish/:owner", get(api::wish_page))
        // Realtime
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "giftbox-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    let connections = state.core.channel.connections();
    let stats = state.core.channel.stats();
    let counts = match state.core.database.counts() {
        Ok(counts) => json!(counts),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read database counts");
            serde_json::Value::Null
        }
    };

    Json(json!({
        "online_connections": connections.connection_count(),
        "subscription_keys": connections.subscription_key_count(),
        "pushes_delivered": stats.pushed(),
        "pushes_dropped": stats.failed(),
        "active_sessions": state.sessions.len(),
        "database": counts,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    fn test_state(dir: &tempfile::TempDir) -> RelayState {
        RelayState::new(RelayConfig {
            data_dir: dir.path().to_path_buf(),
            ..RelayConfig::default()
        })
        .unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["giftbox-relay"]).unwrap();
        assert_eq!(args.port, 8080);
        assert_eq!(args.session_ttl_secs, 24 * 3600);
        assert!(args.friends_only_messaging);
        assert_eq!(args.log_format, LogFormat::Text);
    }

    #[test]
    fn test_args_into_config_defaults_database_path() {
        let args = Args::try_parse_from([
            "giftbox-relay",
            "--data-dir",
            "/tmp/giftbox",
            "--friends-only-messaging",
            "false",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.log_format, LogFormat::Json);

        let config = args.into_config();
        assert!(!config.friends_only_messaging);
        assert_eq!(config.database.as_deref(), Some("/tmp/giftbox/giftbox.db"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let body = get_json(app(test_state(&dir)), "/health").await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "giftbox-relay");
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        state
            .core
            .directory
            .register(&giftbox_core::Credentials::new("alice", "pw"))
            .unwrap();

        let body = get_json(app(state), "/stats").await;
        assert_eq!(body["online_connections"], 0);
        assert_eq!(body["active_sessions"], 0);
        assert_eq!(body["database"]["users"], 1);
    }
}
