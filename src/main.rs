//! Kisan Relay Server
//!
//! Serves the call-signaling WebSocket at `/ws` and a small REST adapter
//! under `/api`. See the library crate for the moving parts.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use kisan_relay::chat::SqliteChatStore;
use kisan_relay::directory::MemoryDirectory;
use kisan_relay::{build_router, signaling, RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "kisan-relay", version, about = "Kisan call signaling and chat relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "RELAY_HOST")]
    host: String,

    /// SQLite file for chat messages. Omit to keep them in memory.
    #[arg(long, env = "CHAT_DB_PATH")]
    database: Option<String>,

    /// JSON file with `users` and `specialists` profiles to preload
    #[arg(long, env = "DIRECTORY_FILE")]
    directory_file: Option<String>,

    /// Reject unanswered calls after this many seconds (0 = never)
    #[arg(long, default_value_t = 0, env = "RING_TIMEOUT_SECS")]
    ring_timeout_secs: i64,

    /// Keep finished call sessions this long, in seconds
    #[arg(long, default_value_t = 3600, env = "CALL_RETENTION_SECS")]
    call_retention_secs: i64,

    /// Cleanup interval in seconds
    #[arg(long, default_value_t = 60, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,

    /// Default chat history page size
    #[arg(long, default_value_t = 50, env = "HISTORY_LIMIT")]
    history_limit: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            host: self.host,
            port: self.port,
            database_path: self.database,
            directory_file: self.directory_file,
            ring_timeout_secs: self.ring_timeout_secs,
            call_retention_secs: self.call_retention_secs,
            cleanup_interval_secs: self.cleanup_interval_secs,
            history_limit: self.history_limit,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kisan_relay=info,tower_http=info".into());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.into_config();

    let chat_store = SqliteChatStore::open(config.database_path.as_deref())
        .expect("Failed to open chat database");
    match config.database_path {
        Some(ref path) => tracing::info!(path = path.as_str(), "Chat database opened"),
        None => tracing::warn!("No chat database configured, messages are kept in memory"),
    }

    let directory = MemoryDirectory::new();
    if let Some(ref path) = config.directory_file {
        directory.load_from_file(Path::new(path));
    }

    let state = RelayState::new(config.clone(), Arc::new(chat_store), Arc::new(directory));

    if config.ring_timeout_secs > 0 {
        tracing::info!(secs = config.ring_timeout_secs, "Server-side ring timeout enabled");
    }

    // Spawn periodic cleanup task
    let cleanup_state = state.clone();
    let cleanup_interval = config.cleanup_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            signaling::expire_calls(&cleanup_state, chrono::Utc::now());
        }
    });

    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Kisan relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let config = Args::parse_from(["kisan-relay"]).into_config();
        let defaults = RelayConfig::default();
        assert_eq!(config.port, defaults.port);
        assert_eq!(config.host, defaults.host);
        assert_eq!(config.ring_timeout_secs, defaults.ring_timeout_secs);
        assert_eq!(config.call_retention_secs, defaults.call_retention_secs);
        assert_eq!(config.cleanup_interval_secs, defaults.cleanup_interval_secs);
        assert_eq!(config.history_limit, defaults.history_limit);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_args_override() {
        let config = Args::parse_from([
            "kisan-relay",
            "--port",
            "9000",
            "--database",
            "/var/lib/kisan/chat.db",
            "--ring-timeout-secs",
            "30",
        ])
        .into_config();
        assert_eq!(config.port, 9000);
        assert_eq!(config.database_path.as_deref(), Some("/var/lib/kisan/chat.db"));
        assert_eq!(config.ring_timeout_secs, 30);
    }
}
