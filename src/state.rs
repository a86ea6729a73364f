//! Server state management.
//!
//! Tracks live connections and the routing structures built on top of them
//! (presence, room membership, call sessions), plus handles to the chat
//! store and identity directory. Routing state lives in concurrent maps
//! (DashMap) and is rebuilt from scratch on restart.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::call::CallRegistry;
use crate::chat::store::{ChatStore, SqliteChatStore};
use crate::directory::{Directory, MemoryDirectory};
use crate::error::Result;
use crate::presence::PresenceRegistry;
use crate::protocol::ServerMessage;
use crate::rooms::RoomMembership;

/// Default chat history page size.
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Default retention for finished call sessions in seconds (1 hour).
const DEFAULT_CALL_RETENTION_SECS: i64 = 3600;

/// Default cleanup interval in seconds.
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// SQLite file for chat messages. `None` keeps them in memory.
    pub database_path: Option<String>,
    /// JSON file seeding the identity directory.
    pub directory_file: Option<String>,
    /// Server-side ring timeout. 0 leaves ring timeouts to the client.
    pub ring_timeout_secs: i64,
    pub call_retention_secs: i64,
    pub cleanup_interval_secs: u64,
    pub history_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database_path: None,
            directory_file: None,
            ring_timeout_secs: 0,
            call_retention_secs: DEFAULT_CALL_RETENTION_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Unique id of one live WebSocket connection.
pub type ConnectionId = String;

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// Connection ID → sender channel. Present from connect to disconnect.
    pub connections: Arc<DashMap<ConnectionId, ClientSender>>,

    pub presence: PresenceRegistry,

    pub rooms: RoomMembership,

    pub calls: CallRegistry,

    pub chat_store: Arc<dyn ChatStore>,

    pub directory: Arc<dyn Directory>,

    pub config: RelayConfig,
}

impl RelayState {
    pub fn new(
        config: RelayConfig,
        chat_store: Arc<dyn ChatStore>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            presence: PresenceRegistry::new(),
            rooms: RoomMembership::new(),
            calls: CallRegistry::new(),
            chat_store,
            directory,
            config,
        }
    }

    /// State backed by an in-memory chat database and an empty directory.
    pub fn in_memory(config: RelayConfig) -> Result<Self> {
        let store = SqliteChatStore::open(None)?;
        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(MemoryDirectory::new()),
        ))
    }

    // ── Connection Management ─────────────────────────────────────────────

    pub fn add_connection(&self, connection_id: &str, sender: ClientSender) {
        self.connections.insert(connection_id.to_string(), sender);
        tracing::debug!(conn = connection_id, "Connection added");
    }

    pub fn remove_connection(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }

    /// Deliver to one connection. False if it is gone; never an error.
    pub fn send_to_connection(&self, connection_id: &str, message: ServerMessage) -> bool {
        if let Some(sender) = self.connections.get(connection_id) {
            sender.send(message).is_ok()
        } else {
            false
        }
    }

    /// Deliver to a user's current connection, resolved now.
    pub fn send_to_user(&self, user_id: &str, message: ServerMessage) -> bool {
        match self.presence.lookup(user_id) {
            Some(connection_id) => self.send_to_connection(&connection_id, message),
            None => false,
        }
    }

    /// Deliver to every member of a room except `exclude`.
    /// Returns the number of connections that accepted the message.
    pub fn broadcast_to_room(
        &self,
        room_id: &str,
        exclude: Option<&str>,
        message: &ServerMessage,
    ) -> usize {
        self.rooms
            .members_except(room_id, exclude)
            .iter()
            .filter(|member| self.send_to_connection(member, message.clone()))
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
