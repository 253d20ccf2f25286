//! Lobby runtime context and live player sessions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arcade_core::protocol;
use arcade_core::rpc::StoreClient;
use arcade_env::Config;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::room::RoomLive;

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One live player connection.  Replies and events share the outbound
/// channel, so frames on a socket are strictly serialized.
pub struct PlayerSession {
    pub player_id: i64,
    pub username: String,
    outbound: mpsc::UnboundedSender<Value>,
    room_id: std::sync::Mutex<Option<i64>>,
}

impl PlayerSession {
    pub fn new(player_id: i64, username: String, outbound: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            player_id,
            username,
            outbound,
            room_id: std::sync::Mutex::new(None),
        }
    }

    pub fn room_id(&self) -> Option<i64> {
        *self.room_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_room(&self, room_id: Option<i64>) {
        *self.room_id.lock().unwrap_or_else(|e| e.into_inner()) = room_id;
    }

    pub fn send(&self, frame: Value) {
        // Best-effort: a closed channel means the connection is going away.
        let _ = self.outbound.send(frame);
    }

    pub fn push_event(&self, name: &str, data: Value) {
        self.send(protocol::event(name, data));
    }
}

pub struct LobbyContext {
    pub store: StoreClient,
    /// Host advertised to players in `game_info`.
    pub public_host: String,
    /// Host handed to spawned game servers for the result callback.
    pub internal_host: String,
    /// The lobby's actual listening port.
    pub port: u16,
    pub run_root: PathBuf,
    pub game_port_min: u16,
    pub game_port_max: u16,
    pub sessions: Mutex<HashMap<i64, Arc<PlayerSession>>>,
    pub rooms: Mutex<HashMap<i64, Arc<Mutex<RoomLive>>>>,
}

impl LobbyContext {
    pub fn new(config: &Config, bound_port: u16) -> Self {
        Self {
            store: StoreClient::new(&config.db.host, config.db.port),
            public_host: config.game_host_public(),
            internal_host: config.lobby_server.internal_host(),
            port: bound_port,
            run_root: config.lobby_server.run_root.clone(),
            game_port_min: config.lobby_server.game_port_min,
            game_port_max: config.lobby_server.game_port_max,
            sessions: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub async fn session(&self, player_id: i64) -> Option<Arc<PlayerSession>> {
        self.sessions.lock().await.get(&player_id).cloned()
    }

    /// Push an event to one player, if online.
    pub async fn push_to_player(&self, player_id: i64, name: &str, data: Value) {
        if let Some(session) = self.session(player_id).await {
            session.push_event(name, data);
        }
    }

    /// Push the same event to a set of players.
    pub async fn push_to_players(&self, player_ids: &[i64], name: &str, data: Value) {
        let sessions = self.sessions.lock().await;
        for player_id in player_ids {
            if let Some(session) = sessions.get(player_id) {
                session.push_event(name, data.clone());
            }
        }
    }
}
