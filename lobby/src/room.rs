//! Live room state and the join/leave/host-succession operations.
//!
//! The store is authoritative; the live cache carries the ephemeral match
//! fields (token, port, child process handle) and the last known member
//! list.  All room mutations run under the per-room lock.

use std::sync::Arc;

use arcade_core::protocol::events;
use arcade_core::types::RoomRow;
use arcade_core::{ApiError, Result};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::info;

use crate::context::{LobbyContext, PlayerSession};
use crate::match_runner::ChildHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Waiting,
    Playing,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Playing => "playing",
        }
    }

    fn from_str(s: &str) -> Self {
        if s == "playing" {
            RoomStatus::Playing
        } else {
            RoomStatus::Waiting
        }
    }
}

pub struct RoomLive {
    pub room_id: i64,
    pub host_player_id: i64,
    pub players: Vec<i64>,
    pub game_id: String,
    pub version: String,
    pub game_db_id: i64,
    pub game_version_id: i64,
    pub status: RoomStatus,
    pub token: Option<String>,
    pub game_port: Option<u16>,
    pub child: Option<ChildHandle>,
}

impl RoomLive {
    fn from_row(row: &RoomRow) -> Self {
        Self {
            room_id: row.id,
            host_player_id: row.host_player_id,
            players: row.players.clone(),
            game_id: row.game_id.clone(),
            version: row.version.clone(),
            game_db_id: row.game_db_id,
            game_version_id: row.game_version_id,
            status: RoomStatus::from_str(&row.status),
            token: None,
            game_port: None,
            child: None,
        }
    }
}

/// Fetch the authoritative room row from the store.
pub async fn fetch_room_row(ctx: &LobbyContext, room_id: i64) -> Result<RoomRow> {
    let reply = ctx
        .store
        .call("Room", "get", json!({"roomId": room_id}))
        .await?;
    if !reply.is_ok() {
        return Err(ApiError::NoSuchRoom);
    }
    serde_json::from_value(reply.data()).map_err(|_| ApiError::NoSuchRoom)
}

/// Get the live cache entry for a room, populating it from the store when
/// the lobby has not seen the room yet.
pub async fn ensure_room_live(
    ctx: &LobbyContext,
    room_id: i64,
) -> Option<Arc<Mutex<RoomLive>>> {
    if let Some(room) = ctx.rooms.lock().await.get(&room_id).cloned() {
        return Some(room);
    }
    let row = fetch_room_row(ctx, room_id).await.ok()?;
    let mut rooms = ctx.rooms.lock().await;
    let room = rooms
        .entry(room_id)
        .or_insert_with(|| Arc::new(Mutex::new(RoomLive::from_row(&row))))
        .clone();
    Some(room)
}

pub async fn handle_room_list(ctx: &LobbyContext) -> Result<Value> {
    let reply = ctx.store.call("Room", "list", json!({})).await?;
    if !reply.is_ok() {
        return Err(reply.into_error("list_failed"));
    }
    Ok(json!({"rooms": reply.field("rooms")}))
}

pub async fn handle_room_detail(ctx: &LobbyContext, data: &Value) -> Result<Value> {
    let room_id = data.get("roomId").and_then(Value::as_i64).unwrap_or(0);
    if room_id <= 0 {
        return Err(ApiError::BadRoomId);
    }
    let reply = ctx
        .store
        .call("Room", "get", json!({"roomId": room_id}))
        .await?;
    if !reply.is_ok() {
        return Err(ApiError::NoSuchRoom);
    }
    Ok(json!({"room": reply.data()}))
}

pub async fn handle_room_create(
    ctx: &LobbyContext,
    session: &Arc<PlayerSession>,
    data: &Value,
) -> Result<Value> {
    if let Some(room_id) = session.room_id() {
        return Err(ApiError::AlreadyInRoom { room_id });
    }
    let game_id = data
        .get("gameId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::MissingFields)?;

    let game = ctx
        .store
        .call("Game", "get_by_gameId", json!({"gameId": game_id}))
        .await?;
    if !game.is_ok() {
        return Err(ApiError::NoSuchGame);
    }
    let game_data = game.data();
    if game_data.get("delisted").and_then(Value::as_i64).unwrap_or(0) != 0 {
        return Err(ApiError::GameDelisted);
    }

    let latest = ctx
        .store
        .call("GameVersion", "latest_for_gameId", json!({"gameId": game_id}))
        .await?;
    if !latest.is_ok() {
        return Err(latest.into_error("no_version"));
    }
    let version_data = latest.data();

    let created = ctx
        .store
        .call(
            "Room",
            "create",
            json!({
                "hostPlayerId": session.player_id,
                "gameDbId": game_data.get("id").and_then(Value::as_i64).unwrap_or(0),
                "gameVersionId": version_data.get("id").and_then(Value::as_i64).unwrap_or(0),
            }),
        )
        .await?;
    if !created.is_ok() {
        return Err(created.into_error("room_create_failed"));
    }
    let room_id = created
        .data()
        .get("roomId")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    if ensure_room_live(ctx, room_id).await.is_some() {
        session.set_room(Some(room_id));
    }
    let version = version_data
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or_default();
    info!(
        "player {} created room {} for {} {}",
        session.player_id, room_id, game_id, version
    );
    Ok(json!({"roomId": room_id, "gameId": game_id, "version": version}))
}

pub async fn handle_room_join(
    ctx: &LobbyContext,
    session: &Arc<PlayerSession>,
    data: &Value,
) -> Result<Value> {
    if let Some(room_id) = session.room_id() {
        return Err(ApiError::AlreadyInRoom { room_id });
    }
    let room_id = data.get("roomId").and_then(Value::as_i64).unwrap_or(0);
    if room_id <= 0 {
        return Err(ApiError::BadRoomId);
    }
    let room = ensure_room_live(ctx, room_id)
        .await
        .ok_or(ApiError::NoSuchRoom)?;
    let mut live = room.lock().await;
    if live.status == RoomStatus::Playing {
        return Err(ApiError::RoomPlaying);
    }

    // The store carries the authoritative member list.
    let row = fetch_room_row(ctx, room_id).await?;
    if row.players.contains(&session.player_id) {
        // Re-login case: the membership already exists.
        live.players = row.players;
        session.set_room(Some(room_id));
        return Ok(json!({"roomId": room_id, "joined": true}));
    }
    if row.players.len() as i64 >= row.max_players {
        return Err(ApiError::RoomFull);
    }

    let added = ctx
        .store
        .call(
            "Room",
            "add_member",
            json!({"roomId": room_id, "playerId": session.player_id}),
        )
        .await?;
    if !added.is_ok() {
        return Err(added.into_error("join_failed"));
    }

    let mut players = row.players;
    players.push(session.player_id);
    live.players = players.clone();
    session.set_room(Some(room_id));

    let others: Vec<i64> = players
        .iter()
        .copied()
        .filter(|p| *p != session.player_id)
        .collect();
    ctx.push_to_players(
        &others,
        events::PLAYER_JOINED,
        json!({"roomId": room_id, "playerId": session.player_id}),
    )
    .await;
    Ok(json!({"roomId": room_id, "joined": true}))
}

/// Leave the session's room, reassigning the host and deleting the room
/// when it empties.  With `force`, a `playing` room no longer blocks the
/// leave (the disconnect path).
pub async fn leave_room(ctx: &LobbyContext, session: &Arc<PlayerSession>, force: bool) {
    let Some(room_id) = session.room_id() else {
        return;
    };
    let room = ensure_room_live(ctx, room_id).await;
    if let Some(ref room) = room {
        let mut live = room.lock().await;
        if !force && live.status == RoomStatus::Playing {
            return;
        }

        let _ = ctx
            .store
            .call(
                "Room",
                "remove_member",
                json!({"roomId": room_id, "playerId": session.player_id}),
            )
            .await;

        // Refresh the authoritative member ordering after the removal.
        let remaining = match fetch_room_row(ctx, room_id).await {
            Ok(row) => row.players,
            Err(_) => live
                .players
                .iter()
                .copied()
                .filter(|p| *p != session.player_id)
                .collect(),
        };
        live.players = remaining.clone();

        if !remaining.is_empty() && live.host_player_id == session.player_id {
            // Host succession: the earliest-joined remaining member.
            let new_host = remaining[0];
            live.host_player_id = new_host;
            let _ = ctx
                .store
                .call(
                    "Room",
                    "set_host",
                    json!({"roomId": room_id, "hostPlayerId": new_host}),
                )
                .await;
            ctx.push_to_players(
                &remaining,
                events::HOST_CHANGED,
                json!({"roomId": room_id, "hostPlayerId": new_host}),
            )
            .await;
            info!("room {}: host reassigned to {}", room_id, new_host);
        }

        ctx.push_to_players(
            &remaining,
            events::PLAYER_LEFT,
            json!({"roomId": room_id, "playerId": session.player_id}),
        )
        .await;

        if remaining.is_empty() {
            let _ = ctx
                .store
                .call("Room", "delete_if_empty", json!({"roomId": room_id}))
                .await;
            ctx.rooms.lock().await.remove(&room_id);
            info!("room {} deleted (empty)", room_id);
        }
    }
    session.set_room(None);
}

pub async fn handle_room_leave(
    ctx: &LobbyContext,
    session: &Arc<PlayerSession>,
) -> Result<Value> {
    if let Some(room_id) = session.room_id() {
        if let Some(room) = ensure_room_live(ctx, room_id).await {
            if room.lock().await.status == RoomStatus::Playing {
                return Err(ApiError::RoomPlaying);
            }
        }
    }
    leave_room(ctx, session, false).await;
    Ok(json!({"left": true}))
}
