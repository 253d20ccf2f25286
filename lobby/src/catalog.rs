//! Catalog browsing, chunked downloads, reviews and match history.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arcade_core::types::GameVersionRow;
use arcade_core::{ApiError, Result};
use base64::Engine;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use crate::context::{LobbyContext, PlayerSession};
use crate::room::ensure_room_live;

/// Raw bytes per download chunk; base64 plus the JSON envelope stays well
/// under the frame cap.
pub const MAX_CHUNK: u64 = 32 * 1024;

/// An in-flight chunked download, owned by the connection that opened it.
pub struct DownloadSession {
    pub download_id: String,
    pub zip_path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub game_id: String,
    pub version: String,
}

async fn developer_username(ctx: &LobbyContext, developer_id: i64) -> Option<String> {
    if developer_id <= 0 {
        return None;
    }
    let reply = ctx
        .store
        .call("DevUser", "get_by_id", json!({"developerId": developer_id}))
        .await
        .ok()?;
    if !reply.is_ok() {
        return None;
    }
    reply
        .data()
        .get("username")
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub async fn handle_store_list_games(ctx: &LobbyContext) -> Result<Value> {
    let reply = ctx.store.call("Game", "list_public", json!({})).await?;
    if !reply.is_ok() {
        return Err(reply.into_error("list_failed"));
    }
    let mut games = match reply.field("games") {
        Value::Array(games) => games,
        _ => vec![],
    };
    for game in games.iter_mut() {
        let developer_id = game
            .get("developerId")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        game["developerUsername"] = match developer_username(ctx, developer_id).await {
            Some(name) => json!(name),
            None => Value::Null,
        };
        let game_id = game
            .get("gameId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let latest = ctx
            .store
            .call("GameVersion", "latest_for_gameId", json!({"gameId": game_id}))
            .await?;
        if latest.is_ok() {
            let v = latest.data();
            game["latestVersion"] = v.get("version").cloned().unwrap_or(Value::Null);
            game["clientType"] = v.get("clientType").cloned().unwrap_or(Value::Null);
            game["minPlayers"] = v.get("minPlayers").cloned().unwrap_or(Value::Null);
            game["maxPlayers"] = v.get("maxPlayers").cloned().unwrap_or(Value::Null);
        } else {
            game["latestVersion"] = Value::Null;
        }
    }
    Ok(json!({"games": games}))
}

pub async fn handle_store_game_detail(ctx: &LobbyContext, data: &Value) -> Result<Value> {
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
    let mut game_data = game.data();
    let developer_id = game_data
        .get("developerId")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if let Some(name) = developer_username(ctx, developer_id).await {
        game_data["developerUsername"] = json!(name);
    }

    let latest = ctx
        .store
        .call("GameVersion", "latest_for_gameId", json!({"gameId": game_id}))
        .await?;
    let reviews = ctx
        .store
        .call("Review", "list_for_gameId", json!({"gameId": game_id}))
        .await?;
    Ok(json!({
        "game": game_data,
        "latestVersion": if latest.is_ok() { latest.data() } else { Value::Null },
        "reviews": if reviews.is_ok() { reviews.field("reviews") } else { json!([]) },
    }))
}

pub async fn handle_download_init(
    ctx: &LobbyContext,
    downloads: &mut HashMap<String, DownloadSession>,
    data: &Value,
) -> Result<Value> {
    let game_id = data
        .get("gameId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::MissingFields)?;
    let requested = data
        .get("version")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let reply = match requested {
        Some(version) => {
            ctx.store
                .call(
                    "GameVersion",
                    "get_for_gameId_version",
                    json!({"gameId": game_id, "version": version}),
                )
                .await?
        }
        None => {
            ctx.store
                .call("GameVersion", "latest_for_gameId", json!({"gameId": game_id}))
                .await?
        }
    };
    if !reply.is_ok() {
        return Err(reply.into_error("no_version"));
    }
    let row: GameVersionRow =
        serde_json::from_value(reply.data()).map_err(|_| ApiError::NoVersion)?;
    let zip_path = PathBuf::from(&row.zip_path);
    if !zip_path.exists() {
        return Err(ApiError::MissingZipOnServer);
    }

    let download_id = Uuid::new_v4().simple().to_string();
    let session = DownloadSession {
        download_id: download_id.clone(),
        zip_path,
        file_name: row.file_name.clone(),
        size_bytes: row.size_bytes,
        sha256: row.sha256.clone(),
        game_id: game_id.to_string(),
        version: row.version.clone(),
    };
    let reply = json!({
        "downloadId": download_id,
        "gameId": session.game_id,
        "version": session.version,
        "fileName": session.file_name,
        "sizeBytes": session.size_bytes,
        "sha256": session.sha256,
    });
    downloads.insert(download_id, session);
    Ok(reply)
}

pub async fn handle_download_chunk(
    downloads: &mut HashMap<String, DownloadSession>,
    data: &Value,
) -> Result<Value> {
    let download_id = data
        .get("downloadId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::BadRequest)?;
    let offset = data.get("offset").and_then(Value::as_i64).unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::BadRequest);
    }
    let offset = offset as u64;
    let limit = data
        .get("limit")
        .and_then(Value::as_u64)
        .unwrap_or(MAX_CHUNK)
        .clamp(1, MAX_CHUNK);

    let session = downloads
        .get(download_id)
        .ok_or(ApiError::NoSuchDownload)?;

    let chunk = match read_chunk(&session.zip_path, offset, limit).await {
        Ok(chunk) => chunk,
        Err(_) => {
            // A failed read invalidates the whole session.
            let id = session.download_id.clone();
            downloads.remove(&id);
            return Err(ApiError::ReadFailed);
        }
    };

    let done = offset + chunk.len() as u64 >= session.size_bytes;
    let reply = json!({
        "downloadId": download_id,
        "offset": offset,
        "dataB64": base64::engine::general_purpose::STANDARD.encode(&chunk),
        "done": done,
    });
    if done {
        downloads.remove(download_id);
    }
    Ok(reply)
}

async fn read_chunk(path: &PathBuf, offset: u64, limit: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; limit as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

pub async fn handle_review_upsert(
    ctx: &LobbyContext,
    session: &Arc<PlayerSession>,
    data: &Value,
) -> Result<Value> {
    let game_id = data
        .get("gameId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::MissingFields)?;

    // Review gating: the player must appear in at least one match of the game.
    let played = ctx
        .store
        .call(
            "MatchLog",
            "has_player_played",
            json!({"gameId": game_id, "playerId": session.player_id}),
        )
        .await?;
    if !played.is_ok() {
        return Err(played.into_error("eligibility_check_failed"));
    }
    if played.data().get("played").and_then(Value::as_bool) != Some(true) {
        return Err(ApiError::NotPlayed);
    }

    let mut payload = data.clone();
    payload["playerId"] = json!(session.player_id);
    let reply = ctx.store.call("Review", "upsert", payload).await?;
    if !reply.is_ok() {
        return Err(reply.into_error("review_failed"));
    }
    Ok(json!({}))
}

pub async fn handle_match_list_mine(
    ctx: &LobbyContext,
    session: &Arc<PlayerSession>,
) -> Result<Value> {
    let reply = ctx
        .store
        .call(
            "MatchLog",
            "list_by_player",
            json!({"playerId": session.player_id}),
        )
        .await?;
    if !reply.is_ok() {
        return Err(reply.into_error("list_failed"));
    }
    Ok(json!({"logs": reply.field("logs")}))
}

/// Online players, with their current room binding.
pub async fn handle_player_list(ctx: &LobbyContext) -> Result<Value> {
    let sessions: Vec<Arc<PlayerSession>> =
        ctx.sessions.lock().await.values().cloned().collect();
    let mut players = Vec::with_capacity(sessions.len());
    for session in sessions {
        let room_id = session.room_id();
        let mut entry = json!({
            "playerId": session.player_id,
            "username": session.username,
            "roomId": room_id,
            "roomStatus": Value::Null,
            "gameId": Value::Null,
            "version": Value::Null,
        });
        if let Some(room_id) = room_id {
            if let Some(room) = ensure_room_live(ctx, room_id).await {
                let live = room.lock().await;
                entry["roomStatus"] = json!(live.status.as_str());
                entry["gameId"] = json!(live.game_id);
                entry["version"] = json!(live.version);
            }
        }
        players.push(entry);
    }
    players.sort_by_key(|p| p["playerId"].as_i64().unwrap_or(0));
    Ok(json!({"players": players}))
}
