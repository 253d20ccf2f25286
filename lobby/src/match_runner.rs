//! Match lifecycle: spawning the game's server process, supervising it,
//! and collapsing the two finish signals (result callback, child exit)
//! into a single idempotent `playing -> waiting` transition.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use arcade_core::manifest::{render_argv, GameManifest};
use arcade_core::protocol::events;
use arcade_core::types::GameVersionRow;
use arcade_core::{ApiError, Result};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::{now_ts, LobbyContext, PlayerSession};
use crate::room::{ensure_room_live, fetch_room_row, RoomLive, RoomStatus};

/// Grace window for a late `post_result` after the child exits.
const RESULT_GRACE: Duration = Duration::from_millis(500);
/// How long SIGTERM gets before escalating to SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// A handle to a spawned game server.  The supervisor task owns the
/// `Child`; the room keeps the pid for signalling and an exit flag.
pub struct ChildHandle {
    pid: u32,
    exited: watch::Receiver<bool>,
}

impl ChildHandle {
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn signal(&self, sig: i32) {
        if !self.has_exited() {
            unsafe {
                libc::kill(self.pid as libc::pid_t, sig);
            }
        }
    }

    /// Terminate-then-kill with a bounded escalation wait.
    pub async fn terminate(mut self) {
        if self.has_exited() {
            return;
        }
        self.signal(libc::SIGTERM);
        let waited = tokio::time::timeout(TERM_GRACE, self.exited.wait_for(|e| *e)).await;
        let timed_out = waited.is_err();
        drop(waited);
        if timed_out {
            warn!("game process {} ignored SIGTERM, killing", self.pid);
            self.signal(libc::SIGKILL);
        }
    }
}

/// Probe the configured range for a free TCP port.
fn select_free_port(min: u16, max: u16) -> Result<u16> {
    for port in min..=max {
        if std::net::TcpListener::bind(("0.0.0.0", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(ApiError::NoFreePort)
}

fn mint_token() -> String {
    Uuid::new_v4().simple().to_string()
}

pub async fn handle_room_start(
    ctx: &Arc<LobbyContext>,
    session: &Arc<PlayerSession>,
    data: &Value,
) -> Result<Value> {
    let room_id = data
        .get("roomId")
        .and_then(Value::as_i64)
        .filter(|id| *id > 0)
        .or_else(|| session.room_id())
        .unwrap_or(0);
    if room_id <= 0 {
        return Err(ApiError::BadRoomId);
    }
    let room = ensure_room_live(ctx, room_id)
        .await
        .ok_or(ApiError::NoSuchRoom)?;
    let mut live = room.lock().await;

    if session.player_id != live.host_player_id {
        return Err(ApiError::NotHost);
    }
    if live.status == RoomStatus::Playing {
        // A room can be stuck in `playing` when the child vanished without
        // a result; recover it so the host can start again.
        match &live.child {
            None => {
                finish_locked(
                    ctx,
                    &mut live,
                    Some(json!({"roomId": room_id, "reason": "stale_state", "results": []})),
                )
                .await;
            }
            Some(child) if child.has_exited() => {
                finish_locked(
                    ctx,
                    &mut live,
                    Some(json!({"roomId": room_id, "reason": "process_exit", "results": []})),
                )
                .await;
            }
            Some(_) => return Err(ApiError::AlreadyPlaying),
        }
    }

    let row = fetch_room_row(ctx, room_id).await?;
    if (row.players.len() as i64) < row.min_players {
        return Err(ApiError::NeedMorePlayers {
            min_players: row.min_players,
        });
    }

    let reply = ctx
        .store
        .call(
            "GameVersion",
            "get_by_id",
            json!({"gameVersionId": live.game_version_id}),
        )
        .await?;
    if !reply.is_ok() {
        return Err(reply.into_error("no_version"));
    }
    let version_row: GameVersionRow =
        serde_json::from_value(reply.data()).map_err(|_| ApiError::NoVersion)?;
    let package_root = std::path::PathBuf::from(&version_row.extracted_path);
    let (manifest, _raw) = GameManifest::load_from_dir(&package_root)?;

    let port = select_free_port(ctx.game_port_min, ctx.game_port_max)?;
    let token = mint_token();

    let vars = HashMap::from([
        ("host", ctx.public_host.clone()),
        ("port", port.to_string()),
        ("token", token.clone()),
        ("roomId", room_id.to_string()),
        ("gameId", live.game_id.clone()),
        ("version", live.version.clone()),
        ("lobbyHost", ctx.internal_host.clone()),
        ("lobbyPort", ctx.port.to_string()),
    ]);
    let argv = render_argv(&manifest.entrypoints.server.argv, &vars)?;

    let child = spawn_game_server(ctx, room_id, &package_root, &manifest, &argv, &vars, row.players.len())?;
    let pid = child.id().ok_or_else(|| ApiError::SpawnFailed("no pid".into()))?;
    let (exited_tx, exited_rx) = watch::channel(false);

    live.status = RoomStatus::Playing;
    live.players = row.players.clone();
    live.token = Some(token.clone());
    live.game_port = Some(port);
    live.child = Some(ChildHandle {
        pid,
        exited: exited_rx,
    });

    match ctx
        .store
        .call(
            "Room",
            "set_status",
            json!({"roomId": room_id, "status": "playing"}),
        )
        .await
    {
        Ok(reply) if !reply.is_ok() => {
            warn!("room {}: failed to persist playing status", room_id)
        }
        Err(e) => warn!("room {}: failed to persist playing status: {}", room_id, e),
        _ => {}
    }

    info!(
        "room {}: match started on port {} (pid {})",
        room_id, port, pid
    );

    ctx.push_to_players(
        &row.players,
        events::GAME_INFO,
        json!({
            "roomId": room_id,
            "gameId": live.game_id,
            "version": live.version,
            "host": ctx.public_host,
            "port": port,
            "token": token,
        }),
    )
    .await;

    tokio::spawn(watch_game(ctx.clone(), room_id, child, exited_tx));
    Ok(json!({"started": true, "port": port}))
}

fn spawn_game_server(
    ctx: &LobbyContext,
    room_id: i64,
    package_root: &std::path::Path,
    manifest: &GameManifest,
    argv: &[String],
    vars: &HashMap<&str, String>,
    expected_players: usize,
) -> Result<Child> {
    let log_dir = ctx.run_root.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|e| ApiError::SpawnFailed(e.to_string()))?;
    let log_path = log_dir.join(format!("game_room_{}.log", room_id));
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| ApiError::SpawnFailed(e.to_string()))?;
    let log_err = log
        .try_clone()
        .map_err(|e| ApiError::SpawnFailed(e.to_string()))?;

    let module = package_root.join(&manifest.entrypoints.server.module);
    Command::new(&module)
        .args(argv)
        .current_dir(package_root)
        .env("HW3_LOBBY_HOST", &vars["lobbyHost"])
        .env("HW3_LOBBY_PORT", &vars["lobbyPort"])
        .env("HW3_ROOM_ID", &vars["roomId"])
        .env("HW3_TOKEN", &vars["token"])
        .env("HW3_GAME_ID", &vars["gameId"])
        .env("HW3_VERSION", &vars["version"])
        .env("HW3_EXPECTED_PLAYERS", expected_players.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .map_err(|e| ApiError::SpawnFailed(e.to_string()))
}

/// Supervisor task: waits for the child to exit, grants the grace window
/// for a late `post_result`, then synthesizes the finish.
async fn watch_game(
    ctx: Arc<LobbyContext>,
    room_id: i64,
    mut child: Child,
    exited_tx: watch::Sender<bool>,
) {
    let status = child.wait().await;
    let _ = exited_tx.send(true);
    info!("room {}: game process exited ({:?})", room_id, status);

    let Some(room) = ensure_room_live(&ctx, room_id).await else {
        return;
    };
    if room.lock().await.status != RoomStatus::Playing {
        return;
    }
    tokio::time::sleep(RESULT_GRACE).await;

    let mut live = room.lock().await;
    if live.status != RoomStatus::Playing {
        return;
    }
    finish_locked(
        &ctx,
        &mut live,
        Some(json!({"roomId": room_id, "reason": "process_exit", "results": []})),
    )
    .await;
}

/// Finalize a match.  Idempotent and single-effect: concurrent finishers
/// agree on one `game_ready` broadcast; a late result still appends its
/// MatchLog row without re-broadcasting.
pub async fn finish_match(ctx: &LobbyContext, room_id: i64, result: Option<Value>) {
    let Some(room) = ensure_room_live(ctx, room_id).await else {
        return;
    };
    let mut live = room.lock().await;
    finish_locked(ctx, &mut live, result).await;
}

pub async fn finish_locked(ctx: &LobbyContext, live: &mut RoomLive, result: Option<Value>) {
    let already_finished =
        live.status != RoomStatus::Playing && live.child.is_none() && live.token.is_none();
    if already_finished && result.is_none() {
        return;
    }

    if let Some(child) = live.child.take() {
        child.terminate().await;
    }

    if let Some(ref result) = result {
        persist_match_log(ctx, live, result).await;
    }

    if already_finished {
        return;
    }

    live.status = RoomStatus::Waiting;
    live.token = None;
    live.game_port = None;
    let _ = ctx
        .store
        .call(
            "Room",
            "set_status",
            json!({"roomId": live.room_id, "status": "waiting"}),
        )
        .await;

    let payload = json!({
        "roomId": live.room_id,
        "result": result.unwrap_or_else(|| json!({})),
    });
    ctx.push_to_players(&live.players, events::GAME_READY, payload)
        .await;
    info!("room {}: match finished", live.room_id);
}

async fn persist_match_log(ctx: &LobbyContext, live: &RoomLive, result: &Value) {
    let now = now_ts();
    let started_at = result
        .get("startedAt")
        .and_then(Value::as_i64)
        .unwrap_or(now);
    let ended_at = result.get("endedAt").and_then(Value::as_i64).unwrap_or(now);
    let reason = result
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("finished");
    let winner = result.get("winner").and_then(Value::as_i64);

    // The envelope records the participants, which later gates reviews.
    let results_json = json!({
        "players": live.players.iter().map(|p| json!({"userId": p})).collect::<Vec<_>>(),
        "results": result.get("results").cloned().unwrap_or_else(|| json!([])),
    });

    let reply = ctx
        .store
        .call(
            "MatchLog",
            "create",
            json!({
                "roomId": live.room_id,
                "gameDbId": live.game_db_id,
                "gameVersionId": live.game_version_id,
                "startedAt": started_at,
                "endedAt": ended_at,
                "reason": reason,
                "winnerPlayerId": winner,
                "resultsJson": results_json.to_string(),
                "participants": live.players,
            }),
        )
        .await;
    match reply {
        Ok(r) if r.is_ok() => {}
        Ok(r) => warn!(
            "room {}: match log rejected: {:?}",
            live.room_id,
            r.error_code()
        ),
        Err(e) => warn!("room {}: match log write failed: {}", live.room_id, e),
    }
}

/// The unauthenticated result callback from a spawned game server.
pub async fn handle_post_result(ctx: &LobbyContext, data: &Value) -> Result<Value> {
    let room_id = data.get("roomId").and_then(Value::as_i64).unwrap_or(0);
    if room_id <= 0 {
        return Err(ApiError::BadRoomId);
    }
    finish_match(ctx, room_id, Some(data.clone())).await;
    Ok(json!({"posted": true}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_port_is_in_range_and_bindable() {
        let port = select_free_port(41000, 41100).unwrap();
        assert!((41000..=41100).contains(&port));
        // Occupy it and probe again: the next pick must differ.
        let _hold = std::net::TcpListener::bind(("0.0.0.0", port)).unwrap();
        let other = select_free_port(41000, 41100).unwrap();
        assert_ne!(port, other);
    }

    #[test]
    fn exhausted_range_fails() {
        let hold = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = hold.local_addr().unwrap().port();
        assert_eq!(
            select_free_port(port, port).unwrap_err(),
            ApiError::NoFreePort
        );
    }

    #[test]
    fn tokens_are_128_bit_hex() {
        let token = mint_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, mint_token());
    }
}
