//! TCP frame server and request dispatch for the lobby.
//!
//! Each connection gets a reader loop plus a writer task; replies and pushed
//! events funnel through one outbound channel, so frames on the socket are
//! strictly serialized.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arcade_core::frame::{read_json, write_json};
use arcade_core::protocol::{self, Request};
use arcade_core::{ApiError, Result};
use arcade_env::Config;
use serde_json::{json, Value};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::catalog::{self, DownloadSession};
use crate::context::{LobbyContext, PlayerSession};
use crate::match_runner;
use crate::room::{self, RoomStatus};

pub struct LobbyServer {
    listener: TcpListener,
    ctx: Arc<LobbyContext>,
}

impl LobbyServer {
    pub async fn bind(config: &Config) -> anyhow::Result<Self> {
        let addr = format!(
            "{}:{}",
            config.lobby_server.bind_host, config.lobby_server.port
        );
        let listener = TcpListener::bind(&addr).await?;
        let bound_port = listener.local_addr()?.port();
        let ctx = Arc::new(LobbyContext::new(config, bound_port));
        tokio::fs::create_dir_all(ctx.run_root.join("logs")).await?;
        info!("lobby: listening on {}", listener.local_addr()?);
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                handle_connection(ctx, stream).await;
                tracing::debug!("lobby connection from {} closed", peer);
            });
        }
    }
}

struct ConnState {
    session: Option<Arc<PlayerSession>>,
    downloads: HashMap<String, DownloadSession>,
    outbound: mpsc::UnboundedSender<Value>,
}

async fn writer_task(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(frame) = rx.recv().await {
        if write_json(&mut writer, &frame).await.is_err() {
            break;
        }
    }
}

async fn handle_connection(ctx: Arc<LobbyContext>, stream: TcpStream) {
    let (mut reader, writer) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let writer_handle = tokio::spawn(writer_task(writer, outbound_rx));

    let mut state = ConnState {
        session: None,
        downloads: HashMap::new(),
        outbound,
    };
    let _ = state
        .outbound
        .send(protocol::ok(json!({"hello": "arcade_lobby_ready"})));

    loop {
        let frame = match read_json(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("lobby connection error: {}", e);
                break;
            }
        };
        let reply = match Request::from_value(frame) {
            Some(request) => match handle_request(&ctx, &mut state, &request).await {
                Ok(body) => protocol::ok(body),
                Err(e) => e.reply(),
            },
            None => ApiError::UnknownType.reply(),
        };
        if state.outbound.send(reply).is_err() {
            break;
        }
    }

    if let Some(session) = state.session.take() {
        teardown_session(&ctx, session).await;
    }
    drop(state);
    let _ = writer_handle.await;
}

/// Disconnect cleanup: drop the session, end a running match, and force the
/// player out of their room.
async fn teardown_session(ctx: &Arc<LobbyContext>, session: Arc<PlayerSession>) {
    ctx.sessions.lock().await.remove(&session.player_id);
    if let Some(room_id) = session.room_id() {
        let playing = match room::ensure_room_live(ctx, room_id).await {
            Some(room) => room.lock().await.status == RoomStatus::Playing,
            None => false,
        };
        if playing {
            match_runner::finish_match(
                ctx,
                room_id,
                Some(json!({"roomId": room_id, "reason": "disconnect", "results": []})),
            )
            .await;
        }
        room::leave_room(ctx, &session, true).await;
    }
    info!("player {} disconnected", session.player_id);
}

fn require_login(state: &ConnState) -> Result<Arc<PlayerSession>> {
    state.session.clone().ok_or(ApiError::NotLoggedIn)
}

async fn handle_request(
    ctx: &Arc<LobbyContext>,
    state: &mut ConnState,
    request: &Request,
) -> Result<Value> {
    match request.kind.as_str() {
        "player_register" => {
            let reply = ctx
                .store
                .call("PlayerUser", "register", request.data.clone())
                .await?;
            if !reply.is_ok() {
                return Err(reply.into_error("register_failed"));
            }
            Ok(reply.data())
        }
        "player_login" => handle_login(ctx, state, request).await,
        "player_logout" => {
            if let Some(session) = state.session.take() {
                teardown_session(ctx, session).await;
            }
            Ok(json!({"loggedOut": true}))
        }
        "player_list" => {
            require_login(state)?;
            catalog::handle_player_list(ctx).await
        }

        "store_list_games" => {
            require_login(state)?;
            catalog::handle_store_list_games(ctx).await
        }
        "store_game_detail" => {
            require_login(state)?;
            catalog::handle_store_game_detail(ctx, &request.data).await
        }
        "store_download_init" => {
            require_login(state)?;
            catalog::handle_download_init(ctx, &mut state.downloads, &request.data).await
        }
        "store_download_chunk" => {
            require_login(state)?;
            catalog::handle_download_chunk(&mut state.downloads, &request.data).await
        }

        "room_list" => {
            require_login(state)?;
            room::handle_room_list(ctx).await
        }
        "room_detail" => {
            require_login(state)?;
            room::handle_room_detail(ctx, &request.data).await
        }
        "room_create" => {
            let session = require_login(state)?;
            room::handle_room_create(ctx, &session, &request.data).await
        }
        "room_join" => {
            let session = require_login(state)?;
            room::handle_room_join(ctx, &session, &request.data).await
        }
        "room_leave" => {
            let session = require_login(state)?;
            room::handle_room_leave(ctx, &session).await
        }
        "room_start" => {
            let session = require_login(state)?;
            match_runner::handle_room_start(ctx, &session, &request.data).await
        }

        // Game servers post results over a fresh, unauthenticated connection.
        "post_result" => match_runner::handle_post_result(ctx, &request.data).await,

        "review_create_or_update" => {
            let session = require_login(state)?;
            catalog::handle_review_upsert(ctx, &session, &request.data).await
        }
        "match_list_mine" => {
            let session = require_login(state)?;
            catalog::handle_match_list_mine(ctx, &session).await
        }

        _ => Err(ApiError::UnknownType),
    }
}

async fn handle_login(
    ctx: &Arc<LobbyContext>,
    state: &mut ConnState,
    request: &Request,
) -> Result<Value> {
    if state.session.is_some() {
        return Err(ApiError::AlreadyOnline);
    }
    let reply = ctx
        .store
        .call("PlayerUser", "login", request.data.clone())
        .await?;
    if !reply.is_ok() {
        return Err(reply.into_error("login_failed"));
    }
    let data = reply.data();
    let player_id = data.get("playerId").and_then(Value::as_i64).unwrap_or(0);
    let username = data
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if player_id <= 0 {
        return Err(ApiError::BadCredentials);
    }

    let session = Arc::new(PlayerSession::new(
        player_id,
        username.clone(),
        state.outbound.clone(),
    ));
    {
        let mut sessions = ctx.sessions.lock().await;
        if sessions.contains_key(&player_id) {
            return Err(ApiError::AlreadyOnline);
        }
        sessions.insert(player_id, session.clone());
    }
    state.session = Some(session);
    info!("player {} logged in as {}", player_id, username);
    Ok(json!({"playerId": player_id, "username": username}))
}
