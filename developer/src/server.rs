//! TCP frame server and request dispatch for the developer service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arcade_core::frame::{read_json, write_json};
use arcade_core::protocol::{self, Request};
use arcade_core::rpc::StoreReply;
use arcade_core::{ApiError, Result};
use arcade_env::Config;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::context::{DevContext, DevSession};
use crate::upload::{self, UploadSession};

pub struct DeveloperServer {
    listener: TcpListener,
    ctx: Arc<DevContext>,
}

impl DeveloperServer {
    pub async fn bind(config: &Config) -> anyhow::Result<Self> {
        let ctx = DevContext::new(config);
        tokio::fs::create_dir_all(&ctx.upload_root).await?;
        tokio::fs::create_dir_all(&ctx.tmp_root).await?;
        let addr = format!(
            "{}:{}",
            config.developer_server.bind_host, config.developer_server.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!(
            "developer: listening on {}, upload root {:?}",
            listener.local_addr()?,
            ctx.upload_root
        );
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
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
                tracing::debug!("developer connection from {} closed", peer);
            });
        }
    }
}

#[derive(Default)]
struct ConnState {
    session: Option<DevSession>,
    uploads: HashMap<String, UploadSession>,
}

async fn handle_connection(ctx: Arc<DevContext>, mut stream: TcpStream) {
    let mut state = ConnState::default();
    loop {
        let frame = match read_json(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("developer connection error: {}", e);
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
        if write_json(&mut stream, &reply).await.is_err() {
            break;
        }
    }
    disconnect_cleanup(&ctx, &mut state).await;
}

async fn disconnect_cleanup(ctx: &DevContext, state: &mut ConnState) {
    if let Some(session) = state.session.take() {
        ctx.online.lock().await.remove(&session.developer_id);
    }
    for (_, upload) in state.uploads.drain() {
        upload.discard().await;
    }
}

fn require_login(state: &ConnState) -> Result<DevSession> {
    state.session.clone().ok_or(ApiError::NotLoggedIn)
}

/// Relay a failed Game lookup, folding the store's `not_found` into the
/// public `no_such_game` code.
fn relay_game_error(reply: StoreReply) -> ApiError {
    if reply.error_code() == Some("not_found") {
        ApiError::NoSuchGame
    } else {
        reply.into_error("no_such_game")
    }
}

async fn handle_request(
    ctx: &DevContext,
    state: &mut ConnState,
    request: &Request,
) -> Result<Value> {
    match request.kind.as_str() {
        "dev_register" => {
            let reply = ctx
                .store
                .call("DevUser", "register", request.data.clone())
                .await?;
            if !reply.is_ok() {
                return Err(reply.into_error("register_failed"));
            }
            Ok(reply.data())
        }
        "dev_login" => handle_login(ctx, state, request).await,
        "dev_logout" => {
            if let Some(session) = state.session.take() {
                ctx.online.lock().await.remove(&session.developer_id);
            }
            for (_, upload) in state.uploads.drain() {
                upload.discard().await;
            }
            Ok(json!({"loggedOut": true}))
        }
        "game_list_mine" => {
            let session = require_login(state)?;
            let reply = ctx
                .store
                .call(
                    "Game",
                    "list_by_dev",
                    json!({"developerId": session.developer_id}),
                )
                .await?;
            if !reply.is_ok() {
                return Err(reply.into_error("list_failed"));
            }
            let mut games = match reply.field("games") {
                Value::Array(games) => games,
                _ => vec![],
            };
            for game in games.iter_mut() {
                attach_latest_version(ctx, game).await?;
            }
            Ok(json!({"games": games}))
        }
        "game_delist" => {
            let session = require_login(state)?;
            let game_id = request.str_field("gameId").ok_or(ApiError::MissingFields)?;
            let delisted = request.bool_field("delisted");
            if delisted {
                let active = ctx
                    .store
                    .call("Room", "has_playing_for_gameId", json!({"gameId": game_id}))
                    .await?;
                if active.is_ok()
                    && active.data().get("playing").and_then(Value::as_bool) == Some(true)
                {
                    return Err(ApiError::GameInProgress);
                }
            }
            let reply = ctx
                .store
                .call(
                    "Game",
                    "set_delisted",
                    json!({
                        "gameId": game_id,
                        "delisted": delisted,
                        "developerId": session.developer_id,
                    }),
                )
                .await?;
            if !reply.is_ok() {
                return Err(relay_game_error(reply));
            }
            Ok(json!({}))
        }
        "game_list_versions" => {
            let session = require_login(state)?;
            let game_id = request.str_field("gameId").ok_or(ApiError::MissingFields)?;
            let game = ctx
                .store
                .call("Game", "get_by_gameId", json!({"gameId": game_id}))
                .await?;
            if !game.is_ok() {
                return Err(relay_game_error(game));
            }
            let owner = game.data().get("developerId").and_then(Value::as_i64);
            if owner != Some(session.developer_id) {
                return Err(ApiError::NotOwner);
            }
            let versions = ctx
                .store
                .call("GameVersion", "list_for_gameId", json!({"gameId": game_id}))
                .await?;
            if !versions.is_ok() {
                return Err(versions.into_error("list_failed"));
            }
            Ok(json!({"gameId": game_id, "versions": versions.field("versions")}))
        }
        "game_upload_init" => {
            let session = require_login(state)?;
            let (upload, reply) = upload::handle_init(ctx, &session, &request.data).await?;
            state.uploads.insert(upload.upload_id.clone(), upload);
            Ok(reply)
        }
        "game_upload_chunk" => {
            let session = require_login(state)?;
            let upload_id = request.str_field("uploadId").ok_or(ApiError::NoSuchUpload)?;
            let upload = state
                .uploads
                .get_mut(&upload_id)
                .ok_or(ApiError::NoSuchUpload)?;
            if upload.developer_id != session.developer_id {
                return Err(ApiError::NotOwner);
            }
            let (chunk, reply) = upload::handle_chunk(upload, &request.data)?;
            if let Err(e) = upload::append_chunk(upload, &chunk).await {
                // The temp file is unusable; drop the whole upload.
                if let Some(upload) = state.uploads.remove(&upload_id) {
                    upload.discard().await;
                }
                return Err(e);
            }
            Ok(reply)
        }
        "game_upload_finish" => {
            let session = require_login(state)?;
            let upload_id = request.str_field("uploadId").ok_or(ApiError::NoSuchUpload)?;
            let owner = state
                .uploads
                .get(&upload_id)
                .map(|u| u.developer_id)
                .ok_or(ApiError::NoSuchUpload)?;
            if owner != session.developer_id {
                return Err(ApiError::NotOwner);
            }
            let upload = state
                .uploads
                .remove(&upload_id)
                .ok_or(ApiError::NoSuchUpload)?;
            upload::handle_finish(ctx, upload, &request.data).await
        }
        _ => Err(ApiError::UnknownType),
    }
}

async fn handle_login(ctx: &DevContext, state: &mut ConnState, request: &Request) -> Result<Value> {
    if let Some(old) = state.session.take() {
        ctx.online.lock().await.remove(&old.developer_id);
    }
    let reply = ctx
        .store
        .call("DevUser", "login", request.data.clone())
        .await?;
    if !reply.is_ok() {
        return Err(reply.into_error("login_failed"));
    }
    let data = reply.data();
    let developer_id = data.get("developerId").and_then(Value::as_i64).unwrap_or(0);
    let username = data
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if developer_id <= 0 {
        return Err(ApiError::BadCredentials);
    }
    {
        let mut online = ctx.online.lock().await;
        if !online.insert(developer_id) {
            return Err(ApiError::AlreadyOnline);
        }
    }
    state.session = Some(DevSession {
        developer_id,
        username: username.clone(),
    });
    info!("developer {} logged in as {}", developer_id, username);
    Ok(json!({"developerId": developer_id, "username": username}))
}

async fn attach_latest_version(ctx: &DevContext, game: &mut Value) -> Result<()> {
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
    Ok(())
}
