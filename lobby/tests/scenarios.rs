//! End-to-end scenarios: all three services bound in-process on ephemeral
//! ports, driven through the client connection library.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use arcade_client::transfer::{self, sha256_hex};
use arcade_client::{Connection, EventFrame};
use arcade_developer::DeveloperServer;
use arcade_env::Config;
use arcade_lobby::LobbyServer;
use arcade_store::StoreServer;
use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use zip::write::SimpleFileOptions;

struct Platform {
    _roots: tempfile::TempDir,
    upload_root: PathBuf,
    dev_addr: String,
    lobby_addr: String,
}

async fn spawn_platform() -> Platform {
    let roots = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.db.bind_host = "127.0.0.1".into();
    config.db.port = 0;
    config.db.sqlite_path = roots.path().join("arcade.sqlite3");
    config.developer_server.bind_host = "127.0.0.1".into();
    config.developer_server.port = 0;
    config.developer_server.upload_root = roots.path().join("uploaded_games");
    config.developer_server.tmp_root = roots.path().join("tmp_uploads");
    config.lobby_server.bind_host = "127.0.0.1".into();
    config.lobby_server.port = 0;
    config.lobby_server.run_root = roots.path().join("run");
    config.lobby_server.game_port_min = 43000;
    config.lobby_server.game_port_max = 43999;

    let store = StoreServer::bind(&config).await.unwrap();
    config.db.port = store.local_addr().unwrap().port();
    tokio::spawn(store.serve());

    let developer = DeveloperServer::bind(&config).await.unwrap();
    let dev_addr = developer.local_addr().unwrap().to_string();
    tokio::spawn(developer.serve());

    let lobby = LobbyServer::bind(&config).await.unwrap();
    let lobby_addr = lobby.local_addr().unwrap().to_string();
    tokio::spawn(lobby.serve());

    Platform {
        upload_root: config.developer_server.upload_root.clone(),
        _roots: roots,
        dev_addr,
        lobby_addr,
    }
}

fn build_game_zip(game_id: &str, version: &str, min_players: i64, server_script: &str) -> Vec<u8> {
    let manifest = json!({
        "gameId": game_id,
        "name": "Test Game",
        "version": version,
        "developer": "dev1",
        "description": "an uploaded test game",
        "clientType": "cli",
        "minPlayers": min_players,
        "maxPlayers": 4,
        "entrypoints": {
            "server": {"module": "server_main.sh", "argv": ["--port", "{port}"]},
            "client": {"module": "client_main.sh", "argv": []}
        }
    });
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let exec = SimpleFileOptions::default().unix_permissions(0o755);
        writer.start_file("manifest.json", SimpleFileOptions::default()).unwrap();
        writer.write_all(manifest.to_string().as_bytes()).unwrap();
        writer.start_file("server_main.sh", exec).unwrap();
        writer
            .write_all(format!("#!/bin/sh\n{}\n", server_script).as_bytes())
            .unwrap();
        writer.start_file("client_main.sh", exec).unwrap();
        writer.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

async fn dev_login(platform: &Platform, username: &str) -> Connection {
    let (mut conn, _events) = Connection::connect(&platform.dev_addr).await.unwrap();
    conn.request("dev_register", json!({"username": username, "password": "p"}))
        .await
        .unwrap();
    conn.request_ok("dev_login", json!({"username": username, "password": "p"}))
        .await
        .unwrap();
    conn
}

async fn upload_game(platform: &Platform, game_id: &str, version: &str, zip: &[u8]) {
    let mut conn = dev_login(platform, "dev1").await;
    transfer::upload_package(
        &mut conn,
        version,
        &format!("{}.zip", game_id),
        zip,
        json!({"gameId": game_id, "name": "Test Game", "description": "d"}),
        "initial release",
    )
    .await
    .unwrap();
    // Free the developer slot for later logins in the same scenario.
    conn.request_ok("dev_logout", json!({})).await.unwrap();
}

async fn connect_lobby(platform: &Platform) -> (Connection, mpsc::UnboundedReceiver<EventFrame>) {
    let (mut conn, events) = Connection::connect(&platform.lobby_addr).await.unwrap();
    let greeting = conn.recv_reply().await.unwrap();
    assert_eq!(greeting["hello"], "arcade_lobby_ready");
    (conn, events)
}

async fn player_login(
    platform: &Platform,
    username: &str,
) -> (Connection, mpsc::UnboundedReceiver<EventFrame>, i64) {
    let (mut conn, events) = connect_lobby(platform).await;
    conn.request("player_register", json!({"username": username, "password": "p"}))
        .await
        .unwrap();
    let logged_in = conn
        .request_ok("player_login", json!({"username": username, "password": "p"}))
        .await
        .unwrap();
    let player_id = logged_in["playerId"].as_i64().unwrap();
    (conn, events, player_id)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<EventFrame>, name: &str) -> EventFrame {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if event.name == name {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {} event", name))
}

async fn assert_no_event(events: &mut mpsc::UnboundedReceiver<EventFrame>, name: &str) {
    let extra = tokio::time::timeout(Duration::from_millis(700), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if event.name == name {
                return event;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "unexpected duplicate {} event", name);
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_then_download_round_trips_bytes() {
    let platform = spawn_platform().await;
    let zip = build_game_zip("g1", "1.0.0", 2, "sleep 30");
    upload_game(&platform, "g1", "1.0.0", &zip).await;

    let (mut player, _events, _pid) = player_login(&platform, "pl1").await;

    let listed = player.request_ok("store_list_games", json!({})).await.unwrap();
    let games = listed["games"].as_array().unwrap();
    assert_eq!(games.len(), 1);
    assert_eq!(games[0]["gameId"], "g1");
    assert_eq!(games[0]["latestVersion"], "1.0.0");
    assert_eq!(games[0]["developerUsername"], "dev1");

    let (bytes, opened) = transfer::download_package(&mut player, "g1", None, 400)
        .await
        .unwrap();
    assert_eq!(bytes, zip);
    assert_eq!(opened["sha256"].as_str().unwrap(), sha256_hex(&zip));
    assert_eq!(opened["sizeBytes"].as_u64().unwrap(), zip.len() as u64);
}

#[tokio::test(flavor = "multi_thread")]
async fn full_match_cycle_with_posted_result() {
    let platform = spawn_platform().await;
    let zip = build_game_zip("g1", "1.0.0", 2, "sleep 30");
    upload_game(&platform, "g1", "1.0.0", &zip).await;

    let (mut a, mut a_events, id_a) = player_login(&platform, "alice").await;
    let (mut b, mut b_events, _id_b) = player_login(&platform, "bob").await;

    let created = a.request_ok("room_create", json!({"gameId": "g1"})).await.unwrap();
    let room_id = created["roomId"].as_i64().unwrap();

    b.request_ok("room_join", json!({"roomId": room_id})).await.unwrap();
    let joined = next_event(&mut a_events, "player_joined").await;
    assert_eq!(joined.data["roomId"], json!(room_id));

    let started = a.request_ok("room_start", json!({"roomId": room_id})).await.unwrap();
    assert_eq!(started["started"], true);

    let info_a = next_event(&mut a_events, "game_info").await;
    let info_b = next_event(&mut b_events, "game_info").await;
    assert_eq!(info_a.data, info_b.data);
    assert_eq!(info_a.data["roomId"], json!(room_id));
    assert_eq!(info_a.data["token"].as_str().unwrap().len(), 32);
    assert!(info_a.data["port"].as_u64().unwrap() >= 43000);

    // The stubbed game server reports the result over a fresh connection.
    let (mut game_server, _ev) = connect_lobby(&platform).await;
    game_server
        .request_ok(
            "post_result",
            json!({"roomId": room_id, "reason": "finished", "winner": id_a, "results": []}),
        )
        .await
        .unwrap();

    let ready_a = next_event(&mut a_events, "game_ready").await;
    let ready_b = next_event(&mut b_events, "game_ready").await;
    assert_eq!(ready_a.data["result"]["reason"], "finished");
    assert_eq!(ready_b.data["result"]["winner"], json!(id_a));
    assert_no_event(&mut a_events, "game_ready").await;

    let detail = a.request_ok("room_detail", json!({"roomId": room_id})).await.unwrap();
    assert_eq!(detail["room"]["status"], "waiting");

    let logs = a.request_ok("match_list_mine", json!({})).await.unwrap();
    assert_eq!(logs["logs"].as_array().unwrap().len(), 1);
    assert_eq!(logs["logs"][0]["reason"], "finished");
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_post_result_appends_log_without_rebroadcast() {
    let platform = spawn_platform().await;
    let zip = build_game_zip("g1", "1.0.0", 1, "sleep 30");
    upload_game(&platform, "g1", "1.0.0", &zip).await;

    let (mut a, mut a_events, _id_a) = player_login(&platform, "alice").await;
    let created = a.request_ok("room_create", json!({"gameId": "g1"})).await.unwrap();
    let room_id = created["roomId"].as_i64().unwrap();
    a.request_ok("room_start", json!({"roomId": room_id})).await.unwrap();
    next_event(&mut a_events, "game_info").await;

    let (mut game_server, _ev) = connect_lobby(&platform).await;
    let result = json!({"roomId": room_id, "reason": "finished", "results": []});
    game_server.request_ok("post_result", result.clone()).await.unwrap();
    next_event(&mut a_events, "game_ready").await;

    game_server.request_ok("post_result", result).await.unwrap();
    assert_no_event(&mut a_events, "game_ready").await;

    let logs = a.request_ok("match_list_mine", json!({})).await.unwrap();
    assert_eq!(logs["logs"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn child_exit_synthesizes_the_finish() {
    let platform = spawn_platform().await;
    let zip = build_game_zip("g1", "1.0.0", 1, "exit 0");
    upload_game(&platform, "g1", "1.0.0", &zip).await;

    let (mut a, mut a_events, _id) = player_login(&platform, "alice").await;
    let created = a.request_ok("room_create", json!({"gameId": "g1"})).await.unwrap();
    let room_id = created["roomId"].as_i64().unwrap();
    a.request_ok("room_start", json!({"roomId": room_id})).await.unwrap();
    next_event(&mut a_events, "game_info").await;

    let ready = next_event(&mut a_events, "game_ready").await;
    assert_eq!(ready.data["result"]["reason"], "process_exit");

    let detail = a.request_ok("room_detail", json!({"roomId": room_id})).await.unwrap();
    assert_eq!(detail["room"]["status"], "waiting");
}

#[tokio::test(flavor = "multi_thread")]
async fn review_requires_a_played_match() {
    let platform = spawn_platform().await;
    let zip = build_game_zip("g1", "1.0.0", 1, "sleep 30");
    upload_game(&platform, "g1", "1.0.0", &zip).await;

    let (mut a, mut a_events, _id_a) = player_login(&platform, "alice").await;
    let created = a.request_ok("room_create", json!({"gameId": "g1"})).await.unwrap();
    let room_id = created["roomId"].as_i64().unwrap();
    a.request_ok("room_start", json!({"roomId": room_id})).await.unwrap();
    next_event(&mut a_events, "game_info").await;

    let (mut game_server, _ev) = connect_lobby(&platform).await;
    game_server
        .request_ok("post_result", json!({"roomId": room_id, "reason": "finished", "results": []}))
        .await
        .unwrap();
    next_event(&mut a_events, "game_ready").await;

    a.request_ok(
        "review_create_or_update",
        json!({"gameId": "g1", "rating": 5, "comment": "ok"}),
    )
    .await
    .unwrap();

    let (mut c, _c_events, _id_c) = player_login(&platform, "carol").await;
    let denied = c
        .request(
            "review_create_or_update",
            json!({"gameId": "g1", "rating": 4, "comment": "never played"}),
        )
        .await
        .unwrap();
    assert_eq!(denied["error"], "not_played");

    let detail = a.request_ok("store_game_detail", json!({"gameId": "g1"})).await.unwrap();
    let reviews = detail["reviews"].as_array().unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0]["rating"], 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn delist_blocked_while_match_is_live() {
    let platform = spawn_platform().await;
    let zip = build_game_zip("g1", "1.0.0", 1, "sleep 30");
    upload_game(&platform, "g1", "1.0.0", &zip).await;

    let (mut a, mut a_events, _id) = player_login(&platform, "alice").await;
    let created = a.request_ok("room_create", json!({"gameId": "g1"})).await.unwrap();
    let room_id = created["roomId"].as_i64().unwrap();
    a.request_ok("room_start", json!({"roomId": room_id})).await.unwrap();
    next_event(&mut a_events, "game_info").await;

    let mut dev = dev_login(&platform, "dev1").await;
    let blocked = dev
        .request("game_delist", json!({"gameId": "g1", "delisted": true}))
        .await
        .unwrap();
    assert_eq!(blocked["error"], "game_in_progress");

    let (mut game_server, _ev) = connect_lobby(&platform).await;
    game_server
        .request_ok("post_result", json!({"roomId": room_id, "reason": "finished", "results": []}))
        .await
        .unwrap();
    next_event(&mut a_events, "game_ready").await;
    a.request_ok("room_leave", json!({})).await.unwrap();

    dev.request_ok("game_delist", json!({"gameId": "g1", "delisted": true}))
        .await
        .unwrap();

    let denied = a.request("room_create", json!({"gameId": "g1"})).await.unwrap();
    assert_eq!(denied["error"], "game_delisted");
}

#[tokio::test(flavor = "multi_thread")]
async fn host_disconnect_mid_match_finishes_and_logs_participants() {
    let platform = spawn_platform().await;
    let zip = build_game_zip("g1", "1.0.0", 2, "sleep 30");
    upload_game(&platform, "g1", "1.0.0", &zip).await;

    let (mut a, mut a_events, id_a) = player_login(&platform, "alice").await;
    let (mut b, mut b_events, id_b) = player_login(&platform, "bob").await;

    let created = a.request_ok("room_create", json!({"gameId": "g1"})).await.unwrap();
    let room_id = created["roomId"].as_i64().unwrap();
    b.request_ok("room_join", json!({"roomId": room_id})).await.unwrap();
    a.request_ok("room_start", json!({"roomId": room_id})).await.unwrap();
    next_event(&mut a_events, "game_info").await;
    next_event(&mut b_events, "game_info").await;

    drop(a);
    drop(a_events);

    let ready = next_event(&mut b_events, "game_ready").await;
    assert_eq!(ready.data["result"]["reason"], "disconnect");
    next_event(&mut b_events, "host_changed").await;

    let detail = b.request_ok("room_detail", json!({"roomId": room_id})).await.unwrap();
    assert_eq!(detail["room"]["status"], "waiting");
    assert_eq!(detail["room"]["hostPlayerId"], json!(id_b));

    let logs = b.request_ok("match_list_mine", json!({})).await.unwrap();
    let results: Value =
        serde_json::from_str(logs["logs"][0]["resultsJson"].as_str().unwrap()).unwrap();
    let participants: Vec<i64> = results["players"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["userId"].as_i64().unwrap())
        .collect();
    assert!(participants.contains(&id_a));
    assert!(participants.contains(&id_b));
}

#[tokio::test(flavor = "multi_thread")]
async fn traversal_zip_is_rejected_without_a_version_row() {
    let platform = spawn_platform().await;

    // A zip whose entry walks out of the extraction root.
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        writer
            .start_file("../evil", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"boom").unwrap();
        writer.finish().unwrap();
    }
    let zip_bytes = cursor.into_inner();

    let mut dev = dev_login(&platform, "dev1").await;
    let opened = dev
        .request_ok(
            "game_upload_init",
            json!({
                "gameId": "evilgame", "version": "1.0.0",
                "fileName": "evil.zip", "sizeBytes": zip_bytes.len(),
                "sha256": sha256_hex(&zip_bytes),
                "name": "Evil", "description": "d",
            }),
        )
        .await
        .unwrap();
    let upload_id = opened["uploadId"].as_str().unwrap();
    dev.request_ok(
        "game_upload_chunk",
        json!({
            "uploadId": upload_id,
            "seq": 0,
            "dataB64": base64::engine::general_purpose::STANDARD.encode(&zip_bytes),
        }),
    )
    .await
    .unwrap();
    let finished = dev
        .request("game_upload_finish", json!({"uploadId": upload_id, "changelog": ""}))
        .await
        .unwrap();
    assert_eq!(finished["error"], "unsafe_zip_entry");

    // Nothing of the rejected package may land under the upload root.
    assert!(!platform.upload_root.join("evilgame").exists());

    let (mut player, _ev, _id) = player_login(&platform, "pl1").await;
    let denied = player
        .request("store_download_init", json!({"gameId": "evilgame"}))
        .await
        .unwrap();
    assert_eq!(denied["error"], "no_version");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_session_rule_and_room_capacity() {
    let platform = spawn_platform().await;
    let zip = build_game_zip("g1", "1.0.0", 2, "sleep 30");
    upload_game(&platform, "g1", "1.0.0", &zip).await;

    let (mut a, _a_events, _id) = player_login(&platform, "alice").await;

    // Second live connection for the same player is refused.
    let (mut dup, _dup_events) = connect_lobby(&platform).await;
    let refused = dup
        .request("player_login", json!({"username": "alice", "password": "p"}))
        .await
        .unwrap();
    assert_eq!(refused["error"], "already_online");

    let created = a.request_ok("room_create", json!({"gameId": "g1"})).await.unwrap();
    let room_id = created["roomId"].as_i64().unwrap();

    // maxPlayers is 4; fill the room and overflow it.
    let mut members = Vec::new();
    for name in ["bob", "carol", "dave"] {
        let (mut conn, events, id) = player_login(&platform, name).await;
        conn.request_ok("room_join", json!({"roomId": room_id})).await.unwrap();
        members.push((conn, events, id));
    }
    let (mut eve, _eve_events, _eve_id) = player_login(&platform, "eve").await;
    let full = eve.request("room_join", json!({"roomId": room_id})).await.unwrap();
    assert_eq!(full["error"], "room_full");
}

#[tokio::test(flavor = "multi_thread")]
async fn host_leave_promotes_earliest_joined_member() {
    let platform = spawn_platform().await;
    let zip = build_game_zip("g1", "1.0.0", 2, "sleep 30");
    upload_game(&platform, "g1", "1.0.0", &zip).await;

    let (mut a, _a_events, _id_a) = player_login(&platform, "alice").await;
    let (mut b, mut b_events, id_b) = player_login(&platform, "bob").await;
    let (mut c, mut c_events, _id_c) = player_login(&platform, "carol").await;

    let created = a.request_ok("room_create", json!({"gameId": "g1"})).await.unwrap();
    let room_id = created["roomId"].as_i64().unwrap();
    b.request_ok("room_join", json!({"roomId": room_id})).await.unwrap();
    c.request_ok("room_join", json!({"roomId": room_id})).await.unwrap();

    a.request_ok("room_leave", json!({})).await.unwrap();

    let host_b = next_event(&mut b_events, "host_changed").await;
    let host_c = next_event(&mut c_events, "host_changed").await;
    assert_eq!(host_b.data["hostPlayerId"], json!(id_b));
    assert_eq!(host_c.data["hostPlayerId"], json!(id_b));
    next_event(&mut b_events, "player_left").await;

    let detail = b.request_ok("room_detail", json!({"roomId": room_id})).await.unwrap();
    assert_eq!(detail["room"]["hostPlayerId"], json!(id_b));

    // Not enough players after everyone else leaves.
    c.request_ok("room_leave", json!({})).await.unwrap();
    let short = b.request("room_start", json!({"roomId": room_id})).await.unwrap();
    assert_eq!(short["error"], "need_more_players");
    assert_eq!(short["minPlayers"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_room_is_deleted() {
    let platform = spawn_platform().await;
    let zip = build_game_zip("g1", "1.0.0", 1, "sleep 30");
    upload_game(&platform, "g1", "1.0.0", &zip).await;

    let (mut a, _a_events, _id) = player_login(&platform, "alice").await;
    let created = a.request_ok("room_create", json!({"gameId": "g1"})).await.unwrap();
    let room_id = created["roomId"].as_i64().unwrap();
    a.request_ok("room_leave", json!({})).await.unwrap();

    let gone = a.request("room_detail", json!({"roomId": room_id})).await.unwrap();
    assert_eq!(gone["error"], "no_such_room");

    let listed = a.request_ok("room_list", json!({})).await.unwrap();
    assert_eq!(listed["rooms"].as_array().unwrap().len(), 0);
}
