//! SQLite persistence and the collection/action dispatch.
//!
//! Replies are `{status:"OK", ...}` or `{status:"ERR", error, ...}`.  Codes
//! are stable; internal SQLite failures are folded into `db_error:<detail>`.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Map, Value};
use sha2::Sha256;

const PBKDF2_ITER: u32 = 120_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const MATCH_LIST_LIMIT: u32 = 50;

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn hash_password(password: &str, salt: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITER, &mut out);
    out
}

fn gen_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

fn verify_password(password: &str, salt: &[u8], stored: &[u8]) -> bool {
    let computed = hash_password(password, salt);
    constant_time_eq(&computed, stored)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

enum StoreError {
    Code(&'static str),
    Sql(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sql(e)
    }
}

type StoreResult = Result<Value, StoreError>;

fn srv_ok(extra: Value) -> Value {
    let mut body = Map::new();
    body.insert("status".into(), json!("OK"));
    if let Value::Object(fields) = extra {
        body.extend(fields);
    }
    Value::Object(body)
}

fn code(c: &'static str) -> StoreError {
    StoreError::Code(c)
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    let s = data.get(key)?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn i64_field(data: &Value, key: &str) -> i64 {
    data.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS DevUser(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                salt BLOB NOT NULL,
                passwordHash BLOB NOT NULL,
                createdAt INTEGER NOT NULL,
                lastLoginAt INTEGER
            );
            CREATE TABLE IF NOT EXISTS PlayerUser(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                salt BLOB NOT NULL,
                passwordHash BLOB NOT NULL,
                createdAt INTEGER NOT NULL,
                lastLoginAt INTEGER
            );
            CREATE TABLE IF NOT EXISTS Game(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                gameId TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                developerId INTEGER NOT NULL,
                delisted INTEGER NOT NULL DEFAULT 0,
                createdAt INTEGER NOT NULL,
                updatedAt INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS GameVersion(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                gameRef INTEGER NOT NULL,
                version TEXT NOT NULL,
                changelog TEXT,
                uploadedAt INTEGER NOT NULL,
                fileName TEXT NOT NULL,
                sizeBytes INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                zipPath TEXT NOT NULL,
                extractedPath TEXT NOT NULL,
                manifestJson TEXT NOT NULL,
                clientType TEXT NOT NULL,
                minPlayers INTEGER NOT NULL,
                maxPlayers INTEGER NOT NULL,
                UNIQUE(gameRef, version)
            );
            CREATE TABLE IF NOT EXISTS Review(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                gameRef INTEGER NOT NULL,
                playerId INTEGER NOT NULL,
                rating INTEGER NOT NULL,
                comment TEXT NOT NULL,
                createdAt INTEGER NOT NULL,
                updatedAt INTEGER NOT NULL,
                UNIQUE(gameRef, playerId)
            );
            CREATE TABLE IF NOT EXISTS Room(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostPlayerId INTEGER NOT NULL,
                gameRef INTEGER NOT NULL,
                gameVersionRef INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'waiting',
                createdAt INTEGER NOT NULL,
                updatedAt INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS RoomMember(
                roomId INTEGER NOT NULL,
                playerId INTEGER NOT NULL,
                joinedAt INTEGER NOT NULL,
                PRIMARY KEY(roomId, playerId)
            );
            CREATE TABLE IF NOT EXISTS MatchLog(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                roomId INTEGER NOT NULL,
                gameRef INTEGER NOT NULL,
                gameVersionRef INTEGER NOT NULL,
                startedAt INTEGER NOT NULL,
                endedAt INTEGER NOT NULL,
                reason TEXT NOT NULL,
                winnerPlayerId INTEGER,
                resultsJson TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS MatchParticipant(
                matchLogId INTEGER NOT NULL,
                playerId INTEGER NOT NULL,
                PRIMARY KEY(matchLogId, playerId)
            );
            CREATE INDEX IF NOT EXISTS idx_participant_player
                ON MatchParticipant(playerId);
            "#,
        )
    }

    /// Handle one `{collection, action, data}` request.
    pub fn dispatch(&mut self, request: &Value) -> Value {
        let collection = request.get("collection").and_then(Value::as_str).unwrap_or("");
        let action = request.get("action").and_then(Value::as_str).unwrap_or("");
        let data = request.get("data").cloned().unwrap_or_else(|| json!({}));

        let result = match collection {
            "DevUser" => self.user_action("DevUser", action, &data),
            "PlayerUser" => self.user_action("PlayerUser", action, &data),
            "Game" => self.game_action(action, &data),
            "GameVersion" => self.game_version_action(action, &data),
            "Review" => self.review_action(action, &data),
            "Room" => self.room_action(action, &data),
            "MatchLog" => self.match_log_action(action, &data),
            _ => Err(code("unknown_collection")),
        };

        match result {
            Ok(reply) => reply,
            Err(StoreError::Code(c)) => json!({"status": "ERR", "error": c}),
            Err(StoreError::Sql(e)) => {
                tracing::error!("sqlite failure in {}/{}: {}", collection, action, e);
                json!({"status": "ERR", "error": format!("db_error:{}", e)})
            }
        }
    }

    // -------------------------
    // Accounts (DevUser / PlayerUser share one shape)
    // -------------------------
    fn user_action(&mut self, table: &str, action: &str, data: &Value) -> StoreResult {
        let id_key = if table == "DevUser" { "developerId" } else { "playerId" };
        match action {
            "register" => {
                let username = str_field(data, "username").ok_or(code("missing_fields"))?;
                let password = data
                    .get("password")
                    .and_then(Value::as_str)
                    .filter(|p| !p.is_empty())
                    .ok_or(code("missing_fields"))?;
                let exists: Option<i64> = self
                    .conn
                    .query_row(
                        &format!("SELECT 1 FROM {} WHERE username=?1", table),
                        params![username],
                        |r| r.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    return Err(code("username_exists"));
                }
                let salt = gen_salt();
                let hash = hash_password(password, &salt);
                let ts = now_ts();
                self.conn.execute(
                    &format!(
                        "INSERT INTO {}(username,salt,passwordHash,createdAt,lastLoginAt) \
                         VALUES(?1,?2,?3,?4,0)",
                        table
                    ),
                    params![username, salt, hash, ts],
                )?;
                let id = self.conn.last_insert_rowid();
                Ok(srv_ok(json!({"data": {id_key: id, "username": username}})))
            }
            "login" => {
                let username = str_field(data, "username").ok_or(code("missing_fields"))?;
                let password = data
                    .get("password")
                    .and_then(Value::as_str)
                    .filter(|p| !p.is_empty())
                    .ok_or(code("missing_fields"))?;
                let row: Option<(i64, Vec<u8>, Vec<u8>)> = self
                    .conn
                    .query_row(
                        &format!(
                            "SELECT id,salt,passwordHash FROM {} WHERE username=?1",
                            table
                        ),
                        params![username],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .optional()?;
                let (id, salt, hash) = row.ok_or(code("bad_credentials"))?;
                if !verify_password(password, &salt, &hash) {
                    return Err(code("bad_credentials"));
                }
                self.conn.execute(
                    &format!("UPDATE {} SET lastLoginAt=?1 WHERE id=?2", table),
                    params![now_ts(), id],
                )?;
                Ok(srv_ok(json!({"data": {id_key: id, "username": username}})))
            }
            "get_by_username" => {
                let username = str_field(data, "username").ok_or(code("missing_fields"))?;
                let row = self
                    .conn
                    .query_row(
                        &format!(
                            "SELECT id,username,createdAt,lastLoginAt FROM {} WHERE username=?1",
                            table
                        ),
                        params![username],
                        user_row,
                    )
                    .optional()?;
                row.map(|data| srv_ok(json!({"data": data})))
                    .ok_or(code("not_found"))
            }
            "get_by_id" => {
                let id = i64_field(data, id_key);
                if id <= 0 {
                    return Err(code("missing_fields"));
                }
                let row = self
                    .conn
                    .query_row(
                        &format!(
                            "SELECT id,username,createdAt,lastLoginAt FROM {} WHERE id=?1",
                            table
                        ),
                        params![id],
                        user_row,
                    )
                    .optional()?;
                row.map(|data| srv_ok(json!({"data": data})))
                    .ok_or(code("not_found"))
            }
            _ => Err(code("unknown_action")),
        }
    }

    // -------------------------
    // Game
    // -------------------------
    fn game_action(&mut self, action: &str, data: &Value) -> StoreResult {
        match action {
            "create" => {
                let game_id = str_field(data, "gameId").ok_or(code("missing_fields"))?;
                let name = str_field(data, "name").ok_or(code("missing_fields"))?;
                let description = str_field(data, "description").ok_or(code("missing_fields"))?;
                let developer_id = i64_field(data, "developerId");
                if developer_id <= 0 {
                    return Err(code("missing_fields"));
                }
                let ts = now_ts();
                let inserted = self.conn.execute(
                    "INSERT INTO Game(gameId,name,description,developerId,delisted,createdAt,updatedAt) \
                     VALUES(?1,?2,?3,?4,0,?5,?5)",
                    params![game_id, name, description, developer_id, ts],
                );
                match inserted {
                    Ok(_) => Ok(srv_ok(
                        json!({"data": {"gameDbId": self.conn.last_insert_rowid()}}),
                    )),
                    Err(e) if is_unique_violation(&e) => Err(code("game_exists")),
                    Err(e) => Err(e.into()),
                }
            }
            "get_by_gameId" => {
                let game_id = str_field(data, "gameId").ok_or(code("missing_fields"))?;
                let row = self
                    .conn
                    .query_row(
                        "SELECT id,gameId,name,description,developerId,delisted,createdAt,updatedAt \
                         FROM Game WHERE gameId=?1",
                        params![game_id],
                        game_row,
                    )
                    .optional()?;
                row.map(|data| srv_ok(json!({"data": data})))
                    .ok_or(code("not_found"))
            }
            "list_public" => {
                let mut stmt = self.conn.prepare(
                    "SELECT id,gameId,name,description,developerId,delisted,createdAt,updatedAt \
                     FROM Game WHERE delisted=0 ORDER BY updatedAt DESC, id DESC",
                )?;
                let games: Vec<Value> =
                    stmt.query_map([], game_row)?.collect::<Result<_, _>>()?;
                Ok(srv_ok(json!({"games": games})))
            }
            "list_by_dev" => {
                let developer_id = i64_field(data, "developerId");
                if developer_id <= 0 {
                    return Err(code("missing_fields"));
                }
                let mut stmt = self.conn.prepare(
                    "SELECT id,gameId,name,description,developerId,delisted,createdAt,updatedAt \
                     FROM Game WHERE developerId=?1 ORDER BY updatedAt DESC, id DESC",
                )?;
                let games: Vec<Value> = stmt
                    .query_map(params![developer_id], game_row)?
                    .collect::<Result<_, _>>()?;
                Ok(srv_ok(json!({"games": games})))
            }
            "set_delisted" => {
                let game_id = str_field(data, "gameId").ok_or(code("missing_fields"))?;
                let developer_id = i64_field(data, "developerId");
                if developer_id <= 0 {
                    return Err(code("missing_fields"));
                }
                let delisted = data
                    .get("delisted")
                    .and_then(Value::as_bool)
                    .unwrap_or(false) as i64;
                let owner: Option<i64> = self
                    .conn
                    .query_row(
                        "SELECT developerId FROM Game WHERE gameId=?1",
                        params![game_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                let owner = owner.ok_or(code("not_found"))?;
                if owner != developer_id {
                    return Err(code("not_owner"));
                }
                self.conn.execute(
                    "UPDATE Game SET delisted=?1, updatedAt=?2 WHERE gameId=?3",
                    params![delisted, now_ts(), game_id],
                )?;
                Ok(srv_ok(json!({})))
            }
            _ => Err(code("unknown_action")),
        }
    }

    fn game_by_game_id(&self, game_id: &str) -> Result<Option<(i64, i64)>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT id,delisted FROM Game WHERE gameId=?1",
                params![game_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
    }

    // -------------------------
    // GameVersion
    // -------------------------
    fn game_version_action(&mut self, action: &str, data: &Value) -> StoreResult {
        match action {
            "create" => {
                let game_db_id = i64_field(data, "gameDbId");
                let version = str_field(data, "version").ok_or(code("missing_fields"))?;
                if game_db_id <= 0 {
                    return Err(code("missing_fields"));
                }
                for key in [
                    "fileName",
                    "sizeBytes",
                    "sha256",
                    "zipPath",
                    "extractedPath",
                    "manifestJson",
                    "clientType",
                    "minPlayers",
                    "maxPlayers",
                ] {
                    if data.get(key).is_none() {
                        return Err(code("missing_fields"));
                    }
                }
                let ts = now_ts();
                let tx = self.conn.transaction()?;
                let inserted = tx.execute(
                    "INSERT INTO GameVersion(gameRef,version,changelog,uploadedAt,fileName,\
                     sizeBytes,sha256,zipPath,extractedPath,manifestJson,clientType,minPlayers,maxPlayers) \
                     VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                    params![
                        game_db_id,
                        version,
                        data.get("changelog").and_then(Value::as_str).unwrap_or(""),
                        ts,
                        data["fileName"].as_str().unwrap_or(""),
                        i64_field(data, "sizeBytes"),
                        data["sha256"].as_str().unwrap_or(""),
                        data["zipPath"].as_str().unwrap_or(""),
                        data["extractedPath"].as_str().unwrap_or(""),
                        data["manifestJson"].as_str().unwrap_or(""),
                        data["clientType"].as_str().unwrap_or(""),
                        i64_field(data, "minPlayers"),
                        i64_field(data, "maxPlayers"),
                    ],
                );
                if let Err(e) = inserted {
                    return if is_unique_violation(&e) {
                        Err(code("version_exists"))
                    } else {
                        Err(e.into())
                    };
                }
                let version_id = tx.last_insert_rowid();
                tx.execute(
                    "UPDATE Game SET updatedAt=?1 WHERE id=?2",
                    params![ts, game_db_id],
                )?;
                tx.commit()?;
                Ok(srv_ok(json!({"data": {"gameVersionId": version_id}})))
            }
            "list_for_gameId" => {
                let game_id = str_field(data, "gameId").ok_or(code("missing_fields"))?;
                let (game_ref, _) = self
                    .game_by_game_id(&game_id)?
                    .ok_or(code("not_found"))?;
                let mut stmt = self.conn.prepare(
                    "SELECT id,version,uploadedAt,changelog,fileName,sizeBytes,sha256,\
                     clientType,minPlayers,maxPlayers \
                     FROM GameVersion WHERE gameRef=?1 ORDER BY uploadedAt DESC, id DESC",
                )?;
                let versions: Vec<Value> = stmt
                    .query_map(params![game_ref], version_summary_row)?
                    .collect::<Result<_, _>>()?;
                Ok(srv_ok(json!({"versions": versions})))
            }
            "get_for_gameId_version" => {
                let game_id = str_field(data, "gameId").ok_or(code("missing_fields"))?;
                let version = str_field(data, "version").ok_or(code("missing_fields"))?;
                let (game_ref, delisted) = self
                    .game_by_game_id(&game_id)?
                    .ok_or(code("not_found"))?;
                if delisted != 0 {
                    return Err(code("game_delisted"));
                }
                let row = self
                    .conn
                    .query_row(
                        "SELECT * FROM GameVersion WHERE gameRef=?1 AND version=?2 LIMIT 1",
                        params![game_ref, version],
                        version_row,
                    )
                    .optional()?;
                row.map(|data| srv_ok(json!({"data": data})))
                    .ok_or(code("no_version"))
            }
            "latest_for_gameId" => {
                let game_id = str_field(data, "gameId").ok_or(code("missing_fields"))?;
                let (game_ref, delisted) = self
                    .game_by_game_id(&game_id)?
                    .ok_or(code("not_found"))?;
                if delisted != 0 {
                    return Err(code("game_delisted"));
                }
                let row = self
                    .conn
                    .query_row(
                        "SELECT * FROM GameVersion WHERE gameRef=?1 \
                         ORDER BY uploadedAt DESC, id DESC LIMIT 1",
                        params![game_ref],
                        version_row,
                    )
                    .optional()?;
                row.map(|data| srv_ok(json!({"data": data})))
                    .ok_or(code("no_version"))
            }
            "get_by_id" => {
                let version_id = i64_field(data, "gameVersionId");
                if version_id <= 0 {
                    return Err(code("missing_fields"));
                }
                let row = self
                    .conn
                    .query_row(
                        "SELECT * FROM GameVersion WHERE id=?1",
                        params![version_id],
                        version_row,
                    )
                    .optional()?;
                row.map(|data| srv_ok(json!({"data": data})))
                    .ok_or(code("not_found"))
            }
            _ => Err(code("unknown_action")),
        }
    }

    // -------------------------
    // Review
    // -------------------------
    fn review_action(&mut self, action: &str, data: &Value) -> StoreResult {
        match action {
            "upsert" => {
                let game_id = str_field(data, "gameId").ok_or(code("bad_request"))?;
                let player_id = i64_field(data, "playerId");
                let rating = i64_field(data, "rating");
                let comment = data
                    .get("comment")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if player_id <= 0 || !(1..=5).contains(&rating) {
                    return Err(code("bad_request"));
                }
                let (game_ref, _) = self
                    .game_by_game_id(&game_id)?
                    .ok_or(code("not_found"))?;
                let ts = now_ts();
                self.conn.execute(
                    "INSERT INTO Review(gameRef,playerId,rating,comment,createdAt,updatedAt) \
                     VALUES(?1,?2,?3,?4,?5,?5) \
                     ON CONFLICT(gameRef,playerId) DO UPDATE SET \
                       rating=excluded.rating, comment=excluded.comment, updatedAt=excluded.updatedAt",
                    params![game_ref, player_id, rating, comment, ts],
                )?;
                Ok(srv_ok(json!({})))
            }
            "list_for_gameId" => {
                let game_id = str_field(data, "gameId").ok_or(code("missing_fields"))?;
                let (game_ref, _) = self
                    .game_by_game_id(&game_id)?
                    .ok_or(code("not_found"))?;
                let mut stmt = self.conn.prepare(
                    "SELECT playerId,rating,comment,createdAt,updatedAt \
                     FROM Review WHERE gameRef=?1 ORDER BY updatedAt DESC, id DESC",
                )?;
                let reviews: Vec<Value> = stmt
                    .query_map(params![game_ref], |r| {
                        Ok(json!({
                            "playerId": r.get::<_, i64>(0)?,
                            "rating": r.get::<_, i64>(1)?,
                            "comment": r.get::<_, String>(2)?,
                            "createdAt": r.get::<_, i64>(3)?,
                            "updatedAt": r.get::<_, i64>(4)?,
                        }))
                    })?
                    .collect::<Result<_, _>>()?;
                Ok(srv_ok(json!({"reviews": reviews})))
            }
            _ => Err(code("unknown_action")),
        }
    }

    // -------------------------
    // Room
    // -------------------------
    fn room_action(&mut self, action: &str, data: &Value) -> StoreResult {
        match action {
            "create" => {
                let host = i64_field(data, "hostPlayerId");
                let game_db_id = i64_field(data, "gameDbId");
                let game_version_id = i64_field(data, "gameVersionId");
                if host <= 0 || game_db_id <= 0 || game_version_id <= 0 {
                    return Err(code("missing_fields"));
                }
                let ts = now_ts();
                let tx = self.conn.transaction()?;
                tx.execute(
                    "INSERT INTO Room(hostPlayerId,gameRef,gameVersionRef,status,createdAt,updatedAt) \
                     VALUES(?1,?2,?3,'waiting',?4,?4)",
                    params![host, game_db_id, game_version_id, ts],
                )?;
                let room_id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT OR IGNORE INTO RoomMember(roomId,playerId,joinedAt) VALUES(?1,?2,?3)",
                    params![room_id, host, ts],
                )?;
                tx.commit()?;
                Ok(srv_ok(json!({"data": {"roomId": room_id}})))
            }
            "get" => {
                let room_id = i64_field(data, "roomId");
                if room_id <= 0 {
                    return Err(code("missing_fields"));
                }
                let row = self
                    .conn
                    .query_row(
                        "SELECT r.id,r.hostPlayerId,r.status,r.createdAt,r.updatedAt,\
                         g.id,g.gameId,g.name,g.delisted,\
                         gv.id,gv.version,gv.clientType,gv.minPlayers,gv.maxPlayers \
                         FROM Room r \
                         JOIN Game g ON g.id=r.gameRef \
                         JOIN GameVersion gv ON gv.id=r.gameVersionRef \
                         WHERE r.id=?1",
                        params![room_id],
                        room_detail_row,
                    )
                    .optional()?;
                let mut room = row.ok_or(code("not_found"))?;
                room["players"] = json!(self.room_members(room_id)?);
                Ok(srv_ok(json!({"data": room})))
            }
            "list" => {
                let mut stmt = self.conn.prepare(
                    "SELECT r.id,r.hostPlayerId,r.status,r.createdAt,r.updatedAt,\
                     g.gameId,g.name,gv.version \
                     FROM Room r \
                     JOIN Game g ON g.id=r.gameRef \
                     JOIN GameVersion gv ON gv.id=r.gameVersionRef \
                     ORDER BY r.updatedAt DESC, r.id DESC",
                )?;
                let mut rooms: Vec<Value> = stmt
                    .query_map([], |r| {
                        Ok(json!({
                            "id": r.get::<_, i64>(0)?,
                            "hostPlayerId": r.get::<_, i64>(1)?,
                            "status": r.get::<_, String>(2)?,
                            "createdAt": r.get::<_, i64>(3)?,
                            "updatedAt": r.get::<_, i64>(4)?,
                            "gameId": r.get::<_, String>(5)?,
                            "gameName": r.get::<_, String>(6)?,
                            "version": r.get::<_, String>(7)?,
                        }))
                    })?
                    .collect::<Result<_, _>>()?;
                for room in rooms.iter_mut() {
                    let id = room["id"].as_i64().unwrap_or(0);
                    room["players"] = json!(self.room_members(id)?);
                }
                Ok(srv_ok(json!({"rooms": rooms})))
            }
            "add_member" => {
                let room_id = i64_field(data, "roomId");
                let player_id = i64_field(data, "playerId");
                if room_id <= 0 || player_id <= 0 {
                    return Err(code("missing_fields"));
                }
                let ts = now_ts();
                self.conn.execute(
                    "INSERT OR IGNORE INTO RoomMember(roomId,playerId,joinedAt) VALUES(?1,?2,?3)",
                    params![room_id, player_id, ts],
                )?;
                self.conn.execute(
                    "UPDATE Room SET updatedAt=?1 WHERE id=?2",
                    params![ts, room_id],
                )?;
                Ok(srv_ok(json!({})))
            }
            "remove_member" => {
                let room_id = i64_field(data, "roomId");
                let player_id = i64_field(data, "playerId");
                if room_id <= 0 || player_id <= 0 {
                    return Err(code("missing_fields"));
                }
                self.conn.execute(
                    "DELETE FROM RoomMember WHERE roomId=?1 AND playerId=?2",
                    params![room_id, player_id],
                )?;
                self.conn.execute(
                    "UPDATE Room SET updatedAt=?1 WHERE id=?2",
                    params![now_ts(), room_id],
                )?;
                Ok(srv_ok(json!({})))
            }
            "set_host" => {
                let room_id = i64_field(data, "roomId");
                let host = i64_field(data, "hostPlayerId");
                if room_id <= 0 || host <= 0 {
                    return Err(code("missing_fields"));
                }
                self.conn.execute(
                    "UPDATE Room SET hostPlayerId=?1, updatedAt=?2 WHERE id=?3",
                    params![host, now_ts(), room_id],
                )?;
                Ok(srv_ok(json!({})))
            }
            "set_status" => {
                let room_id = i64_field(data, "roomId");
                let status = str_field(data, "status").ok_or(code("missing_fields"))?;
                if room_id <= 0 {
                    return Err(code("missing_fields"));
                }
                self.conn.execute(
                    "UPDATE Room SET status=?1, updatedAt=?2 WHERE id=?3",
                    params![status, now_ts(), room_id],
                )?;
                Ok(srv_ok(json!({})))
            }
            "delete_if_empty" => {
                let room_id = i64_field(data, "roomId");
                if room_id <= 0 {
                    return Err(code("missing_fields"));
                }
                let members: i64 = self.conn.query_row(
                    "SELECT COUNT(*) FROM RoomMember WHERE roomId=?1",
                    params![room_id],
                    |r| r.get(0),
                )?;
                if members != 0 {
                    return Err(code("not_empty"));
                }
                self.conn
                    .execute("DELETE FROM Room WHERE id=?1", params![room_id])?;
                Ok(srv_ok(json!({})))
            }
            "has_playing_for_gameId" => {
                let game_id = str_field(data, "gameId").ok_or(code("missing_fields"))?;
                let playing: Option<i64> = self
                    .conn
                    .query_row(
                        "SELECT 1 FROM Room r JOIN Game g ON g.id=r.gameRef \
                         WHERE g.gameId=?1 AND r.status='playing' LIMIT 1",
                        params![game_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(srv_ok(json!({"data": {"playing": playing.is_some()}})))
            }
            _ => Err(code("unknown_action")),
        }
    }

    fn room_members(&self, room_id: i64) -> Result<Vec<i64>, rusqlite::Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT playerId FROM RoomMember WHERE roomId=?1 ORDER BY joinedAt ASC, playerId ASC")?;
        let members = stmt
            .query_map(params![room_id], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(members)
    }

    // -------------------------
    // MatchLog
    // -------------------------
    fn match_log_action(&mut self, action: &str, data: &Value) -> StoreResult {
        match action {
            "create" => {
                for key in ["roomId", "gameDbId", "gameVersionId", "startedAt", "endedAt", "reason", "resultsJson"] {
                    if data.get(key).is_none() {
                        return Err(code("missing_fields"));
                    }
                }
                let winner = data.get("winnerPlayerId").and_then(Value::as_i64).filter(|w| *w > 0);
                let participants: Vec<i64> = data
                    .get("participants")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                let tx = self.conn.transaction()?;
                tx.execute(
                    "INSERT INTO MatchLog(roomId,gameRef,gameVersionRef,startedAt,endedAt,reason,winnerPlayerId,resultsJson) \
                     VALUES(?1,?2,?3,?4,?5,?6,?7,?8)",
                    params![
                        i64_field(data, "roomId"),
                        i64_field(data, "gameDbId"),
                        i64_field(data, "gameVersionId"),
                        i64_field(data, "startedAt"),
                        i64_field(data, "endedAt"),
                        data["reason"].as_str().unwrap_or(""),
                        winner,
                        data["resultsJson"].as_str().unwrap_or(""),
                    ],
                )?;
                let match_log_id = tx.last_insert_rowid();
                for player_id in participants {
                    tx.execute(
                        "INSERT OR IGNORE INTO MatchParticipant(matchLogId,playerId) VALUES(?1,?2)",
                        params![match_log_id, player_id],
                    )?;
                }
                tx.commit()?;
                Ok(srv_ok(json!({"data": {"matchLogId": match_log_id}})))
            }
            "has_player_played" => {
                let game_id = str_field(data, "gameId").ok_or(code("missing_fields"))?;
                let player_id = i64_field(data, "playerId");
                if player_id <= 0 {
                    return Err(code("missing_fields"));
                }
                let (game_ref, _) = self
                    .game_by_game_id(&game_id)?
                    .ok_or(code("not_found"))?;
                let played: Option<i64> = self
                    .conn
                    .query_row(
                        "SELECT 1 FROM MatchLog ml \
                         JOIN MatchParticipant mp ON mp.matchLogId=ml.id \
                         WHERE ml.gameRef=?1 AND mp.playerId=?2 LIMIT 1",
                        params![game_ref, player_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(srv_ok(json!({"data": {"played": played.is_some()}})))
            }
            "list_by_player" => {
                let player_id = i64_field(data, "playerId");
                if player_id <= 0 {
                    return Err(code("missing_fields"));
                }
                let mut stmt = self.conn.prepare(
                    "SELECT ml.id,ml.roomId,ml.startedAt,ml.endedAt,ml.reason,\
                     ml.winnerPlayerId,ml.resultsJson,g.gameId,gv.version \
                     FROM MatchLog ml \
                     JOIN MatchParticipant mp ON mp.matchLogId=ml.id \
                     JOIN Game g ON g.id=ml.gameRef \
                     JOIN GameVersion gv ON gv.id=ml.gameVersionRef \
                     WHERE mp.playerId=?1 \
                     ORDER BY ml.endedAt DESC, ml.id DESC LIMIT ?2",
                )?;
                let logs: Vec<Value> = stmt
                    .query_map(params![player_id, MATCH_LIST_LIMIT], |r| {
                        Ok(json!({
                            "id": r.get::<_, i64>(0)?,
                            "roomId": r.get::<_, i64>(1)?,
                            "startedAt": r.get::<_, i64>(2)?,
                            "endedAt": r.get::<_, i64>(3)?,
                            "reason": r.get::<_, String>(4)?,
                            "winnerPlayerId": r.get::<_, Option<i64>>(5)?,
                            "resultsJson": r.get::<_, String>(6)?,
                            "gameId": r.get::<_, String>(7)?,
                            "version": r.get::<_, String>(8)?,
                        }))
                    })?
                    .collect::<Result<_, _>>()?;
                Ok(srv_ok(json!({"logs": logs})))
            }
            _ => Err(code("unknown_action")),
        }
    }
}

fn user_row(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "username": r.get::<_, String>(1)?,
        "createdAt": r.get::<_, i64>(2)?,
        "lastLoginAt": r.get::<_, Option<i64>>(3)?,
    }))
}

fn game_row(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "gameId": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "description": r.get::<_, String>(3)?,
        "developerId": r.get::<_, i64>(4)?,
        "delisted": r.get::<_, i64>(5)?,
        "createdAt": r.get::<_, i64>(6)?,
        "updatedAt": r.get::<_, i64>(7)?,
    }))
}

fn version_row(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "gameRef": r.get::<_, i64>(1)?,
        "version": r.get::<_, String>(2)?,
        "changelog": r.get::<_, Option<String>>(3)?,
        "uploadedAt": r.get::<_, i64>(4)?,
        "fileName": r.get::<_, String>(5)?,
        "sizeBytes": r.get::<_, i64>(6)?,
        "sha256": r.get::<_, String>(7)?,
        "zipPath": r.get::<_, String>(8)?,
        "extractedPath": r.get::<_, String>(9)?,
        "manifestJson": r.get::<_, String>(10)?,
        "clientType": r.get::<_, String>(11)?,
        "minPlayers": r.get::<_, i64>(12)?,
        "maxPlayers": r.get::<_, i64>(13)?,
    }))
}

fn version_summary_row(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "version": r.get::<_, String>(1)?,
        "uploadedAt": r.get::<_, i64>(2)?,
        "changelog": r.get::<_, Option<String>>(3)?,
        "fileName": r.get::<_, String>(4)?,
        "sizeBytes": r.get::<_, i64>(5)?,
        "sha256": r.get::<_, String>(6)?,
        "clientType": r.get::<_, String>(7)?,
        "minPlayers": r.get::<_, i64>(8)?,
        "maxPlayers": r.get::<_, i64>(9)?,
    }))
}

fn room_detail_row(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "hostPlayerId": r.get::<_, i64>(1)?,
        "status": r.get::<_, String>(2)?,
        "createdAt": r.get::<_, i64>(3)?,
        "updatedAt": r.get::<_, i64>(4)?,
        "gameDbId": r.get::<_, i64>(5)?,
        "gameId": r.get::<_, String>(6)?,
        "gameName": r.get::<_, String>(7)?,
        "delisted": r.get::<_, i64>(8)?,
        "gameVersionId": r.get::<_, i64>(9)?,
        "version": r.get::<_, String>(10)?,
        "clientType": r.get::<_, String>(11)?,
        "minPlayers": r.get::<_, i64>(12)?,
        "maxPlayers": r.get::<_, i64>(13)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(db: &mut Database, collection: &str, action: &str, data: Value) -> Value {
        db.dispatch(&json!({"collection": collection, "action": action, "data": data}))
    }

    fn seed_game(db: &mut Database) -> (i64, i64) {
        call(
            db,
            "DevUser",
            "register",
            json!({"username": "dev1", "password": "p"}),
        );
        let g = call(
            db,
            "Game",
            "create",
            json!({"gameId": "g1", "name": "G One", "description": "d", "developerId": 1}),
        );
        let game_db_id = g["data"]["gameDbId"].as_i64().unwrap();
        let v = call(
            db,
            "GameVersion",
            "create",
            json!({
                "gameDbId": game_db_id, "version": "1.0.0", "changelog": "",
                "fileName": "g1.zip", "sizeBytes": 4, "sha256": "ab",
                "zipPath": "/tmp/p.zip", "extractedPath": "/tmp/x",
                "manifestJson": "{}", "clientType": "cli",
                "minPlayers": 2, "maxPlayers": 4
            }),
        );
        (game_db_id, v["data"]["gameVersionId"].as_i64().unwrap())
    }

    #[test]
    fn register_login_round_trip() {
        let mut db = Database::open_in_memory().unwrap();
        let r = call(
            &mut db,
            "PlayerUser",
            "register",
            json!({"username": "pl1", "password": "secret"}),
        );
        assert_eq!(r["status"], "OK");
        let dup = call(
            &mut db,
            "PlayerUser",
            "register",
            json!({"username": "pl1", "password": "x"}),
        );
        assert_eq!(dup["error"], "username_exists");

        let login = call(
            &mut db,
            "PlayerUser",
            "login",
            json!({"username": "pl1", "password": "secret"}),
        );
        assert_eq!(login["status"], "OK");
        assert_eq!(login["data"]["playerId"], 1);

        let bad = call(
            &mut db,
            "PlayerUser",
            "login",
            json!({"username": "pl1", "password": "wrong"}),
        );
        assert_eq!(bad["error"], "bad_credentials");
    }

    #[test]
    fn developer_and_player_namespaces_are_independent() {
        let mut db = Database::open_in_memory().unwrap();
        call(&mut db, "DevUser", "register", json!({"username": "sam", "password": "a"}));
        let r = call(
            &mut db,
            "PlayerUser",
            "register",
            json!({"username": "sam", "password": "b"}),
        );
        assert_eq!(r["status"], "OK");
    }

    #[test]
    fn version_uniqueness_and_game_bump() {
        let mut db = Database::open_in_memory().unwrap();
        let (game_db_id, _) = seed_game(&mut db);
        let dup = call(
            &mut db,
            "GameVersion",
            "create",
            json!({
                "gameDbId": game_db_id, "version": "1.0.0",
                "fileName": "f", "sizeBytes": 1, "sha256": "x",
                "zipPath": "z", "extractedPath": "e", "manifestJson": "{}",
                "clientType": "cli", "minPlayers": 1, "maxPlayers": 1
            }),
        );
        assert_eq!(dup["error"], "version_exists");
    }

    #[test]
    fn delisted_game_hides_versions_and_listing() {
        let mut db = Database::open_in_memory().unwrap();
        seed_game(&mut db);
        let r = call(
            &mut db,
            "Game",
            "set_delisted",
            json!({"gameId": "g1", "delisted": true, "developerId": 1}),
        );
        assert_eq!(r["status"], "OK");
        let latest = call(&mut db, "GameVersion", "latest_for_gameId", json!({"gameId": "g1"}));
        assert_eq!(latest["error"], "game_delisted");
        let public = call(&mut db, "Game", "list_public", json!({}));
        assert_eq!(public["games"].as_array().unwrap().len(), 0);

        let not_owner = call(
            &mut db,
            "Game",
            "set_delisted",
            json!({"gameId": "g1", "delisted": false, "developerId": 99}),
        );
        assert_eq!(not_owner["error"], "not_owner");
    }

    #[test]
    fn room_membership_ordering_and_delete_if_empty() {
        let mut db = Database::open_in_memory().unwrap();
        let (game_db_id, version_id) = seed_game(&mut db);
        let room = call(
            &mut db,
            "Room",
            "create",
            json!({"hostPlayerId": 10, "gameDbId": game_db_id, "gameVersionId": version_id}),
        );
        let room_id = room["data"]["roomId"].as_i64().unwrap();
        call(&mut db, "Room", "add_member", json!({"roomId": room_id, "playerId": 11}));
        call(&mut db, "Room", "add_member", json!({"roomId": room_id, "playerId": 12}));

        let detail = call(&mut db, "Room", "get", json!({"roomId": room_id}));
        assert_eq!(detail["data"]["players"], json!([10, 11, 12]));
        assert_eq!(detail["data"]["maxPlayers"], 4);

        let not_empty = call(&mut db, "Room", "delete_if_empty", json!({"roomId": room_id}));
        assert_eq!(not_empty["error"], "not_empty");

        for p in [10, 11, 12] {
            call(&mut db, "Room", "remove_member", json!({"roomId": room_id, "playerId": p}));
        }
        let deleted = call(&mut db, "Room", "delete_if_empty", json!({"roomId": room_id}));
        assert_eq!(deleted["status"], "OK");
        let gone = call(&mut db, "Room", "get", json!({"roomId": room_id}));
        assert_eq!(gone["error"], "not_found");
    }

    #[test]
    fn playing_room_visible_to_delist_guard() {
        let mut db = Database::open_in_memory().unwrap();
        let (game_db_id, version_id) = seed_game(&mut db);
        let room = call(
            &mut db,
            "Room",
            "create",
            json!({"hostPlayerId": 10, "gameDbId": game_db_id, "gameVersionId": version_id}),
        );
        let room_id = room["data"]["roomId"].as_i64().unwrap();
        let idle = call(&mut db, "Room", "has_playing_for_gameId", json!({"gameId": "g1"}));
        assert_eq!(idle["data"]["playing"], json!(false));

        call(&mut db, "Room", "set_status", json!({"roomId": room_id, "status": "playing"}));
        let busy = call(&mut db, "Room", "has_playing_for_gameId", json!({"gameId": "g1"}));
        assert_eq!(busy["data"]["playing"], json!(true));
    }

    #[test]
    fn match_participants_gate_reviews() {
        let mut db = Database::open_in_memory().unwrap();
        let (game_db_id, version_id) = seed_game(&mut db);
        call(
            &mut db,
            "MatchLog",
            "create",
            json!({
                "roomId": 1, "gameDbId": game_db_id, "gameVersionId": version_id,
                "startedAt": 1, "endedAt": 2, "reason": "finished",
                "winnerPlayerId": 10,
                "resultsJson": "{\"players\":[{\"userId\":10},{\"userId\":11}],\"results\":[]}",
                "participants": [10, 11]
            }),
        );

        let played = call(
            &mut db,
            "MatchLog",
            "has_player_played",
            json!({"gameId": "g1", "playerId": 10}),
        );
        assert_eq!(played["data"]["played"], json!(true));
        let not_played = call(
            &mut db,
            "MatchLog",
            "has_player_played",
            json!({"gameId": "g1", "playerId": 77}),
        );
        assert_eq!(not_played["data"]["played"], json!(false));

        let bad_rating = call(
            &mut db,
            "Review",
            "upsert",
            json!({"gameId": "g1", "playerId": 10, "rating": 6, "comment": ""}),
        );
        assert_eq!(bad_rating["error"], "bad_request");

        let first = call(
            &mut db,
            "Review",
            "upsert",
            json!({"gameId": "g1", "playerId": 10, "rating": 5, "comment": "ok"}),
        );
        assert_eq!(first["status"], "OK");
        let second = call(
            &mut db,
            "Review",
            "upsert",
            json!({"gameId": "g1", "playerId": 10, "rating": 2, "comment": "meh"}),
        );
        assert_eq!(second["status"], "OK");
        let reviews = call(&mut db, "Review", "list_for_gameId", json!({"gameId": "g1"}));
        let list = reviews["reviews"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["rating"], 2);
    }

    #[test]
    fn list_by_player_uses_participant_index() {
        let mut db = Database::open_in_memory().unwrap();
        let (game_db_id, version_id) = seed_game(&mut db);
        for n in 0..3 {
            call(
                &mut db,
                "MatchLog",
                "create",
                json!({
                    "roomId": 1, "gameDbId": game_db_id, "gameVersionId": version_id,
                    "startedAt": n, "endedAt": n + 1, "reason": "finished",
                    "resultsJson": "{}", "participants": [10]
                }),
            );
        }
        let logs = call(&mut db, "MatchLog", "list_by_player", json!({"playerId": 10}));
        assert_eq!(logs["logs"].as_array().unwrap().len(), 3);
        assert_eq!(logs["logs"][0]["gameId"], "g1");
        let none = call(&mut db, "MatchLog", "list_by_player", json!({"playerId": 99}));
        assert_eq!(none["logs"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn unknown_collection_and_action() {
        let mut db = Database::open_in_memory().unwrap();
        let r = db.dispatch(&json!({"collection": "Nope", "action": "x", "data": {}}));
        assert_eq!(r["error"], "unknown_collection");
        let r = call(&mut db, "Game", "explode", json!({}));
        assert_eq!(r["error"], "unknown_action");
    }
}
