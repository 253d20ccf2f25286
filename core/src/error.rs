//! Stable wire error codes.
//!
//! The `Display` form of each variant is exactly the code sent on the wire;
//! [`ApiError::reply`] builds the full `{ok:false, error, ...}` frame,
//! including the extra fields some codes carry.

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    // Identity / session
    #[error("missing_fields")]
    MissingFields,
    #[error("bad_credentials")]
    BadCredentials,
    #[error("username_exists")]
    UsernameExists,
    #[error("already_online")]
    AlreadyOnline,
    #[error("not_logged_in")]
    NotLoggedIn,

    // Ownership / authority
    #[error("not_owner")]
    NotOwner,
    #[error("not_host")]
    NotHost,

    // Catalog state
    #[error("game_exists")]
    GameExists,
    #[error("version_exists")]
    VersionExists,
    #[error("game_delisted")]
    GameDelisted,
    #[error("no_version")]
    NoVersion,
    #[error("no_such_game")]
    NoSuchGame,
    #[error("missing_zip_on_server")]
    MissingZipOnServer,

    // Upload validation
    #[error("bad_game_id")]
    BadGameId,
    #[error("bad_version")]
    BadVersion,
    #[error("bad_seq")]
    BadSeq { expected: u64 },
    #[error("bad_base64")]
    BadBase64,
    #[error("empty_chunk")]
    EmptyChunk,
    #[error("too_large")]
    TooLarge,
    #[error("size_mismatch")]
    SizeMismatch { received: u64, expected: u64 },
    #[error("hash_mismatch")]
    HashMismatch { got: String, expected: String },
    #[error("unsafe_zip_entry")]
    UnsafeZipEntry,
    #[error("missing_manifest")]
    MissingManifest,
    #[error("bad_manifest_json")]
    BadManifestJson,
    #[error("bad_manifest")]
    BadManifest,
    #[error("manifest_gameId_mismatch")]
    ManifestGameIdMismatch { manifest: String, expected: String },
    #[error("manifest_version_mismatch")]
    ManifestVersionMismatch { manifest: String, expected: String },
    #[error("missing_server_entry")]
    MissingServerEntry { path: String },
    #[error("missing_client_entry")]
    MissingClientEntry { path: String },
    #[error("no_such_upload")]
    NoSuchUpload,
    #[error("extract_failed:{0}")]
    ExtractFailed(String),

    // Rooms
    #[error("already_in_room")]
    AlreadyInRoom { room_id: i64 },
    #[error("room_full")]
    RoomFull,
    #[error("room_playing")]
    RoomPlaying,
    #[error("need_more_players")]
    NeedMorePlayers { min_players: i64 },
    #[error("no_such_room")]
    NoSuchRoom,
    #[error("bad_room_id")]
    BadRoomId,
    #[error("already_playing")]
    AlreadyPlaying,
    #[error("game_in_progress")]
    GameInProgress,
    #[error("no_free_port")]
    NoFreePort,
    #[error("spawn_failed:{0}")]
    SpawnFailed(String),
    #[error("bad_argv_template:{0}")]
    BadArgvTemplate(String),

    // Downloads / reviews
    #[error("no_such_download")]
    NoSuchDownload,
    #[error("read_failed")]
    ReadFailed,
    #[error("not_played")]
    NotPlayed,
    #[error("bad_request")]
    BadRequest,

    // Transport / dispatch
    #[error("unknown_type")]
    UnknownType,
    #[error("db_error:{0}")]
    Db(String),
    /// A code relayed verbatim from a store reply.
    #[error("{0}")]
    Store(String),
}

impl ApiError {
    /// The full error reply frame, with any extra diagnostic fields.
    pub fn reply(&self) -> Value {
        let mut body = json!({"ok": false, "error": self.to_string()});
        match self {
            ApiError::BadSeq { expected } => {
                body["expected"] = json!(expected);
            }
            ApiError::SizeMismatch { received, expected } => {
                body["received"] = json!(received);
                body["expected"] = json!(expected);
            }
            ApiError::HashMismatch { got, expected } => {
                body["got"] = json!(got);
                body["expected"] = json!(expected);
            }
            ApiError::ManifestGameIdMismatch { manifest, expected } => {
                body["manifestGameId"] = json!(manifest);
                body["expected"] = json!(expected);
            }
            ApiError::ManifestVersionMismatch { manifest, expected } => {
                body["manifestVersion"] = json!(manifest);
                body["expected"] = json!(expected);
            }
            ApiError::MissingServerEntry { path } | ApiError::MissingClientEntry { path } => {
                body["path"] = json!(path);
            }
            ApiError::AlreadyInRoom { room_id } => {
                body["roomId"] = json!(room_id);
            }
            ApiError::NeedMorePlayers { min_players } => {
                body["minPlayers"] = json!(min_players);
            }
            _ => {}
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_wire_code() {
        assert_eq!(ApiError::RoomFull.to_string(), "room_full");
        assert_eq!(ApiError::Store("not_found".into()).to_string(), "not_found");
        assert_eq!(
            ApiError::Db("connection refused".into()).to_string(),
            "db_error:connection refused"
        );
    }

    #[test]
    fn reply_carries_extras() {
        let r = ApiError::BadSeq { expected: 3 }.reply();
        assert_eq!(r["ok"], json!(false));
        assert_eq!(r["error"], json!("bad_seq"));
        assert_eq!(r["expected"], json!(3));

        let r = ApiError::AlreadyInRoom { room_id: 9 }.reply();
        assert_eq!(r["roomId"], json!(9));
    }
}
