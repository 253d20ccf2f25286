//! Typed views of store records, as they appear on the wire.
//!
//! The store replies carry loosely-typed JSON; the services deserialize the
//! rows they actually act on into these structs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameVersionRow {
    pub id: i64,
    #[serde(default)]
    pub game_ref: i64,
    pub version: String,
    #[serde(default)]
    pub changelog: Option<String>,
    pub uploaded_at: i64,
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub zip_path: String,
    pub extracted_path: String,
    #[serde(default)]
    pub manifest_json: Option<String>,
    pub client_type: String,
    pub min_players: i64,
    pub max_players: i64,
}

/// The joined room view returned by the store's `Room.get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRow {
    pub id: i64,
    pub host_player_id: i64,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub game_db_id: i64,
    pub game_id: String,
    pub game_name: String,
    pub delisted: i64,
    pub game_version_id: i64,
    pub version: String,
    pub client_type: String,
    pub min_players: i64,
    pub max_players: i64,
    #[serde(default)]
    pub players: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn room_row_from_store_reply() {
        let row: RoomRow = serde_json::from_value(json!({
            "id": 1, "hostPlayerId": 10, "status": "waiting",
            "createdAt": 100, "updatedAt": 101,
            "gameDbId": 2, "gameId": "g1", "gameName": "Sample", "delisted": 0,
            "gameVersionId": 3, "version": "1.0.0", "clientType": "cli",
            "minPlayers": 2, "maxPlayers": 4, "players": [10, 11]
        }))
        .unwrap();
        assert_eq!(row.players, vec![10, 11]);
        assert_eq!(row.max_players, 4);
    }
}
