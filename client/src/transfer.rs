//! Chunked upload/download loops over a [`Connection`].

use anyhow::bail;
use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::Connection;

/// Raw bytes per chunk; matches the server-side cap.
pub const CHUNK_SIZE: usize = 32 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Drive a full `game_upload_init` / `game_upload_chunk`* /
/// `game_upload_finish` cycle.  `init_extra` carries the optional init
/// fields (gameId, name, description, ...).  Returns the finish reply.
pub async fn upload_package(
    conn: &mut Connection,
    version: &str,
    file_name: &str,
    bytes: &[u8],
    init_extra: Value,
    changelog: &str,
) -> anyhow::Result<Value> {
    let mut init = json!({
        "version": version,
        "fileName": file_name,
        "sizeBytes": bytes.len(),
        "sha256": sha256_hex(bytes),
    });
    if let (Some(dst), Some(src)) = (init.as_object_mut(), init_extra.as_object()) {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
    let opened = conn.request_ok("game_upload_init", init).await?;
    let upload_id = opened
        .get("uploadId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if upload_id.is_empty() {
        bail!("upload init returned no uploadId");
    }

    for (seq, chunk) in bytes.chunks(CHUNK_SIZE).enumerate() {
        conn.request_ok(
            "game_upload_chunk",
            json!({
                "uploadId": upload_id.as_str(),
                "seq": seq,
                "dataB64": base64::engine::general_purpose::STANDARD.encode(chunk),
            }),
        )
        .await?;
    }

    conn.request_ok(
        "game_upload_finish",
        json!({"uploadId": upload_id.as_str(), "changelog": changelog}),
    )
    .await
}

/// Open a download session and pull the whole file with client-driven
/// offsets.  Returns the bytes and the init reply (fileName, sha256, ...).
pub async fn download_package(
    conn: &mut Connection,
    game_id: &str,
    version: Option<&str>,
    limit: usize,
) -> anyhow::Result<(Vec<u8>, Value)> {
    let mut init = json!({"gameId": game_id});
    if let Some(version) = version {
        init["version"] = json!(version);
    }
    let opened = conn.request_ok("store_download_init", init).await?;
    let download_id = opened
        .get("downloadId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let size = opened.get("sizeBytes").and_then(Value::as_u64).unwrap_or(0);

    let mut bytes = Vec::with_capacity(size as usize);
    loop {
        let reply = conn
            .request_ok(
                "store_download_chunk",
                json!({
                    "downloadId": download_id.as_str(),
                    "offset": bytes.len(),
                    "limit": limit,
                }),
            )
            .await?;
        let chunk = base64::engine::general_purpose::STANDARD
            .decode(reply.get("dataB64").and_then(Value::as_str).unwrap_or(""))?;
        bytes.extend_from_slice(&chunk);
        if reply.get("done").and_then(Value::as_bool) == Some(true) {
            break;
        }
        if chunk.is_empty() {
            bail!("download stalled before completion");
        }
    }
    Ok((bytes, opened))
}
