//! The package ingestion pipeline.
//!
//! An upload is a multi-frame, sequence-checked chunk stream.  The bytes are
//! appended to a temp file and hashed incrementally; `finish` verifies size
//! and digest, moves the archive into the upload root, extracts it with
//! traversal protection, cross-checks the manifest against the init
//! declaration, and commits the GameVersion record.

use std::path::{Path, PathBuf};

use arcade_core::manifest::{detect_package_root, is_valid_game_id, is_valid_version, GameManifest};
use arcade_core::{ApiError, Result};
use base64::Engine;
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::{DevContext, DevSession};

/// An in-flight chunked upload, owned by the connection that started it.
pub struct UploadSession {
    pub upload_id: String,
    pub developer_id: i64,
    pub game_id: String,
    pub version: String,
    pub file_name: String,
    pub expected_size: u64,
    pub expected_sha256: String,
    pub temp_path: PathBuf,
    pub received: u64,
    pub next_seq: u64,
    pub hasher: Sha256,
}

impl UploadSession {
    pub async fn discard(&self) {
        let _ = tokio::fs::remove_file(&self.temp_path).await;
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for c in name.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    slug.chars().take(32).collect()
}

fn hex_suffix(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Derive a unique gameId by probing the store, keeping the id readable
/// while avoiding collisions.
async fn reserve_unique_game_id(ctx: &DevContext, base: &str, developer_id: i64) -> Result<String> {
    let base = if base.is_empty() {
        format!("game_{}", developer_id)
    } else {
        base.to_string()
    };
    for attempt in 0..20 {
        let candidate = if attempt == 0 {
            base.clone()
        } else {
            format!("{}_{}", base, hex_suffix(2))
        };
        let reply = ctx
            .store
            .call("Game", "get_by_gameId", json!({"gameId": candidate}))
            .await?;
        if !reply.is_ok() {
            return Ok(candidate);
        }
    }
    Ok(format!("{}_{}", base, hex_suffix(6)))
}

async fn create_game_row(
    ctx: &DevContext,
    session: &DevSession,
    game_id: &str,
    data: &Value,
) -> Result<()> {
    let name = field(data, "name").ok_or(ApiError::MissingFields)?;
    let description = field(data, "description").ok_or(ApiError::MissingFields)?;
    let reply = ctx
        .store
        .call(
            "Game",
            "create",
            json!({
                "gameId": game_id,
                "name": name,
                "description": description,
                "developerId": session.developer_id,
            }),
        )
        .await?;
    if !reply.is_ok() {
        return Err(reply.into_error("create_failed"));
    }
    Ok(())
}

fn field(data: &Value, key: &str) -> Option<String> {
    let s = data.get(key)?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// `game_upload_init`.  Creates the Game row when needed and allocates the
/// temp file; returns the session and the `{uploadId, gameId, created}` reply.
pub async fn handle_init(
    ctx: &DevContext,
    session: &DevSession,
    data: &Value,
) -> Result<(UploadSession, Value)> {
    let game_id = field(data, "gameId");
    let version = field(data, "version").ok_or(ApiError::MissingFields)?;
    let expected_size = data
        .get("sizeBytes")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let expected_sha256 = field(data, "sha256")
        .ok_or(ApiError::MissingFields)?
        .to_lowercase();
    if expected_size == 0 {
        return Err(ApiError::MissingFields);
    }
    if !is_valid_version(&version) {
        return Err(ApiError::BadVersion);
    }
    if let Some(ref gid) = game_id {
        if !is_valid_game_id(gid) {
            return Err(ApiError::BadGameId);
        }
    }

    let mut auto_created = false;
    let game_id = match game_id {
        None => {
            // Server-assigned id from the game name.
            let name = field(data, "name").ok_or(ApiError::MissingFields)?;
            let gid = reserve_unique_game_id(ctx, &slugify(&name), session.developer_id).await?;
            create_game_row(ctx, session, &gid, data).await?;
            auto_created = true;
            gid
        }
        Some(gid) => {
            let reply = ctx
                .store
                .call("Game", "get_by_gameId", json!({"gameId": gid}))
                .await?;
            if reply.is_ok() {
                let owner = reply.data().get("developerId").and_then(Value::as_i64);
                if owner != Some(session.developer_id) {
                    return Err(ApiError::NotOwner);
                }
            } else if reply.error_code() == Some("not_found") {
                match create_game_row(ctx, session, &gid, data).await {
                    Ok(()) => auto_created = true,
                    Err(ApiError::Store(ref c)) if c == "game_exists" => {
                        // Lost a create race; re-check ownership.
                        let again = ctx
                            .store
                            .call("Game", "get_by_gameId", json!({"gameId": gid}))
                            .await?;
                        let owner = again.data().get("developerId").and_then(Value::as_i64);
                        if !again.is_ok() || owner != Some(session.developer_id) {
                            return Err(ApiError::Store("game_exists".into()));
                        }
                    }
                    Err(e) => return Err(e),
                }
            } else {
                return Err(reply.into_error("no_such_game"));
            }
            gid
        }
    };

    // A duplicate version should fail at init rather than after the bytes
    // have been transferred.
    let existing = ctx
        .store
        .call(
            "GameVersion",
            "get_for_gameId_version",
            json!({"gameId": game_id, "version": version}),
        )
        .await?;
    if existing.is_ok() {
        return Err(ApiError::VersionExists);
    }

    let upload_id = Uuid::new_v4().simple().to_string();
    tokio::fs::create_dir_all(&ctx.tmp_root)
        .await
        .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
    let temp_path = ctx.tmp_root.join(format!("{}.zip.part", upload_id));
    tokio::fs::write(&temp_path, b"")
        .await
        .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;

    let file_name = field(data, "fileName").unwrap_or_else(|| format!("{}-{}.zip", game_id, version));

    info!(
        "upload init: {} {} by developer {} ({} bytes)",
        game_id, version, session.developer_id, expected_size
    );

    let upload = UploadSession {
        upload_id: upload_id.clone(),
        developer_id: session.developer_id,
        game_id: game_id.clone(),
        version,
        file_name,
        expected_size,
        expected_sha256,
        temp_path,
        received: 0,
        next_seq: 0,
        hasher: Sha256::new(),
    };
    let reply = json!({"uploadId": upload_id, "gameId": game_id, "created": auto_created});
    Ok((upload, reply))
}

/// `game_upload_chunk`.  Strict sequencing, strict base64; validation
/// failures leave the session in place so the sender can resend the
/// expected sequence.  Returns the decoded bytes to append and the reply.
pub fn handle_chunk(upload: &mut UploadSession, data: &Value) -> Result<(Vec<u8>, Value)> {
    let seq = data.get("seq").and_then(Value::as_u64).unwrap_or(0);
    if seq != upload.next_seq {
        return Err(ApiError::BadSeq {
            expected: upload.next_seq,
        });
    }
    let chunk_b64 = data.get("dataB64").and_then(Value::as_str).unwrap_or("");
    let chunk = base64::engine::general_purpose::STANDARD
        .decode(chunk_b64)
        .map_err(|_| ApiError::BadBase64)?;
    if chunk.is_empty() {
        return Err(ApiError::EmptyChunk);
    }
    if upload.received + chunk.len() as u64 > upload.expected_size {
        return Err(ApiError::TooLarge);
    }
    upload.hasher.update(&chunk);
    upload.received += chunk.len() as u64;
    upload.next_seq += 1;
    let reply = json!({
        "received": upload.received,
        "expected": upload.expected_size,
    });
    Ok((chunk, reply))
}

/// Append verified chunk bytes to the temp file.
pub async fn append_chunk(upload: &UploadSession, chunk: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(&upload.temp_path)
        .await
        .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
    file.write_all(chunk)
        .await
        .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
    Ok(())
}

/// `game_upload_finish`.  Verifies, moves, extracts, cross-checks and
/// commits.  Any failure discards the upload and any staged package files;
/// the Game row stays.
pub async fn handle_finish(ctx: &DevContext, upload: UploadSession, data: &Value) -> Result<Value> {
    if upload.received != upload.expected_size {
        let err = ApiError::SizeMismatch {
            received: upload.received,
            expected: upload.expected_size,
        };
        upload.discard().await;
        return Err(err);
    }
    let digest = hex::encode(upload.hasher.clone().finalize());
    if digest != upload.expected_sha256 {
        let err = ApiError::HashMismatch {
            got: digest,
            expected: upload.expected_sha256.clone(),
        };
        upload.discard().await;
        return Err(err);
    }

    match commit_upload(ctx, &upload, data).await {
        Ok(reply) => Ok(reply),
        Err(e) => {
            upload.discard().await;
            Err(e)
        }
    }
}

async fn commit_upload(ctx: &DevContext, upload: &UploadSession, data: &Value) -> Result<Value> {
    // Reject escaping entries while the archive still sits in the temp
    // root, so a rejected package never lands under the upload root.
    {
        let temp_path = upload.temp_path.clone();
        tokio::task::spawn_blocking(move || validate_zip_entries(&temp_path))
            .await
            .map_err(|e| ApiError::ExtractFailed(e.to_string()))??;
    }

    let game_dir = ctx.upload_root.join(&upload.game_id).join(&upload.version);
    let zip_path = game_dir.join("package.zip");
    let extracted_path = game_dir.join("extracted");
    tokio::fs::create_dir_all(&game_dir)
        .await
        .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;

    if let Err(e) = move_file(&upload.temp_path, &zip_path).await {
        discard_staged(&game_dir, &zip_path, &extracted_path).await;
        return Err(e);
    }
    match publish_version(ctx, upload, data, &zip_path, &extracted_path).await {
        Ok(reply) => Ok(reply),
        Err(e) => {
            discard_staged(&game_dir, &zip_path, &extracted_path).await;
            Err(e)
        }
    }
}

/// Remove the staged archive and extraction tree of a failed finish,
/// dropping the version directory (and the game directory, when this was
/// its only version) once they are empty.
async fn discard_staged(game_dir: &Path, zip_path: &Path, extracted_path: &Path) {
    let _ = tokio::fs::remove_file(zip_path).await;
    let _ = tokio::fs::remove_dir_all(extracted_path).await;
    let _ = tokio::fs::remove_dir(game_dir).await;
    if let Some(parent) = game_dir.parent() {
        let _ = tokio::fs::remove_dir(parent).await;
    }
}

async fn publish_version(
    ctx: &DevContext,
    upload: &UploadSession,
    data: &Value,
    zip_path: &Path,
    extracted_path: &Path,
) -> Result<Value> {
    if extracted_path.exists() {
        tokio::fs::remove_dir_all(extracted_path)
            .await
            .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
    }
    {
        let zip_path = zip_path.to_path_buf();
        let extracted_path = extracted_path.to_path_buf();
        tokio::task::spawn_blocking(move || safe_extract_zip(&zip_path, &extracted_path))
            .await
            .map_err(|e| ApiError::ExtractFailed(e.to_string()))??;
    }

    let package_root = detect_package_root(extracted_path);
    let (manifest, raw) = GameManifest::load_from_dir(&package_root)?;
    if manifest.game_id != upload.game_id {
        return Err(ApiError::ManifestGameIdMismatch {
            manifest: manifest.game_id,
            expected: upload.game_id.clone(),
        });
    }
    if manifest.version != upload.version {
        return Err(ApiError::ManifestVersionMismatch {
            manifest: manifest.version,
            expected: upload.version.clone(),
        });
    }
    if !package_root.join(&manifest.entrypoints.server.module).exists() {
        return Err(ApiError::MissingServerEntry {
            path: manifest.entrypoints.server.module.clone(),
        });
    }
    if !package_root.join(&manifest.entrypoints.client.module).exists() {
        return Err(ApiError::MissingClientEntry {
            path: manifest.entrypoints.client.module.clone(),
        });
    }

    let game = ctx
        .store
        .call("Game", "get_by_gameId", json!({"gameId": upload.game_id}))
        .await?;
    if !game.is_ok() {
        return Err(game.into_error("no_such_game"));
    }
    let game_db_id = game.data().get("id").and_then(Value::as_i64).unwrap_or(0);
    if game_db_id <= 0 {
        return Err(ApiError::NoSuchGame);
    }

    let client_type = serde_json::to_value(manifest.client_type)
        .unwrap_or_else(|_| json!("cli"));
    let created = ctx
        .store
        .call(
            "GameVersion",
            "create",
            json!({
                "gameDbId": game_db_id,
                "version": upload.version,
                "changelog": data.get("changelog").and_then(Value::as_str).unwrap_or(""),
                "fileName": upload.file_name,
                "sizeBytes": upload.expected_size,
                "sha256": upload.expected_sha256,
                "zipPath": zip_path.to_string_lossy(),
                "extractedPath": package_root.to_string_lossy(),
                "manifestJson": raw.to_string(),
                "clientType": client_type,
                "minPlayers": manifest.min_players,
                "maxPlayers": manifest.max_players,
            }),
        )
        .await?;
    if !created.is_ok() {
        return Err(created.into_error("version_create_failed"));
    }
    let version_id = created.data().get("gameVersionId").cloned().unwrap_or(Value::Null);

    info!(
        "published {} {} as game version {}",
        upload.game_id, upload.version, version_id
    );
    Ok(json!({"gameVersionId": version_id}))
}

async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Cross-device fallback.
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
    let _ = tokio::fs::remove_file(from).await;
    Ok(())
}

/// Scan an archive for entries whose normalized path escapes the
/// extraction root (absolute paths or `..` components).
pub fn validate_zip_entries(zip_path: &Path) -> Result<()> {
    let file =
        std::fs::File::open(zip_path).map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
        if entry.enclosed_name().is_none() {
            warn!("rejecting unsafe zip entry: {:?}", entry.name());
            return Err(ApiError::UnsafeZipEntry);
        }
    }
    Ok(())
}

/// Extract a zip into `dst_dir`, rejecting any entry whose normalized path
/// escapes the destination (absolute paths or `..` components).
pub fn safe_extract_zip(zip_path: &Path, dst_dir: &Path) -> Result<()> {
    let file =
        std::fs::File::open(zip_path).map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| ApiError::ExtractFailed(e.to_string()))?;

    std::fs::create_dir_all(dst_dir).map_err(|e| ApiError::ExtractFailed(e.to_string()))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("rejecting unsafe zip entry: {:?}", entry.name());
            return Err(ApiError::UnsafeZipEntry);
        };
        let target = dst_dir.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
        }
        let mut out =
            std::fs::File::create(&target).map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| ApiError::ExtractFailed(e.to_string()))?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    #[test]
    fn slugify_names() {
        assert_eq!(slugify("Bomb Pass!"), "bomb_pass");
        assert_eq!(slugify("  Tic-Tac-Toe 3  "), "tic_tac_toe_3");
        assert_eq!(slugify("???"), "");
        assert_eq!(slugify(&"x".repeat(100)).len(), 32);
    }

    fn build_zip(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = zip::ZipWriter::new(file.reopen().unwrap());
        for (name, body) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
        file
    }

    #[test]
    fn extracts_nested_entries() {
        let zip = build_zip(&[
            ("manifest.json", b"{}".as_slice()),
            ("assets/sprites/a.txt", b"art".as_slice()),
        ]);
        let dst = tempfile::tempdir().unwrap();
        safe_extract_zip(zip.path(), dst.path()).unwrap();
        assert!(dst.path().join("manifest.json").exists());
        assert_eq!(
            std::fs::read(dst.path().join("assets/sprites/a.txt")).unwrap(),
            b"art"
        );
    }

    #[test]
    fn rejects_parent_traversal() {
        let zip = build_zip(&[("../evil", b"boom".as_slice())]);
        assert_eq!(
            validate_zip_entries(zip.path()).unwrap_err(),
            ApiError::UnsafeZipEntry
        );
        let dst = tempfile::tempdir().unwrap();
        let err = safe_extract_zip(zip.path(), dst.path()).unwrap_err();
        assert_eq!(err, ApiError::UnsafeZipEntry);
        assert!(!dst.path().parent().unwrap().join("evil").exists());

        let clean = build_zip(&[("manifest.json", b"{}".as_slice())]);
        validate_zip_entries(clean.path()).unwrap();
    }

    #[test]
    fn chunk_sequencing_and_limits() {
        let mut upload = UploadSession {
            upload_id: "u".into(),
            developer_id: 1,
            game_id: "g1".into(),
            version: "1".into(),
            file_name: "f.zip".into(),
            expected_size: 4,
            expected_sha256: String::new(),
            temp_path: PathBuf::from("/dev/null"),
            received: 0,
            next_seq: 0,
            hasher: Sha256::new(),
        };
        let b64 = |b: &[u8]| base64::engine::general_purpose::STANDARD.encode(b);

        let gap = handle_chunk(&mut upload, &json!({"seq": 1, "dataB64": b64(b"ab")}));
        assert_eq!(gap.unwrap_err(), ApiError::BadSeq { expected: 0 });

        let bad = handle_chunk(&mut upload, &json!({"seq": 0, "dataB64": "!!!"}));
        assert_eq!(bad.unwrap_err(), ApiError::BadBase64);

        let empty = handle_chunk(&mut upload, &json!({"seq": 0, "dataB64": ""}));
        assert_eq!(empty.unwrap_err(), ApiError::EmptyChunk);

        let (bytes, ok) = handle_chunk(&mut upload, &json!({"seq": 0, "dataB64": b64(b"ab")})).unwrap();
        assert_eq!(bytes, b"ab");
        assert_eq!(ok["received"], 2);
        assert_eq!(upload.next_seq, 1);

        let over = handle_chunk(&mut upload, &json!({"seq": 1, "dataB64": b64(b"xyz")}));
        assert_eq!(over.unwrap_err(), ApiError::TooLarge);
        // Failed chunk neither advances nor rewinds the sequence.
        assert_eq!(upload.next_seq, 1);
    }
}
