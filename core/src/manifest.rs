//! Game package manifests.
//!
//! Every uploaded package carries a `manifest.json` at its package root
//! describing the game identity, the player range, and the server/client
//! entrypoints.  Entrypoint argv entries may contain `{placeholder}` tokens
//! rendered at launch time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Cli,
    Gui,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entrypoint {
    pub module: String,
    #[serde(default)]
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entrypoints {
    pub server: Entrypoint,
    pub client: Entrypoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameManifest {
    pub game_id: String,
    pub name: String,
    pub version: String,
    pub developer: String,
    pub description: String,
    pub client_type: ClientType,
    pub min_players: i64,
    pub max_players: i64,
    pub entrypoints: Entrypoints,
}

impl GameManifest {
    /// Parse and validate a raw manifest object.
    pub fn parse(raw: &Value) -> Result<Self, ApiError> {
        if !raw.is_object() {
            return Err(ApiError::BadManifestJson);
        }
        let manifest: GameManifest =
            serde_json::from_value(raw.clone()).map_err(|_| ApiError::BadManifest)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.game_id.trim().is_empty()
            || self.name.trim().is_empty()
            || self.version.trim().is_empty()
            || self.developer.trim().is_empty()
        {
            return Err(ApiError::BadManifest);
        }
        if self.min_players < 1 || self.max_players < self.min_players {
            return Err(ApiError::BadManifest);
        }
        if self.entrypoints.server.module.trim().is_empty()
            || self.entrypoints.client.module.trim().is_empty()
        {
            return Err(ApiError::BadManifest);
        }
        Ok(())
    }

    /// Load and validate `manifest.json` from a package root.  Returns the
    /// parsed manifest together with the raw object (persisted verbatim).
    pub fn load_from_dir(dir: &Path) -> Result<(Self, Value), ApiError> {
        let path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).map_err(|_| ApiError::MissingManifest)?;
        let raw: Value = serde_json::from_str(&text).map_err(|_| ApiError::BadManifestJson)?;
        let manifest = Self::parse(&raw)?;
        Ok((manifest, raw))
    }
}

/// A gameId slug: `[A-Za-z0-9_-]{1,64}`.
pub fn is_valid_game_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A version string: `[A-Za-z0-9_.-]{1,64}`.
pub fn is_valid_version(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Locate the package root inside an extracted tree: the extraction root
/// itself, or its sole top-level directory when the archive wraps everything
/// in one folder.
pub fn detect_package_root(extracted: &Path) -> PathBuf {
    if extracted.join(MANIFEST_FILE).exists() {
        return extracted.to_path_buf();
    }
    if let Ok(entries) = std::fs::read_dir(extracted) {
        let children: Vec<_> = entries.flatten().collect();
        if children.len() == 1 && children[0].path().is_dir() {
            return children[0].path();
        }
    }
    extracted.to_path_buf()
}

/// Render argv templates, substituting `{key}` tokens from `vars`.  An
/// unknown placeholder fails the whole render.
pub fn render_argv(argv: &[String], vars: &HashMap<&str, String>) -> Result<Vec<String>, ApiError> {
    argv.iter().map(|arg| render_one(arg, vars)).collect()
}

fn render_one(template: &str, vars: &HashMap<&str, String>) -> Result<String, ApiError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let mut key = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(k) => key.push(k),
                None => return Err(ApiError::BadArgvTemplate(key)),
            }
        }
        match vars.get(key.as_str()) {
            Some(value) => out.push_str(value),
            None => return Err(ApiError::BadArgvTemplate(key)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "gameId": "g1",
            "name": "Sample",
            "version": "1.0.0",
            "developer": "dev1",
            "description": "a sample game",
            "clientType": "cli",
            "minPlayers": 2,
            "maxPlayers": 4,
            "entrypoints": {
                "server": {"module": "server_main", "argv": ["--port", "{port}"]},
                "client": {"module": "client_main"}
            }
        })
    }

    #[test]
    fn parses_valid_manifest() {
        let m = GameManifest::parse(&sample()).unwrap();
        assert_eq!(m.game_id, "g1");
        assert_eq!(m.client_type, ClientType::Cli);
        assert_eq!(m.entrypoints.client.argv, Vec::<String>::new());
    }

    #[test]
    fn rejects_bad_player_range() {
        let mut raw = sample();
        raw["minPlayers"] = json!(3);
        raw["maxPlayers"] = json!(2);
        assert_eq!(GameManifest::parse(&raw), Err(ApiError::BadManifest));

        raw["minPlayers"] = json!(0);
        assert_eq!(GameManifest::parse(&raw), Err(ApiError::BadManifest));
    }

    #[test]
    fn rejects_unknown_client_type() {
        let mut raw = sample();
        raw["clientType"] = json!("vr");
        assert_eq!(GameManifest::parse(&raw), Err(ApiError::BadManifest));
    }

    #[test]
    fn rejects_missing_entrypoint() {
        let mut raw = sample();
        raw["entrypoints"].as_object_mut().unwrap().remove("client");
        assert_eq!(GameManifest::parse(&raw), Err(ApiError::BadManifest));
    }

    #[test]
    fn slug_and_version_predicates() {
        assert!(is_valid_game_id("bomb_pass-2"));
        assert!(!is_valid_game_id(""));
        assert!(!is_valid_game_id("has space"));
        assert!(!is_valid_game_id(&"x".repeat(65)));
        assert!(is_valid_version("1.0.0-rc1"));
        assert!(!is_valid_version("1.0/0"));
    }

    #[test]
    fn renders_argv_placeholders() {
        let vars = HashMap::from([
            ("port", "12345".to_string()),
            ("token", "abcd".to_string()),
        ]);
        let argv = vec!["--port".to_string(), "{port}".to_string(), "t={token}".to_string()];
        assert_eq!(
            render_argv(&argv, &vars).unwrap(),
            vec!["--port", "12345", "t=abcd"]
        );

        let bad = vec!["{unknown}".to_string()];
        assert!(matches!(
            render_argv(&bad, &vars),
            Err(ApiError::BadArgvTemplate(_))
        ));
    }
}
