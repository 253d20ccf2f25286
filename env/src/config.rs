//! Configuration of the platform services.
//!
//! A single TOML document configures all three services; each recognized
//! option can be overridden with an `ARCADE_*` environment variable, which
//! takes precedence over the file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::{fs::File, io::AsyncReadExt};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub bind_host: String,
    pub sqlite_path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 10101,
            bind_host: "0.0.0.0".into(),
            sqlite_path: "data/arcade.sqlite3".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeveloperServerConfig {
    pub bind_host: String,
    pub port: u16,
    pub upload_root: PathBuf,
    pub tmp_root: PathBuf,
}

impl Default for DeveloperServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            port: 10102,
            upload_root: "data/uploaded_games".into(),
            tmp_root: "data/tmp_uploads".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LobbyServerConfig {
    pub bind_host: String,
    pub port: u16,
    pub internal_host: Option<String>,
    pub run_root: PathBuf,
    pub game_port_min: u16,
    pub game_port_max: u16,
}

impl Default for LobbyServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            port: 10103,
            internal_host: None,
            run_root: "data/run".into(),
            game_port_min: 10000,
            game_port_max: 20000,
        }
    }
}

impl LobbyServerConfig {
    /// The address game servers use to reach back to the lobby: the
    /// configured internal host, or the bind host when it is routable.
    pub fn internal_host(&self) -> String {
        if let Some(ref host) = self.internal_host {
            return host.clone();
        }
        match self.bind_host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1".into(),
            other => other.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub game_host_public: Option<String>,
    pub db: DbConfig,
    pub developer_server: DeveloperServerConfig,
    pub lobby_server: LobbyServerConfig,
}

impl Config {
    /// The host advertised to players in `game_info`.
    pub fn game_host_public(&self) -> String {
        self.game_host_public
            .clone()
            .unwrap_or_else(|| "127.0.0.1".into())
    }

    pub async fn from_path(path: &Path) -> anyhow::Result<Config> {
        info!("Load configuration: {:?}", path);
        let mut buf = String::with_capacity(1024);
        let mut f = File::open(path).await?;
        f.read_to_string(&mut buf).await?;
        let mut config: Config = toml::from_str(&buf)?;
        config.apply_env();
        Ok(config)
    }

    /// Load from `path` when given and present; otherwise start from the
    /// defaults.  Environment overrides always apply.
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        match path {
            Some(p) if p.exists() => Self::from_path(p).await,
            _ => {
                let mut config = Config::default();
                config.apply_env();
                Ok(config)
            }
        }
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_str("ARCADE_GAME_HOST_PUBLIC") {
            self.game_host_public = Some(v);
        }
        if let Some(v) = env_str("ARCADE_DB_HOST") {
            self.db.host = v;
        }
        if let Some(v) = env_u16("ARCADE_DB_PORT") {
            self.db.port = v;
        }
        if let Some(v) = env_str("ARCADE_DB_BIND_HOST") {
            self.db.bind_host = v;
        }
        if let Some(v) = env_str("ARCADE_DB_SQLITE_PATH") {
            self.db.sqlite_path = v.into();
        }
        if let Some(v) = env_str("ARCADE_DEV_BIND_HOST") {
            self.developer_server.bind_host = v;
        }
        if let Some(v) = env_u16("ARCADE_DEV_PORT") {
            self.developer_server.port = v;
        }
        if let Some(v) = env_str("ARCADE_UPLOAD_ROOT") {
            self.developer_server.upload_root = v.into();
        }
        if let Some(v) = env_str("ARCADE_TMP_ROOT") {
            self.developer_server.tmp_root = v.into();
        }
        if let Some(v) = env_str("ARCADE_LOBBY_BIND_HOST") {
            self.lobby_server.bind_host = v;
        }
        if let Some(v) = env_u16("ARCADE_LOBBY_PORT") {
            self.lobby_server.port = v;
        }
        if let Some(v) = env_str("ARCADE_LOBBY_INTERNAL_HOST") {
            self.lobby_server.internal_host = Some(v);
        }
        if let Some(v) = env_str("ARCADE_RUN_ROOT") {
            self.lobby_server.run_root = v.into();
        }
        if let Some(v) = env_u16("ARCADE_GAME_PORT_MIN") {
            self.lobby_server.game_port_min = v;
        }
        if let Some(v) = env_u16("ARCADE_GAME_PORT_MAX") {
            self.lobby_server.game_port_max = v;
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    let v = std::env::var(name).ok()?;
    let v = v.trim();
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

fn env_u16(name: &str) -> Option<u16> {
    env_str(name)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_toml_sections() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
game_host_public = "198.51.100.7"

[db]
port = 7001

[lobby_server]
game_port_min = 42000
game_port_max = 42100
"#
        )
        .unwrap();
        let config = Config::from_path(f.path()).await.unwrap();
        assert_eq!(config.game_host_public(), "198.51.100.7");
        assert_eq!(config.db.port, 7001);
        assert_eq!(config.db.host, "127.0.0.1");
        assert_eq!(config.lobby_server.game_port_min, 42000);
        assert_eq!(config.developer_server.port, 10102);
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/arcade.toml")))
            .await
            .unwrap();
        assert_eq!(config.db.port, 10101);
        assert_eq!(config.game_host_public(), "127.0.0.1");
    }

    #[test]
    fn internal_host_resolution() {
        let mut lobby = LobbyServerConfig::default();
        assert_eq!(lobby.internal_host(), "127.0.0.1");
        lobby.bind_host = "10.0.0.5".into();
        assert_eq!(lobby.internal_host(), "10.0.0.5");
        lobby.internal_host = Some("lobby.internal".into());
        assert_eq!(lobby.internal_host(), "lobby.internal");
    }
}
