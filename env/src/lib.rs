mod config;

pub use config::{Config, DbConfig, DeveloperServerConfig, LobbyServerConfig};
