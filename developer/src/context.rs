//! Shared state of the developer service.

use std::collections::HashSet;
use std::path::PathBuf;

use arcade_core::rpc::StoreClient;
use arcade_env::Config;
use tokio::sync::Mutex;

pub struct DevContext {
    pub store: StoreClient,
    pub upload_root: PathBuf,
    pub tmp_root: PathBuf,
    /// Developer ids with a live authenticated connection.
    pub online: Mutex<HashSet<i64>>,
}

impl DevContext {
    pub fn new(config: &Config) -> Self {
        Self {
            store: StoreClient::new(&config.db.host, config.db.port),
            upload_root: config.developer_server.upload_root.clone(),
            tmp_root: config.developer_server.tmp_root.clone(),
            online: Mutex::new(HashSet::new()),
        }
    }
}

/// The authenticated identity bound to one connection.
#[derive(Debug, Clone)]
pub struct DevSession {
    pub developer_id: i64,
    pub username: String,
}
