//! TCP frame server for the record store.

use std::net::SocketAddr;
use std::sync::Arc;

use arcade_core::frame::{read_json, write_json, FrameError};
use arcade_env::Config;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::Database;

pub struct StoreServer {
    listener: TcpListener,
    db: Arc<Mutex<Database>>,
}

impl StoreServer {
    pub async fn bind(config: &Config) -> anyhow::Result<Self> {
        let db = Database::open(&config.db.sqlite_path)?;
        let addr = format!("{}:{}", config.db.bind_host, config.db.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            "store: sqlite at {:?}, listening on {}",
            config.db.sqlite_path,
            listener.local_addr()?
        );
        Ok(Self {
            listener,
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let db = self.db.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, db).await {
                    warn!("store connection from {} closed: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    db: Arc<Mutex<Database>>,
) -> Result<(), FrameError> {
    loop {
        let request = match read_json(&mut stream).await {
            Ok(Some(req)) => req,
            Ok(None) => return Ok(()),
            Err(FrameError::BadJson(_)) => {
                write_json(&mut stream, &json!({"status": "ERR", "error": "exception"})).await?;
                continue;
            }
            Err(e) => return Err(e),
        };
        let reply = db.lock().await.dispatch(&request);
        write_json(&mut stream, &reply).await?;
    }
}
