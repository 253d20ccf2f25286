//! Store RPC client.
//!
//! Every call opens a fresh connection to the record store, sends one
//! `{collection, action, data}` frame, and reads one `{status, ...}` reply.
//! Transport failures and timeouts surface as `db_error:<detail>`.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tracing::warn;

use crate::error::ApiError;
use crate::frame::{read_json, write_json};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StoreClient {
    addr: String,
}

impl StoreClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
        }
    }

    /// One request, one reply.  `Err` means the store was unreachable or the
    /// call timed out; an in-band `status:"ERR"` still returns `Ok`.
    pub async fn call(
        &self,
        collection: &str,
        action: &str,
        data: Value,
    ) -> Result<StoreReply, ApiError> {
        let request = json!({"collection": collection, "action": action, "data": data});
        match tokio::time::timeout(CALL_TIMEOUT, self.call_inner(&request)).await {
            Ok(Ok(reply)) => Ok(StoreReply(reply)),
            Ok(Err(e)) => {
                warn!("store call {}/{} failed: {}", collection, action, e);
                Err(ApiError::Db(e.to_string()))
            }
            Err(_) => {
                warn!("store call {}/{} timed out", collection, action);
                Err(ApiError::Db("timeout".into()))
            }
        }
    }

    async fn call_inner(&self, request: &Value) -> std::io::Result<Value> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        write_json(&mut stream, request)
            .await
            .map_err(std::io::Error::other)?;
        match read_json(&mut stream).await.map_err(std::io::Error::other)? {
            Some(reply) => Ok(reply),
            None => Err(std::io::Error::other("no response")),
        }
    }
}

/// A `{status:"OK"|"ERR", ...}` reply from the store.
#[derive(Debug, Clone)]
pub struct StoreReply(Value);

impl StoreReply {
    pub fn is_ok(&self) -> bool {
        self.0.get("status").and_then(Value::as_str) == Some("OK")
    }

    /// The relayed error for a failed reply, or `fallback` when the store
    /// did not name one.
    pub fn into_error(self, fallback: &str) -> ApiError {
        let code = self
            .0
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or(fallback);
        ApiError::Store(code.to_string())
    }

    pub fn error_code(&self) -> Option<&str> {
        self.0.get("error").and_then(Value::as_str)
    }

    /// The `data` object of an OK reply.
    pub fn data(&self) -> Value {
        self.0.get("data").cloned().unwrap_or(Value::Null)
    }

    /// A top-level field such as `games`, `rooms`, `reviews` or `logs`.
    pub fn field(&self, key: &str) -> Value {
        self.0.get(key).cloned().unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_accessors() {
        let ok = StoreReply(json!({"status": "OK", "data": {"roomId": 5}, "rooms": [1]}));
        assert!(ok.is_ok());
        assert_eq!(ok.data()["roomId"], json!(5));
        assert_eq!(ok.field("rooms"), json!([1]));

        let err = StoreReply(json!({"status": "ERR", "error": "not_found"}));
        assert!(!err.is_ok());
        assert_eq!(err.into_error("x"), ApiError::Store("not_found".into()));

        let bare = StoreReply(json!({"status": "ERR"}));
        assert_eq!(bare.into_error("list_failed"), ApiError::Store("list_failed".into()));
    }

    #[tokio::test]
    async fn unreachable_store_is_a_db_error() {
        let client = StoreClient::new("127.0.0.1", 1);
        let err = client.call("Game", "list_public", json!({})).await.unwrap_err();
        assert!(err.to_string().starts_with("db_error:"));
    }
}
