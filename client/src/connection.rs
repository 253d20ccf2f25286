//! A framed connection that splits replies from pushed events.

use anyhow::{anyhow, bail};
use arcade_core::frame::{read_json, write_json};
use arcade_core::protocol::event_name;
use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A server-pushed event.
#[derive(Debug, Clone)]
pub struct EventFrame {
    pub name: String,
    pub data: Value,
}

pub struct Connection {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<Value>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Connect and start the demultiplexing reader.  Returns the connection
    /// and the channel carrying pushed events.
    pub async fn connect(
        addr: &str,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<EventFrame>)> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        let (reply_tx, replies) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(demux_loop(read_half, reply_tx, event_tx));
        Ok((
            Self {
                writer,
                replies,
                reader,
            },
            events,
        ))
    }

    /// Send one `{type, data}` request and await the next reply.
    pub async fn request(&mut self, kind: &str, data: Value) -> anyhow::Result<Value> {
        self.send(json!({"type": kind, "data": data})).await?;
        self.recv_reply().await
    }

    /// Send one request and fail unless the reply is `ok:true`.
    pub async fn request_ok(&mut self, kind: &str, data: Value) -> anyhow::Result<Value> {
        let reply = self.request(kind, data).await?;
        expect_ok(kind, reply)
    }

    pub async fn send(&mut self, frame: Value) -> anyhow::Result<()> {
        write_json(&mut self.writer, &frame).await?;
        Ok(())
    }

    /// The next non-event frame (a reply, or the lobby's greeting).
    pub async fn recv_reply(&mut self) -> anyhow::Result<Value> {
        self.replies
            .recv()
            .await
            .ok_or_else(|| anyhow!("connection closed"))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn expect_ok(kind: &str, reply: Value) -> anyhow::Result<Value> {
    if reply.get("ok").and_then(Value::as_bool) == Some(true) {
        Ok(reply)
    } else {
        let code = reply
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        bail!("{} failed: {}", kind, code)
    }
}

async fn demux_loop(
    mut reader: OwnedReadHalf,
    reply_tx: mpsc::UnboundedSender<Value>,
    event_tx: mpsc::UnboundedSender<EventFrame>,
) {
    loop {
        let frame = match read_json(&mut reader).await {
            Ok(Some(frame)) => frame,
            _ => break,
        };
        if let Some(name) = event_name(&frame) {
            let event = EventFrame {
                name: name.to_string(),
                data: frame.get("data").cloned().unwrap_or(Value::Null),
            };
            if event_tx.send(event).is_err() {
                break;
            }
        } else if reply_tx.send(frame).is_err() {
            break;
        }
    }
}
