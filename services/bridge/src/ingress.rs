//! WebSocket ingress: one task per active connection.
//!
//! Reads text frames, decodes them to JSON, and hands them to the processor
//! pool through the bounded queue.  Never touches the broker and never
//! retries a single frame; decode failures are logged and skipped, a full
//! queue turns the frame into a counted drop.

use crate::client::{Shared, WsRead, now_ms};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

/// The SUBSCRIBE control frame sent once per connection.
///
/// Request ids only need to be unique per connection; wall-clock
/// milliseconds masked to 31 bits keeps the value inside an i32 as the
/// upstream requires.
pub(crate) fn subscribe_frame(streams: &[String]) -> String {
    let id = now_ms() & 0x7FFF_FFFF;
    serde_json::json!({
        "method": "SUBSCRIBE",
        "params": streams,
        "id": id,
    })
    .to_string()
}

/// Read loop for one connection.  Exits on close, read error, or shutdown;
/// on exit it marks the client disconnected and signals the supervisor
/// (unless the bridge is already stopping).
pub(crate) async fn run_ingress(
    shared: Arc<Shared>,
    mut reader: WsRead,
    mut shutdown: watch::Receiver<bool>,
    disconnect_tx: mpsc::Sender<()>,
) {
    debug!("ingress started");
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            msg = reader.next() => {
                match msg {
                    None => {
                        warn!("websocket stream ended");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "websocket read error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        shared.touch_last_message();
                        match serde_json::from_str::<Value>(&text) {
                            Ok(frame) => shared.enqueue(frame),
                            Err(e) => error!(error = %e, "failed to parse websocket frame"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        shared.send_pong(payload).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        warn!("websocket closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    shared.set_connected(false);
    if shared.running() {
        let _ = disconnect_tx.try_send(());
    }
    debug!("ingress exited");
}
