//! Ping keeper: periodic protocol-level pings on the active connection.
//!
//! One task per connection, relaunched by the supervisor after a re-dial.
//! Exits on the first send error and leaves re-establishment to the
//! supervisor.

use crate::client::Shared;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

pub(crate) async fn run_ping_keeper(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    debug!("ping keeper started");
    loop {
        let interval = shared.config().websocket.ping_interval();
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            () = tokio::time::sleep(interval) => {}
        }
        if !shared.running() || !shared.connected() {
            break;
        }
        match shared.send_ping().await {
            Ok(()) => shared.touch_last_ping(),
            Err(e) => {
                warn!(error = %e, "websocket ping failed");
                break;
            }
        }
    }
    debug!("ping keeper exited");
}
