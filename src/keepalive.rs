use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio::time;

use crate::error::Error;
use crate::session::Session;

/// Liveness probe sent on every firing.
pub(crate) const PROBE_COMMAND: &str = "PING";

/// Spawns the keepalive monitor: a single-shot sleep re-armed after each
/// firing, probing the connection through the locked executor path.
///
/// The monitor never reconnects. A failed probe leaves the session stale and
/// the next executor invocation (foreground or this timer's next round)
/// performs the recovery.
pub(crate) fn spawn(session: Arc<Session>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            time::sleep(interval).await;

            match session.execute(PROBE_COMMAND).await {
                Ok(response) => {
                    debug!("Keepalive probe answered: {:?}", response);
                }
                Err(Error::LockBusy) => {
                    // A foreground command is in flight; the connection is
                    // demonstrably alive, so this round is redundant anyway.
                    debug!("Keepalive probe skipped, session busy");
                }
                Err(e) => {
                    warn!("Keepalive probe failed, leaving session stale: {}", e);
                }
            }
        }
    })
}
