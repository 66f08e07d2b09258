//! Housekeeping tasks: stale connections and idle presence.
//!
//! The connection sweep drops connections that have not answered a ping
//! within the timeout. Dropping a connection closes its outbound channel,
//! which ends its websocket task; that task then runs the usual leave
//! cleanup (presence removal and `user_left`).
//!
//! Presence cleanup is optional and only removes records; it sends nothing.
//! A user who idled out but is still in the room gets a fresh record on
//! their next cursor move, which peers see as `user_joined`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::services::connection::ConnectionRegistry;
use crate::services::presence::PresenceTracker;

/// Spawn the periodic stale-connection sweep.
pub fn spawn_stale_sweeper(registry: ConnectionRegistry, period: Duration, timeout: Duration) -> JoinHandle<()> {
    info!(period_secs = period.as_secs(), timeout_secs = timeout.as_secs(), "stale connection sweep configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; nothing can be stale yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let dropped = registry.sweep_stale(timeout).await;
            if dropped > 0 {
                info!(dropped, "stale connections swept");
            }
        }
    })
}

/// Spawn the periodic presence cleanup using the tracker's activity timeout.
pub fn spawn_presence_cleanup(presence: PresenceTracker, period: Duration) -> JoinHandle<()> {
    let timeout = presence.settings().activity_timeout;
    info!(period_secs = period.as_secs(), timeout_secs = timeout.as_secs(), "presence cleanup configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            presence.cleanup_inactive(timeout).await;
        }
    })
}
