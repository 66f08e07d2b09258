//! Persistence service: timer-driven flush of dirty documents.
//!
//! DESIGN
//! ======
//! Only used with `FlushPolicy::Interval`. A background task ticks on the
//! configured period and asks the engine to write every dirty working copy.
//! The engine snapshots under each document's lock and saves outside it, so
//! editing never waits on the store.
//!
//! ERROR HANDLING
//! ==============
//! A document stays dirty until a save succeeds. Failed saves are logged by
//! the engine and picked up again on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::services::document::DocumentEngine;

/// Spawn the interval flush task. Returns a handle for shutdown.
pub fn spawn_flush_task(engine: Arc<DocumentEngine>, period: Duration) -> JoinHandle<()> {
    info!(period_ms = period.as_millis(), "document flush task configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = engine.flush_dirty().await;
            if report.failed > 0 {
                warn!(flushed = report.flushed, failed = report.failed, "document flush incomplete");
            } else if report.flushed > 0 {
                debug!(flushed = report.flushed, "documents flushed");
            }
        }
    })
}
