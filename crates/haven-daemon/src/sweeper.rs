//! The cleanup ticker.
//!
//! One recurring tick drives every expiry-based state transition: store
//! GC, subscription sweep, rate-limit bucket pruning, and the swarm-map
//! refresh. Ticks never overlap; an overrunning tick makes the next one
//! coalesce ([`MissedTickBehavior::Skip`]) rather than queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use haven_types::time::now_ms;
use haven_types::CLEANUP_PERIOD_SECS;

use crate::oracle::OracleClient;
use crate::NodeState;

pub async fn run(node: Arc<NodeState>, oracle: Arc<OracleClient>) {
    let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_PERIOD_SECS));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        match node.store.clean_expired(now_ms()) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "expired messages swept"),
            Err(e) => warn!("expiry sweep failed: {e}"),
        }

        node.handler.monitors().sweep();
        node.handler.limiter().prune();

        match oracle.fetch_snapshot().await {
            Ok(snapshot) => node.swarm.update(&snapshot),
            // Oracle staleness is survivable: keep the previous snapshot.
            Err(e) => debug!("swarm refresh skipped: {e}"),
        }
    }
}
