use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ChannelPool;

/// Periodically probe idle channels until `cancel` fires.
pub fn spawn_health_monitor(pool: Arc<ChannelPool>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(pool.config().health_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; channels start out freshly probed
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => pool.check_health().await,
            }
        }
        tracing::debug!("Health monitor stopped");
    })
}
