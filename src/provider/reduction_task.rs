use super::Provider;
use std::sync::Weak;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

/// Periodic reduction actor. Holds only a weak reference so it never keeps
/// a dropped provider alive.
pub struct ReductionTask {
    provider: Weak<Provider>,
    period: Duration,
}

impl ReductionTask {
    pub fn new(provider: Weak<Provider>, period: Duration) -> Self {
        ReductionTask { provider, period }
    }

    pub async fn run(self) {
        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        tick.tick().await;

        loop {
            tick.tick().await;
            let Some(provider) = self.provider.upgrade() else {
                debug!("provider gone, reduction task exiting");
                break;
            };
            if provider.is_finalized() {
                break;
            }
            provider.run_reduction_cycle().await;
        }
    }
}
