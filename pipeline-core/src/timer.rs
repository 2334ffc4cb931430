use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// A cancellable periodic tick, shared by the debounce flush task and the
/// daily aggregation schedule so neither depends on an external scheduler
/// process.
pub struct PeriodicTimer {
    interval: tokio::time::Interval,
    shutdown: CancellationToken,
}

impl PeriodicTimer {
    pub fn new(period: Duration, shutdown: CancellationToken) -> Self {
        let mut interval = tokio::time::interval(period);
        // A stalled consumer should not be "caught up" with a burst of ticks.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        Self { interval, shutdown }
    }

    /// Wait for the next tick. Returns false once the token is cancelled,
    /// at which point the caller should flush and exit.
    pub async fn tick(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = self.interval.tick() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticks_until_cancelled() {
        let shutdown = CancellationToken::new();
        let mut timer = PeriodicTimer::new(Duration::from_millis(5), shutdown.clone());
        assert!(timer.tick().await);
        assert!(timer.tick().await);

        shutdown.cancel();
        assert!(!timer.tick().await);
    }
}
