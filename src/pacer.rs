use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::distribution::{Distribution, DistributionContext};

// tokio's timer wheel ticks in milliseconds; shorter waits are spun.
const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// How the measured dispatch cost is folded into the sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacingMode {
    /// `max(target - cost, 0)`: the offered rate stays on schedule no
    /// matter how expensive issuing is.
    Compensated,
    /// `min(target - cost, 0)`: never sleeps, issues as fast as possible.
    Unpaced,
}

impl std::str::FromStr for PacingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compensated" => Ok(PacingMode::Compensated),
            "unpaced" => Ok(PacingMode::Unpaced),
            _ => Err(anyhow::anyhow!("Invalid pacing mode: {:?}", s)),
        }
    }
}

/// Sleep needed after a dispatch that cost `cost` to keep a `target`
/// inter-arrival time.
pub fn sleep_duration(mode: PacingMode, target: Duration, cost: Duration) -> Duration {
    match mode {
        PacingMode::Compensated => target.checked_sub(cost).unwrap_or_default(),
        PacingMode::Unpaced => Duration::from_secs(0),
    }
}

/// Keeps the single issuing loop on its open-loop schedule.
pub struct Pacer {
    mode: PacingMode,
    interarrival: Arc<dyn Distribution>,
    ctx: DistributionContext,
}

impl Pacer {
    /// `interarrival` yields the target gap in microseconds per iteration.
    pub fn new(mode: PacingMode, interarrival: Arc<dyn Distribution>, seed: u64) -> Self {
        Self {
            mode,
            interarrival,
            ctx: DistributionContext::seeded(seed),
        }
    }

    pub fn mode(&self) -> PacingMode {
        self.mode
    }

    /// Draws the next target gap and waits for whatever part of it the
    /// dispatch did not already use up.
    pub async fn pace(&mut self, dispatch_cost: Duration) -> Duration {
        let target_micros = self.interarrival.get_i64(&mut self.ctx).max(0) as u64;
        let target = Duration::from_micros(target_micros);
        let sleep = sleep_duration(self.mode, target, dispatch_cost);
        if sleep > Duration::from_secs(0) {
            wait(sleep).await;
        }
        sleep
    }
}

async fn wait(duration: Duration) {
    let deadline = Instant::now() + duration;
    if duration >= TIMER_RESOLUTION {
        tokio::time::sleep_until(deadline).await;
        return;
    }
    while Instant::now() < deadline {
        tokio::task::yield_now().await;
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::FixedDistribution;

    fn micros(us: u64) -> Duration {
        Duration::from_micros(us)
    }

    #[test]
    fn compensated_sleep_subtracts_dispatch_cost() {
        let mode = PacingMode::Compensated;
        assert_eq!(sleep_duration(mode, micros(100), micros(150)), micros(0));
        assert_eq!(sleep_duration(mode, micros(100), micros(40)), micros(60));
        assert_eq!(sleep_duration(mode, micros(100), micros(100)), micros(0));
    }

    #[test]
    fn unpaced_never_sleeps() {
        let mode = PacingMode::Unpaced;
        assert_eq!(sleep_duration(mode, micros(800), micros(10)), micros(0));
        assert_eq!(sleep_duration(mode, micros(800), micros(900)), micros(0));
    }

    #[test]
    fn parses_modes() {
        assert_eq!("compensated".parse::<PacingMode>().unwrap(), PacingMode::Compensated);
        assert_eq!("unpaced".parse::<PacingMode>().unwrap(), PacingMode::Unpaced);
        assert!("max".parse::<PacingMode>().is_err());
    }

    #[tokio::test]
    async fn pace_waits_for_the_remaining_gap() {
        let mut pacer = Pacer::new(
            PacingMode::Compensated,
            Arc::new(FixedDistribution(3_000)),
            1,
        );
        let start = Instant::now();
        let slept = pacer.pace(micros(1_000)).await;
        assert_eq!(slept, micros(2_000));
        assert!(start.elapsed() >= micros(2_000));

        let start = Instant::now();
        let slept = pacer.pace(micros(300)).await;
        assert_eq!(slept, micros(2_700));
        assert!(start.elapsed() >= micros(2_700));
    }

    #[tokio::test]
    async fn short_gaps_are_spun() {
        let mut pacer = Pacer::new(PacingMode::Compensated, Arc::new(FixedDistribution(200)), 1);
        let start = Instant::now();
        pacer.pace(micros(50)).await;
        assert!(start.elapsed() >= micros(150));
    }
}
