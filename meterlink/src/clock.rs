//! Wall-clock time for throttle decisions.

use std::time::Duration;

use tokio::time::Instant;

/// Seconds since the Unix epoch, advanced by the tokio clock.
///
/// The epoch reading is taken once and then moved forward with a monotonic
/// [`Instant`], so deadlines computed from [`now`](Self::now) agree with
/// `tokio::time` sleeps.
#[derive(Debug, Clone, Copy)]
pub struct EpochClock {
    epoch_at_anchor: f64,
    anchor: Instant,
}

impl EpochClock {
    /// Anchor the clock to the current system time.
    pub fn system() -> Self {
        let now = chrono::Utc::now();
        let epoch = now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6;
        Self::starting_at(epoch)
    }

    /// Anchor the clock so that [`now`](Self::now) currently reads `epoch`.
    pub fn starting_at(epoch: f64) -> Self {
        Self {
            epoch_at_anchor: epoch,
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.epoch_at_anchor + self.anchor.elapsed().as_secs_f64()
    }

    /// Time left until `deadline`, zero if it already passed.
    pub fn until(&self, deadline: f64) -> Duration {
        Duration::try_from_secs_f64(deadline - self.now()).unwrap_or(Duration::ZERO)
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::system()
    }
}
