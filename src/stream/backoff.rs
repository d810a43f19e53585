//! Exponential backoff between reconnect attempts.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Backoff {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Ceiling on the delay between attempts.
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    pub fn with_max_delay(max_delay: Duration) -> Self {
        Self {
            max_delay,
            ..Self::default()
        }
    }

    /// First wait, already clamped to the ceiling.
    pub fn first_delay(&self) -> Duration {
        self.initial_delay.min(self.max_delay)
    }

    /// Delay after a failed attempt that waited `current`. Never exceeds
    /// `max_delay` and never shrinks.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let grown = current.as_secs_f64() * self.multiplier.max(1.0);
        let grown = Duration::try_from_secs_f64(grown).unwrap_or(self.max_delay);
        grown.max(current).min(self.max_delay)
    }

    /// The unbounded sequence of waits this policy produces.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.first_delay()), move |d| Some(self.next_delay(*d)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_one_second() {
        let backoff = Backoff::default();
        let secs: Vec<u64> = backoff.delays().take(8).map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn delays_are_monotonic_and_capped() {
        let backoff = Backoff {
            initial_delay: Duration::from_millis(70),
            max_delay: Duration::from_millis(1_000),
            multiplier: 1.7,
        };
        let delays: Vec<Duration> = backoff.delays().take(50).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= backoff.max_delay));
        assert_eq!(*delays.last().unwrap(), backoff.max_delay);
    }

    #[test]
    fn initial_above_ceiling_is_clamped() {
        let backoff = Backoff {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(3),
            multiplier: 2.0,
        };
        assert_eq!(backoff.first_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(Duration::from_secs(3)), Duration::from_secs(3));
    }
}
