use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Process-wide cooperative shutdown flag.
///
/// Cloning shares the flag. Besides polling, workers can sleep on it with
/// [`wait_timeout`](Self::wait_timeout), which returns early once the flag is
/// raised.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `true` only for the call that raised it.
    pub fn trigger(&self) -> bool {
        let (flag, cvar) = &*self.inner;
        let mut raised = lock(flag);
        if *raised {
            return false;
        }
        *raised = true;
        cvar.notify_all();
        true
    }

    pub fn is_triggered(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleep up to `timeout`. Returns `true` if shutdown was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut raised = lock(flag);
        while !*raised {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            raised = cvar
                .wait_timeout(raised, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        *raised
    }

    /// Block until the flag is raised.
    pub fn wait(&self) {
        let (flag, cvar) = &*self.inner;
        let mut raised = lock(flag);
        while !*raised {
            raised = cvar
                .wait(raised)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

fn lock(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_reports_first_caller_only() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.clone().trigger());
        assert!(signal.is_triggered());
    }

    #[test]
    fn wait_times_out_without_trigger() {
        let signal = ShutdownSignal::new();
        let started = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn trigger_wakes_sleeper_early() {
        let signal = ShutdownSignal::new();
        let sleeper = {
            let signal = signal.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                let raised = signal.wait_timeout(Duration::from_secs(30));
                (raised, started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        signal.trigger();
        let (raised, waited) = sleeper.join().unwrap();
        assert!(raised);
        assert!(waited < Duration::from_secs(5));
    }
}
