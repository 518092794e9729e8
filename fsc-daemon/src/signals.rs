//! Termination signals and watchdog-safe waiting
//!
//! Every wait longer than one sample interval goes through [`hold`], so the
//! watchdog keeps being fed and a signal still ends the wait immediately.

use std::future::Future;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::{sleep_until, Instant};

/// A termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown {
    pub signal: &'static str,
    /// Only SIGQUIT stops the watchdog timer
    pub disarm_watchdog: bool,
}

pub struct Signals {
    term: Signal,
    int: Signal,
    quit: Signal,
}

impl Signals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    pub async fn recv(&mut self) -> Shutdown {
        tokio::select! {
            _ = self.term.recv() => Shutdown { signal: "SIGTERM", disarm_watchdog: false },
            _ = self.int.recv() => Shutdown { signal: "SIGINT", disarm_watchdog: false },
            _ = self.quit.recv() => Shutdown { signal: "SIGQUIT", disarm_watchdog: true },
        }
    }
}

/// Wait `duration`, calling `kick` at the start and at least every `period`
///
/// Returns early with the output of `interrupt` if it completes first.
pub async fn hold<F: Future>(
    duration: Duration,
    period: Duration,
    mut kick: impl FnMut(),
    interrupt: F,
) -> Option<F::Output> {
    tokio::pin!(interrupt);
    let period = period.max(Duration::from_millis(1));
    let deadline = Instant::now() + duration;

    loop {
        kick();
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        tokio::select! {
            _ = sleep_until((now + period).min(deadline)) => {}
            out = &mut interrupt => return Some(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_hold_kicks_through_long_wait() {
        let start = Instant::now();
        let mut kicks = Vec::new();
        let result = hold(
            Duration::from_secs(30),
            Duration::from_secs(1),
            || kicks.push(Instant::now()),
            std::future::pending::<()>(),
        )
        .await;

        assert_eq!(result, None);
        assert!(Instant::now() - start >= Duration::from_secs(30));
        assert!(kicks.len() >= 31, "{} kicks", kicks.len());
        for pair in kicks.windows(2) {
            assert!(pair[1] - pair[0] <= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_ends_on_interrupt() {
        let start = Instant::now();
        let mut kicks = 0;
        let result = hold(
            Duration::from_secs(30),
            Duration::from_secs(1),
            || kicks += 1,
            async {
                tokio::time::sleep(Duration::from_millis(2500)).await;
                "SIGTERM"
            },
        )
        .await;

        assert_eq!(result, Some("SIGTERM"));
        assert_eq!(kicks, 3);
        assert!(Instant::now() - start < Duration::from_secs(3));
    }
}
