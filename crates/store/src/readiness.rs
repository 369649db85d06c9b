//! Process-wide readiness gate.
//!
//! External traffic must not be served until every store has replayed its
//! topic up to the tail observed at startup. The gate polls each store,
//! logs catch-up progress and never gives up: a store that cannot catch up
//! points at a broker problem an operator has to fix.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Replay progress of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Highest offset applied to the local replica.
    pub observed: i64,
    /// Offset of the last acknowledged write or probe, `-1` if unknown.
    pub target: i64,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.observed, self.target)
    }
}

/// Something the gate waits on.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Whether the probe has reached its ready state.
    fn is_ready(&self) -> bool;

    /// Current replay progress.
    fn progress(&self) -> Progress;

    /// Make one bounded attempt to become ready.
    async fn poll_ready(&self, timeout: Duration) -> Result<bool>;
}

/// Blocks until every probe is ready, then flips the process flag once.
pub struct ReadinessGate {
    probes: Vec<Arc<dyn ReadinessProbe>>,
    poll_interval: Duration,
    attempt_timeout: Duration,
    ready: AtomicBool,
    notify: watch::Sender<bool>,
}

impl ReadinessGate {
    pub fn new(
        probes: Vec<Arc<dyn ReadinessProbe>>,
        poll_interval: Duration,
        attempt_timeout: Duration,
    ) -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            probes,
            poll_interval,
            attempt_timeout,
            ready: AtomicBool::new(false),
            notify,
        }
    }

    /// Whether every probe has been observed ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Watch channel that turns `true` once the gate opens.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.notify.subscribe()
    }

    /// Poll until all probes are ready. Never times out.
    ///
    /// Fails only on fatal probe errors, such as a misconfigured store topic.
    pub async fn wait_until_ready(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        info!(stores = self.probes.len(), "Waiting for stores to catch up");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let mut pending = 0usize;
            for probe in &self.probes {
                if probe.is_ready() {
                    continue;
                }
                match probe.poll_ready(self.attempt_timeout).await {
                    Ok(true) => {}
                    Ok(false) => {
                        pending = pending.saturating_add(1);
                        info!(
                            store = probe.name(),
                            progress = %probe.progress(),
                            "Store still catching up"
                        );
                    }
                    Err(e) if e.is_fatal() => {
                        error!(store = probe.name(), error = %e, "Store cannot become ready");
                        return Err(e);
                    }
                    Err(e) => {
                        pending = pending.saturating_add(1);
                        warn!(store = probe.name(), error = %e, "Readiness check failed, retrying");
                    }
                }
            }

            if pending == 0 {
                return self.open();
            }
        }
    }

    fn open(&self) -> Result<()> {
        self.ready
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| {
                error!("Readiness gate opened twice");
                Error::already_ready("readiness gate")
            })?;
        self.notify.send_replace(true);
        info!("All stores ready");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountdownProbe {
        name: String,
        remaining: AtomicUsize,
        fail_fatally: bool,
    }

    impl CountdownProbe {
        fn new(name: &str, attempts: usize) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                remaining: AtomicUsize::new(attempts),
                fail_fatally: false,
            })
        }
    }

    #[async_trait]
    impl ReadinessProbe for CountdownProbe {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_ready(&self) -> bool {
            self.remaining.load(Ordering::SeqCst) == 0
        }

        fn progress(&self) -> Progress {
            Progress {
                observed: 0,
                target: 1,
            }
        }

        async fn poll_ready(&self, _timeout: Duration) -> Result<bool> {
            if self.fail_fatally {
                return Err(Error::invalid_log_topic(&self.name, "2 partitions"));
            }
            let left = self.remaining.load(Ordering::SeqCst).saturating_sub(1);
            self.remaining.store(left, Ordering::SeqCst);
            Ok(left == 0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_opens_when_all_probes_ready() -> Result<()> {
        let slow = CountdownProbe::new("slow", 3);
        let fast = CountdownProbe::new("fast", 1);
        let probes: Vec<Arc<dyn ReadinessProbe>> = vec![slow.clone(), fast];
        let gate = ReadinessGate::new(
            probes,
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let mut opened = gate.subscribe();

        assert!(!gate.is_ready());
        gate.wait_until_ready().await?;

        assert!(gate.is_ready());
        assert!(slow.is_ready());
        assert!(*opened.borrow_and_update());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_stops_on_fatal_probe_error() {
        let broken = Arc::new(CountdownProbe {
            name: "broken".to_string(),
            remaining: AtomicUsize::new(1),
            fail_fatally: true,
        });
        let probes: Vec<Arc<dyn ReadinessProbe>> = vec![broken];
        let gate = ReadinessGate::new(
            probes,
            Duration::from_millis(10),
            Duration::from_millis(10),
        );

        let result = gate.wait_until_ready().await;
        assert!(matches!(result, Err(Error::InvalidLogTopic { .. })));
        assert!(!gate.is_ready());
    }

    #[test]
    fn test_opening_twice_is_an_invariant_violation() {
        let gate = ReadinessGate::new(Vec::new(), Duration::from_millis(10), Duration::from_millis(10));
        assert!(gate.open().is_ok());
        assert!(matches!(gate.open(), Err(Error::AlreadyReady { .. })));
    }

    #[test]
    fn test_progress_display() {
        let progress = Progress {
            observed: 41,
            target: 42,
        };
        assert_eq!(progress.to_string(), "41/42");
    }
}
