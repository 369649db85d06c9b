//! Periodic reconciliation.
//!
//! One task per resource kind. A task waits for the stores to be ready,
//! sleeps the initial delay, then ticks at a fixed interval. Ticks never
//! pile up: a slow tick delays the next one instead of queueing more.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use keel_core::SchedulerConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::executor::{Executor, ReconcileReport, ResourceKind};

/// Executors grouped by the kind they reconcile, one per cluster.
pub type ExecutorsByKind = BTreeMap<ResourceKind, Vec<Arc<dyn Executor>>>;

/// Run every executor once, concurrently.
pub async fn run_tick(executors: &[Arc<dyn Executor>]) -> Vec<Result<ReconcileReport>> {
    let results = join_all(executors.iter().map(|e| e.run())).await;
    for (executor, result) in executors.iter().zip(&results) {
        if let Err(e) = result {
            warn!(
                kind = %executor.kind(),
                cluster = executor.cluster(),
                error = %e,
                "Reconciliation tick failed"
            );
        }
    }
    results
}

/// Resolves to `true` once `flag` is set, `false` if its sender is gone first.
async fn raised(flag: &mut watch::Receiver<bool>) -> bool {
    flag.wait_for(|set| *set).await.is_ok()
}

pub struct Scheduler;

impl Scheduler {
    pub fn start(
        executors: ExecutorsByKind,
        readiness: watch::Receiver<bool>,
        config: &SchedulerConfig,
    ) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let tasks = executors
            .into_iter()
            .filter(|(_, executors)| !executors.is_empty())
            .map(|(kind, executors)| {
                tokio::spawn(run_kind(
                    kind,
                    executors,
                    readiness.clone(),
                    stop_rx.clone(),
                    config.interval,
                    config.initial_delay,
                ))
            })
            .collect();

        SchedulerHandle { stop_tx, tasks }
    }
}

async fn run_kind(
    kind: ResourceKind,
    executors: Vec<Arc<dyn Executor>>,
    mut readiness: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
    interval: Duration,
    initial_delay: Duration,
) {
    tokio::select! {
        ready = raised(&mut readiness) => {
            if !ready {
                warn!(kind = %kind, "Readiness signal dropped before stores were ready");
                return;
            }
        }
        _ = raised(&mut stop) => return,
    }

    tokio::select! {
        () = tokio::time::sleep(initial_delay) => {}
        _ = raised(&mut stop) => return,
    }

    info!(kind = %kind, clusters = executors.len(), interval = ?interval, "Reconciliation started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!(kind = %kind, "Reconciliation tick");
                run_tick(&executors).await;
            }
            _ = raised(&mut stop) => break,
        }
    }
    info!(kind = %kind, "Reconciliation stopped");
}

/// Running scheduler tasks.
pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop every task and wait for in-flight ticks to finish.
    pub async fn shutdown(self) {
        self.stop_tx.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::error::Error;

    struct CountingExecutor {
        cluster: String,
        runs: AtomicUsize,
        fail: bool,
        work: Duration,
        started: Mutex<Vec<Instant>>,
    }

    impl CountingExecutor {
        fn new(cluster: &str) -> Arc<Self> {
            Self::with(cluster, false, Duration::ZERO)
        }

        fn with(cluster: &str, fail: bool, work: Duration) -> Arc<Self> {
            Arc::new(Self {
                cluster: cluster.to_string(),
                runs: AtomicUsize::new(0),
                fail,
                work,
                started: Mutex::new(Vec::new()),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Executor for CountingExecutor {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Topics
        }

        fn cluster(&self) -> &str {
            &self.cluster
        }

        async fn run(&self) -> Result<ReconcileReport> {
            self.started.lock().unwrap().push(Instant::now());
            tokio::time::sleep(self.work).await;
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::broker("list_topics", "unreachable"));
            }
            Ok(ReconcileReport::default())
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(10),
            initial_delay: Duration::from_secs(5),
        }
    }

    fn topics(executors: Vec<Arc<CountingExecutor>>) -> ExecutorsByKind {
        let executors: Vec<Arc<dyn Executor>> = executors
            .into_iter()
            .map(|p| -> Arc<dyn Executor> { p })
            .collect();
        BTreeMap::from([(ResourceKind::Topics, executors)])
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_before_readiness() {
        let counter = CountingExecutor::new("local");
        let (ready_tx, ready_rx) = watch::channel(false);
        let handle = Scheduler::start(topics(vec![counter.clone()]), ready_rx, &config());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.runs(), 0);

        ready_tx.send_replace(true);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(counter.runs(), 0, "initial delay not honoured");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.runs(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.runs(), 2);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_does_not_stop_schedule() {
        let counter = CountingExecutor::with("local", true, Duration::ZERO);
        let (_ready_tx, ready_rx) = watch::channel(true);
        let handle = Scheduler::start(topics(vec![counter.clone()]), ready_rx, &config());

        tokio::time::sleep(Duration::from_secs(36)).await;

        assert_eq!(counter.runs(), 4);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clusters_of_a_kind_run_concurrently() {
        let a = CountingExecutor::with("a", false, Duration::from_secs(3));
        let b = CountingExecutor::with("b", false, Duration::from_secs(3));
        let (_ready_tx, ready_rx) = watch::channel(true);
        let handle = Scheduler::start(topics(vec![a.clone(), b.clone()]), ready_rx, &config());

        tokio::time::sleep(Duration::from_secs(9)).await;

        assert_eq!(a.runs(), 1);
        assert_eq!(b.runs(), 1);
        let a_start = a.started.lock().unwrap()[0];
        let b_start = b.started.lock().unwrap()[0];
        assert_eq!(a_start, b_start);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_ticking() {
        let counter = CountingExecutor::new("local");
        let (_ready_tx, ready_rx) = watch::channel(true);
        let handle = Scheduler::start(topics(vec![counter.clone()]), ready_rx, &config());
        assert_eq!(handle.task_count(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        handle.shutdown().await;
        let runs = counter.runs();

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(counter.runs(), runs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_readiness_ends_task() {
        let counter = CountingExecutor::new("local");
        let (ready_tx, ready_rx) = watch::channel(false);
        let handle = Scheduler::start(topics(vec![counter.clone()]), ready_rx, &config());

        drop(ready_tx);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(counter.runs(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_tick_returns_every_result() {
        let ok = CountingExecutor::new("a");
        let failing = CountingExecutor::with("b", true, Duration::ZERO);
        let executors: Vec<Arc<dyn Executor>> = vec![ok, failing];

        let results = run_tick(&executors).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
