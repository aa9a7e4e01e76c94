// src/scheduler.rs
//! Drives repeated coordinator cycles per configured site.
//!
//! Each site keeps an independent next-due instant. A due site starts a
//! cycle only when a global concurrency permit is free and no cycle for
//! that site is already in flight; a tick that lands while the previous
//! cycle is still running is skipped and logged, never queued, so slow
//! cycles cannot build a backlog. A `Degraded` cycle outcome widens that
//! site's interval by a configurable factor until a success resets it.
//! One site's failures never delay another site.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::{ScannerConfig, WebsiteConfig};
use crate::metrics::ensure_metrics_described;
use crate::pipeline::{CycleReport, CycleRunner, CycleStatus};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_interval: Duration,
    pub max_concurrent: usize,
    pub degraded_backoff_factor: f64,
    pub max_backoff_multiplier: f64,
    pub shutdown_grace: Duration,
    /// Dispatch-loop granularity; only tests tune this.
    pub poll: Duration,
}

impl SchedulerConfig {
    pub fn from_scanner(cfg: &ScannerConfig) -> Self {
        Self {
            default_interval: Duration::from_secs(cfg.scan_interval_secs),
            max_concurrent: cfg.max_concurrent_cycles,
            degraded_backoff_factor: cfg.retry.degraded_backoff_factor,
            max_backoff_multiplier: cfg.retry.max_backoff_multiplier,
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
            poll: Duration::from_millis(250),
        }
    }
}

/// Manual scan requests (the "scan now" path next to the timer).
#[derive(Debug, Clone)]
pub enum ScanCommand {
    TriggerAll,
    TriggerSite(String),
}

#[derive(Clone)]
pub struct ScanTrigger {
    tx: mpsc::Sender<ScanCommand>,
}

impl ScanTrigger {
    pub fn trigger_all(&self) {
        let _ = self.tx.try_send(ScanCommand::TriggerAll);
    }

    pub fn trigger_site(&self, id: impl Into<String>) {
        let _ = self.tx.try_send(ScanCommand::TriggerSite(id.into()));
    }
}

#[derive(Debug)]
struct SiteState {
    next_due: Instant,
    backoff: f64,
    in_flight: bool,
    runs: u64,
    ok: u64,
    degraded: u64,
}

pub struct Scheduler {
    runner: Arc<dyn CycleRunner>,
    sites: Vec<WebsiteConfig>,
    cfg: SchedulerConfig,
    trigger_tx: mpsc::Sender<ScanCommand>,
    trigger_rx: StdMutex<Option<mpsc::Receiver<ScanCommand>>>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn CycleRunner>, sites: Vec<WebsiteConfig>, cfg: SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            runner,
            sites,
            cfg,
            trigger_tx: tx,
            trigger_rx: StdMutex::new(Some(rx)),
        }
    }

    pub fn trigger(&self) -> ScanTrigger {
        ScanTrigger {
            tx: self.trigger_tx.clone(),
        }
    }

    fn site_interval(&self, site: &WebsiteConfig) -> Duration {
        site.interval_secs
            .map(Duration::from_secs)
            .unwrap_or(self.cfg.default_interval)
    }

    fn effective_interval(&self, site: &WebsiteConfig, backoff: f64) -> Duration {
        self.site_interval(site).mul_f64(backoff.max(1.0))
    }

    /// Run until the shutdown flag flips to `true`. In-flight cycles are
    /// drained up to the grace deadline, then aborted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        ensure_metrics_described();
        let mut commands = self
            .trigger_rx
            .lock()
            .expect("scheduler trigger mutex poisoned")
            .take()
            .expect("Scheduler::run called twice");

        let sem = Arc::new(Semaphore::new(self.cfg.max_concurrent));
        let now = Instant::now();
        let mut states: Vec<SiteState> = self
            .sites
            .iter()
            .map(|_| SiteState {
                next_due: now,
                backoff: 1.0,
                in_flight: false,
                runs: 0,
                ok: 0,
                degraded: 0,
            })
            .collect();
        let mut join_set: JoinSet<(usize, CycleReport)> = JoinSet::new();
        let mut task_sites: HashMap<tokio::task::Id, usize> = HashMap::new();

        info!(
            target: "scheduler",
            sites = self.sites.iter().filter(|s| s.enabled).count(),
            max_concurrent = self.cfg.max_concurrent,
            "scheduler started"
        );

        loop {
            self.dispatch_due(&mut states, &sem, &mut join_set, &mut task_sites);

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(res) = join_set.join_next_with_id(), if !join_set.is_empty() => {
                    self.on_cycle_done(&mut states, &mut task_sites, res);
                }
                Some(cmd) = commands.recv() => {
                    let now = Instant::now();
                    match cmd {
                        ScanCommand::TriggerAll => {
                            for st in states.iter_mut() {
                                st.next_due = now;
                            }
                            info!(target: "scheduler", "manual scan of all sites requested");
                        }
                        ScanCommand::TriggerSite(id) => {
                            if let Some(idx) = self.sites.iter().position(|s| s.id == id) {
                                states[idx].next_due = now;
                                info!(target: "scheduler", site = %id, "manual scan requested");
                            } else {
                                warn!(target: "scheduler", site = %id, "manual scan for unknown site");
                            }
                        }
                    }
                }
                _ = sleep(self.cfg.poll) => {}
            }
        }

        self.drain(&mut states, &mut task_sites, join_set).await;

        let (runs, ok, degraded) = states
            .iter()
            .fold((0u64, 0u64, 0u64), |acc, st| {
                (acc.0 + st.runs, acc.1 + st.ok, acc.2 + st.degraded)
            });
        info!(
            target: "scheduler",
            total_cycles = runs,
            ok,
            degraded,
            "scheduler stopped"
        );
    }

    fn dispatch_due(
        &self,
        states: &mut [SiteState],
        sem: &Arc<Semaphore>,
        join_set: &mut JoinSet<(usize, CycleReport)>,
        task_sites: &mut HashMap<tokio::task::Id, usize>,
    ) {
        let now = Instant::now();
        for (idx, site) in self.sites.iter().enumerate() {
            if !site.enabled {
                continue;
            }
            let st = &mut states[idx];
            if now < st.next_due {
                continue;
            }
            if st.in_flight {
                // Cycles do not stack: skip this tick, take the next slot.
                warn!(
                    target: "scheduler",
                    site = %site.id,
                    "tick skipped, previous cycle still running"
                );
                counter!("scan_ticks_skipped_total").increment(1);
                st.next_due = now + self.effective_interval(site, st.backoff);
                continue;
            }
            // No free permit: the site simply stays due and is retried on
            // the next pass.
            let Ok(permit) = sem.clone().try_acquire_owned() else {
                continue;
            };

            st.in_flight = true;
            st.runs += 1;
            st.next_due = now + self.effective_interval(site, st.backoff);
            debug!(target: "scheduler", site = %site.id, "cycle dispatched");

            let runner = self.runner.clone();
            let site = site.clone();
            let handle = join_set.spawn(async move {
                let report = runner.run_cycle(&site).await;
                drop(permit);
                (idx, report)
            });
            task_sites.insert(handle.id(), idx);
        }
    }

    fn on_cycle_done(
        &self,
        states: &mut [SiteState],
        task_sites: &mut HashMap<tokio::task::Id, usize>,
        res: Result<(tokio::task::Id, (usize, CycleReport)), tokio::task::JoinError>,
    ) {
        match res {
            Ok((task_id, (idx, report))) => {
                task_sites.remove(&task_id);
                let site = &self.sites[idx];
                let st = &mut states[idx];
                st.in_flight = false;
                match report.status {
                    CycleStatus::Ok => {
                        st.ok += 1;
                        st.backoff = 1.0;
                    }
                    CycleStatus::Degraded => {
                        st.degraded += 1;
                        st.backoff = (st.backoff * self.cfg.degraded_backoff_factor)
                            .min(self.cfg.max_backoff_multiplier);
                        // Push the already-scheduled tick out to the
                        // widened interval.
                        let widened = Instant::now() + self.effective_interval(site, st.backoff);
                        st.next_due = st.next_due.max(widened);
                        warn!(
                            target: "scheduler",
                            site = %site.id,
                            backoff = st.backoff,
                            "site degraded, interval widened"
                        );
                    }
                }
            }
            Err(join_err) => {
                // A panicked or aborted cycle must not wedge its site.
                if let Some(idx) = task_sites.remove(&join_err.id()) {
                    states[idx].in_flight = false;
                    warn!(
                        target: "scheduler",
                        site = %self.sites[idx].id,
                        error = %join_err,
                        "cycle task did not finish cleanly"
                    );
                }
            }
        }
    }

    async fn drain(
        &self,
        states: &mut [SiteState],
        task_sites: &mut HashMap<tokio::task::Id, usize>,
        mut join_set: JoinSet<(usize, CycleReport)>,
    ) {
        if join_set.is_empty() {
            return;
        }
        info!(
            target: "scheduler",
            in_flight = join_set.len(),
            grace_secs = self.cfg.shutdown_grace.as_secs(),
            "shutdown requested, draining in-flight cycles"
        );
        let deadline = Instant::now() + self.cfg.shutdown_grace;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    warn!(
                        target: "scheduler",
                        remaining = join_set.len(),
                        "grace deadline reached, aborting remaining cycles"
                    );
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    break;
                }
                res = join_set.join_next_with_id() => {
                    match res {
                        Some(res) => self.on_cycle_done(states, task_sites, res),
                        None => break,
                    }
                }
            }
        }
    }
}
