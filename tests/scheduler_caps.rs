// tests/scheduler_caps.rs
//
// Scheduler behavior under paused tokio time: the global concurrency cap,
// per-site exclusion, skip-not-queue ticks, degradation backoff, and the
// shutdown drain. The runner is scripted; no pipeline is involved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use tor_web_scanner::config::{ExtractionRules, WebsiteConfig};
use tor_web_scanner::pipeline::{CycleReport, CycleRunner, CycleStatus};
use tor_web_scanner::scheduler::{Scheduler, SchedulerConfig};

fn sites(n: usize) -> Vec<WebsiteConfig> {
    (0..n)
        .map(|i| WebsiteConfig {
            id: format!("site-{i}"),
            url: format!("https://site-{i}.example"),
            name: String::new(),
            enabled: true,
            interval_secs: None,
            selectors: ExtractionRules::default(),
        })
        .collect()
}

fn cfg(interval_secs: u64, max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        default_interval: Duration::from_secs(interval_secs),
        max_concurrent,
        degraded_backoff_factor: 2.0,
        max_backoff_multiplier: 8.0,
        shutdown_grace: Duration::from_secs(1),
        poll: Duration::from_millis(100),
    }
}

/// Records concurrency while sleeping through each cycle.
struct SlowRunner {
    duration: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    per_site_active: Mutex<HashMap<String, usize>>,
    site_overlap: AtomicBool,
    runs: AtomicUsize,
    runs_per_site: Mutex<HashMap<String, usize>>,
    degraded: AtomicBool,
}

impl SlowRunner {
    fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            per_site_active: Mutex::new(HashMap::new()),
            site_overlap: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
            runs_per_site: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        })
    }

    fn runs_for(&self, id: &str) -> usize {
        self.runs_per_site
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl CycleRunner for SlowRunner {
    async fn run_cycle(&self, site: &WebsiteConfig) -> CycleReport {
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self
            .runs_per_site
            .lock()
            .unwrap()
            .entry(site.id.clone())
            .or_insert(0) += 1;

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        {
            let mut per_site = self.per_site_active.lock().unwrap();
            let slot = per_site.entry(site.id.clone()).or_insert(0);
            *slot += 1;
            if *slot > 1 {
                self.site_overlap.store(true, Ordering::SeqCst);
            }
        }

        tokio::time::sleep(self.duration).await;

        *self
            .per_site_active
            .lock()
            .unwrap()
            .get_mut(&site.id)
            .unwrap() -= 1;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let mut report = CycleReport::new(&site.id);
        if self.degraded.load(Ordering::SeqCst) {
            report.status = CycleStatus::Degraded;
        }
        report
    }
}

async fn run_for(
    scheduler: Arc<Scheduler>,
    simulated: Duration,
) -> tokio::task::JoinHandle<()> {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { scheduler.run(rx).await });
    tokio::time::sleep(simulated).await;
    let _ = tx.send(true);
    handle
}

#[tokio::test(start_paused = true)]
async fn concurrency_cap_and_per_site_exclusion_hold() {
    // 5 hungry sites, 1s interval, 3s cycles, cap 2.
    let runner = SlowRunner::new(Duration::from_secs(3));
    let scheduler = Arc::new(Scheduler::new(
        runner.clone(),
        sites(5),
        cfg(1, 2),
    ));

    let handle = run_for(scheduler, Duration::from_secs(30)).await;
    handle.await.unwrap();

    assert!(runner.runs.load(Ordering::SeqCst) >= 4, "cycles did run");
    assert!(
        runner.max_active.load(Ordering::SeqCst) <= 2,
        "global cap exceeded: {}",
        runner.max_active.load(Ordering::SeqCst)
    );
    assert!(
        !runner.site_overlap.load(Ordering::SeqCst),
        "two cycles ran simultaneously for one site"
    );
}

#[tokio::test(start_paused = true)]
async fn slow_cycles_skip_ticks_instead_of_queueing() {
    // Interval 1s, cycle 2.5s: ticks at 1s and 2s are skipped, so at most
    // one run per ~3s window.
    let runner = SlowRunner::new(Duration::from_millis(2500));
    let scheduler = Arc::new(Scheduler::new(runner.clone(), sites(1), cfg(1, 4)));

    let handle = run_for(scheduler, Duration::from_secs(10)).await;
    handle.await.unwrap();

    let runs = runner.runs.load(Ordering::SeqCst);
    assert!(runs >= 3, "expected steady progress, got {runs}");
    assert!(runs <= 4, "skipped ticks must not queue up, got {runs}");
}

#[tokio::test(start_paused = true)]
async fn degraded_outcomes_widen_the_interval_until_success() {
    let runner = SlowRunner::new(Duration::from_millis(10));
    runner.degraded.store(true, Ordering::SeqCst);
    let scheduler = Arc::new(Scheduler::new(runner.clone(), sites(1), cfg(10, 2)));

    let handle = run_for(scheduler, Duration::from_secs(120)).await;
    handle.await.unwrap();

    // Healthy pacing would give ~12 runs in 120s; backoff (x2 up to x8)
    // must cut that sharply.
    let runs = runner.runs.load(Ordering::SeqCst);
    assert!(runs >= 2, "degraded sites are still retried, got {runs}");
    assert!(runs <= 5, "degraded interval not widened, got {runs} runs");
}

#[tokio::test(start_paused = true)]
async fn healthy_site_keeps_its_configured_pace() {
    let runner = SlowRunner::new(Duration::from_millis(10));
    let scheduler = Arc::new(Scheduler::new(runner.clone(), sites(1), cfg(10, 2)));

    let handle = run_for(scheduler, Duration::from_secs(120)).await;
    handle.await.unwrap();

    let runs = runner.runs.load(Ordering::SeqCst);
    assert!((10..=14).contains(&runs), "expected ~12 runs, got {runs}");
}

#[tokio::test(start_paused = true)]
async fn disabled_sites_are_never_dispatched() {
    let mut all = sites(2);
    all[1].enabled = false;
    let runner = SlowRunner::new(Duration::from_millis(10));
    let scheduler = Arc::new(Scheduler::new(runner.clone(), all, cfg(1, 2)));

    let handle = run_for(scheduler, Duration::from_secs(5)).await;
    handle.await.unwrap();

    assert!(runner.runs_for("site-0") >= 4);
    assert_eq!(runner.runs_for("site-1"), 0);
}

#[tokio::test(start_paused = true)]
async fn one_sites_failures_do_not_delay_another() {
    // site-0 degrades constantly; site-1 must keep its pace.
    struct SplitRunner {
        inner: Arc<SlowRunner>,
    }
    #[async_trait]
    impl CycleRunner for SplitRunner {
        async fn run_cycle(&self, site: &WebsiteConfig) -> CycleReport {
            let mut report = self.inner.run_cycle(site).await;
            report.status = if site.id == "site-0" {
                CycleStatus::Degraded
            } else {
                CycleStatus::Ok
            };
            report
        }
    }

    let inner = SlowRunner::new(Duration::from_millis(10));
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(SplitRunner { inner: inner.clone() }),
        sites(2),
        cfg(10, 2),
    ));

    let handle = run_for(scheduler, Duration::from_secs(120)).await;
    handle.await.unwrap();

    assert!(inner.runs_for("site-0") <= 5, "degraded site must back off");
    assert!(
        inner.runs_for("site-1") >= 10,
        "healthy site was delayed: {} runs",
        inner.runs_for("site-1")
    );
}

#[tokio::test(start_paused = true)]
async fn manual_trigger_fires_ahead_of_schedule() {
    let runner = SlowRunner::new(Duration::from_millis(10));
    // Long interval: only the initial run happens on its own.
    let scheduler = Arc::new(Scheduler::new(runner.clone(), sites(1), cfg(10_000, 2)));
    let trigger = scheduler.trigger();

    let (tx, rx) = watch::channel(false);
    let sched = scheduler.clone();
    let handle = tokio::spawn(async move { sched.run(rx).await });

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

    trigger.trigger_site("site-0");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(runner.runs.load(Ordering::SeqCst), 2);

    let _ = tx.send(true);
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_cycles_past_the_grace_deadline() {
    // Cycles take far longer than the 1s grace period.
    let runner = SlowRunner::new(Duration::from_secs(3600));
    let scheduler = Arc::new(Scheduler::new(runner.clone(), sites(3), cfg(1, 3)));

    let handle = run_for(scheduler, Duration::from_secs(2)).await;
    // run() must come back despite cycles that would run for an hour.
    handle.await.unwrap();
}
