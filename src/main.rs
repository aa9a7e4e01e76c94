//! Scanner binary entrypoint.
//!
//! Wires the identity manager, fetcher, dedup store, classifier, and
//! default collaborators, then runs the scheduler until Ctrl-C. All
//! behavior is driven by the resolved configuration file (see
//! `config/scanner.toml`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tor_web_scanner::classifier::Classifier;
use tor_web_scanner::config::ScannerConfig;
use tor_web_scanner::dedup::DedupStore;
use tor_web_scanner::fetch::{Fetcher, ProxiedClient};
use tor_web_scanner::identity::IdentityManager;
use tor_web_scanner::notify::LogNotifier;
use tor_web_scanner::pipeline::Coordinator;
use tor_web_scanner::render::NullRenderer;
use tor_web_scanner::scheduler::{Scheduler, SchedulerConfig};
use tor_web_scanner::storage::{MemoryRepository, Repository};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op elsewhere.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = ScannerConfig::load_default().context("loading scanner config")?;
    info!(
        sites = cfg.sites.len(),
        tor = cfg.identity.enabled,
        interval_secs = cfg.scan_interval_secs,
        "configuration loaded"
    );

    let identity = Arc::new(IdentityManager::from_config(&cfg.identity));
    let source = Arc::new(
        ProxiedClient::new(&cfg.fetch, identity.proxy_url().as_deref())
            .context("building http client")?,
    );
    let fetcher = Fetcher::new(source, identity.clone(), cfg.fetch.clone());
    let dedup = Arc::new(DedupStore::new(Duration::from_secs(cfg.dedup.ttl_secs)));
    let classifier = Arc::new(Classifier::new(&cfg.classifier).context("building classifier")?);
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());

    // Warm the dedup store so a restart does not re-emit recent articles.
    match repo.load_dedup_records().await {
        Ok(records) => {
            let count = records.len();
            for (fp, rec) in records {
                dedup.restore(fp, rec);
            }
            if count > 0 {
                info!(count, "restored dedup records");
            }
        }
        Err(e) => warn!(error = %e, "could not load dedup records"),
    }

    match repo.load_classifier_state().await {
        Ok(Some(state)) => {
            if let Err(e) = classifier.load_state(state) {
                warn!(error = %e, "persisted classifier state rejected, staying on cold start");
            }
        }
        Ok(None) => info!("no persisted classifier state, starting cold"),
        Err(e) => warn!(error = %e, "could not load classifier state"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = Arc::new(
        Coordinator::new(
            fetcher,
            identity.clone(),
            dedup,
            classifier,
            Arc::new(NullRenderer),
            Arc::new(LogNotifier),
            repo,
            cfg.retry.clone(),
        )
        .with_shutdown(shutdown_rx.clone()),
    );
    let scheduler = Scheduler::new(
        coordinator,
        cfg.sites.clone(),
        SchedulerConfig::from_scanner(&cfg),
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    scheduler.run(shutdown_rx).await;
    Ok(())
}
