// src/pipeline.rs
//! Per-site cycle coordinator: fetch (with retry and backoff) → dedup
//! reservation → classification → persistence and emission, preserving
//! extraction order throughout. Also the single place that applies
//! feedback events and persists classifier/rotation state, so the
//! cross-cutting write policy lives in one component.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, gauge};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::article::{ArticleLabel, FeedbackEvent};
use crate::classifier::Classifier;
use crate::config::{RetryConfig, WebsiteConfig};
use crate::dedup::DedupStore;
use crate::error::ScanError;
use crate::fetch::Fetcher;
use crate::identity::IdentityManager;
use crate::metrics::ensure_metrics_described;
use crate::notify::Notifier;
use crate::render::Renderer;
use crate::storage::{Repository, RotationRecord};

/// Outcome of one cycle, consumed by the scheduler's backoff logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    Ok,
    /// Fetch retries exhausted; the scheduler widens this site's interval.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub site_id: String,
    pub accepted: u32,
    pub rejected: u32,
    pub dedup_hits: u32,
    pub short_content: u32,
    pub errors: Vec<String>,
    pub status: CycleStatus,
}

impl CycleReport {
    pub fn new(site_id: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            accepted: 0,
            rejected: 0,
            dedup_hits: 0,
            short_content: 0,
            errors: Vec::new(),
            status: CycleStatus::Ok,
        }
    }
}

/// Seam between the scheduler and the coordinator; test schedulers plug
/// in scripted runners.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, site: &WebsiteConfig) -> CycleReport;
}

pub struct Coordinator {
    fetcher: Fetcher,
    identity: Arc<IdentityManager>,
    dedup: Arc<DedupStore>,
    classifier: Arc<Classifier>,
    renderer: Arc<dyn Renderer>,
    notifier: Arc<dyn Notifier>,
    repo: Arc<dyn Repository>,
    retry: RetryConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetcher: Fetcher,
        identity: Arc<IdentityManager>,
        dedup: Arc<DedupStore>,
        classifier: Arc<Classifier>,
        renderer: Arc<dyn Renderer>,
        notifier: Arc<dyn Notifier>,
        repo: Arc<dyn Repository>,
        retry: RetryConfig,
    ) -> Self {
        ensure_metrics_described();
        Self {
            fetcher,
            identity,
            dedup,
            classifier,
            renderer,
            notifier,
            repo,
            retry,
            shutdown: None,
        }
    }

    /// Wire the process shutdown flag: once it flips, in-cycle retries
    /// stop and surface as cancelled network errors.
    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn fetch_with_retry(&self, site: &WebsiteConfig) -> Result<Vec<crate::article::Article>, ScanError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetcher.fetch(site).await {
                Ok(candidates) => return Ok(candidates),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    if self.shutting_down() {
                        debug!(target: "pipeline", site = %site.id, "shutdown in progress, not retrying");
                        return Err(ScanError::cancelled());
                    }
                    let delay = Duration::from_millis(
                        self.retry
                            .base_delay_ms
                            .saturating_mul(1u64 << (attempt - 1).min(16)),
                    );
                    warn!(
                        target: "pipeline",
                        site = %site.id,
                        attempt,
                        max = self.retry.max_attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply one externally-produced feedback event: update the weights
    /// from the stored article's text, append the event, persist the new
    /// classifier snapshot. Returns the classifier version after the
    /// update.
    pub async fn apply_feedback(&self, event: FeedbackEvent) -> Result<u64, ScanError> {
        let article = self
            .repo
            .get_article(&event.fingerprint)
            .await?
            .ok_or_else(|| {
                ScanError::Persistence(format!(
                    "feedback for unknown fingerprint {}",
                    event.fingerprint
                ))
            })?;
        let version = self
            .classifier
            .apply_feedback(&article.combined_text(), event.verdict);
        self.repo.insert_feedback(&event).await?;
        self.repo
            .save_classifier_state(&self.classifier.snapshot())
            .await?;
        Ok(version)
    }

    /// Best-effort persistence of rotation events accumulated since the
    /// last cycle.
    async fn persist_rotation_history(&self) {
        for ev in self.identity.take_history() {
            counter!("scan_rotations_total").increment(1);
            let rec = RotationRecord {
                handle_id: ev.handle_id,
                reason: ev.reason.to_string(),
                at_unix: ev.at_unix,
            };
            if let Err(e) = self.repo.record_rotation(&rec).await {
                warn!(target: "pipeline", error = %e, "failed to persist rotation record");
            }
        }
    }
}

#[async_trait]
impl CycleRunner for Coordinator {
    async fn run_cycle(&self, site: &WebsiteConfig) -> CycleReport {
        let mut report = CycleReport::new(&site.id);

        let candidates = match self.fetch_with_retry(site).await {
            Ok(c) => c,
            Err(e) => {
                warn!(target: "pipeline", site = %site.id, error = %e, "cycle aborted, site degraded");
                report.errors.push(format!("fetch: {e}"));
                report.status = CycleStatus::Degraded;
                counter!("scan_cycle_failures_total").increment(1);
                self.persist_rotation_history().await;
                return report;
            }
        };
        counter!("scan_candidates_total").increment(candidates.len() as u64);

        // Document order is preserved through scoring and emission.
        for mut article in candidates {
            let text = article.combined_text();

            if !self.classifier.content_long_enough(&text) {
                report.short_content += 1;
                counter!("scan_short_content_total").increment(1);
                warn!(
                    target: "pipeline",
                    site = %site.id,
                    fingerprint = %article.fingerprint,
                    chars = text.chars().count(),
                    "candidate below minimum content length, skipped before dedup"
                );
                continue;
            }

            if !self.dedup.check_and_reserve(&article.fingerprint) {
                report.dedup_hits += 1;
                counter!("scan_dedup_total").increment(1);
                debug!(
                    target: "pipeline",
                    site = %site.id,
                    fingerprint = %article.fingerprint,
                    "already seen"
                );
                continue;
            }

            let score = self.classifier.score(&text);
            article.score = score.value;
            article.label = if score.accepted {
                ArticleLabel::Accepted
            } else {
                ArticleLabel::Rejected
            };
            article.high_priority = score.accepted && self.classifier.is_high_priority(&text);

            if let Err(e) = self.repo.insert_article(&article).await {
                // Release the reservation so the article is retried when
                // it is re-extracted on a later cycle.
                self.dedup.release(&article.fingerprint);
                report.errors.push(format!("persist {}: {e}", article.fingerprint));
                warn!(
                    target: "pipeline",
                    site = %site.id,
                    error = %e,
                    "persistence failed, aborting remaining cycle writes"
                );
                break;
            }
            // Best-effort: the in-memory reservation is authoritative for
            // this process, the stored copy only warms the next start.
            if let Some(rec) = self.dedup.record(&article.fingerprint) {
                if let Err(e) = self.repo.save_dedup_record(&article.fingerprint, &rec).await {
                    warn!(target: "pipeline", error = %e, "failed to persist dedup record");
                }
            }

            if score.accepted {
                report.accepted += 1;
                counter!("scan_accepted_total").increment(1);
                let artifact = match self.renderer.render(&article).await {
                    Ok(path) => Some(path),
                    Err(e) => {
                        debug!(
                            target: "pipeline",
                            site = %site.id,
                            error = %format!("{e:#}"),
                            "render failed, delivering without artifact"
                        );
                        None
                    }
                };
                if let Err(e) = self.notifier.deliver(&article, artifact.as_deref()).await {
                    report.errors.push(format!("deliver {}: {e:#}", article.fingerprint));
                    counter!("scan_emit_errors_total").increment(1);
                }
            } else {
                report.rejected += 1;
                counter!("scan_rejected_total").increment(1);
                debug!(
                    target: "pipeline",
                    site = %site.id,
                    fingerprint = %article.fingerprint,
                    score = score.value,
                    vetoed = score.vetoed,
                    cold_start = score.cold_start,
                    "rejected"
                );
            }
        }

        self.persist_rotation_history().await;
        counter!("scan_cycles_total").increment(1);
        gauge!("scan_last_cycle_ts").set(Utc::now().timestamp().max(0) as f64);
        info!(
            target: "pipeline",
            site = %site.id,
            accepted = report.accepted,
            rejected = report.rejected,
            dedup = report.dedup_hits,
            short = report.short_content,
            errors = report.errors.len(),
            "cycle finished"
        );
        report
    }
}
