// src/metrics.rs
//! One-time registration of the scanner's metric series.

use once_cell::sync::OnceCell;

use metrics::{describe_counter, describe_gauge};

pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("scan_cycles_total", "Completed site cycles.");
        describe_counter!(
            "scan_cycle_failures_total",
            "Cycles aborted after exhausting fetch retries."
        );
        describe_counter!("scan_candidates_total", "Candidates extracted from pages.");
        describe_counter!("scan_accepted_total", "Articles accepted by the classifier.");
        describe_counter!("scan_rejected_total", "Articles rejected by the classifier.");
        describe_counter!("scan_dedup_total", "Candidates dropped as already seen.");
        describe_counter!(
            "scan_short_content_total",
            "Candidates dropped before scoring for insufficient content."
        );
        describe_counter!(
            "scan_emit_errors_total",
            "Collaborator failures while emitting accepted articles."
        );
        describe_counter!("scan_rotations_total", "Exit identity rotations.");
        describe_counter!(
            "scan_ticks_skipped_total",
            "Scheduler ticks skipped because the site's cycle was still running."
        );
        describe_gauge!("scan_last_cycle_ts", "Unix ts of the last finished cycle.");
    });
}
