// src/notify.rs
//! Outbound notification boundary.
//!
//! The core invokes `deliver` for every accepted article and records
//! failures in the cycle report; it does not retry deliveries itself and
//! may call more than once for the same fingerprint across cycles, so
//! implementations must be idempotent per fingerprint.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::article::Article;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, article: &Article, artifact: Option<&Path>) -> anyhow::Result<()>;
}

/// Default wiring: log the delivery instead of sending it anywhere.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, article: &Article, artifact: Option<&Path>) -> anyhow::Result<()> {
        info!(
            target: "notify",
            site = %article.site_id,
            fingerprint = %article.fingerprint,
            score = article.score,
            high_priority = article.high_priority,
            artifact = artifact.map(|p| p.display().to_string()),
            title = %article.title,
            "accepted article"
        );
        Ok(())
    }
}
