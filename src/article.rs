// src/article.rs
//! Core data model: articles, fingerprints, and feedback events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable content identity for an article, used as the dedup key.
///
/// Hex SHA-256 over `(site id, normalized url, normalized title, body
/// prefix)` — see `fetch::fingerprint`. Minor trailing body edits to the
/// same article keep the digest stable; identical titles on different
/// sites do not collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal classification state. Set exactly once by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleLabel {
    Pending,
    Accepted,
    Rejected,
}

/// One extracted article. Created by the fetcher/extractor with label
/// `Pending` and score 0.0; scored by the classifier; finalized by the
/// coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub fingerprint: Fingerprint,
    pub site_id: String,
    pub url: String,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    /// Relevance score in `[0, 1]`.
    pub score: f32,
    pub label: ArticleLabel,
    /// Hint for the notifier: the text hit a configured priority keyword.
    #[serde(default)]
    pub high_priority: bool,
}

impl Article {
    /// Title and body joined the way the classifier sees them.
    pub fn combined_text(&self) -> String {
        let mut s = String::with_capacity(self.title.len() + self.body.len() + 1);
        s.push_str(&self.title);
        if !self.title.is_empty() && !self.body.is_empty() {
            s.push(' ');
        }
        s.push_str(&self.body);
        s
    }
}

/// User verdict on an emitted article. Append-only; consumed by the
/// classifier's online update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackVerdict {
    Positive,
    Negative,
}

impl FeedbackVerdict {
    /// Training target for the online update: 1.0 or 0.0.
    pub fn target(self) -> f32 {
        match self {
            Self::Positive => 1.0,
            Self::Negative => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub fingerprint: Fingerprint,
    pub verdict: FeedbackVerdict,
    pub ts_unix: u64,
}
