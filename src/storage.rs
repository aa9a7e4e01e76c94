// src/storage.rs
//! Persistence boundary. The core depends only on this trait; the
//! storage engine behind it is a deployment concern. An in-memory
//! implementation ships for default wiring and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::article::{Article, ArticleLabel, FeedbackEvent, Fingerprint};
use crate::classifier::ClassifierState;
use crate::dedup::DedupRecord;
use crate::error::ScanError;

#[derive(Debug, Clone)]
pub struct RotationRecord {
    pub handle_id: u64,
    pub reason: String,
    pub at_unix: u64,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_article(&self, article: &Article) -> Result<(), ScanError>;
    async fn get_article(&self, fp: &Fingerprint) -> Result<Option<Article>, ScanError>;
    async fn update_label(&self, fp: &Fingerprint, label: ArticleLabel) -> Result<(), ScanError>;
    async fn insert_feedback(&self, event: &FeedbackEvent) -> Result<(), ScanError>;
    async fn save_classifier_state(&self, state: &ClassifierState) -> Result<(), ScanError>;
    async fn load_classifier_state(&self) -> Result<Option<ClassifierState>, ScanError>;
    async fn save_dedup_record(&self, fp: &Fingerprint, rec: &DedupRecord) -> Result<(), ScanError>;
    async fn load_dedup_records(&self) -> Result<Vec<(Fingerprint, DedupRecord)>, ScanError>;
    async fn record_rotation(&self, record: &RotationRecord) -> Result<(), ScanError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    articles: HashMap<Fingerprint, Article>,
    feedback: Vec<FeedbackEvent>,
    classifier: Option<ClassifierState>,
    dedup: HashMap<Fingerprint, DedupRecord>,
    rotations: Vec<RotationRecord>,
}

/// Process-local repository. Not durable; suitable for tests and for
/// running the scanner without an external store.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    inner: Mutex<MemoryInner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn article_count(&self) -> usize {
        self.inner.lock().expect("memory repo poisoned").articles.len()
    }

    pub fn labels(&self) -> Vec<(Fingerprint, ArticleLabel)> {
        let inner = self.inner.lock().expect("memory repo poisoned");
        inner
            .articles
            .iter()
            .map(|(fp, a)| (fp.clone(), a.label))
            .collect()
    }

    pub fn rotation_count(&self) -> usize {
        self.inner.lock().expect("memory repo poisoned").rotations.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_article(&self, article: &Article) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        inner
            .articles
            .insert(article.fingerprint.clone(), article.clone());
        Ok(())
    }

    async fn get_article(&self, fp: &Fingerprint) -> Result<Option<Article>, ScanError> {
        let inner = self.inner.lock().expect("memory repo poisoned");
        Ok(inner.articles.get(fp).cloned())
    }

    async fn update_label(&self, fp: &Fingerprint, label: ArticleLabel) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        match inner.articles.get_mut(fp) {
            Some(a) => {
                a.label = label;
                Ok(())
            }
            None => Err(ScanError::Persistence(format!(
                "no article with fingerprint {fp}"
            ))),
        }
    }

    async fn insert_feedback(&self, event: &FeedbackEvent) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        inner.feedback.push(event.clone());
        Ok(())
    }

    async fn save_classifier_state(&self, state: &ClassifierState) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        inner.classifier = Some(state.clone());
        Ok(())
    }

    async fn load_classifier_state(&self) -> Result<Option<ClassifierState>, ScanError> {
        let inner = self.inner.lock().expect("memory repo poisoned");
        Ok(inner.classifier.clone())
    }

    async fn save_dedup_record(&self, fp: &Fingerprint, rec: &DedupRecord) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        inner.dedup.insert(fp.clone(), rec.clone());
        Ok(())
    }

    async fn load_dedup_records(&self) -> Result<Vec<(Fingerprint, DedupRecord)>, ScanError> {
        let inner = self.inner.lock().expect("memory repo poisoned");
        Ok(inner.dedup.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn record_rotation(&self, record: &RotationRecord) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        inner.rotations.push(record.clone());
        Ok(())
    }
}
