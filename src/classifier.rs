// src/classifier.rs
//! Online relevance classifier.
//!
//! Scoring is `sigmoid(bias + Σ weight(feature))` over unigram/bigram
//! features of the normalized text, with two short-circuits evaluated
//! first: a blacklist hit vetoes the article to score 0.0, and text below
//! `min_content_length` is rejected before scoring ever happens (the
//! coordinator treats that as a parse-level rejection, not a classifier
//! decision).
//!
//! With an empty weight table the classifier falls back to keyword
//! presence counting (capped at three hits), so the scanner is usable
//! before any feedback exists. Feedback events move the involved weights
//! by `learning_rate * (target - predicted)`, clamped to a fixed range.
//!
//! Weight updates are serialized behind the write half of an `RwLock`;
//! concurrent scoring reads always observe a fully committed weight table
//! and a score computed after update U carries a version >= U.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::article::FeedbackVerdict;
use crate::config::ClassifierConfig;
use crate::error::ScanError;

/// Weight table + bias, versioned monotonically. Owned exclusively by
/// `Classifier`; persisted through the repository as an opaque snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierState {
    pub weights: HashMap<String, f32>,
    pub bias: f32,
    pub version: u64,
}

/// Result of scoring one article text.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    /// Relevance in `[0, 1]`.
    pub value: f32,
    /// `value > threshold`, ties rejected (fail-closed).
    pub accepted: bool,
    /// A blacklist term forced the score to 0.0.
    pub vetoed: bool,
    /// Scored by keyword counting (empty weight table).
    pub cold_start: bool,
    /// Classifier state version the score was computed against.
    pub version: u64,
}

#[derive(Debug)]
struct Lexicon {
    keyword_res: Vec<Regex>,
    blacklist_res: Vec<Regex>,
    priority_res: Vec<Regex>,
}

#[derive(Debug)]
pub struct Classifier {
    accept_threshold: f32,
    learning_rate: f32,
    weight_clamp: f32,
    min_content_length: usize,
    lexicon: RwLock<Lexicon>,
    state: RwLock<ClassifierState>,
}

impl Classifier {
    pub fn new(cfg: &ClassifierConfig) -> anyhow::Result<Self> {
        Ok(Self {
            accept_threshold: cfg.accept_threshold.clamp(0.0, 1.0),
            learning_rate: cfg.learning_rate,
            weight_clamp: cfg.weight_clamp.abs(),
            min_content_length: cfg.min_content_length,
            lexicon: RwLock::new(Lexicon {
                keyword_res: compile_terms(&cfg.keywords)?,
                blacklist_res: compile_terms(&cfg.blacklist)?,
                priority_res: compile_terms(&cfg.priority_keywords)?,
            }),
            state: RwLock::new(ClassifierState::default()),
        })
    }

    /// Pre-screen gate: normalized text long enough to carry any signal.
    pub fn content_long_enough(&self, text: &str) -> bool {
        text.chars().count() >= self.min_content_length
    }

    pub fn score(&self, text: &str) -> Score {
        let lex = self.lexicon.read().expect("classifier lexicon poisoned");

        // Hard veto before the weighted sum.
        if lex.blacklist_res.iter().any(|re| re.is_match(text)) {
            let version = self.state.read().expect("classifier state poisoned").version;
            return Score {
                value: 0.0,
                accepted: false,
                vetoed: true,
                cold_start: false,
                version,
            };
        }

        let state = self.state.read().expect("classifier state poisoned");
        let (value, cold_start) = if state.weights.is_empty() {
            (keyword_presence_score(&lex.keyword_res, text), true)
        } else {
            let features = extract_features(text);
            (linear_score(&state, &features), false)
        };

        let value = value.clamp(0.0, 1.0);
        Score {
            value,
            // Strictly greater: a tie at the threshold is rejected.
            accepted: value > self.accept_threshold,
            vetoed: false,
            cold_start,
            version: state.version,
        }
    }

    pub fn is_high_priority(&self, text: &str) -> bool {
        let lex = self.lexicon.read().expect("classifier lexicon poisoned");
        lex.priority_res.iter().any(|re| re.is_match(text))
    }

    /// Apply one feedback event to the weights of the features present in
    /// `text`. Returns the new state version. Single-writer: the whole
    /// read-modify-write happens under the write lock.
    pub fn apply_feedback(&self, text: &str, verdict: FeedbackVerdict) -> u64 {
        let features = extract_features(text);
        let mut state = self.state.write().expect("classifier state poisoned");
        if features.is_empty() {
            return state.version;
        }

        let predicted = linear_score(&state, &features);
        let delta = self.learning_rate * (verdict.target() - predicted);
        let clamp = self.weight_clamp;
        for f in &features {
            let w = state.weights.entry(f.clone()).or_insert(0.0);
            *w = (*w + delta).clamp(-clamp, clamp);
        }
        state.bias = (state.bias + delta).clamp(-clamp, clamp);
        state.version += 1;

        debug!(
            target: "classifier",
            version = state.version,
            features = features.len(),
            delta,
            "applied feedback"
        );
        state.version
    }

    /// Replace the weight table with a persisted snapshot. Malformed data
    /// (non-finite weights or bias) is rejected so the caller keeps the
    /// cold-start table.
    pub fn load_state(&self, loaded: ClassifierState) -> Result<(), ScanError> {
        if !loaded.bias.is_finite() {
            return Err(ScanError::ClassifierConfig("bias is not finite".into()));
        }
        if let Some((k, v)) = loaded.weights.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ScanError::ClassifierConfig(format!(
                "weight for `{k}` is not finite: {v}"
            )));
        }
        let mut state = self.state.write().expect("classifier state poisoned");
        info!(
            target: "classifier",
            version = loaded.version,
            weights = loaded.weights.len(),
            "loaded classifier state"
        );
        *state = loaded;
        Ok(())
    }

    pub fn snapshot(&self) -> ClassifierState {
        self.state.read().expect("classifier state poisoned").clone()
    }

    /// Replace the keyword list at runtime (feedback tooling).
    pub fn update_keywords(&self, keywords: &[String]) -> anyhow::Result<()> {
        let compiled = compile_terms(keywords)?;
        let mut lex = self.lexicon.write().expect("classifier lexicon poisoned");
        lex.keyword_res = compiled;
        info!(target: "classifier", count = keywords.len(), "updated keywords");
        Ok(())
    }

    pub fn update_blacklist(&self, blacklist: &[String]) -> anyhow::Result<()> {
        let compiled = compile_terms(blacklist)?;
        let mut lex = self.lexicon.write().expect("classifier lexicon poisoned");
        lex.blacklist_res = compiled;
        info!(target: "classifier", count = blacklist.len(), "updated blacklist");
        Ok(())
    }

    #[cfg(test)]
    fn weight_of(&self, feature: &str) -> f32 {
        self.state
            .read()
            .unwrap()
            .weights
            .get(feature)
            .copied()
            .unwrap_or(0.0)
    }
}

/// Word-boundary, case-insensitive matcher per term. Terms are escaped,
/// so user configuration cannot inject regex syntax.
fn compile_terms(terms: &[String]) -> anyhow::Result<Vec<Regex>> {
    terms
        .iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(t.trim())))
                .map_err(|e| anyhow::anyhow!("term `{t}`: {e}"))
        })
        .collect()
}

/// Distinct lowercase unigrams plus adjacent bigrams.
pub fn extract_features(text: &str) -> Vec<String> {
    static RE_TOKEN: OnceCell<Regex> = OnceCell::new();
    let re = RE_TOKEN.get_or_init(|| Regex::new(r"(?u)\b\w+\b").expect("token regex"));

    let tokens: Vec<String> = re
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect();

    let mut set = BTreeSet::new();
    for t in &tokens {
        set.insert(t.clone());
    }
    for pair in tokens.windows(2) {
        set.insert(format!("{} {}", pair[0], pair[1]));
    }
    set.into_iter().collect()
}

fn linear_score(state: &ClassifierState, features: &[String]) -> f32 {
    let sum: f32 = features
        .iter()
        .filter_map(|f| state.weights.get(f))
        .sum();
    sigmoid(state.bias + sum)
}

/// Cold-start fallback: keyword hits capped at three, normalized to
/// `[0, 1]`. One hit scores 1/3, three or more score 1.0. An empty
/// keyword list scores 0.0 (fail-closed until keywords or feedback exist).
fn keyword_presence_score(keyword_res: &[Regex], text: &str) -> f32 {
    let hits = keyword_res.iter().filter(|re| re.is_match(text)).count();
    (hits.min(3) as f32) / 3.0
}

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(keywords: &[&str], blacklist: &[&str], threshold: f32) -> ClassifierConfig {
        ClassifierConfig {
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            blacklist: blacklist.iter().map(|s| s.to_string()).collect(),
            accept_threshold: threshold,
            min_content_length: 0,
            ..ClassifierConfig::default()
        }
    }

    #[test]
    fn cold_start_counts_keyword_presence() {
        let c = Classifier::new(&cfg(&["fusion", "reactor", "tokamak"], &[], 0.5)).unwrap();
        let s = c.score("the fusion reactor came online");
        assert!(s.cold_start);
        assert!((s.value - 2.0 / 3.0).abs() < 1e-6);
        assert!(s.accepted);

        let s = c.score("nothing to see here");
        assert_eq!(s.value, 0.0);
        assert!(!s.accepted);
    }

    #[test]
    fn blacklist_vetoes_before_scoring() {
        let c = Classifier::new(&cfg(&["fusion"], &["casino"], 0.1)).unwrap();
        let s = c.score("fusion fusion fusion casino bonus");
        assert!(s.vetoed);
        assert_eq!(s.value, 0.0);
        assert!(!s.accepted);
    }

    #[test]
    fn blacklist_matches_whole_words_only() {
        let c = Classifier::new(&cfg(&["news"], &["ad"], 0.1)).unwrap();
        // "ad" must not match inside "adaptive".
        let s = c.score("adaptive optics news");
        assert!(!s.vetoed);
    }

    #[test]
    fn threshold_tie_is_rejected() {
        // Three keyword hits give exactly 1.0; threshold 1.0 must reject.
        let c = Classifier::new(&cfg(&["a1", "b2", "c3"], &[], 1.0)).unwrap();
        let s = c.score("a1 b2 c3");
        assert!((s.value - 1.0).abs() < 1e-6);
        assert!(!s.accepted, "score equal to threshold must fail closed");
    }

    #[test]
    fn positive_feedback_never_decreases_a_weight() {
        let c = Classifier::new(&cfg(&[], &[], 0.5)).unwrap();
        let text = "quantum radio telescope";
        let mut last = c.weight_of("quantum");
        for _ in 0..50 {
            c.apply_feedback(text, FeedbackVerdict::Positive);
            let w = c.weight_of("quantum");
            assert!(w >= last, "weight decreased under positive feedback");
            last = w;
        }
    }

    #[test]
    fn repeated_positive_feedback_converges_toward_accept() {
        let c = Classifier::new(&cfg(&[], &[], 0.9)).unwrap();
        let text = "quantum radio telescope";
        for _ in 0..200 {
            c.apply_feedback(text, FeedbackVerdict::Positive);
        }
        let s = c.score(text);
        assert!(!s.cold_start);
        assert!(s.value > 0.9, "converged score {} too low", s.value);
        assert!(s.accepted);
    }

    #[test]
    fn weights_stay_within_clamp() {
        let mut config = cfg(&[], &[], 0.5);
        config.weight_clamp = 1.5;
        config.learning_rate = 1.0;
        let c = Classifier::new(&config).unwrap();
        for _ in 0..100 {
            c.apply_feedback("spike", FeedbackVerdict::Positive);
        }
        assert!(c.weight_of("spike") <= 1.5);
        for _ in 0..200 {
            c.apply_feedback("spike", FeedbackVerdict::Negative);
        }
        assert!(c.weight_of("spike") >= -1.5);
    }

    #[test]
    fn version_is_monotonic_and_scores_carry_it() {
        let c = Classifier::new(&cfg(&[], &[], 0.5)).unwrap();
        let v0 = c.score("anything").version;
        let v1 = c.apply_feedback("anything", FeedbackVerdict::Positive);
        assert!(v1 > v0);
        assert_eq!(c.score("anything").version, v1);
    }

    #[test]
    fn malformed_state_is_rejected() {
        let c = Classifier::new(&cfg(&["x"], &[], 0.5)).unwrap();
        let mut bad = ClassifierState::default();
        bad.weights.insert("w".into(), f32::NAN);
        assert!(matches!(
            c.load_state(bad),
            Err(ScanError::ClassifierConfig(_))
        ));
        // Still in cold start after the rejected load.
        assert!(c.score("x").cold_start);
    }

    #[test]
    fn loaded_state_takes_over_from_cold_start() {
        let c = Classifier::new(&cfg(&["x"], &[], 0.5)).unwrap();
        let mut st = ClassifierState::default();
        st.weights.insert("x".into(), 4.0);
        st.version = 7;
        c.load_state(st).unwrap();
        let s = c.score("x");
        assert!(!s.cold_start);
        assert_eq!(s.version, 7);
        assert!(s.accepted);
    }

    #[test]
    fn features_are_distinct_unigrams_and_bigrams() {
        let f = extract_features("Big News big news");
        assert!(f.contains(&"big".to_string()));
        assert!(f.contains(&"news".to_string()));
        assert!(f.contains(&"big news".to_string()));
        assert!(f.contains(&"news big".to_string()));
        assert_eq!(f.iter().filter(|x| x.as_str() == "big").count(), 1);
    }

    #[test]
    fn short_content_gate_uses_char_count() {
        let mut config = cfg(&[], &[], 0.5);
        config.min_content_length = 10;
        let c = Classifier::new(&config).unwrap();
        assert!(!c.content_long_enough("too short"));
        assert!(c.content_long_enough("long enough now"));
    }

    #[test]
    fn updated_blacklist_applies_to_later_scores() {
        let c = Classifier::new(&cfg(&["solar"], &[], 0.1)).unwrap();
        assert!(!c.score("solar flare advertisement").vetoed);
        c.update_blacklist(&["advertisement".into()]).unwrap();
        assert!(c.score("solar flare advertisement").vetoed);
    }
}
