// src/fetch.rs
//! Page retrieval through the current exit identity and candidate
//! extraction via per-site selector rules.
//!
//! Network failures are reported to the identity manager; responses that
//! look like blocking (configured status codes, or a body far below the
//! site's historical size) trigger an unconditional forced rotation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::OnceCell;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::article::{Article, ArticleLabel, Fingerprint};
use crate::config::{ExtractionRules, FetchConfig, WebsiteConfig};
use crate::error::ScanError;
use crate::identity::{IdentityManager, RotationReason};

/// One retrieved page, status preserved (blocking detection happens in
/// the fetcher, not the transport).
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Transport seam. Production goes through [`ProxiedClient`]; tests feed
/// fixture pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchedPage, ScanError>;
}

/// `reqwest` client routed through the identity manager's SOCKS proxy
/// when the identity layer is enabled.
pub struct ProxiedClient {
    client: reqwest::Client,
}

impl ProxiedClient {
    pub fn new(cfg: &FetchConfig, proxy_url: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .user_agent(cfg.user_agent.clone());
        if let Some(proxy) = proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl PageSource for ProxiedClient {
    async fn get(&self, url: &str) -> Result<FetchedPage, ScanError> {
        let resp = self.client.get(url).send().await.map_err(map_reqwest_err)?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp.text().await.map_err(map_reqwest_err)?;
        Ok(FetchedPage {
            url: final_url,
            status,
            body,
        })
    }
}

fn map_reqwest_err(e: reqwest::Error) -> ScanError {
    if e.is_timeout() {
        ScanError::network("request timeout")
    } else if e.is_connect() {
        ScanError::network(format!("connection failed: {e}"))
    } else {
        ScanError::network(e.to_string())
    }
}

/// Selector rules compiled once. Config load validates these, so a
/// runtime compile failure means the config was mutated out from under
/// us and is reported as a parse error.
pub struct CompiledRules {
    container: Selector,
    title: Option<Selector>,
    body: Option<Selector>,
    image: Option<Selector>,
    link: Option<Selector>,
}

impl CompiledRules {
    pub fn compile(rules: &ExtractionRules) -> anyhow::Result<Self> {
        Ok(Self {
            container: parse_selector(&rules.container)?,
            title: rules.title.as_deref().map(parse_selector).transpose()?,
            body: rules.body.as_deref().map(parse_selector).transpose()?,
            image: rules.image.as_deref().map(parse_selector).transpose()?,
            link: rules.link.as_deref().map(parse_selector).transpose()?,
        })
    }
}

fn parse_selector(s: &str) -> anyhow::Result<Selector> {
    Selector::parse(s).map_err(|e| anyhow::anyhow!("selector `{s}`: {e}"))
}

pub struct Fetcher {
    source: Arc<dyn PageSource>,
    identity: Arc<IdentityManager>,
    cfg: FetchConfig,
    /// Rolling body sizes of successful fetches, per site.
    sizes: Mutex<HashMap<String, VecDeque<usize>>>,
}

impl Fetcher {
    pub fn new(source: Arc<dyn PageSource>, identity: Arc<IdentityManager>, cfg: FetchConfig) -> Self {
        Self {
            source,
            identity,
            cfg,
            sizes: Mutex::new(HashMap::new()),
        }
    }

    /// Retrieve one page and extract candidate articles in document order.
    pub async fn fetch(&self, site: &WebsiteConfig) -> Result<Vec<Article>, ScanError> {
        let handle = self
            .identity
            .ensure_ready()
            .await
            .map_err(|e| ScanError::network(format!("identity not ready: {e:#}")))?;

        let page = match self.source.get(&site.url).await {
            Ok(p) => p,
            Err(e) => {
                if matches!(e, ScanError::Network { cancelled: false, .. }) {
                    self.identity.report_failure(&handle).await;
                }
                return Err(e);
            }
        };

        if self.cfg.blocked_status_codes.contains(&page.status) {
            warn!(
                target: "fetch",
                site = %site.id,
                status = page.status,
                "blocking status, forcing identity rotation"
            );
            self.force_rotation().await;
            return Err(ScanError::blocked(format!("http status {}", page.status)));
        }
        if !(200..300).contains(&page.status) {
            self.identity.report_failure(&handle).await;
            return Err(ScanError::network(format!("http status {}", page.status)));
        }
        if self.body_suspiciously_small(&site.id, page.body.len()) {
            warn!(
                target: "fetch",
                site = %site.id,
                bytes = page.body.len(),
                "body far below historical average, forcing identity rotation"
            );
            self.force_rotation().await;
            return Err(ScanError::blocked(format!(
                "body of {} bytes far below historical average",
                page.body.len()
            )));
        }
        self.record_size(&site.id, page.body.len());

        let candidates = self.extract(&page.body, site, &page.url)?;
        info!(
            target: "fetch",
            site = %site.id,
            count = candidates.len(),
            "extracted candidates"
        );
        Ok(candidates)
    }

    async fn force_rotation(&self) {
        if let Err(e) = self.identity.rotate(RotationReason::ForcedFailure).await {
            warn!(target: "fetch", error = %format!("{e:#}"), "forced rotation failed");
        }
    }

    /// Blocking heuristic: armed once `min_size_samples` successful sizes
    /// exist; trips when the body is below `ratio * rolling mean`.
    fn body_suspiciously_small(&self, site_id: &str, len: usize) -> bool {
        let sizes = self.sizes.lock().expect("size history mutex poisoned");
        let Some(history) = sizes.get(site_id) else {
            return false;
        };
        if history.len() < self.cfg.min_size_samples {
            return false;
        }
        let mean = history.iter().sum::<usize>() as f64 / history.len() as f64;
        (len as f64) < mean * self.cfg.blocked_size_ratio
    }

    fn record_size(&self, site_id: &str, len: usize) {
        let mut sizes = self.sizes.lock().expect("size history mutex poisoned");
        let history = sizes.entry(site_id.to_string()).or_default();
        history.push_back(len);
        while history.len() > self.cfg.size_window {
            history.pop_front();
        }
    }

    /// Apply the site's selector rules to the document. Each container
    /// match yields at most one draft; a container with neither title nor
    /// body is selector noise and dropped silently.
    fn extract(
        &self,
        html: &str,
        site: &WebsiteConfig,
        page_url: &str,
    ) -> Result<Vec<Article>, ScanError> {
        let rules = CompiledRules::compile(&site.selectors)
            .map_err(|e| ScanError::Parse(format!("site `{}`: {e}", site.id)))?;
        let base = Url::parse(page_url).ok();
        let doc = Html::parse_document(html);
        let fetched_at = Utc::now();

        let mut out = Vec::new();
        for container in doc.select(&rules.container) {
            let title = first_text(&container, rules.title.as_ref());
            let body = first_text(&container, rules.body.as_ref());
            if title.is_empty() && body.is_empty() {
                continue;
            }

            let image_url = first_attr(&container, rules.image.as_ref(), "src")
                .and_then(|src| resolve(base.as_ref(), &src));
            let link = first_attr(&container, rules.link.as_ref(), "href")
                .and_then(|href| resolve(base.as_ref(), &href))
                .unwrap_or_else(|| page_url.to_string());

            let url = normalize_url(&link);
            let fingerprint = fingerprint(
                &site.id,
                &url,
                &title,
                &body,
                self.cfg.fingerprint_body_prefix,
            );
            out.push(Article {
                fingerprint,
                site_id: site.id.clone(),
                url,
                title,
                body,
                image_url,
                fetched_at,
                score: 0.0,
                label: ArticleLabel::Pending,
                high_priority: false,
            });
        }
        debug!(target: "fetch", site = %site.id, drafts = out.len(), "extraction finished");
        Ok(out)
    }
}

fn first_text(container: &ElementRef<'_>, sel: Option<&Selector>) -> String {
    let Some(sel) = sel else {
        return String::new();
    };
    container
        .select(sel)
        .next()
        .map(|el| normalize_text(&el.text().collect::<Vec<_>>().join(" ")))
        .unwrap_or_default()
}

fn first_attr(container: &ElementRef<'_>, sel: Option<&Selector>, attr: &str) -> Option<String> {
    let sel = sel?;
    container
        .select(sel)
        .find_map(|el| el.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn resolve(base: Option<&Url>, href: &str) -> Option<String> {
    match base {
        Some(b) => b.join(href).ok().map(|u| u.to_string()),
        None => Url::parse(href).ok().map(|u| u.to_string()),
    }
}

/// Normalize extracted text: decode entities, strip stray tags, unify
/// quotes, collapse whitespace. Capped so one runaway container cannot
/// bloat every downstream store.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    out = re_tags.replace_all(&out, "").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > 1500 {
        out = out.chars().take(1500).collect();
    }
    out
}

/// Canonical form of an article url for fingerprinting: drop the
/// fragment, trim a trailing slash. Query strings stay (they can be the
/// only thing distinguishing two articles).
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut u) => {
            u.set_fragment(None);
            let s = u.to_string();
            s.strip_suffix('/').map(str::to_string).unwrap_or(s)
        }
        Err(_) => raw.trim().trim_end_matches('/').to_string(),
    }
}

/// Deterministic digest over `(site id, normalized url, normalized
/// title, body prefix)`. The prefix keeps trailing body edits (live
/// timestamps, share counters) from producing spurious duplicates; the
/// site id keeps identical titles on different sites from colliding.
pub fn fingerprint(
    site_id: &str,
    normalized_url: &str,
    title: &str,
    body: &str,
    body_prefix: usize,
) -> Fingerprint {
    let prefix: String = body.chars().take(body_prefix).collect();
    let mut hasher = Sha256::new();
    hasher.update(site_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalized_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(title.as_bytes());
    hasher.update(b"\n");
    hasher.update(prefix.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{b:02x}");
    }
    Fingerprint(out)
}
