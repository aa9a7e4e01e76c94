// src/render.rs
//! Summary-image rendering boundary. Invoked only for accepted articles;
//! a rendering failure never changes the article's stored label — the
//! notifier is simply called without an artifact.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::article::Article;

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, article: &Article) -> anyhow::Result<PathBuf>;
}

/// Default wiring when no renderer is deployed: every render "fails",
/// which the coordinator treats as deliver-without-artifact.
pub struct NullRenderer;

#[async_trait]
impl Renderer for NullRenderer {
    async fn render(&self, _article: &Article) -> anyhow::Result<PathBuf> {
        anyhow::bail!("no renderer configured")
    }
}
