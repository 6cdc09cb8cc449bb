// src/services/page.rs
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;

pub const INDEX_FILE: &str = "index.html";

#[derive(Debug, Error)]
#[error("cannot read page template {}: {source}", .path.display())]
pub struct PageError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// The chat page, read once at startup and served from memory.
#[derive(Debug, Clone)]
pub struct IndexPage {
    html: Arc<str>,
}

impl IndexPage {
    pub fn from_html(html: impl Into<Arc<str>>) -> Self {
        Self { html: html.into() }
    }

    /// Read `{dir}/index.html`. A missing template should stop startup.
    pub async fn load(dir: impl AsRef<Path>) -> Result<Self, PageError> {
        let path = dir.as_ref().join(INDEX_FILE);
        let html = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| PageError { path, source })?;
        Ok(Self::from_html(html))
    }

    pub fn html(&self) -> &str {
        &self.html
    }
}
