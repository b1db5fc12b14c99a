//! Shared helpers for integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use sift::{BoundNode, Crawler, PageSummary};

/// Generous bound on any single test operation.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Low difficulty keeps the admission puzzle fast in tests while still
/// exercising the full solve/verify path.
pub const TEST_DIFFICULTY: u32 = 1;

/// Crawler serving canned pages from memory.
pub struct StubCrawler {
    pages: HashMap<String, PageSummary>,
}

impl StubCrawler {
    pub fn new(pages: impl IntoIterator<Item = (String, PageSummary)>) -> Arc<Self> {
        Arc::new(Self {
            pages: pages.into_iter().collect(),
        })
    }

    pub fn single(url: &str, title: &str, tokens: &[&str], edges: &[&str]) -> Arc<Self> {
        let summary = PageSummary {
            title: title.to_string(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            edge_urls: edges.iter().map(|e| e.to_string()).collect(),
        };
        Self::new([(url.to_string(), summary)])
    }

    pub fn empty() -> Arc<Self> {
        Self::new([])
    }
}

#[async_trait]
impl Crawler for StubCrawler {
    async fn analyze_page(&self, url: &str) -> Result<PageSummary> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown url {url}"))
    }

    async fn crawl(&self, _urls: Vec<String>) {}
}

/// Bind a node on an ephemeral loopback port.
pub async fn bind_node(crawler: Arc<dyn Crawler>) -> Result<BoundNode> {
    BoundNode::bind("127.0.0.1:0", TEST_DIFFICULTY, crawler, 16).await
}
