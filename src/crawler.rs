//! # Page Crawler
//!
//! Fetches web pages and reduces them to what the overlay indexes:
//!
//! - `title`: the text of the first `<title>` element
//! - `tokens`: whitespace-separated tokens of the title text followed by the
//!   text of each anchor and paragraph, in document order
//! - `edge_urls`: `href` values of `<a>` elements that parse as absolute
//!   http/https URLs; relative and non-HTTP hrefs are dropped
//!
//! The [`Crawler`] trait is the seam between the overlay and the web: the
//! publish path analyzes one page synchronously, while edge URLs discovered
//! on inbound stores are fetched in the background for future publishing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, trace};

/// What a crawled page contributes to the index.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PageSummary {
    pub title: String,
    pub tokens: Vec<String>,
    pub edge_urls: Vec<String>,
}

#[async_trait]
pub trait Crawler: Send + Sync {
    /// Fetch `url` and extract its title, token stream, and outgoing links.
    async fn analyze_page(&self, url: &str) -> Result<PageSummary>;

    /// Fetch each URL in the background; results are discarded. Failures are
    /// logged, never surfaced.
    async fn crawl(&self, urls: Vec<String>);
}

/// Production crawler over an HTTP client.
pub struct HttpCrawler {
    client: reqwest::Client,
}

/// Per-fetch deadline.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

impl HttpCrawler {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("sift/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Crawler for HttpCrawler {
    async fn analyze_page(&self, url: &str) -> Result<PageSummary> {
        let body = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch {url}"))?
            .error_for_status()
            .with_context(|| format!("{url} answered with an error status"))?
            .text()
            .await
            .with_context(|| format!("failed to read body of {url}"))?;

        Ok(analyze(&body))
    }

    async fn crawl(&self, urls: Vec<String>) {
        for url in urls {
            match self.client.get(&url).send().await {
                Ok(response) => trace!(url = %url, status = %response.status(), "crawled edge"),
                Err(err) => debug!(url = %url, error = %err, "edge crawl failed"),
            }
        }
    }
}

/// Reduce an HTML document to its index contribution.
///
/// Tokens come from text nodes whose parent is `<title>`, `<a>`, or `<p>`,
/// visited in document order, so the title (in the head) leads the stream and
/// nested anchor text is counted once.
pub fn analyze(html: &str) -> PageSummary {
    let document = Html::parse_document(html);

    let title_selector = Selector::parse("title").expect("static selector");
    let title = document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let mut tokens = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let parent_name = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|element| element.name()));
        if matches!(parent_name, Some("title") | Some("a") | Some("p")) {
            let text: &str = text;
            tokens.extend(text.split_whitespace().map(str::to_string));
        }
    }

    let anchor_selector = Selector::parse("a[href]").expect("static selector");
    let mut edge_urls = Vec::new();
    for element in document.select(&anchor_selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if let Ok(parsed) = reqwest::Url::parse(href) {
            if matches!(parsed.scheme(), "http" | "https") {
                edge_urls.push(href.to_string());
            }
        }
    }

    PageSummary {
        title,
        tokens,
        edge_urls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_and_single_anchor() {
        let page = analyze(
            r#"
<!DOCTYPE html><html>
    <header>
        <title>title1</title>
    </header>
    <body>
        <a href="https://www.google.com">
    </body>
</html>"#,
        );

        assert_eq!(page.title, "title1");
        assert_eq!(page.tokens, vec!["title1"]);
        assert_eq!(page.edge_urls, vec!["https://www.google.com"]);
    }

    #[test]
    fn tokens_follow_document_order() {
        let page = analyze(
            r#"
<!DOCTYPE html><html>
    <header>
        <title>This is a pen</title>
    </header>
    <body>
        <a href="https://www.google.com"> 123456 </a>
        <a href="https://www.example.com"> 123456 </a>
    </body>
</html>"#,
        );

        assert_eq!(page.title, "This is a pen");
        assert_eq!(
            page.edge_urls,
            vec!["https://www.google.com", "https://www.example.com"]
        );
        assert_eq!(
            page.tokens,
            vec!["This", "is", "a", "pen", "123456", "123456"]
        );
    }

    #[test]
    fn paragraph_text_is_tokenized_after_anchors() {
        let page = analyze(
            r#"
<!DOCTYPE html><html>
    <header>
        <title>This is a pen 100yen</title>
    </header>
    <body>
        <a href="https://www.google.com"> 123456 </a>
        <a href="https://www.example.com"> 123456 </a>
        <p> this is first text field</p>
    </body>
</html>"#,
        );

        assert_eq!(page.title, "This is a pen 100yen");
        assert_eq!(page.edge_urls.len(), 2);
        assert_eq!(
            page.tokens,
            vec![
                "This", "is", "a", "pen", "100yen", "123456", "123456", "this", "is", "first",
                "text", "field"
            ]
        );
    }

    #[test]
    fn non_http_and_relative_hrefs_are_dropped_from_edges() {
        let page = analyze(
            r#"
<!DOCTYPE html><html>
    <header>
        <title>This is a pen 100yen</title>
    </header>
    <body>
        <a href="https://www.google.com"> 123456 </a>
        <a href="htt://www.example.com"> 123456 </a>
        <a href="/img/cat.jpg"></a>
        <p> this is first text field</p>
    </body>
</html>"#,
        );

        // Only the well-formed absolute HTTP(S) link survives as an edge;
        // anchor text still tokenizes regardless of its href.
        assert_eq!(page.edge_urls, vec!["https://www.google.com"]);
        assert_eq!(
            page.tokens,
            vec![
                "This", "is", "a", "pen", "100yen", "123456", "123456", "this", "is", "first",
                "text", "field"
            ]
        );
    }

    #[test]
    fn missing_title_yields_empty_title() {
        let page = analyze("<html><body><p>just text</p></body></html>");
        assert_eq!(page.title, "");
        assert_eq!(page.tokens, vec!["just", "text"]);
        assert!(page.edge_urls.is_empty());
    }

    #[test]
    fn nested_anchor_text_counted_once() {
        let page = analyze(
            r#"<html><head><title>t</title></head>
<body><p>before <a href="https://x.example">link text</a> after</p></body></html>"#,
        );
        assert_eq!(
            page.tokens,
            vec!["t", "before", "link", "text", "after"]
        );
        assert_eq!(page.edge_urls, vec!["https://x.example"]);
    }
}
