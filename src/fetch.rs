//! Content fetcher: bounded same-origin crawl with boilerplate stripping.
//!
//! Given an origin URL and a page/depth budget, [`crawl_site`] walks
//! same-origin links breadth-first and yields `(page URL, normalized text)`
//! pairs. HTML is converted to markdown-ish text (htmd) and cleaned of
//! boilerplate lines before chunking. Pages that fail to fetch are skipped
//! and recorded; the crawl only fails as a whole when zero pages succeed.
//!
//! The raw transport lives behind the [`TextFetcher`] capability trait so
//! tests and alternative providers can supply their own.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::config::CrawlConfig;
use crate::coordinator::CancelFlag;
use crate::error::EngineError;
use crate::models::Page;

/// Raw response from the text fetch capability.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// External text fetch capability: `fetch(url) -> (status, content-type, bytes)`.
///
/// Implementations return `Ok` with a non-success status for HTTP errors and
/// `Err` only for transport failures; the crawl treats both as a skipped page.
#[async_trait]
pub trait TextFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage>;
}

/// HTTP implementation of [`TextFetcher`] on a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &CrawlConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.page_timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TextFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage> {
        let response = self.client.get(url.as_str()).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedPage {
            status,
            content_type,
            bytes,
        })
    }
}

/// Result of a crawl: normalized pages plus the URLs that were skipped.
#[derive(Debug)]
pub struct CrawlOutcome {
    pub pages: Vec<Page>,
    pub skipped: Vec<String>,
}

/// Validate a training source URL before accepting it.
///
/// Scheme must be http/https and the host must be public; private and
/// loopback hosts are rejected to keep the crawler from reaching into the
/// local network.
pub fn validate_origin(raw: &str) -> Result<Url, EngineError> {
    let url = Url::parse(raw).map_err(|e| EngineError::InvalidSource {
        reason: format!("malformed URL: {}", e),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(EngineError::InvalidSource {
                reason: format!("unsupported scheme '{}'", other),
            })
        }
    }

    let host = url.host_str().ok_or_else(|| EngineError::InvalidSource {
        reason: "URL has no host".to_string(),
    })?;

    if is_private_host(host) {
        return Err(EngineError::InvalidSource {
            reason: format!("private or local host '{}'", host),
        });
    }

    Ok(url)
}

/// Check if a hostname is a private/local address.
fn is_private_host(host: &str) -> bool {
    let lower = host.to_lowercase();
    if lower == "localhost"
        || lower == "0.0.0.0"
        || lower.ends_with(".local")
        || lower.ends_with(".internal")
    {
        return true;
    }

    if let Ok(ip) = lower.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_unspecified()
                    || v4.is_broadcast()
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
    }

    false
}

/// Crawl one site breadth-first within the configured page/depth budget.
///
/// Cancellation is cooperative and checked between page fetches; a cancelled
/// crawl returns [`EngineError::Cancelled`] immediately. Returns
/// [`EngineError::FetchFailed`] only when no page yields usable text.
pub async fn crawl_site(
    fetcher: &dyn TextFetcher,
    config: &CrawlConfig,
    origin: &Url,
    cancel: &CancelFlag,
) -> Result<CrawlOutcome, EngineError> {
    let href_re = Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#)
        .expect("static regex");
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "footer", "header", "noscript"])
        .build();

    let mut start = origin.clone();
    start.set_fragment(None);

    let mut queue: VecDeque<(Url, usize)> = VecDeque::new();
    let mut visited: HashSet<String> = HashSet::new();
    queue.push_back((start.clone(), 0));
    visited.insert(start.to_string());

    let mut pages: Vec<Page> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();

    while let Some((url, depth)) = queue.pop_front() {
        if pages.len() >= config.max_pages {
            break;
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let fetched = match fetcher.fetch(&url).await {
            Ok(f) => f,
            Err(e) => {
                warn!(url = %url, error = %e, "page fetch failed, skipping");
                skipped.push(url.to_string());
                continue;
            }
        };

        if !(200..300).contains(&fetched.status) {
            warn!(url = %url, status = fetched.status, "non-success status, skipping");
            skipped.push(url.to_string());
            continue;
        }

        let is_html = fetched.content_type.contains("text/html")
            || fetched.content_type.contains("application/xhtml");
        let is_plain = fetched.content_type.contains("text/plain");
        if !is_html && !is_plain {
            debug!(url = %url, content_type = %fetched.content_type, "non-text resource, skipping");
            skipped.push(url.to_string());
            continue;
        }

        let body = String::from_utf8_lossy(&fetched.bytes).to_string();

        if is_html && depth < config.max_depth {
            for link in extract_links(&href_re, &body, &url) {
                if !same_origin(&link, origin) {
                    continue;
                }
                let key = link.to_string();
                if visited.insert(key) {
                    queue.push_back((link, depth + 1));
                }
            }
        }

        let text = if is_html {
            match converter.convert(&body) {
                Ok(md) => clean_content(&md),
                Err(e) => {
                    warn!(url = %url, error = %e, "HTML conversion failed, skipping");
                    skipped.push(url.to_string());
                    continue;
                }
            }
        } else {
            clean_content(&body)
        };

        if text.len() < config.min_page_chars {
            debug!(url = %url, chars = text.len(), "too little text after cleaning, skipping");
            skipped.push(url.to_string());
            continue;
        }

        pages.push(Page {
            url: url.to_string(),
            text,
        });
    }

    if pages.is_empty() {
        return Err(EngineError::FetchFailed {
            url: origin.to_string(),
        });
    }

    Ok(CrawlOutcome { pages, skipped })
}

/// Extract absolute same-document links from raw HTML.
///
/// Relative hrefs are resolved against the page URL; fragments are dropped
/// and obviously non-text resources are filtered by extension.
fn extract_links(href_re: &Regex, html: &str, base: &Url) -> Vec<Url> {
    const SKIP_EXT: &[&str] = &[
        ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico", ".css", ".js", ".pdf", ".zip",
        ".tar", ".gz", ".woff", ".woff2", ".mp4", ".mp3",
    ];

    let mut links = Vec::new();
    for cap in href_re.captures_iter(html) {
        let href = &cap[1];
        if href.starts_with("mailto:") || href.starts_with("javascript:") || href.starts_with('#') {
            continue;
        }
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        resolved.set_fragment(None);

        let path = resolved.path().to_lowercase();
        if SKIP_EXT.iter().any(|ext| path.ends_with(ext)) {
            continue;
        }
        links.push(resolved);
    }
    links
}

/// Two URLs share an origin when scheme, host, and port all match.
fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

/// Strip boilerplate from extracted page text.
///
/// Keeps lines with enough substance to carry meaning and re-joins them as
/// paragraphs. Link-only navigation rows and stray markup fragments rarely
/// survive the length filter.
pub fn clean_content(text: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| line.len() > 10)
        .collect();
    kept.join("\n\n")
}
