//! Source acquisition: fetching proxy lists and extracting candidates
//!
//! Each source is a URL serving text (or HTML) that contains `ip:port`
//! entries. Sources are fetched concurrently; a failing source is
//! reported and skipped, never fatal. Extracted candidates are
//! deduplicated across all sources of a protocol.

use crate::proxy::models::{Candidate, Protocol};
use crate::proxy::parser::CandidateParser;
use crate::Result;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::warn;

/// Default timeout for source fetches in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// How many sources are fetched at once
const FETCH_CONCURRENCY: usize = 8;

/// Default user agent for source fetches
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Regex pattern to match IP:PORT entries embedded in arbitrary text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b").expect("Invalid IP:PORT regex")
});

/// A proxy-list source URL for one protocol
#[derive(Debug, Clone)]
pub struct ProxySource {
    pub name: String,
    pub url: String,
    pub protocol: Protocol,
}

impl ProxySource {
    pub fn new(name: &str, url: &str, protocol: Protocol) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            protocol,
        }
    }
}

/// Result of scraping a single source
#[derive(Debug, Clone)]
pub struct ScrapeResult {
    /// The source URL that was fetched
    pub source: String,
    /// Candidates extracted from the source
    pub candidates: Vec<Candidate>,
    /// Error message if the fetch failed
    pub error: Option<String>,
}

impl ScrapeResult {
    pub fn success(source: String, candidates: Vec<Candidate>) -> Self {
        Self {
            source,
            candidates,
            error: None,
        }
    }

    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            candidates: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Configuration for the scraper
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Timeout for each source fetch
    pub timeout: Duration,
    /// User agent for source fetches
    pub user_agent: String,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ScraperConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Scraper fetching proxy-list sources and extracting candidates
pub struct Scraper {
    client: Client,
}

impl Scraper {
    pub fn new() -> Result<Self> {
        Self::with_config(ScraperConfig::default())
    }

    pub fn with_config(config: ScraperConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { client })
    }

    /// Fetch one source and extract its candidates
    pub async fn fetch_source(&self, source: &ProxySource) -> ScrapeResult {
        let response = match self.client.get(&source.url).send().await {
            Ok(r) => r,
            Err(e) => return ScrapeResult::failure(source.url.clone(), e.to_string()),
        };

        if !response.status().is_success() {
            return ScrapeResult::failure(
                source.url.clone(),
                format!("status code: {}", response.status()),
            );
        }

        match response.text().await {
            Ok(content) => ScrapeResult::success(
                source.url.clone(),
                self.extract_candidates(&content, source.protocol),
            ),
            Err(e) => ScrapeResult::failure(source.url.clone(), e.to_string()),
        }
    }

    /// Fetch all sources concurrently, reporting per-source results
    pub async fn fetch_all(&self, sources: &[ProxySource]) -> Vec<ScrapeResult> {
        let results: Vec<ScrapeResult> = stream::iter(sources)
            .map(|source| self.fetch_source(source))
            .buffer_unordered(FETCH_CONCURRENCY)
            .collect()
            .await;

        for result in &results {
            if let Some(error) = &result.error {
                warn!(source = %result.source, %error, "source fetch failed");
            }
        }

        results
    }

    /// Extract candidates from raw source content
    ///
    /// Tries line-by-line parsing first (handles scheme prefixes), then
    /// falls back to regex extraction for HTML-ish content.
    pub fn extract_candidates(&self, content: &str, protocol: Protocol) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = content
            .lines()
            .filter_map(|line| CandidateParser::parse_line(line, protocol))
            .filter(Candidate::is_well_formed)
            .collect();

        if candidates.is_empty() {
            candidates = Self::extract_with_regex(content, protocol);
        }

        candidates.sort();
        candidates.dedup();
        candidates
    }

    /// Regex-based IP:PORT extraction from noisy content
    fn extract_with_regex(content: &str, protocol: Protocol) -> Vec<Candidate> {
        IP_PORT_REGEX
            .captures_iter(content)
            .filter_map(|cap| {
                let host = cap.get(1)?.as_str();
                let port: u16 = cap.get(2)?.as_str().parse().ok()?;
                let candidate = Candidate::new(protocol, host, port);
                candidate.is_well_formed().then_some(candidate)
            })
            .collect()
    }

    /// Merge scrape results into one deduplicated candidate set
    pub fn collect_candidates(results: &[ScrapeResult]) -> Vec<Candidate> {
        let set: BTreeSet<Candidate> = results
            .iter()
            .flat_map(|r| r.candidates.iter().cloned())
            .collect();
        set.into_iter().collect()
    }

    /// Built-in free proxy-list sources per protocol
    pub fn default_sources(protocol: Protocol) -> Vec<ProxySource> {
        match protocol {
            Protocol::Http => vec![
                ProxySource::new(
                    "proxyscrape",
                    "https://api.proxyscrape.com/v2/?request=getproxies&protocol=http&timeout=10000&country=all",
                    Protocol::Http,
                ),
                ProxySource::new(
                    "proxy-list-http",
                    "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt",
                    Protocol::Http,
                ),
                ProxySource::new(
                    "shiftytr-http",
                    "https://raw.githubusercontent.com/ShiftyTR/Proxy-List/master/http.txt",
                    Protocol::Http,
                ),
            ],
            Protocol::Socks4 => vec![
                ProxySource::new(
                    "proxyscrape-socks4",
                    "https://api.proxyscrape.com/v2/?request=getproxies&protocol=socks4&timeout=10000&country=all",
                    Protocol::Socks4,
                ),
                ProxySource::new(
                    "proxy-list-socks4",
                    "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/socks4.txt",
                    Protocol::Socks4,
                ),
            ],
            Protocol::Socks5 => vec![
                ProxySource::new(
                    "proxyscrape-socks5",
                    "https://api.proxyscrape.com/v2/?request=getproxies&protocol=socks5&timeout=10000&country=all",
                    Protocol::Socks5,
                ),
                ProxySource::new(
                    "hookzof-socks5",
                    "https://raw.githubusercontent.com/hookzof/socks5_list/master/proxy.txt",
                    Protocol::Socks5,
                ),
            ],
        }
    }
}
