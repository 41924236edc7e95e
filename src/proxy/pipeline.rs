//! End-to-end orchestration of the verification pipeline
//!
//! Wires the stages together for one run: scrape sources into a
//! candidate set, drop malformed candidates, discover the real origin
//! IP, probe everything under the concurrency cap, aggregate into
//! buckets and hand them to the sink.

use crate::proxy::aggregate::{aggregate, Buckets};
use crate::proxy::classifier::{Classifier, ClassifierConfig};
use crate::proxy::geo::{GeoLocator, GeoLookup};
use crate::proxy::models::{Candidate, ProbeOutcome, Protocol};
use crate::proxy::pool::{PoolConfig, ProbePool};
use crate::proxy::prober::{Prober, ProberConfig};
use crate::proxy::scraper::{ProxySource, Scraper, ScraperConfig};
use crate::proxy::sink::OutputSink;
use crate::Result;
use anyhow::{anyhow, Context};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default per-probe timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default cap on simultaneous probes
const DEFAULT_MAX_IN_FLIGHT: usize = 512;

/// Default identity-echo endpoint
const DEFAULT_ECHO_URL: &str = "http://httpbin.org/get";

/// Configuration values consumed by the pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Protocols to scrape and check
    pub protocols: Vec<Protocol>,
    /// Per-probe wall-clock budget
    pub timeout: Duration,
    /// Hard cap on simultaneous in-flight probes
    pub max_in_flight: usize,
    /// Identity-echo endpoint URL (plain http)
    pub echo_url: String,
    /// Real origin IP; discovered via the echo endpoint when absent
    pub real_ip: Option<Ipv4Addr>,
    /// GeoLite2-City database; geolocation is enabled iff present
    pub mmdb_path: Option<PathBuf>,
    /// Whether anonymity filtering (the anonymous buckets) is enabled
    pub anonymity: bool,
    /// Base directory for the output trees
    pub output_dir: PathBuf,
    /// Source URLs; built-in defaults for each protocol when empty
    pub sources: Vec<ProxySource>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            protocols: Protocol::ALL.to_vec(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            echo_url: DEFAULT_ECHO_URL.to_string(),
            real_ip: None,
            mmdb_path: None,
            anonymity: true,
            output_dir: PathBuf::from("."),
            sources: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_echo_url(mut self, url: String) -> Self {
        self.echo_url = url;
        self
    }

    pub fn with_real_ip(mut self, real_ip: Ipv4Addr) -> Self {
        self.real_ip = Some(real_ip);
        self
    }

    pub fn with_mmdb_path(mut self, path: PathBuf) -> Self {
        self.mmdb_path = Some(path);
        self
    }

    pub fn with_anonymity(mut self, anonymity: bool) -> Self {
        self.anonymity = anonymity;
        self
    }

    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = dir;
        self
    }

    pub fn with_sources(mut self, sources: Vec<ProxySource>) -> Self {
        self.sources = sources;
        self
    }
}

/// Per-protocol and per-bucket counts for the end-of-run report
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// (protocol, working, total probed)
    pub per_protocol: Vec<(Protocol, usize, usize)>,
    pub all: usize,
    pub anonymous_only: usize,
    pub all_geo: usize,
    pub anonymous_only_geo: usize,
}

impl RunSummary {
    pub fn new(outcomes: &[ProbeOutcome], buckets: &Buckets) -> Self {
        let mut per_protocol = Vec::new();
        for protocol in Protocol::ALL {
            let total = outcomes
                .iter()
                .filter(|o| o.candidate.protocol == protocol)
                .count();
            if total == 0 {
                continue;
            }
            let working = outcomes
                .iter()
                .filter(|o| o.candidate.protocol == protocol && o.is_alive())
                .count();
            per_protocol.push((protocol, working, total));
        }
        Self {
            per_protocol,
            all: buckets.all.len(),
            anonymous_only: buckets.anonymous_only.len(),
            all_geo: buckets.all_geo.len(),
            anonymous_only_geo: buckets.anonymous_only_geo.len(),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Protocol   Working   Total")?;
        for (protocol, working, total) in &self.per_protocol {
            let percentage = if *total > 0 {
                *working as f64 / *total as f64 * 100.0
            } else {
                0.0
            };
            writeln!(
                f,
                "{:<10} {:<9} {}",
                protocol.to_string(),
                format!("{working} ({percentage:.1}%)"),
                total
            )?;
        }
        write!(
            f,
            "Buckets: all={} anonymous={} geo={} geo_anonymous={}",
            self.all, self.anonymous_only, self.all_geo, self.anonymous_only_geo
        )
    }
}

/// One run of the whole scrape-check-save pipeline
pub struct Pipeline {
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Token cancelling the probing stage (ctrl-c, TUI quit)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fetch every configured source and build the candidate set
    pub async fn scrape(&self) -> Result<Vec<Candidate>> {
        let sources = if self.config.sources.is_empty() {
            self.config
                .protocols
                .iter()
                .flat_map(|p| Scraper::default_sources(*p))
                .collect()
        } else {
            self.config.sources.clone()
        };

        let scraper = Scraper::with_config(ScraperConfig::default())?;
        let results = scraper.fetch_all(&sources).await;

        let ok = results.iter().filter(|r| r.is_success()).count();
        info!(sources = sources.len(), ok, "sources fetched");

        let candidates = Scraper::collect_candidates(&results);
        Ok(candidates
            .into_iter()
            .filter(|c| self.config.protocols.contains(&c.protocol))
            .collect())
    }

    /// Drop malformed candidates before they reach the pool
    pub fn validate(candidates: Vec<Candidate>) -> Vec<Candidate> {
        let (well_formed, malformed): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(Candidate::is_well_formed);
        for candidate in &malformed {
            warn!(%candidate, "dropping malformed candidate");
        }
        well_formed
    }

    /// The real origin IP: configured, or discovered with one direct
    /// (unproxied) request to the echo endpoint
    pub async fn discover_real_ip(&self) -> Result<Ipv4Addr> {
        if let Some(real_ip) = self.config.real_ip {
            return Ok(real_ip);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        let body = client
            .get(&self.config.echo_url)
            .send()
            .await
            .context("real-IP discovery request failed")?
            .text()
            .await
            .context("real-IP discovery response unreadable")?;

        parse_real_ip(&body)
            .ok_or_else(|| anyhow!("echo endpoint did not report a usable origin IP"))
    }

    /// Probe the candidate set, streaming completions to `events`
    pub async fn check(
        &self,
        candidates: Vec<Candidate>,
        events: Option<mpsc::UnboundedSender<ProbeOutcome>>,
    ) -> Result<Vec<ProbeOutcome>> {
        let prober_config = ProberConfig::new()
            .with_timeout(self.config.timeout)
            .with_echo_url(&self.config.echo_url)?;
        let prober = Prober::with_config(prober_config);

        let mut pool = ProbePool::with_config(
            prober,
            PoolConfig::new().with_max_in_flight(self.config.max_in_flight),
        )
        .with_cancellation(self.cancel.clone());
        if let Some(events) = events {
            pool = pool.with_events(events);
        }

        Ok(pool.run(candidates).await)
    }

    /// Classify, enrich and bucket a complete outcome set
    pub fn aggregate(&self, outcomes: &[ProbeOutcome], real_ip: Ipv4Addr) -> Result<Buckets> {
        let classifier = Classifier::with_config(real_ip, ClassifierConfig::default());
        let locator = match &self.config.mmdb_path {
            Some(path) => Some(
                GeoLocator::from_path(path)
                    .with_context(|| format!("opening geolocation database {}", path.display()))?,
            ),
            None => None,
        };
        Ok(aggregate(
            outcomes,
            &classifier,
            locator.as_ref().map(|l| l as &dyn GeoLookup),
        ))
    }

    /// Write the buckets through the output sink
    pub fn write(&self, buckets: &Buckets) -> Result<()> {
        let sink = OutputSink::new(
            &self.config.output_dir,
            self.config.mmdb_path.is_some(),
            self.config.anonymity,
        );
        sink.write(buckets)
    }
}

/// Extract an IPv4 origin from an echo response body.
///
/// Understands both the JSON echo format (`{"origin": "1.2.3.4"}`) and
/// bare checkip-style bodies.
fn parse_real_ip(body: &str) -> Option<Ipv4Addr> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(origin) = value.get("origin").and_then(|o| o.as_str()) {
            return origin.split(',').next()?.trim().parse().ok();
        }
    }
    body.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::ProbeStatus;
    use std::fs;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const REAL_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

    #[test]
    fn test_parse_real_ip_formats() {
        assert_eq!(
            parse_real_ip("{\"origin\": \"203.0.113.7\"}"),
            Some(REAL_IP)
        );
        assert_eq!(
            parse_real_ip("{\"origin\": \"203.0.113.7, 10.0.0.1\"}"),
            Some(REAL_IP)
        );
        assert_eq!(parse_real_ip("203.0.113.7\n"), Some(REAL_IP));
        assert_eq!(parse_real_ip("not an ip"), None);
    }

    #[test]
    fn test_validate_drops_malformed() {
        let candidates = vec![
            Candidate::new(Protocol::Http, "1.2.3.4", 8080),
            Candidate::new(Protocol::Http, "evil.example.com", 8080),
            Candidate::new(Protocol::Socks5, "5.6.7.8", 0),
        ];
        let valid = Pipeline::validate(candidates);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].host, "1.2.3.4");
    }

    async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        buf
    }

    async fn respond_with_echo(stream: &mut TcpStream, origin: &str, headers: &str) {
        let body = format!("{{\"origin\": \"{origin}\", \"headers\": {{{headers}}}}}");
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    /// Fake HTTP proxy: accepts one connection and echoes a fixed capture
    async fn spawn_http_proxy(origin: &'static str, headers: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await;
            respond_with_echo(&mut stream, origin, headers).await;
        });
        port
    }

    /// Fake SOCKS5 server that rejects every client (auth required)
    async fn spawn_socks5_auth_wall() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0xFF]).await.unwrap();
            stream.shutdown().await.unwrap();
        });
        port
    }

    fn test_pipeline(output_dir: PathBuf) -> Pipeline {
        let config = PipelineConfig::new()
            .with_timeout(Duration::from_secs(2))
            .with_max_in_flight(8)
            .with_echo_url("http://10.0.0.1:8080/get".to_string())
            .with_real_ip(REAL_IP)
            .with_output_dir(output_dir);
        Pipeline::new(config)
    }

    #[tokio::test]
    async fn test_end_to_end_check_aggregate_write() {
        // One anonymous proxy, one transparent proxy, one dead SOCKS5
        let anonymous_port = spawn_http_proxy("9.9.9.9", "\"Via\": \"1.1 proxy\"").await;
        let transparent_port = spawn_http_proxy("203.0.113.7", "").await;
        let socks_port = spawn_socks5_auth_wall().await;

        let base = std::env::temp_dir().join(format!(
            "proxy-sweep-pipeline-{}-e2e",
            std::process::id()
        ));
        let pipeline = test_pipeline(base.clone());

        let candidates = vec![
            Candidate::new(Protocol::Http, "127.0.0.1", anonymous_port),
            Candidate::new(Protocol::Http, "127.0.0.1", transparent_port),
            Candidate::new(Protocol::Socks5, "127.0.0.1", socks_port),
        ];

        let outcomes = pipeline.check(candidates.clone(), None).await.unwrap();
        assert_eq!(outcomes.len(), candidates.len());

        let socks_outcome = outcomes
            .iter()
            .find(|o| o.candidate.protocol == Protocol::Socks5)
            .unwrap();
        assert!(matches!(socks_outcome.status, ProbeStatus::Dead(_)));

        let real_ip = pipeline.discover_real_ip().await.unwrap();
        assert_eq!(real_ip, REAL_IP);

        let buckets = pipeline.aggregate(&outcomes, real_ip).unwrap();
        assert_eq!(buckets.all.len(), 2);
        assert_eq!(buckets.anonymous_only.len(), 1);
        assert_eq!(
            buckets.anonymous_only[0].candidate.port, anonymous_port,
            "only the via-declaring proxy is anonymous"
        );

        pipeline.write(&buckets).unwrap();
        let written = fs::read_to_string(base.join("proxies/http.txt")).unwrap();
        assert_eq!(written.lines().count(), 2);
        let anonymous = fs::read_to_string(base.join("proxies_anonymous/http.txt")).unwrap();
        assert_eq!(anonymous.trim(), format!("127.0.0.1:{anonymous_port}"));

        fs::remove_dir_all(&base).unwrap();
    }

    #[tokio::test]
    async fn test_discover_real_ip_from_local_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await;
            respond_with_echo(&mut stream, "203.0.113.7", "").await;
        });

        let config = PipelineConfig::new()
            .with_echo_url(format!("http://127.0.0.1:{port}/get"));
        let pipeline = Pipeline::new(config);
        assert_eq!(pipeline.discover_real_ip().await.unwrap(), REAL_IP);
    }

    #[tokio::test]
    async fn test_run_summary_counts() {
        let outcomes = vec![
            ProbeOutcome::dead(Candidate::new(Protocol::Http, "1.1.1.1", 80), "refused"),
            ProbeOutcome::timed_out(Candidate::new(Protocol::Socks4, "2.2.2.2", 1080)),
        ];
        let summary = RunSummary::new(&outcomes, &Buckets::default());
        assert_eq!(summary.per_protocol.len(), 2);
        assert_eq!(summary.per_protocol[0], (Protocol::Http, 0, 1));
        assert_eq!(summary.all, 0);
        let rendered = summary.to_string();
        assert!(rendered.contains("http"));
        assert!(rendered.contains("Buckets:"));
    }
}
