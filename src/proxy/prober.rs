//! Protocol probes: one candidate in, one outcome out
//!
//! A probe opens a raw TCP connection to the candidate, walks the
//! protocol-specific handshake (absolute-form GET for HTTP proxies,
//! CONNECT for SOCKS4/SOCKS5), then requests the identity-echo
//! endpoint through the proxy and captures what it saw.
//!
//! Every blocking step shares one deadline computed at probe start, so
//! a slow handshake cannot re-arm the budget for the response read.
//! Fault mapping follows a fixed taxonomy: in-protocol rejections and
//! refused connections are DEAD, deadline exhaustion is TIMED_OUT,
//! DNS/socket faults are ERROR.

use crate::proxy::models::{Candidate, IdentityEcho, ProbeOutcome, Protocol};
use crate::Result;
use anyhow::anyhow;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use url::Url;

/// Default identity-echo endpoint (reports caller IP and headers)
const DEFAULT_ECHO_URL: &str = "http://httpbin.org/get";

/// Default per-probe timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Upper bound on an echo response; anything larger is not an echo
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// User agent sent on probe requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Probe capability: one candidate, one timeout budget, one outcome.
///
/// The coordinator is generic over this seam so tests can drive it
/// with instrumented fakes.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self, candidate: Candidate) -> impl Future<Output = ProbeOutcome> + Send;
}

/// Internal probe fault, mapped onto the outcome taxonomy at the top
#[derive(Debug, Error)]
enum ProbeError {
    /// Proxy-reported or protocol-level failure -> DEAD
    #[error("{0}")]
    Rejected(String),
    /// Infrastructure fault -> ERROR
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Budget exhausted -> TIMED_OUT
    #[error("deadline exceeded")]
    Deadline,
}

/// The identity-echo endpoint, pre-parsed for raw-socket use.
///
/// Only plain `http` URLs are accepted: the prober tunnels raw HTTP
/// and does not speak TLS through unverified proxies.
#[derive(Debug, Clone)]
pub struct EchoEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl EchoEndpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| anyhow!("invalid echo URL {raw:?}: {e}"))?;
        if url.scheme() != "http" {
            return Err(anyhow!("echo endpoint must be a plain http URL, got {raw:?}"));
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("echo URL {raw:?} has no host"))?
            .to_string();
        let port = url.port().unwrap_or(80);
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path = format!("{path}?{query}");
        }
        Ok(Self { host, port, path })
    }

    /// The endpoint's host, if it is a literal IPv4 address
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.host.parse().ok()
    }

    fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// GET request in absolute form, as sent to an HTTP proxy
    fn absolute_request(&self, user_agent: &str) -> String {
        format!(
            "GET http://{}{} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: application/json\r\nConnection: close\r\n\r\n",
            self.host_header(),
            self.path,
            self.host_header(),
            user_agent
        )
    }

    /// GET request in origin form, as sent through a SOCKS tunnel
    fn origin_request(&self, user_agent: &str) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: application/json\r\nConnection: close\r\n\r\n",
            self.path,
            self.host_header(),
            user_agent
        )
    }
}

/// Configuration for the protocol prober
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Wall-clock budget for one whole probe
    pub timeout: Duration,
    /// Identity-echo endpoint probes are tunnelled to
    pub echo: EchoEndpoint,
    /// User agent for probe requests
    pub user_agent: String,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            echo: EchoEndpoint::parse(DEFAULT_ECHO_URL).expect("default echo endpoint is valid"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ProberConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_echo_url(mut self, url: &str) -> Result<Self> {
        self.echo = EchoEndpoint::parse(url)?;
        Ok(self)
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Prober dispatching on the candidate's protocol
#[derive(Debug, Clone)]
pub struct Prober {
    config: ProberConfig,
}

impl Prober {
    pub fn new() -> Self {
        Self::with_config(ProberConfig::default())
    }

    pub fn with_config(config: ProberConfig) -> Self {
        Self { config }
    }

    async fn probe_inner(
        &self,
        candidate: &Candidate,
        deadline: Instant,
    ) -> std::result::Result<IdentityEcho, ProbeError> {
        match candidate.protocol {
            Protocol::Http => self.probe_http(candidate, deadline).await,
            Protocol::Socks4 => self.probe_socks4(candidate, deadline).await,
            Protocol::Socks5 => self.probe_socks5(candidate, deadline).await,
        }
    }

    async fn probe_http(
        &self,
        candidate: &Candidate,
        deadline: Instant,
    ) -> std::result::Result<IdentityEcho, ProbeError> {
        let mut stream = connect(candidate, deadline).await?;
        let request = self.config.echo.absolute_request(&self.config.user_agent);
        step(deadline, stream.write_all(request.as_bytes())).await?;
        let raw = read_response(&mut stream, deadline).await?;
        parse_echo_response(&raw)
    }

    async fn probe_socks5(
        &self,
        candidate: &Candidate,
        deadline: Instant,
    ) -> std::result::Result<IdentityEcho, ProbeError> {
        let mut stream = connect(candidate, deadline).await?;

        // Greeting: version 5, one method, no authentication
        step(deadline, stream.write_all(&[0x05, 0x01, 0x00])).await?;
        let mut method = [0u8; 2];
        read_handshake(&mut stream, &mut method, deadline, "method negotiation").await?;
        socks5_check_method(method)?;

        let request = socks5_connect_request(&self.config.echo);
        step(deadline, stream.write_all(&request)).await?;
        let mut head = [0u8; 4];
        read_handshake(&mut stream, &mut head, deadline, "connect reply").await?;
        socks5_check_reply(head)?;

        // Consume the bound address trailing the reply
        let remaining = match head[3] {
            0x01 => 4 + 2,
            0x04 => 16 + 2,
            0x03 => {
                let mut len = [0u8; 1];
                read_handshake(&mut stream, &mut len, deadline, "connect reply").await?;
                len[0] as usize + 2
            }
            other => {
                return Err(ProbeError::Rejected(format!(
                    "invalid address type {other:#04x} in reply"
                )))
            }
        };
        let mut bound = vec![0u8; remaining];
        read_handshake(&mut stream, &mut bound, deadline, "connect reply").await?;

        self.fetch_echo_through_tunnel(&mut stream, deadline).await
    }

    async fn probe_socks4(
        &self,
        candidate: &Candidate,
        deadline: Instant,
    ) -> std::result::Result<IdentityEcho, ProbeError> {
        let mut stream = connect(candidate, deadline).await?;

        let request = socks4_connect_request(&self.config.echo);
        step(deadline, stream.write_all(&request)).await?;
        let mut reply = [0u8; 8];
        read_handshake(&mut stream, &mut reply, deadline, "connect reply").await?;
        socks4_check_reply(&reply)?;

        self.fetch_echo_through_tunnel(&mut stream, deadline).await
    }

    /// Request the echo endpoint through an established tunnel
    async fn fetch_echo_through_tunnel(
        &self,
        stream: &mut TcpStream,
        deadline: Instant,
    ) -> std::result::Result<IdentityEcho, ProbeError> {
        let request = self.config.echo.origin_request(&self.config.user_agent);
        step(deadline, stream.write_all(request.as_bytes())).await?;
        let raw = read_response(stream, deadline).await?;
        parse_echo_response(&raw)
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for Prober {
    async fn probe(&self, candidate: Candidate) -> ProbeOutcome {
        let deadline = Instant::now() + self.config.timeout;
        let started = std::time::Instant::now();

        match self.probe_inner(&candidate, deadline).await {
            Ok(echo) => ProbeOutcome::alive(candidate, started.elapsed(), echo),
            Err(ProbeError::Rejected(reason)) => ProbeOutcome::dead(candidate, reason),
            Err(ProbeError::Deadline) => ProbeOutcome::timed_out(candidate),
            Err(ProbeError::Io(e)) => ProbeOutcome::error(candidate, e.to_string()),
        }
    }
}

/// Run one blocking step against the shared deadline
async fn step<T, F>(deadline: Instant, fut: F) -> std::result::Result<T, ProbeError>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ProbeError::Io(e)),
        Err(_) => Err(ProbeError::Deadline),
    }
}

async fn connect(
    candidate: &Candidate,
    deadline: Instant,
) -> std::result::Result<TcpStream, ProbeError> {
    match timeout_at(
        deadline,
        TcpStream::connect((candidate.host.as_str(), candidate.port)),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            Err(ProbeError::Rejected("connection refused".to_string()))
        }
        Ok(Err(e)) => Err(ProbeError::Io(e)),
        Err(_) => Err(ProbeError::Deadline),
    }
}

/// Read an exact handshake chunk; an abrupt close mid-handshake is a
/// protocol violation, not an infrastructure fault
async fn read_handshake(
    stream: &mut TcpStream,
    buf: &mut [u8],
    deadline: Instant,
    what: &str,
) -> std::result::Result<(), ProbeError> {
    match timeout_at(deadline, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ProbeError::Rejected(
            format!("connection closed during {what}"),
        )),
        Ok(Err(e)) => Err(ProbeError::Io(e)),
        Err(_) => Err(ProbeError::Deadline),
    }
}

/// Read the echo response until the peer closes, bounded by the deadline
async fn read_response(
    stream: &mut TcpStream,
    deadline: Instant,
) -> std::result::Result<Vec<u8>, ProbeError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = step(deadline, stream.read(&mut chunk)).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_RESPONSE_BYTES {
            return Err(ProbeError::Rejected("echo response too large".to_string()));
        }
    }
    Ok(buf)
}

/// What the echo endpoint reports, in its JSON body
#[derive(Debug, Deserialize)]
struct EchoBody {
    origin: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// Parse a raw HTTP response from the echo endpoint into a capture
fn parse_echo_response(raw: &[u8]) -> std::result::Result<IdentityEcho, ProbeError> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| ProbeError::Rejected("malformed echo response".to_string()))?;

    let status_line = head.lines().next().unwrap_or("");
    if !status_line.starts_with("HTTP/") {
        return Err(ProbeError::Rejected("malformed echo response".to_string()));
    }
    let code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| ProbeError::Rejected("malformed echo response".to_string()))?;
    if !(200..300).contains(&code) {
        return Err(ProbeError::Rejected(format!("http status {code}")));
    }

    let echo: EchoBody = serde_json::from_str(body.trim())
        .map_err(|_| ProbeError::Rejected("malformed echo body".to_string()))?;

    let headers = echo
        .headers
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();
    Ok(IdentityEcho::new(echo.origin, headers))
}

fn socks5_check_method(reply: [u8; 2]) -> std::result::Result<(), ProbeError> {
    if reply[0] != 0x05 {
        return Err(ProbeError::Rejected("not a socks5 server".to_string()));
    }
    match reply[1] {
        0x00 => Ok(()),
        0xFF => Err(ProbeError::Rejected(
            "authentication required, none supplied".to_string(),
        )),
        other => Err(ProbeError::Rejected(format!(
            "unsupported auth method {other:#04x}"
        ))),
    }
}

fn socks5_check_reply(head: [u8; 4]) -> std::result::Result<(), ProbeError> {
    if head[0] != 0x05 {
        return Err(ProbeError::Rejected("invalid reply version".to_string()));
    }
    let reason = match head[1] {
        0x00 => return Ok(()),
        0x01 => "general server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused by destination",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    };
    Err(ProbeError::Rejected(format!("connect rejected: {reason}")))
}

fn socks4_check_reply(reply: &[u8; 8]) -> std::result::Result<(), ProbeError> {
    if reply[0] != 0x00 {
        return Err(ProbeError::Rejected("invalid reply version".to_string()));
    }
    let reason = match reply[1] {
        0x5A => return Ok(()),
        0x5B => "request rejected or failed",
        0x5C => "identd unreachable",
        0x5D => "identd credential mismatch",
        _ => "unknown reply code",
    };
    Err(ProbeError::Rejected(format!("connect rejected: {reason}")))
}

/// SOCKS5 CONNECT request for the echo endpoint (IPv4 or domain ATYP)
fn socks5_connect_request(echo: &EchoEndpoint) -> Vec<u8> {
    let mut req = vec![0x05, 0x01, 0x00];
    match echo.ipv4() {
        Some(ip) => {
            req.push(0x01);
            req.extend_from_slice(&ip.octets());
        }
        None => {
            req.push(0x03);
            req.push(echo.host.len() as u8);
            req.extend_from_slice(echo.host.as_bytes());
        }
    }
    req.extend_from_slice(&echo.port.to_be_bytes());
    req
}

/// SOCKS4 CONNECT request; domain hosts use the SOCKS4a extension
fn socks4_connect_request(echo: &EchoEndpoint) -> Vec<u8> {
    let mut req = vec![0x04, 0x01];
    req.extend_from_slice(&echo.port.to_be_bytes());
    match echo.ipv4() {
        Some(ip) => {
            req.extend_from_slice(&ip.octets());
            req.push(0x00);
        }
        None => {
            req.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
            req.push(0x00);
            req.extend_from_slice(echo.host.as_bytes());
            req.push(0x00);
        }
    }
    req
}
