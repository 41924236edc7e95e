//! Core data model for the verification pipeline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Placeholder rendered for geolocation fields missing from the database
pub const UNKNOWN_FIELD: &str = "Unknown";

/// Proxy protocol enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Protocol {
    #[default]
    Http,
    Socks4,
    Socks5,
}

impl Protocol {
    /// All supported protocols, in output order
    pub const ALL: [Protocol; 3] = [Protocol::Http, Protocol::Socks4, Protocol::Socks5];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An unverified `(protocol, host, port)` triple to probe
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl Candidate {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
        }
    }

    /// Get the candidate address in HOST:PORT format
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The candidate's host as an IPv4 address, if it is one
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.host.parse().ok()
    }

    /// A well-formed candidate has an IPv4 host and a non-zero port
    pub fn is_well_formed(&self) -> bool {
        self.port != 0 && self.ipv4().is_some()
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// What the identity-echo endpoint observed about a request forwarded
/// through a proxy: the apparent caller IP and the received headers.
///
/// Header names are stored lowercased so classification is
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityEcho {
    pub apparent_ip: String,
    pub headers: BTreeMap<String, String>,
}

impl IdentityEcho {
    pub fn new(apparent_ip: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self {
            apparent_ip: apparent_ip.into(),
            headers,
        }
    }
}

/// Terminal status of a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeStatus {
    /// Proxy completed the protocol exchange and returned a valid echo
    Alive,
    /// Reachable but failed the protocol contract (rejected handshake,
    /// bad status, malformed response)
    Dead(String),
    /// No response within the configured budget
    TimedOut,
    /// Infrastructure-level fault (DNS, socket error, panic, shutdown)
    Error(String),
}

/// Result of probing one candidate; exactly one exists per candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub candidate: Candidate,
    pub status: ProbeStatus,
    pub latency: Option<Duration>,
    pub identity_echo: Option<IdentityEcho>,
}

impl ProbeOutcome {
    pub fn alive(candidate: Candidate, latency: Duration, echo: IdentityEcho) -> Self {
        Self {
            candidate,
            status: ProbeStatus::Alive,
            latency: Some(latency),
            identity_echo: Some(echo),
        }
    }

    pub fn dead(candidate: Candidate, reason: impl Into<String>) -> Self {
        Self {
            candidate,
            status: ProbeStatus::Dead(reason.into()),
            latency: None,
            identity_echo: None,
        }
    }

    pub fn timed_out(candidate: Candidate) -> Self {
        Self {
            candidate,
            status: ProbeStatus::TimedOut,
            latency: None,
            identity_echo: None,
        }
    }

    pub fn error(candidate: Candidate, reason: impl Into<String>) -> Self {
        Self {
            candidate,
            status: ProbeStatus::Error(reason.into()),
            latency: None,
            identity_echo: None,
        }
    }

    /// Outcome for a probe abandoned because of a shutdown request
    pub fn interrupted(candidate: Candidate) -> Self {
        Self::error(candidate, "interrupted by shutdown")
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.status, ProbeStatus::Alive)
    }
}

/// How much a live proxy discloses about the original client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnonymityTier {
    /// Leaks the origin IP and declares proxy use
    Transparent,
    /// Hides the origin IP but declares proxy use
    Anonymous,
    /// Hides both
    Elite,
}

impl AnonymityTier {
    /// Anonymous and elite proxies qualify for the anonymous buckets
    pub fn hides_origin(&self) -> bool {
        !matches!(self, AnonymityTier::Transparent)
    }
}

impl fmt::Display for AnonymityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnonymityTier::Transparent => "transparent",
            AnonymityTier::Anonymous => "anonymous",
            AnonymityTier::Elite => "elite",
        };
        write!(f, "{}", s)
    }
}

/// Exit-node geolocation for a proxy host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoRecord {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

impl GeoRecord {
    /// Record for a host the database knows nothing about
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.country.is_none() && self.region.is_none() && self.city.is_none()
    }
}

impl fmt::Display for GeoRecord {
    /// Renders as `Country::Region::City` with `Unknown` placeholders
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = |v: &Option<String>| v.clone().unwrap_or_else(|| UNKNOWN_FIELD.to_string());
        write!(
            f,
            "{}::{}::{}",
            field(&self.country),
            field(&self.region),
            field(&self.city)
        )
    }
}

/// Terminal record for a proxy that passed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedProxy {
    pub candidate: Candidate,
    pub latency: Duration,
    pub tier: AnonymityTier,
    pub geo: Option<GeoRecord>,
}

impl VerifiedProxy {
    /// Output line in HOST:PORT format
    pub fn render_plain(&self) -> String {
        self.candidate.addr()
    }

    /// Output line in HOST:PORT::Country::Region::City format
    pub fn render_geo(&self) -> String {
        let geo = self.geo.clone().unwrap_or_else(GeoRecord::unknown);
        format!("{}::{}", self.candidate.addr(), geo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Http.to_string(), "http");
        assert_eq!(Protocol::Socks4.to_string(), "socks4");
        assert_eq!(Protocol::Socks5.to_string(), "socks5");
    }

    #[test]
    fn test_candidate_addr() {
        let candidate = Candidate::new(Protocol::Http, "1.2.3.4", 8080);
        assert_eq!(candidate.addr(), "1.2.3.4:8080");
        assert_eq!(candidate.to_string(), "http://1.2.3.4:8080");
    }

    #[test]
    fn test_candidate_well_formed() {
        assert!(Candidate::new(Protocol::Http, "1.2.3.4", 8080).is_well_formed());
        assert!(!Candidate::new(Protocol::Http, "1.2.3.4", 0).is_well_formed());
        assert!(!Candidate::new(Protocol::Http, "proxy.example.com", 8080).is_well_formed());
        assert!(!Candidate::new(Protocol::Http, "999.1.1.1", 8080).is_well_formed());
    }

    #[test]
    fn test_outcome_constructors() {
        let candidate = Candidate::new(Protocol::Socks5, "5.6.7.8", 1080);

        let echo = IdentityEcho::new("9.9.9.9", BTreeMap::new());
        let alive = ProbeOutcome::alive(candidate.clone(), Duration::from_millis(120), echo);
        assert!(alive.is_alive());
        assert!(alive.identity_echo.is_some());
        assert_eq!(alive.latency, Some(Duration::from_millis(120)));

        let dead = ProbeOutcome::dead(candidate.clone(), "handshake rejected");
        assert!(!dead.is_alive());
        assert!(dead.identity_echo.is_none());
        assert!(dead.latency.is_none());

        let timed_out = ProbeOutcome::timed_out(candidate.clone());
        assert_eq!(timed_out.status, ProbeStatus::TimedOut);

        let interrupted = ProbeOutcome::interrupted(candidate);
        assert!(matches!(interrupted.status, ProbeStatus::Error(_)));
    }

    #[test]
    fn test_tier_hides_origin() {
        assert!(!AnonymityTier::Transparent.hides_origin());
        assert!(AnonymityTier::Anonymous.hides_origin());
        assert!(AnonymityTier::Elite.hides_origin());
    }

    #[test]
    fn test_geo_record_display() {
        let geo = GeoRecord {
            country: Some("US".to_string()),
            region: Some("California".to_string()),
            city: Some("Mountain View".to_string()),
        };
        assert_eq!(geo.to_string(), "US::California::Mountain View");

        let unknown = GeoRecord::unknown();
        assert!(unknown.is_unknown());
        assert_eq!(unknown.to_string(), "Unknown::Unknown::Unknown");
    }

    #[test]
    fn test_verified_proxy_rendering() {
        let proxy = VerifiedProxy {
            candidate: Candidate::new(Protocol::Http, "1.2.3.4", 8080),
            latency: Duration::from_millis(80),
            tier: AnonymityTier::Elite,
            geo: Some(GeoRecord {
                country: Some("US".to_string()),
                region: Some("California".to_string()),
                city: Some("Mountain View".to_string()),
            }),
        };
        assert_eq!(proxy.render_plain(), "1.2.3.4:8080");
        assert_eq!(proxy.render_geo(), "1.2.3.4:8080::US::California::Mountain View");

        let no_geo = VerifiedProxy { geo: None, ..proxy };
        assert_eq!(no_geo.render_geo(), "1.2.3.4:8080::Unknown::Unknown::Unknown");
    }
}
