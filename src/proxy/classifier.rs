//! Anonymity classification of live proxies
//!
//! A live probe captures what the identity-echo endpoint saw: the
//! apparent caller IP and the forwarded headers. Classification is a
//! pure function of that capture plus the real origin IP known to the
//! pipeline; nothing is re-fetched.

use crate::proxy::models::{AnonymityTier, IdentityEcho};
use std::net::Ipv4Addr;

/// Header names that declare proxy mediation or name the origin.
///
/// Proxy software varies in what it discloses, so the set is
/// configurable; this default covers the common via/forwarded family.
pub const DEFAULT_DISCLOSURE_MARKERS: &[&str] = &[
    "via",
    "forwarded",
    "forwarded-for",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-real-ip",
    "client-ip",
    "x-client-ip",
    "x-proxy-id",
    "proxy-connection",
];

/// Configuration for the anonymity classifier
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Header names (case-insensitive) treated as proxy-disclosure markers
    pub disclosure_markers: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            disclosure_markers: DEFAULT_DISCLOSURE_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

impl ClassifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_markers(mut self, markers: Vec<String>) -> Self {
        self.disclosure_markers = markers;
        self
    }

    pub fn with_marker(mut self, marker: &str) -> Self {
        self.disclosure_markers.push(marker.to_string());
        self
    }
}

/// Classifier assigning an anonymity tier to a live proxy's echo capture
#[derive(Debug, Clone)]
pub struct Classifier {
    real_ip: Ipv4Addr,
    markers: Vec<String>,
}

impl Classifier {
    /// Create a classifier with the default disclosure-marker set
    pub fn new(real_ip: Ipv4Addr) -> Self {
        Self::with_config(real_ip, ClassifierConfig::default())
    }

    pub fn with_config(real_ip: Ipv4Addr, config: ClassifierConfig) -> Self {
        Self {
            real_ip,
            markers: config
                .disclosure_markers
                .into_iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Assign a tier to an echo capture.
    ///
    /// Transparent when the origin IP is visible anywhere in the echo
    /// (as the apparent caller or inside a forwarded header value),
    /// anonymous when a disclosure-marker header is present, elite only
    /// when both checks are negative.
    pub fn classify(&self, echo: &IdentityEcho) -> AnonymityTier {
        let real = self.real_ip.to_string();

        // The echo service may report a chain ("client, proxy"); the
        // first entry is the apparent caller.
        let apparent = echo
            .apparent_ip
            .split(',')
            .next()
            .unwrap_or("")
            .trim();

        if apparent == real {
            return AnonymityTier::Transparent;
        }

        if echo.headers.values().any(|v| v.contains(&real)) {
            return AnonymityTier::Transparent;
        }

        let declares_proxy = echo
            .headers
            .keys()
            .any(|k| self.markers.iter().any(|m| m == &k.to_ascii_lowercase()));

        if declares_proxy {
            AnonymityTier::Anonymous
        } else {
            AnonymityTier::Elite
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const REAL_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

    fn echo(apparent: &str, headers: &[(&str, &str)]) -> IdentityEcho {
        IdentityEcho::new(
            apparent,
            headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn test_transparent_when_apparent_ip_is_origin() {
        let classifier = Classifier::new(REAL_IP);
        let echo = echo("203.0.113.7", &[("via", "1.1 squid")]);
        assert_eq!(classifier.classify(&echo), AnonymityTier::Transparent);
    }

    #[test]
    fn test_transparent_when_header_value_leaks_origin() {
        let classifier = Classifier::new(REAL_IP);
        let echo = echo("1.2.3.4", &[("x-forwarded-for", "203.0.113.7")]);
        assert_eq!(classifier.classify(&echo), AnonymityTier::Transparent);
    }

    #[test]
    fn test_anonymous_when_marker_present_without_leak() {
        let classifier = Classifier::new(REAL_IP);
        let echo = echo("1.2.3.4", &[("via", "1.1 proxy"), ("accept", "*/*")]);
        assert_eq!(classifier.classify(&echo), AnonymityTier::Anonymous);
    }

    #[test]
    fn test_elite_when_clean() {
        let classifier = Classifier::new(REAL_IP);
        let echo = echo("1.2.3.4", &[("accept", "*/*"), ("host", "example.com")]);
        assert_eq!(classifier.classify(&echo), AnonymityTier::Elite);
    }

    #[test]
    fn test_apparent_ip_chain_uses_first_entry() {
        let classifier = Classifier::new(REAL_IP);
        let echo = echo("203.0.113.7, 1.2.3.4", &[]);
        assert_eq!(classifier.classify(&echo), AnonymityTier::Transparent);
    }

    #[test]
    fn test_marker_matching_is_case_insensitive() {
        let classifier = Classifier::new(REAL_IP);
        let mut headers = BTreeMap::new();
        headers.insert("X-Forwarded-For".to_string(), "10.0.0.1".to_string());
        let echo = IdentityEcho::new("1.2.3.4", headers);
        assert_eq!(classifier.classify(&echo), AnonymityTier::Anonymous);
    }

    #[test]
    fn test_custom_marker_set() {
        let config = ClassifierConfig::new().with_markers(vec!["x-custom-proxy".to_string()]);
        let classifier = Classifier::with_config(REAL_IP, config);

        let declared = echo("1.2.3.4", &[("x-custom-proxy", "yes")]);
        assert_eq!(classifier.classify(&declared), AnonymityTier::Anonymous);

        // `via` is not in the custom set, so this capture looks clean
        let clean = echo("1.2.3.4", &[("via", "1.1 proxy")]);
        assert_eq!(classifier.classify(&clean), AnonymityTier::Elite);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = Classifier::new(REAL_IP);
        let capture = echo("1.2.3.4", &[("via", "1.1 proxy")]);
        let first = classifier.classify(&capture);
        for _ in 0..10 {
            assert_eq!(classifier.classify(&capture), first);
        }
    }
}
