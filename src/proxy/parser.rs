//! Candidate parsing for proxy list files

use crate::proxy::models::{Candidate, Protocol};
use crate::Result;
use std::fs;
use std::path::Path;

/// Parser for candidate lists in plain-text form
pub struct CandidateParser;

impl CandidateParser {
    /// Parse a single candidate line
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - scheme://IP:PORT (scheme overrides the default protocol)
    ///
    /// Blank lines and `#` comments yield `None`.
    pub fn parse_line(line: &str, default_protocol: Protocol) -> Option<Candidate> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (protocol, rest) = match line.split_once("://") {
            Some((scheme, rest)) => (Self::parse_scheme(scheme)?, rest),
            None => (default_protocol, line),
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = rest.split_once(':')?;
        let port: u16 = port.parse().ok()?;

        Some(Candidate::new(protocol, host, port))
    }

    /// Map a URL scheme to a protocol; `https` proxies are probed as HTTP
    fn parse_scheme(scheme: &str) -> Option<Protocol> {
        match scheme {
            "http" | "https" => Some(Protocol::Http),
            "socks4" => Some(Protocol::Socks4),
            "socks5" => Some(Protocol::Socks5),
            _ => None,
        }
    }

    /// Parse candidates from a string (multiple lines)
    pub fn parse_string(content: &str, default_protocol: Protocol) -> Vec<Candidate> {
        content
            .lines()
            .filter_map(|line| Self::parse_line(line, default_protocol))
            .collect()
    }

    /// Parse candidates from a file
    pub fn parse_file<P: AsRef<Path>>(path: P, default_protocol: Protocol) -> Result<Vec<Candidate>> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_string(&content, default_protocol))
    }

    /// Save candidates to a file, one HOST:PORT per line
    pub fn save_to_file<P: AsRef<Path>>(candidates: &[Candidate], path: P) -> Result<()> {
        let mut content: String = candidates
            .iter()
            .map(|c| c.addr())
            .collect::<Vec<_>>()
            .join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_format() {
        let candidate = CandidateParser::parse_line("192.168.1.1:8080", Protocol::Http).unwrap();
        assert_eq!(candidate.host, "192.168.1.1");
        assert_eq!(candidate.port, 8080);
        assert_eq!(candidate.protocol, Protocol::Http);
    }

    #[test]
    fn test_parse_url_format() {
        let candidate =
            CandidateParser::parse_line("socks5://192.168.1.1:1080", Protocol::Http).unwrap();
        assert_eq!(candidate.host, "192.168.1.1");
        assert_eq!(candidate.port, 1080);
        assert_eq!(candidate.protocol, Protocol::Socks5);
    }

    #[test]
    fn test_parse_https_scheme_maps_to_http() {
        let candidate =
            CandidateParser::parse_line("https://192.168.1.1:8080", Protocol::Socks4).unwrap();
        assert_eq!(candidate.protocol, Protocol::Http);
    }

    #[test]
    fn test_parse_trailing_slash() {
        let candidate =
            CandidateParser::parse_line("http://192.168.1.1:8080/", Protocol::Http).unwrap();
        assert_eq!(candidate.port, 8080);
    }

    #[test]
    fn test_parse_empty_and_comment_lines() {
        assert!(CandidateParser::parse_line("", Protocol::Http).is_none());
        assert!(CandidateParser::parse_line("   ", Protocol::Http).is_none());
        assert!(CandidateParser::parse_line("# comment", Protocol::Http).is_none());
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(CandidateParser::parse_line("invalid", Protocol::Http).is_none());
        assert!(CandidateParser::parse_line("192.168.1.1", Protocol::Http).is_none());
        assert!(CandidateParser::parse_line("192.168.1.1:abc", Protocol::Http).is_none());
        assert!(CandidateParser::parse_line("192.168.1.1:99999", Protocol::Http).is_none());
        assert!(CandidateParser::parse_line("ftp://192.168.1.1:21", Protocol::Http).is_none());
    }

    #[test]
    fn test_parse_string() {
        let content = r#"
192.168.1.1:8080
# comment
socks4://192.168.1.2:1080
"#;
        let candidates = CandidateParser::parse_string(content, Protocol::Http);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].protocol, Protocol::Socks4);
    }
}
