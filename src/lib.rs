//! Proxy Sweep - Proxy Scraper and Checker
//!
//! Discovers candidate proxies from configurable text sources, probes
//! which are actually reachable over their own protocol, classifies
//! working proxies by anonymity tier, attaches exit-node geolocation
//! and writes categorized output files.

pub mod proxy;
pub mod tui;

pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
