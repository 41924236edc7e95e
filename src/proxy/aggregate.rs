//! Merging probe outcomes into the four output buckets
//!
//! Buckets are pure projections of the live outcome set: `all` holds
//! every live proxy with its tier, `anonymous_only` filters out
//! transparent proxies, and the `_geo` variants carry the exit-node
//! location looked up exactly once per proxy. Output is sorted by
//! numeric address so the same outcome set always produces identical
//! bucket contents.

use crate::proxy::classifier::Classifier;
use crate::proxy::geo::GeoLookup;
use crate::proxy::models::{Candidate, ProbeOutcome, VerifiedProxy};

/// The four output partitions of the verified proxy set
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Buckets {
    /// Every live proxy, tier attached
    pub all: Vec<VerifiedProxy>,
    /// Live proxies whose tier hides the origin
    pub anonymous_only: Vec<VerifiedProxy>,
    /// `all` with geolocation attached; empty when enrichment is off
    pub all_geo: Vec<VerifiedProxy>,
    /// `anonymous_only` with geolocation attached
    pub anonymous_only_geo: Vec<VerifiedProxy>,
}

/// Sort key: numeric IPv4 octets then port, non-IP hosts last
fn sort_key(candidate: &Candidate) -> (u32, u16, String) {
    match candidate.ipv4() {
        Some(ip) => (u32::from(ip), candidate.port, String::new()),
        None => (u32::MAX, candidate.port, candidate.host.clone()),
    }
}

/// Build the buckets from a complete outcome set.
///
/// Classification and geolocation both work off data captured at probe
/// time; nothing touches the network here.
pub fn aggregate(
    outcomes: &[ProbeOutcome],
    classifier: &Classifier,
    geo: Option<&dyn GeoLookup>,
) -> Buckets {
    let mut live: Vec<&ProbeOutcome> = outcomes.iter().filter(|o| o.is_alive()).collect();
    live.sort_by_key(|o| sort_key(&o.candidate));

    let mut buckets = Buckets::default();
    for outcome in live {
        let Some(echo) = outcome.identity_echo.as_ref() else {
            continue;
        };
        let tier = classifier.classify(echo);
        let verified = VerifiedProxy {
            candidate: outcome.candidate.clone(),
            latency: outcome.latency.unwrap_or_default(),
            tier,
            geo: None,
        };

        buckets.all.push(verified.clone());
        if tier.hides_origin() {
            buckets.anonymous_only.push(verified.clone());
        }

        if let Some(geo) = geo {
            // One lookup per live proxy, shared by both geo buckets
            let record = geo.lookup(&outcome.candidate.host);
            let enriched = VerifiedProxy {
                geo: Some(record),
                ..verified
            };
            buckets.all_geo.push(enriched.clone());
            if tier.hides_origin() {
                buckets.anonymous_only_geo.push(enriched);
            }
        }
    }

    buckets
}
