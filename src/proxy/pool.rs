//! Bounded concurrent probe dispatch
//!
//! Admits candidates greedily under a fixed in-flight cap and collects
//! exactly one outcome per candidate. Each probe runs in its own task:
//! a panicking probe resolves to an ERROR outcome for its candidate
//! and never disturbs the rest of the pool. Cancellation is
//! cooperative: once the token fires, in-flight probes are abandoned
//! and every unresolved candidate yields an ERROR outcome, so the
//! returned set is still complete.

use crate::proxy::models::{Candidate, ProbeOutcome};
use crate::proxy::prober::Probe;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Default number of simultaneous in-flight probes
const DEFAULT_MAX_IN_FLIGHT: usize = 100;

/// Configuration for the probe pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on simultaneous in-flight probes (open sockets)
    pub max_in_flight: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }
}

/// Pool running probes for a whole candidate set under a concurrency cap
pub struct ProbePool<P> {
    prober: Arc<P>,
    max_in_flight: usize,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<ProbeOutcome>>,
}

impl<P: Probe> ProbePool<P> {
    pub fn new(prober: P) -> Self {
        Self::with_config(prober, PoolConfig::default())
    }

    pub fn with_config(prober: P, config: PoolConfig) -> Self {
        Self {
            prober: Arc::new(prober),
            max_in_flight: config.max_in_flight.max(1),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Token that cancels this pool's probes when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Subscribe to per-completion outcome events (progress reporting).
    ///
    /// Completions from all probes funnel through this single channel;
    /// the receiver sees them in completion order and the channel
    /// closes when the run finishes.
    pub fn outcome_stream(&mut self) -> mpsc::UnboundedReceiver<ProbeOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Send per-completion events to an existing channel instead
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ProbeOutcome>) -> Self {
        self.events = Some(events);
        self
    }

    /// Probe every candidate, returning one outcome per candidate.
    ///
    /// Returns only after all candidates have resolved; admission order
    /// is unspecified and completion order is whatever the network
    /// gives us.
    pub async fn run(&self, candidates: Vec<Candidate>) -> Vec<ProbeOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));

        let results = stream::iter(candidates)
            .map(|candidate| {
                let semaphore = Arc::clone(&semaphore);
                let prober = Arc::clone(&self.prober);
                let cancel = self.cancel.clone();
                let events = self.events.clone();
                async move {
                    // Only fails if the semaphore is closed, which cannot
                    // happen while we hold the Arc
                    let permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("semaphore closed unexpectedly");

                    let fallback = candidate.clone();
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        let abandoned = candidate.clone();
                        tokio::select! {
                            _ = cancel.cancelled() => ProbeOutcome::interrupted(abandoned),
                            outcome = prober.probe(candidate) => outcome,
                        }
                    });

                    let outcome = match handle.await {
                        Ok(outcome) => outcome,
                        Err(_) => ProbeOutcome::error(fallback, "probe task panicked"),
                    };

                    if let Some(events) = events {
                        let _ = events.send(outcome.clone());
                    }
                    outcome
                }
            })
            .buffer_unordered(self.max_in_flight)
            .collect::<Vec<_>>()
            .await;

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::{IdentityEcho, ProbeStatus, Protocol};
    use std::collections::BTreeMap;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Shared instrumentation for the fake probes
    #[derive(Default)]
    struct Counters {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Counters {
        fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Probe that records concurrency and resolves everything as alive
    struct CountingProbe {
        counters: Arc<Counters>,
        delay: Duration,
    }

    impl Probe for CountingProbe {
        async fn probe(&self, candidate: Candidate) -> ProbeOutcome {
            self.counters.enter();
            tokio::time::sleep(self.delay).await;
            self.counters.exit();
            let echo = IdentityEcho::new("9.9.9.9", BTreeMap::new());
            ProbeOutcome::alive(candidate, Duration::from_millis(1), echo)
        }
    }

    /// Probe that panics on one specific port
    struct PanickyProbe {
        panic_port: u16,
    }

    impl Probe for PanickyProbe {
        async fn probe(&self, candidate: Candidate) -> ProbeOutcome {
            if candidate.port == self.panic_port {
                panic!("boom");
            }
            ProbeOutcome::dead(candidate, "mock")
        }
    }

    /// Probe that never finishes on its own
    struct StuckProbe;

    impl Probe for StuckProbe {
        async fn probe(&self, candidate: Candidate) -> ProbeOutcome {
            tokio::time::sleep(Duration::from_secs(600)).await;
            ProbeOutcome::dead(candidate, "unreachable")
        }
    }

    fn candidates(n: u16) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate::new(Protocol::Http, format!("10.0.0.{}", i % 250), 1000 + i))
            .collect()
    }

    #[tokio::test]
    async fn test_one_outcome_per_candidate() {
        let counters = Arc::new(Counters::default());
        let pool = ProbePool::with_config(
            CountingProbe {
                counters,
                delay: Duration::from_millis(1),
            },
            PoolConfig::new().with_max_in_flight(4),
        );

        let input = candidates(25);
        let outcomes = pool.run(input.clone()).await;

        assert_eq!(outcomes.len(), input.len());
        let expected: BTreeSet<Candidate> = input.into_iter().collect();
        let resolved: BTreeSet<Candidate> = outcomes.into_iter().map(|o| o.candidate).collect();
        assert_eq!(resolved, expected);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_cap() {
        let counters = Arc::new(Counters::default());
        let pool = ProbePool::with_config(
            CountingProbe {
                counters: Arc::clone(&counters),
                delay: Duration::from_millis(20),
            },
            PoolConfig::new().with_max_in_flight(5),
        );

        let outcomes = pool.run(candidates(32)).await;
        assert_eq!(outcomes.len(), 32);
        assert!(
            counters.peak.load(Ordering::SeqCst) <= 5,
            "peak in-flight was {}",
            counters.peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_panicking_probe_resolves_to_error() {
        let pool = ProbePool::with_config(
            PanickyProbe { panic_port: 1003 },
            PoolConfig::new().with_max_in_flight(2),
        );

        let outcomes = pool.run(candidates(8)).await;
        assert_eq!(outcomes.len(), 8);

        let crashed: Vec<_> = outcomes.iter().filter(|o| o.candidate.port == 1003).collect();
        assert_eq!(crashed.len(), 1);
        assert!(
            matches!(crashed[0].status, ProbeStatus::Error(ref r) if r.contains("panicked"))
        );
        // The panic did not take any sibling down
        assert!(outcomes
            .iter()
            .filter(|o| o.candidate.port != 1003)
            .all(|o| matches!(o.status, ProbeStatus::Dead(_))));
    }

    #[tokio::test]
    async fn test_cancellation_resolves_remaining_as_error() {
        let pool = ProbePool::with_config(StuckProbe, PoolConfig::new().with_max_in_flight(3));
        let token = pool.cancellation_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let outcomes = pool.run(candidates(10)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcomes.len(), 10);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o.status, ProbeStatus::Error(ref r) if r.contains("shutdown"))));
    }

    #[tokio::test]
    async fn test_outcome_stream_sees_every_completion() {
        let counters = Arc::new(Counters::default());
        let mut pool = ProbePool::with_config(
            CountingProbe {
                counters,
                delay: Duration::from_millis(1),
            },
            PoolConfig::new().with_max_in_flight(4),
        );
        let mut rx = pool.outcome_stream();

        let collector = tokio::spawn(async move {
            let mut seen = 0usize;
            while rx.recv().await.is_some() {
                seen += 1;
            }
            seen
        });

        let outcomes = pool.run(candidates(12)).await;
        drop(pool);
        assert_eq!(outcomes.len(), 12);
        assert_eq!(collector.await.unwrap(), 12);
    }
}
