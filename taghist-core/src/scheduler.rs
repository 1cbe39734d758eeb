//! The periodic poll cycle: collect subscriptions, plan read windows,
//! execute device reads, decode, diff against per-session state and fan out
//! the changed samples.

use crate::{
    address::AddressCache,
    codec,
    device::SourceRegistry,
    planner::{plan_windows, ReadWindow, WindowMember},
    subscription::SessionRegistry,
};
use chrono::Local;
use std::{collections::HashMap, sync::Arc};
use taghist_models::{settings::PollerConfig, TagSample};
use tokio::{
    sync::RwLock,
    time::{interval, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Rolling counters over the scheduler's lifetime.
#[derive(Debug, Clone, Default)]
pub struct PollerMetrics {
    pub cycles: u64,
    pub windows_read: u64,
    pub window_failures: u64,
    pub sources_skipped: u64,
    pub samples_delivered: u64,
    pub sessions_dropped: u64,
}

/// Drives the acquisition pipeline on a fixed interval until cancelled.
///
/// No single source, window or session failure aborts a cycle; every
/// failure is isolated, logged and retried implicitly on the next cycle.
pub struct PollScheduler {
    config: PollerConfig,
    registry: Arc<SessionRegistry>,
    cache: Arc<AddressCache>,
    sources: Arc<SourceRegistry>,
    metrics: Arc<RwLock<PollerMetrics>>,
    cancel: CancellationToken,
}

impl PollScheduler {
    pub fn new(
        config: PollerConfig,
        registry: Arc<SessionRegistry>,
        cache: Arc<AddressCache>,
        sources: Arc<SourceRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            cache,
            sources,
            metrics: Arc::new(RwLock::new(PollerMetrics::default())),
            cancel,
        }
    }

    /// Repeating cycle loop. Cycles never overlap: the whole cycle —
    /// delivery callbacks included — is awaited before the next tick is
    /// taken. Cancellation stops the sleep and exits after the current
    /// cycle completes.
    #[instrument(name = "poll-loop", skip_all)]
    pub async fn run(&self) {
        let mut ticker = interval(Duration::from_millis(self.config.interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.config.interval_ms, "poll loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = self.cancel.cancelled() => {
                    info!("poll loop cancelled");
                    break;
                }
            }
        }
    }

    /// One full cycle. Public so tests can drive the pipeline tick by tick.
    #[instrument(name = "poll-cycle", skip_all)]
    pub async fn run_cycle(&self) {
        let mut windows_read = 0u64;
        let mut window_failures = 0u64;
        let mut sources_skipped = 0u64;
        let mut samples_delivered = 0u64;
        let mut sessions_dropped = 0u64;

        // Collect: resolve every (session, tag) to an address; unresolved
        // tags are silently excluded until re-registered.
        let mut members = Vec::new();
        for (session_id, names) in self.registry.snapshot() {
            for name in names {
                let resolved = self
                    .cache
                    .resolve(&name, |key| self.sources.contains(key));
                if let Some(address) = resolved {
                    members.push(WindowMember {
                        session_id: session_id.clone(),
                        tag_name: name,
                        address,
                    });
                }
            }
        }

        // Plan: minimal bounded windows per (source, block).
        let windows = plan_windows(members, self.config.max_window_bytes);
        let mut by_source: HashMap<String, Vec<ReadWindow>> = HashMap::new();
        for window in windows {
            by_source
                .entry(window.source_key.clone())
                .or_default()
                .push(window);
        }

        // Execute: per source under its exclusivity lock; sources proceed
        // independently of each other.
        let reads = by_source.into_iter().map(|(key, windows)| {
            let sources = Arc::clone(&self.sources);
            async move {
                let requests: Vec<(u16, u32, u32)> = windows
                    .iter()
                    .map(|w| (w.block, w.start, w.length))
                    .collect();
                match sources.read_windows(&key, &requests).await {
                    Ok(results) => Some((windows, results)),
                    Err(e) => {
                        warn!(source = %key, error = %e, "source unavailable; skipping its windows this cycle");
                        None
                    }
                }
            }
        });
        let outcomes = futures::future::join_all(reads).await;

        // Decode and diff against each session's stored state.
        let now = Local::now();
        let mut per_session: HashMap<String, Vec<TagSample>> = HashMap::new();
        for outcome in outcomes {
            let Some((windows, results)) = outcome else {
                sources_skipped += 1;
                continue;
            };
            for (window, result) in windows.into_iter().zip(results) {
                let buf = match result {
                    Ok(buf) => buf,
                    Err(e) => {
                        warn!(
                            source = %window.source_key,
                            block = window.block,
                            offset = window.start,
                            length = window.length,
                            error = %e,
                            "window read failed"
                        );
                        window_failures += 1;
                        continue;
                    }
                };
                windows_read += 1;
                for member in window.members {
                    let rel = (member.address.byte_offset - window.start) as usize;
                    let Some(value) =
                        codec::decode(member.address.kind, member.address.bit_index, &buf, rel)
                    else {
                        continue;
                    };
                    if let Some(changed) =
                        self.registry
                            .apply_change(&member.session_id, &member.tag_name, &value, now)
                    {
                        per_session
                            .entry(member.session_id)
                            .or_default()
                            .push(changed);
                    }
                }
            }
        }

        // Fan out: one delivery per session carrying exactly its changed
        // samples. A failing callback unsubscribes the session.
        for (session_id, samples) in per_session {
            let Some(deliver) = self.registry.deliver_fn(&session_id) else {
                continue;
            };
            let count = samples.len() as u64;
            debug!(session = %session_id, changed = count, "delivering changed samples");
            if let Err(e) = deliver(samples).await {
                warn!(session = %session_id, error = %e, "delivery failed; removing session");
                self.registry.remove(&session_id);
                sessions_dropped += 1;
            } else {
                samples_delivered += count;
            }
        }

        let mut metrics = self.metrics.write().await;
        metrics.cycles += 1;
        metrics.windows_read += windows_read;
        metrics.window_failures += window_failures;
        metrics.sources_skipped += sources_skipped;
        metrics.samples_delivered += samples_delivered;
        metrics.sessions_dropped += sessions_dropped;
    }

    pub async fn metrics(&self) -> PollerMetrics {
        self.metrics.read().await.clone()
    }
}
