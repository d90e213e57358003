//! Prometheus counters for the admission pipeline, rendered in text format on
//! `/metrics`. Rejections are labelled by reason, never by player id.

use anyhow::Result;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{AdmissionError, FairnessViolation};

pub struct AdmissionMetrics {
    registry: Registry,
    events_processed: IntCounterVec,
    dropped_events: IntCounterVec,
    anomaly_flags: IntCounterVec,
    tracked_players: IntGauge,
    live_leases: IntGauge,
}

impl std::fmt::Debug for AdmissionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionMetrics").finish_non_exhaustive()
    }
}

impl AdmissionMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let events_processed = IntCounterVec::new(
            Opts::new(
                "events_processed_total",
                "Events that reached the admission pipeline, by outcome",
            ),
            &["status"],
        )?;
        let dropped_events = IntCounterVec::new(
            Opts::new("dropped_events_total", "Rejected events, by rejection reason"),
            &["reason"],
        )?;
        let anomaly_flags = IntCounterVec::new(
            Opts::new("anomaly_flags_total", "Fairness detector trips, by detector"),
            &["type"],
        )?;
        let tracked_players = IntGauge::new("tracked_players", "Players with an activity record")?;
        let live_leases = IntGauge::new("live_leases", "Idempotency keys currently leased")?;

        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(dropped_events.clone()))?;
        registry.register(Box::new(anomaly_flags.clone()))?;
        registry.register(Box::new(tracked_players.clone()))?;
        registry.register(Box::new(live_leases.clone()))?;

        Ok(Self {
            registry,
            events_processed,
            dropped_events,
            anomaly_flags,
            tracked_players,
            live_leases,
        })
    }

    pub fn record_approved(&self) {
        self.events_processed.with_label_values(&["approved"]).inc();
    }

    pub fn record_rejection(&self, err: &AdmissionError) {
        if matches!(err, AdmissionError::NotFound) {
            return;
        }
        self.events_processed.with_label_values(&["rejected"]).inc();
        self.dropped_events.with_label_values(&[err.code()]).inc();
        match err {
            AdmissionError::Fairness(FairnessViolation::EventFlood { .. }) => {
                self.anomaly_flags.with_label_values(&["event_flood"]).inc()
            }
            AdmissionError::Fairness(FairnessViolation::ScoreAnomaly { .. }) => {
                self.anomaly_flags.with_label_values(&["score_anomaly"]).inc()
            }
            _ => {}
        }
    }

    pub fn set_tracked_players(&self, n: usize) {
        self.tracked_players.set(i64::try_from(n).unwrap_or(i64::MAX));
    }

    pub fn set_live_leases(&self, n: usize) {
        self.live_leases.set(i64::try_from(n).unwrap_or(i64::MAX));
    }

    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
