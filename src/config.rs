use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::consumer::DEFAULT_CHANNEL_CAPACITY;
use crate::signature::SignatureVerifier;
use crate::tracker::{FairnessPolicy, DEFAULT_SHARDS};

/// Upper bound for lease lifetimes and the housekeeping period.
pub const MAX_TTL_SECS: u64 = 24 * 60 * 60;
/// Upper bound for the idle-player reaper threshold.
pub const MAX_IDLE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Startup configuration. Every field is validated before the server binds;
/// a bad value aborts startup instead of falling back silently.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub verifier: SignatureVerifier,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: f64,
    pub policy: FairnessPolicy,
    pub idempotency_ttl: Duration,
    pub max_body_bytes: usize,
    pub max_concurrent_forwards: usize,
    pub consumer_capacity: usize,
    pub player_shards: usize,
    pub housekeeping_interval: Duration,
    /// `None` keeps player records for the lifetime of the process.
    pub player_idle_ttl: Option<chrono::Duration>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = lookup("HMAC_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("HMAC_SECRET must be set"))?;
        let verifier = SignatureVerifier::new(secret).context("HMAC_SECRET rejected")?;

        let rate_limit_rps: f64 = parse_or(&lookup, "RATE_LIMIT_RPS", 50.0)?;
        if !(rate_limit_rps.is_finite() && rate_limit_rps > 0.0) {
            bail!("RATE_LIMIT_RPS must be a positive number");
        }
        let rate_limit_burst: f64 = parse_or(&lookup, "RATE_LIMIT_BURST", 100.0)?;
        if !(rate_limit_burst.is_finite() && rate_limit_burst >= 1.0) {
            bail!("RATE_LIMIT_BURST must be at least 1");
        }

        let anomaly_threshold: u32 = positive(&lookup, "ANOMALY_THRESHOLD", 10)?;
        let score_threshold: i64 = parse_or(&lookup, "SCORE_THRESHOLD", 1000)?;
        if score_threshold < 0 {
            bail!("SCORE_THRESHOLD must not be negative");
        }
        let flood_block_secs: u32 = positive(&lookup, "FLOOD_BLOCK_SECS", 300)?;
        let score_block_secs: u32 = positive(&lookup, "SCORE_BLOCK_SECS", 600)?;
        let policy = FairnessPolicy {
            anomaly_threshold,
            score_threshold,
            flood_block: chrono::Duration::seconds(flood_block_secs.into()),
            score_block: chrono::Duration::seconds(score_block_secs.into()),
            ..FairnessPolicy::default()
        };

        let idempotency_ttl_secs: u64 = positive(&lookup, "IDEMPOTENCY_TTL_SECS", 300)?;
        at_most("IDEMPOTENCY_TTL_SECS", idempotency_ttl_secs, MAX_TTL_SECS)?;
        let housekeeping_secs: u64 = positive(&lookup, "HOUSEKEEPING_INTERVAL_SECS", 30)?;
        at_most("HOUSEKEEPING_INTERVAL_SECS", housekeeping_secs, MAX_TTL_SECS)?;
        let idle_ttl_secs: u32 = parse_or(&lookup, "PLAYER_IDLE_TTL_SECS", 0)?;
        at_most("PLAYER_IDLE_TTL_SECS", idle_ttl_secs.into(), MAX_IDLE_TTL_SECS)?;

        Ok(Self {
            port: parse_or(&lookup, "PORT", 8081)?,
            verifier,
            rate_limit_rps,
            rate_limit_burst,
            policy,
            idempotency_ttl: Duration::from_secs(idempotency_ttl_secs),
            max_body_bytes: positive(&lookup, "MAX_BODY_BYTES", 64 * 1024)?,
            max_concurrent_forwards: positive(&lookup, "MAX_CONCURRENT_FORWARDS", 8)?,
            consumer_capacity: positive(&lookup, "CONSUMER_CAPACITY", DEFAULT_CHANNEL_CAPACITY)?,
            player_shards: positive(&lookup, "PLAYER_SHARDS", DEFAULT_SHARDS)?,
            housekeeping_interval: Duration::from_secs(housekeeping_secs),
            player_idle_ttl: (idle_ttl_secs > 0)
                .then(|| chrono::Duration::seconds(idle_ttl_secs.into())),
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, raw, e)),
        _ => Ok(default),
    }
}

fn at_most(key: &str, value: u64, max: u64) -> Result<()> {
    if value > max {
        bail!("{} must be at most {} (got {})", key, max, value);
    }
    Ok(())
}

fn positive<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default)?;
    if value <= T::default() {
        bail!("{} must be greater than zero", key);
    }
    Ok(value)
}
