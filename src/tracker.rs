//! Per-player activity tracking and the Active/Blocked state machine.
//!
//! Records live in a sharded map keyed by player id; every read or update of
//! a record happens under its shard's lock, so a single player's events are
//! applied one at a time while unrelated players proceed in parallel.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{AdmissionError, FairnessViolation};
use crate::models::{BlockReason, BlockState, EventPayload, InboundEvent};

pub const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone)]
pub struct FairnessPolicy {
    /// Events allowed per player inside one window before the flood block.
    pub anomaly_threshold: u32,
    /// Largest single progression `deltaXp` accepted.
    pub score_threshold: i64,
    pub flood_block: Duration,
    pub score_block: Duration,
    pub window: Duration,
}

impl Default for FairnessPolicy {
    fn default() -> Self {
        Self {
            anomaly_threshold: 10,
            score_threshold: 1000,
            flood_block: Duration::seconds(300),
            score_block: Duration::seconds(600),
            window: Duration::seconds(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Blocked {
        until: DateTime<Utc>,
        reason: BlockReason,
    },
}

#[derive(Debug, Clone)]
struct PlayerActivityRecord {
    window_start: DateTime<Utc>,
    event_count: u32,
    cumulative_score: i64,
    status: Status,
    last_seen: DateTime<Utc>,
}

/// Outcome of an admitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub accepted_at: DateTime<Utc>,
    pub cumulative_score: i64,
}

/// Effective state of a player at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub player_id: String,
    pub block_state: BlockState,
    pub block_reason: Option<BlockReason>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub blocked_until: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub window_start: DateTime<Utc>,
    pub event_count_in_window: u32,
    pub cumulative_score: i64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_seen: DateTime<Utc>,
}

impl PlayerActivityRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            event_count: 0,
            cumulative_score: 0,
            status: Status::Active,
            last_seen: now,
        }
    }

    fn blocked_at(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, BlockReason)> {
        match self.status {
            Status::Blocked { until, reason } if now < until => Some((until, reason)),
            _ => None,
        }
    }

    fn clear_block(&mut self) {
        self.status = Status::Active;
        self.event_count = 0;
        self.cumulative_score = 0;
    }

    fn block(&mut self, now: DateTime<Utc>, duration: Duration, reason: BlockReason) -> DateTime<Utc> {
        let until = now + duration;
        self.status = Status::Blocked { until, reason };
        until
    }

    fn admit(
        &mut self,
        policy: &FairnessPolicy,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<Admission, FairnessViolation> {
        if let Status::Blocked { until, reason } = self.status {
            if now < until {
                return Err(FairnessViolation::Blocked {
                    reason,
                    blocked_until: until,
                });
            }
            self.clear_block();
        }
        self.last_seen = now;

        let elapsed = now - self.window_start;
        if elapsed < Duration::zero() {
            // Wall clock stepped backwards: count into the current window but re-anchor it.
            self.window_start = now;
        }
        if elapsed < policy.window {
            self.event_count = self.event_count.saturating_add(1);
            if self.event_count > policy.anomaly_threshold {
                let until = self.block(now, policy.flood_block, BlockReason::EventFlood);
                return Err(FairnessViolation::EventFlood {
                    blocked_until: until,
                });
            }
        } else {
            self.window_start = now;
            self.event_count = 1;
        }

        if let EventPayload::Progression(p) = &event.payload {
            if p.delta_xp > policy.score_threshold {
                let until = self.block(now, policy.score_block, BlockReason::ScoreAnomaly);
                return Err(FairnessViolation::ScoreAnomaly {
                    blocked_until: until,
                });
            }
        }

        self.cumulative_score = self.cumulative_score.saturating_add(event.score_delta());
        Ok(Admission {
            accepted_at: now,
            cumulative_score: self.cumulative_score,
        })
    }

    fn snapshot(&self, player_id: &str, policy: &FairnessPolicy, now: DateTime<Utc>) -> PlayerSnapshot {
        let mut view = self.clone();
        if view.status != Status::Active && view.blocked_at(now).is_none() {
            view.clear_block();
        }
        let event_count_in_window = if now - view.window_start >= policy.window {
            0
        } else {
            view.event_count
        };
        let (block_state, block_reason, blocked_until) = match view.status {
            Status::Active => (BlockState::Active, None, None),
            Status::Blocked { until, reason } => (BlockState::Blocked, Some(reason), Some(until)),
        };
        PlayerSnapshot {
            player_id: player_id.to_string(),
            block_state,
            block_reason,
            blocked_until,
            window_start: view.window_start,
            event_count_in_window,
            cumulative_score: view.cumulative_score,
            last_seen: view.last_seen,
        }
    }
}

type Shard = HashMap<String, PlayerActivityRecord>;

pub struct PlayerTracker {
    policy: FairnessPolicy,
    hasher: RandomState,
    shards: Box<[Mutex<Shard>]>,
}

impl std::fmt::Debug for PlayerTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerTracker")
            .field("policy", &self.policy)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl PlayerTracker {
    pub fn new(policy: FairnessPolicy, shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            policy,
            hasher: RandomState::new(),
            shards,
        }
    }

    pub fn policy(&self) -> &FairnessPolicy {
        &self.policy
    }

    /// Runs both detectors for `event` and updates the player's record.
    pub fn check_event(&self, event: &InboundEvent) -> Result<Admission, FairnessViolation> {
        self.check_event_at(event, Utc::now())
    }

    pub fn check_event_at(
        &self,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<Admission, FairnessViolation> {
        let mut shard = self.shard(&event.player_id);
        let record = shard
            .entry(event.player_id.clone())
            .or_insert_with(|| PlayerActivityRecord::new(now));
        let result = record.admit(&self.policy, event, now);
        match &result {
            Ok(admission) => debug!(
                player_id = %event.player_id,
                event_type = event.event_type.as_str(),
                window_count = record.event_count,
                cumulative_score = admission.cumulative_score,
                "Event admitted"
            ),
            Err(FairnessViolation::EventFlood { blocked_until }) => info!(
                player_id = %event.player_id,
                events_in_window = record.event_count,
                blocked_until = %blocked_until,
                "Player blocked for event flood"
            ),
            Err(FairnessViolation::ScoreAnomaly { blocked_until }) => info!(
                player_id = %event.player_id,
                delta = event.score_delta(),
                blocked_until = %blocked_until,
                "Player blocked for score anomaly"
            ),
            Err(FairnessViolation::Blocked { .. }) => {
                debug!(player_id = %event.player_id, "Dropping event from blocked player")
            }
        }
        result
    }

    /// Administrative override: clears any block immediately.
    pub fn unblock(&self, player_id: &str) -> Result<PlayerSnapshot, AdmissionError> {
        self.unblock_at(player_id, Utc::now())
    }

    pub fn unblock_at(
        &self,
        player_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PlayerSnapshot, AdmissionError> {
        let mut shard = self.shard(player_id);
        let record = shard.get_mut(player_id).ok_or(AdmissionError::NotFound)?;
        let was_blocked = record.blocked_at(now).is_some();
        record.clear_block();
        info!(player_id = %player_id, was_blocked, "Player unblocked by operator");
        Ok(record.snapshot(player_id, &self.policy, now))
    }

    pub fn snapshot(&self, player_id: &str) -> Option<PlayerSnapshot> {
        self.snapshot_at(player_id, Utc::now())
    }

    pub fn snapshot_at(&self, player_id: &str, now: DateTime<Utc>) -> Option<PlayerSnapshot> {
        let shard = self.shard(player_id);
        shard
            .get(player_id)
            .map(|record| record.snapshot(player_id, &self.policy, now))
    }

    /// Players whose block is still in force, ordered by player id.
    pub fn blocked_players(&self) -> Vec<PlayerSnapshot> {
        self.blocked_players_at(Utc::now())
    }

    pub fn blocked_players_at(&self, now: DateTime<Utc>) -> Vec<PlayerSnapshot> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let shard = lock(shard);
            out.extend(
                shard
                    .iter()
                    .filter(|(_, record)| record.blocked_at(now).is_some())
                    .map(|(id, record)| record.snapshot(id, &self.policy, now)),
            );
        }
        out.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        out
    }

    /// Removes records of players that are not blocked and have been silent
    /// for at least `idle`. Returns how many were removed.
    pub fn evict_idle(&self, now: DateTime<Utc>, idle: Duration) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            let before = shard.len();
            shard.retain(|_, record| record.blocked_at(now).is_some() || now - record.last_seen < idle);
            removed += before - shard.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| lock(s).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, player_id: &str) -> MutexGuard<'_, Shard> {
        let idx = (self.hasher.hash_one(player_id) % self.shards.len() as u64) as usize;
        lock(&self.shards[idx])
    }
}

fn lock(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BossKillPayload, EventType, ProgressionPayload};
    use std::sync::Arc;

    fn progression(player: &str, delta_xp: i64) -> InboundEvent {
        InboundEvent {
            event_type: EventType::Progression,
            player_id: player.to_string(),
            timestamp: 0,
            payload: EventPayload::Progression(ProgressionPayload {
                delta_xp,
                activity: None,
            }),
        }
    }

    fn boss_kill(player: &str, points: i64) -> InboundEvent {
        InboundEvent {
            event_type: EventType::BossKill,
            player_id: player.to_string(),
            timestamp: 0,
            payload: EventPayload::BossKill(BossKillPayload {
                boss_id: "dragon".to_string(),
                tier: Some(2),
                points,
            }),
        }
    }

    fn tracker() -> PlayerTracker {
        PlayerTracker::new(FairnessPolicy::default(), 4)
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn ms(n: i64) -> Duration {
        Duration::milliseconds(n)
    }

    #[test]
    fn clock_stepping_back_reanchors_window() {
        let tracker = tracker();
        let start = t0();
        for i in 0..3 {
            tracker.check_event_at(&progression("p1", 1), start + ms(i)).unwrap();
        }
        let earlier = start - Duration::seconds(10);
        tracker.check_event_at(&progression("p1", 1), earlier).unwrap();
        assert_eq!(
            tracker.snapshot_at("p1", earlier).unwrap().window_start,
            earlier
        );

        tracker
            .check_event_at(&progression("p1", 1), earlier + ms(1000))
            .unwrap();
        let snap = tracker.snapshot_at("p1", earlier + ms(1000)).unwrap();
        assert_eq!(snap.event_count_in_window, 1);
        assert_eq!(snap.window_start, earlier + ms(1000));
    }

    #[test]
    fn flood_blocks_on_threshold_plus_one() {
        let tracker = tracker();
        let start = t0();
        for i in 0..10 {
            assert!(
                tracker.check_event_at(&progression("p1", 5), start + ms(i * 40)).is_ok(),
                "event {i} should pass"
            );
        }
        let err = tracker
            .check_event_at(&progression("p1", 5), start + ms(450))
            .unwrap_err();
        assert_eq!(
            err,
            FairnessViolation::EventFlood {
                blocked_until: start + ms(450) + Duration::seconds(300)
            }
        );

        let err = tracker
            .check_event_at(&progression("p1", 5), start + ms(451))
            .unwrap_err();
        assert!(matches!(
            err,
            FairnessViolation::Blocked {
                reason: BlockReason::EventFlood,
                ..
            }
        ));
        let snap = tracker.snapshot_at("p1", start + ms(452)).unwrap();
        assert_eq!(snap.block_state, BlockState::Blocked);
        assert_eq!(snap.cumulative_score, 50);
    }

    #[test]
    fn blocked_player_counters_do_not_advance() {
        let tracker = tracker();
        let start = t0();
        tracker
            .check_event_at(&progression("p1", 2000), start)
            .unwrap_err();
        let before = tracker.snapshot_at("p1", start).unwrap();
        for i in 1..20 {
            tracker
                .check_event_at(&progression("p1", 10), start + ms(i))
                .unwrap_err();
        }
        let after = tracker.snapshot_at("p1", start).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn new_window_resets_count() {
        let tracker = tracker();
        let start = t0();
        for i in 0..10 {
            tracker
                .check_event_at(&progression("p1", 1), start + ms(i))
                .unwrap();
        }
        // Exactly one second after the window opened starts a fresh window.
        for i in 0..10 {
            tracker
                .check_event_at(&progression("p1", 1), start + ms(1000 + i))
                .unwrap();
        }
        let snap = tracker.snapshot_at("p1", start + ms(1010)).unwrap();
        assert_eq!(snap.event_count_in_window, 10);
        assert_eq!(snap.window_start, start + ms(1000));
    }

    #[test]
    fn stale_window_reads_as_zero() {
        let tracker = tracker();
        let start = t0();
        tracker.check_event_at(&progression("p1", 1), start).unwrap();
        assert_eq!(
            tracker.snapshot_at("p1", start + ms(999)).unwrap().event_count_in_window,
            1
        );
        assert_eq!(
            tracker.snapshot_at("p1", start + ms(1000)).unwrap().event_count_in_window,
            0
        );
    }

    #[test]
    fn score_anomaly_blocks_without_flood() {
        let tracker = tracker();
        let start = t0();
        let err = tracker
            .check_event_at(&progression("p2", 1500), start)
            .unwrap_err();
        assert_eq!(
            err,
            FairnessViolation::ScoreAnomaly {
                blocked_until: start + Duration::seconds(600)
            }
        );
        let snap = tracker.snapshot_at("p2", start).unwrap();
        assert_eq!(snap.block_state, BlockState::Blocked);
        assert_eq!(snap.block_reason, Some(BlockReason::ScoreAnomaly));
        assert_eq!(snap.cumulative_score, 0);
    }

    #[test]
    fn score_threshold_is_inclusive_and_progression_only() {
        let tracker = tracker();
        let start = t0();
        assert!(tracker.check_event_at(&progression("p3", 1000), start).is_ok());
        assert!(tracker
            .check_event_at(&boss_kill("p3", 5000), start + ms(10))
            .is_ok());
        let snap = tracker.snapshot_at("p3", start + ms(10)).unwrap();
        assert_eq!(snap.cumulative_score, 6000);
        assert_eq!(snap.block_state, BlockState::Active);
    }

    #[test]
    fn expired_block_starts_fresh() {
        let tracker = tracker();
        let start = t0();
        tracker.check_event_at(&progression("p1", 300), start).unwrap();
        tracker
            .check_event_at(&progression("p1", 5000), start + ms(10))
            .unwrap_err();

        let later = start + Duration::seconds(601);
        let admission = tracker.check_event_at(&progression("p1", 7), later).unwrap();
        assert_eq!(admission.cumulative_score, 7);
        let snap = tracker.snapshot_at("p1", later).unwrap();
        assert_eq!(snap.block_state, BlockState::Active);
        assert_eq!(snap.event_count_in_window, 1);
        assert_eq!(snap.cumulative_score, 7);
    }

    #[test]
    fn snapshot_reports_expired_block_as_active() {
        let tracker = tracker();
        let start = t0();
        tracker
            .check_event_at(&progression("p1", 5000), start)
            .unwrap_err();
        let snap = tracker
            .snapshot_at("p1", start + Duration::seconds(601))
            .unwrap();
        assert_eq!(snap.block_state, BlockState::Active);
        assert_eq!(snap.blocked_until, None);
        assert!(tracker
            .blocked_players_at(start + Duration::seconds(601))
            .is_empty());
    }

    #[test]
    fn unblock_clears_immediately() {
        let tracker = tracker();
        let start = t0();
        for i in 0..11 {
            let _ = tracker.check_event_at(&progression("p1", 1), start + ms(i));
        }
        assert_eq!(tracker.blocked_players_at(start + ms(20)).len(), 1);

        let snap = tracker.unblock_at("p1", start + ms(30)).unwrap();
        assert_eq!(snap.block_state, BlockState::Active);
        assert_eq!(snap.cumulative_score, 0);
        assert!(tracker
            .check_event_at(&progression("p1", 1), start + ms(40))
            .is_ok());
    }

    #[test]
    fn unblock_unknown_player_is_not_found() {
        assert_eq!(
            tracker().unblock_at("ghost", t0()).unwrap_err(),
            AdmissionError::NotFound
        );
    }

    #[test]
    fn blocked_players_sorted_by_id() {
        let tracker = tracker();
        let start = t0();
        for id in ["zed", "amy", "kim"] {
            tracker
                .check_event_at(&progression(id, 9999), start)
                .unwrap_err();
        }
        tracker.check_event_at(&progression("ok", 1), start).unwrap();
        let ids: Vec<_> = tracker
            .blocked_players_at(start)
            .into_iter()
            .map(|s| s.player_id)
            .collect();
        assert_eq!(ids, vec!["amy", "kim", "zed"]);
    }

    #[test]
    fn evict_idle_keeps_blocked_and_recent() {
        let tracker = tracker();
        let start = t0();
        tracker.check_event_at(&progression("idle", 1), start).unwrap();
        tracker
            .check_event_at(&progression("cheat", 9999), start)
            .unwrap_err();
        tracker
            .check_event_at(&progression("fresh", 1), start + Duration::seconds(50))
            .unwrap();
        let removed = tracker.evict_idle(start + Duration::seconds(60), Duration::seconds(30));
        assert_eq!(removed, 1);
        assert!(tracker.snapshot_at("idle", start).is_none());
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn concurrent_events_for_one_player_are_serialized() {
        let policy = FairnessPolicy {
            anomaly_threshold: 1_000_000,
            window: Duration::seconds(3600),
            ..FairnessPolicy::default()
        };
        let tracker = Arc::new(PlayerTracker::new(policy, 8));
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        tracker.check_event_at(&progression("shared", 2), now).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = tracker.snapshot_at("shared", now).unwrap();
        assert_eq!(snap.event_count_in_window, 2000);
        assert_eq!(snap.cumulative_score, 4000);
    }
}
