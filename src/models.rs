use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AdmissionError;

const MAX_PLAYER_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Progression,
    BossKill,
    DropClaimed,
}

impl EventType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "progression" => Some(EventType::Progression),
            "boss_kill" => Some(EventType::BossKill),
            "drop_claimed" => Some(EventType::DropClaimed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Progression => "progression",
            EventType::BossKill => "boss_kill",
            EventType::DropClaimed => "drop_claimed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    Active,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    EventFlood,
    ScoreAnomaly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressionPayload {
    pub delta_xp: i64,
    #[serde(default)]
    pub activity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BossKillPayload {
    pub boss_id: String,
    #[serde(default)]
    pub tier: Option<u32>,
    #[serde(default)]
    pub points: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropClaimedPayload {
    pub drop_id: String,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Progression(ProgressionPayload),
    BossKill(BossKillPayload),
    DropClaimed(DropClaimedPayload),
}

impl EventPayload {
    /// Amount added to the player's cumulative score when the event is accepted.
    pub fn score_delta(&self) -> i64 {
        match self {
            EventPayload::Progression(p) => p.delta_xp,
            EventPayload::BossKill(p) => p.points,
            EventPayload::DropClaimed(_) => 0,
        }
    }
}

/// A validated gameplay event. Only constructed through [`InboundEvent::parse`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub player_id: String,
    #[serde(rename = "ts")]
    pub timestamp: i64,
    pub payload: EventPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    player_id: String,
    ts: i64,
    payload: Map<String, Value>,
}

impl InboundEvent {
    pub fn parse(body: &[u8]) -> Result<Self, AdmissionError> {
        let raw: RawEvent = serde_json::from_slice(body)
            .map_err(|e| AdmissionError::Validation(format!("malformed event: {e}")))?;

        if !is_valid_player_id(&raw.player_id) {
            return Err(AdmissionError::Validation("invalid playerId".to_string()));
        }
        let event_type = EventType::parse(&raw.event_type).ok_or_else(|| {
            AdmissionError::Validation(format!("unsupported event type '{}'", raw.event_type))
        })?;

        let payload = Value::Object(raw.payload);
        let payload = match event_type {
            EventType::Progression => {
                EventPayload::Progression(decode_payload::<ProgressionPayload>(payload)?)
            }
            EventType::BossKill => {
                let p = decode_payload::<BossKillPayload>(payload)?;
                if p.boss_id.trim().is_empty() {
                    return Err(AdmissionError::Validation("bossId must not be empty".into()));
                }
                EventPayload::BossKill(p)
            }
            EventType::DropClaimed => {
                let p = decode_payload::<DropClaimedPayload>(payload)?;
                if p.drop_id.trim().is_empty() {
                    return Err(AdmissionError::Validation("dropId must not be empty".into()));
                }
                EventPayload::DropClaimed(p)
            }
        };
        if payload.score_delta() < 0 {
            return Err(AdmissionError::Validation(
                "score delta must not be negative".to_string(),
            ));
        }

        Ok(Self {
            event_type,
            player_id: raw.player_id,
            timestamp: raw.ts,
            payload,
        })
    }

    pub fn score_delta(&self) -> i64 {
        self.payload.score_delta()
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, AdmissionError> {
    serde_json::from_value(payload)
        .map_err(|e| AdmissionError::Validation(format!("invalid payload: {e}")))
}

pub fn is_valid_player_id(player_id: &str) -> bool {
    !player_id.is_empty()
        && player_id.len() <= MAX_PLAYER_ID_LEN
        && player_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Acknowledgment returned for an admitted event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acceptance {
    pub status: &'static str,
    pub player_id: String,
    pub event_type: EventType,
    pub timestamp: i64,
}

/// An admitted event as handed to the downstream consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedEvent {
    pub event: InboundEvent,
    pub accepted_at: i64,
    pub cumulative_score: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(v: Value) -> Vec<u8> {
        serde_json::to_vec(&v).unwrap()
    }

    #[test]
    fn parses_progression_event() {
        let event = InboundEvent::parse(&body(json!({
            "type": "progression",
            "playerId": "p1",
            "ts": 1_700_000_000,
            "payload": { "deltaXp": 120, "activity": "quest" }
        })))
        .unwrap();
        assert_eq!(event.event_type, EventType::Progression);
        assert_eq!(event.player_id, "p1");
        assert_eq!(event.score_delta(), 120);
    }

    #[test]
    fn boss_kill_points_default_to_zero() {
        let event = InboundEvent::parse(&body(json!({
            "type": "boss_kill",
            "playerId": "raider_7",
            "ts": 1,
            "payload": { "bossId": "dragon", "tier": 3 }
        })))
        .unwrap();
        assert_eq!(event.score_delta(), 0);
    }

    #[test]
    fn rejects_unknown_type() {
        let err = InboundEvent::parse(&body(json!({
            "type": "teleport",
            "playerId": "p1",
            "ts": 1,
            "payload": {}
        })))
        .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[test]
    fn rejects_progression_without_delta() {
        let err = InboundEvent::parse(&body(json!({
            "type": "progression",
            "playerId": "p1",
            "ts": 1,
            "payload": { "activity": "quest" }
        })))
        .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[test]
    fn rejects_negative_delta() {
        let err = InboundEvent::parse(&body(json!({
            "type": "progression",
            "playerId": "p1",
            "ts": 1,
            "payload": { "deltaXp": -5 }
        })))
        .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[test]
    fn rejects_payload_that_is_not_an_object() {
        let err = InboundEvent::parse(&body(json!({
            "type": "drop_claimed",
            "playerId": "p1",
            "ts": 1,
            "payload": [1, 2]
        })))
        .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[test]
    fn player_id_charset() {
        assert!(is_valid_player_id("p1"));
        assert!(is_valid_player_id("alpha-beta_9"));
        assert!(!is_valid_player_id(""));
        assert!(!is_valid_player_id("bad id"));
        assert!(!is_valid_player_id(&"x".repeat(65)));
    }
}
