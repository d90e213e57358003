use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::models::BlockReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing signature")]
    MissingSignature,
    #[error("invalid signature")]
    InvalidSignature,
}

/// Player-level rejection. Messages explain the block without echoing the
/// configured thresholds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FairnessViolation {
    #[error("event flood detected - player blocked")]
    EventFlood { blocked_until: DateTime<Utc> },
    #[error("score anomaly detected - player blocked")]
    ScoreAnomaly { blocked_until: DateTime<Utc> },
    #[error("player is temporarily blocked")]
    Blocked {
        reason: BlockReason,
        blocked_until: DateTime<Utc>,
    },
}

impl FairnessViolation {
    pub fn blocked_until(&self) -> DateTime<Utc> {
        match self {
            FairnessViolation::EventFlood { blocked_until }
            | FairnessViolation::ScoreAnomaly { blocked_until }
            | FairnessViolation::Blocked { blocked_until, .. } => *blocked_until,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("duplicate request")]
    DuplicateRequest,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error(transparent)]
    Fairness(#[from] FairnessViolation),
    #[error("{0}")]
    Validation(String),
    #[error("unsupported content type")]
    UnsupportedMediaType,
    #[error("player not found")]
    NotFound,
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::Auth(_) => StatusCode::UNAUTHORIZED,
            AdmissionError::DuplicateRequest => StatusCode::CONFLICT,
            AdmissionError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::Fairness(FairnessViolation::EventFlood { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AdmissionError::Fairness(_) => StatusCode::FORBIDDEN,
            AdmissionError::Validation(_) => StatusCode::BAD_REQUEST,
            AdmissionError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AdmissionError::NotFound => StatusCode::NOT_FOUND,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::Auth(AuthError::MissingSignature) => "missing_signature",
            AdmissionError::Auth(AuthError::InvalidSignature) => "invalid_signature",
            AdmissionError::DuplicateRequest => "duplicate_request",
            AdmissionError::RateLimited => "rate_limited",
            AdmissionError::Fairness(FairnessViolation::EventFlood { .. }) => "event_flood",
            AdmissionError::Fairness(FairnessViolation::ScoreAnomaly { .. }) => "score_anomaly",
            AdmissionError::Fairness(FairnessViolation::Blocked { .. }) => "player_blocked",
            AdmissionError::Validation(_) => "invalid_event",
            AdmissionError::UnsupportedMediaType => "unsupported_media_type",
            AdmissionError::NotFound => "not_found",
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "status": "rejected",
            "error": self.code(),
            "message": self.to_string(),
        });
        if let AdmissionError::Fairness(violation) = &self {
            body["blockedUntil"] = json!(violation.blocked_until().timestamp());
            if let FairnessViolation::Blocked { reason, .. } = violation {
                body["reason"] = json!(reason);
            }
        }
        (self.status(), Json(body)).into_response()
    }
}
