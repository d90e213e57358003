use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};

use crate::models::AcceptedEvent;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Downstream processor (progression, leaderboard, rewards) receiving admitted events.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn consume(&self, event: AcceptedEvent) -> Result<()>;
}

/// In-memory bus: admitted events are queued on a bounded channel. When the
/// queue is full the event is dropped with a warning rather than stalling
/// admission.
#[derive(Debug, Clone)]
pub struct ChannelConsumer {
    tx: mpsc::Sender<AcceptedEvent>,
}

impl ChannelConsumer {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AcceptedEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventConsumer for ChannelConsumer {
    async fn consume(&self, event: AcceptedEvent) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!(
                    player_id = %event.event.player_id,
                    "Consumer queue full, dropping admitted event"
                );
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(anyhow!("event consumer channel closed")),
        }
    }
}

/// Drains the bus, logging each admitted event. Stands in for the progression
/// processor when none is attached.
pub async fn log_accepted_events(mut rx: mpsc::Receiver<AcceptedEvent>) {
    while let Some(accepted) = rx.recv().await {
        info!(
            player_id = %accepted.event.player_id,
            event_type = accepted.event.event_type.as_str(),
            delta = accepted.event.score_delta(),
            cumulative_score = accepted.cumulative_score,
            "Forwarded admitted event"
        );
    }
    info!("Event consumer channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DropClaimedPayload, EventPayload, EventType, InboundEvent};

    fn accepted(player: &str) -> AcceptedEvent {
        AcceptedEvent {
            event: InboundEvent {
                event_type: EventType::DropClaimed,
                player_id: player.to_string(),
                timestamp: 1,
                payload: EventPayload::DropClaimed(DropClaimedPayload {
                    drop_id: "gem".to_string(),
                    weight: None,
                    source: None,
                }),
            },
            accepted_at: 1,
            cumulative_score: 0,
        }
    }

    #[tokio::test]
    async fn delivers_until_full_then_drops() {
        let (consumer, mut rx) = ChannelConsumer::new(1);
        consumer.consume(accepted("a")).await.unwrap();
        consumer.consume(accepted("b")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event.player_id, "a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let (consumer, rx) = ChannelConsumer::new(4);
        drop(rx);
        assert!(consumer.consume(accepted("a")).await.is_err());
    }
}
