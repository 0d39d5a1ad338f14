//! Change events published to subscribers after every snapshot transition.

use serde::Serialize;
use tokio::sync::broadcast;

use m4e_shared::protocol::ChatMessage;
use m4e_shared::schedule::VotingWindow;
use m4e_shared::types::{EventId, LocationId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    EventAdded {
        event_id: EventId,
    },
    EventUpdated {
        event_id: EventId,
    },
    EventRemoved {
        event_id: EventId,
    },
    MemberAdded {
        event_id: EventId,
        member_id: UserId,
    },
    MemberRemoved {
        event_id: EventId,
        member_id: UserId,
    },
    LocationUpdated {
        event_id: EventId,
        location_id: LocationId,
    },
    LocationRemoved {
        event_id: EventId,
        location_id: LocationId,
    },
    VotingStarted {
        event_id: EventId,
        window: VotingWindow,
    },
    VotingEnded {
        event_id: EventId,
        window: VotingWindow,
    },
    VotesChanged {
        event_id: EventId,
        location_id: LocationId,
    },
    Chat(ChatMessage),
}

impl ChangeEvent {
    pub fn event_id(&self) -> Option<&EventId> {
        match self {
            ChangeEvent::EventAdded { event_id }
            | ChangeEvent::EventUpdated { event_id }
            | ChangeEvent::EventRemoved { event_id }
            | ChangeEvent::MemberAdded { event_id, .. }
            | ChangeEvent::MemberRemoved { event_id, .. }
            | ChangeEvent::LocationUpdated { event_id, .. }
            | ChangeEvent::LocationRemoved { event_id, .. }
            | ChangeEvent::VotingStarted { event_id, .. }
            | ChangeEvent::VotingEnded { event_id, .. }
            | ChangeEvent::VotesChanged { event_id, .. } => Some(event_id),
            ChangeEvent::Chat(chat) => chat.event_id.as_ref(),
        }
    }
}

/// Publish a change. Having no subscribers is not an error.
pub fn emit_change(tx: &broadcast::Sender<ChangeEvent>, change: ChangeEvent) {
    if tx.receiver_count() == 0 {
        return;
    }
    if let Err(e) = tx.send(change) {
        tracing::error!(error = %e, "Failed to emit change event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_event_json_shape() {
        let change = ChangeEvent::LocationRemoved {
            event_id: EventId::new("E1"),
            location_id: LocationId::new("L1"),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "location_removed");
        assert_eq!(json["location_id"], "L1");
        assert_eq!(change.event_id(), Some(&EventId::new("E1")));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        emit_change(
            &tx,
            ChangeEvent::EventRemoved {
                event_id: EventId::new("E1"),
            },
        );

        let mut rx = tx.subscribe();
        emit_change(
            &tx,
            ChangeEvent::EventAdded {
                event_id: EventId::new("E2"),
            },
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ChangeEvent::EventAdded {
                event_id: EventId::new("E2")
            }
        );
    }
}
