use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::types::{EventId, LocationId, Revision, UserId, VotesId};

/// Kind of change a notification reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Out-of-band change pushed by the server.
///
/// Messages carry identities and a revision marker only; anything else the
/// client needs is fetched through the REST surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Notification {
    /// A member joined or left an event.
    MemberChanged {
        change: ChangeKind,
        event_id: EventId,
        member_id: UserId,
        #[serde(default)]
        member_name: Option<String>,
        /// Event revision after the change.
        revision: Revision,
    },

    /// A candidate location was added, edited or removed.
    LocationChanged {
        change: ChangeKind,
        event_id: EventId,
        location_id: LocationId,
        /// Event revision after the change.
        revision: Revision,
    },

    /// A member cast or withdrew a location vote.
    VoteChanged {
        event_id: EventId,
        location_id: LocationId,
        user_id: UserId,
        vote: bool,
        #[serde(default)]
        votes_id: Option<VotesId>,
        /// Revision of the location's vote record after the change.
        revision: Revision,
    },

    /// Chat line posted to an event (or directly to the user).
    ChatMessage(ChatMessage),
}

/// A chat line relayed by the notification channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender_id: UserId,
    pub sender_name: String,
    #[serde(default)]
    pub event_id: Option<EventId>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Event the notification is about, if any.
    pub fn event_id(&self) -> Option<&EventId> {
        match self {
            Notification::MemberChanged { event_id, .. }
            | Notification::LocationChanged { event_id, .. }
            | Notification::VoteChanged { event_id, .. } => Some(event_id),
            Notification::ChatMessage(chat) => chat.event_id.as_ref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::MemberChanged { .. } => "member_changed",
            Notification::LocationChanged { .. } => "location_changed",
            Notification::VoteChanged { .. } => "vote_changed",
            Notification::ChatMessage(_) => "chat_message",
        }
    }

    pub fn to_json(&self) -> Result<String, ClientError> {
        serde_json::to_string(self).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ClientError> {
        serde_json::from_str(text).map_err(|e| ClientError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_member_changed() {
        let json = r#"{"type":"memberChanged","change":"added","eventId":"E1","memberId":"U7","revision":4}"#;
        let msg = Notification::from_json(json).unwrap();
        assert_eq!(
            msg,
            Notification::MemberChanged {
                change: ChangeKind::Added,
                event_id: EventId::new("E1"),
                member_id: UserId::new("U7"),
                member_name: None,
                revision: Revision(4),
            }
        );
        assert_eq!(msg.event_id(), Some(&EventId::new("E1")));
    }

    #[test]
    fn test_decode_chat_message() {
        let json = r#"{"type":"chatMessage","senderId":"U2","senderName":"bob","eventId":"E1","text":"hi","timestamp":"2026-03-02T11:00:00Z"}"#;
        let msg = Notification::from_json(json).unwrap();
        assert_eq!(msg.kind(), "chat_message");
        assert_eq!(msg.event_id(), Some(&EventId::new("E1")));
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = Notification::from_json(r#"{"type":"buzz"}"#).unwrap_err();
        assert_eq!(err.error_code(), "protocol");
    }
}
