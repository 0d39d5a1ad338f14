//! The webapp's REST surface.
//!
//! Every call the client can make is a [`Request`] variant. A request knows
//! its HTTP verb, resource path and JSON body, and which [`Operation`] (and
//! therefore which decoder) it belongs to.

use chrono::{DateTime, Timelike, Utc};
use reqwest::Method;
use serde_json::{json, Value};

use m4e_shared::model::{EventDraft, LocationDraft};
use m4e_shared::types::{EventId, LocationId, UserId, VotesId};
use m4e_shared::ClientError;

/// Operation kind, the correlation tag of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetEvents,
    GetEvent,
    CreateEvent,
    UpdateEvent,
    DeleteEvent,
    AddMember,
    RemoveMember,
    GetLocation,
    PutLocation,
    RemoveLocation,
    SetLocationVote,
    GetVotesByTime,
    GetVotesById,
    GetUser,
    SearchUsers,
}

/// Decoder family an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Events,
    Locations,
    Votes,
    Users,
}

impl Operation {
    pub fn family(self) -> Family {
        match self {
            Operation::GetEvents
            | Operation::GetEvent
            | Operation::CreateEvent
            | Operation::UpdateEvent
            | Operation::DeleteEvent
            | Operation::AddMember
            | Operation::RemoveMember => Family::Events,
            Operation::GetLocation | Operation::PutLocation | Operation::RemoveLocation => {
                Family::Locations
            }
            Operation::SetLocationVote | Operation::GetVotesByTime | Operation::GetVotesById => {
                Family::Votes
            }
            Operation::GetUser | Operation::SearchUsers => Family::Users,
        }
    }

    /// Whether a successful result changes server state.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Operation::CreateEvent
                | Operation::UpdateEvent
                | Operation::DeleteEvent
                | Operation::AddMember
                | Operation::RemoveMember
                | Operation::PutLocation
                | Operation::RemoveLocation
                | Operation::SetLocationVote
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Identities a request is about, kept with the pending request so the
/// result can be attributed even when the response omits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    None,
    Event(EventId),
    Member {
        event_id: EventId,
        member_id: UserId,
    },
    Location {
        event_id: EventId,
        location_id: LocationId,
    },
    /// `existing` is set when the put updates a known location.
    LocationPut {
        event_id: EventId,
        existing: Option<LocationId>,
    },
    Vote {
        event_id: EventId,
        location_id: LocationId,
        vote: bool,
    },
    TimeRange {
        event_id: EventId,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Votes(VotesId),
    User(UserId),
    Search(String),
}

impl Target {
    pub fn event_id(&self) -> Option<&EventId> {
        match self {
            Target::Event(event_id)
            | Target::Member { event_id, .. }
            | Target::Location { event_id, .. }
            | Target::LocationPut { event_id, .. }
            | Target::Vote { event_id, .. }
            | Target::TimeRange { event_id, .. } => Some(event_id),
            Target::None | Target::Votes(_) | Target::User(_) | Target::Search(_) => None,
        }
    }
}

/// A call against the REST surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetEvents,
    GetEvent {
        event_id: EventId,
    },
    CreateEvent {
        draft: EventDraft,
    },
    UpdateEvent {
        event_id: EventId,
        draft: EventDraft,
    },
    DeleteEvent {
        event_id: EventId,
    },
    AddMember {
        event_id: EventId,
        member_id: UserId,
    },
    RemoveMember {
        event_id: EventId,
        member_id: UserId,
    },
    GetLocation {
        event_id: EventId,
        location_id: LocationId,
    },
    /// Create (no id in the draft) or update (id present) a location.
    PutLocation {
        event_id: EventId,
        location: LocationDraft,
    },
    RemoveLocation {
        event_id: EventId,
        location_id: LocationId,
    },
    SetLocationVote {
        event_id: EventId,
        location_id: LocationId,
        vote: bool,
    },
    GetVotesByTime {
        event_id: EventId,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    GetVotesById {
        votes_id: VotesId,
    },
    GetUser {
        user_id: UserId,
    },
    SearchUsers {
        keyword: String,
    },
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::GetEvents => Operation::GetEvents,
            Request::GetEvent { .. } => Operation::GetEvent,
            Request::CreateEvent { .. } => Operation::CreateEvent,
            Request::UpdateEvent { .. } => Operation::UpdateEvent,
            Request::DeleteEvent { .. } => Operation::DeleteEvent,
            Request::AddMember { .. } => Operation::AddMember,
            Request::RemoveMember { .. } => Operation::RemoveMember,
            Request::GetLocation { .. } => Operation::GetLocation,
            Request::PutLocation { .. } => Operation::PutLocation,
            Request::RemoveLocation { .. } => Operation::RemoveLocation,
            Request::SetLocationVote { .. } => Operation::SetLocationVote,
            Request::GetVotesByTime { .. } => Operation::GetVotesByTime,
            Request::GetVotesById { .. } => Operation::GetVotesById,
            Request::GetUser { .. } => Operation::GetUser,
            Request::SearchUsers { .. } => Operation::SearchUsers,
        }
    }

    pub fn target(&self) -> Target {
        match self {
            Request::GetEvents | Request::CreateEvent { .. } => Target::None,
            Request::GetEvent { event_id }
            | Request::UpdateEvent { event_id, .. }
            | Request::DeleteEvent { event_id } => Target::Event(event_id.clone()),
            Request::AddMember {
                event_id,
                member_id,
            }
            | Request::RemoveMember {
                event_id,
                member_id,
            } => Target::Member {
                event_id: event_id.clone(),
                member_id: member_id.clone(),
            },
            Request::GetLocation {
                event_id,
                location_id,
            }
            | Request::RemoveLocation {
                event_id,
                location_id,
            } => Target::Location {
                event_id: event_id.clone(),
                location_id: location_id.clone(),
            },
            Request::PutLocation { event_id, location } => Target::LocationPut {
                event_id: event_id.clone(),
                existing: location.id.clone().filter(|id| !id.is_empty()),
            },
            Request::SetLocationVote {
                event_id,
                location_id,
                vote,
            } => Target::Vote {
                event_id: event_id.clone(),
                location_id: location_id.clone(),
                vote: *vote,
            },
            Request::GetVotesByTime {
                event_id,
                begin,
                end,
            } => Target::TimeRange {
                event_id: event_id.clone(),
                begin: *begin,
                end: *end,
            },
            Request::GetVotesById { votes_id } => Target::Votes(votes_id.clone()),
            Request::GetUser { user_id } => Target::User(user_id.clone()),
            Request::SearchUsers { keyword } => Target::Search(keyword.clone()),
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Request::GetEvents
            | Request::GetEvent { .. }
            | Request::GetLocation { .. }
            | Request::GetVotesByTime { .. }
            | Request::GetVotesById { .. }
            | Request::GetUser { .. }
            | Request::SearchUsers { .. } => Method::GET,
            Request::CreateEvent { .. } | Request::RemoveLocation { .. } => Method::POST,
            Request::UpdateEvent { .. }
            | Request::AddMember { .. }
            | Request::RemoveMember { .. }
            | Request::PutLocation { .. }
            | Request::SetLocationVote { .. } => Method::PUT,
            Request::DeleteEvent { .. } => Method::DELETE,
        }
    }

    /// Path segments below `/rest`, unescaped.
    pub fn path_segments(&self) -> Vec<String> {
        fn segs(parts: &[&str]) -> Vec<String> {
            parts.iter().map(|p| p.to_string()).collect()
        }

        match self {
            Request::GetEvents => segs(&["events"]),
            Request::GetEvent { event_id }
            | Request::UpdateEvent { event_id, .. }
            | Request::DeleteEvent { event_id } => segs(&["events", event_id.as_str()]),
            Request::CreateEvent { .. } => segs(&["events", "create"]),
            Request::AddMember {
                event_id,
                member_id,
            } => segs(&["events", "addmember", event_id.as_str(), member_id.as_str()]),
            Request::RemoveMember {
                event_id,
                member_id,
            } => segs(&["events", "removemember", event_id.as_str(), member_id.as_str()]),
            Request::GetLocation {
                event_id,
                location_id,
            } => segs(&["events", "location", event_id.as_str(), location_id.as_str()]),
            Request::PutLocation { event_id, .. } => {
                segs(&["events", "putlocation", event_id.as_str()])
            }
            Request::RemoveLocation {
                event_id,
                location_id,
            } => segs(&[
                "events",
                "removelocation",
                event_id.as_str(),
                location_id.as_str(),
            ]),
            Request::SetLocationVote {
                event_id,
                location_id,
                vote,
            } => segs(&[
                "locationvoting",
                "setvote",
                event_id.as_str(),
                location_id.as_str(),
                if *vote { "1" } else { "0" },
            ]),
            Request::GetVotesByTime {
                event_id,
                begin,
                end,
            } => vec![
                "locationvoting".to_string(),
                "getvotes".to_string(),
                event_id.to_string(),
                begin.timestamp().to_string(),
                end.timestamp().to_string(),
            ],
            Request::GetVotesById { votes_id } => {
                segs(&["locationvoting", "getvotes", votes_id.as_str()])
            }
            Request::GetUser { user_id } => segs(&["users", user_id.as_str()]),
            Request::SearchUsers { keyword } => segs(&["users", "search", keyword.as_str()]),
        }
    }

    /// JSON body, for the calls that carry one.
    pub fn body(&self) -> Option<String> {
        match self {
            Request::CreateEvent { draft } => Some(event_json(None, draft).to_string()),
            Request::UpdateEvent { event_id, draft } => {
                Some(event_json(Some(event_id), draft).to_string())
            }
            Request::PutLocation { location, .. } => Some(location_json(location).to_string()),
            _ => None,
        }
    }

    /// Reject requests the server would refuse anyway.
    pub fn validate(&self) -> Result<(), ClientError> {
        match self {
            Request::PutLocation { location, .. } if location.name.trim().is_empty() => Err(
                ClientError::InvalidRequest("location name must not be empty".into()),
            ),
            Request::CreateEvent { draft } | Request::UpdateEvent { draft, .. }
                if draft.name.trim().is_empty() =>
            {
                Err(ClientError::InvalidRequest("event name must not be empty".into()))
            }
            Request::SearchUsers { keyword } if keyword.trim().is_empty() => Err(
                ClientError::InvalidRequest("search keyword must not be empty".into()),
            ),
            _ => Ok(()),
        }
    }
}

fn event_json(id: Option<&EventId>, draft: &EventDraft) -> Value {
    let schedule = &draft.schedule;
    let (weekdays, day_time) = match schedule.repeat {
        Some(repeat) => (
            repeat.weekdays.0,
            i64::from(repeat.day_time.num_seconds_from_midnight()),
        ),
        None => (0, 0),
    };

    let mut body = json!({
        "name": draft.name,
        "description": draft.description,
        "public": draft.is_public,
        "eventStart": schedule.start.timestamp(),
        "repeatWeekDays": weekdays,
        "repeatDayTime": day_time,
        "votingTimeBegin": schedule.voting_lead.num_seconds(),
    });
    if let Some(id) = id {
        body["id"] = json!(id);
    }
    body
}

/// The server truncates longer values; sending them cut keeps the snapshot
/// consistent with what it stores.
fn location_json(location: &LocationDraft) -> Value {
    let location = location.truncated();
    let mut body = json!({
        "name": location.name,
        "description": location.description,
    });
    if let Some(id) = location.id.as_ref().filter(|id| !id.is_empty()) {
        body["id"] = json!(id);
    }
    if let Some(photo) = &location.photo_base64 {
        body["photo"] = json!(photo);
    }
    body
}
