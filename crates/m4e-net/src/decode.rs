//! Response decoding.
//!
//! The webapp wraps every answer in an envelope
//! `{"status":"ok"|"nok","code":..,"description":..,"data":..}`. The
//! envelope is unwrapped first, then `data` is handed to the decoder of the
//! operation's family, which turns the wire DTOs into model types.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use m4e_shared::constants::STATUS_OK;
use m4e_shared::model::{Event, Location, Member, UserInfo, VoteReceipt, VotesRecord};
use m4e_shared::schedule::{EventSchedule, RepeatSchedule, VotingWindow, Weekdays};
use m4e_shared::types::{EventId, LocationId, PhotoRef, Revision, UserId, VotesId};
use m4e_shared::ClientError;

use crate::rest::{Family, Operation, Target};
use crate::transport::RawResponse;

/// Typed result of a successful operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiResponse {
    Events(Vec<Event>),
    Event(Event),
    EventCreated(EventId),
    EventUpdated(EventId),
    EventDeleted(EventId),
    MemberAdded {
        event_id: EventId,
        member_id: UserId,
        revision: Option<Revision>,
    },
    MemberRemoved {
        event_id: EventId,
        member_id: UserId,
        revision: Option<Revision>,
    },
    Location {
        event_id: EventId,
        location: Location,
    },
    LocationPut {
        event_id: EventId,
        location_id: LocationId,
        created: bool,
    },
    LocationRemoved {
        event_id: EventId,
        location_id: LocationId,
    },
    VoteSet(VoteReceipt),
    Votes(Vec<VotesRecord>),
    VotesRecord(VotesRecord),
    User(UserInfo),
    Users(Vec<UserInfo>),
}

impl ApiResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiResponse::Events(_) => "events",
            ApiResponse::Event(_) => "event",
            ApiResponse::EventCreated(_) => "event_created",
            ApiResponse::EventUpdated(_) => "event_updated",
            ApiResponse::EventDeleted(_) => "event_deleted",
            ApiResponse::MemberAdded { .. } => "member_added",
            ApiResponse::MemberRemoved { .. } => "member_removed",
            ApiResponse::Location { .. } => "location",
            ApiResponse::LocationPut { .. } => "location_put",
            ApiResponse::LocationRemoved { .. } => "location_removed",
            ApiResponse::VoteSet(_) => "vote_set",
            ApiResponse::Votes(_) => "votes",
            ApiResponse::VotesRecord(_) => "votes_record",
            ApiResponse::User(_) => "user",
            ApiResponse::Users(_) => "users",
        }
    }
}

/// Turns the `data` member of an `ok` envelope into an [`ApiResponse`].
pub type Decoder = fn(Operation, &Target, Value) -> Result<ApiResponse, ClientError>;

impl Operation {
    pub fn decoder(self) -> Decoder {
        match self.family() {
            Family::Events => decode_events,
            Family::Locations => decode_locations,
            Family::Votes => decode_votes,
            Family::Users => decode_users,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    description: String,
    #[serde(default)]
    data: Value,
}

/// Unwrap the envelope and return its `data`.
///
/// Produces exactly one error for every failure: an undecodable body is a
/// protocol error on a 2xx status and a transport error otherwise, a `nok`
/// envelope is a business error.
pub fn unwrap_envelope(raw: RawResponse) -> Result<Value, ClientError> {
    let envelope: Envelope = match serde_json::from_str(&raw.body) {
        Ok(envelope) => envelope,
        Err(e) if raw.is_success() => {
            return Err(ClientError::Protocol(format!("malformed envelope: {e}")))
        }
        Err(_) => {
            return Err(ClientError::Transport(format!(
                "unexpected HTTP status {}",
                raw.status
            )))
        }
    };

    if envelope.status != STATUS_OK {
        let error_code = envelope
            .data
            .get("errorCode")
            .and_then(id_value)
            .unwrap_or_else(|| envelope.code.to_string());
        return Err(ClientError::Business {
            error_code,
            reason: envelope.description,
        });
    }

    if !raw.is_success() {
        return Err(ClientError::Transport(format!(
            "unexpected HTTP status {}",
            raw.status
        )));
    }

    Ok(envelope.data)
}

/// Full decoding path of one response.
pub fn decode_response(
    operation: Operation,
    target: &Target,
    decoder: Decoder,
    raw: RawResponse,
) -> Result<ApiResponse, ClientError> {
    let data = unwrap_envelope(raw)?;
    decoder(operation, target, data)
}

// Wire DTOs. Ids are exported as strings; numbers are accepted as well.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberDto {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    photo_id: String,
    #[serde(default, rename = "photoETag")]
    photo_etag: String,
}

impl From<MemberDto> for Member {
    fn from(dto: MemberDto) -> Self {
        Member {
            photo: PhotoRef::from_parts(&dto.photo_id, &dto.photo_etag),
            id: UserId(dto.id),
            name: dto.name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationDto {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    photo_id: String,
    #[serde(default, rename = "photoETag")]
    photo_etag: String,
}

impl From<LocationDto> for Location {
    fn from(dto: LocationDto) -> Self {
        Location {
            photo: PhotoRef::from_parts(&dto.photo_id, &dto.photo_etag),
            id: LocationId(dto.id),
            name: dto.name,
            description: dto.description,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventDto {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    public: bool,
    #[serde(default, deserialize_with = "de_opt_id")]
    owner_id: Option<String>,
    #[serde(default)]
    owner_name: String,
    #[serde(default)]
    photo_id: String,
    #[serde(default, rename = "photoETag")]
    photo_etag: String,
    #[serde(default)]
    event_start: i64,
    #[serde(default)]
    repeat_week_days: u8,
    #[serde(default)]
    repeat_day_time: i64,
    #[serde(default)]
    voting_time_begin: i64,
    #[serde(default)]
    members: Vec<MemberDto>,
    #[serde(default)]
    locations: Vec<LocationDto>,
    #[serde(default)]
    revision: u64,
}

impl TryFrom<EventDto> for Event {
    type Error = ClientError;

    fn try_from(dto: EventDto) -> Result<Self, ClientError> {
        let start = timestamp(dto.event_start)?;
        let weekdays = Weekdays(dto.repeat_week_days);
        let repeat = if weekdays.is_empty() {
            None
        } else {
            let secs = u32::try_from(dto.repeat_day_time)
                .ok()
                .and_then(|s| NaiveTime::from_num_seconds_from_midnight_opt(s, 0))
                .ok_or_else(|| {
                    ClientError::Protocol(format!("invalid repeatDayTime {}", dto.repeat_day_time))
                })?;
            Some(RepeatSchedule {
                weekdays,
                day_time: secs,
            })
        };

        Ok(Event {
            id: EventId(dto.id),
            name: dto.name,
            description: dto.description,
            owner: Member {
                id: UserId(dto.owner_id.unwrap_or_default()),
                name: dto.owner_name,
                photo: None,
            },
            is_public: dto.public,
            photo: PhotoRef::from_parts(&dto.photo_id, &dto.photo_etag),
            schedule: EventSchedule {
                start,
                repeat,
                voting_lead: Duration::seconds(dto.voting_time_begin),
            },
            members: dto.members.into_iter().map(Member::from).collect(),
            locations: dto.locations.into_iter().map(Location::from).collect(),
            revision: Revision(dto.revision),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VotesDto {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(deserialize_with = "de_id")]
    event_id: String,
    #[serde(deserialize_with = "de_id")]
    location_id: String,
    vote_time_begin: i64,
    vote_time_end: i64,
    #[serde(default)]
    user_ids: Vec<Value>,
    #[serde(default)]
    user_names: Vec<String>,
}

impl TryFrom<VotesDto> for VotesRecord {
    type Error = ClientError;

    fn try_from(dto: VotesDto) -> Result<Self, ClientError> {
        let window = VotingWindow::new(
            timestamp(dto.vote_time_begin)?,
            timestamp(dto.vote_time_end)?,
        );
        let mut names = dto.user_names.into_iter();
        let voters = dto
            .user_ids
            .iter()
            .map(|id| {
                let id = id_value(id)
                    .ok_or_else(|| ClientError::Protocol(format!("invalid user id {id}")))?;
                Ok(Member {
                    id: UserId(id),
                    name: names.next().unwrap_or_default(),
                    photo: None,
                })
            })
            .collect::<Result<Vec<_>, ClientError>>()?;

        Ok(VotesRecord {
            id: VotesId(dto.id),
            event_id: EventId(dto.event_id),
            location_id: LocationId(dto.location_id),
            window,
            voters,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserDto {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    photo_id: String,
    #[serde(default, rename = "photoETag")]
    photo_etag: String,
}

impl From<UserDto> for UserInfo {
    fn from(dto: UserDto) -> Self {
        UserInfo {
            photo: PhotoRef::from_parts(&dto.photo_id, &dto.photo_etag),
            id: UserId(dto.id),
            name: dto.name,
            email: dto.email.filter(|e| !e.is_empty()),
        }
    }
}

fn decode_events(
    operation: Operation,
    target: &Target,
    data: Value,
) -> Result<ApiResponse, ClientError> {
    match operation {
        Operation::GetEvents => {
            let dtos: Vec<EventDto> = parse(data)?;
            let events = dtos
                .into_iter()
                .map(Event::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ApiResponse::Events(events))
        }
        Operation::GetEvent => Ok(ApiResponse::Event(Event::try_from(parse::<EventDto>(data)?)?)),
        Operation::CreateEvent => Ok(ApiResponse::EventCreated(event_id_of(&data, target)?)),
        Operation::UpdateEvent => Ok(ApiResponse::EventUpdated(event_id_of(&data, target)?)),
        Operation::DeleteEvent => Ok(ApiResponse::EventDeleted(event_id_of(&data, target)?)),
        Operation::AddMember | Operation::RemoveMember => {
            let Target::Member {
                event_id,
                member_id,
            } = target
            else {
                return Err(mismatch(operation, target));
            };
            let event_id = str_field(&data, "eventId").map_or_else(|| event_id.clone(), EventId);
            let member_id =
                str_field(&data, "memberId").map_or_else(|| member_id.clone(), UserId);
            let revision = data.get("revision").and_then(Value::as_u64).map(Revision);
            Ok(if operation == Operation::AddMember {
                ApiResponse::MemberAdded {
                    event_id,
                    member_id,
                    revision,
                }
            } else {
                ApiResponse::MemberRemoved {
                    event_id,
                    member_id,
                    revision,
                }
            })
        }
        other => Err(mismatch(other, target)),
    }
}

fn decode_locations(
    operation: Operation,
    target: &Target,
    data: Value,
) -> Result<ApiResponse, ClientError> {
    match (operation, target) {
        (Operation::GetLocation, Target::Location { event_id, .. }) => {
            Ok(ApiResponse::Location {
                event_id: event_id.clone(),
                location: parse::<LocationDto>(data)?.into(),
            })
        }
        (Operation::PutLocation, Target::LocationPut { event_id, existing }) => {
            let location_id = str_field(&data, "locationId")
                .map(LocationId)
                .or_else(|| existing.clone())
                .ok_or_else(|| ClientError::Protocol("missing locationId".into()))?;
            Ok(ApiResponse::LocationPut {
                event_id: str_field(&data, "eventId").map_or_else(|| event_id.clone(), EventId),
                location_id,
                created: existing.is_none(),
            })
        }
        (
            Operation::RemoveLocation,
            Target::Location {
                event_id,
                location_id,
            },
        ) => Ok(ApiResponse::LocationRemoved {
            event_id: str_field(&data, "eventId").map_or_else(|| event_id.clone(), EventId),
            location_id: str_field(&data, "locationId")
                .map_or_else(|| location_id.clone(), LocationId),
        }),
        (other, target) => Err(mismatch(other, target)),
    }
}

fn decode_votes(
    operation: Operation,
    target: &Target,
    data: Value,
) -> Result<ApiResponse, ClientError> {
    match (operation, target) {
        (
            Operation::SetLocationVote,
            Target::Vote {
                event_id,
                location_id,
                vote,
            },
        ) => Ok(ApiResponse::VoteSet(VoteReceipt {
            event_id: str_field(&data, "eventId").map_or_else(|| event_id.clone(), EventId),
            location_id: str_field(&data, "locationId")
                .map_or_else(|| location_id.clone(), LocationId),
            votes_id: str_field(&data, "votesId").map(VotesId),
            vote: data.get("vote").and_then(Value::as_bool).unwrap_or(*vote),
        })),
        (Operation::GetVotesByTime, Target::TimeRange { .. }) => {
            let dtos: Vec<VotesDto> = parse(data)?;
            let records = dtos
                .into_iter()
                .map(VotesRecord::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ApiResponse::Votes(records))
        }
        (Operation::GetVotesById, Target::Votes(_)) => Ok(ApiResponse::VotesRecord(
            VotesRecord::try_from(parse::<VotesDto>(data)?)?,
        )),
        (other, target) => Err(mismatch(other, target)),
    }
}

fn decode_users(
    operation: Operation,
    target: &Target,
    data: Value,
) -> Result<ApiResponse, ClientError> {
    match operation {
        Operation::GetUser => Ok(ApiResponse::User(parse::<UserDto>(data)?.into())),
        Operation::SearchUsers => {
            let users: Vec<UserDto> = parse(data)?;
            Ok(ApiResponse::Users(users.into_iter().map(UserInfo::from).collect()))
        }
        other => Err(mismatch(other, target)),
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, ClientError> {
    serde_json::from_value(data).map_err(|e| ClientError::Protocol(e.to_string()))
}

fn mismatch(operation: Operation, target: &Target) -> ClientError {
    ClientError::Protocol(format!("{operation} cannot decode for {target:?}"))
}

fn event_id_of(data: &Value, target: &Target) -> Result<EventId, ClientError> {
    str_field(data, "id")
        .or_else(|| str_field(data, "eventId"))
        .map(EventId)
        .or_else(|| target.event_id().cloned())
        .ok_or_else(|| ClientError::Protocol("missing event id".into()))
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, ClientError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ClientError::Protocol(format!("timestamp out of range: {secs}")))
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(id_value).filter(|s| !s.is_empty())
}

/// An id exported either as a string or as a number.
fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let value = Value::deserialize(d)?;
    id_value(&value).ok_or_else(|| serde::de::Error::custom(format!("invalid id {value}")))
}

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(id_value(&value))
}
