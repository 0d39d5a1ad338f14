//! Domain model held in the client snapshot.
//!
//! Every mutator returns whether it changed anything so callers can apply
//! the same delta repeatedly and only report real changes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_LOCATION_DESCRIPTION_LEN, MAX_LOCATION_NAME_LEN};
use crate::schedule::{EventSchedule, VotingWindow};
use crate::types::{EventId, LocationId, PhotoRef, Revision, UserId, VotesId};

/// A member (or the owner) of an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub id: UserId,
    pub name: String,
    pub photo: Option<PhotoRef>,
}

impl Member {
    /// A member known only by identity, e.g. from a notification.
    pub fn with_id(id: UserId) -> Self {
        Self {
            id,
            name: String::new(),
            photo: None,
        }
    }
}

/// A candidate venue of an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub description: String,
    pub photo: Option<PhotoRef>,
}

/// A planned gathering with members and candidate locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub description: String,
    pub owner: Member,
    pub is_public: bool,
    pub photo: Option<PhotoRef>,
    pub schedule: EventSchedule,
    pub members: Vec<Member>,
    pub locations: Vec<Location>,
    pub revision: Revision,
}

impl Event {
    pub fn has_member(&self, id: &UserId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    /// Insert a member, keeping insertion order. No-op if already present.
    pub fn add_member(&mut self, member: Member) -> bool {
        if self.has_member(&member.id) {
            return false;
        }
        self.members.push(member);
        true
    }

    pub fn remove_member(&mut self, id: &UserId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| &m.id != id);
        self.members.len() != before
    }

    pub fn location(&self, id: &LocationId) -> Option<&Location> {
        self.locations.iter().find(|l| &l.id == id)
    }

    /// Insert or replace a location. Returns `true` if anything changed.
    pub fn upsert_location(&mut self, location: Location) -> bool {
        match self.locations.iter_mut().find(|l| l.id == location.id) {
            Some(existing) if *existing == location => false,
            Some(existing) => {
                *existing = location;
                true
            }
            None => {
                self.locations.push(location);
                true
            }
        }
    }

    pub fn remove_location(&mut self, id: &LocationId) -> bool {
        let before = self.locations.len();
        self.locations.retain(|l| &l.id != id);
        self.locations.len() != before
    }

    /// Raise the revision marker; never lowers it.
    pub fn bump_revision(&mut self, revision: Revision) {
        if revision.is_newer_than(self.revision) {
            self.revision = revision;
        }
    }
}

/// Fields submitted when creating or updating an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventDraft {
    pub name: String,
    pub description: String,
    pub is_public: bool,
    pub schedule: EventSchedule,
}

/// An existing event's editable fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventUpdate {
    pub id: EventId,
    pub draft: EventDraft,
}

/// Location body for the combined add/update endpoint.
///
/// Without an `id` the server creates a new location, with one it updates
/// the existing location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocationDraft {
    pub id: Option<LocationId>,
    pub name: String,
    pub description: String,
    /// Base64 encoded image, uploaded as the location's new photo.
    pub photo_base64: Option<String>,
}

impl LocationDraft {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: description.into(),
            photo_base64: None,
        }
    }

    pub fn for_existing(id: LocationId, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            ..Self::new(name, description)
        }
    }

    pub fn is_update(&self) -> bool {
        self.id.as_ref().is_some_and(|id| !id.is_empty())
    }

    /// Name and description cut to the lengths the server stores.
    pub fn truncated(&self) -> LocationDraft {
        LocationDraft {
            name: self.name.chars().take(MAX_LOCATION_NAME_LEN).collect(),
            description: self
                .description
                .chars()
                .take(MAX_LOCATION_DESCRIPTION_LEN)
                .collect(),
            ..self.clone()
        }
    }
}

/// Public profile of a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub photo: Option<PhotoRef>,
}

/// Server record of the votes one location received in one occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VotesRecord {
    pub id: VotesId,
    pub event_id: EventId,
    pub location_id: LocationId,
    pub window: VotingWindow,
    pub voters: Vec<Member>,
}

/// Receipt of a confirmed `set vote` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteReceipt {
    pub event_id: EventId,
    pub location_id: LocationId,
    pub votes_id: Option<VotesId>,
    pub vote: bool,
}

/// Votes for a single location inside a ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocationVotes {
    pub votes_id: Option<VotesId>,
    pub voters: BTreeSet<UserId>,
    pub revision: Revision,
}

/// Which members voted for which locations during one voting occurrence.
///
/// A ledger is never carried over into another occurrence: when a new
/// window opens the previous ledger is replaced by an empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteLedger {
    pub event_id: EventId,
    pub window: VotingWindow,
    entries: BTreeMap<LocationId, LocationVotes>,
}

impl VoteLedger {
    pub fn new(event_id: EventId, window: VotingWindow) -> Self {
        Self {
            event_id,
            window,
            entries: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|e| e.voters.is_empty())
    }

    pub fn entry(&self, location_id: &LocationId) -> Option<&LocationVotes> {
        self.entries.get(location_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&LocationId, &LocationVotes)> {
        self.entries.iter()
    }

    pub fn has_voted(&self, location_id: &LocationId, user: &UserId) -> bool {
        self.entries
            .get(location_id)
            .is_some_and(|e| e.voters.contains(user))
    }

    pub fn vote_count(&self, location_id: &LocationId) -> usize {
        self.entries.get(location_id).map_or(0, |e| e.voters.len())
    }

    /// Record a confirmed vote of `user`. Returns `true` if the ledger changed.
    pub fn set_vote(
        &mut self,
        location_id: &LocationId,
        user: &UserId,
        vote: bool,
        votes_id: Option<VotesId>,
    ) -> bool {
        let entry = self.entries.entry(location_id.clone()).or_default();
        if votes_id.is_some() && entry.votes_id != votes_id {
            entry.votes_id = votes_id;
        }
        if vote {
            entry.voters.insert(user.clone())
        } else {
            entry.voters.remove(user)
        }
    }

    /// Apply a pushed vote change. Ignored unless `revision` is newer than
    /// the location's marker; returns whether the voter set changed.
    pub fn apply_vote_change(
        &mut self,
        location_id: &LocationId,
        user: &UserId,
        vote: bool,
        votes_id: Option<VotesId>,
        revision: Revision,
    ) -> bool {
        let current = self
            .entries
            .get(location_id)
            .map(|e| e.revision)
            .unwrap_or_default();
        if !revision.is_newer_than(current) {
            return false;
        }
        let changed = self.set_vote(location_id, user, vote, votes_id);
        if let Some(entry) = self.entries.get_mut(location_id) {
            entry.revision = revision;
        }
        changed
    }

    /// Merge a server record into the ledger.
    ///
    /// Records of another occurrence are rejected. A record replaces the
    /// voter set unless a pushed change already advanced that location's
    /// revision, since server records carry no revision of their own.
    pub fn merge_record(&mut self, record: &VotesRecord) -> bool {
        if record.window != self.window || record.event_id != self.event_id {
            return false;
        }
        let entry = self.entries.entry(record.location_id.clone()).or_default();
        let voters: BTreeSet<UserId> = record.voters.iter().map(|m| m.id.clone()).collect();
        let mut changed = false;
        if entry.votes_id.as_ref() != Some(&record.id) {
            entry.votes_id = Some(record.id.clone());
            changed = true;
        }
        if entry.revision == Revision::default() && entry.voters != voters {
            entry.voters = voters;
            changed = true;
        }
        changed
    }

    pub fn drop_location(&mut self, location_id: &LocationId) -> bool {
        self.entries.remove(location_id).is_some()
    }
}
