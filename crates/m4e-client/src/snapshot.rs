//! Client-side view of the server state.
//!
//! The snapshot is owned by the session actor and published to readers as
//! an immutable copy. Every transition is idempotent and reports the
//! changes it made, so replayed responses and duplicate notifications are
//! harmless.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use m4e_net::Request;
use m4e_shared::model::{Event, EventDraft, Location, Member, VoteLedger, VotesRecord};
use m4e_shared::protocol::{ChangeKind, Notification};
use m4e_shared::schedule::VotingWindow;
use m4e_shared::types::{EventId, LocationId, Revision, UserId, VotesId};
use m4e_shared::ClientError;

use crate::events::ChangeEvent;

/// Events known to the session and their current vote ledgers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    events: Vec<Event>,
    ledgers: BTreeMap<EventId, VoteLedger>,
}

/// Outcome of applying one notification.
#[derive(Debug, Default)]
pub struct Applied {
    pub changes: Vec<ChangeEvent>,
    /// Request that fetches what the notification only referenced.
    pub follow_up: Option<Request>,
}

impl Snapshot {
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn event(&self, id: &EventId) -> Option<&Event> {
        self.events.iter().find(|e| &e.id == id)
    }

    fn event_mut(&mut self, id: &EventId) -> Option<&mut Event> {
        self.events.iter_mut().find(|e| &e.id == id)
    }

    pub fn location(&self, event_id: &EventId, location_id: &LocationId) -> Option<&Location> {
        self.event(event_id).and_then(|e| e.location(location_id))
    }

    /// Ledger of the event's current (or most recent) voting occurrence.
    pub fn ledger(&self, event_id: &EventId) -> Option<&VoteLedger> {
        self.ledgers.get(event_id)
    }

    /// Merge a full event list.
    ///
    /// An event already held at a newer revision than the listed one keeps
    /// its local state; events missing from the list are dropped.
    pub fn merge_events(&mut self, listed: Vec<Event>) -> Vec<ChangeEvent> {
        let mut changes = Vec::new();

        let stale: Vec<EventId> = self
            .events
            .iter()
            .filter(|e| !listed.iter().any(|l| l.id == e.id))
            .map(|e| e.id.clone())
            .collect();
        for id in stale {
            changes.extend(self.remove_event(&id));
        }

        let mut merged = Vec::with_capacity(listed.len());
        for incoming in listed {
            match self.event(&incoming.id) {
                Some(existing) if existing.revision.is_newer_than(incoming.revision) => {
                    debug!(
                        event_id = %incoming.id,
                        local = %existing.revision,
                        listed = %incoming.revision,
                        "Keeping newer local event"
                    );
                    merged.push(existing.clone());
                }
                Some(existing) if *existing == incoming => merged.push(incoming),
                Some(_) => {
                    changes.push(ChangeEvent::EventUpdated {
                        event_id: incoming.id.clone(),
                    });
                    merged.push(incoming);
                }
                None => {
                    changes.push(ChangeEvent::EventAdded {
                        event_id: incoming.id.clone(),
                    });
                    merged.push(incoming);
                }
            }
        }
        self.events = merged;
        changes
    }

    /// Insert or replace one event unless a newer revision is held.
    pub fn upsert_event(&mut self, incoming: Event) -> Vec<ChangeEvent> {
        match self.event_mut(&incoming.id) {
            Some(existing) if existing.revision.is_newer_than(incoming.revision) => vec![],
            Some(existing) if *existing == incoming => vec![],
            Some(existing) => {
                let event_id = incoming.id.clone();
                *existing = incoming;
                vec![ChangeEvent::EventUpdated { event_id }]
            }
            None => {
                let event_id = incoming.id.clone();
                self.events.push(incoming);
                vec![ChangeEvent::EventAdded { event_id }]
            }
        }
    }

    /// Apply the submitted fields of a confirmed update.
    pub fn apply_event_update(&mut self, id: &EventId, draft: &EventDraft) -> Vec<ChangeEvent> {
        let Some(event) = self.event_mut(id) else {
            return vec![];
        };
        let before = event.clone();
        event.name = draft.name.clone();
        event.description = draft.description.clone();
        event.is_public = draft.is_public;
        event.schedule = draft.schedule;
        if *event == before {
            return vec![];
        }
        vec![ChangeEvent::EventUpdated {
            event_id: id.clone(),
        }]
    }

    /// Remove an event together with its locations and ledger.
    pub fn remove_event(&mut self, id: &EventId) -> Vec<ChangeEvent> {
        let before = self.events.len();
        self.events.retain(|e| &e.id != id);
        self.ledgers.remove(id);
        if self.events.len() == before {
            return vec![];
        }
        vec![ChangeEvent::EventRemoved {
            event_id: id.clone(),
        }]
    }

    pub fn add_member(
        &mut self,
        event_id: &EventId,
        member: Member,
        revision: Option<Revision>,
    ) -> Vec<ChangeEvent> {
        let Some(event) = self.event_mut(event_id) else {
            return vec![];
        };
        if let Some(revision) = revision {
            event.bump_revision(revision);
        }
        let member_id = member.id.clone();
        if event.add_member(member) {
            vec![ChangeEvent::MemberAdded {
                event_id: event_id.clone(),
                member_id,
            }]
        } else {
            vec![]
        }
    }

    /// Remove a member. Removing the session user drops the whole event,
    /// which is no longer visible to them.
    pub fn remove_member(
        &mut self,
        event_id: &EventId,
        member_id: &UserId,
        session_user: &UserId,
        revision: Option<Revision>,
    ) -> Vec<ChangeEvent> {
        if member_id == session_user {
            return self.remove_event(event_id);
        }
        let Some(event) = self.event_mut(event_id) else {
            return vec![];
        };
        if let Some(revision) = revision {
            event.bump_revision(revision);
        }
        if event.remove_member(member_id) {
            vec![ChangeEvent::MemberRemoved {
                event_id: event_id.clone(),
                member_id: member_id.clone(),
            }]
        } else {
            vec![]
        }
    }

    pub fn upsert_location(&mut self, event_id: &EventId, location: Location) -> Vec<ChangeEvent> {
        let Some(event) = self.event_mut(event_id) else {
            return vec![];
        };
        let location_id = location.id.clone();
        if event.upsert_location(location) {
            vec![ChangeEvent::LocationUpdated {
                event_id: event_id.clone(),
                location_id,
            }]
        } else {
            vec![]
        }
    }

    /// Remove a location and every vote recorded for it.
    pub fn remove_location(
        &mut self,
        event_id: &EventId,
        location_id: &LocationId,
    ) -> Vec<ChangeEvent> {
        if let Some(ledger) = self.ledgers.get_mut(event_id) {
            ledger.drop_location(location_id);
        }
        let removed = self
            .event_mut(event_id)
            .is_some_and(|e| e.remove_location(location_id));
        if removed {
            vec![ChangeEvent::LocationRemoved {
                event_id: event_id.clone(),
                location_id: location_id.clone(),
            }]
        } else {
            vec![]
        }
    }

    /// Retire the event's ledger and start an empty one for `window`.
    pub fn install_ledger(&mut self, event_id: &EventId, window: VotingWindow) {
        self.ledgers
            .insert(event_id.clone(), VoteLedger::new(event_id.clone(), window));
    }

    /// Record a confirmed vote of `user` cast during `window`.
    ///
    /// Ignored when the ledger has moved on to another occurrence or the
    /// location no longer belongs to the event.
    pub fn record_vote(
        &mut self,
        event_id: &EventId,
        location_id: &LocationId,
        user: &UserId,
        vote: bool,
        votes_id: Option<VotesId>,
        window: VotingWindow,
    ) -> Vec<ChangeEvent> {
        if !self.holds_location(event_id, location_id) {
            debug!(event_id = %event_id, location_id = %location_id, "Confirmed vote for a removed location dropped");
            return vec![];
        }
        let Some(ledger) = self.ledgers.get_mut(event_id) else {
            debug!(event_id = %event_id, "No ledger for confirmed vote");
            return vec![];
        };
        if ledger.window != window {
            debug!(event_id = %event_id, cast = %window, current = %ledger.window, "Confirmed vote of a past occurrence dropped");
            return vec![];
        }
        if ledger.set_vote(location_id, user, vote, votes_id) {
            vec![ChangeEvent::VotesChanged {
                event_id: event_id.clone(),
                location_id: location_id.clone(),
            }]
        } else {
            vec![]
        }
    }

    /// Merge server vote records. Records of another occurrence than the
    /// ledger's are ignored.
    pub fn merge_votes<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a VotesRecord>,
    ) -> Vec<ChangeEvent> {
        let mut changes = Vec::new();
        for record in records {
            let known = self.holds_location(&record.event_id, &record.location_id);
            let Some(ledger) = self.ledgers.get_mut(&record.event_id) else {
                continue;
            };
            if known && ledger.merge_record(record) {
                changes.push(ChangeEvent::VotesChanged {
                    event_id: record.event_id.clone(),
                    location_id: record.location_id.clone(),
                });
            }
        }
        changes
    }

    /// Apply a server notification.
    ///
    /// `voting_open` tells whether the event named by a vote change
    /// currently accepts votes. Fails with `NotFound` when the notification
    /// names an event (or ledger) the snapshot does not hold.
    pub fn apply_notification(
        &mut self,
        notification: &Notification,
        session_user: &UserId,
        voting_open: bool,
    ) -> Result<Applied, ClientError> {
        match notification {
            Notification::MemberChanged {
                change,
                event_id,
                member_id,
                member_name,
                revision,
            } => {
                if !self.accepts_event_revision(event_id, *revision)? {
                    return Ok(Applied::default());
                }
                let changes = match change {
                    ChangeKind::Removed => {
                        self.remove_member(event_id, member_id, session_user, Some(*revision))
                    }
                    ChangeKind::Added | ChangeKind::Modified => {
                        let member = Member {
                            name: member_name.clone().unwrap_or_default(),
                            ..Member::with_id(member_id.clone())
                        };
                        self.add_member(event_id, member, Some(*revision))
                    }
                };
                Ok(Applied {
                    changes,
                    follow_up: None,
                })
            }

            Notification::LocationChanged {
                change,
                event_id,
                location_id,
                revision,
            } => {
                if !self.accepts_event_revision(event_id, *revision)? {
                    return Ok(Applied::default());
                }
                if let Some(event) = self.event_mut(event_id) {
                    event.bump_revision(*revision);
                }
                match change {
                    ChangeKind::Removed => Ok(Applied {
                        changes: self.remove_location(event_id, location_id),
                        follow_up: None,
                    }),
                    ChangeKind::Added | ChangeKind::Modified => Ok(Applied {
                        changes: vec![],
                        follow_up: Some(Request::GetLocation {
                            event_id: event_id.clone(),
                            location_id: location_id.clone(),
                        }),
                    }),
                }
            }

            Notification::VoteChanged {
                event_id,
                location_id,
                user_id,
                vote,
                votes_id,
                revision,
            } => {
                if self.event(event_id).is_none() {
                    return Err(ClientError::NotFound(format!("event {event_id}")));
                }
                if !self.holds_location(event_id, location_id) {
                    return Err(ClientError::NotFound(format!(
                        "location {location_id} of event {event_id}"
                    )));
                }
                if !voting_open {
                    debug!(event_id = %event_id, "Vote change outside the voting window ignored");
                    return Ok(Applied::default());
                }
                let ledger = self
                    .ledgers
                    .get_mut(event_id)
                    .ok_or_else(|| ClientError::NotFound(format!("vote ledger of {event_id}")))?;
                let changed =
                    ledger.apply_vote_change(location_id, user_id, *vote, votes_id.clone(), *revision);
                Ok(Applied {
                    changes: if changed {
                        vec![ChangeEvent::VotesChanged {
                            event_id: event_id.clone(),
                            location_id: location_id.clone(),
                        }]
                    } else {
                        vec![]
                    },
                    follow_up: None,
                })
            }

            Notification::ChatMessage(chat) => Ok(Applied {
                changes: vec![ChangeEvent::Chat(chat.clone())],
                follow_up: None,
            }),
        }
    }

    fn holds_location(&self, event_id: &EventId, location_id: &LocationId) -> bool {
        self.event(event_id)
            .is_some_and(|e| e.location(location_id).is_some())
    }

    /// Whether a change at `revision` is newer than what the event holds.
    fn accepts_event_revision(
        &self,
        event_id: &EventId,
        revision: Revision,
    ) -> Result<bool, ClientError> {
        let event = self
            .event(event_id)
            .ok_or_else(|| ClientError::NotFound(format!("event {event_id}")))?;
        if revision.is_newer_than(event.revision) {
            Ok(true)
        } else {
            debug!(
                event_id = %event_id,
                held = %event.revision,
                received = %revision,
                "Change already reflected in snapshot"
            );
            Ok(false)
        }
    }
}
