//! The session actor.
//!
//! A single task owns the [`Snapshot`]. Commands from client handles,
//! request completions, server notifications and voting timer ticks are
//! multiplexed in one `select!` loop and applied one at a time, so no two
//! snapshot transitions ever overlap. Readers receive immutable copies
//! through a `watch` channel and change events through a `broadcast`
//! channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use m4e_net::{ApiResponse, Completion, Dispatcher, NotificationSource, Operation, PendingCall, Request, RequestId};
use m4e_shared::model::{Event, Location, Member, VoteReceipt};
use m4e_shared::protocol::Notification;
use m4e_shared::schedule::VotingWindow;
use m4e_shared::types::{EventId, LocationId, Revision, UserId};
use m4e_shared::{ClientError, Result};

use crate::clock::Clock;
use crate::events::{emit_change, ChangeEvent};
use crate::snapshot::Snapshot;
use crate::voting::{Transition, VotingMachine};

type VoteKey = (EventId, LocationId);
type VoteReply = oneshot::Sender<Result<VoteReceipt>>;

/// Messages from client handles to the session.
pub(crate) enum Command {
    Call {
        request: Request,
        reply: oneshot::Sender<Result<ApiResponse>>,
    },
    Vote {
        event_id: EventId,
        location_id: LocationId,
        vote: bool,
        reply: VoteReply,
    },
    EvaluateVoting {
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

enum Reply {
    Caller(oneshot::Sender<Result<ApiResponse>>),
    Vote(VoteKey),
    /// Follow-up fetches started by the session itself.
    Internal,
}

struct Waiter {
    request: Request,
    reply: Reply,
}

/// The vote call in flight for one `(event, location)` and the calls
/// waiting behind it.
struct VoteSlot {
    vote: bool,
    /// Occurrence the call was cast in.
    window: VotingWindow,
    waiters: Vec<VoteReply>,
    queued: VecDeque<QueuedVote>,
}

struct QueuedVote {
    vote: bool,
    window: VotingWindow,
    waiters: Vec<VoteReply>,
}

impl VoteSlot {
    /// Same value and occurrence as the call in flight: share its result.
    /// Otherwise wait for it to resolve, joining the last queued call if it
    /// matches.
    fn enqueue(&mut self, vote: bool, window: VotingWindow, reply: VoteReply) {
        if self.queued.is_empty() && vote == self.vote && window == self.window {
            self.waiters.push(reply);
            return;
        }
        match self.queued.back_mut() {
            Some(last) if last.vote == vote && last.window == window => last.waiters.push(reply),
            _ => self.queued.push_back(QueuedVote {
                vote,
                window,
                waiters: vec![reply],
            }),
        }
    }
}

pub(crate) fn unexpected(response: &ApiResponse) -> ClientError {
    ClientError::Protocol(format!("unexpected {} response", response.kind()))
}

pub(crate) struct Session {
    user_id: UserId,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    source: Box<dyn NotificationSource>,
    snapshot: Snapshot,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    changes_tx: broadcast::Sender<ChangeEvent>,
    in_flight: FuturesUnordered<PendingCall>,
    waiters: HashMap<RequestId, Waiter>,
    voting: HashMap<EventId, VotingMachine>,
    votes: HashMap<VoteKey, VoteSlot>,
    /// Notifications for events a pending list request may still deliver.
    parked: Vec<Notification>,
    lists_in_flight: usize,
}

impl Session {
    pub(crate) fn new(
        user_id: UserId,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        source: Box<dyn NotificationSource>,
        snapshot_tx: watch::Sender<Arc<Snapshot>>,
        changes_tx: broadcast::Sender<ChangeEvent>,
    ) -> Self {
        Self {
            user_id,
            dispatcher,
            clock,
            source,
            snapshot: Snapshot::default(),
            snapshot_tx,
            changes_tx,
            in_flight: FuturesUnordered::new(),
            waiters: HashMap::new(),
            voting: HashMap::new(),
            votes: HashMap::new(),
            parked: Vec::new(),
            lists_in_flight: 0,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        notifications: mpsc::Receiver<Notification>,
        voting_tick: Duration,
    ) {
        let mut notifications = Some(notifications);
        let mut ticker = tokio::time::interval(voting_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(user_id = %self.user_id, "Session started");

        loop {
            tokio::select! {
                biased;

                Some(completion) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.handle_completion(completion);
                }

                notification = next_notification(&mut notifications) => match notification {
                    Some(notification) => self.handle_notification(notification),
                    None => {
                        warn!("Notification channel ended");
                        notifications = None;
                    }
                },

                cmd = commands.recv() => match cmd {
                    Some(Command::Close { reply }) => {
                        self.shutdown(&mut notifications).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        info!("All client handles dropped, closing session");
                        self.shutdown(&mut notifications).await;
                        break;
                    }
                },

                _ = ticker.tick() => {
                    let changes = self.evaluate_voting();
                    self.publish(changes);
                }
            }
        }

        info!(user_id = %self.user_id, "Session closed");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call { request, reply } => self.start(request, Reply::Caller(reply)),
            Command::Vote {
                event_id,
                location_id,
                vote,
                reply,
            } => self.handle_vote((event_id, location_id), vote, reply),
            Command::EvaluateVoting { reply } => {
                let changes = self.evaluate_voting();
                self.publish(changes);
                let _ = reply.send(());
            }
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, request: Request, reply: Reply) {
        if request.operation() == Operation::GetEvents {
            self.lists_in_flight += 1;
        }
        let call = self.dispatcher.dispatch(request.clone());
        self.waiters.insert(call.id(), Waiter { request, reply });
        self.in_flight.push(call);
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Some(waiter) = self.waiters.remove(&completion.id) else {
            debug!(id = %completion.id, "Completion without waiter dropped");
            return;
        };

        let mut changes = match &completion.outcome {
            Ok(response) => self.apply_response(&waiter.request, response),
            Err(e) => {
                warn!(
                    operation = %completion.operation,
                    error_code = e.error_code(),
                    reason = %e.reason(),
                    "Request failed"
                );
                vec![]
            }
        };

        if completion.operation == Operation::GetEvents {
            self.lists_in_flight = self.lists_in_flight.saturating_sub(1);
            if self.lists_in_flight == 0 && !self.parked.is_empty() {
                let parked = std::mem::take(&mut self.parked);
                debug!(count = parked.len(), "Replaying parked notifications");
                for notification in parked {
                    changes.extend(self.apply_notification(notification));
                }
            }
        }

        self.publish(changes);

        match waiter.reply {
            Reply::Caller(tx) => {
                if tx.send(completion.outcome).is_err() {
                    debug!(operation = %completion.operation, "Caller went away before the result");
                }
            }
            Reply::Vote(key) => self.finish_vote(key, completion.outcome),
            Reply::Internal => {}
        }
    }

    /// The one snapshot transition of a confirmed operation.
    fn apply_response(&mut self, request: &Request, response: &ApiResponse) -> Vec<ChangeEvent> {
        let mut changes = match (request, response) {
            (_, ApiResponse::Events(events)) => self.snapshot.merge_events(events.clone()),
            (_, ApiResponse::Event(event)) => self.snapshot.upsert_event(event.clone()),
            (Request::CreateEvent { draft }, ApiResponse::EventCreated(id)) => {
                let owner = Member::with_id(self.user_id.clone());
                self.snapshot.upsert_event(Event {
                    id: id.clone(),
                    name: draft.name.clone(),
                    description: draft.description.clone(),
                    owner: owner.clone(),
                    is_public: draft.is_public,
                    photo: None,
                    schedule: draft.schedule,
                    members: vec![owner],
                    locations: vec![],
                    revision: Revision::default(),
                })
            }
            (Request::UpdateEvent { draft, .. }, ApiResponse::EventUpdated(id)) => {
                self.snapshot.apply_event_update(id, draft)
            }
            (_, ApiResponse::EventDeleted(id)) => self.snapshot.remove_event(id),
            (
                _,
                ApiResponse::MemberAdded {
                    event_id,
                    member_id,
                    revision,
                },
            ) => self
                .snapshot
                .add_member(event_id, Member::with_id(member_id.clone()), *revision),
            (
                _,
                ApiResponse::MemberRemoved {
                    event_id,
                    member_id,
                    revision,
                },
            ) => self
                .snapshot
                .remove_member(event_id, member_id, &self.user_id, *revision),
            (_, ApiResponse::Location { event_id, location }) => {
                self.snapshot.upsert_location(event_id, location.clone())
            }
            (
                Request::PutLocation {
                    location: draft, ..
                },
                ApiResponse::LocationPut {
                    event_id,
                    location_id,
                    ..
                },
            ) => {
                let draft = draft.truncated();
                let photo = self
                    .snapshot
                    .location(event_id, location_id)
                    .and_then(|l| l.photo.clone());
                self.snapshot.upsert_location(
                    event_id,
                    Location {
                        id: location_id.clone(),
                        name: draft.name,
                        description: draft.description,
                        photo,
                    },
                )
            }
            (
                _,
                ApiResponse::LocationRemoved {
                    event_id,
                    location_id,
                },
            ) => self.snapshot.remove_location(event_id, location_id),
            (_, ApiResponse::VoteSet(receipt)) => {
                let key = (receipt.event_id.clone(), receipt.location_id.clone());
                match self.votes.get(&key) {
                    Some(slot) => self.snapshot.record_vote(
                        &receipt.event_id,
                        &receipt.location_id,
                        &self.user_id,
                        receipt.vote,
                        receipt.votes_id.clone(),
                        slot.window,
                    ),
                    None => vec![],
                }
            }
            (_, ApiResponse::Votes(records)) => self.snapshot.merge_votes(records.iter()),
            (_, ApiResponse::VotesRecord(record)) => {
                self.snapshot.merge_votes(std::iter::once(record))
            }
            (_, ApiResponse::User(_) | ApiResponse::Users(_)) => vec![],
            (request, response) => {
                warn!(
                    operation = %request.operation(),
                    response = response.kind(),
                    "Response does not match its request"
                );
                vec![]
            }
        };

        // Schedules may have changed or events appeared.
        if matches!(
            response,
            ApiResponse::Events(_)
                | ApiResponse::Event(_)
                | ApiResponse::EventCreated(_)
                | ApiResponse::EventUpdated(_)
                | ApiResponse::EventDeleted(_)
                | ApiResponse::MemberRemoved { .. }
        ) {
            changes.extend(self.evaluate_voting());
        }
        changes
    }

    fn handle_notification(&mut self, notification: Notification) {
        debug!(kind = notification.kind(), "Applying notification");
        let changes = self.apply_notification(notification);
        self.publish(changes);
    }

    fn apply_notification(&mut self, notification: Notification) -> Vec<ChangeEvent> {
        let mut changes = Vec::new();
        if matches!(notification, Notification::VoteChanged { .. }) {
            changes.extend(self.evaluate_voting());
        }

        let voting_open = notification
            .event_id()
            .and_then(|id| self.voting.get(id))
            .is_some_and(VotingMachine::is_open);

        match self
            .snapshot
            .apply_notification(&notification, &self.user_id, voting_open)
        {
            Ok(applied) => {
                changes.extend(applied.changes);
                if let Some(request) = applied.follow_up {
                    self.start(request, Reply::Internal);
                }
                if matches!(notification, Notification::MemberChanged { .. }) {
                    changes.extend(self.evaluate_voting());
                }
            }
            Err(ClientError::NotFound(what)) if self.lists_in_flight > 0 => {
                debug!(kind = notification.kind(), missing = %what, "Parking notification until the event list lands");
                self.parked.push(notification);
            }
            Err(e) => {
                debug!(kind = notification.kind(), error = %e, "Notification ignored");
            }
        }
        changes
    }

    /// Advance every event's voting machine to the current time.
    fn evaluate_voting(&mut self) -> Vec<ChangeEvent> {
        let now = self.clock.now();
        let snapshot = &self.snapshot;
        self.voting.retain(|id, _| snapshot.event(id).is_some());

        let mut transitions = Vec::new();
        for event in self.snapshot.events() {
            let machine = self.voting.entry(event.id.clone()).or_default();
            for transition in machine.tick(now, &event.schedule) {
                transitions.push((event.id.clone(), transition));
            }
        }

        let mut changes = Vec::new();
        for (event_id, transition) in transitions {
            match transition {
                Transition::Started(window) => {
                    info!(event_id = %event_id, %window, "Voting started");
                    self.snapshot.install_ledger(&event_id, window);
                    changes.push(ChangeEvent::VotingStarted {
                        event_id: event_id.clone(),
                        window,
                    });
                    self.start(
                        Request::GetVotesByTime {
                            event_id,
                            begin: window.start,
                            end: window.end,
                        },
                        Reply::Internal,
                    );
                }
                Transition::Ended(window) => {
                    info!(event_id = %event_id, %window, "Voting ended");
                    changes.push(ChangeEvent::VotingEnded { event_id, window });
                }
            }
        }
        changes
    }

    fn voting_window(&self, event_id: &EventId) -> Option<VotingWindow> {
        self.voting.get(event_id).and_then(VotingMachine::window)
    }

    fn handle_vote(&mut self, key: VoteKey, vote: bool, reply: VoteReply) {
        let changes = self.evaluate_voting();
        self.publish(changes);

        let Some(window) = self.voting_window(&key.0) else {
            debug!(event_id = %key.0, location_id = %key.1, "Vote rejected, voting closed");
            let _ = reply.send(Err(ClientError::VotingClosed(key.0)));
            return;
        };

        match self.votes.get_mut(&key) {
            Some(slot) => {
                debug!(event_id = %key.0, location_id = %key.1, vote, "Vote waits for call in flight");
                slot.enqueue(vote, window, reply);
            }
            None => self.send_vote(key, vote, window, vec![reply], VecDeque::new()),
        }
    }

    fn send_vote(
        &mut self,
        key: VoteKey,
        vote: bool,
        window: VotingWindow,
        waiters: Vec<VoteReply>,
        queued: VecDeque<QueuedVote>,
    ) {
        let request = Request::SetLocationVote {
            event_id: key.0.clone(),
            location_id: key.1.clone(),
            vote,
        };
        self.votes.insert(
            key.clone(),
            VoteSlot {
                vote,
                window,
                waiters,
                queued,
            },
        );
        self.start(request, Reply::Vote(key));
    }

    fn finish_vote(&mut self, key: VoteKey, outcome: Result<ApiResponse>) {
        let Some(slot) = self.votes.remove(&key) else {
            return;
        };

        let result = outcome.and_then(|response| match response {
            ApiResponse::VoteSet(receipt) => Ok(receipt),
            other => Err(unexpected(&other)),
        });
        for waiter in slot.waiters {
            let _ = waiter.send(result.clone());
        }

        // Queued votes belong to the occurrence they were cast in.
        let current = self.voting_window(&key.0);
        let mut queued = slot.queued;
        while let Some(next) = queued.pop_front() {
            if current == Some(next.window) {
                self.send_vote(key, next.vote, next.window, next.waiters, queued);
                return;
            }
            debug!(event_id = %key.0, window = %next.window, "Queued vote outlived its voting window");
            for waiter in next.waiters {
                let _ = waiter.send(Err(ClientError::VotingClosed(key.0.clone())));
            }
        }
    }

    fn publish(&self, changes: Vec<ChangeEvent>) {
        if changes.is_empty() {
            return;
        }
        self.snapshot_tx
            .send_replace(Arc::new(self.snapshot.clone()));
        for change in changes {
            emit_change(&self.changes_tx, change);
        }
    }

    /// Close the notification source first, then drop every outstanding
    /// continuation, then release the snapshot.
    async fn shutdown(&mut self, notifications: &mut Option<mpsc::Receiver<Notification>>) {
        info!(user_id = %self.user_id, "Closing session");
        self.source.close().await;
        *notifications = None;

        let abandoned = self.waiters.len();
        self.in_flight = FuturesUnordered::new();
        self.waiters.clear();
        self.votes.clear();
        self.parked.clear();
        if abandoned > 0 {
            debug!(abandoned, "Dropped pending requests");
        }

        self.snapshot = Snapshot::default();
        self.snapshot_tx.send_replace(Arc::new(Snapshot::default()));
    }
}

async fn next_notification(
    rx: &mut Option<mpsc::Receiver<Notification>>,
) -> Option<Notification> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
