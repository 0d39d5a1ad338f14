//! Public handle of a client session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::info;

use m4e_net::{
    ApiResponse, Dispatcher, HttpTransport, NotificationSource, Request, Transport,
    WsNotificationChannel,
};
use m4e_shared::constants::CHANNEL_CAPACITY;
use m4e_shared::model::{
    Event, EventDraft, EventUpdate, Location, LocationDraft, UserInfo, VoteReceipt, VotesRecord,
};
use m4e_shared::types::{EventId, LocationId, UserId, VotesId};
use m4e_shared::{ClientError, Result};

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::events::ChangeEvent;
use crate::session::{unexpected, Command, Session};
use crate::snapshot::Snapshot;

/// Handle to a running client session.
///
/// Every operation issues exactly one REST call and resolves once the
/// session has applied its result to the snapshot. Handles are cheap to
/// clone; the session closes when [`EventsClient::close`] is called or the
/// last handle is dropped.
#[derive(Clone)]
pub struct EventsClient {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<Snapshot>>,
    changes: broadcast::Sender<ChangeEvent>,
    clock: Arc<dyn Clock>,
    user_id: UserId,
}

impl EventsClient {
    /// Start a session against the configured webapp over HTTP and websocket.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.transport)
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let source = WsNotificationChannel::new(config.notify_url()?);
        Self::with_parts(
            config,
            Arc::new(transport),
            Box::new(source),
            Arc::new(SystemClock),
        )
        .await
    }

    /// Start a session on explicit collaborators.
    pub async fn with_parts(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        mut source: Box<dyn NotificationSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::new(transport, config.server_url()?);
        let notifications = source.open().await?;

        let (commands, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot) = watch::channel(Arc::new(Snapshot::default()));
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);

        let session = Session::new(
            config.user_id.clone(),
            dispatcher,
            clock.clone(),
            source,
            snapshot_tx,
            changes.clone(),
        );
        tokio::spawn(session.run(command_rx, notifications, config.voting_tick));
        info!(server = %config.server_url, user_id = %config.user_id, "Client session started");

        Ok(Self {
            commands,
            snapshot,
            changes,
            clock,
            user_id: config.user_id.clone(),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.borrow().clone()
    }

    /// Change events published after every snapshot transition.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Whether the event currently accepts votes: the session has opened
    /// the ledger of the occurrence being voted on. A window that opened
    /// since the last voting tick reads as closed until the session catches
    /// up (see [`EventsClient::refresh_voting`]).
    pub fn is_voting_open(&self, event_id: &EventId) -> bool {
        let now = self.clock.now();
        self.snapshot()
            .ledger(event_id)
            .is_some_and(|ledger| ledger.window.contains(now))
    }

    /// Re-evaluate voting windows now instead of waiting for the next tick.
    pub async fn refresh_voting(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::EvaluateVoting { reply }).await?;
        rx.await.map_err(|_| ClientError::SessionClosed)
    }

    /// Close the notification channel, abandon pending requests and release
    /// the snapshot. Operations issued afterwards fail with `SessionClosed`.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn list_events(&self) -> Result<Vec<Event>> {
        match self.call(Request::GetEvents).await? {
            ApiResponse::Events(events) => Ok(events),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_event(&self, event_id: &EventId) -> Result<Event> {
        match self
            .call(Request::GetEvent {
                event_id: event_id.clone(),
            })
            .await?
        {
            ApiResponse::Event(event) => Ok(event),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn create_event(&self, draft: EventDraft) -> Result<EventId> {
        match self.call(Request::CreateEvent { draft }).await? {
            ApiResponse::EventCreated(id) => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn update_event(&self, update: EventUpdate) -> Result<()> {
        match self
            .call(Request::UpdateEvent {
                event_id: update.id,
                draft: update.draft,
            })
            .await?
        {
            ApiResponse::EventUpdated(_) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn delete_event(&self, event_id: &EventId) -> Result<()> {
        match self
            .call(Request::DeleteEvent {
                event_id: event_id.clone(),
            })
            .await?
        {
            ApiResponse::EventDeleted(_) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn add_member(&self, event_id: &EventId, member_id: &UserId) -> Result<()> {
        match self
            .call(Request::AddMember {
                event_id: event_id.clone(),
                member_id: member_id.clone(),
            })
            .await?
        {
            ApiResponse::MemberAdded { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn remove_member(&self, event_id: &EventId, member_id: &UserId) -> Result<()> {
        match self
            .call(Request::RemoveMember {
                event_id: event_id.clone(),
                member_id: member_id.clone(),
            })
            .await?
        {
            ApiResponse::MemberRemoved { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_location(
        &self,
        event_id: &EventId,
        location_id: &LocationId,
    ) -> Result<Location> {
        match self
            .call(Request::GetLocation {
                event_id: event_id.clone(),
                location_id: location_id.clone(),
            })
            .await?
        {
            ApiResponse::Location { location, .. } => Ok(location),
            other => Err(unexpected(&other)),
        }
    }

    /// Add a location (draft without id) or update an existing one (draft
    /// with id). Returns the location's id.
    pub async fn put_location(&self, event_id: &EventId, location: LocationDraft) -> Result<LocationId> {
        match self
            .call(Request::PutLocation {
                event_id: event_id.clone(),
                location,
            })
            .await?
        {
            ApiResponse::LocationPut { location_id, .. } => Ok(location_id),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn remove_location(&self, event_id: &EventId, location_id: &LocationId) -> Result<()> {
        match self
            .call(Request::RemoveLocation {
                event_id: event_id.clone(),
                location_id: location_id.clone(),
            })
            .await?
        {
            ApiResponse::LocationRemoved { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Cast (`true`) or withdraw (`false`) the session user's vote.
    ///
    /// Fails with `VotingClosed`, without contacting the server, outside the
    /// event's voting window.
    pub async fn set_location_vote(
        &self,
        event_id: &EventId,
        location_id: &LocationId,
        vote: bool,
    ) -> Result<VoteReceipt> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Vote {
            event_id: event_id.clone(),
            location_id: location_id.clone(),
            vote,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    pub async fn votes_by_time(
        &self,
        event_id: &EventId,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<VotesRecord>> {
        match self
            .call(Request::GetVotesByTime {
                event_id: event_id.clone(),
                begin,
                end,
            })
            .await?
        {
            ApiResponse::Votes(records) => Ok(records),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn votes_by_id(&self, votes_id: &VotesId) -> Result<VotesRecord> {
        match self
            .call(Request::GetVotesById {
                votes_id: votes_id.clone(),
            })
            .await?
        {
            ApiResponse::VotesRecord(record) => Ok(record),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_user(&self, user_id: &UserId) -> Result<UserInfo> {
        match self
            .call(Request::GetUser {
                user_id: user_id.clone(),
            })
            .await?
        {
            ApiResponse::User(user) => Ok(user),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn search_users(&self, keyword: &str) -> Result<Vec<UserInfo>> {
        match self
            .call(Request::SearchUsers {
                keyword: keyword.to_string(),
            })
            .await?
        {
            ApiResponse::Users(users) => Ok(users),
            other => Err(unexpected(&other)),
        }
    }

    async fn call(&self, request: Request) -> Result<ApiResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Call { request, reply }).await?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::SessionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::{json, Value};

    use m4e_net::transport::mock::{ok_envelope, MockTransport};
    use m4e_net::{ChannelNotificationSource, Method};
    use m4e_shared::protocol::{ChangeKind, Notification};
    use m4e_shared::schedule::VotingWindow;
    use m4e_shared::types::Revision;

    use crate::clock::ManualClock;

    const EVENTS: &str = "/m4e/rest/events";

    struct Harness {
        client: EventsClient,
        mock: Arc<MockTransport>,
        notify: mpsc::Sender<Notification>,
        clock: Arc<ManualClock>,
    }

    /// 2026-03-02 is a Monday.
    fn monday(h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, min, 0).unwrap()
    }

    async fn harness() -> Harness {
        let mock = Arc::new(MockTransport::new());
        let (notify, source) = ChannelNotificationSource::pair();
        let clock = Arc::new(ManualClock::new(monday(11, 30)));
        let config = ClientConfig {
            server_url: "http://mock.local/m4e".into(),
            user_id: UserId::new("U1"),
            ..ClientConfig::default()
        };
        let client =
            EventsClient::with_parts(&config, mock.clone(), Box::new(source), clock.clone())
                .await
                .unwrap();
        Harness {
            client,
            mock,
            notify,
            clock,
        }
    }

    /// A single lunch at `start`; voting opens one hour before.
    fn event_json(
        id: &str,
        start: DateTime<Utc>,
        revision: u64,
        members: &[&str],
        locations: &[&str],
    ) -> Value {
        json!({
            "id": id,
            "name": format!("Lunch {id}"),
            "description": "",
            "public": false,
            "ownerId": "U1",
            "ownerName": "alice",
            "photoId": "",
            "photoETag": "",
            "eventStart": start.timestamp(),
            "repeatWeekDays": 0,
            "repeatDayTime": 0,
            "votingTimeBegin": 3600,
            "members": members.iter().map(|m| json!({"id": m, "name": m})).collect::<Vec<_>>(),
            "locations": locations
                .iter()
                .map(|l| json!({"id": l, "name": format!("Place {l}")}))
                .collect::<Vec<_>>(),
            "revision": revision,
        })
    }

    async fn load(h: &Harness, events: Vec<Value>) {
        h.mock.ok(Method::GET, EVENTS, json!(events));
        h.client.list_events().await.unwrap();
    }

    fn calls_to(mock: &MockTransport, path: &str) -> usize {
        mock.calls().iter().filter(|c| c.path == path).count()
    }

    async fn wait_for_calls(mock: &MockTransport, path: &str, n: usize) {
        for _ in 0..1000 {
            if calls_to(mock, path) >= n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {n} calls to {path}");
    }

    fn e1() -> EventId {
        EventId::new("E1")
    }

    fn l1() -> LocationId {
        LocationId::new("L1")
    }

    #[tokio::test]
    async fn test_confirmed_vote_lands_in_ledger_and_duplicate_is_ignored() {
        let h = harness().await;
        load(&h, vec![event_json("E1", monday(12, 0), 1, &["U1"], &["L1"])]).await;
        assert!(h.client.is_voting_open(&e1()));

        h.mock.ok(
            Method::PUT,
            "/m4e/rest/locationvoting/setvote/E1/L1/1",
            json!({"eventId": "E1", "locationId": "L1", "votesId": "V1", "vote": true}),
        );
        let receipt = h.client.set_location_vote(&e1(), &l1(), true).await.unwrap();
        assert_eq!(receipt.votes_id, Some(VotesId::new("V1")));

        let snapshot = h.client.snapshot();
        let ledger = snapshot.ledger(&e1()).unwrap();
        assert!(ledger.has_voted(&l1(), &UserId::new("U1")));

        let mut changes = h.client.subscribe();
        let echo = Notification::VoteChanged {
            event_id: e1(),
            location_id: l1(),
            user_id: UserId::new("U1"),
            vote: true,
            votes_id: Some(VotesId::new("V1")),
            revision: Revision(1),
        };
        h.notify.send(echo.clone()).await.unwrap();
        h.notify.send(echo).await.unwrap();
        h.client.refresh_voting().await.unwrap();

        assert!(changes.try_recv().is_err());
        assert_eq!(
            h.client.snapshot().ledger(&e1()).unwrap().vote_count(&l1()),
            1
        );
    }

    #[tokio::test]
    async fn test_removed_location_takes_its_votes() {
        let h = harness().await;
        load(
            &h,
            vec![event_json("E1", monday(12, 0), 1, &["U1"], &["L1", "L2"])],
        )
        .await;

        h.mock.ok(
            Method::PUT,
            "/m4e/rest/locationvoting/setvote/E1/L1/1",
            json!({"votesId": "V1"}),
        );
        h.client.set_location_vote(&e1(), &l1(), true).await.unwrap();

        h.mock.ok(
            Method::POST,
            "/m4e/rest/events/removelocation/E1/L1",
            json!({"eventId": "E1", "locationId": "L1"}),
        );
        h.client.remove_location(&e1(), &l1()).await.unwrap();

        let snapshot = h.client.snapshot();
        assert!(snapshot.location(&e1(), &l1()).is_none());
        assert!(snapshot.location(&e1(), &LocationId::new("L2")).is_some());
        assert!(snapshot.ledger(&e1()).unwrap().entry(&l1()).is_none());
    }

    #[tokio::test]
    async fn test_member_notified_during_list_survives_stale_response() {
        let h = harness().await;
        load(&h, vec![event_json("E1", monday(18, 0), 4, &["U1"], &[])]).await;

        let release = h.mock.defer(Method::GET, EVENTS);
        let client = h.client.clone();
        let list = tokio::spawn(async move { client.list_events().await });
        wait_for_calls(&h.mock, EVENTS, 2).await;

        h.notify
            .send(Notification::MemberChanged {
                change: ChangeKind::Added,
                event_id: e1(),
                member_id: UserId::new("U9"),
                member_name: Some("carol".into()),
                revision: Revision(5),
            })
            .await
            .unwrap();
        h.client.refresh_voting().await.unwrap();
        assert!(h.client.snapshot().event(&e1()).unwrap().has_member(&UserId::new("U9")));

        release
            .send(ok_envelope(json!([event_json("E1", monday(18, 0), 4, &["U1"], &[])])))
            .unwrap();
        list.await.unwrap().unwrap();

        let snapshot = h.client.snapshot();
        let event = snapshot.event(&e1()).unwrap();
        assert!(event.has_member(&UserId::new("U9")));
        assert_eq!(event.revision, Revision(5));
    }

    #[tokio::test]
    async fn test_notification_for_unlisted_event_replayed_after_list() {
        let h = harness().await;

        let release = h.mock.defer(Method::GET, EVENTS);
        let client = h.client.clone();
        let list = tokio::spawn(async move { client.list_events().await });
        wait_for_calls(&h.mock, EVENTS, 1).await;

        h.notify
            .send(Notification::MemberChanged {
                change: ChangeKind::Added,
                event_id: e1(),
                member_id: UserId::new("U9"),
                member_name: None,
                revision: Revision(5),
            })
            .await
            .unwrap();
        h.client.refresh_voting().await.unwrap();
        assert!(h.client.snapshot().events().is_empty());

        release
            .send(ok_envelope(json!([event_json("E1", monday(18, 0), 4, &["U1"], &[])])))
            .unwrap();
        list.await.unwrap().unwrap();

        assert!(h
            .client
            .snapshot()
            .event(&e1())
            .unwrap()
            .has_member(&UserId::new("U9")));
    }

    #[tokio::test]
    async fn test_vote_outside_window_rejected_locally() {
        let h = harness().await;
        let next_week = monday(12, 0) + Duration::days(7);
        load(&h, vec![event_json("E1", next_week, 1, &["U1"], &["L1"])]).await;
        assert!(!h.client.is_voting_open(&e1()));

        let err = h.client.set_location_vote(&e1(), &l1(), true).await.unwrap_err();
        assert_eq!(err, ClientError::VotingClosed(e1()));

        let err = h
            .client
            .set_location_vote(&EventId::new("E404"), &l1(), true)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "voting_closed");

        assert!(h
            .mock
            .calls()
            .iter()
            .all(|c| !c.path.contains("setvote")));
    }

    #[tokio::test]
    async fn test_same_vote_coalesced_into_call_in_flight() {
        let h = harness().await;
        load(&h, vec![event_json("E1", monday(12, 0), 1, &["U1"], &["L1"])]).await;
        let (event_id, location_id) = (e1(), l1());

        let path = "/m4e/rest/locationvoting/setvote/E1/L1/1";
        let release = h.mock.defer(Method::PUT, path);
        let (a, b, ()) = tokio::join!(
            h.client.set_location_vote(&event_id, &location_id, true),
            h.client.set_location_vote(&event_id, &location_id, true),
            async {
                wait_for_calls(&h.mock, path, 1).await;
                h.client.refresh_voting().await.unwrap();
                release.send(ok_envelope(json!({"votesId": "V1"}))).unwrap();
            }
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls_to(&h.mock, path), 1);
    }

    #[tokio::test]
    async fn test_opposite_vote_waits_for_call_in_flight() {
        let h = harness().await;
        load(&h, vec![event_json("E1", monday(12, 0), 1, &["U1"], &["L1"])]).await;
        let (event_id, location_id) = (e1(), l1());

        let cast = "/m4e/rest/locationvoting/setvote/E1/L1/1";
        let withdraw = "/m4e/rest/locationvoting/setvote/E1/L1/0";
        let release = h.mock.defer(Method::PUT, cast);
        h.mock.ok(Method::PUT, withdraw, json!({"votesId": "V1"}));

        let (a, b, ()) = tokio::join!(
            h.client.set_location_vote(&event_id, &location_id, true),
            h.client.set_location_vote(&event_id, &location_id, false),
            async {
                wait_for_calls(&h.mock, cast, 1).await;
                h.client.refresh_voting().await.unwrap();
                assert_eq!(calls_to(&h.mock, withdraw), 0);
                release.send(ok_envelope(json!({"votesId": "V1"}))).unwrap();
            }
        );

        assert!(a.unwrap().vote);
        assert!(!b.unwrap().vote);
        assert_eq!(calls_to(&h.mock, withdraw), 1);
        let snapshot = h.client.snapshot();
        assert!(!snapshot
            .ledger(&e1())
            .unwrap()
            .has_voted(&l1(), &UserId::new("U1")));
    }

    #[tokio::test]
    async fn test_next_occurrence_replaces_ledger() {
        let h = harness().await;
        load(&h, vec![weekly_lunch()]).await;

        let monday_window = VotingWindow::new(monday(11, 0), monday(12, 0));
        assert_eq!(h.client.snapshot().ledger(&e1()).unwrap().window, monday_window);

        h.mock.ok(
            Method::PUT,
            "/m4e/rest/locationvoting/setvote/E1/L1/1",
            json!({"votesId": "V1"}),
        );
        h.client.set_location_vote(&e1(), &l1(), true).await.unwrap();

        let mut changes = h.client.subscribe();
        let wednesday = monday(11, 15) + Duration::days(2);
        h.clock.set(wednesday);
        h.client.refresh_voting().await.unwrap();

        let wednesday_window = VotingWindow::new(
            monday_window.start + Duration::days(2),
            monday_window.end + Duration::days(2),
        );
        assert_eq!(
            changes.try_recv().unwrap(),
            ChangeEvent::VotingEnded {
                event_id: e1(),
                window: monday_window
            }
        );
        assert_eq!(
            changes.try_recv().unwrap(),
            ChangeEvent::VotingStarted {
                event_id: e1(),
                window: wednesday_window
            }
        );

        let snapshot = h.client.snapshot();
        let ledger = snapshot.ledger(&e1()).unwrap();
        assert_eq!(ledger.window, wednesday_window);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_business_failure_leaves_snapshot_untouched() {
        let h = harness().await;
        load(&h, vec![event_json("E1", monday(18, 0), 1, &["U1"], &[])]).await;
        let before = h.client.snapshot();

        h.mock.nok(
            Method::PUT,
            "/m4e/rest/events/addmember/E1/U2",
            403,
            "not the owner",
        );
        let err = h
            .client
            .add_member(&e1(), &UserId::new("U2"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "403");
        assert_eq!(err.reason(), "not the owner");
        assert_eq!(h.client.snapshot().events(), before.events());
    }

    #[tokio::test]
    async fn test_location_notification_refetches_location() {
        let h = harness().await;
        load(&h, vec![event_json("E1", monday(18, 0), 1, &["U1"], &["L1"])]).await;
        h.mock.ok(
            Method::GET,
            "/m4e/rest/events/location/E1/L2",
            json!({"id": "L2", "name": "Noodle bar", "description": "", "photoId": "", "photoETag": ""}),
        );

        let mut changes = h.client.subscribe();
        h.notify
            .send(Notification::LocationChanged {
                change: ChangeKind::Added,
                event_id: e1(),
                location_id: LocationId::new("L2"),
                revision: Revision(2),
            })
            .await
            .unwrap();

        let change = tokio::time::timeout(std::time::Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            change,
            ChangeEvent::LocationUpdated {
                event_id: e1(),
                location_id: LocationId::new("L2")
            }
        );
        let snapshot = h.client.snapshot();
        assert_eq!(
            snapshot.location(&e1(), &LocationId::new("L2")).unwrap().name,
            "Noodle bar"
        );
    }

    #[tokio::test]
    async fn test_put_location_adds_then_updates() {
        let h = harness().await;
        load(&h, vec![event_json("E1", monday(18, 0), 1, &["U1"], &[])]).await;

        let path = "/m4e/rest/events/putlocation/E1";
        h.mock
            .ok(Method::PUT, path, json!({"eventId": "E1", "locationId": "L7"}));
        h.mock
            .ok(Method::PUT, path, json!({"eventId": "E1", "locationId": "L7"}));

        let id = h
            .client
            .put_location(&e1(), LocationDraft::new("Pizza", "round"))
            .await
            .unwrap();
        assert_eq!(id, LocationId::new("L7"));

        h.client
            .put_location(&e1(), LocationDraft::for_existing(id.clone(), "Pasta", "long"))
            .await
            .unwrap();

        let bodies: Vec<Value> = h
            .mock
            .calls()
            .iter()
            .filter(|c| c.path == path)
            .map(|c| serde_json::from_str(c.body.as_deref().unwrap()).unwrap())
            .collect();
        assert!(bodies[0].get("id").is_none());
        assert_eq!(bodies[1]["id"], "L7");

        let snapshot = h.client.snapshot();
        let event = snapshot.event(&e1()).unwrap();
        assert_eq!(event.locations.len(), 1);
        assert_eq!(event.locations[0].name, "Pasta");
    }

    #[tokio::test]
    async fn test_create_and_delete_event() {
        let h = harness().await;
        h.mock
            .ok(Method::POST, "/m4e/rest/events/create", json!({"id": "E5"}));
        let draft = EventDraft {
            name: "Friday pizza".into(),
            description: String::new(),
            is_public: true,
            schedule: m4e_shared::schedule::EventSchedule::once(
                monday(12, 0) + Duration::days(4),
                Duration::hours(2),
            ),
        };
        let id = h.client.create_event(draft).await.unwrap();
        assert_eq!(id, EventId::new("E5"));
        let snapshot = h.client.snapshot();
        let created = snapshot.event(&id).unwrap();
        assert_eq!(created.owner.id, UserId::new("U1"));
        assert!(created.has_member(&UserId::new("U1")));

        h.mock
            .ok(Method::DELETE, "/m4e/rest/events/E5", json!({"id": "E5"}));
        h.client.delete_event(&id).await.unwrap();
        assert!(h.client.snapshot().event(&id).is_none());
    }

    #[tokio::test]
    async fn test_user_lookup_leaves_snapshot_alone() {
        let h = harness().await;
        h.mock.ok(
            Method::GET,
            "/m4e/rest/users/search/bo",
            json!([{"id": "U2", "name": "bob"}]),
        );
        let users = h.client.search_users("bo").await.unwrap();
        assert_eq!(users[0].id, UserId::new("U2"));
        assert!(h.client.snapshot().events().is_empty());
    }

    #[tokio::test]
    async fn test_close_abandons_pending_calls() {
        let h = harness().await;
        let _release = h.mock.defer(Method::GET, EVENTS);

        let (listed, ()) = tokio::join!(h.client.list_events(), async {
            wait_for_calls(&h.mock, EVENTS, 1).await;
            h.client.close().await;
        });
        assert_eq!(listed.unwrap_err(), ClientError::SessionClosed);

        assert_eq!(
            h.client.get_user(&UserId::new("U2")).await.unwrap_err(),
            ClientError::SessionClosed
        );
        assert!(h.client.snapshot().events().is_empty());
        let chat = Notification::ChatMessage(m4e_shared::protocol::ChatMessage {
            sender_id: UserId::new("U2"),
            sender_name: "bob".into(),
            event_id: None,
            text: "anyone?".into(),
            timestamp: monday(11, 0),
        });
        assert!(h.notify.send(chat).await.is_err());
    }

    fn weekly_lunch() -> Value {
        let mut weekly = event_json("E1", monday(12, 0), 1, &["U1"], &["L1"]);
        weekly["repeatWeekDays"] = json!(0x05);
        weekly["repeatDayTime"] = json!(43_200);
        weekly
    }

    #[tokio::test]
    async fn test_vote_confirmed_after_rollover_stays_with_its_occurrence() {
        let h = harness().await;
        load(&h, vec![weekly_lunch()]).await;
        let (event_id, location_id) = (e1(), l1());

        let cast = "/m4e/rest/locationvoting/setvote/E1/L1/1";
        let release = h.mock.defer(Method::PUT, cast);
        let (cast_vote, queued_vote, ()) = tokio::join!(
            h.client.set_location_vote(&event_id, &location_id, true),
            h.client.set_location_vote(&event_id, &location_id, false),
            async {
                wait_for_calls(&h.mock, cast, 1).await;
                h.client.refresh_voting().await.unwrap();
                h.clock.set(monday(11, 15) + Duration::days(2));
                h.client.refresh_voting().await.unwrap();
                release.send(ok_envelope(json!({"votesId": "V1"}))).unwrap();
            }
        );

        assert!(cast_vote.unwrap().vote);
        assert_eq!(queued_vote.unwrap_err(), ClientError::VotingClosed(e1()));
        assert_eq!(calls_to(&h.mock, "/m4e/rest/locationvoting/setvote/E1/L1/0"), 0);

        let snapshot = h.client.snapshot();
        let ledger = snapshot.ledger(&e1()).unwrap();
        assert_eq!(ledger.window.start, monday(11, 0) + Duration::days(2));
        assert!(!ledger.has_voted(&l1(), &UserId::new("U1")));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_votes_for_missing_locations_never_reach_ledger() {
        let h = harness().await;
        load(
            &h,
            vec![event_json("E1", monday(12, 0), 1, &["U1"], &["L1", "L2"])],
        )
        .await;
        let (event_id, location_id) = (e1(), l1());

        let cast = "/m4e/rest/locationvoting/setvote/E1/L1/1";
        let release = h.mock.defer(Method::PUT, cast);
        h.mock.ok(
            Method::POST,
            "/m4e/rest/events/removelocation/E1/L1",
            json!({"eventId": "E1", "locationId": "L1"}),
        );
        let (vote, ()) = tokio::join!(
            h.client.set_location_vote(&event_id, &location_id, true),
            async {
                wait_for_calls(&h.mock, cast, 1).await;
                h.client.remove_location(&event_id, &location_id).await.unwrap();
                release.send(ok_envelope(json!({"votesId": "V1"}))).unwrap();
            }
        );
        vote.unwrap();

        h.notify
            .send(Notification::VoteChanged {
                event_id: e1(),
                location_id: LocationId::new("L9"),
                user_id: UserId::new("U2"),
                vote: true,
                votes_id: None,
                revision: Revision(3),
            })
            .await
            .unwrap();
        h.client.refresh_voting().await.unwrap();

        let snapshot = h.client.snapshot();
        assert!(snapshot.location(&e1(), &l1()).is_none());
        let ledger = snapshot.ledger(&e1()).unwrap();
        assert!(ledger.entry(&l1()).is_none());
        assert!(ledger.entry(&LocationId::new("L9")).is_none());
    }

    #[tokio::test]
    async fn test_voting_reads_open_only_once_session_opened_window() {
        let h = harness().await;
        load(&h, vec![weekly_lunch()]).await;
        assert!(h.client.is_voting_open(&e1()));

        h.clock.set(monday(12, 30));
        assert!(!h.client.is_voting_open(&e1()));

        h.clock.set(monday(11, 15) + Duration::days(2));
        assert!(!h.client.is_voting_open(&e1()));

        h.client.refresh_voting().await.unwrap();
        assert!(h.client.is_voting_open(&e1()));
    }
}
