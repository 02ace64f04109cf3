//! Session-level tests driven through [`ChannelTransport`].

use crate::changes::{
    Cache, ChangeSession, ChangeStream, DisconnectReason, FeedConfig, FeedEvent, Listener,
    SessionState, StartOptions, StopHandle,
};
use crate::client::{ByteStream, ChannelTransport, ChunkSender, FeedRequest, Transport};
use crate::error::{FeedError, Result};
use crate::types::{ChangeRecord, DatabaseInfo, Sequence};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Invalidate(&'static str, String),
    Change(&'static str, ChangeRecord),
    Disconnect(&'static str, DisconnectReason),
}

#[derive(Default)]
struct Journal(Mutex<Vec<Entry>>);

impl Journal {
    fn entries(&self) -> Vec<Entry> {
        self.0.lock().clone()
    }

    fn changes(&self, listener: &str) -> Vec<ChangeRecord> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                Entry::Change(name, change) if name == listener => Some(change),
                _ => None,
            })
            .collect()
    }

    fn disconnects(&self) -> Vec<DisconnectReason> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                Entry::Disconnect(_, reason) => Some(reason),
                _ => None,
            })
            .collect()
    }
}

struct RecordingCache(&'static str, Arc<Journal>);

impl Cache for RecordingCache {
    fn invalidate(&self, id: &str) -> anyhow::Result<()> {
        self.1 .0.lock().push(Entry::Invalidate(self.0, id.to_string()));
        Ok(())
    }
}

struct RecordingListener(&'static str, Arc<Journal>);

impl Listener for RecordingListener {
    fn on_change(&self, change: &ChangeRecord) -> anyhow::Result<()> {
        self.1 .0.lock().push(Entry::Change(self.0, change.clone()));
        Ok(())
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        self.1 .0.lock().push(Entry::Disconnect(self.0, reason.clone()));
    }
}

struct BrokenCache;

impl Cache for BrokenCache {
    fn invalidate(&self, id: &str) -> anyhow::Result<()> {
        anyhow::bail!("cannot invalidate {}", id)
    }
}

const DOC1: &str = r#"{"seq":1,"id":"doc1","changes":[{"rev":"1-a"}]}"#;
const DOC2: &str = r#"{"seq":2,"id":"doc2","changes":[{"rev":"1-b"}],"deleted":true}"#;
const DOC3: &str = r#"{"seq":3,"id":"doc3","changes":[{"rev":"2-c"}]}"#;

fn feed_body(lines: &[&str]) -> Vec<u8> {
    lines.iter().flat_map(|l| format!("{}\n", l).into_bytes()).collect()
}

async fn send(tx: &ChunkSender, data: &[u8]) {
    tx.send(Ok(Bytes::copy_from_slice(data))).await.unwrap();
}

async fn settle(session: &ChangeSession) {
    tokio::time::timeout(Duration::from_secs(5), session.stopped())
        .await
        .expect("session did not stop");
}

/// Session with one recording cache and one recording listener, started at `since`.
async fn started(since: u64) -> (ChangeSession, Arc<ChannelTransport>, ChunkSender, Arc<Journal>) {
    let transport = Arc::new(ChannelTransport::new());
    let tx = transport.push_feed();
    let journal = Arc::new(Journal::default());

    let mut session = ChangeSession::new(transport.clone(), "db");
    session.add_cache(Arc::new(RecordingCache("cache", journal.clone()))).unwrap();
    session.add_listener(Arc::new(RecordingListener("listener", journal.clone()))).unwrap();
    assert_ok!(session.start(StartOptions::new().since(since)).await);

    (session, transport, tx, journal)
}

#[tokio::test]
async fn test_ordering_independent_of_chunking() {
    let body = feed_body(&[DOC1, "", DOC2, "", "", DOC3]);
    let expected = vec!["doc1", "doc2", "doc3"];

    let chunkings: Vec<Vec<&[u8]>> = vec![
        vec![&body[..]],
        body.split_inclusive(|b| *b == b'\n').collect(),
        body.chunks(1).collect(),
        body.chunks(7).collect(),
        body.chunks(64).collect(),
    ];

    for chunks in chunkings {
        let (session, _transport, tx, journal) = started(0).await;
        for chunk in chunks {
            send(&tx, chunk).await;
        }
        drop(tx);
        settle(&session).await;

        let ids: Vec<String> = journal.changes("listener").into_iter().map(|c| c.id).collect();
        assert_eq!(ids, expected);
        assert_eq!(journal.disconnects(), vec![DisconnectReason::Closed]);
    }
}

#[tokio::test]
async fn test_cursor_tracks_last_record() {
    let transport = Arc::new(ChannelTransport::new());
    let tx = transport.push_feed();
    let (listener, mut events) = ChangeStream::channel();

    let mut session = ChangeSession::new(transport, "db");
    session.add_listener(Arc::new(listener)).unwrap();
    session.start(StartOptions::new().since(0)).await.unwrap();
    assert_eq!(session.cursor(), Some(Sequence::from(0)));

    send(&tx, DOC1.as_bytes()).await;
    send(&tx, b"\n").await;
    assert!(matches!(events.next().await, Some(FeedEvent::Change(_))));
    assert_eq!(session.cursor(), Some(Sequence::from(1)));

    // A record without seq leaves the cursor alone.
    send(&tx, b"{\"id\":\"noseq\"}\n").await;
    assert!(matches!(events.next().await, Some(FeedEvent::Change(c)) if c.id == "noseq"));
    assert_eq!(session.cursor(), Some(Sequence::from(1)));

    send(&tx, &feed_body(&[DOC2, DOC3])).await;
    events.next().await;
    events.next().await;
    assert_eq!(session.cursor(), Some(Sequence::from(3)));

    session.stop();
    assert_eq!(
        events.next().await,
        Some(FeedEvent::Disconnected(DisconnectReason::Stopped))
    );
}

#[tokio::test]
async fn test_malformed_lines_are_ignored() {
    let (session, _transport, tx, journal) = started(0).await;

    let body = feed_body(&[
        "garbage",
        DOC1,
        r#"{"seq":5}"#,
        "{\"seq\":6,\"id\":",
        "",
        r#"{"last_seq":9,"pending":0}"#,
        DOC2,
        "[]",
    ]);
    send(&tx, &body).await;
    drop(tx);
    settle(&session).await;

    let changes = journal.changes("listener");
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].id, "doc1");
    assert_eq!(changes[1].id, "doc2");
    assert_eq!(session.cursor(), Some(Sequence::from(2)));
    assert_eq!(journal.disconnects(), vec![DisconnectReason::Closed]);
}

#[tokio::test]
async fn test_stop_twice_disconnects_once() {
    let (session, _transport, tx, journal) = started(0).await;

    session.stop();
    session.stop();
    settle(&session).await;
    session.stop();

    assert_eq!(journal.disconnects(), vec![DisconnectReason::Stopped]);
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!session.is_running());

    // The body was released even though the peer never sent anything.
    tokio::time::timeout(Duration::from_secs(1), tx.closed())
        .await
        .expect("feed body still held");
}

#[tokio::test]
async fn test_disconnect_exactly_once_for_every_cause() {
    // Explicit stop
    let (session, _transport, _tx, journal) = started(0).await;
    session.stop();
    settle(&session).await;
    assert_eq!(journal.disconnects(), vec![DisconnectReason::Stopped]);

    // Peer reset
    let (session, _transport, tx, journal) = started(0).await;
    tx.send(Err(FeedError::Disconnected("connection reset".into()))).await.unwrap();
    settle(&session).await;
    session.stop();
    assert_eq!(
        journal.disconnects(),
        vec![DisconnectReason::ConnectionLost("connection reset".into())]
    );

    // Clean close
    let (session, _transport, tx, journal) = started(0).await;
    drop(tx);
    settle(&session).await;
    session.stop();
    assert_eq!(journal.disconnects(), vec![DisconnectReason::Closed]);
}

#[tokio::test]
async fn test_caches_invalidated_before_listeners() {
    let transport = Arc::new(ChannelTransport::new());
    let tx = transport.push_feed();
    let journal = Arc::new(Journal::default());

    let mut session = ChangeSession::new(transport, "db");
    session.add_cache(Arc::new(RecordingCache("c1", journal.clone()))).unwrap();
    session.add_cache(Arc::new(BrokenCache)).unwrap();
    session.add_cache(Arc::new(RecordingCache("c2", journal.clone()))).unwrap();
    session.add_listener(Arc::new(RecordingListener("l1", journal.clone()))).unwrap();
    session.add_listener(Arc::new(RecordingListener("l2", journal.clone()))).unwrap();
    session.start(StartOptions::new().since(0)).await.unwrap();

    send(&tx, &feed_body(&[DOC1, DOC2])).await;
    drop(tx);
    settle(&session).await;

    let entries = journal.entries();
    let record1 = journal.changes("l1")[0].clone();
    let record2 = journal.changes("l1")[1].clone();
    assert_eq!(
        entries,
        vec![
            Entry::Invalidate("c1", "doc1".into()),
            Entry::Invalidate("c2", "doc1".into()),
            Entry::Change("l1", record1.clone()),
            Entry::Change("l2", record1),
            Entry::Invalidate("c1", "doc2".into()),
            Entry::Invalidate("c2", "doc2".into()),
            Entry::Change("l1", record2.clone()),
            Entry::Change("l2", record2),
            Entry::Disconnect("l1", DisconnectReason::Closed),
            Entry::Disconnect("l2", DisconnectReason::Closed),
        ]
    );
}

#[tokio::test]
async fn test_scenario_two_changes_with_heartbeat() {
    let (session, _transport, tx, journal) = started(0).await;

    send(&tx, &feed_body(&[DOC1, "", DOC2])).await;
    drop(tx);
    settle(&session).await;

    let changes = journal.changes("listener");
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].revisions, vec!["1-a"]);
    assert!(!changes[0].deleted);
    assert!(changes[1].deleted);
    assert_eq!(session.cursor(), Some(Sequence::from(2)));
}

#[tokio::test]
async fn test_scenario_start_from_current_sequence() {
    let transport = Arc::new(ChannelTransport::new());
    transport.set_update_seq("db", 42);
    let tx = transport.push_feed();
    let (listener, mut events) = ChangeStream::channel();

    let mut session = ChangeSession::new(transport.clone(), "db");
    session.add_listener(Arc::new(listener)).unwrap();

    let since = session.start(StartOptions::new()).await.unwrap();
    assert_eq!(since, Sequence::from(42));
    assert_eq!(transport.requests()[0].query_value("since"), Some("42"));

    send(&tx, b"{\"seq\":43,\"id\":\"fresh\",\"changes\":[{\"rev\":\"1-x\"}]}\n").await;
    assert!(matches!(events.next().await, Some(FeedEvent::Change(c)) if c.id == "fresh"));
    assert_eq!(session.cursor(), Some(Sequence::from(43)));
}

#[tokio::test]
async fn test_scenario_reset_after_two_lines() {
    let (session, _transport, tx, journal) = started(0).await;

    send(&tx, &feed_body(&[DOC1, DOC2])).await;
    tx.send(Err(FeedError::Disconnected("connection lost".into()))).await.unwrap();
    settle(&session).await;

    assert_eq!(journal.changes("listener").len(), 2);
    assert_eq!(
        journal.disconnects(),
        vec![DisconnectReason::ConnectionLost("connection lost".into())]
    );
    assert!(!session.is_running());
}

#[tokio::test]
async fn test_partial_line_at_end_is_discarded() {
    let (session, _transport, tx, journal) = started(0).await;

    send(&tx, DOC1.as_bytes()).await;
    send(&tx, b"\n").await;
    send(&tx, DOC2.as_bytes()).await;
    drop(tx);
    settle(&session).await;

    assert_eq!(journal.changes("listener").len(), 1);
    assert_eq!(session.cursor(), Some(Sequence::from(1)));
}

#[tokio::test]
async fn test_start_while_running_fails() {
    let (mut session, _transport, _tx, _journal) = started(0).await;

    assert!(matches!(
        session.start(StartOptions::new().since(1)).await,
        Err(FeedError::AlreadyRunning)
    ));
    assert!(matches!(
        session.add_cache(Arc::new(BrokenCache)),
        Err(FeedError::AlreadyStarted)
    ));

    session.stop();
    settle(&session).await;
}

#[tokio::test]
async fn test_setup_failure_leaves_session_idle() {
    let transport = Arc::new(ChannelTransport::new());
    transport.push_error(FeedError::Status { status: 401, body: "unauthorized".into() });
    let journal = Arc::new(Journal::default());

    let mut session = ChangeSession::new(transport.clone(), "db");
    session.add_listener(Arc::new(RecordingListener("listener", journal.clone()))).unwrap();

    let result = session.start(StartOptions::new().since(0)).await;
    assert!(matches!(result, Err(FeedError::Status { status: 401, .. })));
    assert_eq!(session.state(), SessionState::Idle);
    settle(&session).await;
    assert!(journal.disconnects().is_empty());

    // Cursor lookup failure is a setup failure too.
    assert_err!(session.start(StartOptions::new()).await);
    assert_eq!(session.state(), SessionState::Idle);

    let tx = transport.push_feed();
    assert_ok!(session.start(StartOptions::new().since(0)).await);
    drop(tx);
    settle(&session).await;
    assert_eq!(journal.disconnects(), vec![DisconnectReason::Closed]);
}

#[tokio::test]
async fn test_restart_resumes_from_cursor() {
    let (session, transport, tx, journal) = started(0).await;

    send(&tx, &feed_body(&[DOC1, DOC2])).await;
    tx.send(Err(FeedError::Disconnected("reset".into()))).await.unwrap();
    settle(&session).await;

    let resume = session.cursor().unwrap();
    let tx = transport.push_feed();
    let since = session.start(StartOptions::new().since(resume.clone())).await.unwrap();
    assert_eq!(since, Sequence::from(2));
    assert_eq!(transport.requests()[1].query_value("since"), Some("2"));

    send(&tx, &feed_body(&[DOC3])).await;
    drop(tx);
    settle(&session).await;

    assert_eq!(journal.changes("listener").len(), 3);
    assert_eq!(session.cursor(), Some(Sequence::from(3)));
    assert_eq!(
        journal.disconnects(),
        vec![
            DisconnectReason::ConnectionLost("reset".into()),
            DisconnectReason::Closed,
        ]
    );
}

#[tokio::test]
async fn test_heartbeat_timeout() {
    let transport = Arc::new(ChannelTransport::new());
    let tx = transport.push_feed();
    let journal = Arc::new(Journal::default());
    let config = FeedConfig {
        heartbeat_timeout_ms: Some(50),
        ..FeedConfig::default()
    };

    let mut session = ChangeSession::with_config(transport, "db", config);
    session.add_listener(Arc::new(RecordingListener("listener", journal.clone()))).unwrap();
    session.start(StartOptions::new().since(0)).await.unwrap();

    send(&tx, b"\n").await;
    settle(&session).await;

    assert_eq!(
        journal.disconnects(),
        vec![DisconnectReason::HeartbeatTimeout(Duration::from_millis(50))]
    );
}

#[tokio::test]
async fn test_oversized_line_skipped_feed_continues() {
    let transport = Arc::new(ChannelTransport::new());
    let tx = transport.push_feed();
    let journal = Arc::new(Journal::default());
    let config = FeedConfig {
        max_line_bytes: 128,
        ..FeedConfig::default()
    };

    let mut session = ChangeSession::with_config(transport, "db", config);
    session.add_listener(Arc::new(RecordingListener("listener", journal.clone()))).unwrap();
    session.start(StartOptions::new().since(0)).await.unwrap();

    let huge = format!(r#"{{"seq":9,"id":"big","doc":"{}"}}"#, "x".repeat(4096));
    send(&tx, format!("{}\n", DOC1).as_bytes()).await;
    for piece in huge.as_bytes().chunks(100) {
        send(&tx, piece).await;
    }
    send(&tx, format!("\n{}\n", DOC2).as_bytes()).await;
    drop(tx);
    settle(&session).await;

    let ids: Vec<String> = journal.changes("listener").into_iter().map(|c| c.id).collect();
    assert_eq!(ids, ["doc1", "doc2"]);
    assert_eq!(session.cursor(), Some(Sequence::from(2)));
    assert_eq!(journal.disconnects(), vec![DisconnectReason::Closed]);
}

struct StopAfterFirst {
    handle: Mutex<Option<StopHandle>>,
    journal: Arc<Journal>,
}

impl Listener for StopAfterFirst {
    fn on_change(&self, change: &ChangeRecord) -> anyhow::Result<()> {
        self.journal.0.lock().push(Entry::Change("stopper", change.clone()));
        if let Some(handle) = self.handle.lock().as_ref() {
            handle.stop();
        }
        Ok(())
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        self.journal.0.lock().push(Entry::Disconnect("stopper", reason.clone()));
    }
}

#[tokio::test]
async fn test_stop_from_listener_halts_remaining_lines() {
    let transport = Arc::new(ChannelTransport::new());
    let tx = transport.push_feed();
    let journal = Arc::new(Journal::default());
    let stopper = Arc::new(StopAfterFirst {
        handle: Mutex::new(None),
        journal: journal.clone(),
    });

    let mut session = ChangeSession::new(transport, "db");
    session.add_listener(stopper.clone()).unwrap();
    *stopper.handle.lock() = Some(session.stop_handle());
    session.start(StartOptions::new().since(0)).await.unwrap();

    send(&tx, &feed_body(&[DOC1, DOC2, DOC3])).await;
    settle(&session).await;

    assert_eq!(journal.changes("stopper").len(), 1);
    assert_eq!(journal.disconnects(), vec![DisconnectReason::Stopped]);
}

#[tokio::test]
async fn test_dropping_session_stops_feed() {
    let transport = Arc::new(ChannelTransport::new());
    let _tx = transport.push_feed();
    let (listener, mut events) = ChangeStream::channel();

    let mut session = ChangeSession::new(transport, "db");
    session.add_listener(Arc::new(listener)).unwrap();
    session.start(StartOptions::new().since(0)).await.unwrap();
    drop(session);

    let event = tokio::time::timeout(Duration::from_secs(5), events.next()).await.unwrap();
    assert_eq!(event, Some(FeedEvent::Disconnected(DisconnectReason::Stopped)));
}

/// Holds every `open_feed` until the gate is opened.
#[derive(Default)]
struct GatedTransport {
    gate: Notify,
    inner: ChannelTransport,
}

#[async_trait]
impl Transport for GatedTransport {
    async fn open_feed(&self, request: FeedRequest) -> Result<ByteStream> {
        self.gate.notified().await;
        self.inner.open_feed(request).await
    }

    async fn database_info(&self, database: &str) -> Result<DatabaseInfo> {
        self.inner.database_info(database).await
    }
}

async fn wait_for_state(session: &ChangeSession, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.state() != state {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("state not reached");
}

fn spawn_start(session: &Arc<ChangeSession>) -> tokio::task::JoinHandle<Result<Sequence>> {
    let session = session.clone();
    tokio::spawn(async move { session.start(StartOptions::new().since(0)).await })
}

#[tokio::test]
async fn test_stop_while_starting_ends_run_once_open() {
    let transport = Arc::new(GatedTransport::default());
    let tx = transport.inner.push_feed();
    let journal = Arc::new(Journal::default());

    let mut session = ChangeSession::new(transport.clone(), "db");
    session.add_listener(Arc::new(RecordingListener("listener", journal.clone()))).unwrap();
    let session = Arc::new(session);

    let starting = spawn_start(&session);
    wait_for_state(&session, SessionState::Starting).await;
    session.stop();
    session.stop();
    transport.gate.notify_one();

    assert_eq!(starting.await.unwrap().unwrap(), Sequence::from(0));
    settle(&session).await;

    assert_eq!(journal.disconnects(), vec![DisconnectReason::Stopped]);
    assert_eq!(session.state(), SessionState::Stopped);
    tokio::time::timeout(Duration::from_secs(1), tx.closed())
        .await
        .expect("feed body still held");
}

#[tokio::test]
async fn test_stop_while_starting_then_open_fails() {
    let transport = Arc::new(GatedTransport::default());
    transport.inner.push_error(FeedError::Http("connection refused".into()));
    let journal = Arc::new(Journal::default());

    let mut session = ChangeSession::new(transport.clone(), "db");
    session.add_listener(Arc::new(RecordingListener("listener", journal.clone()))).unwrap();
    let session = Arc::new(session);

    let starting = spawn_start(&session);
    wait_for_state(&session, SessionState::Starting).await;
    session.stop();
    transport.gate.notify_one();

    assert!(matches!(starting.await.unwrap(), Err(FeedError::Http(_))));
    settle(&session).await;
    assert_eq!(session.state(), SessionState::Idle);
    assert!(journal.disconnects().is_empty());

    // The earlier stop does not leak into the next run.
    let tx = transport.inner.push_feed();
    transport.gate.notify_one();
    assert_ok!(session.start(StartOptions::new().since(0)).await);
    send(&tx, &feed_body(&[DOC1])).await;
    drop(tx);
    settle(&session).await;
    assert_eq!(journal.changes("listener").len(), 1);
    assert_eq!(journal.disconnects(), vec![DisconnectReason::Closed]);
}

/// Records the session state seen from inside `on_disconnect`.
#[derive(Default)]
struct StateAtDisconnect {
    session: Mutex<Option<Arc<ChangeSession>>>,
    seen: Mutex<Option<SessionState>>,
}

impl Listener for StateAtDisconnect {
    fn on_change(&self, _change: &ChangeRecord) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_disconnect(&self, _reason: &DisconnectReason) {
        if let Some(session) = self.session.lock().take() {
            *self.seen.lock() = Some(session.state());
        }
    }
}

#[tokio::test]
async fn test_session_not_restartable_until_listeners_notified() {
    let transport = Arc::new(ChannelTransport::new());
    let tx = transport.push_feed();
    let listener = Arc::new(StateAtDisconnect::default());

    let mut session = ChangeSession::new(transport, "db");
    session.add_listener(listener.clone()).unwrap();
    let session = Arc::new(session);
    *listener.session.lock() = Some(session.clone());

    session.start(StartOptions::new().since(0)).await.unwrap();
    drop(tx);
    settle(&session).await;

    assert_eq!(*listener.seen.lock(), Some(SessionState::Running));
    assert_eq!(session.state(), SessionState::Stopped);
}
