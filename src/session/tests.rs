//! Controller scenarios against in-memory signaling and peer backends

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::error::SessionError;
use crate::input::DataChannelTransport;
use crate::signaling::{IceCandidate, LinkEvent, SessionDescription, SignalingLink, SignalingMessage};
use crate::webrtc::{
    MediaKind, PeerBackend, PeerEvent, PeerEventSink, PeerState, RemoteTrack, WebRtcConfig,
};

const WAIT: Duration = Duration::from_secs(5);

/// Server side of one fake signaling connection
struct ServerEnd {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<LinkEvent>,
}

impl ServerEnd {
    async fn recv(&mut self) -> SignalingMessage {
        let text = timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("client closed signaling");
        SignalingMessage::decode(&text).unwrap()
    }

    fn try_recv(&mut self) -> Option<SignalingMessage> {
        self.from_client
            .try_recv()
            .ok()
            .map(|text| SignalingMessage::decode(&text).unwrap())
    }

    /// Everything the client sent until it closed the channel
    async fn drain_until_closed(&mut self) -> Vec<SignalingMessage> {
        let mut messages = vec![];
        loop {
            let next = timeout(WAIT, self.from_client.recv())
                .await
                .expect("client never closed signaling");
            match next {
                Some(text) => messages.push(SignalingMessage::decode(&text).unwrap()),
                None => return messages,
            }
        }
    }

    fn send(&self, message: SignalingMessage) {
        let _ = self
            .to_client
            .send(LinkEvent::Text(message.encode().unwrap()));
    }

    fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(LinkEvent::Text(text.to_string()));
    }

    fn drop_connection(&self, reason: &str) {
        let _ = self.to_client.send(LinkEvent::Closed(Some(reason.to_string())));
    }
}

struct FakeConnector {
    attempts: AtomicUsize,
    refuse: AtomicBool,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

#[async_trait]
impl SignalingConnector for FakeConnector {
    async fn connect(&self, _url: &str) -> Result<SignalingLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("connection refused".into()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerEnd {
            from_client: out_rx,
            to_client: in_tx,
        });
        Ok(SignalingLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

struct FakePeer {
    events: PeerEventSink,
    calls: Mutex<Vec<String>>,
    remote_delay: Duration,
    fail_answer: bool,
}

impl FakePeer {
    fn emit(&self, event: PeerEvent) {
        (self.events)(event);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PeerBackend for FakePeer {
    async fn set_remote_description(&self, offer: SessionDescription) -> Result<()> {
        self.calls.lock().push(format!("remote:{}", offer.sdp));
        if !self.remote_delay.is_zero() {
            tokio::time::sleep(self.remote_delay).await;
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.fail_answer {
            return Err(SessionError::Negotiation("no common codecs".into()));
        }
        self.calls.lock().push("create-answer".into());
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, answer: SessionDescription) -> Result<()> {
        self.calls.lock().push(format!("local:{}", answer.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.calls.lock().push(format!("ice:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.calls.lock().push("close".into());
        Ok(())
    }
}

#[derive(Default)]
struct PeerScript {
    remote_delay: Duration,
    create_delay: Duration,
    fail_answer: bool,
}

struct FakePeerFactory {
    script: Mutex<PeerScript>,
    peers: mpsc::UnboundedSender<Arc<FakePeer>>,
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        _config: &WebRtcConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerBackend>> {
        let (remote_delay, create_delay, fail_answer) = {
            let script = self.script.lock();
            (script.remote_delay, script.create_delay, script.fail_answer)
        };
        if !create_delay.is_zero() {
            tokio::time::sleep(create_delay).await;
        }

        let peer = Arc::new(FakePeer {
            events,
            calls: Mutex::new(vec![]),
            remote_delay,
            fail_answer,
        });
        let _ = self.peers.send(peer.clone());
        Ok(peer)
    }
}

struct FakeDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl FakeDataChannel {
    fn new(label: &str, open: bool) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(open),
            closed: AtomicBool::new(false),
            sent: Mutex::new(vec![]),
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannelTransport for FakeDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    tracks: Mutex<Vec<String>>,
}

impl MediaSink for RecordingSink {
    fn attach_track(&self, track: RemoteTrack) {
        self.tracks.lock().push(track.id);
    }
}

type Statuses = Arc<Mutex<Vec<(ConnectionState, String)>>>;
type Errors = Arc<Mutex<Vec<(String, String)>>>;

struct Harness {
    controller: SessionController,
    connector: Arc<FakeConnector>,
    factory: Arc<FakePeerFactory>,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
    peers: mpsc::UnboundedReceiver<Arc<FakePeer>>,
    statuses: Statuses,
    errors: Errors,
    sink: Arc<RecordingSink>,
}

fn test_config(session_id: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.session.server_url = "http://render.test".into();
    config.session.session_id = session_id.into();
    config.session.auto_keepalive = false;
    config.reconnect.base_delay_ms = 100;
    config.reconnect.max_attempts = 5;
    config
}

fn harness(config: AppConfig) -> Harness {
    harness_with(config, PeerScript::default())
}

fn harness_with(config: AppConfig, script: PeerScript) -> Harness {
    let (servers_tx, servers) = mpsc::unbounded_channel();
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let connector = Arc::new(FakeConnector {
        attempts: AtomicUsize::new(0),
        refuse: AtomicBool::new(false),
        servers: servers_tx,
    });
    let factory = Arc::new(FakePeerFactory {
        script: Mutex::new(script),
        peers: peers_tx,
    });

    let controller =
        create_session_controller_with(config, connector.clone(), factory.clone()).unwrap();

    let statuses: Statuses = Arc::default();
    let errors: Errors = Arc::default();
    let recorded = statuses.clone();
    controller.on_status(move |state, message| {
        recorded.lock().push((state, message.to_string()));
    });
    let recorded = errors.clone();
    controller.on_error(move |context, detail| {
        recorded.lock().push((context.to_string(), detail.to_string()));
    });

    Harness {
        controller,
        connector,
        factory,
        servers,
        peers,
        statuses,
        errors,
        sink: Arc::new(RecordingSink::default()),
    }
}

impl Harness {
    fn connect(&self) {
        self.controller.connect(self.sink.clone());
    }

    async fn next_server(&mut self) -> ServerEnd {
        timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for signaling connection")
            .unwrap()
    }

    async fn next_peer(&mut self) -> Arc<FakePeer> {
        timeout(WAIT, self.peers.recv())
            .await
            .expect("timed out waiting for peer connection")
            .unwrap()
    }

    /// Wait for the next stack and consume its join message
    async fn next_stack(&mut self) -> (ServerEnd, Arc<FakePeer>) {
        let mut server = self.next_server().await;
        let peer = self.next_peer().await;
        let session_id = self.controller.session_id().to_string();
        assert_eq!(server.recv().await, SignalingMessage::join(session_id));
        (server, peer)
    }

    async fn connect_and_join(&mut self) -> (ServerEnd, Arc<FakePeer>) {
        self.connect();
        self.next_stack().await
    }

    async fn wait_for_state(&self, state: ConnectionState) {
        let mut watch = self.controller.watch();
        timeout(WAIT, watch.wait_for(|snapshot| snapshot.state == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
            .expect("controller gone");
    }

    fn attempts(&self) -> usize {
        self.connector.attempts.load(Ordering::SeqCst)
    }

    fn statuses(&self) -> Vec<(ConnectionState, String)> {
        self.statuses.lock().clone()
    }

    fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().clone()
    }

    fn status_messages(&self, state: ConnectionState) -> Vec<String> {
        self.statuses()
            .into_iter()
            .filter(|(s, _)| *s == state)
            .map(|(_, message)| message)
            .collect()
    }
}

/// Let every runnable task finish
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn status(state: ConnectionState, message: &str) -> (ConnectionState, String) {
    (state, message.to_string())
}

fn offer(sdp: &str) -> SignalingMessage {
    SignalingMessage::Offer {
        offer: SessionDescription::offer(sdp),
    }
}

fn remote_candidate(candidate: &str) -> SignalingMessage {
    SignalingMessage::IceCandidate {
        candidate: IceCandidate::new(candidate).with_mid("0", 0),
    }
}

#[tokio::test(start_paused = true)]
async fn test_join_then_ready_reported_once() {
    let mut h = harness(test_config("s1"));
    let (server, _peer) = h.connect_and_join().await;

    server.send(SignalingMessage::Ready);
    h.wait_for_state(ConnectionState::SignalingReady).await;
    settle().await;

    assert_eq!(
        h.statuses(),
        vec![
            status(ConnectionState::Connecting, "Connecting to signaling server"),
            status(ConnectionState::SignalingReady, "Ready"),
        ]
    );
    assert!(h.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_offer_answered_exactly_once() {
    let mut h = harness(test_config("abc"));
    let (mut server, peer) = h.connect_and_join().await;

    server.send(offer("v=0 remote"));
    match server.recv().await {
        SignalingMessage::Answer { answer } => {
            assert_eq!(answer.sdp_type, "answer");
            assert_eq!(answer.sdp, "v=0 answer");
        }
        other => panic!("Expected answer, got {:?}", other),
    }
    settle().await;

    assert!(server.try_recv().is_none());
    assert_eq!(h.controller.state(), ConnectionState::Negotiating);
    assert_eq!(
        peer.calls(),
        vec!["remote:v=0 remote", "create-answer", "local:v=0 answer"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_offer_reported_as_protocol_error() {
    let mut h = harness(test_config("abc"));
    let (mut server, peer) = h.connect_and_join().await;

    server.send(offer("first"));
    assert!(matches!(server.recv().await, SignalingMessage::Answer { .. }));
    settle().await;
    let statuses_before = h.statuses();

    server.send(offer("second"));
    settle().await;

    assert!(server.try_recv().is_none());
    assert!(!peer.calls().contains(&"remote:second".to_string()));
    let errors = h.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "Protocol error");
    assert_eq!(h.controller.state(), ConnectionState::Negotiating);
    assert_eq!(h.statuses(), statuses_before);
    assert_eq!(h.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_early_candidates_applied_in_order_after_answer() {
    let script = PeerScript {
        remote_delay: Duration::from_millis(50),
        ..Default::default()
    };
    let mut h = harness_with(test_config("abc"), script);
    let (mut server, peer) = h.connect_and_join().await;

    server.send(remote_candidate("c0"));
    server.send(offer("v=0"));
    server.send(remote_candidate("c1"));
    server.send(remote_candidate("c2"));
    server.send(remote_candidate("c3"));

    assert!(matches!(server.recv().await, SignalingMessage::Answer { .. }));
    settle().await;

    let calls = peer.calls();
    let ice: Vec<_> = calls.iter().filter(|c| c.starts_with("ice:")).cloned().collect();
    assert_eq!(ice, vec!["ice:c0", "ice:c1", "ice:c2", "ice:c3"]);

    let local = calls.iter().position(|c| c.starts_with("local:")).unwrap();
    let first_ice = calls.iter().position(|c| c.starts_with("ice:")).unwrap();
    assert!(first_ice > local);

    // After negotiation candidates go straight to the connection
    server.send(remote_candidate("c4"));
    settle().await;
    assert_eq!(peer.calls().last().unwrap(), "ice:c4");
}

#[tokio::test(start_paused = true)]
async fn test_local_candidates_trickled_to_server() {
    let mut h = harness(test_config("abc"));
    let (mut server, peer) = h.connect_and_join().await;

    peer.emit(PeerEvent::LocalCandidate(
        IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5000 typ host").with_mid("0", 0),
    ));

    match server.recv().await {
        SignalingMessage::IceCandidate { candidate } => {
            assert!(candidate.candidate.starts_with("candidate:1"));
            assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            assert_eq!(candidate.sdp_mline_index, Some(0));
        }
        other => panic!("Expected ice-candidate, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_input_dropped_until_channel_open() {
    let mut h = harness(test_config("abc"));

    // No connection at all
    h.controller.send_click(1.0, 2.0);
    settle().await;

    let (_server, peer) = h.connect_and_join().await;
    h.controller.send_text("lost");
    settle().await;

    let channel = FakeDataChannel::new("input", false);
    peer.emit(PeerEvent::DataChannelOpen(channel.clone()));
    h.controller.send_scroll(-3.0);
    settle().await;
    assert!(channel.sent().is_empty());

    channel.open.store(true, Ordering::SeqCst);
    h.controller.send_click(10.4, 19.6);
    h.controller.send_scroll(-120.0);
    h.controller.send_text("hello");
    settle().await;

    assert_eq!(
        channel.sent(),
        vec![
            r#"{"type":"click","x":10,"y":20}"#,
            r#"{"type":"scroll","deltaY":-120}"#,
            r#"{"type":"text","text":"hello"}"#,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_input_channel_label_filter() {
    let mut config = test_config("abc");
    config.session.input_channel_label = Some("input".into());
    let mut h = harness(config);
    let (_server, peer) = h.connect_and_join().await;

    let cursor = FakeDataChannel::new("cursor", true);
    peer.emit(PeerEvent::DataChannelOpen(cursor.clone()));
    h.controller.send_click(1.0, 1.0);
    settle().await;
    assert!(cursor.sent().is_empty());

    let input = FakeDataChannel::new("input", true);
    peer.emit(PeerEvent::DataChannelOpen(input.clone()));
    h.controller.send_click(1.0, 1.0);
    settle().await;
    assert!(cursor.sent().is_empty());
    assert_eq!(input.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_first_track_means_connected() {
    let mut h = harness(test_config("abc"));
    let (_server, peer) = h.connect_and_join().await;

    peer.emit(PeerEvent::Track(RemoteTrack::new(
        "video0",
        "stream0",
        MediaKind::Video,
    )));
    peer.emit(PeerEvent::Track(RemoteTrack::new(
        "audio0",
        "stream0",
        MediaKind::Audio,
    )));
    h.wait_for_state(ConnectionState::Connected).await;
    settle().await;

    assert_eq!(*h.sink.tracks.lock(), vec!["video0", "audio0"]);
    assert_eq!(h.status_messages(ConnectionState::Connected), vec!["Connected"]);
}

#[tokio::test(start_paused = true)]
async fn test_refused_connections_exhaust_retries() {
    let mut h = harness(test_config("abc"));
    h.connector.refuse.store(true, Ordering::SeqCst);

    h.connect();
    h.wait_for_state(ConnectionState::Failed).await;
    settle().await;

    // Initial attempt plus five retries
    assert_eq!(h.attempts(), 6);
    assert_eq!(
        h.status_messages(ConnectionState::Reconnecting),
        vec![
            "Reconnecting in 100 ms (attempt 1/5)",
            "Reconnecting in 200 ms (attempt 2/5)",
            "Reconnecting in 300 ms (attempt 3/5)",
            "Reconnecting in 400 ms (attempt 4/5)",
            "Reconnecting in 500 ms (attempt 5/5)",
        ]
    );
    assert_eq!(
        h.statuses().last().unwrap(),
        &status(ConnectionState::Failed, "Connection failed")
    );

    let errors = h.errors();
    let (context, detail) = errors.last().unwrap();
    assert_eq!(context, "Reconnect failed");
    assert!(detail.contains("5 attempts"));

    // Terminal: nothing else is attempted
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.attempts(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_retry_counter_resets_after_connected() {
    let mut h = harness(test_config("abc"));
    let (server, _peer) = h.connect_and_join().await;

    server.drop_connection("1006 abnormal");
    let (server, _peer) = h.next_stack().await;
    server.drop_connection("1006 abnormal");
    let (server, peer) = h.next_stack().await;
    assert_eq!(h.controller.reconnect_state().attempt, 2);

    peer.emit(PeerEvent::Track(RemoteTrack::new("v", "s", MediaKind::Video)));
    h.wait_for_state(ConnectionState::Connected).await;
    assert_eq!(h.controller.reconnect_state().attempt, 0);

    server.drop_connection("1006 abnormal");
    h.wait_for_state(ConnectionState::Reconnecting).await;
    assert_eq!(
        h.status_messages(ConnectionState::Reconnecting),
        vec![
            "Reconnecting in 100 ms (attempt 1/5)",
            "Reconnecting in 200 ms (attempt 2/5)",
            "Reconnecting in 100 ms (attempt 1/5)",
        ]
    );
    assert_eq!(h.controller.reconnect_state().attempt, 1);
    assert_eq!(h.controller.reconnect_state().next_delay_ms, 100);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_backoff_cancels_rebuild() {
    let mut config = test_config("abc");
    config.reconnect.base_delay_ms = 1000;
    let mut h = harness(config);
    let (server, _peer) = h.connect_and_join().await;

    server.drop_connection("going away");
    h.wait_for_state(ConnectionState::Reconnecting).await;

    h.controller.disconnect();
    h.wait_for_state(ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.attempts(), 1);
    assert!(h.servers.try_recv().is_err());
    assert_eq!(
        h.statuses().last().unwrap(),
        &status(ConnectionState::Disconnected, "Disconnected")
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_negotiation_discards_answer() {
    let script = PeerScript {
        remote_delay: Duration::from_millis(200),
        ..Default::default()
    };
    let mut h = harness_with(test_config("abc"), script);
    let (mut server, peer) = h.connect_and_join().await;

    server.send(offer("v=0"));
    h.wait_for_state(ConnectionState::Negotiating).await;
    h.controller.disconnect();
    h.wait_for_state(ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let sent = server.drain_until_closed().await;
    assert!(sent.iter().all(|m| !matches!(m, SignalingMessage::Answer { .. })));
    assert_eq!(peer.calls().last().unwrap(), "close");
    assert_eq!(h.controller.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_releases_everything() {
    let mut config = test_config("abc");
    config.session.auto_keepalive = true;
    let mut h = harness(config);
    let (mut server, peer) = h.connect_and_join().await;

    let channel = FakeDataChannel::new("input", true);
    peer.emit(PeerEvent::DataChannelOpen(channel.clone()));
    settle().await;

    h.controller.disconnect();
    h.wait_for_state(ConnectionState::Disconnected).await;

    assert!(channel.closed.load(Ordering::SeqCst));
    assert!(peer.calls().contains(&"close".to_string()));

    // No keepalive after the link is gone
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert!(server.drain_until_closed().await.is_empty());

    h.controller.send_click(5.0, 5.0);
    settle().await;
    assert!(channel.sent().is_empty());

    // Second disconnect is harmless
    h.controller.disconnect();
    settle().await;
    assert_eq!(h.controller.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_events_from_replaced_stack_ignored() {
    let mut h = harness(test_config("abc"));
    let (server, old_peer) = h.connect_and_join().await;

    server.drop_connection("1006 abnormal");
    let (mut server, new_peer) = h.next_stack().await;
    assert!(old_peer.calls().contains(&"close".to_string()));

    old_peer.emit(PeerEvent::LocalCandidate(IceCandidate::new("stale")));
    old_peer.emit(PeerEvent::StateChanged(PeerState::Failed));
    settle().await;
    assert!(server.try_recv().is_none());
    assert_eq!(h.attempts(), 2);
    assert_eq!(h.controller.state(), ConnectionState::Connecting);

    new_peer.emit(PeerEvent::LocalCandidate(IceCandidate::new("fresh")));
    match server.recv().await {
        SignalingMessage::IceCandidate { candidate } => assert_eq!(candidate.candidate, "fresh"),
        other => panic!("Expected ice-candidate, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_failure_triggers_reconnect() {
    let script = PeerScript {
        fail_answer: true,
        ..Default::default()
    };
    let mut h = harness_with(test_config("abc"), script);
    let (mut server, _peer) = h.connect_and_join().await;

    server.send(offer("v=0"));
    h.wait_for_state(ConnectionState::Reconnecting).await;

    let sent = server.drain_until_closed().await;
    assert!(sent.is_empty());
    assert_eq!(h.errors()[0].0, "Negotiation failed");

    h.factory.script.lock().fail_answer = false;
    let (_server, _peer) = h.next_stack().await;
    assert_eq!(h.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_reported_without_state_change() {
    let mut h = harness(test_config("abc"));
    let (server, _peer) = h.connect_and_join().await;

    server.send(SignalingMessage::Ready);
    server.send(SignalingMessage::Error {
        message: "session expired".into(),
    });
    h.wait_for_state(ConnectionState::SignalingReady).await;
    settle().await;

    assert_eq!(
        h.errors(),
        vec![("Server error".to_string(), "session expired".to_string())]
    );
    assert_eq!(h.controller.state(), ConnectionState::SignalingReady);
    assert_eq!(h.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_messages_reported_as_protocol_errors() {
    let mut h = harness(test_config("abc"));
    let (server, _peer) = h.connect_and_join().await;

    server.send(SignalingMessage::Ready);
    h.wait_for_state(ConnectionState::SignalingReady).await;
    settle().await;
    let statuses_before = h.statuses();

    server.send_raw("{not json");
    server.send_raw(r#"{"type":"teleport"}"#);
    server.send(SignalingMessage::join("abc"));
    server.send(SignalingMessage::Answer {
        answer: SessionDescription::answer("v=0"),
    });
    settle().await;

    let errors = h.errors();
    assert_eq!(errors.len(), 4);
    assert!(errors.iter().all(|(context, _)| context == "Protocol error"));
    assert!(errors[2].1.contains("join"));
    assert!(errors[3].1.contains("answer"));
    assert_eq!(h.controller.state(), ConnectionState::SignalingReady);
    assert_eq!(h.statuses(), statuses_before);
    assert_eq!(h.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_offer_triggers_reconnect() {
    let mut h = harness(test_config("abc"));
    let (mut server, peer) = h.connect_and_join().await;

    server.send_raw(r#"{"type":"offer","offer":{"type":"offer"}}"#);
    h.wait_for_state(ConnectionState::Reconnecting).await;

    let sent = server.drain_until_closed().await;
    assert!(sent.is_empty());
    assert!(!peer.calls().iter().any(|call| call.starts_with("remote:")));
    let errors = h.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "Negotiation failed");

    let (_server, _peer) = h.next_stack().await;
    assert_eq!(h.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_pings_every_interval() {
    let mut h = harness(test_config("abc"));
    let (mut server, _peer) = h.connect_and_join().await;

    h.controller.start_keep_alive();
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(server.try_recv().is_none());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(server.recv().await, SignalingMessage::Ping);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(server.recv().await, SignalingMessage::Ping);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_follows_reconnect() {
    let mut h = harness(test_config("abc"));
    let (server, _peer) = h.connect_and_join().await;
    h.controller.start_keep_alive();
    settle().await;

    server.drop_connection("1006 abnormal");
    let (mut server, _peer) = h.next_stack().await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(server.recv().await, SignalingMessage::Ping);
}

#[tokio::test(start_paused = true)]
async fn test_server_ping_answered() {
    let mut h = harness(test_config("abc"));
    let (mut server, _peer) = h.connect_and_join().await;

    server.send(SignalingMessage::Ping);
    assert_eq!(server.recv().await, SignalingMessage::Pong);
}

#[tokio::test(start_paused = true)]
async fn test_peer_failure_triggers_reconnect() {
    let mut h = harness(test_config("abc"));
    let (_server, peer) = h.connect_and_join().await;

    peer.emit(PeerEvent::StateChanged(PeerState::Failed));
    h.wait_for_state(ConnectionState::Reconnecting).await;
    assert_eq!(h.errors()[0].0, "Peer connection failed");

    let (_server, _peer) = h.next_stack().await;
    assert_eq!(h.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_peer_interruption_and_recovery() {
    let mut h = harness(test_config("abc"));
    let (_server, peer) = h.connect_and_join().await;

    peer.emit(PeerEvent::Track(RemoteTrack::new("v", "s", MediaKind::Video)));
    h.wait_for_state(ConnectionState::Connected).await;

    peer.emit(PeerEvent::StateChanged(PeerState::Disconnected));
    h.wait_for_state(ConnectionState::Disconnected).await;
    peer.emit(PeerEvent::StateChanged(PeerState::Connected));
    h.wait_for_state(ConnectionState::Connected).await;

    assert_eq!(
        h.status_messages(ConnectionState::Disconnected),
        vec!["Peer connection interrupted"]
    );
    assert_eq!(h.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_peer_closed_does_not_reconnect() {
    let mut h = harness(test_config("abc"));
    let (_server, peer) = h.connect_and_join().await;

    peer.emit(PeerEvent::StateChanged(PeerState::Closed));
    h.wait_for_state(ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.attempts(), 1);
    assert_eq!(
        h.statuses().last().unwrap(),
        &status(ConnectionState::Disconnected, "Peer connection closed")
    );
}

#[tokio::test(start_paused = true)]
async fn test_signaling_lost_while_peer_created() {
    let script = PeerScript {
        create_delay: Duration::from_millis(50),
        ..Default::default()
    };
    let mut h = harness_with(test_config("abc"), script);
    h.connect();

    let server = h.next_server().await;
    server.send(SignalingMessage::Ready);
    server.drop_connection("1001 going away");

    h.wait_for_state(ConnectionState::Reconnecting).await;
    let states: Vec<_> = h.statuses().into_iter().map(|(s, _)| s).collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::SignalingReady,
            ConnectionState::Reconnecting,
        ]
    );
    assert_eq!(h.errors()[0].0, "Signaling connection lost");
}

#[tokio::test(start_paused = true)]
async fn test_connect_recovers_from_failed() {
    let mut config = test_config("abc");
    config.reconnect.max_attempts = 1;
    let mut h = harness(config);
    h.connector.refuse.store(true, Ordering::SeqCst);

    h.connect();
    h.wait_for_state(ConnectionState::Failed).await;
    assert_eq!(h.attempts(), 2);

    h.connector.refuse.store(false, Ordering::SeqCst);
    let (server, _peer) = h.connect_and_join().await;
    server.send(SignalingMessage::Ready);
    h.wait_for_state(ConnectionState::SignalingReady).await;
    assert_eq!(h.controller.reconnect_state().attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_active_rebuilds() {
    let mut h = harness(test_config("abc"));
    let (mut old_server, old_peer) = h.connect_and_join().await;

    let (_server, _peer) = h.connect_and_join().await;
    assert!(old_server.drain_until_closed().await.is_empty());
    assert!(old_peer.calls().contains(&"close".to_string()));
    assert_eq!(h.attempts(), 2);
    assert_eq!(h.controller.state(), ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_replaced() {
    let mut h = harness(test_config("abc"));
    let replacement: Statuses = Arc::default();
    let recorded = replacement.clone();
    h.controller.on_status(move |state, message| {
        recorded.lock().push((state, message.to_string()));
    });

    let (server, _peer) = h.connect_and_join().await;
    server.send(SignalingMessage::Ready);
    h.wait_for_state(ConnectionState::SignalingReady).await;

    assert!(h.statuses().is_empty());
    assert_eq!(replacement.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_controllers_are_independent() {
    let mut first = harness(test_config("one"));
    let mut second = harness(test_config("two"));

    let (server_one, _) = first.connect_and_join().await;
    let (_server_two, _) = second.connect_and_join().await;

    server_one.drop_connection("1006 abnormal");
    first.wait_for_state(ConnectionState::Reconnecting).await;
    settle().await;

    assert_eq!(second.controller.state(), ConnectionState::Connecting);
    assert!(second.errors().is_empty());
    assert_eq!(second.controller.session_id(), "two");
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handles_tears_down() {
    let mut h = harness(test_config("abc"));
    let (mut server, peer) = h.connect_and_join().await;

    let Harness { controller, .. } = h;
    let observer = controller.clone();
    drop(controller);
    settle().await;
    assert!(peer.calls().is_empty());

    drop(observer);
    assert!(server.drain_until_closed().await.is_empty());
    settle().await;
    assert_eq!(peer.calls(), vec!["close"]);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let (servers, _) = mpsc::unbounded_channel();
    let (peers, _) = mpsc::unbounded_channel();
    let connector = Arc::new(FakeConnector {
        attempts: AtomicUsize::new(0),
        refuse: AtomicBool::new(false),
        servers,
    });
    let factory = Arc::new(FakePeerFactory {
        script: Mutex::new(PeerScript::default()),
        peers,
    });

    let result = create_session_controller_with(test_config(""), connector, factory);
    assert!(matches!(result, Err(SessionError::Config(_))));
}
