//! Controller state machine
//!
//! All controller state lives in one task. External events (handle calls,
//! signaling frames, peer callbacks, timer firings) arrive as
//! [`ControllerTask`]s on one queue and run to completion in arrival order,
//! so no controller state needs a lock.
//!
//! Every stack (signaling transport + peer session) is built under a
//! generation number. Tasks produced by a stack carry that number and are
//! dropped once the generation moves on, which happens on every teardown.
//! A disconnect therefore turns any in-flight negotiation, build or backoff
//! timer into a no-op.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};
use super::state::ConnectionState;
use crate::config::AppConfig;
use crate::error::{Result, SessionError};
use crate::events::StatusNotifier;
use crate::input::{DataChannelTransport, InputChannel, InputEvent};
use crate::signaling::{
    SessionDescription, SignalingConnector, SignalingMessage, SignalingTransport, TransportEvent,
};
use crate::webrtc::{MediaSink, PeerEvent, PeerEventSink, PeerFactory, PeerSession, PeerState};

/// Unit of work for the controller task
pub(crate) enum ControllerTask {
    Connect(Arc<dyn MediaSink>),
    Disconnect,
    StartKeepAlive,
    Input(InputEvent),
    StackReady {
        generation: u64,
        result: Result<(SignalingTransport, PeerSession)>,
    },
    Signaling {
        generation: u64,
        event: TransportEvent,
    },
    Peer {
        generation: u64,
        event: PeerEvent,
    },
    Negotiated {
        generation: u64,
        result: Result<SessionDescription>,
    },
    ReconnectDue {
        generation: u64,
    },
    KeepAliveTick {
        generation: u64,
    },
}

/// Observable controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub reconnect: ReconnectState,
}

type TaskSender = mpsc::WeakUnboundedSender<ControllerTask>;

/// Queue a task if the controller is still alive
fn post(tasks: &TaskSender, task: ControllerTask) -> bool {
    match tasks.upgrade() {
        Some(tx) => tx.send(task).is_ok(),
        None => false,
    }
}

/// Live signaling transport + peer session pair
struct Stack {
    transport: SignalingTransport,
    peer: PeerSession,
    keepalive: Option<JoinHandle<()>>,
    negotiation: Option<JoinHandle<()>>,
}

pub(crate) struct Controller {
    config: Arc<AppConfig>,
    signaling_url: String,
    connector: Arc<dyn SignalingConnector>,
    peer_factory: Arc<dyn PeerFactory>,
    notifier: Arc<StatusNotifier>,
    snapshot: watch::Sender<Snapshot>,
    tasks: TaskSender,
    state: ConnectionState,
    generation: u64,
    stack: Option<Stack>,
    building: Option<JoinHandle<()>>,
    /// Stack events that arrived before the stack was installed
    deferred: VecDeque<ControllerTask>,
    reconnect_timer: Option<JoinHandle<()>>,
    sink: Option<Arc<dyn MediaSink>>,
    policy: ReconnectPolicy,
    input: InputChannel,
    keepalive_requested: bool,
}

impl Controller {
    pub(crate) fn new(
        config: Arc<AppConfig>,
        signaling_url: String,
        connector: Arc<dyn SignalingConnector>,
        peer_factory: Arc<dyn PeerFactory>,
        notifier: Arc<StatusNotifier>,
        snapshot: watch::Sender<Snapshot>,
        tasks: TaskSender,
    ) -> Self {
        let policy = ReconnectPolicy::new(&config.reconnect);
        let keepalive_requested = config.session.auto_keepalive;
        Self {
            config,
            signaling_url,
            connector,
            peer_factory,
            notifier,
            snapshot,
            tasks,
            state: ConnectionState::Idle,
            generation: 0,
            stack: None,
            building: None,
            deferred: VecDeque::new(),
            reconnect_timer: None,
            sink: None,
            policy,
            input: InputChannel::new(),
            keepalive_requested,
        }
    }

    /// Process tasks until every handle is gone
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ControllerTask>) {
        while let Some(task) = rx.recv().await {
            self.handle(task).await;
            while self.stack.is_some() {
                let Some(task) = self.deferred.pop_front() else {
                    break;
                };
                self.handle(task).await;
            }
        }

        self.cancel_reconnect();
        self.teardown().await;
        debug!(
            "Session controller for '{}' stopped",
            self.config.session.session_id
        );
    }

    async fn handle(&mut self, task: ControllerTask) {
        match task {
            ControllerTask::Connect(sink) => self.connect(sink).await,
            ControllerTask::Disconnect => self.disconnect().await,
            ControllerTask::StartKeepAlive => {
                self.keepalive_requested = true;
                self.start_keepalive();
            }
            ControllerTask::Input(event) => {
                self.input.send(&event).await;
            }
            ControllerTask::StackReady { generation, result } => {
                if generation != self.generation {
                    if let Ok((mut transport, mut peer)) = result {
                        debug!("Discarding stack from superseded generation {}", generation);
                        transport.close();
                        peer.close().await;
                    }
                    return;
                }
                self.building = None;
                match result {
                    Ok((transport, peer)) => self.install_stack(transport, peer),
                    Err(e) => self.handle_failure("Connection failed", e).await,
                }
            }
            task @ (ControllerTask::Signaling { .. } | ControllerTask::Peer { .. })
                if self.is_building(&task) =>
            {
                self.deferred.push_back(task);
            }
            ControllerTask::Signaling { generation, event } => {
                if self.is_current(generation) {
                    self.handle_signaling(event).await;
                } else {
                    debug!("Dropping signaling event from generation {}", generation);
                }
            }
            ControllerTask::Peer { generation, event } => {
                if self.is_current(generation) {
                    self.handle_peer(event).await;
                } else {
                    debug!("Dropping peer event from generation {}", generation);
                }
            }
            ControllerTask::Negotiated { generation, result } => {
                if self.is_current(generation) {
                    self.finish_negotiation(result).await;
                }
            }
            ControllerTask::ReconnectDue { generation } => {
                if generation == self.generation && self.state == ConnectionState::Reconnecting {
                    self.reconnect_timer = None;
                    self.start_attempt();
                } else {
                    debug!("Ignoring superseded reconnect timer");
                }
            }
            ControllerTask::KeepAliveTick { generation } => {
                if self.is_current(generation) {
                    if let Some(stack) = &self.stack {
                        stack.transport.send(&SignalingMessage::Ping);
                    }
                }
            }
        }
    }

    /// Whether `generation` names the live stack
    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.stack.is_some()
    }

    /// Whether `task` belongs to the stack currently being built
    fn is_building(&self, task: &ControllerTask) -> bool {
        let generation = match task {
            ControllerTask::Signaling { generation, .. } | ControllerTask::Peer { generation, .. } => {
                *generation
            }
            _ => return false,
        };
        generation == self.generation && self.stack.is_none() && self.building.is_some()
    }

    async fn connect(&mut self, sink: Arc<dyn MediaSink>) {
        if self.stack.is_some() || self.building.is_some() {
            info!("connect() while active, rebuilding session stack");
        }
        self.sink = Some(sink);
        self.cancel_reconnect();
        self.teardown().await;
        self.policy.reset();
        self.start_attempt();
    }

    async fn disconnect(&mut self) {
        self.cancel_reconnect();
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected, "Disconnected");
    }

    /// Build a fresh stack under a new generation
    fn start_attempt(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.set_state(
            ConnectionState::Connecting,
            "Connecting to signaling server",
        );

        let build = build_stack(
            self.connector.clone(),
            self.peer_factory.clone(),
            self.config.clone(),
            self.signaling_url.clone(),
            self.tasks.clone(),
            generation,
        );
        let tasks = self.tasks.clone();
        self.building = Some(tokio::spawn(async move {
            let result = build.await;
            post(&tasks, ControllerTask::StackReady { generation, result });
        }));
    }

    fn install_stack(&mut self, transport: SignalingTransport, peer: PeerSession) {
        let session_id = self.config.session.session_id.clone();
        transport.send(&SignalingMessage::join(session_id.as_str()));
        info!("Joined session '{}' via {}", session_id, transport.url());

        self.stack = Some(Stack {
            transport,
            peer,
            keepalive: None,
            negotiation: None,
        });

        if self.keepalive_requested {
            self.start_keepalive();
        }
    }

    fn start_keepalive(&mut self) {
        let generation = self.generation;
        let period = Duration::from_secs(self.config.session.keepalive_interval_secs);
        let tasks = self.tasks.clone();

        let Some(stack) = self.stack.as_mut() else {
            return;
        };
        if stack.keepalive.is_some() {
            return;
        }

        debug!("Keepalive started ({:?})", period);
        stack.keepalive = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !post(&tasks, ControllerTask::KeepAliveTick { generation }) {
                    break;
                }
            }
        }));
    }

    async fn handle_signaling(&mut self, event: TransportEvent) {
        let message = match event {
            TransportEvent::Message(message) => message,
            TransportEvent::Rejected(e) if e.triggers_reconnect() => {
                self.handle_failure("Negotiation failed", e).await;
                return;
            }
            TransportEvent::Rejected(e) => {
                self.report_protocol_error(&e);
                return;
            }
            TransportEvent::Closed(e) => {
                self.handle_failure("Signaling connection lost", e).await;
                return;
            }
        };
        debug!("Signaling received: {}", message.kind());

        match message {
            SignalingMessage::Ready => {
                self.set_state(ConnectionState::SignalingReady, "Ready");
            }
            SignalingMessage::Offer { offer } => self.begin_negotiation(offer).await,
            SignalingMessage::IceCandidate { candidate } => {
                if let Some(stack) = self.stack.as_mut() {
                    stack.peer.add_remote_candidate(candidate).await;
                }
            }
            SignalingMessage::Error { message } => {
                warn!("Signaling server error: {}", message);
                self.notifier.notify_error("Server error", &message);
            }
            SignalingMessage::Ping => {
                if let Some(stack) = &self.stack {
                    stack.transport.send(&SignalingMessage::Pong);
                }
            }
            SignalingMessage::Pong => debug!("Keepalive pong"),
            other => {
                let error = SessionError::Protocol(format!(
                    "Unexpected '{}' message from server",
                    other.kind()
                ));
                self.report_protocol_error(&error);
            }
        }
    }

    /// Report a dropped inbound message; state and reconnect budget are untouched
    fn report_protocol_error(&self, error: &SessionError) {
        warn!("Dropping signaling message: {}", error);
        self.notifier.notify_error("Protocol error", &error.to_string());
    }

    async fn begin_negotiation(&mut self, offer: SessionDescription) {
        let generation = self.generation;
        let tasks = self.tasks.clone();
        let Some(stack) = self.stack.as_mut() else {
            return;
        };

        match stack.peer.accept_offer(offer) {
            Ok(negotiation) => {
                stack.negotiation = Some(tokio::spawn(async move {
                    let result = negotiation.await;
                    post(&tasks, ControllerTask::Negotiated { generation, result });
                }));
                self.set_state(ConnectionState::Negotiating, "Negotiating");
            }
            Err(e) if e.triggers_reconnect() => self.handle_failure("Negotiation failed", e).await,
            Err(e) => self.report_protocol_error(&e),
        }
    }

    async fn finish_negotiation(&mut self, result: Result<SessionDescription>) {
        let Some(stack) = self.stack.as_mut() else {
            return;
        };
        stack.negotiation = None;

        match result {
            Ok(answer) => {
                stack
                    .transport
                    .send(&SignalingMessage::Answer { answer });
                stack.peer.complete_negotiation().await;
                debug!("Answer sent");
            }
            Err(e) => {
                stack.peer.fail_negotiation();
                self.handle_failure("Negotiation failed", e).await;
            }
        }
    }

    async fn handle_peer(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(stack) = &self.stack {
                    stack
                        .transport
                        .send(&SignalingMessage::IceCandidate { candidate });
                }
            }
            PeerEvent::Track(track) => {
                if let Some(sink) = &self.sink {
                    sink.attach_track(track);
                }
                if self.state != ConnectionState::Connected {
                    self.set_state(ConnectionState::Connected, "Connected");
                }
            }
            PeerEvent::DataChannelOpen(channel) => self.adopt_data_channel(channel),
            PeerEvent::StateChanged(PeerState::Failed) => {
                self.handle_failure(
                    "Peer connection failed",
                    SessionError::Transport("peer connection failed".into()),
                )
                .await;
            }
            PeerEvent::StateChanged(PeerState::Closed) => {
                info!("Peer connection closed by remote");
                self.cancel_reconnect();
                self.teardown().await;
                self.set_state(ConnectionState::Disconnected, "Peer connection closed");
            }
            PeerEvent::StateChanged(PeerState::Disconnected) => {
                if self.state == ConnectionState::Connected {
                    self.set_state(ConnectionState::Disconnected, "Peer connection interrupted");
                }
            }
            PeerEvent::StateChanged(PeerState::Connected) => {
                // Recovered from a transient ICE disconnect
                if self.state == ConnectionState::Disconnected {
                    self.set_state(ConnectionState::Connected, "Connected");
                }
            }
            PeerEvent::StateChanged(PeerState::Connecting) => {}
        }
    }

    fn adopt_data_channel(&mut self, channel: Arc<dyn DataChannelTransport>) {
        let label = channel.label();
        if let Some(wanted) = &self.config.session.input_channel_label {
            if wanted != &label {
                debug!("Ignoring data channel '{}' (input uses '{}')", label, wanted);
                return;
            }
        }

        info!("Input channel open on '{}'", label);
        if let Some(stack) = self.stack.as_mut() {
            stack.peer.set_data_channel(channel.clone());
        }
        self.input.attach(channel);
    }

    /// Report a failure of the live stack and run the reconnect policy
    async fn handle_failure(&mut self, context: &str, error: SessionError) {
        warn!("{}: {}", context, error);
        self.notifier.notify_error(context, &error.to_string());
        self.teardown().await;

        match self.policy.record_failure() {
            ReconnectDecision::Retry { attempt, delay } => {
                let generation = self.generation;
                let tasks = self.tasks.clone();
                self.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    post(&tasks, ControllerTask::ReconnectDue { generation });
                }));
                self.set_state(
                    ConnectionState::Reconnecting,
                    &format!(
                        "Reconnecting in {} ms (attempt {}/{})",
                        delay.as_millis(),
                        attempt,
                        self.policy.max_attempts()
                    ),
                );
            }
            ReconnectDecision::Exhausted { attempts } => {
                let error = SessionError::ExhaustedRetries { attempts };
                warn!("{}", error);
                self.set_state(ConnectionState::Failed, "Connection failed");
                self.notifier
                    .notify_error("Reconnect failed", &error.to_string());
            }
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
            debug!("Pending reconnect cancelled");
        }
    }

    /// Discard the current stack; everything it produced becomes stale
    async fn teardown(&mut self) {
        self.generation += 1;
        self.input.detach();
        self.deferred.clear();

        if let Some(build) = self.building.take() {
            build.abort();
        }

        if let Some(mut stack) = self.stack.take() {
            if let Some(keepalive) = stack.keepalive.take() {
                keepalive.abort();
            }
            if let Some(negotiation) = stack.negotiation.take() {
                negotiation.abort();
            }
            stack.transport.close();
            stack.peer.close().await;
        }
    }

    fn set_state(&mut self, state: ConnectionState, message: &str) {
        if state == ConnectionState::Connected {
            self.policy.reset();
        }
        self.state = state;
        info!("Session state: {} ({})", state, message);

        self.notifier.notify_status(state, message);
        self.snapshot.send_replace(Snapshot {
            state,
            reconnect: self.policy.state(),
        });
    }
}

/// Open signaling, then create the peer session, both bound to `generation`
fn build_stack(
    connector: Arc<dyn SignalingConnector>,
    peer_factory: Arc<dyn PeerFactory>,
    config: Arc<AppConfig>,
    url: String,
    tasks: TaskSender,
    generation: u64,
) -> impl Future<Output = Result<(SignalingTransport, PeerSession)>> + Send + 'static {
    async move {
        let signaling_tasks = tasks.clone();
        let mut transport = SignalingTransport::open(connector.as_ref(), &url, move |event| {
            post(&signaling_tasks, ControllerTask::Signaling { generation, event });
        })
        .await?;

        let events: PeerEventSink = Arc::new(move |event| {
            post(&tasks, ControllerTask::Peer { generation, event });
        });
        match PeerSession::new(peer_factory.as_ref(), &config.webrtc, events).await {
            Ok(peer) => Ok((transport, peer)),
            Err(e) => {
                transport.close();
                Err(e)
            }
        }
    }
}
