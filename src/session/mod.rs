//! Session transport controller
//!
//! [`create_session_controller`] builds an independent controller for one
//! remote rendering session. The returned [`SessionController`] is a cheap,
//! cloneable handle: every call is queued to the controller task and returns
//! immediately.
//!
//! ```no_run
//! use std::sync::Arc;
//! use session_link::config::AppConfig;
//! use session_link::session::create_session_controller;
//! use session_link::webrtc::LoggingSink;
//!
//! # async fn run() -> session_link::Result<()> {
//! let mut config = AppConfig::default();
//! config.session.server_url = "https://render.example.com".into();
//! config.session.session_id = "s1".into();
//!
//! let controller = create_session_controller(config)?;
//! controller.on_status(|state, message| println!("{}: {}", state, message));
//! controller.connect(Arc::new(LoggingSink::new()));
//! controller.send_click(120.4, 48.0);
//! # Ok(())
//! # }
//! ```

mod controller;
pub mod reconnect;
pub mod state;

#[cfg(test)]
mod tests;

pub use controller::Snapshot;
pub use reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};
pub use state::ConnectionState;

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use self::controller::{Controller, ControllerTask};
use crate::config::AppConfig;
use crate::error::Result;
use crate::events::StatusNotifier;
use crate::input::InputEvent;
use crate::signaling::{SignalingConnector, WebSocketConnector};
use crate::webrtc::{MediaSink, PeerFactory, RtcPeerFactory};

/// Create a controller using WebSocket signaling and webrtc-rs peers
///
/// Must be called from within a tokio runtime.
pub fn create_session_controller(config: AppConfig) -> Result<SessionController> {
    create_session_controller_with(
        config,
        Arc::new(WebSocketConnector),
        Arc::new(RtcPeerFactory),
    )
}

/// Create a controller with explicit signaling and peer backends
pub fn create_session_controller_with(
    config: AppConfig,
    connector: Arc<dyn SignalingConnector>,
    peer_factory: Arc<dyn PeerFactory>,
) -> Result<SessionController> {
    config.validate()?;
    let signaling_url = config.session.signaling_url()?;
    let session_id: Arc<str> = Arc::from(config.session.session_id.as_str());
    let config = Arc::new(config);

    let notifier = Arc::new(StatusNotifier::new());
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
        state: ConnectionState::Idle,
        reconnect: ReconnectPolicy::new(&config.reconnect).state(),
    });
    let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();

    info!(
        "Session controller created for '{}' ({})",
        session_id, signaling_url
    );

    let controller = Controller::new(
        config,
        signaling_url,
        connector,
        peer_factory,
        notifier.clone(),
        snapshot_tx,
        tasks_tx.downgrade(),
    );
    tokio::spawn(controller.run(tasks_rx));

    Ok(SessionController {
        tasks: tasks_tx,
        notifier,
        snapshot: snapshot_rx,
        session_id,
    })
}

/// Handle to one session controller
#[derive(Clone)]
pub struct SessionController {
    tasks: mpsc::UnboundedSender<ControllerTask>,
    notifier: Arc<StatusNotifier>,
    snapshot: watch::Receiver<Snapshot>,
    session_id: Arc<str>,
}

impl SessionController {
    fn submit(&self, task: ControllerTask) {
        if self.tasks.send(task).is_err() {
            debug!("Session controller '{}' is gone", self.session_id);
        }
    }

    /// Establish signaling and the peer connection, delivering media to `sink`
    ///
    /// Also the way out of the terminal `failed` state.
    pub fn connect(&self, sink: Arc<dyn MediaSink>) {
        self.submit(ControllerTask::Connect(sink));
    }

    /// Tear everything down and stop reconnecting
    pub fn disconnect(&self) {
        self.submit(ControllerTask::Disconnect);
    }

    pub fn send_click(&self, x: f64, y: f64) {
        self.send_input(InputEvent::click(x, y));
    }

    pub fn send_scroll(&self, delta_y: f64) {
        self.send_input(InputEvent::scroll(delta_y));
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.send_input(InputEvent::text(text));
    }

    /// Queue an input event; dropped if the input channel is not open
    pub fn send_input(&self, event: InputEvent) {
        self.submit(ControllerTask::Input(event));
    }

    /// Ping the signaling server periodically while it is open
    pub fn start_keep_alive(&self) {
        self.submit(ControllerTask::StartKeepAlive);
    }

    /// Register the status subscriber, replacing any previous one
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(ConnectionState, &str) + Send + Sync + 'static,
    {
        self.notifier.on_status(callback);
    }

    /// Register the error subscriber, replacing any previous one
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.notifier.on_error(callback);
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.snapshot.borrow().reconnect
    }

    /// Watch state changes
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}
