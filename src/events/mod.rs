//! Session status notifications
//!
//! `StatusNotifier` is the single observation point for human-readable state
//! and error notifications. It carries no control authority: it only
//! delivers to whichever subscriber is currently registered. Registering a
//! new subscriber replaces the previous one.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::session::ConnectionState;

/// Receives `(state, human message)` pairs
pub type StatusCallback = Arc<dyn Fn(ConnectionState, &str) + Send + Sync>;

/// Receives `(context message, error detail)` pairs
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Status and error notifier
#[derive(Default)]
pub struct StatusNotifier {
    status: Mutex<Option<StatusCallback>>,
    error: Mutex<Option<ErrorCallback>>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the status subscriber, replacing any previous one
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(ConnectionState, &str) + Send + Sync + 'static,
    {
        *self.status.lock() = Some(Arc::new(callback));
    }

    /// Register the error subscriber, replacing any previous one
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        *self.error.lock() = Some(Arc::new(callback));
    }

    /// Deliver a state notification; a no-op without a subscriber
    pub fn notify_status(&self, state: ConnectionState, message: &str) {
        // Callback runs outside the lock so it may re-register itself
        let callback = self.status.lock().clone();
        if let Some(callback) = callback {
            callback(state, message);
        }
    }

    /// Deliver an error notification; a no-op without a subscriber
    pub fn notify_error(&self, context: &str, detail: &str) {
        let callback = self.error.lock().clone();
        if let Some(callback) = callback {
            callback(context, detail);
        }
    }
}
