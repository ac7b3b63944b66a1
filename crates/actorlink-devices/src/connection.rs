/*!
 * Line-oriented connections to remote devices.
 *
 * A [`Connection`] is the transport a [`Device`](crate::device::Device)
 * talks through. It reports its state through state callbacks and delivers
 * each received line to its read callbacks. Requests to connect or
 * disconnect return at once; the outcome arrives as a state change.
 */
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use actorlink_core::observable::{Observable, Subscription};
use actorlink_core::types::ConnectionId;
use actorlink_core::utils::lock;

use crate::error::{DeviceError, Result};

/// Transport state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected
    Disconnected = 0,
    /// A connect request is in progress
    Connecting = 1,
    /// Connected and able to carry lines
    Connected = 2,
    /// A disconnect request is in progress
    Disconnecting = 3,
    /// The connection was lost or could not be made
    Failed = 4,
}

impl ConnectionState {
    /// Numeric state code
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Failed => "Failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A connection state together with the reason for entering it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// The state
    pub state: ConnectionState,
    /// Why the state was entered, if known
    pub reason: Option<String>,
}

impl ConnectionStatus {
    /// Create a status with no reason
    pub fn new(state: ConnectionState) -> Self {
        Self { state, reason: None }
    }

    /// Create a status with a reason
    pub fn with_reason<S: Into<String>>(state: ConnectionState, reason: S) -> Self {
        Self {
            state,
            reason: Some(reason.into()),
        }
    }

    /// Fully connected
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Not in transition, i.e. connected, disconnected or failed
    pub fn is_done(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Disconnected | ConnectionState::Failed
        )
    }

    /// Fully disconnected, cleanly or not
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Failed
        )
    }

    /// Lost or never made
    pub fn is_failed(&self) -> bool {
        self.state == ConnectionState::Failed
    }

    /// The reason, or an empty string
    pub fn reason_str(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} ({}): {}", self.state, self.state.code(), reason),
            None => write!(f, "{} ({})", self.state, self.state.code()),
        }
    }
}

/// Callback invoked with each connection state change
pub type StateCallback = Box<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// Callback invoked with each line read, without its line terminator
pub type ReadCallback = Box<dyn Fn(&str) + Send + Sync>;

/// A line-oriented transport to one remote device
pub trait Connection: Send + Sync + fmt::Debug {
    /// Identity token issued when the connection was created
    fn id(&self) -> ConnectionId;

    /// Remote host
    fn host(&self) -> &str;

    /// Remote port
    fn port(&self) -> u16;

    /// Request a connection; the outcome is reported as a state change
    fn connect(&self, timeout: Option<Duration>);

    /// Request disconnection; the outcome is reported as a state change
    fn disconnect(&self);

    /// Current state and reason
    fn full_state(&self) -> ConnectionStatus;

    /// Register a state callback, optionally calling it at once with the
    /// current state
    fn add_state_callback(&self, callback: StateCallback, call_now: bool) -> Subscription;

    /// Remove a state callback. Removing an unknown callback is a no-op
    /// that returns false.
    fn remove_state_callback(&self, subscription: Subscription) -> bool;

    /// Register a callback for received lines
    fn add_read_callback(&self, callback: ReadCallback) -> Subscription;

    /// Remove a read callback
    fn remove_read_callback(&self, subscription: Subscription) -> bool;

    /// Send one line; the connection adds the line terminator
    fn write_line(&self, line: &str) -> Result<()>;

    /// Current state
    fn state(&self) -> ConnectionState {
        self.full_state().state
    }

    /// Fully connected
    fn is_connected(&self) -> bool {
        self.full_state().is_connected()
    }

    /// Not in transition
    fn is_done(&self) -> bool {
        self.full_state().is_done()
    }

    /// Fully disconnected, cleanly or not
    fn is_disconnected(&self) -> bool {
        self.full_state().is_disconnected()
    }

    /// Lost or never made
    fn is_failed(&self) -> bool {
        self.full_state().is_failed()
    }
}

/// State and callback bookkeeping shared by connection implementations
pub struct ConnectionCore {
    id: ConnectionId,
    host: String,
    port: u16,
    status: Mutex<ConnectionStatus>,
    state_observers: Observable<ConnectionStatus>,
    read_observers: Observable<String>,
}

impl ConnectionCore {
    /// Create a disconnected core for `host:port`
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            id: ConnectionId::new(),
            host: host.into(),
            port,
            status: Mutex::new(ConnectionStatus::new(ConnectionState::Disconnected)),
            state_observers: Observable::new(),
            read_observers: Observable::new(),
        }
    }

    /// Identity token
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Remote port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current state and reason
    pub fn full_state(&self) -> ConnectionStatus {
        lock(&self.status).clone()
    }

    /// Update the state and notify state callbacks
    ///
    /// Returns false, without notifying, if neither state nor reason changed.
    pub fn set_state(&self, state: ConnectionState, reason: Option<String>) -> bool {
        let status = {
            let mut current = lock(&self.status);
            if current.state == state && current.reason == reason {
                return false;
            }
            current.state = state;
            current.reason = reason;
            current.clone()
        };
        debug!(host = %self.host, port = self.port, %status, "Connection state changed");
        self.state_observers.notify(&status);
        true
    }

    /// Register a state callback
    pub fn add_state_callback(&self, callback: StateCallback, call_now: bool) -> Subscription {
        if call_now {
            callback(&self.full_state());
        }
        self.state_observers.subscribe(callback)
    }

    /// Remove a state callback
    pub fn remove_state_callback(&self, subscription: Subscription) -> bool {
        self.state_observers.unsubscribe(subscription)
    }

    /// Register a read callback
    pub fn add_read_callback(&self, callback: ReadCallback) -> Subscription {
        self.read_observers
            .subscribe(move |line: &String| callback(line.as_str()))
    }

    /// Remove a read callback
    pub fn remove_read_callback(&self, subscription: Subscription) -> bool {
        self.read_observers.unsubscribe(subscription)
    }

    /// Deliver one received line to the read callbacks
    pub fn dispatch_line(&self, line: &str) {
        self.read_observers.notify(&line.to_string());
    }

    /// Number of registered state callbacks
    pub fn state_callback_count(&self) -> usize {
        self.state_observers.len()
    }

    /// Number of registered read callbacks
    pub fn read_callback_count(&self) -> usize {
        self.read_observers.len()
    }
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("status", &self.full_state())
            .finish()
    }
}

/// Receives a connection's state changes for as long as it lives
///
/// Subscribes on creation and unsubscribes on drop.
pub struct StateListener {
    connection: Arc<dyn Connection>,
    subscription: Subscription,
    receiver: mpsc::UnboundedReceiver<ConnectionStatus>,
}

impl StateListener {
    /// Start listening to `connection`
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = connection.add_state_callback(
            Box::new(move |status: &ConnectionStatus| {
                let _ = sender.send(status.clone());
            }),
            false,
        );
        Self {
            connection,
            subscription,
            receiver,
        }
    }

    /// The next state change
    pub async fn next(&mut self) -> Option<ConnectionStatus> {
        self.receiver.recv().await
    }

    /// Wait for a state change matching `predicate`
    ///
    /// Returns the connection's current status if it already matches.
    pub async fn wait_until<P>(&mut self, predicate: P) -> ConnectionStatus
    where
        P: Fn(&ConnectionStatus) -> bool,
    {
        let current = self.connection.full_state();
        if predicate(&current) {
            return current;
        }
        while let Some(status) = self.receiver.recv().await {
            if predicate(&status) {
                return status;
            }
        }
        // The sender lives in the connection's callback list, which we
        // only leave on drop.
        self.connection.full_state()
    }
}

impl Drop for StateListener {
    fn drop(&mut self) {
        self.connection.remove_state_callback(self.subscription);
    }
}

impl fmt::Debug for StateListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateListener")
            .field("connection", &self.connection.id())
            .field("subscription", &self.subscription)
            .finish()
    }
}

/// Error for writing to a connection that is not connected
pub(crate) fn not_connected(connection: &dyn Connection) -> DeviceError {
    DeviceError::NotConnected(format!("{}:{}", connection.host(), connection.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_status_predicates() {
        let failed = ConnectionStatus::with_reason(ConnectionState::Failed, "refused");
        assert!(failed.is_disconnected());
        assert!(failed.is_done());
        assert!(failed.is_failed());
        assert_eq!(failed.to_string(), "Failed (4): refused");

        let connecting = ConnectionStatus::new(ConnectionState::Connecting);
        assert!(!connecting.is_done());
        assert!(!connecting.is_disconnected());
        assert_eq!(connecting.reason_str(), "");
    }

    #[test]
    fn test_core_notifies_only_on_change() {
        let core = ConnectionCore::new("localhost", 23);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = core.add_state_callback(
            Box::new(move |_: &ConnectionStatus| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(core.set_state(ConnectionState::Connecting, None));
        assert!(!core.set_state(ConnectionState::Connecting, None));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(core.remove_state_callback(sub));
        assert!(!core.remove_state_callback(sub));
        core.set_state(ConnectionState::Connected, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_read_callbacks_receive_lines() {
        let core = ConnectionCore::new("localhost", 23);
        let lines = Arc::new(Mutex::new(Vec::new()));
        let seen = lines.clone();
        core.add_read_callback(Box::new(move |line: &str| seen.lock().unwrap().push(line.to_string())));

        core.dispatch_line("OK");
        core.dispatch_line("pos=5");
        assert_eq!(*lines.lock().unwrap(), vec!["OK", "pos=5"]);
    }

    #[tokio::test]
    async fn test_listener_unsubscribes_on_drop() {
        let fake = Arc::new(FakeConnection::new());
        let connection: Arc<dyn Connection> = fake.clone();

        let mut listener = StateListener::new(connection);
        assert_eq!(fake.state_callback_count(), 1);

        fake.push_state(ConnectionState::Connecting, None);
        fake.push_state(ConnectionState::Connected, None);
        let status = listener.wait_until(|s| s.is_connected()).await;
        assert!(status.is_connected());

        drop(listener);
        assert_eq!(fake.state_callback_count(), 0);
    }
}
