/*!
 * Device abstraction for actorlink.
 *
 * A [`Device`] owns one [`Connection`] and tracks the lifecycle of the
 * remote peer behind it. Device-specific behavior (initialization, reply
 * parsing, cleanup) comes from a [`DeviceHandler`].
 */
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use actorlink_core::config::TimeoutConfig;
use actorlink_core::observable::{Observable, Subscription};
use actorlink_core::types::MessageCode;
use actorlink_core::utils::{lock, nonzero, with_optional_limit};

use crate::chain::{ChainCallback, CommandChain};
use crate::command::{CompletionHandle, DeviceExchange};
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{DeviceError, Result};
use crate::orchestrator::{ConnectOrchestrator, DisconnectOrchestrator};

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Not connected
    Disconnected,
    /// Connecting and initializing
    Connecting,
    /// Connected and initialized
    Connected,
    /// Disconnecting
    Disconnecting,
    /// The last connect or disconnect failed, or the connection was lost
    Failed,
}

impl DeviceState {
    /// Label used in logs and parsed by [`FromStr`]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Disconnected => "Disconnected",
            DeviceState::Connecting => "Connecting",
            DeviceState::Connected => "Connected",
            DeviceState::Disconnecting => "Disconnecting",
            DeviceState::Failed => "Failed",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceState {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Disconnected" => Ok(DeviceState::Disconnected),
            "Connecting" => Ok(DeviceState::Connecting),
            "Connected" => Ok(DeviceState::Connected),
            "Disconnecting" => Ok(DeviceState::Disconnecting),
            "Failed" => Ok(DeviceState::Failed),
            other => Err(DeviceError::UnknownState(other.to_string())),
        }
    }
}

/// A device state transition, as delivered to state callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// The device name
    pub device: String,
    /// The state before the change
    pub old_state: DeviceState,
    /// The state after the change
    pub new_state: DeviceState,
    /// Why the state changed, if known
    pub reason: Option<String>,
}

/// Device-specific behavior
pub trait DeviceHandler: Send + Sync {
    /// Handle one line read from the device
    ///
    /// Implementations resolve outstanding exchanges, typically the one
    /// returned by [`Device::next_outstanding`]. Every exchange must
    /// eventually be resolved exactly once.
    fn handle_reply(&self, device: &Arc<Device>, line: &str);

    /// Initialize the device, resolving `handle` when done
    ///
    /// Called after connecting (`get_status` true) and before disconnecting
    /// (`get_status` false). `handle` may be resolved before returning.
    fn init(
        &self,
        device: &Arc<Device>,
        handle: CompletionHandle,
        timeout: Option<Duration>,
        get_status: bool,
    );

    /// Release resources after a disconnect, successful or not
    fn cleanup(&self, _device: &Arc<Device>) {}

    /// Turn a command into the line written to the connection
    fn format_command(&self, cmd: &str) -> String {
        cmd.to_string()
    }
}

/// Destination for messages meant for the users of an actor
pub trait UserWriter: Send + Sync {
    /// Write one message to users
    fn write_to_users(&self, code: MessageCode, text: &str) -> Result<()>;
}

/// The writer a device starts with; it has nowhere to deliver messages
#[derive(Debug, Default, Clone, Copy)]
pub struct UnwiredWriter;

impl UserWriter for UnwiredWriter {
    fn write_to_users(&self, code: MessageCode, text: &str) -> Result<()> {
        Err(DeviceError::NotWired(format!("{} {}", code, text)))
    }
}

/// Callback invoked with the device on every connection state change
pub type ConnCallback = Arc<dyn Fn(&Arc<Device>, &ConnectionStatus) + Send + Sync>;

/// A user-visible verb, the device verb it maps to, and help text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    /// Verb users type
    pub user_verb: String,
    /// Verb sent to the device
    pub device_verb: String,
    /// Help text
    pub help: String,
}

impl CommandInfo {
    /// Create a command description
    pub fn new<U, D, H>(user_verb: U, device_verb: D, help: H) -> Self
    where
        U: Into<String>,
        D: Into<String>,
        H: Into<String>,
    {
        Self {
            user_verb: user_verb.into(),
            device_verb: device_verb.into(),
            help: help.into(),
        }
    }
}

/// Long-running operations that hold a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Connecting and initializing
    Connect,
    /// Initializing and disconnecting
    Disconnect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Connect => f.write_str("connect"),
            Operation::Disconnect => f.write_str("disconnect"),
        }
    }
}

/// Marks a device as held by an operation; dropping it releases the device
pub(crate) struct InFlight {
    device: Arc<Device>,
    operation: Operation,
}

impl InFlight {
    pub(crate) fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut slot = lock(&self.device.in_flight);
        if *slot == Some(self.operation) {
            *slot = None;
        }
        trace!(device = %self.device.name, operation = %self.operation, "Released");
    }
}

struct DeviceRecord {
    state: DeviceState,
    reason: Option<String>,
}

/// A remote device reached through one connection
pub struct Device {
    name: String,
    connection: Arc<dyn Connection>,
    handler: Arc<dyn DeviceHandler>,
    cmd_info: Vec<CommandInfo>,
    conn_callback: Option<ConnCallback>,
    timeouts: TimeoutConfig,
    record: Mutex<DeviceRecord>,
    in_flight: Mutex<Option<Operation>>,
    outstanding: Mutex<VecDeque<DeviceExchange>>,
    observers: Observable<StateChange>,
    user_writer: Mutex<Arc<dyn UserWriter>>,
    state_sub: Subscription,
    read_sub: Subscription,
    weak_self: Weak<Device>,
}

/// Builder for [`Device`]
pub struct DeviceBuilder {
    name: String,
    connection: Arc<dyn Connection>,
    handler: Arc<dyn DeviceHandler>,
    cmd_info: Vec<CommandInfo>,
    conn_callback: Option<ConnCallback>,
    user_writer: Arc<dyn UserWriter>,
    timeouts: TimeoutConfig,
}

impl DeviceBuilder {
    /// Describe the verbs this device supports
    pub fn with_cmd_info(mut self, cmd_info: Vec<CommandInfo>) -> Self {
        self.cmd_info = cmd_info;
        self
    }

    /// Call `callback` on every connection state change
    pub fn with_conn_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<Device>, &ConnectionStatus) + Send + Sync + 'static,
    {
        self.conn_callback = Some(Arc::new(callback));
        self
    }

    /// Deliver user messages to `writer`
    pub fn with_user_writer(mut self, writer: Arc<dyn UserWriter>) -> Self {
        self.user_writer = writer;
        self
    }

    /// Default limits for operations called without an explicit timeout
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Build the device and attach it to its connection
    pub fn build(self) -> Result<Arc<Device>> {
        if self.name.trim().is_empty() {
            return Err(DeviceError::InvalidName(
                "device name must not be empty".to_string(),
            ));
        }

        let DeviceBuilder {
            name,
            connection,
            handler,
            cmd_info,
            conn_callback,
            user_writer,
            timeouts,
        } = self;

        let device = Arc::new_cyclic(|weak: &Weak<Device>| {
            let reader = weak.clone();
            let read_sub = connection.add_read_callback(Box::new(move |line: &str| {
                if let Some(device) = reader.upgrade() {
                    device.handle_reply(line);
                }
            }));
            let watcher = weak.clone();
            let state_sub = connection.add_state_callback(
                Box::new(move |status: &ConnectionStatus| {
                    if let Some(device) = watcher.upgrade() {
                        device.on_connection_state(status);
                    }
                }),
                false,
            );

            Device {
                name,
                connection,
                handler,
                cmd_info,
                conn_callback,
                timeouts,
                record: Mutex::new(DeviceRecord {
                    state: DeviceState::Disconnected,
                    reason: None,
                }),
                in_flight: Mutex::new(None),
                outstanding: Mutex::new(VecDeque::new()),
                observers: Observable::new(),
                user_writer: Mutex::new(user_writer),
                state_sub,
                read_sub,
                weak_self: weak.clone(),
            }
        });

        debug!(device = %device.name, connection = %device.connection.id(), "Created device");
        Ok(device)
    }
}

impl Device {
    /// Start building a device
    pub fn builder<S: Into<String>>(
        name: S,
        connection: Arc<dyn Connection>,
        handler: Arc<dyn DeviceHandler>,
    ) -> DeviceBuilder {
        DeviceBuilder {
            name: name.into(),
            connection,
            handler,
            cmd_info: Vec::new(),
            conn_callback: None,
            user_writer: Arc::new(UnwiredWriter),
            timeouts: TimeoutConfig::unlimited(),
        }
    }

    /// Create a device with default options
    pub fn new<S: Into<String>>(
        name: S,
        connection: Arc<dyn Connection>,
        handler: Arc<dyn DeviceHandler>,
    ) -> Result<Arc<Device>> {
        Self::builder(name, connection, handler).build()
    }

    /// The device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connection this device talks through
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Default operation limits
    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// The device-specific handler
    pub fn handler(&self) -> &Arc<dyn DeviceHandler> {
        &self.handler
    }

    /// Current lifecycle state
    pub fn state(&self) -> DeviceState {
        lock(&self.record).state
    }

    /// Reason given with the last state change
    pub fn reason(&self) -> Option<String> {
        lock(&self.record).reason.clone()
    }

    /// Whether the device is connected
    pub fn is_connected(&self) -> bool {
        self.state() == DeviceState::Connected
    }

    /// Whether the device is disconnected, cleanly or not
    pub fn is_disconnected(&self) -> bool {
        matches!(self.state(), DeviceState::Disconnected | DeviceState::Failed)
    }

    /// The operation currently holding the device, if any
    pub fn in_flight(&self) -> Option<Operation> {
        *lock(&self.in_flight)
    }

    /// Whether a connect or disconnect is running
    pub fn is_busy(&self) -> bool {
        self.in_flight().is_some()
    }

    /// Update the lifecycle state and notify state callbacks
    ///
    /// Setting the current state again does nothing. Returns whether the
    /// state changed.
    pub(crate) fn set_state(&self, new_state: DeviceState, reason: Option<String>) -> bool {
        let change = {
            let mut record = lock(&self.record);
            if record.state == new_state {
                return false;
            }
            let old_state = record.state;
            record.state = new_state;
            record.reason = reason.clone();
            StateChange {
                device: self.name.clone(),
                old_state,
                new_state,
                reason,
            }
        };

        debug!(
            device = %self.name,
            from = %change.old_state,
            to = %change.new_state,
            reason = change.reason.as_deref().unwrap_or(""),
            "State changed"
        );
        self.observers.notify(&change);
        true
    }

    /// Register a callback for state changes
    pub fn add_state_callback<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    /// Remove a state callback; removing an unknown one returns false
    pub fn remove_state_callback(&self, subscription: Subscription) -> bool {
        self.observers.unsubscribe(subscription)
    }

    pub(crate) fn begin(self: &Arc<Self>, operation: Operation) -> Result<InFlight> {
        let mut slot = lock(&self.in_flight);
        if let Some(current) = *slot {
            return Err(DeviceError::Busy {
                device: self.name.clone(),
                operation: current.to_string(),
            });
        }
        *slot = Some(operation);
        trace!(device = %self.name, %operation, "Acquired");
        Ok(InFlight {
            device: self.clone(),
            operation,
        })
    }

    fn tracking_handle(&self, user_cmd: Option<CompletionHandle>, what: &str) -> Result<CompletionHandle> {
        match user_cmd {
            Some(handle) => {
                handle.ensure_running()?;
                Ok(handle)
            }
            None => Ok(CompletionHandle::new(format!("{} {}", self.name, what))),
        }
    }

    /// Connect and initialize the device
    ///
    /// Returns a handle that resolves when the connection is made and the
    /// handler's `init` finished. `timeout` limits establishing the
    /// connection and is passed on to `init`. `None` uses the device's
    /// default connect limit; a zero duration means no limit.
    pub fn connect(
        self: &Arc<Self>,
        user_cmd: Option<CompletionHandle>,
        timeout: Option<Duration>,
    ) -> Result<CompletionHandle> {
        let handle = self.tracking_handle(user_cmd, "connect")?;
        let guard = self.begin(Operation::Connect)?;

        if self.state() == DeviceState::Connected && self.connection.is_connected() {
            drop(guard);
            debug!(device = %self.name, "Already connected");
            handle.set_done()?;
            return Ok(handle);
        }

        let runtime = current_runtime()?;
        let limit = nonzero(timeout.or_else(|| self.timeouts.connect()));
        ConnectOrchestrator::start(&runtime, guard, handle.clone(), limit);
        Ok(handle)
    }

    /// Initialize (if connected) and disconnect the device
    ///
    /// The handler's `cleanup` runs on every outcome except the immediate
    /// one for an already disconnected connection. `None` uses the device's
    /// default disconnect limit.
    pub fn disconnect(
        self: &Arc<Self>,
        user_cmd: Option<CompletionHandle>,
        timeout: Option<Duration>,
    ) -> Result<CompletionHandle> {
        let handle = self.tracking_handle(user_cmd, "disconnect")?;
        let guard = self.begin(Operation::Disconnect)?;

        if self.connection.is_disconnected() {
            self.set_state(DeviceState::Disconnected, None);
            drop(guard);
            debug!(device = %self.name, "Already disconnected");
            handle.set_done()?;
            return Ok(handle);
        }

        let runtime = current_runtime()?;
        let limit = nonzero(timeout.or_else(|| self.timeouts.disconnect()));
        DisconnectOrchestrator::start(&runtime, guard, handle.clone(), limit);
        Ok(handle)
    }

    /// Send a command to the device
    ///
    /// The returned exchange may already be resolved: as failed when the
    /// device is not connected or the write failed. Otherwise the handler
    /// resolves it when the reply arrives, or `timeout` fails it. `None`
    /// uses the device's default command limit.
    pub fn start_cmd<S: Into<String>>(&self, cmd: S, timeout: Option<Duration>) -> DeviceExchange {
        let cmd = cmd.into();
        let full_cmd = self.handler.format_command(&cmd);
        let exchange = DeviceExchange::new(self.name.clone(), cmd, full_cmd);

        if !self.connection.is_connected() {
            let _ = exchange.fail_with_reason("not connected");
            return exchange;
        }

        {
            let mut outstanding = lock(&self.outstanding);
            outstanding.retain(|queued| !queued.is_done());
            outstanding.push_back(exchange.clone());
        }
        if let Err(e) = self.connection.write_line(exchange.full_cmd_str()) {
            warn!(device = %self.name, cmd = exchange.cmd_str(), error = %e, "Write failed");
            lock(&self.outstanding).retain(|queued| !queued.ptr_eq(&exchange));
            let _ = exchange.fail_with_reason(e.to_string());
            return exchange;
        }
        debug!(device = %self.name, cmd = exchange.full_cmd_str(), "Started command");

        if let Some(limit) = nonzero(timeout.or_else(|| self.timeouts.command())) {
            self.watch_exchange(&exchange, limit);
        }
        exchange
    }

    /// Send a command whose outcome is mirrored onto `user_cmd`
    pub fn start_cmd_tracked<S: Into<String>>(
        &self,
        cmd: S,
        user_cmd: CompletionHandle,
        timeout: Option<Duration>,
    ) -> Result<DeviceExchange> {
        user_cmd.ensure_running()?;
        let exchange = self.start_cmd(cmd, timeout);
        exchange.track_with(user_cmd);
        Ok(exchange)
    }

    /// Run commands one after another, stopping at the first failure
    ///
    /// `callback` receives the final exchange: the failed one, or the last.
    pub fn start_cmd_list<I, S>(
        self: &Arc<Self>,
        cmds: I,
        callback: Option<ChainCallback>,
        user_cmd: Option<CompletionHandle>,
        timeout: Option<Duration>,
    ) -> Result<CommandChain>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cmds: Vec<String> = cmds.into_iter().map(Into::into).collect();
        if cmds.is_empty() {
            return Err(DeviceError::EmptyCommandList(self.name.clone()));
        }
        let handle = self.tracking_handle(user_cmd, "command list")?;
        let runtime = current_runtime()?;
        Ok(CommandChain::start(
            &runtime,
            self.clone(),
            cmds,
            callback,
            handle,
            timeout,
        ))
    }

    fn watch_exchange(&self, exchange: &DeviceExchange, limit: Duration) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(device = %self.name, cmd = exchange.cmd_str(), "No runtime; command timeout ignored");
                return;
            }
        };
        let exchange = exchange.clone();
        runtime.spawn(async move {
            if with_optional_limit(Some(limit), exchange.wait()).await.is_none() {
                warn!(device = exchange.device_name(), cmd = exchange.cmd_str(), "Timed out waiting for reply");
                let _ = exchange.fail_with_reason("timed out waiting for reply");
            }
        });
    }

    /// Take the oldest unresolved exchange, skipping resolved ones
    pub fn next_outstanding(&self) -> Option<DeviceExchange> {
        let mut outstanding = lock(&self.outstanding);
        while let Some(exchange) = outstanding.pop_front() {
            if !exchange.is_done() {
                return Some(exchange);
            }
        }
        None
    }

    /// The oldest unresolved exchange, left in place
    pub fn peek_outstanding(&self) -> Option<DeviceExchange> {
        let mut outstanding = lock(&self.outstanding);
        while outstanding.front().map_or(false, |e| e.is_done()) {
            outstanding.pop_front();
        }
        outstanding.front().cloned()
    }

    /// Number of queued exchanges not yet resolved
    pub fn outstanding_len(&self) -> usize {
        lock(&self.outstanding)
            .iter()
            .filter(|exchange| !exchange.is_done())
            .count()
    }

    /// Fail every unresolved exchange with `reason`
    pub fn fail_outstanding(&self, reason: &str) -> usize {
        let drained: Vec<DeviceExchange> = lock(&self.outstanding).drain(..).collect();
        let mut failed = 0;
        for exchange in drained {
            if exchange.fail_with_reason(reason).is_ok() {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(device = %self.name, failed, reason, "Failed outstanding commands");
        }
        failed
    }

    /// Write a message to users; undeliverable messages are logged
    pub fn write_to_users(&self, code: MessageCode, text: &str) {
        let writer = lock(&self.user_writer).clone();
        if let Err(e) = writer.write_to_users(code, text) {
            warn!(device = %self.name, %code, text, error = %e, "Message not delivered to users");
        }
    }

    /// Replace the user message sink
    pub fn set_user_writer(&self, writer: Arc<dyn UserWriter>) {
        *lock(&self.user_writer) = writer;
    }

    /// Supported verbs
    pub fn cmd_info(&self) -> &[CommandInfo] {
        &self.cmd_info
    }

    /// The device verb for a user verb
    pub fn device_verb(&self, user_verb: &str) -> Option<&str> {
        self.cmd_info
            .iter()
            .find(|info| info.user_verb == user_verb)
            .map(|info| info.device_verb.as_str())
    }

    fn handle_reply(self: &Arc<Self>, line: &str) {
        trace!(device = %self.name, %line, "Reply");
        self.handler.handle_reply(self, line);
    }

    fn on_connection_state(self: &Arc<Self>, status: &ConnectionStatus) {
        // Orchestrators drive state while they hold the device.
        if !self.is_busy() && self.state() == DeviceState::Connected && status.is_disconnected() {
            let (new_state, reason) = if status.is_failed() {
                (DeviceState::Failed, status.reason.clone().or_else(|| Some("connection failed".to_string())))
            } else {
                (DeviceState::Disconnected, status.reason.clone())
            };
            warn!(device = %self.name, %status, "Connection lost");
            self.set_state(new_state, reason);
            self.fail_outstanding("connection lost");
        }

        if let Some(callback) = &self.conn_callback {
            callback(self, status);
        }
    }

    /// A strong reference to this device, if it is still alive
    pub fn upgrade(&self) -> Option<Arc<Device>> {
        self.weak_self.upgrade()
    }
}

fn current_runtime() -> Result<Handle> {
    Handle::try_current().map_err(|e| DeviceError::Runtime(e.to_string()))
}

impl Drop for Device {
    fn drop(&mut self) {
        self.connection.remove_state_callback(self.state_sub);
        self.connection.remove_read_callback(self.read_sub);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("connection", &self.connection)
            .finish()
    }
}
