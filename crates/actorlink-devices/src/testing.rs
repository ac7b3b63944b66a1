/*!
 * Scriptable connection and handler for unit tests.
 */
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actorlink_core::observable::Subscription;
use actorlink_core::types::{ConnectionId, MessageCode};
use actorlink_core::utils::lock;

use crate::command::CompletionHandle;
use crate::connection::{
    not_connected, Connection, ConnectionCore, ConnectionState, ConnectionStatus, ReadCallback,
    StateCallback,
};
use crate::device::{Device, DeviceHandler, UserWriter};
use crate::error::{DeviceError, Result};

/// How a scripted step ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Behavior {
    Succeed,
    Fail(String),
    Hang,
}

type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A connection whose transitions happen synchronously, as scripted
pub(crate) struct FakeConnection {
    core: ConnectionCore,
    connect: Mutex<Behavior>,
    disconnect: Mutex<Behavior>,
    fail_writes: AtomicBool,
    written: Mutex<Vec<String>>,
    responder: Mutex<Option<Responder>>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
}

impl FakeConnection {
    pub(crate) fn new() -> Self {
        Self {
            core: ConnectionCore::new("fake.local", 2000),
            connect: Mutex::new(Behavior::Succeed),
            disconnect: Mutex::new(Behavior::Succeed),
            fail_writes: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
        }
    }

    /// A fake that starts out connected
    pub(crate) fn connected() -> Self {
        let fake = Self::new();
        fake.core.set_state(ConnectionState::Connected, None);
        fake
    }

    pub(crate) fn set_connect(&self, behavior: Behavior) {
        *lock(&self.connect) = behavior;
    }

    pub(crate) fn set_disconnect(&self, behavior: Behavior) {
        *lock(&self.disconnect) = behavior;
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Reply to each written line with whatever `responder` returns
    pub(crate) fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        *lock(&self.responder) = Some(Arc::new(responder));
    }

    pub(crate) fn push_state(&self, state: ConnectionState, reason: Option<&str>) {
        self.core.set_state(state, reason.map(str::to_string));
    }

    pub(crate) fn feed_line(&self, line: &str) {
        self.core.dispatch_line(line);
    }

    pub(crate) fn written(&self) -> Vec<String> {
        lock(&self.written).clone()
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn state_callback_count(&self) -> usize {
        self.core.state_callback_count()
    }

    pub(crate) fn read_callback_count(&self) -> usize {
        self.core.read_callback_count()
    }
}

impl std::fmt::Debug for FakeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeConnection").field("core", &self.core).finish()
    }
}

impl Connection for FakeConnection {
    fn id(&self) -> ConnectionId {
        self.core.id()
    }

    fn host(&self) -> &str {
        self.core.host()
    }

    fn port(&self) -> u16 {
        self.core.port()
    }

    fn connect(&self, _timeout: Option<Duration>) {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.core.set_state(ConnectionState::Connecting, None);
        let behavior = lock(&self.connect).clone();
        match behavior {
            Behavior::Succeed => {
                self.core.set_state(ConnectionState::Connected, None);
            }
            Behavior::Fail(reason) => {
                self.core.set_state(ConnectionState::Failed, Some(reason));
            }
            Behavior::Hang => {}
        }
    }

    fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.core.set_state(ConnectionState::Disconnecting, None);
        let behavior = lock(&self.disconnect).clone();
        match behavior {
            Behavior::Succeed => {
                self.core.set_state(ConnectionState::Disconnected, None);
            }
            Behavior::Fail(reason) => {
                self.core.set_state(ConnectionState::Failed, Some(reason));
            }
            Behavior::Hang => {}
        }
    }

    fn full_state(&self) -> ConnectionStatus {
        self.core.full_state()
    }

    fn add_state_callback(&self, callback: StateCallback, call_now: bool) -> Subscription {
        self.core.add_state_callback(callback, call_now)
    }

    fn remove_state_callback(&self, subscription: Subscription) -> bool {
        self.core.remove_state_callback(subscription)
    }

    fn add_read_callback(&self, callback: ReadCallback) -> Subscription {
        self.core.add_read_callback(callback)
    }

    fn remove_read_callback(&self, subscription: Subscription) -> bool {
        self.core.remove_read_callback(subscription)
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(not_connected(self));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DeviceError::Write("broken pipe".to_string()));
        }
        lock(&self.written).push(line.to_string());

        let responder = lock(&self.responder).clone();
        if let Some(reply) = responder.and_then(|respond| respond(line)) {
            self.core.dispatch_line(&reply);
        }
        Ok(())
    }
}

/// A handler that treats "fail <reason>" as a failed reply and anything
/// else as success, with scriptable `init`
pub(crate) struct ScriptedHandler {
    init: Mutex<Behavior>,
    pending: Mutex<Vec<CompletionHandle>>,
    init_calls: Mutex<Vec<bool>>,
    cleanups: AtomicUsize,
}

impl ScriptedHandler {
    pub(crate) fn new() -> Self {
        Self {
            init: Mutex::new(Behavior::Succeed),
            pending: Mutex::new(Vec::new()),
            init_calls: Mutex::new(Vec::new()),
            cleanups: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_init(&self, behavior: Behavior) {
        *lock(&self.init) = behavior;
    }

    /// `get_status` of every `init` call so far
    pub(crate) fn init_calls(&self) -> Vec<bool> {
        lock(&self.init_calls).clone()
    }

    pub(crate) fn pending_inits(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Resolve the oldest hanging `init`
    pub(crate) fn release_init(&self, outcome: std::result::Result<(), &str>) {
        let handle = lock(&self.pending).remove(0);
        match outcome {
            Ok(()) => handle.set_done().unwrap(),
            Err(message) => handle.set_failed(message).unwrap(),
        }
    }

    pub(crate) fn cleanup_calls(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl DeviceHandler for ScriptedHandler {
    fn handle_reply(&self, device: &Arc<Device>, line: &str) {
        let Some(exchange) = device.next_outstanding() else {
            return;
        };
        let _ = match line.strip_prefix("fail ") {
            Some(reason) => exchange.fail_with_reason(reason),
            None => exchange.set_done(),
        };
    }

    fn init(
        &self,
        _device: &Arc<Device>,
        handle: CompletionHandle,
        _timeout: Option<Duration>,
        get_status: bool,
    ) {
        lock(&self.init_calls).push(get_status);
        let behavior = lock(&self.init).clone();
        let _ = match behavior {
            Behavior::Succeed => handle.set_done(),
            Behavior::Fail(message) => handle.set_failed(message),
            Behavior::Hang => {
                lock(&self.pending).push(handle);
                Ok(())
            }
        };
    }

    fn cleanup(&self, _device: &Arc<Device>) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// A user message sink that remembers everything written to it
#[derive(Default)]
pub(crate) struct RecordingWriter {
    messages: Mutex<Vec<(MessageCode, String)>>,
}

impl RecordingWriter {
    pub(crate) fn messages(&self) -> Vec<(MessageCode, String)> {
        lock(&self.messages).clone()
    }
}

impl UserWriter for RecordingWriter {
    fn write_to_users(&self, code: MessageCode, text: &str) -> Result<()> {
        lock(&self.messages).push((code, text.to_string()));
        Ok(())
    }
}
