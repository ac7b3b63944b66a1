/*!
 * Completion tracking for device operations.
 *
 * A [`CompletionHandle`] tracks one logical operation (a connect, a
 * disconnect, a command list, or a user's request). A [`DeviceExchange`] is
 * one request line sent to a device and the reply that resolves it.
 */
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tracing::trace;

use actorlink_core::utils::lock;

use crate::error::{DeviceError, Result};

/// Lifecycle of a tracked operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    /// Not yet resolved
    Running,
    /// Finished successfully
    Done,
    /// Finished unsuccessfully
    Failed,
}

impl CommandState {
    /// Whether the state is terminal
    pub fn is_done(&self) -> bool {
        !matches!(self, CommandState::Running)
    }

    /// Whether the state is a failure
    pub fn did_fail(&self) -> bool {
        matches!(self, CommandState::Failed)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CommandState::Running => "running",
            CommandState::Done => "done",
            CommandState::Failed => "failed",
        };
        f.write_str(label)
    }
}

type DoneCallback = Box<dyn FnOnce(&CompletionHandle) + Send>;

struct HandleState {
    state: CommandState,
    message: Option<String>,
    callbacks: Vec<DoneCallback>,
}

struct HandleInner {
    label: String,
    record: Mutex<HandleState>,
    watch: watch::Sender<CommandState>,
}

/// Tracks completion of one logical operation
///
/// Cloning yields another reference to the same operation. Once resolved
/// the handle never changes again.
#[derive(Clone)]
pub struct CompletionHandle {
    inner: Arc<HandleInner>,
}

impl CompletionHandle {
    /// Create a running handle; `label` names it in logs and errors
    pub fn new<S: Into<String>>(label: S) -> Self {
        let (watch, _) = watch::channel(CommandState::Running);
        Self {
            inner: Arc::new(HandleInner {
                label: label.into(),
                record: Mutex::new(HandleState {
                    state: CommandState::Running,
                    message: None,
                    callbacks: Vec::new(),
                }),
                watch,
            }),
        }
    }

    /// The label given at construction
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Current state
    pub fn state(&self) -> CommandState {
        lock(&self.inner.record).state
    }

    /// Whether the handle has been resolved
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Whether the handle was resolved as failed
    pub fn did_fail(&self) -> bool {
        self.state().did_fail()
    }

    /// Failure message, if any
    pub fn message(&self) -> Option<String> {
        lock(&self.inner.record).message.clone()
    }

    /// Resolve as successful
    pub fn set_done(&self) -> Result<()> {
        self.resolve(CommandState::Done, None)
    }

    /// Resolve as failed with a human-readable message
    pub fn set_failed<S: Into<String>>(&self, message: S) -> Result<()> {
        self.resolve(CommandState::Failed, Some(message.into()))
    }

    fn resolve(&self, state: CommandState, message: Option<String>) -> Result<()> {
        let callbacks = {
            let mut record = lock(&self.inner.record);
            if record.state.is_done() {
                return Err(DeviceError::AlreadyResolved(self.inner.label.clone()));
            }
            record.state = state;
            record.message = message;
            std::mem::take(&mut record.callbacks)
        };
        trace!(label = %self.inner.label, %state, "Resolved");
        self.inner.watch.send_replace(state);
        for callback in callbacks {
            callback(self);
        }
        Ok(())
    }

    /// Register a callback to run once, when the handle resolves
    ///
    /// If the handle is already resolved the callback runs immediately.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&CompletionHandle) + Send + 'static,
    {
        {
            let mut record = lock(&self.inner.record);
            if !record.state.is_done() {
                record.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Wait until the handle resolves, returning the terminal state
    pub async fn wait(&self) -> CommandState {
        let mut receiver = self.inner.watch.subscribe();
        let state = match receiver.wait_for(CommandState::is_done).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Error unless the handle is still running
    ///
    /// Used when a caller hands in a handle to track a new operation.
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_done() {
            return Err(DeviceError::AlreadyResolved(format!(
                "{} cannot track a new operation",
                self.inner.label
            )));
        }
        Ok(())
    }

    /// Whether both handles track the same operation
    pub fn ptr_eq(&self, other: &CompletionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = lock(&self.inner.record);
        f.debug_struct("CompletionHandle")
            .field("label", &self.inner.label)
            .field("state", &record.state)
            .field("message", &record.message)
            .finish()
    }
}

struct ExchangeInner {
    device: String,
    cmd: String,
    full_cmd: String,
    handle: CompletionHandle,
}

/// One request line sent to a device, tracked until its reply resolves it
#[derive(Clone)]
pub struct DeviceExchange {
    inner: Arc<ExchangeInner>,
}

impl DeviceExchange {
    /// Create an unresolved exchange
    pub fn new<D, C, F>(device: D, cmd: C, full_cmd: F) -> Self
    where
        D: Into<String>,
        C: Into<String>,
        F: Into<String>,
    {
        let device = device.into();
        let cmd = cmd.into();
        let handle = CompletionHandle::new(format!("{} {}", device, cmd));
        Self {
            inner: Arc::new(ExchangeInner {
                device,
                cmd,
                full_cmd: full_cmd.into(),
                handle,
            }),
        }
    }

    /// Name of the device the command was sent to
    pub fn device_name(&self) -> &str {
        &self.inner.device
    }

    /// The command as given by the caller
    pub fn cmd_str(&self) -> &str {
        &self.inner.cmd
    }

    /// The line actually written to the connection
    pub fn full_cmd_str(&self) -> &str {
        &self.inner.full_cmd
    }

    /// The completion state of this exchange
    pub fn handle(&self) -> &CompletionHandle {
        &self.inner.handle
    }

    /// Current state
    pub fn state(&self) -> CommandState {
        self.inner.handle.state()
    }

    /// Whether a reply (or failure) has resolved the exchange
    pub fn is_done(&self) -> bool {
        self.inner.handle.is_done()
    }

    /// Whether the exchange failed
    pub fn did_fail(&self) -> bool {
        self.inner.handle.did_fail()
    }

    /// Failure message, if any
    pub fn message(&self) -> Option<String> {
        self.inner.handle.message()
    }

    /// Resolve as successful
    pub fn set_done(&self) -> Result<()> {
        self.inner.handle.set_done()
    }

    /// Resolve as failed with a complete message
    pub fn set_failed<S: Into<String>>(&self, message: S) -> Result<()> {
        self.inner.handle.set_failed(message)
    }

    /// Resolve as failed with "<device> <cmd> failed: <reason>"
    pub fn fail_with_reason<S: AsRef<str>>(&self, reason: S) -> Result<()> {
        self.set_failed(format!(
            "{} {} failed: {}",
            self.inner.device,
            self.inner.cmd,
            reason.as_ref()
        ))
    }

    /// Register a callback to run once, when the exchange resolves
    ///
    /// The callback holds only a weak reference; it is skipped if every
    /// clone of the exchange was dropped before resolution.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&DeviceExchange) + Send + 'static,
    {
        let weak: Weak<ExchangeInner> = Arc::downgrade(&self.inner);
        self.inner.handle.add_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                callback(&DeviceExchange { inner });
            }
        });
    }

    /// Mirror this exchange's outcome onto a tracking handle
    pub fn track_with(&self, user_cmd: CompletionHandle) {
        self.add_callback(move |exchange| {
            let result = if exchange.did_fail() {
                user_cmd.set_failed(exchange.message().unwrap_or_default())
            } else {
                user_cmd.set_done()
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "Tracking handle already resolved");
            }
        });
    }

    /// Wait until the exchange resolves
    pub async fn wait(&self) -> CommandState {
        self.inner.handle.wait().await
    }

    /// Whether both values refer to the same exchange
    pub fn ptr_eq(&self, other: &DeviceExchange) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DeviceExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceExchange")
            .field("device", &self.inner.device)
            .field("cmd", &self.inner.cmd)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_resolve_once() {
        let handle = CompletionHandle::new("tcs init");
        assert_eq!(handle.state(), CommandState::Running);

        handle.set_failed("bad reply").unwrap();
        assert!(handle.did_fail());
        assert_eq!(handle.message().as_deref(), Some("bad reply"));

        assert!(matches!(handle.set_done(), Err(DeviceError::AlreadyResolved(_))));
        assert!(handle.did_fail());
        assert!(handle.ensure_running().is_err());
    }

    #[test]
    fn test_callbacks_run_exactly_once() {
        let handle = CompletionHandle::new("op");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            handle.add_callback(move |h| {
                assert!(h.is_done());
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.set_done().unwrap();
        let _ = handle.set_done();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let late = calls.clone();
        handle.add_callback(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_state() {
        let handle = CompletionHandle::new("op");
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };
        tokio::task::yield_now().await;
        handle.set_done().unwrap();
        assert_eq!(waiter.await.unwrap(), CommandState::Done);

        // already resolved
        assert_eq!(handle.wait().await, CommandState::Done);
    }

    #[test]
    fn test_wait_is_pending_until_resolved() {
        let handle = CompletionHandle::new("op");
        let mut waiting = tokio_test::task::spawn(handle.wait());
        tokio_test::assert_pending!(waiting.poll());

        handle.set_failed("no reply").unwrap();
        assert!(waiting.is_woken());
        tokio_test::assert_ready_eq!(waiting.poll(), CommandState::Failed);
    }

    #[test]
    fn test_exchange_failure_message() {
        let exchange = DeviceExchange::new("focus", "move 5", "move 5\r");
        assert_eq!(exchange.full_cmd_str(), "move 5\r");

        exchange.fail_with_reason("not connected").unwrap();
        assert_eq!(
            exchange.message().as_deref(),
            Some("focus move 5 failed: not connected")
        );
    }

    #[test]
    fn test_exchange_tracks_user_command() {
        let exchange = DeviceExchange::new("focus", "status", "status");
        let user_cmd = CompletionHandle::new("user status");
        exchange.track_with(user_cmd.clone());

        exchange.set_failed("focus status failed: timeout").unwrap();
        assert!(user_cmd.did_fail());
        assert_eq!(
            user_cmd.message().as_deref(),
            Some("focus status failed: timeout")
        );
    }
}
