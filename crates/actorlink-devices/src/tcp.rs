/*!
 * TCP line connection.
 *
 * Each connect starts a session task that owns the socket. Lines to send
 * go through an unbounded channel to a writer task; received lines are
 * dispatched to read callbacks from the session task.
 */
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn, Instrument};

use actorlink_core::config::DeviceConfig;
use actorlink_core::logging::component_span;
use actorlink_core::observable::Subscription;
use actorlink_core::types::ConnectionId;
use actorlink_core::utils::{lock, with_optional_limit};

use crate::connection::{
    not_connected, Connection, ConnectionCore, ConnectionState, ConnectionStatus, ReadCallback,
    StateCallback,
};
use crate::error::{DeviceError, Result};

struct Link {
    session: u64,
    writer: Option<mpsc::UnboundedSender<String>>,
    shutdown: Option<oneshot::Sender<()>>,
}

struct TcpInner {
    core: ConnectionCore,
    session: AtomicU64,
    link: Mutex<Option<Link>>,
}

/// A line-oriented TCP connection
///
/// Lines are terminated with `\n` on send; `\n` or `\r\n` is accepted on
/// receive.
pub struct TcpConnection {
    inner: Arc<TcpInner>,
}

impl TcpConnection {
    /// Create a disconnected connection to `host:port`
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            inner: Arc::new(TcpInner {
                core: ConnectionCore::new(host, port),
                session: AtomicU64::new(0),
                link: Mutex::new(None),
            }),
        }
    }

    /// Create a connection from a device configuration entry
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.host.clone(), config.port)
    }
}

impl TcpInner {
    fn is_current(&self, session: u64) -> bool {
        self.session.load(Ordering::SeqCst) == session
    }

    fn finish(&self, session: u64, state: ConnectionState, reason: Option<String>) {
        if !self.is_current(session) {
            debug!(session, "Stale session ended");
            return;
        }
        {
            let mut link = lock(&self.link);
            if link.as_ref().map(|l| l.session) == Some(session) {
                *link = None;
            }
        }
        self.core.set_state(state, reason);
    }

    async fn run(
        self: Arc<Self>,
        session: u64,
        timeout: Option<Duration>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let addr = format!("{}:{}", self.core.host(), self.core.port());
        let connect = with_optional_limit(timeout, TcpStream::connect(addr.clone()));

        let stream = tokio::select! {
            _ = &mut shutdown => {
                self.finish(session, ConnectionState::Disconnected, None);
                return;
            }
            result = connect => match result {
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    warn!(%addr, error = %e, "Connect failed");
                    self.finish(session, ConnectionState::Failed, Some(e.to_string()));
                    return;
                }
                None => {
                    warn!(%addr, "Connect timed out");
                    self.finish(
                        session,
                        ConnectionState::Failed,
                        Some("timed out connecting".to_string()),
                    );
                    return;
                }
            }
        };

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut link = lock(&self.link);
            match link.as_mut() {
                Some(link) if link.session == session => link.writer = Some(tx),
                _ => return,
            }
        }
        let writer = tokio::spawn(writer_task(write_half, rx));

        info!(%addr, "Connected");
        self.core.set_state(ConnectionState::Connected, None);

        let mut lines = BufReader::new(read_half).lines();
        let (state, reason) = loop {
            tokio::select! {
                _ = &mut shutdown => break (ConnectionState::Disconnected, None),
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        debug!(%addr, %line, "Read");
                        self.core.dispatch_line(&line);
                    }
                    Ok(None) => {
                        break (
                            ConnectionState::Disconnected,
                            Some("connection closed by peer".to_string()),
                        )
                    }
                    Err(e) => break (ConnectionState::Failed, Some(e.to_string())),
                }
            }
        };

        // Dropping the sender lets the writer flush and close its half.
        {
            let mut link = lock(&self.link);
            if let Some(link) = link.as_mut().filter(|l| l.session == session) {
                link.writer = None;
            }
        }
        let _ = writer.await;

        info!(%addr, %state, "Session ended");
        self.finish(session, state, reason);
    }
}

async fn writer_task<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(error = %e, "Write error");
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            warn!(error = %e, "Write error");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.inner.core.id()
    }

    fn host(&self) -> &str {
        self.inner.core.host()
    }

    fn port(&self) -> u16 {
        self.inner.core.port()
    }

    fn connect(&self, timeout: Option<Duration>) {
        let core = &self.inner.core;
        if matches!(
            core.full_state().state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                core.set_state(
                    ConnectionState::Failed,
                    Some(format!("no async runtime: {}", e)),
                );
                return;
            }
        };

        let session = self.inner.session.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *lock(&self.inner.link) = Some(Link {
            session,
            writer: None,
            shutdown: Some(shutdown_tx),
        });

        debug!(host = core.host(), port = core.port(), session, "Connecting");
        core.set_state(ConnectionState::Connecting, None);
        let addr = format!("{}:{}", self.inner.core.host(), self.inner.core.port());
        let span = component_span("tcp", Some(&addr));
        runtime.spawn(
            self.inner
                .clone()
                .run(session, timeout, shutdown_rx)
                .instrument(span),
        );
    }

    fn disconnect(&self) {
        let core = &self.inner.core;
        if !matches!(
            core.full_state().state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        let shutdown = lock(&self.inner.link)
            .as_mut()
            .and_then(|link| link.shutdown.take());
        core.set_state(ConnectionState::Disconnecting, None);
        let signalled = match shutdown {
            Some(shutdown) => shutdown.send(()).is_ok(),
            None => false,
        };
        if !signalled {
            *lock(&self.inner.link) = None;
            core.set_state(ConnectionState::Disconnected, None);
        }
    }

    fn full_state(&self) -> ConnectionStatus {
        self.inner.core.full_state()
    }

    fn add_state_callback(&self, callback: StateCallback, call_now: bool) -> Subscription {
        self.inner.core.add_state_callback(callback, call_now)
    }

    fn remove_state_callback(&self, subscription: Subscription) -> bool {
        self.inner.core.remove_state_callback(subscription)
    }

    fn add_read_callback(&self, callback: ReadCallback) -> Subscription {
        self.inner.core.add_read_callback(callback)
    }

    fn remove_read_callback(&self, subscription: Subscription) -> bool {
        self.inner.core.remove_read_callback(subscription)
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(not_connected(self));
        }
        let link = lock(&self.inner.link);
        let writer = link
            .as_ref()
            .and_then(|link| link.writer.as_ref())
            .ok_or_else(|| not_connected(self))?;
        writer
            .send(line.to_string())
            .map_err(|_| DeviceError::Write(format!("{}:{} writer closed", self.host(), self.port())))?;
        debug!(host = self.host(), port = self.port(), %line, "Sent");
        Ok(())
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if let Some(shutdown) = lock(&self.inner.link)
            .as_mut()
            .and_then(|link| link.shutdown.take())
        {
            let _ = shutdown.send(());
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("core", &self.inner.core)
            .finish()
    }
}
