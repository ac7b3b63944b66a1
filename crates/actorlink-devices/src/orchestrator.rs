/*!
 * Connect and disconnect orchestration.
 *
 * Each orchestrator runs as one task that holds the device's [`InFlight`]
 * token from start to finish. `finish` consumes the orchestrator, so an
 * operation is finalized exactly once. Time limits wrap the awaited
 * transport event, so a limit can never fire after the event arrived.
 */
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info, warn, Instrument};

use actorlink_core::logging::operation_span;
use actorlink_core::types::MessageCode;
use actorlink_core::utils::with_optional_limit;

use crate::command::{CommandState, CompletionHandle};
use crate::connection::{Connection, ConnectionState, ConnectionStatus, StateListener};
use crate::device::{Device, DeviceState, InFlight};

type Outcome = std::result::Result<(), String>;

fn resolve(handle: &CompletionHandle, outcome: std::result::Result<(), String>) {
    let result = match outcome {
        Ok(()) => handle.set_done(),
        Err(message) => handle.set_failed(message),
    };
    if let Err(e) = result {
        warn!(label = handle.label(), error = %e, "Handle resolved elsewhere");
    }
}

/// Run `init` and wait for it to resolve
async fn run_init(device: &Arc<Device>, timeout: Option<Duration>, get_status: bool) -> Outcome {
    let init = CompletionHandle::new(format!("{} init", device.name()));
    device
        .handler()
        .init(device, init.clone(), timeout, get_status);
    match init.wait().await {
        CommandState::Failed => Err(init
            .message()
            .unwrap_or_else(|| "initialization failed".to_string())),
        _ => Ok(()),
    }
}

/// Drives a device from any state to connected and initialized
pub(crate) struct ConnectOrchestrator {
    guard: InFlight,
    handle: CompletionHandle,
    listener: StateListener,
    timeout: Option<Duration>,
}

impl ConnectOrchestrator {
    pub(crate) fn start(
        runtime: &Handle,
        guard: InFlight,
        handle: CompletionHandle,
        timeout: Option<Duration>,
    ) {
        let device = guard.device().clone();
        let connection = device.connection().clone();
        device.set_state(DeviceState::Connecting, None);

        let listener = StateListener::new(connection.clone());
        match connection.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!(device = device.name(), "Transport already connecting")
            }
            _ => connection.connect(timeout),
        }

        let span = operation_span("connect", device.name());
        let orchestrator = Self {
            guard,
            handle,
            listener,
            timeout,
        };
        runtime.spawn(orchestrator.run().instrument(span));
    }

    async fn run(mut self) {
        let outcome = self.establish().await;
        self.finish(outcome);
    }

    async fn establish(&mut self) -> Outcome {
        let device = self.guard.device().clone();
        let connection = device.connection().clone();

        let transport = with_optional_limit(
            self.timeout,
            wait_for_connect(&mut self.listener, connection.as_ref()),
        )
        .await;
        match transport {
            None => return Err("timed out waiting for connection".to_string()),
            Some(status) if !status.is_connected() => {
                debug!(device = device.name(), %status, "Transport did not connect");
                return Err("connection failed".to_string());
            }
            Some(_) => {}
        }

        debug!(device = device.name(), "Transport connected; initializing");
        run_init(&device, self.timeout, true).await
    }

    fn finish(self, outcome: Outcome) {
        let ConnectOrchestrator {
            guard,
            handle,
            listener,
            ..
        } = self;
        drop(listener);
        let device = guard.device().clone();

        match outcome {
            Ok(()) => {
                drop(guard);
                device.set_state(DeviceState::Connected, None);
                info!(device = device.name(), "Connected");
                resolve(&handle, Ok(()));
            }
            Err(reason) => {
                warn!(device = device.name(), %reason, "Connect failed");
                device.connection().disconnect();
                drop(guard);
                device.set_state(DeviceState::Failed, Some(reason.clone()));
                resolve(
                    &handle,
                    Err(format!("{} failed to connect: {}", device.name(), reason)),
                );
            }
        }
    }
}

async fn wait_for_connect(
    listener: &mut StateListener,
    connection: &dyn Connection,
) -> ConnectionStatus {
    loop {
        let current = connection.full_state();
        if current.is_connected() {
            return current;
        }
        match listener.next().await {
            Some(status) if status.is_connected() || status.is_disconnected() => return status,
            Some(_) => continue,
            None => return connection.full_state(),
        }
    }
}

/// Drives a device from any state to disconnected
pub(crate) struct DisconnectOrchestrator {
    guard: InFlight,
    handle: CompletionHandle,
    timeout: Option<Duration>,
    run_init: bool,
}

impl DisconnectOrchestrator {
    pub(crate) fn start(
        runtime: &Handle,
        guard: InFlight,
        handle: CompletionHandle,
        timeout: Option<Duration>,
    ) {
        let device = guard.device().clone();
        if device.state() != DeviceState::Disconnected {
            device.set_state(DeviceState::Disconnecting, None);
        }

        let run_init = device.connection().is_connected();
        if !run_init {
            device.write_to_users(
                MessageCode::Warning,
                &format!(
                    "{} is {}; skipping initialization before disconnecting",
                    device.name(),
                    device.connection().state()
                ),
            );
        }

        let span = operation_span("disconnect", device.name());
        let orchestrator = Self {
            guard,
            handle,
            timeout,
            run_init,
        };
        runtime.spawn(orchestrator.run().instrument(span));
    }

    async fn run(self) {
        let device = self.guard.device().clone();
        if self.run_init {
            if let Err(message) = run_init(&device, self.timeout, false).await {
                device.write_to_users(
                    MessageCode::Warning,
                    &format!("{} initialization before disconnecting failed: {}", device.name(), message),
                );
            }
        }
        let outcome = self.teardown(&device).await;
        self.finish(outcome);
    }

    async fn teardown(&self, device: &Arc<Device>) -> Outcome {
        let connection = device.connection().clone();
        if connection.is_disconnected() {
            debug!(device = device.name(), status = %connection.full_state(), "Transport already down");
            tokio::task::yield_now().await;
            return Ok(());
        }

        let mut listener = StateListener::new(connection.clone());
        connection.disconnect();
        match with_optional_limit(self.timeout, listener.wait_until(ConnectionStatus::is_disconnected)).await {
            Some(status) => confirm(status),
            None => Err("timed out waiting for disconnection".to_string()),
        }
    }

    fn finish(self, outcome: Outcome) {
        let DisconnectOrchestrator { guard, handle, .. } = self;
        let device = guard.device().clone();

        device.handler().cleanup(&device);
        drop(guard);

        match outcome {
            Ok(()) => {
                device.set_state(DeviceState::Disconnected, None);
                info!(device = device.name(), "Disconnected");
                resolve(&handle, Ok(()));
            }
            Err(reason) => {
                warn!(device = device.name(), %reason, "Disconnect failed");
                device.set_state(DeviceState::Failed, Some(reason.clone()));
                resolve(
                    &handle,
                    Err(format!("{} failed to disconnect: {}", device.name(), reason)),
                );
            }
        }
    }
}

fn confirm(status: ConnectionStatus) -> Outcome {
    if status.state == ConnectionState::Disconnected {
        Ok(())
    } else {
        Err(status
            .reason
            .unwrap_or_else(|| format!("connection {}", status.state.label().to_lowercase())))
    }
}
