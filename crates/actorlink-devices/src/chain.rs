/*!
 * Sequential command lists.
 */
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use actorlink_core::utils::lock;

use crate::command::{CommandState, CompletionHandle, DeviceExchange};
use crate::device::Device;

/// Called once with the final exchange of a command list
pub type ChainCallback = Box<dyn FnOnce(&DeviceExchange) + Send>;

struct ChainProgress {
    exchanges: Vec<DeviceExchange>,
}

/// Runs commands on one device in order, stopping at the first failure
///
/// The first command is sent before [`Device::start_cmd_list`] returns;
/// each later command is sent on a later scheduling turn, after the
/// previous one succeeded.
#[derive(Clone)]
pub struct CommandChain {
    handle: CompletionHandle,
    progress: Arc<Mutex<ChainProgress>>,
}

impl CommandChain {
    pub(crate) fn start(
        runtime: &Handle,
        device: Arc<Device>,
        cmds: Vec<String>,
        callback: Option<ChainCallback>,
        handle: CompletionHandle,
        timeout: Option<Duration>,
    ) -> Self {
        let mut remaining = cmds.into_iter();
        // callers reject empty lists
        let first_cmd = remaining.next().unwrap_or_default();
        let first = device.start_cmd(first_cmd, timeout);

        let chain = Self {
            handle,
            progress: Arc::new(Mutex::new(ChainProgress {
                exchanges: vec![first.clone()],
            })),
        };

        let runner = chain.clone();
        runtime.spawn(async move {
            let mut current = first;
            loop {
                if current.wait().await == CommandState::Failed {
                    debug!(device = device.name(), cmd = current.cmd_str(), "Command list stopped");
                    break;
                }
                let Some(next_cmd) = remaining.next() else {
                    break;
                };
                tokio::task::yield_now().await;
                current = device.start_cmd(next_cmd, timeout);
                lock(&runner.progress).exchanges.push(current.clone());
            }
            runner.finish(&current, callback);
        });

        chain
    }

    fn finish(&self, last: &DeviceExchange, callback: Option<ChainCallback>) {
        if let Some(callback) = callback {
            callback(last);
        }
        let result = if last.did_fail() {
            self.handle
                .set_failed(last.message().unwrap_or_default())
        } else {
            self.handle.set_done()
        };
        if let Err(e) = result {
            warn!(label = self.handle.label(), error = %e, "Handle resolved elsewhere");
        }
    }

    /// The exchange most recently started
    pub fn current(&self) -> Option<DeviceExchange> {
        lock(&self.progress).exchanges.last().cloned()
    }

    /// Every exchange started so far, in order
    pub fn exchanges(&self) -> Vec<DeviceExchange> {
        lock(&self.progress).exchanges.clone()
    }

    /// The handle that resolves when the list finishes
    pub fn handle(&self) -> &CompletionHandle {
        &self.handle
    }

    /// Whether the list finished
    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    /// Wait for the list to finish
    pub async fn wait(&self) -> CommandState {
        self.handle.wait().await
    }
}

impl fmt::Debug for CommandChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandChain")
            .field("handle", &self.handle)
            .field("started", &lock(&self.progress).exchanges.len())
            .finish()
    }
}
