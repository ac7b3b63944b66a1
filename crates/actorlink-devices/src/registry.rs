/*!
 * Device registry for actorlink.
 *
 * This module provides the named collection of devices an actor controls.
 */
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use actorlink_core::config::{Config, DeviceConfig};
use actorlink_core::types::ConnectionId;

use crate::command::{CommandState, CompletionHandle};
use crate::connection::Connection;
use crate::device::{Device, DeviceHandler};
use crate::error::{DeviceError, Result};
use crate::tcp::TcpConnection;

/// Device names may not start with this prefix
pub const RESERVED_PREFIX: &str = "_";

/// Names that would shadow registry accessors
pub const RESERVED_NAMES: &[&str] = &[
    "get",
    "device",
    "devices",
    "names",
    "iter",
    "len",
    "is_empty",
    "connect_all",
    "disconnect_all",
    "get_from_connection",
    "get_from_connection_id",
    "wait_all",
    "from_config",
];

/// Device registry
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    /// The registered devices, by name
    devices: BTreeMap<String, Arc<Device>>,
    /// Device name for each connection
    by_connection: HashMap<ConnectionId, String>,
}

impl DeviceRegistry {
    /// Create a registry from a list of devices
    ///
    /// Fails if a name is reserved or repeated, or if two devices share a
    /// connection.
    pub fn new<I>(devices: I) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<Device>>,
    {
        let mut registry = Self::default();

        for device in devices {
            let name = device.name().to_string();
            if name.starts_with(RESERVED_PREFIX) {
                return Err(DeviceError::InvalidName(format!(
                    "{:?} starts with reserved prefix {:?}",
                    name, RESERVED_PREFIX
                )));
            }
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(DeviceError::InvalidName(format!("{:?} is reserved", name)));
            }
            if registry.devices.contains_key(&name) {
                return Err(DeviceError::DuplicateName(name));
            }

            let connection_id = device.connection().id();
            if let Some(existing) = registry.by_connection.get(&connection_id) {
                return Err(DeviceError::SharedConnection {
                    new: name,
                    existing: existing.clone(),
                });
            }

            registry.by_connection.insert(connection_id, name.clone());
            registry.devices.insert(name.clone(), device);
            debug!("Registered device {}", name);
        }

        info!("Registry holds {} devices", registry.devices.len());
        Ok(registry)
    }

    /// Build TCP devices for every configured device entry
    ///
    /// `handler_for` supplies the handler for each entry. Every device
    /// takes its default limits from `config.timeouts`.
    pub fn from_config<F>(config: &Config, mut handler_for: F) -> Result<Self>
    where
        F: FnMut(&DeviceConfig) -> Arc<dyn DeviceHandler>,
    {
        let devices = config
            .devices
            .iter()
            .map(|entry| {
                let connection: Arc<dyn Connection> = Arc::new(TcpConnection::from_config(entry));
                Device::builder(entry.name.clone(), connection, handler_for(entry))
                    .with_timeouts(config.timeouts.clone())
                    .build()
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(devices)
    }

    /// Get a device by name
    pub fn get(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.get(name)
    }

    /// Get a device by name, or a not-found error
    pub fn device(&self, name: &str) -> Result<&Arc<Device>> {
        self.get(name)
            .ok_or_else(|| DeviceError::NotFound(format!("no device named {:?}", name)))
    }

    /// Get the device using `connection`
    pub fn get_from_connection(&self, connection: &dyn Connection) -> Result<&Arc<Device>> {
        self.get_from_connection_id(connection.id())
    }

    /// Get the device using the connection with the given ID
    pub fn get_from_connection_id(&self, id: ConnectionId) -> Result<&Arc<Device>> {
        self.by_connection
            .get(&id)
            .and_then(|name| self.devices.get(name))
            .ok_or_else(|| DeviceError::NotFound(format!("no device uses connection {}", id)))
    }

    /// Devices sorted by name
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }

    /// Device names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.devices.keys().map(String::as_str).collect()
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Start connecting every device, each with its default connect limit
    ///
    /// A device that refuses to start (for example because it is busy)
    /// gets an already failed handle.
    pub fn connect_all(&self) -> Vec<CompletionHandle> {
        self.iter()
            .map(|device| {
                debug!("Connecting device {}", device.name());
                settle(device, "connect", device.connect(None, None))
            })
            .collect()
    }

    /// Start disconnecting every device, each with its default disconnect limit
    pub fn disconnect_all(&self) -> Vec<CompletionHandle> {
        self.iter()
            .map(|device| {
                debug!("Disconnecting device {}", device.name());
                settle(device, "disconnect", device.disconnect(None, None))
            })
            .collect()
    }

    /// Wait for every handle to resolve
    pub async fn wait_all(handles: &[CompletionHandle]) -> Vec<CommandState> {
        join_all(handles.iter().map(|handle| handle.wait())).await
    }
}

fn settle(device: &Arc<Device>, what: &str, started: Result<CompletionHandle>) -> CompletionHandle {
    started.unwrap_or_else(|e| {
        warn!("Failed to {} device {}: {}", what, device.name(), e);
        let handle = CompletionHandle::new(format!("{} {}", device.name(), what));
        let _ = handle.set_failed(e.to_string());
        handle
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use actorlink_core::config::TimeoutConfig;

    use crate::testing::{Behavior, FakeConnection, ScriptedHandler};

    fn device(name: &str) -> Arc<Device> {
        Device::new(name, Arc::new(FakeConnection::new()), Arc::new(ScriptedHandler::new())).unwrap()
    }

    #[test]
    fn test_sorted_iteration_and_lookup() {
        let registry = DeviceRegistry::new(vec![device("tcs"), device("focus"), device("mirror")]).unwrap();

        assert_eq!(registry.names(), vec!["focus", "mirror", "tcs"]);
        assert_eq!(
            registry.iter().map(|d| d.name()).collect::<Vec<_>>(),
            vec!["focus", "mirror", "tcs"]
        );
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("tcs").unwrap().name(), "tcs");
        assert!(registry.get("dome").is_none());
        assert!(matches!(registry.device("dome"), Err(DeviceError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = DeviceRegistry::new(vec![device("foo"), device("foo")]);
        assert!(matches!(result, Err(DeviceError::DuplicateName(name)) if name == "foo"));
    }

    #[test]
    fn test_reserved_names_rejected() {
        assert!(matches!(
            DeviceRegistry::new(vec![device("_x")]),
            Err(DeviceError::InvalidName(_))
        ));
        for reserved in ["names", "wait_all", "get_from_connection_id", "from_config"] {
            assert!(matches!(
                DeviceRegistry::new(vec![device(reserved)]),
                Err(DeviceError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_shared_connection_rejected() {
        let shared = Arc::new(FakeConnection::new());
        let a = Device::new("a", shared.clone(), Arc::new(ScriptedHandler::new())).unwrap();
        let b = Device::new("b", shared, Arc::new(ScriptedHandler::new())).unwrap();

        let err = DeviceRegistry::new(vec![a, b]).unwrap_err();
        assert!(matches!(err, DeviceError::SharedConnection { ref new, ref existing } if new == "b" && existing == "a"));
    }

    #[test]
    fn test_get_from_connection() {
        let conn = Arc::new(FakeConnection::new());
        let tcs = Device::new("tcs", conn.clone(), Arc::new(ScriptedHandler::new())).unwrap();
        let registry = DeviceRegistry::new(vec![tcs, device("focus")]).unwrap();

        assert_eq!(registry.get_from_connection(conn.as_ref()).unwrap().name(), "tcs");

        let stranger = FakeConnection::new();
        assert!(matches!(
            registry.get_from_connection(&stranger),
            Err(DeviceError::NotFound(_))
        ));
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.timeouts.command_ms = 1500;
        config.devices = vec![
            DeviceConfig {
                name: "tcs".to_string(),
                host: "10.0.0.5".to_string(),
                port: 2001,
            },
            DeviceConfig {
                name: "focus".to_string(),
                host: "focus.local".to_string(),
                port: 23,
            },
        ];

        let mut seen = Vec::new();
        let registry = DeviceRegistry::from_config(&config, |entry| {
            seen.push(entry.name.clone());
            Arc::new(ScriptedHandler::new())
        })
        .unwrap();

        assert_eq!(seen, vec!["tcs", "focus"]);
        let tcs = registry.device("tcs").unwrap();
        assert_eq!(tcs.connection().host(), "10.0.0.5");
        assert_eq!(tcs.connection().port(), 2001);
        assert_eq!(tcs.timeouts().connect(), Some(Duration::from_secs(10)));
        assert_eq!(tcs.timeouts().command(), Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_all() {
        let refused = Arc::new(FakeConnection::new());
        refused.set_connect(Behavior::Fail("refused".into()));
        let bad = Device::new("bad", refused, Arc::new(ScriptedHandler::new())).unwrap();
        let registry = DeviceRegistry::new(vec![device("good"), bad]).unwrap();

        let handles = registry.connect_all();
        let states = DeviceRegistry::wait_all(&handles).await;
        // sorted by name: bad, good
        assert_eq!(states, vec![CommandState::Failed, CommandState::Done]);

        let handles = registry.disconnect_all();
        let states = DeviceRegistry::wait_all(&handles).await;
        assert!(states.iter().all(|s| *s == CommandState::Done));
        assert!(registry.iter().all(|d| d.is_disconnected()));
    }

    #[tokio::test]
    async fn test_busy_device_gets_failed_handle() {
        let slow = Arc::new(FakeConnection::new());
        slow.set_connect(Behavior::Hang);
        let registry = DeviceRegistry::new(vec![Device::new(
            "slow",
            slow,
            Arc::new(ScriptedHandler::new()),
        )
        .unwrap()])
        .unwrap();

        let first = registry.connect_all();
        let second = registry.connect_all();
        assert!(!first[0].is_done());
        assert!(second[0].did_fail());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_all_uses_device_limits() {
        let slow = Arc::new(FakeConnection::new());
        slow.set_connect(Behavior::Hang);
        let mut timeouts = TimeoutConfig::unlimited();
        timeouts.connect_ms = 2000;
        let device = Device::builder("slow", slow.clone(), Arc::new(ScriptedHandler::new()))
            .with_timeouts(timeouts)
            .build()
            .unwrap();
        let registry = DeviceRegistry::new(vec![device]).unwrap();

        let handles = registry.connect_all();
        let states = DeviceRegistry::wait_all(&handles).await;
        assert_eq!(states, vec![CommandState::Failed]);
        assert_eq!(
            handles[0].message().as_deref(),
            Some("slow failed to connect: timed out waiting for connection")
        );
        assert_eq!(slow.disconnect_calls(), 1);
    }
}
