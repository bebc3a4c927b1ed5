//! Channel-backed transport for simulated devices and tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{DeviceMessage, DeviceTransport};
use crate::{Error, Result};

type Outbox = mpsc::UnboundedSender<DeviceMessage>;

/// Delivers device messages over in-process channels
///
/// Cheap to clone; clones share the connection table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    devices: Arc<Mutex<HashMap<String, Outbox>>>,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, HashMap<String, Outbox>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect a device, returning the receiving end of its inbox
    ///
    /// Reconnecting replaces the previous inbox.
    pub fn connect(&self, device_id: &str) -> mpsc::UnboundedReceiver<DeviceMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.devices().insert(device_id.to_string(), tx).is_some() {
            tracing::info!(device_id, "device reconnected, replacing inbox");
        } else {
            tracing::info!(device_id, "device connected");
        }
        rx
    }

    /// Drop a device's connection
    ///
    /// Returns true if the device was connected
    pub fn disconnect(&self, device_id: &str) -> bool {
        let removed = self.devices().remove(device_id).is_some();
        if removed {
            tracing::info!(device_id, "device disconnected");
        }
        removed
    }

    #[must_use]
    pub fn connected_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl DeviceTransport for InMemoryTransport {
    async fn send(&self, device_id: &str, message: DeviceMessage) -> Result<()> {
        let outbox = self
            .devices()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("device {device_id} is not connected")))?;

        outbox.send(message).map_err(|_| {
            self.devices().remove(device_id);
            Error::Transport(format!("device {device_id} closed its connection"))
        })
    }

    fn is_connected(&self, device_id: &str) -> bool {
        self.devices()
            .get(device_id)
            .is_some_and(|outbox| !outbox.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(request_id: &str) -> DeviceMessage {
        DeviceMessage::CaptureRequest {
            request_id: request_id.to_string(),
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn routes_messages_to_connected_device() {
        let transport = InMemoryTransport::new();
        let mut inbox = transport.connect("esp32-1");

        transport.send("esp32-1", capture("req-1")).await.unwrap();

        assert_eq!(inbox.recv().await.unwrap().request_id(), "req-1");
        assert!(transport.is_connected("esp32-1"));
    }

    #[tokio::test]
    async fn unknown_device_is_an_error() {
        let transport = InMemoryTransport::new();
        let err = transport.send("ghost", capture("req-1")).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!transport.is_connected("ghost"));
    }

    #[tokio::test]
    async fn dropped_inbox_counts_as_disconnected() {
        let transport = InMemoryTransport::new();
        drop(transport.connect("esp32-1"));

        assert!(!transport.is_connected("esp32-1"));
        assert!(transport.send("esp32-1", capture("req-1")).await.is_err());
        assert!(transport.connected_devices().is_empty());
    }

    #[test]
    fn disconnect_reports_prior_state() {
        let transport = InMemoryTransport::new();
        let _inbox = transport.connect("esp32-1");
        assert_eq!(transport.connected_devices(), vec!["esp32-1".to_string()]);
        assert!(transport.disconnect("esp32-1"));
        assert!(!transport.disconnect("esp32-1"));
    }
}
