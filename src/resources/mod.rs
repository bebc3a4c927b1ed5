//! Per-device admission control
//!
//! A device runs at most one request at a time. The [`ResourceManager`]
//! holds one [`DeviceLock`] per busy device; its presence is the only gate
//! for new requests. The [`MemoryMonitor`] is a second, independent gate
//! fed by device telemetry.

mod memory;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::time::Instant;

use crate::events::{Event, EventBus, EventPayload};
use crate::recovery::ErrorKind;

pub use memory::{DEFAULT_MEMORY_THRESHOLD, MemoryMonitor};

/// Coarse phase of the request holding a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Processing,
    Playback,
    Complete,
}

/// The request currently admitted on a device
#[derive(Debug, Clone)]
pub struct DeviceLock {
    pub request_id: String,
    pub device_id: String,
    pub acquired_at: Instant,
    pub state: LockState,
}

/// Enforces one in-flight request per device
#[derive(Debug)]
pub struct ResourceManager {
    bus: EventBus,
    locks: Mutex<HashMap<String, DeviceLock>>,
}

impl ResourceManager {
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        tracing::info!("resource manager initialized, one request per device");
        Self {
            bus,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, DeviceLock>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit `request_id` on `device_id`
    ///
    /// Returns false, and publishes `request.rejected` naming the current
    /// holder, if the device already runs a request.
    pub fn acquire_request_lock(&self, request_id: &str, device_id: &str) -> bool {
        let mut locks = self.locks();

        if let Some(active) = locks.get(device_id) {
            let active_request_id = active.request_id.clone();
            drop(locks);

            tracing::warn!(
                request_id,
                device_id,
                active_request_id = %active_request_id,
                "request rejected, device busy"
            );
            self.bus.publish(Event::for_request(
                request_id,
                EventPayload::RequestRejected {
                    device_id: device_id.to_string(),
                    reason: ErrorKind::ConcurrentLimit.to_string(),
                    active_request_id: Some(active_request_id),
                },
            ));
            return false;
        }

        locks.insert(
            device_id.to_string(),
            DeviceLock {
                request_id: request_id.to_string(),
                device_id: device_id.to_string(),
                acquired_at: Instant::now(),
                state: LockState::Processing,
            },
        );
        // Publish under the lock so acquired/released events keep lock order
        self.bus.publish(Event::for_request(
            request_id,
            EventPayload::LockAcquired {
                device_id: device_id.to_string(),
            },
        ));
        drop(locks);

        tracing::info!(request_id, device_id, "request lock acquired");
        true
    }

    /// Release the device lock held by `request_id`
    ///
    /// A lock held by a different request is never force-released. Returns
    /// true if a lock was released.
    pub fn release_request_lock(&self, request_id: &str, device_id: &str) -> bool {
        let mut locks = self.locks();

        let held_by = locks.get(device_id).map(|lock| lock.request_id.clone());
        match held_by {
            None => {
                drop(locks);
                tracing::debug!(request_id, device_id, "no active lock to release");
                return false;
            }
            Some(holder) if holder != request_id => {
                drop(locks);
                tracing::warn!(
                    request_id,
                    device_id,
                    active_request_id = %holder,
                    "lock held by another request, not releasing"
                );
                return false;
            }
            Some(_) => {}
        }

        let Some(lock) = locks.remove(device_id) else {
            return false;
        };
        let held = lock.acquired_at.elapsed();
        self.bus.publish(Event::for_request(
            request_id,
            EventPayload::LockReleased {
                device_id: device_id.to_string(),
                held_ms: u64::try_from(held.as_millis()).unwrap_or(u64::MAX),
            },
        ));
        drop(locks);

        tracing::info!(
            request_id,
            device_id,
            held_secs = held.as_secs_f64(),
            "request lock released"
        );
        true
    }

    /// Change the state tag of the lock held by `request_id`
    ///
    /// Returns false if the device holds no lock for that request.
    pub fn update_request_state(&self, request_id: &str, device_id: &str, state: LockState) -> bool {
        let mut locks = self.locks();
        match locks.get_mut(device_id) {
            Some(lock) if lock.request_id == request_id => {
                lock.state = state;
                drop(locks);
                tracing::debug!(request_id, device_id, state = ?state, "request state updated");
                true
            }
            _ => {
                drop(locks);
                tracing::warn!(request_id, device_id, "no matching lock to update");
                false
            }
        }
    }

    #[must_use]
    pub fn is_device_busy(&self, device_id: &str) -> bool {
        self.locks().contains_key(device_id)
    }

    /// Snapshot of the lock held on `device_id`
    #[must_use]
    pub fn active_lock(&self, device_id: &str) -> Option<DeviceLock> {
        self.locks().get(device_id).cloned()
    }

    /// Number of devices currently running a request
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.locks().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::EventKind;

    #[test]
    fn second_request_is_rejected_naming_holder() {
        let bus = EventBus::default();
        let manager = ResourceManager::new(bus.clone());

        assert!(manager.acquire_request_lock("req-1", "esp32-1"));
        assert!(!manager.acquire_request_lock("req-2", "esp32-1"));

        let rejected = bus.get_history(None, Some(EventKind::RequestRejected));
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].request_id(), Some("req-2"));
        let EventPayload::RequestRejected {
            reason,
            active_request_id,
            ..
        } = &rejected[0].payload
        else {
            panic!("expected rejection payload");
        };
        assert_eq!(reason, "concurrent_request_limit");
        assert_eq!(active_request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn devices_are_independent() {
        let manager = ResourceManager::new(EventBus::default());
        assert!(manager.acquire_request_lock("req-1", "esp32-1"));
        assert!(manager.acquire_request_lock("req-2", "esp32-2"));
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn release_then_reacquire() {
        let manager = ResourceManager::new(EventBus::default());
        assert!(manager.acquire_request_lock("req-1", "esp32-1"));
        assert!(manager.release_request_lock("req-1", "esp32-1"));
        assert!(!manager.is_device_busy("esp32-1"));
        assert!(manager.acquire_request_lock("req-2", "esp32-1"));
    }

    #[test]
    fn mismatched_release_is_ignored() {
        let bus = EventBus::default();
        let manager = ResourceManager::new(bus.clone());
        manager.acquire_request_lock("req-1", "esp32-1");

        assert!(!manager.release_request_lock("req-2", "esp32-1"));
        assert_eq!(manager.active_lock("esp32-1").unwrap().request_id, "req-1");
        assert!(bus.get_history(None, Some(EventKind::LockReleased)).is_empty());

        // Releasing twice is a no-op
        assert!(manager.release_request_lock("req-1", "esp32-1"));
        assert!(!manager.release_request_lock("req-1", "esp32-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn release_reports_held_duration() {
        let bus = EventBus::default();
        let manager = ResourceManager::new(bus.clone());
        manager.acquire_request_lock("req-1", "esp32-1");

        tokio::time::advance(Duration::from_millis(1500)).await;
        manager.release_request_lock("req-1", "esp32-1");

        let released = bus.get_history(None, Some(EventKind::LockReleased));
        let EventPayload::LockReleased { held_ms, .. } = &released[0].payload else {
            panic!("expected release payload");
        };
        assert_eq!(*held_ms, 1500);
    }

    #[test]
    fn state_updates_keep_identity() {
        let manager = ResourceManager::new(EventBus::default());
        manager.acquire_request_lock("req-1", "esp32-1");

        assert!(manager.update_request_state("req-1", "esp32-1", LockState::Playback));
        assert!(!manager.update_request_state("req-2", "esp32-1", LockState::Complete));

        let lock = manager.active_lock("esp32-1").unwrap();
        assert_eq!(lock.request_id, "req-1");
        assert_eq!(lock.state, LockState::Playback);
    }
}
