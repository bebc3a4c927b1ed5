//! Low-memory admission gate

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::events::{Event, EventBus, EventPayload};

/// Default utilization at which new requests are refused
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 0.8;

/// Tracks per-device memory utilization reported by telemetry
///
/// Never touches request locks; a caller rejected here must release any
/// lock it already holds.
#[derive(Debug)]
pub struct MemoryMonitor {
    bus: EventBus,
    threshold: f64,
    usage: Mutex<HashMap<String, f64>>,
}

impl MemoryMonitor {
    #[must_use]
    pub fn new(bus: EventBus, threshold: f64) -> Self {
        tracing::info!(threshold, "memory monitor initialized");
        Self {
            bus,
            threshold,
            usage: Mutex::new(HashMap::new()),
        }
    }

    fn usage(&self) -> std::sync::MutexGuard<'_, HashMap<String, f64>> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a telemetry report, clamped to `0.0..=1.0`
    pub fn update_memory_usage(&self, device_id: &str, memory_usage: f64) {
        let clamped = if memory_usage.is_nan() {
            0.0
        } else {
            memory_usage.clamp(0.0, 1.0)
        };
        self.usage().insert(device_id.to_string(), clamped);

        if clamped >= self.threshold {
            tracing::warn!(
                device_id,
                memory_usage = clamped,
                threshold = self.threshold,
                "low memory on device"
            );
        } else {
            tracing::debug!(device_id, memory_usage = clamped, "memory usage updated");
        }
    }

    /// Whether the device may take a new request
    ///
    /// Publishes `memory.low` and returns false at or above the threshold.
    /// Devices that never reported count as idle.
    pub fn check_memory_available(&self, device_id: &str, request_id: &str) -> bool {
        let memory_usage = self.memory_usage(device_id);
        if memory_usage < self.threshold {
            return true;
        }

        tracing::error!(
            request_id,
            device_id,
            memory_usage,
            threshold = self.threshold,
            "memory check failed"
        );
        self.bus.publish(Event::for_request(
            request_id,
            EventPayload::MemoryLow {
                device_id: device_id.to_string(),
                memory_usage,
                threshold: self.threshold,
            },
        ));
        false
    }

    /// Last reported utilization, 0.0 if unknown
    #[must_use]
    pub fn memory_usage(&self, device_id: &str) -> f64 {
        self.usage().get(device_id).copied().unwrap_or(0.0)
    }

    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }
}
