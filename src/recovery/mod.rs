//! Central error handling and retry budgets
//!
//! Every failure that reaches the user goes through [`ErrorHandler::handle_error`],
//! which publishes an `error` event carrying a fixed, user-safe message and
//! asks for that message to be voiced. Raw provider errors only ever reach
//! the logs.

mod retry;
mod taxonomy;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::events::{ErrorPayload, Event, EventBus, EventPayload};

pub use retry::{RetryPolicy, delay_for_attempt};
pub use taxonomy::{ErrorEntry, ErrorKind, GENERIC_ENTRY};

/// Extra facts about a failure
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Device that should hear about the failure
    pub device_id: Option<String>,
    /// Retries already spent, when the failure ends a retry loop
    pub retry_count: Option<u32>,
    /// Internal detail; logged, never shown to the user
    pub detail: Option<String>,
}

impl ErrorContext {
    #[must_use]
    pub fn for_device(device_id: &str) -> Self {
        Self {
            device_id: Some(device_id.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

type RetryKey = (String, ErrorKind);

/// Publishes user-facing errors and tracks per-request retry budgets
///
/// Cheap to clone; clones share retry counters.
#[derive(Debug, Clone)]
pub struct ErrorHandler {
    bus: EventBus,
    retry_counts: Arc<Mutex<HashMap<RetryKey, u32>>>,
}

impl ErrorHandler {
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            retry_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, HashMap<RetryKey, u32>> {
        self.retry_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Report a failure to the user
    ///
    /// Always publishes an `error` event. Unless the failure is a synthesis
    /// failure, also publishes exactly one `synthesis.required` event with
    /// the same message text.
    pub fn handle_error(
        &self,
        kind: ErrorKind,
        request_id: Option<&str>,
        context: ErrorContext,
    ) -> ErrorPayload {
        if let ErrorKind::Unknown(tag) = &kind {
            tracing::error!(error_type = %tag, "unknown error type, using generic message");
        }

        let entry = kind.entry();

        tracing::info!(
            error_type = %kind,
            request_id = request_id.unwrap_or("-"),
            device_id = context.device_id.as_deref().unwrap_or("-"),
            retry_count = ?context.retry_count,
            detail = context.detail.as_deref().unwrap_or(""),
            "handling error"
        );

        let voice = !kind.is_synthesis_failure();
        let payload = ErrorPayload {
            error_type: kind,
            message: entry.message.to_string(),
            prerecorded_file: entry.prerecorded_file.map(ToString::to_string),
            retry_count: context.retry_count,
            device_id: context.device_id.clone(),
        };

        self.bus.publish(Event::new(
            request_id.map(ToString::to_string),
            EventPayload::Error(payload.clone()),
        ));

        if voice {
            self.bus.publish(Event::new(
                request_id.map(ToString::to_string),
                EventPayload::SynthesisRequired {
                    text: entry.message.to_string(),
                    device_id: context.device_id,
                    prerecorded_file: entry.prerecorded_file.map(ToString::to_string),
                    is_error_message: true,
                },
            ));
        }

        payload
    }

    /// Consume one retry from the budget for `(request_id, kind)`
    ///
    /// Returns false for kinds that are never retried (without counting)
    /// and once the budget is exhausted, at which point the counter is
    /// cleared.
    pub fn should_retry(&self, kind: &ErrorKind, request_id: &str) -> bool {
        let policy = kind.entry().retry;
        if !policy.allowed {
            return false;
        }

        let key = (request_id.to_string(), kind.clone());
        let mut counters = self.counters();
        let current = counters.get(&key).copied().unwrap_or(0);

        if current >= policy.max_retries {
            counters.remove(&key);
            drop(counters);
            tracing::info!(
                error_type = %kind,
                request_id,
                max_retries = policy.max_retries,
                "retry budget exhausted"
            );
            return false;
        }

        counters.insert(key, current + 1);
        drop(counters);
        tracing::info!(
            error_type = %kind,
            request_id,
            attempt = current + 1,
            max_retries = policy.max_retries,
            "retrying"
        );
        true
    }

    /// Retries spent so far for `(request_id, kind)`
    #[must_use]
    pub fn retry_count(&self, kind: &ErrorKind, request_id: &str) -> u32 {
        self.counters()
            .get(&(request_id.to_string(), kind.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Clear retry counters for a request (one kind, or all kinds)
    pub fn reset_retry_count(&self, request_id: &str, kind: Option<&ErrorKind>) {
        let mut counters = self.counters();
        match kind {
            Some(kind) => {
                counters.remove(&(request_id.to_string(), kind.clone()));
            }
            None => counters.retain(|(id, _), _| id != request_id),
        }
    }
}
