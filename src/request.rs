//! Request identity and lifecycle
//!
//! A request runs from trigger to playback completion:
//!
//! ```text
//! Listening → Triggered → CaptureRequested → WaitingImage → VisionRunning
//!           → Synthesizing → Playing → Done
//! ```
//!
//! `Error` is reachable from every non-terminal state.

use std::fmt;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

/// Generate a fresh request identifier
#[must_use]
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Logical state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Listening,
    Triggered,
    CaptureRequested,
    WaitingImage,
    VisionRunning,
    Synthesizing,
    Playing,
    Done,
    Error,
}

impl RequestState {
    /// Position in the forward pipeline; terminal `Error` has none
    const fn stage(self) -> Option<u8> {
        match self {
            Self::Listening => Some(0),
            Self::Triggered => Some(1),
            Self::CaptureRequested => Some(2),
            Self::WaitingImage => Some(3),
            Self::VisionRunning => Some(4),
            Self::Synthesizing => Some(5),
            Self::Playing => Some(6),
            Self::Done => Some(7),
            Self::Error => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step
    ///
    /// Forward moves may skip stages (a retried capture goes back to
    /// `CaptureRequested` from `WaitingImage`, which is also allowed).
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Error {
            return true;
        }
        if self == Self::WaitingImage && next == Self::CaptureRequested {
            return true;
        }
        match (self.stage(), next.stage()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listening => "LISTENING",
            Self::Triggered => "TRIGGERED",
            Self::CaptureRequested => "CAPTURE_REQUESTED",
            Self::WaitingImage => "WAITING_IMAGE",
            Self::VisionRunning => "VISION_RUNNING",
            Self::Synthesizing => "SYNTHESIZING",
            Self::Playing => "PLAYING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Tracking record for one in-flight request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub device_id: String,
    pub question: String,
    pub state: RequestState,
    pub triggered_at: Instant,
}

impl RequestContext {
    #[must_use]
    pub fn new(request_id: &str, device_id: &str, question: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            device_id: device_id.to_string(),
            question: question.to_string(),
            state: RequestState::Triggered,
            triggered_at: Instant::now(),
        }
    }

    /// Advance the state, refusing illegal transitions
    ///
    /// Returns whether the transition was applied.
    pub fn advance(&mut self, next: RequestState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                request_id = %self.request_id,
                from = %self.state,
                to = %next,
                "illegal request state transition ignored"
            );
            return false;
        }
        tracing::debug!(
            request_id = %self.request_id,
            from = %self.state,
            to = %next,
            "request state changed"
        );
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(new_request_id(), new_request_id());
    }

    #[test]
    fn forward_pipeline_is_legal() {
        let path = [
            RequestState::Listening,
            RequestState::Triggered,
            RequestState::CaptureRequested,
            RequestState::WaitingImage,
            RequestState::VisionRunning,
            RequestState::Synthesizing,
            RequestState::Playing,
            RequestState::Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn error_reachable_from_non_terminal_only() {
        assert!(RequestState::VisionRunning.can_transition_to(RequestState::Error));
        assert!(RequestState::Triggered.can_transition_to(RequestState::Error));
        assert!(!RequestState::Done.can_transition_to(RequestState::Error));
        assert!(!RequestState::Error.can_transition_to(RequestState::Listening));
    }

    #[test]
    fn backwards_moves_are_rejected_except_capture_retry() {
        assert!(!RequestState::Playing.can_transition_to(RequestState::VisionRunning));
        assert!(RequestState::WaitingImage.can_transition_to(RequestState::CaptureRequested));
    }

    #[tokio::test]
    async fn context_advance_refuses_illegal_steps() {
        let mut ctx = RequestContext::new("req-1", "esp32-1", "what is this");
        assert!(ctx.advance(RequestState::CaptureRequested));
        assert!(ctx.advance(RequestState::Done));
        assert!(!ctx.advance(RequestState::Playing));
        assert_eq!(ctx.state, RequestState::Done);
    }
}
