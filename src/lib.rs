//! Iris Gateway - voice and vision orchestration for edge devices
//!
//! This library provides the backend core that turns a spoken question on a
//! camera-equipped device into a spoken answer:
//! - Event bus connecting every component
//! - Trigger phrase detection with cooldown
//! - Capture request/response with timeout and retry
//! - Per-device request locking and low-memory admission control
//! - Chunked audio playback with per-device mutual exclusion
//! - A closed error taxonomy with user-safe messages and retry budgets
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Edge device                        │
//! │   Microphone  │  Camera  │  Speaker  │  Telemetry    │
//! └────────────────────┬────────────────────────────────┘
//!                      │ DeviceTransport / DeviceEvent
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Orchestrator                        │
//! │  Trigger │ Capture │ Resources │ Playback │ Errors   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ EventBus
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Collaborators                        │
//! │        Vision analyzer  │  Speech synthesizer         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod playback;
pub mod recovery;
pub mod request;
pub mod resources;
pub mod simulator;
pub mod speech;
pub mod transport;
pub mod trigger;
pub mod vision;

pub use capture::CaptureCoordinator;
pub use config::Config;
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind, EventPayload};
pub use orchestrator::{Collaborators, Orchestrator};
pub use playback::PlaybackCoordinator;
pub use recovery::{ErrorHandler, ErrorKind};
pub use resources::{MemoryMonitor, ResourceManager};
pub use simulator::DeviceSimulator;
pub use speech::{SpeechService, SpeechSynthesizer};
pub use transport::{DeviceEvent, DeviceMessage, DeviceTransport, InMemoryTransport};
pub use trigger::TriggerDetector;
pub use vision::VisionAnalyzer;
