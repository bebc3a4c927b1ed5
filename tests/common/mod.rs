//! Shared test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use iris_gateway::events::Subscription;
use iris_gateway::simulator::ReceivedAudio;
use iris_gateway::speech::MockSpeech;
use iris_gateway::vision::MockVision;
use iris_gateway::{Collaborators, Config, DeviceSimulator, Event, EventKind, InMemoryTransport, Orchestrator};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEVICE: &str = "esp32-test";

/// Longest a test waits for any single event
const EVENT_WAIT: Duration = Duration::from_secs(120);

/// Default configuration with a known vision answer
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.vision.mock_answer = "a red apple".to_string();
    config
}

/// A running orchestrator with one simulated device attached
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub device: DeviceSimulator,
    /// Wildcard subscription opened before anything was published
    pub events: Subscription,
    cancel: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
    device_task: JoinHandle<Vec<ReceivedAudio>>,
}

impl Harness {
    pub fn start(
        config: &Config,
        vision: MockVision,
        device: impl FnOnce(DeviceSimulator) -> DeviceSimulator,
    ) -> Self {
        let transport = InMemoryTransport::new();
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            Collaborators {
                transport: Arc::new(transport.clone()),
                vision: Arc::new(vision),
                speech: Arc::new(MockSpeech::new(config.speech.sample_rate)),
            },
        ));
        let cancel = CancellationToken::new();

        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let mut device = device(DeviceSimulator::connect(DEVICE, &transport, device_tx));
        let device_task = device.spawn(cancel.child_token()).expect("device started twice");
        orchestrator.register_device(DEVICE);

        let events = orchestrator.bus().subscribe_all();
        let mut listeners = orchestrator.start(&cancel);
        listeners.push(orchestrator.serve_device_events(device_rx, cancel.child_token()));

        Self {
            orchestrator,
            device,
            events,
            cancel,
            listeners,
            device_task,
        }
    }

    /// Default config, a canned answer, and a cooperative device
    pub fn default_pipeline() -> Self {
        Self::start(&test_config(), MockVision::new("a red apple"), |device| device)
    }

    pub async fn next_event(&mut self) -> Arc<Event> {
        tokio::time::timeout(EVENT_WAIT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus subscription closed")
    }

    /// Collect events up to and including the first one of `kind`
    pub async fn collect_until(&mut self, kind: EventKind) -> Vec<Arc<Event>> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let done = event.kind() == kind;
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Skip ahead to the first event of `kind`
    pub async fn wait_for(&mut self, kind: EventKind) -> Arc<Event> {
        self.collect_until(kind)
            .await
            .pop()
            .expect("collect_until returns at least one event")
    }

    /// Stop every listener and return what the device played
    pub async fn shutdown(self) -> Vec<ReceivedAudio> {
        self.cancel.cancel();
        for listener in self.listeners {
            listener.await.expect("listener panicked");
        }
        self.device_task.await.expect("device task panicked")
    }
}

/// Kinds of `events`, in order
pub fn kinds(events: &[Arc<Event>]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind()).collect()
}

/// Index of the first event of `kind`
pub fn position(events: &[Arc<Event>], kind: EventKind) -> usize {
    events
        .iter()
        .position(|e| e.kind() == kind)
        .unwrap_or_else(|| panic!("no {kind} event in {:?}", kinds(events)))
}
