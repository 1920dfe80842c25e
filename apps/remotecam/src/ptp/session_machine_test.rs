//! Tests for the camera session state machine, driven through the in-memory transport.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

use super::camera::{CameraCommand, CommandReply};
use super::errors::{SessionError, TransportError};
use super::events::{CameraEvent, CameraListener};
use super::in_memory::{InMemoryTransport, VirtualCamera};
use super::session_machine::{CameraSession, SessionState};
use super::transport::{ProbeHint, TransportEvent};
use super::types::{Capability, SubState};

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<CameraEvent>>,
}

impl CameraListener for RecordingListener {
    fn on_event(&self, event: CameraEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingListener {
    fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(CameraEvent::name).collect()
    }

    fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }

    /// Waits until `name` was received `times` times.
    async fn wait_for(&self, name: &str, times: usize) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while self.count(name) < times {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {} x{}, got {:?}",
                name,
                times,
                self.names()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn start_session(transport: &Arc<InMemoryTransport>) -> (CameraSession<InMemoryTransport>, Arc<RecordingListener>) {
    let session = CameraSession::new(Arc::clone(transport), Handle::current());
    let listener = Arc::new(RecordingListener::default());
    session.set_listener(Some(Arc::clone(&listener) as Arc<dyn CameraListener>));
    (session, listener)
}

async fn started_camera(
    camera: VirtualCamera,
) -> (Arc<InMemoryTransport>, CameraSession<InMemoryTransport>, Arc<RecordingListener>) {
    let transport = Arc::new(InMemoryTransport::new());
    transport.attach(camera);
    let (session, listener) = start_session(&transport);
    session.initialize(ProbeHint::default());
    listener.wait_for("camera-started", 1).await;
    (transport, session, listener)
}

#[tokio::test]
async fn initialize_without_camera_reports_no_camera_found_once_per_call() {
    let transport = Arc::new(InMemoryTransport::new());
    let (session, listener) = start_session(&transport);

    session.initialize(ProbeHint::default());
    listener.wait_for("no-camera-found", 1).await;
    assert_eq!(session.state(), SessionState::Idle);

    session.initialize(ProbeHint::default());
    listener.wait_for("no-camera-found", 2).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.names(), vec!["no-camera-found", "no-camera-found"]);
    assert!(session.active_camera().is_none());
}

#[tokio::test]
async fn initialize_starts_attached_camera() {
    let (_transport, session, listener) = started_camera(VirtualCamera::eos(1)).await;

    assert_eq!(session.state(), SessionState::Started(SubState::default()));
    let camera = session.active_camera().unwrap();
    assert_eq!(camera.display_name(), "Canon EOS R6");
    assert!(camera.supports(Capability::RemoteStorageBrowse));
    assert_eq!(listener.names(), vec!["camera-started"]);
}

#[tokio::test]
async fn events_reach_listener_in_transport_order() {
    let (transport, session, listener) = started_camera(VirtualCamera::nikon(1)).await;

    transport.emit(TransportEvent::PropertyChanged { id: 0x5007, value: 56 });
    transport.emit(TransportEvent::PropertyStateChanged {
        id: 0x5007,
        enabled: false,
    });
    transport.emit(TransportEvent::FocusStarted);
    transport.emit(TransportEvent::FocusPointsChanged);
    transport.emit(TransportEvent::FocusEnded { has_focused: false });
    transport.emit(TransportEvent::PropertyDescChanged {
        id: 0x5007,
        values: vec![28, 40, 56],
    });
    listener.wait_for("property-desc-changed", 1).await;

    assert_eq!(
        listener.names(),
        vec![
            "camera-started",
            "property-changed",
            "property-state-changed",
            "focus-started",
            "focus-points-changed",
            "focus-ended",
            "property-desc-changed",
        ]
    );
    assert_eq!(session.active_camera().unwrap().property(0x5007), Some(56));
}

#[tokio::test]
async fn live_view_frames_only_delivered_in_foreground() {
    let (transport, session, listener) = started_camera(VirtualCamera::eos(1)).await;

    session.set_foreground(false);
    for _ in 0..3 {
        transport.emit_frame(960, 640);
    }
    transport.emit(TransportEvent::BulbStarted);
    listener.wait_for("bulb-started", 1).await;
    assert_eq!(listener.count("live-view-data"), 0);

    session.set_foreground(true);
    for _ in 0..2 {
        transport.emit_frame(960, 640);
    }
    transport.emit(TransportEvent::BulbStopped);
    listener.wait_for("bulb-stopped", 1).await;
    assert_eq!(listener.count("live-view-data"), 2);
}

/// Records events and blocks delivery of `BulbStarted` until released.
struct GatedListener {
    inner: RecordingListener,
    gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl CameraListener for GatedListener {
    fn on_event(&self, event: CameraEvent) {
        let gated = matches!(event, CameraEvent::BulbStarted);
        self.inner.on_event(event);
        if gated && let Some(gate) = self.gate.lock().unwrap().take() {
            let _ = gate.recv();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_live_view_frames_are_dropped_after_leaving_foreground() {
    let (transport, session, _) = started_camera(VirtualCamera::eos(1)).await;
    let (release, gate) = std::sync::mpsc::channel();
    let listener = Arc::new(GatedListener {
        inner: RecordingListener::default(),
        gate: Mutex::new(Some(gate)),
    });
    session.set_listener(Some(Arc::clone(&listener) as Arc<dyn CameraListener>));
    session.set_foreground(true);

    transport.emit(TransportEvent::BulbStarted);
    transport.emit_frame(960, 640);
    transport.emit_frame(960, 640);
    transport.emit(TransportEvent::BulbStopped);

    // Delivery is stuck on BulbStarted; wait until the frames sit in the queue
    listener.inner.wait_for("bulb-started", 1).await;
    let deadline = Instant::now() + Duration::from_secs(3);
    while session.active_camera().unwrap().sub_state().exposing {
        assert!(Instant::now() < deadline, "bulb stop never applied");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    session.set_foreground(false);
    release.send(()).unwrap();
    listener.inner.wait_for("bulb-stopped", 1).await;
    assert_eq!(listener.inner.names(), vec!["bulb-started", "bulb-stopped"]);
}

#[tokio::test]
async fn shutdown_twice_is_harmless() {
    let (transport, session, listener) = started_camera(VirtualCamera::eos(1)).await;
    let camera = session.active_camera().unwrap();

    session.shutdown();
    session.shutdown();
    listener.wait_for("camera-stopped", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(listener.names(), vec!["camera-started", "camera-stopped"]);
    assert!(!camera.is_valid());
    assert_eq!(transport.closed(), vec!["ptp-1".to_string()]);
}

#[tokio::test]
async fn shutdown_before_initialize_stops_quietly() {
    let transport = Arc::new(InMemoryTransport::new());
    let (session, listener) = start_session(&transport);

    session.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.state(), SessionState::Stopped);
    assert!(listener.names().is_empty());
}

#[tokio::test]
async fn later_initialize_wins_over_pending_probe() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.attach(VirtualCamera::eos(1));
    transport.delay_next_probe(Duration::from_millis(300));
    let (session, listener) = start_session(&transport);

    session.initialize(ProbeHint::default());
    session.initialize(ProbeHint::default());
    listener.wait_for("camera-started", 1).await;
    let winner = session.active_camera().unwrap();

    // Let the delayed probe finish and get discarded
    let deadline = Instant::now() + Duration::from_secs(3);
    while transport.closed().is_empty() {
        assert!(Instant::now() < deadline, "stale camera never closed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.probe_count(), 2);
    assert_eq!(listener.names(), vec!["camera-started"]);
    assert!(session.active_camera().unwrap().same_connection(&winner));
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn superseded_initialize_without_camera_still_reports_no_camera_found() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.delay_next_probe(Duration::from_millis(200));
    let (session, listener) = start_session(&transport);

    session.initialize(ProbeHint::default());
    session.initialize(ProbeHint::default());
    listener.wait_for("no-camera-found", 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.probe_count(), 2);
    assert_eq!(listener.names(), vec!["no-camera-found", "no-camera-found"]);
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn superseded_initialize_without_camera_stays_quiet_after_shutdown() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.delay_next_probe(Duration::from_millis(100));
    let (session, listener) = start_session(&transport);

    session.initialize(ProbeHint::default());
    session.shutdown();
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(transport.probe_count(), 1);
    assert!(listener.names().is_empty());
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn initialize_while_started_announces_same_camera() {
    let (transport, session, listener) = started_camera(VirtualCamera::eos(1)).await;
    let first = session.active_camera().unwrap();

    session.initialize(ProbeHint::default());
    listener.wait_for("camera-started", 2).await;

    assert_eq!(transport.probe_count(), 1);
    assert!(session.active_camera().unwrap().same_connection(&first));
}

#[tokio::test]
async fn detach_stops_camera() {
    let (transport, session, listener) = started_camera(VirtualCamera::generic(1)).await;
    let camera = session.active_camera().unwrap();

    transport.detach(1);
    listener.wait_for("camera-stopped", 1).await;

    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!camera.is_valid());
    assert!(session.active_camera().is_none());
}

#[tokio::test]
async fn transport_failure_reports_error_and_resets_sub_state() {
    let (transport, session, listener) = started_camera(VirtualCamera::eos(1)).await;
    let camera = session.active_camera().unwrap();

    transport.emit(TransportEvent::LiveViewStarted);
    listener.wait_for("live-view-started", 1).await;
    assert!(camera.sub_state().live_view);

    transport.emit(TransportEvent::Failed {
        message: "GeneralError".to_string(),
    });
    transport.emit(TransportEvent::LiveViewStopped);
    listener.wait_for("error", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = listener.events.lock().unwrap().clone();
    assert!(matches!(events.last(), Some(CameraEvent::Error(message)) if message == "GeneralError"));
    assert_eq!(listener.count("camera-stopped"), 0);
    assert_eq!(listener.count("live-view-stopped"), 0);
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(camera.sub_state(), SubState::default());
    assert!(!camera.is_valid());
}

#[tokio::test]
async fn probe_failure_reports_error() {
    let transport = Arc::new(InMemoryTransport::new());
    let failure = TransportError::ExclusiveAccess {
        device_id: "ptp-1".to_string(),
        blocking_process: Some("ptpcamerad".to_string()),
    };
    transport.fail_next_probe(failure.clone());
    let (session, listener) = start_session(&transport);

    session.initialize(ProbeHint::default());
    listener.wait_for("error", 1).await;

    let events = listener.events.lock().unwrap().clone();
    assert!(matches!(&events[0], CameraEvent::Error(message) if *message == failure.to_string()));
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn cleared_listener_receives_nothing() {
    let (transport, session, first) = started_camera(VirtualCamera::nikon(1)).await;

    session.set_listener(None);
    transport.emit(TransportEvent::PropertyChanged { id: 0x500f, value: 400 });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = Arc::new(RecordingListener::default());
    session.set_listener(Some(Arc::clone(&second) as Arc<dyn CameraListener>));
    transport.emit(TransportEvent::PropertyChanged { id: 0x500f, value: 800 });
    second.wait_for("property-changed", 1).await;

    assert_eq!(first.names(), vec!["camera-started"]);
    let events = second.events.lock().unwrap().clone();
    assert!(matches!(events[..], [CameraEvent::PropertyChanged { value: 800, .. }]));
}

#[tokio::test]
async fn command_without_capability_is_rejected() {
    let (transport, session, _listener) = started_camera(VirtualCamera::generic(1)).await;

    let result = session.command(CameraCommand::StartLiveView).await;

    assert_eq!(
        result,
        Err(SessionError::MissingCapability {
            capability: Capability::LiveView
        })
    );
    assert!(transport.commands().is_empty());
}

#[tokio::test]
async fn command_without_camera_is_rejected() {
    let transport = Arc::new(InMemoryTransport::new());
    let (session, _listener) = start_session(&transport);

    assert_eq!(session.command(CameraCommand::Capture).await, Err(SessionError::NoActiveCamera));
}

#[tokio::test]
async fn capture_clears_capturing_when_picture_arrives() {
    let (_transport, session, listener) = started_camera(VirtualCamera::eos(1)).await;

    let reply = session.command(CameraCommand::Capture).await;
    assert_eq!(reply, Ok(CommandReply::Accepted));
    listener.wait_for("object-added", 1).await;

    assert_eq!(session.state(), SessionState::Started(SubState::default()));
    assert_eq!(listener.names(), vec!["camera-started", "captured-picture", "object-added"]);
}

#[tokio::test]
async fn set_property_replies_with_value() {
    let (_transport, session, listener) = started_camera(VirtualCamera::generic(1)).await;

    let reply = session.command(CameraCommand::SetProperty { id: 0x5005, value: 2 }).await;
    assert_eq!(reply, Ok(CommandReply::Value(2)));
    listener.wait_for("property-changed", 1).await;
    assert_eq!(session.active_camera().unwrap().property(0x5005), Some(2));
}

#[tokio::test]
async fn lost_connection_during_command_stops_session() {
    let (transport, session, listener) = started_camera(VirtualCamera::eos(1)).await;
    transport.fail_next_command(TransportError::Disconnected {
        device_id: "ptp-1".to_string(),
    });

    let result = session.command(CameraCommand::Focus).await;
    assert!(matches!(result, Err(SessionError::Transport { .. })));
    listener.wait_for("error", 1).await;

    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn busy_camera_keeps_session_running() {
    let (transport, session, _listener) = started_camera(VirtualCamera::eos(1)).await;
    transport.fail_next_command(TransportError::DeviceBusy {
        device_id: "ptp-1".to_string(),
    });

    assert!(session.command(CameraCommand::Capture).await.is_err());

    assert_eq!(session.state(), SessionState::Started(SubState::default()));
}
