//! Camera session state machine.
//!
//! Owns the lifecycle of one camera connection: probing, started (with live
//! view, capture, focus and bulb sub-states) and stopped. Transport
//! notifications arrive on a per-camera channel and are applied under a single
//! state lock, which is the only place state changes.
//!
//! ## Event delivery
//!
//! Outward events are queued while the state lock is held, so queue order is
//! transition order. One dispatcher task drains the queue and calls the
//! installed listener. Each queued event carries the listener epoch it was
//! queued for; replacing or clearing the listener bumps the epoch, and the
//! dispatcher discards everything queued for an older one.
//!
//! ## Probing
//!
//! Every `initialize` call bumps the probe generation. A probe whose
//! generation is no longer current is stale: a camera it opened is closed
//! again, and its failure is not reported. A stale probe that found no camera
//! still reports `NoCameraFound` while the session is idle or probing, so
//! every call is answered.

use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use super::camera::{CameraCommand, CameraHandle, CommandReply};
use super::errors::{SessionError, TransportError};
use super::events::{CameraEvent, CameraListener};
use super::transport::{OpenedCamera, ProbeHint, ProbeOutcome, Transport, TransportEvent};
use super::types::SubState;
use crate::ignore_poison::IgnorePoison;

/// Observable state of a camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Probing,
    Started(SubState),
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Probing,
    Started,
    Stopped,
}

struct MachineState {
    phase: Phase,
    /// Set only while `phase == Started`.
    camera: Option<CameraHandle>,
    probe_generation: u64,
    /// Task draining the active camera's transport events.
    pump: Option<JoinHandle<()>>,
}

struct ListenerSlot {
    epoch: u64,
    listener: Option<Arc<dyn CameraListener>>,
}

struct QueuedEvent {
    epoch: u64,
    event: CameraEvent,
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    runtime: Handle,
    state: Mutex<MachineState>,
    listener: Arc<Mutex<ListenerSlot>>,
    outbox: mpsc::UnboundedSender<QueuedEvent>,
    foreground: Arc<AtomicBool>,
}

/// A camera session bound to one transport.
pub struct CameraSession<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> CameraSession<T> {
    /// Creates an idle session. Background tasks run on `runtime`.
    pub fn new(transport: Arc<T>, runtime: Handle) -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let listener = Arc::new(Mutex::new(ListenerSlot {
            epoch: 0,
            listener: None,
        }));
        let foreground = Arc::new(AtomicBool::new(false));
        runtime.spawn(dispatch_events(inbox, Arc::clone(&listener), Arc::clone(&foreground)));

        Self {
            shared: Arc::new(Shared {
                transport,
                runtime,
                state: Mutex::new(MachineState {
                    phase: Phase::Idle,
                    camera: None,
                    probe_generation: 0,
                    pump: None,
                }),
                listener,
                outbox,
                foreground,
            }),
        }
    }

    /// Starts probing for a camera.
    ///
    /// Calling this while a probe is in flight restarts probing: only the
    /// latest probe's outcome is reported. Calling it while a camera is
    /// started announces that camera again instead of probing.
    pub fn initialize(&self, hint: ProbeHint) {
        let generation = {
            let mut state = self.shared.state.lock_ignore_poison();
            if state.phase == Phase::Started
                && let Some(camera) = state.camera.as_ref()
            {
                info!("initialize: {} already started, announcing it again", camera.id());
                self.shared.emit(CameraEvent::CameraStarted(camera.clone()));
                return;
            }
            state.probe_generation += 1;
            if state.phase == Phase::Probing {
                debug!("initialize: superseding probe #{}", state.probe_generation - 1);
            }
            state.phase = Phase::Probing;
            state.probe_generation
        };

        info!("initialize: starting probe #{} (hint={:?})", generation, hint);
        let shared = Arc::clone(&self.shared);
        self.shared.runtime.spawn(async move {
            let transport = Arc::clone(&shared.transport);
            let outcome = tokio::task::spawn_blocking(move || transport.probe_and_open(&hint)).await;
            shared.finish_probe(generation, outcome);
        });
    }

    /// Installs or clears the single event listener.
    ///
    /// Events queued for the previous listener and not yet delivered are discarded.
    pub fn set_listener(&self, listener: Option<Arc<dyn CameraListener>>) {
        let mut slot = self.shared.listener.lock_ignore_poison();
        slot.epoch += 1;
        debug!(
            "set_listener: {} (epoch {})",
            if listener.is_some() { "installed" } else { "cleared" },
            slot.epoch
        );
        slot.listener = listener;
    }

    /// Live view frames are dropped while the owning session isn't in the foreground.
    pub fn set_foreground(&self, foreground: bool) {
        self.shared.foreground.store(foreground, Ordering::Release);
    }

    pub fn is_foreground(&self) -> bool {
        self.shared.foreground.load(Ordering::Acquire)
    }

    /// Stops the camera and closes its connection. Does nothing if already stopped.
    ///
    /// Blocks while the transport closes the connection.
    pub fn shutdown(&self) {
        let camera = {
            let mut state = self.shared.state.lock_ignore_poison();
            // In-flight probes become stale
            state.probe_generation += 1;
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
            let previous = state.phase;
            state.phase = Phase::Stopped;

            let camera = state.camera.take();
            match &camera {
                Some(camera) => {
                    info!("shutdown: stopping {}", camera.id());
                    camera.invalidate();
                    self.shared.emit(CameraEvent::CameraStopped(camera.clone()));
                }
                None => debug!("shutdown: no camera to stop (phase was {:?})", previous),
            }
            camera
        };

        if let Some(camera) = camera {
            self.shared.transport.close(&camera);
        }
    }

    pub fn state(&self) -> SessionState {
        let state = self.shared.state.lock_ignore_poison();
        match (state.phase, &state.camera) {
            (Phase::Idle, _) => SessionState::Idle,
            (Phase::Probing, _) => SessionState::Probing,
            (Phase::Started, Some(camera)) => SessionState::Started(camera.sub_state()),
            (Phase::Started, None) | (Phase::Stopped, _) => SessionState::Stopped,
        }
    }

    pub fn active_camera(&self) -> Option<CameraHandle> {
        self.shared.state.lock_ignore_poison().camera.clone()
    }

    /// Sends a command to the active camera.
    ///
    /// A command whose capability the camera lacks is rejected without
    /// touching the transport. A transport error that loses the connection
    /// stops the session with an `Error` event.
    pub async fn command(&self, command: CameraCommand) -> Result<CommandReply, SessionError> {
        let camera = self.active_camera().ok_or(SessionError::NoActiveCamera)?;
        if let Some(capability) = command.required_capability()
            && !camera.supports(capability)
        {
            error!(
                "command: {:?} issued to {} which lacks {:?}",
                command,
                camera.id(),
                capability
            );
            return Err(SessionError::MissingCapability { capability });
        }

        let is_capture = command == CameraCommand::Capture;
        if is_capture {
            camera.update_sub_state(|s| s.capturing = true);
        }

        debug!("command: {:?} -> {}", command, camera.id());
        let transport = Arc::clone(&self.shared.transport);
        let target = camera.clone();
        let result = tokio::task::spawn_blocking(move || transport.issue_command(&target, &command)).await?;

        result.map_err(|e| {
            if is_capture {
                camera.update_sub_state(|s| s.capturing = false);
            }
            if e.is_connection_lost() {
                let mut state = self.shared.state.lock_ignore_poison();
                if state.camera.as_ref().is_some_and(|c| c.same_connection(&camera)) {
                    self.shared.stop_camera(&mut state, Some(e.to_string()));
                }
            } else {
                warn!("command failed on {}: {}", camera.id(), e);
            }
            SessionError::from(e)
        })
    }
}

impl<T: Transport> Drop for CameraSession<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock_ignore_poison();
        state.probe_generation += 1;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
    }
}

impl<T: Transport> Shared<T> {
    /// Queues an event for the current listener. Call with the state lock held.
    fn emit(&self, event: CameraEvent) {
        let epoch = {
            let slot = self.listener.lock_ignore_poison();
            if slot.listener.is_none() {
                debug!("No listener, dropping {}", event.name());
                return;
            }
            slot.epoch
        };
        if self.outbox.send(QueuedEvent { epoch, event }).is_err() {
            warn!("Event dispatcher is gone, event dropped");
        }
    }

    fn finish_probe(
        self: &Arc<Self>,
        generation: u64,
        outcome: Result<Result<ProbeOutcome, TransportError>, JoinError>,
    ) {
        let mut state = self.state.lock_ignore_poison();
        let is_current = state.probe_generation == generation;

        match outcome {
            Ok(Ok(ProbeOutcome::Opened(opened))) => {
                if !is_current {
                    debug!(
                        "probe #{} superseded, closing {} again",
                        generation,
                        opened.camera.id()
                    );
                    opened.camera.invalidate();
                    self.close_in_background(opened.camera);
                    return;
                }
                self.start_camera(&mut state, opened);
            }
            Ok(Ok(ProbeOutcome::NoDevice)) => {
                if !is_current {
                    // Each initialize call gets its answer, unless a camera started or the session shut down since
                    if matches!(state.phase, Phase::Probing | Phase::Idle) {
                        debug!("superseded probe #{} found no camera", generation);
                        self.emit(CameraEvent::NoCameraFound);
                    }
                    return;
                }
                info!("probe #{}: no camera found", generation);
                state.phase = Phase::Idle;
                self.emit(CameraEvent::NoCameraFound);
            }
            Ok(Err(e)) => self.fail_probe(&mut state, generation, is_current, e.to_string()),
            Err(e) => self.fail_probe(&mut state, generation, is_current, format!("Probe worker failed: {}", e)),
        }
    }

    fn fail_probe(&self, state: &mut MachineState, generation: u64, is_current: bool, message: String) {
        if !is_current {
            debug!("superseded probe #{} failed: {}", generation, message);
            return;
        }
        warn!("probe #{} failed: {}", generation, message);
        state.phase = Phase::Stopped;
        self.emit(CameraEvent::Error(message));
    }

    fn start_camera(self: &Arc<Self>, state: &mut MachineState, opened: OpenedCamera) {
        let OpenedCamera { camera, events } = opened;
        info!(
            "Camera started: {} ({:?}, capabilities {:?})",
            camera.display_name(),
            camera.variant(),
            camera.capabilities()
        );

        if let Some(stale) = state.pump.take() {
            stale.abort();
        }
        state.phase = Phase::Started;
        state.camera = Some(camera.clone());
        state.pump = Some(self.spawn_pump(camera.clone(), events));
        self.emit(CameraEvent::CameraStarted(camera));
    }

    fn spawn_pump(
        self: &Arc<Self>,
        camera: CameraHandle,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            debug!("Event pump started for {}", camera.id());
            while let Some(event) = events.recv().await {
                if !shared.apply(&camera, event) {
                    debug!("Event pump stopped for {}", camera.id());
                    return;
                }
            }
            // The transport dropped its sender: the connection is gone
            shared.apply(&camera, TransportEvent::Detached);
            debug!("Event pump exited for {}", camera.id());
        })
    }

    /// Applies one transport event. Returns false once the camera is no longer active.
    fn apply(&self, camera: &CameraHandle, event: TransportEvent) -> bool {
        let mut state = self.state.lock_ignore_poison();
        if !state.camera.as_ref().is_some_and(|c| c.same_connection(camera)) {
            debug!("Ignoring event from inactive connection {}", camera.id());
            return false;
        }

        let outward = match event {
            TransportEvent::PropertyChanged { id, value } => {
                camera.record_property(id, value);
                CameraEvent::PropertyChanged { id, value }
            }
            TransportEvent::PropertyStateChanged { id, enabled } => CameraEvent::PropertyStateChanged { id, enabled },
            TransportEvent::PropertyDescChanged { id, values } => CameraEvent::PropertyDescChanged { id, values },
            TransportEvent::LiveViewStarted => {
                camera.update_sub_state(|s| s.live_view = true);
                CameraEvent::LiveViewStarted
            }
            TransportEvent::LiveViewStopped => {
                camera.update_sub_state(|s| s.live_view = false);
                CameraEvent::LiveViewStopped
            }
            TransportEvent::LiveViewData(frame) => CameraEvent::LiveViewData(frame),
            TransportEvent::CapturedPicture(picture) => {
                camera.update_sub_state(|s| s.capturing = false);
                CameraEvent::CapturedPicture(picture)
            }
            TransportEvent::BulbStarted => {
                camera.update_sub_state(|s| s.exposing = true);
                CameraEvent::BulbStarted
            }
            TransportEvent::BulbExposureTime { seconds } => CameraEvent::BulbExposureTime { seconds },
            TransportEvent::BulbStopped => {
                camera.update_sub_state(|s| s.exposing = false);
                CameraEvent::BulbStopped
            }
            TransportEvent::FocusStarted => {
                camera.update_sub_state(|s| s.focusing = true);
                CameraEvent::FocusStarted
            }
            TransportEvent::FocusEnded { has_focused } => {
                camera.update_sub_state(|s| s.focusing = false);
                CameraEvent::FocusEnded { has_focused }
            }
            TransportEvent::FocusPointsChanged => CameraEvent::FocusPointsChanged,
            TransportEvent::ObjectAdded { handle, format } => CameraEvent::ObjectAdded { handle, format },
            TransportEvent::Detached => {
                self.stop_camera(&mut state, None);
                return false;
            }
            TransportEvent::Failed { message } => {
                self.stop_camera(&mut state, Some(message));
                return false;
            }
        };

        self.emit(outward);
        true
    }

    /// Stops the active camera. With `error`, the stop is reported as an `Error`
    /// event instead of `CameraStopped`.
    fn stop_camera(&self, state: &mut MachineState, error: Option<String>) {
        let Some(camera) = state.camera.take() else {
            return;
        };
        state.phase = Phase::Stopped;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        camera.invalidate();

        match error {
            Some(message) => {
                error!("Camera {} failed: {}", camera.id(), message);
                self.emit(CameraEvent::Error(message));
            }
            None => {
                info!("Camera {} detached", camera.id());
                self.emit(CameraEvent::CameraStopped(camera.clone()));
            }
        }
        self.close_in_background(camera);
    }

    fn close_in_background(&self, camera: CameraHandle) {
        let transport = Arc::clone(&self.transport);
        self.runtime.spawn_blocking(move || transport.close(&camera));
    }
}

/// Delivers queued events to the listener they were queued for, one at a time.
///
/// Live view frames are dropped here rather than when queued, so frames
/// queued before the session left the foreground are dropped too.
async fn dispatch_events(
    mut inbox: mpsc::UnboundedReceiver<QueuedEvent>,
    slot: Arc<Mutex<ListenerSlot>>,
    foreground: Arc<AtomicBool>,
) {
    while let Some(queued) = inbox.recv().await {
        if matches!(queued.event, CameraEvent::LiveViewData(_)) && !foreground.load(Ordering::Acquire) {
            trace!("Dropping live view frame, session not in foreground");
            continue;
        }
        let listener = {
            let slot = slot.lock_ignore_poison();
            if slot.epoch == queued.epoch {
                slot.listener.clone()
            } else {
                None
            }
        };
        match listener {
            Some(listener) => listener.on_event(queued.event),
            None => debug!("Discarding {} queued for a replaced listener", queued.event.name()),
        }
    }
    debug!("Camera event dispatcher exited");
}
