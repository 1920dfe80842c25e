//! Session controller: binds the host's lifecycle to the running camera session.
//!
//! The host reports its lifecycle transitions (foreground enter and exit,
//! background, reload, new launch hint); the controller turns them into
//! listener, foreground and probe calls on the session, and translates
//! session events into `SessionObserver` callbacks.

use log::{debug, error, info};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::observer::SessionObserver;
use super::service::ServiceHost;
use crate::config::SessionConfig;
use crate::ignore_poison::IgnorePoison;
use crate::ptp::{
    CameraCommand, CameraEvent, CameraHandle, CameraListener, Capability, CommandReply, ProbeHint, SessionError,
    StorageEntry, Transport, list_objects, list_storages,
};

/// Forwards session events to the observer, one callback per event.
struct ControllerListener {
    observer: Arc<dyn SessionObserver>,
}

impl CameraListener for ControllerListener {
    fn on_event(&self, event: CameraEvent) {
        let observer = self.observer.as_ref();
        match event {
            CameraEvent::CameraStarted(camera) => observer.camera_started(&camera),
            CameraEvent::CameraStopped(camera) => observer.camera_stopped(&camera),
            CameraEvent::NoCameraFound => observer.no_camera_found(),
            CameraEvent::Error(message) => observer.error(&message),
            CameraEvent::PropertyChanged { id, value } => observer.property_changed(id, value),
            CameraEvent::PropertyStateChanged { id, enabled } => observer.property_state_changed(id, enabled),
            CameraEvent::PropertyDescChanged { id, values } => observer.property_desc_changed(id, &values),
            CameraEvent::LiveViewStarted => observer.live_view_started(),
            CameraEvent::LiveViewStopped => observer.live_view_stopped(),
            CameraEvent::LiveViewData(frame) => observer.live_view_data(&frame),
            CameraEvent::CapturedPicture(picture) => {
                if picture.thumbnail.is_some() {
                    observer.captured_picture(&picture);
                } else {
                    debug!("Captured {} without thumbnail", picture.filename);
                    observer.no_thumbnail_available(picture.handle, &picture.filename);
                }
            }
            CameraEvent::BulbStarted => observer.bulb_started(),
            CameraEvent::BulbExposureTime { seconds } => observer.bulb_exposure_time(seconds),
            CameraEvent::BulbStopped => observer.bulb_stopped(),
            CameraEvent::FocusStarted => observer.focus_started(),
            CameraEvent::FocusEnded { has_focused } => observer.focus_ended(has_focused),
            CameraEvent::FocusPointsChanged => observer.focus_points_changed(),
            CameraEvent::ObjectAdded { handle, format } => observer.object_added(handle, &format),
        }
    }
}

/// Drives the running camera session from host lifecycle transitions.
pub struct SessionController<T: Transport> {
    host: Arc<ServiceHost<T>>,
    observer: Arc<dyn SessionObserver>,
    config: SessionConfig,
    /// Probe hint from the latest launch or attach.
    hint: Mutex<ProbeHint>,
    /// Between foreground enter and background.
    started: AtomicBool,
    /// Between foreground enter and exit.
    foreground: AtomicBool,
}

impl<T: Transport> SessionController<T> {
    pub fn new(host: Arc<ServiceHost<T>>, observer: Arc<dyn SessionObserver>, config: SessionConfig) -> Self {
        let hint = config.initial_hint();
        Self {
            host,
            observer,
            config,
            hint: Mutex::new(hint),
            started: AtomicBool::new(false),
            foreground: AtomicBool::new(false),
        }
    }

    /// The host became interactive: install the listener and probe for a camera.
    pub fn on_foreground_enter(&self) {
        info!("Host entered foreground");
        self.foreground.store(true, Ordering::Release);
        self.attach_and_initialize();
    }

    /// The host is no longer interactive. Live view frames are dropped from now on.
    pub fn on_foreground_exit(&self) {
        info!("Host left foreground");
        self.foreground.store(false, Ordering::Release);
        if let Some(session) = self.host.current() {
            session.set_foreground(false);
        }
    }

    /// The host went to the background. With `finishing`, the session is torn down.
    pub fn on_background(&self, finishing: bool) {
        info!("Host went to background (finishing: {})", finishing);
        self.started.store(false, Ordering::Release);
        if let Some(session) = self.host.current() {
            session.set_listener(None);
        }
        if finishing {
            self.host.stop();
        }
    }

    /// Probes again, even if a camera is started or a probe is pending.
    ///
    /// Marks the host started and installs a fresh listener first, so a reload
    /// from the background is reported too.
    pub fn on_reload(&self) {
        info!("Reload requested");
        self.attach_and_initialize();
    }

    fn attach_and_initialize(&self) {
        self.started.store(true, Ordering::Release);

        let session = self.host.get_or_start();
        session.set_foreground(self.foreground.load(Ordering::Acquire));
        session.set_listener(Some(Arc::new(ControllerListener {
            observer: Arc::clone(&self.observer),
        })));
        session.initialize(self.current_hint());
    }

    /// The host was handed a new launch hint, for example on USB attach.
    ///
    /// The hint is remembered; probing restarts only while the host is started.
    pub fn on_new_intent(&self, hint: ProbeHint) {
        debug!("New launch hint: {:?}", hint);
        *self.hint.lock_ignore_poison() = hint.clone();
        if self.is_started() {
            self.host.get_or_start().initialize(hint);
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::Acquire)
    }

    pub fn active_camera(&self) -> Option<CameraHandle> {
        self.host.current().and_then(|session| session.active_camera())
    }

    /// Display name of the active camera.
    pub fn device_name(&self) -> Option<String> {
        self.active_camera().map(|camera| camera.display_name())
    }

    pub async fn command(&self, command: CameraCommand) -> Result<CommandReply, SessionError> {
        let session = self.host.current().ok_or(SessionError::NoActiveCamera)?;
        session.command(command).await
    }

    /// Lists the active camera's storage containers on a blocking worker.
    pub async fn list_remote_storages(&self) -> Result<BTreeMap<u32, StorageEntry>, SessionError> {
        let camera = self.browsable_camera()?;
        let storages = tokio::task::spawn_blocking(move || list_storages(camera.storage_browser().as_deref())).await??;
        Ok(storages)
    }

    /// Lists file names in the configured picture folder, flat, on a blocking worker.
    pub async fn list_remote_filenames(&self) -> Result<Vec<String>, SessionError> {
        let camera = self.browsable_camera()?;
        let (storage_id, parent) = (self.config.browse_storage_id, self.config.browse_parent_handle);
        debug!(
            "Listing remote files on {} (storage={:#010x}, parent={:#010x})",
            camera.id(),
            storage_id,
            parent
        );

        let objects = tokio::task::spawn_blocking(move || {
            list_objects(camera.storage_browser().as_deref(), storage_id, parent)
        })
        .await??;
        Ok(objects.into_iter().map(|object| object.name).collect())
    }

    /// The active camera, if it supports storage browsing.
    fn browsable_camera(&self) -> Result<CameraHandle, SessionError> {
        let camera = self.active_camera().ok_or(SessionError::NoActiveCamera)?;
        if !camera.supports(Capability::RemoteStorageBrowse) {
            error!("Storage browsing requested on {} which doesn't support it", camera.id());
            return Err(SessionError::MissingCapability {
                capability: Capability::RemoteStorageBrowse,
            });
        }
        Ok(camera)
    }

    fn current_hint(&self) -> ProbeHint {
        self.hint.lock_ignore_poison().clone()
    }
}
