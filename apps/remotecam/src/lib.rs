// Warn on unused dependencies to catch platform-specific cfg mismatches
#![warn(unused_crate_dependencies)]
// Warn on redundant path prefixes (e.g., std::sync::Arc when Arc is imported)
#![warn(unused_qualifications)]
// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

//noinspection RsUnusedImport
// Only used by tests
#[cfg(test)]
use tempfile as _;

pub mod config;
mod ignore_poison;
pub mod ptp;
pub mod session;

use log::{error, info, warn};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use config::SessionConfig;
use ptp::{CameraHandle, Capability, Transport};
use session::{LoggingObserver, ServiceHost, SessionController};

/// Runs the camera host until Ctrl+C.
pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config = SessionConfig::load();
    info!("Starting remotecam ({:?})", config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start the async runtime: {}", e);
            return;
        }
    };
    runtime.block_on(serve(config));
}

#[cfg(feature = "virtual-camera")]
async fn serve(config: SessionConfig) {
    use ptp::in_memory::{InMemoryTransport, VirtualCamera};

    warn!("Using the virtual camera transport");
    let transport = InMemoryTransport::new();
    transport.attach(VirtualCamera::eos(1));
    drive(Arc::new(transport), config, false).await;
}

#[cfg(all(not(feature = "virtual-camera"), any(target_os = "macos", target_os = "linux")))]
async fn serve(config: SessionConfig) {
    let transport = ptp::usb::UsbTransport::new(Handle::current(), &config);
    drive(Arc::new(transport), config, true).await;
}

#[cfg(all(not(feature = "virtual-camera"), not(any(target_os = "macos", target_os = "linux"))))]
async fn serve(_config: SessionConfig) {
    error!("USB camera access isn't available on this platform");
}

/// Runs one foreground session against `transport`, watching USB hotplug if `watch_usb`.
async fn drive<T: Transport>(transport: Arc<T>, config: SessionConfig, watch_usb: bool) {
    let host = Arc::new(ServiceHost::new(transport, Handle::current()));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let observer = Arc::new(LoggingObserver::forwarding_started(started_tx));
    let controller = Arc::new(SessionController::new(Arc::clone(&host), observer, config));

    let hotplug = watch_usb.then(|| spawn_hotplug(&controller)).flatten();

    controller.on_foreground_enter();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Shutting down");
                break;
            }
            Some(camera) = started_rx.recv() => log_remote_files(&controller, &camera).await,
        }
    }

    if let Some(hotplug) = hotplug {
        hotplug.abort();
    }
    controller.on_foreground_exit();
    controller.on_background(true);
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn spawn_hotplug<T: Transport>(controller: &Arc<SessionController<T>>) -> Option<tokio::task::JoinHandle<()>> {
    let controller = Arc::clone(controller);
    Some(ptp::hotplug::spawn_hotplug_watcher(&Handle::current(), move |hint| {
        controller.on_new_intent(hint)
    }))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn spawn_hotplug<T: Transport>(_controller: &Arc<SessionController<T>>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

/// Logs the picture folder of cameras that support storage browsing.
async fn log_remote_files<T: Transport>(controller: &SessionController<T>, camera: &CameraHandle) {
    if !camera.supports(Capability::RemoteStorageBrowse) {
        return;
    }
    match controller.list_remote_filenames().await {
        Ok(names) => {
            info!("{} file(s) on {}", names.len(), camera.display_name());
            for name in names {
                info!("  {}", name);
            }
        }
        Err(e) => warn!("Couldn't list files on {}: {} ({})", camera.display_name(), e.user_message(), e),
    }
}
