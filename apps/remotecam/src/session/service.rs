//! The process-wide running session, owned explicitly by the host.

use log::{debug, info};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;

use crate::ignore_poison::IgnorePoison;
use crate::ptp::{CameraSession, Transport};

/// Owns at most one running camera session.
///
/// The session is created on first use and lives until `stop`. Hosts create
/// one `ServiceHost` per process and hand it to their controller.
pub struct ServiceHost<T: Transport> {
    transport: Arc<T>,
    runtime: Handle,
    running: Mutex<Option<Arc<CameraSession<T>>>>,
}

impl<T: Transport> ServiceHost<T> {
    pub fn new(transport: Arc<T>, runtime: Handle) -> Self {
        Self {
            transport,
            runtime,
            running: Mutex::new(None),
        }
    }

    /// Returns the running session, starting one if none runs.
    pub fn get_or_start(&self) -> Arc<CameraSession<T>> {
        let mut running = self.running.lock_ignore_poison();
        if let Some(session) = running.as_ref() {
            return Arc::clone(session);
        }
        info!("Starting camera session service");
        let session = Arc::new(CameraSession::new(Arc::clone(&self.transport), self.runtime.clone()));
        *running = Some(Arc::clone(&session));
        session
    }

    pub fn current(&self) -> Option<Arc<CameraSession<T>>> {
        self.running.lock_ignore_poison().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock_ignore_poison().is_some()
    }

    /// Shuts the running session down and drops it. Returns false if none was running.
    pub fn stop(&self) -> bool {
        // Take it out first so shutdown doesn't run under our lock
        let session = self.running.lock_ignore_poison().take();
        match session {
            Some(session) => {
                info!("Stopping camera session service");
                session.shutdown();
                true
            }
            None => {
                debug!("stop: no session running");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::SessionState;
    use crate::ptp::in_memory::InMemoryTransport;

    #[tokio::test]
    async fn test_get_or_start_reuses_running_session() {
        let host = ServiceHost::new(Arc::new(InMemoryTransport::new()), Handle::current());
        assert!(!host.is_running());

        let first = host.get_or_start();
        let second = host.get_or_start();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(host.is_running());
    }

    #[tokio::test]
    async fn test_stop_shuts_down_and_allows_restart() {
        let host = ServiceHost::new(Arc::new(InMemoryTransport::new()), Handle::current());
        let first = host.get_or_start();

        assert!(host.stop());
        assert_eq!(first.state(), SessionState::Stopped);
        assert!(host.current().is_none());
        assert!(!host.stop());

        let second = host.get_or_start();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), SessionState::Idle);
    }
}
