//! Host-facing session orchestration.
//!
//! - `service`: The single running camera session, started lazily and stopped explicitly
//! - `controller`: Maps host lifecycle transitions onto the session
//! - `observer`: Callbacks the host implements

mod controller;
mod observer;
mod service;

pub use controller::SessionController;
pub use observer::{LoggingObserver, SessionObserver};
pub use service::ServiceHost;
