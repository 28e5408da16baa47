//! EV Charger Control Service Library
//!
//! Bridges an Alfen NG9xx wallbox (Modbus TCP) onto a Victron GX system
//! bus: polls the charger, maps its mode-3 state onto the canonical
//! EV-charger lifecycle, tracks charging sessions, and drives the current
//! setpoint from the selected mode (MANUAL, AUTO excess-solar, SCHEDULED).

// Module declarations
pub mod api;
pub mod bus;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod port;
pub mod pricing;
pub mod registers;
pub mod session;
pub mod status;
pub mod telemetry;

// Re-export commonly used types
pub use config::DriverConfig;
pub use engine::{Command, Engine, EngineHandle, StatusReport};
pub use error::{DriverError, Result};
pub use status::EvChargerStatus;

use tracing::error;

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                error!(
                    "Failed to install SIGTERM handler: {}. Service will only respond to Ctrl+C",
                    e
                );
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
