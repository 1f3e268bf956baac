//! # Trade-Bus Runtime
//!
//! Hosts a single event bus instance for a service deployment.
//!
//! ## Startup Sequence
//!
//! 1. Initialize logging and metrics (`BUS_LOG_LEVEL`, `BUS_JSON_LOGS`)
//! 2. Load `BusConfig` from the environment and validate it
//! 3. Connect to the broker; abort with status 1 on failure unless
//!    `BUS_EXIT_ON_STARTUP_FAILURE=false`
//! 4. Report health every `BUS_HEALTH_INTERVAL_MS` (default 30 s)
//!
//! ## Shutdown
//!
//! SIGINT or SIGTERM cancels every consumer and waits up to
//! `BUS_SHUTDOWN_TIMEOUT_MS` for them to drain. A drain that overruns the
//! deadline exits with status 1.

use std::env;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use bus_telemetry::{init_telemetry, TelemetryConfig};
use shared_bus::{BusConfig, BusError, EventBus};
use shared_types::ENVELOPE_VERSION;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = TelemetryConfig::from_env();
    init_telemetry(&telemetry).context("failed to initialize telemetry")?;

    let mut config = match BusConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid bus configuration");
            process::exit(1);
        }
    };

    if config.service_name.is_none() {
        config.service_name = Some(telemetry.service_name.clone());
    }

    info!(
        service = %telemetry.service_name,
        environment = %telemetry.environment,
        envelope_version = ENVELOPE_VERSION,
        streams = config.streams.len(),
        "Starting event bus runtime"
    );

    let bus = match EventBus::new(config).await {
        Ok(bus) => bus,
        Err(e) => {
            error!(error = %e, "Event bus failed to start");
            process::exit(1);
        }
    };

    let reporter = tokio::spawn(report_health(bus.clone(), health_interval()));

    info!("Event bus is running. Press Ctrl+C to stop.");
    shutdown_signal().await;
    reporter.abort();

    match bus.close().await {
        Ok(()) => {
            info!("Event bus stopped");
            Ok(())
        }
        Err(BusError::ShutdownTimeout { remaining }) => {
            error!(remaining, "Consumers did not drain before the shutdown deadline");
            process::exit(1);
        }
        Err(e) => Err(e).context("shutdown failed"),
    }
}

fn health_interval() -> Duration {
    env::var("BUS_HEALTH_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_HEALTH_INTERVAL)
}

async fn report_health(bus: EventBus, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let status = bus.get_health();
        let rendered = serde_json::to_string(&status).unwrap_or_default();
        if status.healthy {
            info!(
                health = %rendered,
                consumers = bus.active_consumers(),
                "Health check"
            );
        } else {
            warn!(
                health = %rendered,
                consumers = bus.active_consumers(),
                "Event bus unhealthy"
            );
        }
    }
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
///
/// A handler that cannot be installed is logged and never fires, so the
/// other signal still works.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, starting graceful shutdown"),
        () = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
