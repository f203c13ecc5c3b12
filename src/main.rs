mod bluetooth;
mod config;
mod database;
mod error;
mod models;
mod queue;
mod serial;
mod translate;
mod uploader;
mod utils;

use log::{error, info, warn};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bluetooth::{BleRelay, DutyCycleController, RelayTarget};
use config::AppConfig;
use error::ConfigError;
use database::PostgresStore;
use queue::DeliveryQueue;
use serial::{find_serial_port, run_serial_reader, SerialDevice, SerialSettings};
use translate::TranslationDefaults;
use uploader::run_uploader;

/// Cancel the shared token on SIGINT or SIGTERM
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to listen for SIGTERM: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Interrupt received; shutting down");
                    }
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupt received; shutting down"),
                _ = terminate.recv() => info!("SIGTERM received; shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Interrupt received; shutting down");
        }
        token.cancel();
    });
}

fn start_relay(config: &AppConfig, token: CancellationToken) -> Option<JoinHandle<()>> {
    info!(
        "BLE: config address={:?} up={:.3} min down={:.3} min",
        config.relay.device_address, config.relay.uptime_mins, config.relay.downtime_mins
    );

    let Some(duty_cycle) = config.duty_cycle() else {
        info!("BLE: switcher disabled (check STARLINK_* mins and DSD_DEVICE_MAC)");
        return None;
    };

    let transport = BleRelay::new(RelayTarget {
        address: duty_cycle.device_address.clone(),
        name_hint: duty_cycle.device_name.clone(),
    });
    let controller = DutyCycleController::new(duty_cycle, transport);
    Some(tokio::spawn(controller.run(token)))
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Config error: {}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let store = match PostgresStore::new(&config.database_url, config.connect_timeout) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            let e = ConfigError::Invalid {
                name: "DATABASE_URL",
                value: e.to_string(),
            };
            error!("Config error: {}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let serial_path = match find_serial_port(config.serial_port.as_deref()) {
        Ok(path) => path,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let queue = Arc::new(DeliveryQueue::new());
    let token = CancellationToken::new();
    spawn_shutdown_listener(token.clone());

    let defaults = TranslationDefaults {
        latitude: config.default_latitude,
        longitude: config.default_longitude,
    };
    let serial_task = tokio::spawn(run_serial_reader(
        SerialDevice::new(SerialSettings {
            path: serial_path,
            baud: config.baud,
        }),
        Arc::clone(&queue),
        defaults,
        token.clone(),
    ));

    let relay_task = start_relay(&config, token.clone());

    run_uploader(
        store,
        Arc::clone(&queue),
        config.batch_size,
        config.tick_interval,
        token.clone(),
    )
    .await;

    if let Err(e) = serial_task.await {
        error!("Serial reader task failed: {}", e);
    }
    if let Some(task) = relay_task {
        if let Err(e) = task.await {
            error!("Relay task failed: {}", e);
        }
    }

    info!("Exiting");
    ExitCode::SUCCESS
}
