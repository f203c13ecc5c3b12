/// Relay duty-cycle controller
///
/// Keeps the relay on an ON/OFF schedule for the life of the process:
///
/// ```text
/// Disconnected -> Discovering -> Connected -> OnPhase <-> OffPhase
///       ^                |                        |          |
///       +----------------+------ any error -------+----------+
/// ```
///
/// Every transport failure is logged and retried after a fixed delay; only
/// cancellation ends the loop.
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::bluetooth::frame::RelayFrame;
use crate::config::DutyCycleConfig;
use crate::error::RelayError;
use crate::utils::{sleep_or_cancel, FixedDelay};

const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Link to a physical relay. Implementations own all device handles.
#[async_trait]
pub trait RelayTransport: Send {
    /// Locate the relay within a bounded scan.
    async fn discover(&mut self) -> Result<(), RelayError>;

    /// Connect to the discovered relay.
    async fn connect(&mut self) -> Result<(), RelayError>;

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), RelayError>;

    /// Tear down the link. Must be safe to call in any state.
    async fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Discovering,
    Connected,
    OnPhase,
    OffPhase,
}

pub struct DutyCycleController<T> {
    config: DutyCycleConfig,
    transport: T,
    retry: FixedDelay,
    state: RelayState,
}

impl<T: RelayTransport> DutyCycleController<T> {
    pub fn new(config: DutyCycleConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            retry: FixedDelay::new(RETRY_DELAY),
            state: RelayState::Disconnected,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!(
            "BLE: starting switcher address={} on={:.1}s off={:.1}s",
            self.config.device_address,
            self.config.on_duration.as_secs_f64(),
            self.config.off_duration.as_secs_f64()
        );

        while !token.is_cancelled() {
            let next = self.step(&token).await;
            debug!("BLE: {:?} -> {:?}", self.state, next);
            self.state = next;
        }

        self.transport.disconnect().await;
        info!("BLE: switcher stopped");
    }

    async fn step(&mut self, token: &CancellationToken) -> RelayState {
        match self.state {
            RelayState::Disconnected => RelayState::Discovering,
            RelayState::Discovering => {
                // Shutdown never waits on a scan or a BlueZ connect
                let result = tokio::select! {
                    result = self.establish() => result,
                    _ = token.cancelled() => return RelayState::Disconnected,
                };
                match result {
                    Ok(()) => {
                        info!("BLE: connected; starting ON/OFF schedule");
                        RelayState::Connected
                    }
                    Err(e) => self.fail(e, token).await,
                }
            }
            RelayState::Connected => RelayState::OnPhase,
            RelayState::OnPhase => {
                let frame = RelayFrame::on_now(self.config.password, self.config.channel);
                let duration = self.config.on_duration;
                self.phase(frame, "ON", duration, RelayState::OffPhase, token).await
            }
            RelayState::OffPhase => {
                let frame = RelayFrame::off_now(self.config.password, self.config.channel);
                let duration = self.config.off_duration;
                self.phase(frame, "OFF", duration, RelayState::OnPhase, token).await
            }
        }
    }

    /// Write the phase's frame, then hold it for `duration` or until cancelled.
    async fn phase(
        &mut self,
        frame: RelayFrame,
        label: &str,
        duration: Duration,
        next: RelayState,
        token: &CancellationToken,
    ) -> RelayState {
        let encoded = frame.encode();
        if let Err(e) = self.transport.write_frame(&encoded).await {
            return self.fail(e, token).await;
        }
        info!("BLE: relay {} for {:.1} sec", label, duration.as_secs_f64());
        sleep_or_cancel(duration, token).await;
        next
    }

    async fn establish(&mut self) -> Result<(), RelayError> {
        self.transport.discover().await?;
        info!("BLE: connecting to relay at {}", self.config.device_address);
        self.transport.connect().await
    }

    async fn fail(&mut self, error: RelayError, token: &CancellationToken) -> RelayState {
        let delay = self.retry.next_delay();
        warn!(
            "BLE: error/disconnect: {}; retry in {}s",
            error,
            delay.as_secs()
        );
        self.transport.disconnect().await;
        sleep_or_cancel(delay, token).await;
        RelayState::Disconnected
    }
}
