/// BlueZ GATT link to the DSD TECH relay
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, Session, Uuid};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::bluetooth::relay::RelayTransport;
use crate::error::RelayError;

// DSD TECH relay GATT layout
pub const RELAY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
pub const RELAY_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// How the relay is recognised during a scan.
#[derive(Debug, Clone)]
pub struct RelayTarget {
    /// Configured device address, compared case-insensitively
    pub address: String,
    /// Advertised-name substring, used only when `address` is not a MAC
    pub name_hint: String,
}

impl RelayTarget {
    /// Name/service matching is only trusted when there is no MAC to go by.
    fn allows_fallback_match(&self) -> bool {
        self.address.parse::<Address>().is_err()
    }
}

pub struct BleRelay {
    target: RelayTarget,
    session: Option<Session>,
    adapter: Option<Adapter>,
    device: Option<Device>,
    characteristic: Option<Characteristic>,
    notifications: Option<JoinHandle<()>>,
}

impl BleRelay {
    pub fn new(target: RelayTarget) -> Self {
        Self {
            target,
            session: None,
            adapter: None,
            device: None,
            characteristic: None,
            notifications: None,
        }
    }

    async fn adapter(&mut self) -> Result<Adapter, RelayError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: false,
            ..Default::default()
        };
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("BLE: failed to set discovery filter: {}", e);
        }

        self.session = Some(session);
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn is_relay(&self, device: &Device) -> bool {
        let address = device.address().to_string();
        if address.eq_ignore_ascii_case(self.target.address.trim()) {
            return true;
        }
        if !self.target.allows_fallback_match() {
            return false;
        }

        if let Ok(Some(name)) = device.name().await {
            if name.contains(&self.target.name_hint) {
                return true;
            }
        }
        matches!(device.uuids().await, Ok(Some(uuids)) if uuids.contains(&RELAY_SERVICE_UUID))
    }

    async fn scan(&self, adapter: &Adapter) -> Result<Device, RelayError> {
        let events = adapter.discover_devices().await?;
        tokio::pin!(events);

        while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(addr) = event {
                let Ok(device) = adapter.device(addr) else {
                    continue;
                };
                if self.is_relay(&device).await {
                    return Ok(device);
                }
                debug!("BLE: ignoring device {}", addr);
            }
        }

        Err(RelayError::NotFound(self.target.address.clone()))
    }

    async fn find_characteristic(device: &Device) -> Result<Characteristic, RelayError> {
        for service in device.services().await? {
            if service.uuid().await? != RELAY_SERVICE_UUID {
                continue;
            }
            for characteristic in service.characteristics().await? {
                if characteristic.uuid().await? == RELAY_CHARACTERISTIC_UUID {
                    return Ok(characteristic);
                }
            }
        }
        Err(RelayError::MissingCharacteristic(RELAY_CHARACTERISTIC_UUID))
    }

    /// Log relay notifications on a detached task; nothing reads them back.
    fn watch_notifications(characteristic: Characteristic) -> JoinHandle<()> {
        tokio::spawn(async move {
            let stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("BLE: notifications unavailable: {}", e);
                    return;
                }
            };
            tokio::pin!(stream);
            while let Some(value) = stream.next().await {
                info!("BLE: notify {}", hex(&value));
            }
        })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
impl RelayTransport for BleRelay {
    async fn discover(&mut self) -> Result<(), RelayError> {
        let adapter = self.adapter().await?;
        let device = timeout(DISCOVERY_TIMEOUT, self.scan(&adapter))
            .await
            .map_err(|_| RelayError::NotFound(self.target.address.clone()))??;

        info!("BLE: found relay {}", device.address());
        self.device = Some(device);
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), RelayError> {
        let device = self.device.as_ref().ok_or(RelayError::NotConnected)?;
        if !device.is_connected().await? {
            device.connect().await?;
        }

        let characteristic = Self::find_characteristic(device).await?;
        self.notifications = Some(Self::watch_notifications(characteristic.clone()));
        self.characteristic = Some(characteristic);
        Ok(())
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), RelayError> {
        let characteristic = self.characteristic.as_ref().ok_or(RelayError::NotConnected)?;
        characteristic.write(frame).await?;
        debug!("BLE: wrote {}", hex(frame));
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
        self.characteristic = None;
        if let Some(device) = self.device.take() {
            if let Err(e) = device.disconnect().await {
                debug!("BLE: disconnect failed: {}", e);
            }
        }
    }
}
