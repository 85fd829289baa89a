// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BlueZ GATT client transport built on bluer.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport,
};
use futures::{stream, StreamExt};
use parking_lot::RwLock;
use std::time::Duration;
use tracing::{debug, info};

use super::{BleTransport, LinkEvent, LinkStream, ScanStream, StatusStream, ValueStream};
use crate::config::BluetoothConfig;
use crate::model::{
    BleStatus, CharacteristicKey, ConnectionPriority, DeviceId, DiscoveredDevice,
    DiscoveredService, ScanFilter,
};

/// Transport driving a local BlueZ adapter over D-Bus.
pub struct BluezTransport {
    session: bluer::Session,
    adapter_name: Option<String>,
    adapter: RwLock<Option<Adapter>>,
}

impl BluezTransport {
    pub async fn new(config: &BluetoothConfig) -> Result<Self> {
        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        Ok(Self {
            session,
            adapter_name: config.adapter.clone(),
            adapter: RwLock::new(None),
        })
    }

    fn adapter(&self) -> Result<Adapter> {
        self.adapter
            .read()
            .clone()
            .ok_or_else(|| anyhow!("Bluetooth adapter is not initialized"))
    }

    fn device(&self, device_id: &DeviceId) -> Result<Device> {
        let address: Address = device_id
            .as_str()
            .parse()
            .map_err(|_| anyhow!("Invalid device address: {}", device_id))?;
        Ok(self.adapter()?.device(address)?)
    }

    async fn characteristic(&self, key: &CharacteristicKey) -> Result<Characteristic> {
        let device = self.device(&key.device_id)?;
        for service in device.services().await? {
            for characteristic in service.characteristics().await? {
                if characteristic.uuid().await? == key.characteristic {
                    return Ok(characteristic);
                }
            }
        }
        Err(anyhow!(
            "Characteristic {} not found on {}",
            key.characteristic,
            key.device_id
        ))
    }
}

async fn describe(adapter: &Adapter, address: Address) -> Result<DiscoveredDevice> {
    let device = adapter.device(address)?;
    Ok(DiscoveredDevice {
        id: DeviceId::new(address.to_string()),
        name: device.name().await?,
        rssi: device.rssi().await?,
        service_uuids: device.uuids().await?.unwrap_or_default().into_iter().collect(),
        service_data: device.service_data().await?.unwrap_or_default(),
        manufacturer_data: device.manufacturer_data().await?.unwrap_or_default(),
    })
}

fn radio_status(powered: bool) -> BleStatus {
    if powered {
        BleStatus::Ready
    } else {
        BleStatus::PoweredOff
    }
}

#[async_trait]
impl BleTransport for BluezTransport {
    fn backend_name(&self) -> &'static str {
        "bluez"
    }

    async fn initialize(&self) -> Result<()> {
        let adapter = match &self.adapter_name {
            Some(name) => self.session.adapter(name)?,
            None => self.session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        *self.adapter.write() = Some(adapter);
        Ok(())
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<ScanStream> {
        let adapter = self.adapter()?;
        adapter
            .set_discovery_filter(DiscoveryFilter {
                uuids: filter.service_uuids.iter().copied().collect(),
                transport: DiscoveryTransport::Le,
                ..Default::default()
            })
            .await?;

        let events = adapter.discover_devices().await?;
        debug!("Discovery started on {}", adapter.name());
        let devices = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    AdapterEvent::DeviceAdded(address) => Some(describe(&adapter, address).await),
                    _ => None,
                }
            }
        });
        Ok(devices.boxed())
    }

    async fn connect(&self, device_id: &DeviceId, _timeout: Duration) -> Result<LinkStream> {
        let device = self.device(device_id)?;
        let events = device.events().await?;

        let establish = {
            let device = device.clone();
            stream::once(async move {
                if !device.is_connected().await? {
                    device.connect().await?;
                }
                Ok::<_, anyhow::Error>(LinkEvent::Connected)
            })
        };
        let drops = events.filter_map(|event| async move {
            match event {
                DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                    Some(Ok(LinkEvent::Disconnected { reason: None }))
                }
                _ => None,
            }
        });
        Ok(establish.chain(drops).boxed())
    }

    async fn disconnect(&self, device_id: &DeviceId) -> Result<()> {
        let device = self.device(device_id)?;
        if device.is_connected().await? {
            device.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_services(&self, device_id: &DeviceId) -> Result<Vec<DiscoveredService>> {
        let device = self.device(device_id)?;
        // Subscribed before the check so a resolution in between is seen.
        let mut events = Box::pin(device.events().await?);
        if !device.is_services_resolved().await? {
            debug!("Waiting for {} to resolve services", device_id);
            loop {
                match events.next().await {
                    Some(DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true))) => {
                        break
                    }
                    Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => {
                        return Err(anyhow!("{} disconnected during service discovery", device_id));
                    }
                    Some(_) => continue,
                    None => {
                        return Err(anyhow!("Event stream for {} ended before services resolved", device_id));
                    }
                }
            }
        }
        drop(events);

        let mut discovered = Vec::new();
        for service in device.services().await? {
            let mut characteristic_uuids = Vec::new();
            for characteristic in service.characteristics().await? {
                characteristic_uuids.push(characteristic.uuid().await?);
            }
            discovered.push(DiscoveredService {
                service_uuid: service.uuid().await?,
                characteristic_uuids,
                included_services: Vec::new(),
            });
        }
        Ok(discovered)
    }

    async fn read_characteristic(&self, key: &CharacteristicKey) -> Result<Vec<u8>> {
        Ok(self.characteristic(key).await?.read().await?)
    }

    async fn write_characteristic(
        &self,
        key: &CharacteristicKey,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let request = CharacteristicWriteRequest {
            op_type: if with_response {
                WriteOp::Request
            } else {
                WriteOp::Command
            },
            ..Default::default()
        };
        self.characteristic(key)
            .await?
            .write_ext(value, &request)
            .await?;
        Ok(())
    }

    async fn subscribe_notifications(&self, key: &CharacteristicKey) -> Result<ValueStream> {
        let notifications = self.characteristic(key).await?.notify().await?;
        Ok(notifications.map(Ok).boxed())
    }

    /// BlueZ exchanges the MTU itself on connect; report what it settled on.
    async fn negotiate_mtu(&self, device_id: &DeviceId, size: u16) -> Result<u16> {
        let device = self.device(device_id)?;
        for service in device.services().await? {
            if let Some(characteristic) = service.characteristics().await?.into_iter().next() {
                let mtu = characteristic.mtu().await?;
                return Ok(size.min(u16::try_from(mtu).unwrap_or(u16::MAX)));
            }
        }
        Err(anyhow!("No characteristics on {} to query the MTU", device_id))
    }

    async fn request_connection_priority(
        &self,
        _device_id: &DeviceId,
        priority: ConnectionPriority,
    ) -> Result<()> {
        Err(anyhow!(
            "Connection priority {:?} is not supported by BlueZ",
            priority
        ))
    }

    async fn clear_gatt_cache(&self, _device_id: &DeviceId) -> Result<()> {
        Err(anyhow!("Clearing the GATT cache is not supported by BlueZ"))
    }

    async fn observe_status(&self) -> Result<StatusStream> {
        let adapter = self.adapter()?;
        let current = radio_status(adapter.is_powered().await?);
        let changes = adapter.events().await?.filter_map(|event| async move {
            match event {
                AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
                    Some(radio_status(powered))
                }
                _ => None,
            }
        });
        Ok(stream::once(async move { current }).chain(changes).boxed())
    }
}
