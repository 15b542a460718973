//! WinRT Backend
//!
//! [`BleAdapter`] over `Windows.Devices.Bluetooth`. Event handlers registered
//! with WinRT only forward into channels; the controllers consume them.

use crate::domain::models::{
    AdapterState, CharacteristicDescriptor, DeviceId, DiscoveredDevice, ScanFilter,
    ServiceDescriptor,
};
use crate::infrastructure::bluetooth::adapter::{
    encode_value, BleAdapter, Connection, DisconnectionWatch, Notifications, ScanResults,
};
use crate::infrastructure::bluetooth::error::BleError;
use crate::infrastructure::bluetooth::ids;
use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattDeviceService, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothCacheMode, BluetoothConnectionStatus, BluetoothError,
    BluetoothLEDevice,
};
use windows::Devices::Radios::{Radio, RadioAccessStatus, RadioState};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::DataReader;

struct Subscription {
    characteristic: GattCharacteristic,
    token: i64,
    transaction: String,
}

struct Link {
    device: BluetoothLEDevice,
    session: Option<GattSession>,
    status_token: i64,
    services: Vec<GattDeviceService>,
    subscriptions: Vec<Subscription>,
}

type Watchers = Arc<Mutex<HashMap<DeviceId, Vec<oneshot::Sender<Result<DeviceId, BleError>>>>>>;

pub struct WinRtAdapter {
    state: Arc<watch::Sender<AdapterState>>,
    // Keeps the StateChanged registration alive.
    radio: Option<(Radio, i64)>,
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
    links: Mutex<HashMap<DeviceId, Link>>,
    watchers: Watchers,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn radio_state(state: RadioState) -> AdapterState {
    match state {
        RadioState::On => AdapterState::PoweredOn,
        RadioState::Off | RadioState::Disabled => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

fn to_guid(uuid: &str) -> Result<GUID, BleError> {
    ids::parse_uuid(uuid)
        .map(GUID::from_u128)
        .ok_or_else(|| BleError::Platform(format!("Invalid UUID: {}", uuid)))
}

fn from_guid(guid: &GUID) -> String {
    ids::format_uuid(guid.to_u128())
}

fn notify_watchers(watchers: &Watchers, device: &DeviceId) {
    let pending = lock(watchers).remove(device).unwrap_or_default();
    for watcher in pending {
        let _ = watcher.send(Ok(device.clone()));
    }
}

impl WinRtAdapter {
    /// Resolve the default adapter and its radio. Machines without an LE
    /// capable adapter report [`AdapterState::Unsupported`].
    pub async fn new() -> Self {
        let (sender, _) = watch::channel(AdapterState::Unknown);
        let state = Arc::new(sender);
        let radio = match Self::attach_radio(&state).await {
            Ok(radio) => radio,
            Err(e) => {
                error!("Failed to query Bluetooth adapter: {}", e);
                state.send_replace(AdapterState::Unsupported);
                None
            }
        };

        Self {
            state,
            radio,
            watcher: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            watchers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn attach_radio(
        state: &Arc<watch::Sender<AdapterState>>,
    ) -> Result<Option<(Radio, i64)>, BleError> {
        let adapter = BluetoothAdapter::GetDefaultAsync()?.await?;
        if !adapter.IsLowEnergySupported()? {
            info!("Default Bluetooth adapter does not support LE");
            state.send_replace(AdapterState::Unsupported);
            return Ok(None);
        }

        match Radio::RequestAccessAsync()?.await? {
            RadioAccessStatus::Allowed | RadioAccessStatus::Unspecified => {}
            status => {
                warn!("Radio access denied: {:?}", status);
                state.send_replace(AdapterState::Unauthorized);
                return Ok(None);
            }
        }

        let radio = adapter.GetRadioAsync()?.await?;
        state.send_replace(radio_state(radio.State()?));

        let feed = Arc::clone(state);
        let handler = TypedEventHandler::new(
            move |radio: windows::core::Ref<Radio>, _: windows::core::Ref<windows::core::IInspectable>| {
                if let Some(radio) = radio.as_ref() {
                    let next = radio_state(radio.State()?);
                    debug!("Radio state changed: {}", next);
                    feed.send_replace(next);
                }
                Ok(())
            },
        );
        let token = radio.StateChanged(&handler)?;
        Ok(Some((radio, token)))
    }

    fn ensure_powered(&self) -> Result<(), BleError> {
        let state = *self.state.borrow();
        if state.is_powered_on() {
            Ok(())
        } else {
            Err(BleError::AdapterUnavailable(state))
        }
    }

    fn link_services(&self, device: &DeviceId) -> Result<Vec<GattDeviceService>, BleError> {
        lock(&self.links)
            .get(device)
            .map(|link| link.services.clone())
            .ok_or_else(|| BleError::NotConnected(device.clone()))
    }

    fn release(&self, link: Link) {
        for sub in link.subscriptions {
            let _ = sub.characteristic.RemoveValueChanged(sub.token);
        }
        let _ = link.device.RemoveConnectionStatusChanged(link.status_token);
        for service in link.services {
            let _ = service.Close();
        }
        if let Some(session) = link.session {
            let _ = session.Close();
        }
        let _ = link.device.Close();
    }

    fn start_watcher(
        &self,
        filter: &ScanFilter,
        results: mpsc::UnboundedSender<Result<DiscoveredDevice, BleError>>,
    ) -> Result<BluetoothLEAdvertisementWatcher, BleError> {
        let targets = filter
            .service_uuids
            .iter()
            .map(|uuid| to_guid(uuid))
            .collect::<Result<Vec<_>, _>>()?;

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let sender = results.clone();
        let received = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    if !targets.is_empty() {
                        let advertised = adv.ServiceUuids()?;
                        let mut matched = false;
                        for i in 0..advertised.Size()? {
                            if targets.contains(&advertised.GetAt(i)?) {
                                matched = true;
                                break;
                            }
                        }
                        if !matched {
                            return Ok(());
                        }
                    }

                    let name = adv.LocalName()?.to_string();
                    let mut device = DiscoveredDevice::new(ids::format_address(
                        args.BluetoothAddress()?,
                    ))
                    .with_signal_strength(args.RawSignalStrengthInDBm()?);
                    if !name.is_empty() {
                        device = device.with_name(name);
                    }
                    device.is_connectable = args.IsConnectable().ok();
                    let _ = sender.unbounded_send(Ok(device));
                }
                Ok(())
            },
        );

        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let status = args.Error()?;
                    if status != BluetoothError::Success {
                        let _ = results
                            .unbounded_send(Err(BleError::ScanFailed(format!("{:?}", status))));
                    }
                }
                results.close_channel();
                Ok(())
            },
        );

        watcher.Received(&received)?;
        watcher.Stopped(&stopped)?;
        watcher.Start()?;
        Ok(watcher)
    }
}

#[async_trait]
impl BleAdapter for WinRtAdapter {
    fn observe_state(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }

    fn observe_disconnection(&self, device: &DeviceId) -> DisconnectionWatch {
        if device.is_empty() {
            return futures::future::ready(Err(BleError::InvalidDeviceId)).boxed();
        }
        let (tx, rx) = oneshot::channel();
        lock(&self.watchers)
            .entry(device.clone())
            .or_default()
            .push(tx);
        rx.map(|result| result.unwrap_or(Err(BleError::Cancelled)))
            .boxed()
    }

    fn scan(&self, filter: &ScanFilter) -> ScanResults {
        self.stop_scan();
        let (tx, rx) = mpsc::unbounded();
        if let Err(e) = self.ensure_powered() {
            let _ = tx.unbounded_send(Err(e));
            return rx.boxed();
        }

        info!("Starting BLE scan (filter: {:?})", filter.service_uuids);
        match self.start_watcher(filter, tx.clone()) {
            Ok(watcher) => *lock(&self.watcher) = Some(watcher),
            Err(e) => {
                error!("Failed to start advertisement watcher: {}", e);
                let _ = tx.unbounded_send(Err(e));
            }
        }
        rx.boxed()
    }

    fn stop_scan(&self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            info!("Stopping BLE scan...");
            let _ = watcher.Stop();
        }
    }

    async fn connect(&self, device: &DeviceId) -> Result<Connection, BleError> {
        self.ensure_powered()?;
        let address = ids::parse_address(device)?;
        info!("Connecting to Bluetooth device: {}", device);

        let le_device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?
            .await
            .map_err(|e| BleError::ConnectionFailed(e.message().to_string()))?;

        // Without a session Windows drops idle links after a few seconds.
        let session = match GattSession::FromDeviceIdAsync(&le_device.BluetoothDeviceId()?)?.await
        {
            Ok(session) => {
                session.SetMaintainConnection(true)?;
                Some(session)
            }
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        let watchers = Arc::clone(&self.watchers);
        let id = device.clone();
        let handler = TypedEventHandler::new(
            move |dev: windows::core::Ref<BluetoothLEDevice>, _: windows::core::Ref<windows::core::IInspectable>| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        info!("Device {} reported disconnection", id);
                        notify_watchers(&watchers, &id);
                    }
                }
                Ok(())
            },
        );
        let status_token = le_device.ConnectionStatusChanged(&handler)?;

        let previous = lock(&self.links).insert(
            device.clone(),
            Link {
                device: le_device,
                session,
                status_token,
                services: Vec::new(),
                subscriptions: Vec::new(),
            },
        );
        if let Some(previous) = previous {
            self.release(previous);
        }

        Ok(Connection {
            device: device.clone(),
        })
    }

    async fn discover_services_and_characteristics(
        &self,
        connection: &Connection,
    ) -> Result<(), BleError> {
        let le_device = lock(&self.links)
            .get(&connection.device)
            .map(|link| link.device.clone())
            .ok_or_else(|| BleError::NotConnected(connection.device.clone()))?;

        // The first uncached GATT query is what actually opens the link.
        let result = le_device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        let status = result.Status()?;
        if status != GattCommunicationStatus::Success {
            return Err(BleError::ServiceDiscoveryFailed(format!("{:?}", status)));
        }

        let list = result.Services()?;
        let mut services = Vec::with_capacity(list.Size()? as usize);
        for i in 0..list.Size()? {
            services.push(list.GetAt(i)?);
        }
        info!("Found {} services on {}", services.len(), connection.device);

        match lock(&self.links).get_mut(&connection.device) {
            Some(link) => {
                link.services = services;
                Ok(())
            }
            None => Err(BleError::NotConnected(connection.device.clone())),
        }
    }

    async fn services(&self, device: &DeviceId) -> Result<Vec<ServiceDescriptor>, BleError> {
        self.link_services(device)?
            .iter()
            .map(|service| {
                Ok::<_, BleError>(ServiceDescriptor {
                    id: from_guid(&service.Uuid()?),
                })
            })
            .collect()
    }

    async fn characteristics(
        &self,
        device: &DeviceId,
        service: &ServiceDescriptor,
    ) -> Result<Vec<CharacteristicDescriptor>, BleError> {
        let target = to_guid(&service.id)?;
        let mut gatt_service = None;
        for candidate in self.link_services(device)? {
            if candidate.Uuid()? == target {
                gatt_service = Some(candidate);
                break;
            }
        }
        let gatt_service = gatt_service
            .ok_or_else(|| BleError::ServiceDiscoveryFailed(format!("No service {}", service.id)))?;

        let result = gatt_service.GetCharacteristicsAsync()?.await?;
        if result.Status()? != GattCommunicationStatus::Success {
            return Err(BleError::ServiceDiscoveryFailed(format!(
                "Characteristics of {}: {:?}",
                service.id,
                result.Status()?
            )));
        }

        let list = result.Characteristics()?;
        let mut characteristics = Vec::with_capacity(list.Size()? as usize);
        for i in 0..list.Size()? {
            let c = list.GetAt(i)?;
            let props = c.CharacteristicProperties()?;
            let has = |flag: GattCharacteristicProperties| props.0 & flag.0 != 0;
            characteristics.push(CharacteristicDescriptor {
                id: from_guid(&c.Uuid()?),
                service_id: service.id.clone(),
                is_notifiable: has(GattCharacteristicProperties::Notify)
                    || has(GattCharacteristicProperties::Indicate),
                is_readable: has(GattCharacteristicProperties::Read),
                is_writable_with_response: has(GattCharacteristicProperties::Write),
                is_writable_without_response: has(
                    GattCharacteristicProperties::WriteWithoutResponse,
                ),
            });
        }
        Ok(characteristics)
    }

    async fn subscribe(
        &self,
        device: &DeviceId,
        service_id: &str,
        characteristic_id: &str,
        transaction: &str,
    ) -> Result<Notifications, BleError> {
        let service_guid = to_guid(service_id)?;
        let target = to_guid(characteristic_id)?;

        let mut gatt_service = None;
        for candidate in self.link_services(device)? {
            if candidate.Uuid()? == service_guid {
                gatt_service = Some(candidate);
                break;
            }
        }
        let gatt_service = gatt_service
            .ok_or_else(|| BleError::SubscriptionFailed(format!("No service {}", service_id)))?;

        let result = gatt_service
            .GetCharacteristicsForUuidAsync(target)?
            .await?;
        let list = result.Characteristics()?;
        if result.Status()? != GattCommunicationStatus::Success || list.Size()? == 0 {
            return Err(BleError::SubscriptionFailed(format!(
                "No characteristic {}",
                characteristic_id
            )));
        }
        let characteristic = list.GetAt(0)?;

        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?
            .await?;
        if status != GattCommunicationStatus::Success {
            return Err(BleError::SubscriptionFailed(format!("{:?}", status)));
        }

        let (tx, rx) = mpsc::unbounded();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let reader = DataReader::FromBuffer(&args.CharacteristicValue()?)?;
                    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                    reader.ReadBytes(&mut bytes)?;
                    let _ = tx.unbounded_send(Ok(encode_value(&bytes)));
                }
                Ok(())
            },
        );
        let token = characteristic.ValueChanged(&handler)?;

        match lock(&self.links).get_mut(device) {
            Some(link) => link.subscriptions.push(Subscription {
                characteristic,
                token,
                transaction: transaction.to_string(),
            }),
            None => {
                let _ = characteristic.RemoveValueChanged(token);
                return Err(BleError::NotConnected(device.clone()));
            }
        }
        Ok(rx.boxed())
    }

    fn cancel_transactions(&self, transaction: &str) {
        let mut links = lock(&self.links);
        for link in links.values_mut() {
            let (cancelled, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut link.subscriptions)
                .into_iter()
                .partition(|sub| sub.transaction == transaction);
            link.subscriptions = kept;
            for sub in cancelled {
                let _ = sub.characteristic.RemoveValueChanged(sub.token);
                // Fire-and-forget; the handler is already gone.
                let _ = sub
                    .characteristic
                    .WriteClientCharacteristicConfigurationDescriptorAsync(
                        GattClientCharacteristicConfigurationDescriptorValue::None,
                    );
            }
        }
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), BleError> {
        let link = lock(&self.links).remove(device);
        match link {
            Some(link) => {
                info!("Disconnecting from {}", device);
                self.release(link);
                notify_watchers(&self.watchers, device);
            }
            None => debug!("{} already disconnected", device),
        }
        Ok(())
    }

    fn destroy(&self) {
        self.stop_scan();
        let links: Vec<Link> = lock(&self.links).drain().map(|(_, link)| link).collect();
        for link in links {
            self.release(link);
        }
        lock(&self.watchers).clear();
        if let Some((radio, token)) = &self.radio {
            let _ = radio.RemoveStateChanged(*token);
        }
    }
}
