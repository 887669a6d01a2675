//! `HostRadio` over a btleplug adapter.
//!
//! btleplug is async while `HostRadio` is not, so every accepted request is carried out by a
//! spawned task that reports back through the `HostEventSink`. Each session gets its own task
//! which owns the `Peripheral` and runs that session's requests in order.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use btleplug::api::{BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::{BoxFuture, FutureExt, OptionFuture};
use futures::{Stream, StreamExt};
use indexmap::IndexSet;
use log::{debug, info, warn};
use tokio::spawn;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{
    make_client_characteristic_config_uuid, ENABLE_NOTIFICATION_VALUE, GATT_FAILURE, GATT_SUCCESS,
    SCAN_FAILED_INTERNAL_ERROR, SCAN_FAILED_PERMISSION,
};
use crate::device::host::{HostEventSink, HostRadio, LinkEvent, ScanEvent};
use crate::device::types::{Channel, CharacteristicInfo, PeerAddress, ServiceInfo, ServiceTable, SessionHandle};
use crate::error::DeviceError;

/// Returns the first bluetooth adapter of the system.
pub async fn default_adapter() -> Result<Adapter, DeviceError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    match adapters.into_iter().next() {
        Some(adapter) => {
            info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
            Ok(adapter)
        },
        None => Err(DeviceError::NoAdapter),
    }
}

#[derive(Debug)]
enum LinkCommand {
    DiscoverServices,
    Read(Channel),
    Write(Channel, Vec<u8>),
    WriteDescriptor(Channel, Uuid, Vec<u8>),
}

#[derive(Debug)]
struct LinkHandle {
    commands: UnboundedSender<LinkCommand>,
    cancel: CancellationToken,
}

pub struct BtleRadio {
    adapter: Adapter,
    events: Option<HostEventSink>,
    adapter_cancel: CancellationToken,
    scanning: Arc<AtomicBool>,
    next_session: u64,
    links: HashMap<SessionHandle, LinkHandle>,
}

impl BtleRadio {
    pub fn new(adapter: Adapter) -> Self {
        BtleRadio {
            adapter,
            events: None,
            adapter_cancel: CancellationToken::new(),
            scanning: Arc::new(AtomicBool::new(false)),
            next_session: 0,
            links: HashMap::new(),
        }
    }

    fn send(&self, session: SessionHandle, command: LinkCommand) -> bool {
        match self.links.get(&session) {
            Some(link) => link.commands.unbounded_send(command).is_ok(),
            None => {
                warn!("No link task for session {:?}", session);
                false
            },
        }
    }
}

// macOS hides the MAC address, so peripherals there are addressed by their platform id.
fn peer_address(id: &PeripheralId, address: BDAddr) -> PeerAddress {
    if address == BDAddr::default() {
        PeerAddress::new(format!("{:?}", id))
    } else {
        PeerAddress::new(address.to_string())
    }
}

fn status_of(err: &btleplug::Error) -> i32 {
    match err {
        btleplug::Error::PermissionDenied => SCAN_FAILED_PERMISSION,
        _ => GATT_FAILURE,
    }
}

async fn find_peripheral(adapter: &Adapter, address: &PeerAddress) -> Result<Peripheral, DeviceError> {
    for peripheral in adapter.peripherals().await? {
        if peer_address(&peripheral.id(), peripheral.address()) == *address {
            return Ok(peripheral);
        }
    }

    Err(DeviceError::UnknownPeripheral(address.to_string()))
}

fn find_characteristic(peripheral: &Peripheral, channel: &Channel) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| {
            characteristic.service_uuid == channel.service && characteristic.uuid == channel.characteristic
        })
}

fn service_table(peripheral: &Peripheral) -> ServiceTable {
    let cccd = make_client_characteristic_config_uuid();

    let services = peripheral.services().into_iter().map(|service| ServiceInfo {
        uuid: service.uuid,
        characteristics: service.characteristics.into_iter().map(|characteristic| {
            let mut descriptors: Vec<Uuid> = characteristic.descriptors.iter().map(|descriptor| descriptor.uuid).collect();

            // not every platform lists the CCCD, but subscribe works on any notifying characteristic
            let notifies = characteristic.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE);
            if notifies && !descriptors.contains(&cccd) {
                descriptors.push(cccd);
            }

            CharacteristicInfo {
                uuid: characteristic.uuid,
                descriptors,
            }
        }).collect(),
    }).collect();

    ServiceTable::new(services)
}

async fn run_command(peripheral: Peripheral, command: LinkCommand) -> LinkEvent {
    match command {
        LinkCommand::DiscoverServices => {
            match peripheral.discover_services().await {
                Ok(()) => LinkEvent::ServicesDiscovered { status: GATT_SUCCESS, services: service_table(&peripheral) },
                Err(err) => {
                    warn!("Service discovery failed: {:?}", err);
                    LinkEvent::ServicesDiscovered { status: status_of(&err), services: ServiceTable::default() }
                },
            }
        },
        LinkCommand::Read(channel) => {
            let result = match find_characteristic(&peripheral, &channel) {
                Some(characteristic) => peripheral.read(&characteristic).await.map_err(|err| status_of(&err)),
                None => Err(GATT_FAILURE),
            };

            match result {
                Ok(value) => LinkEvent::ChannelRead { channel, status: GATT_SUCCESS, value },
                Err(status) => LinkEvent::ChannelRead { channel, status, value: Vec::new() },
            }
        },
        LinkCommand::Write(channel, value) => {
            let status = match find_characteristic(&peripheral, &channel) {
                Some(characteristic) => match peripheral.write(&characteristic, &value, WriteType::WithResponse).await {
                    Ok(()) => GATT_SUCCESS,
                    Err(err) => {
                        warn!("Write to {} failed: {:?}", channel, err);
                        status_of(&err)
                    },
                },
                None => GATT_FAILURE,
            };

            LinkEvent::ChannelWritten { channel, status }
        },
        LinkCommand::WriteDescriptor(channel, descriptor, value) => {
            // btleplug owns the CCCD and only exposes it through subscribe/unsubscribe
            let status = match find_characteristic(&peripheral, &channel) {
                Some(characteristic) if descriptor == make_client_characteristic_config_uuid() => {
                    let result = if value == ENABLE_NOTIFICATION_VALUE {
                        peripheral.subscribe(&characteristic).await
                    } else {
                        peripheral.unsubscribe(&characteristic).await
                    };

                    match result {
                        Ok(()) => GATT_SUCCESS,
                        Err(err) => {
                            warn!("Changing notifications of {} failed: {:?}", channel, err);
                            status_of(&err)
                        },
                    }
                },
                _ => GATT_FAILURE,
            };

            LinkEvent::DescriptorWritten { channel, descriptor, status }
        },
    }
}

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

// btleplug notifications only name the characteristic. Channels subscribed on the link take
// precedence; otherwise the first discovered service with that characteristic is assumed.
fn discovered_channel(peripheral: &Peripheral, characteristic: Uuid) -> Option<Channel> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|candidate| candidate.uuid == characteristic)
        .map(|candidate| Channel::new(candidate.service_uuid, candidate.uuid))
}

async fn link_task(
    adapter: Adapter,
    address: PeerAddress,
    session: SessionHandle,
    events: HostEventSink,
    commands: UnboundedReceiver<LinkCommand>,
    cancel: CancellationToken,
) {
    let report = |event: LinkEvent| events.link(&address, session, event);

    let peripheral = match find_peripheral(&adapter, &address).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            warn!("Cannot connect to {}: {}", address, err);
            report(LinkEvent::StateChanged { status: GATT_FAILURE, connected: false });
            return;
        },
    };

    let mut central_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("Cannot watch adapter events: {:?}", err);
            report(LinkEvent::StateChanged { status: status_of(&err), connected: false });
            return;
        },
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Session {:?} closed while connecting", session);
            let _ = peripheral.disconnect().await;
            return;
        },
        result = peripheral.connect() => {
            if let Err(err) = result {
                warn!("Connecting to {} failed: {:?}", address, err);
                report(LinkEvent::StateChanged { status: status_of(&err), connected: false });
                return;
            }
        },
    }

    let notifications: Notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("Cannot receive notifications from {}: {:?}", address, err);
            Box::pin(futures::stream::pending())
        },
    };

    info!("Link to {} established", address);
    report(LinkEvent::StateChanged { status: GATT_SUCCESS, connected: true });

    let peripheral_id = peripheral.id();
    let disconnected = async move {
        while let Some(event) = central_events.next().await {
            if let CentralEvent::DeviceDisconnected(id) = event {
                if id == peripheral_id {
                    return;
                }
            }
        }
        futures::future::pending::<()>().await
    }.boxed();

    let runner = peripheral.clone();
    let lookup = peripheral.clone();
    let end = serve_link(
        cancel,
        commands,
        notifications,
        disconnected,
        move |command| run_command(runner.clone(), command).boxed(),
        move |characteristic| discovered_channel(&lookup, characteristic),
        &report,
    ).await;

    match end {
        LinkEnd::Dropped => {
            info!("{} disconnected", address);
            report(LinkEvent::StateChanged { status: GATT_SUCCESS, connected: false });
        },
        LinkEnd::Closed => {
            debug!("Disconnecting {}", address);
            if let Err(err) = peripheral.disconnect().await {
                warn!("Disconnecting {} failed: {:?}", address, err);
            }
        },
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LinkEnd {
    Closed,
    Dropped,
}

/// Serves one established session until it is closed or the peripheral goes away.
///
/// Requests run one at a time, but the request in flight is polled next to notifications and the
/// disconnect watch, so a slow write never holds those back.
async fn serve_link<R, L, P>(
    cancel: CancellationToken,
    mut commands: UnboundedReceiver<LinkCommand>,
    mut notifications: Notifications,
    mut disconnected: BoxFuture<'static, ()>,
    mut run: R,
    lookup: L,
    report: P,
) -> LinkEnd
where
    R: FnMut(LinkCommand) -> BoxFuture<'static, LinkEvent>,
    L: Fn(Uuid) -> Option<Channel>,
    P: Fn(LinkEvent),
{
    let mut subscribed: IndexSet<Channel> = IndexSet::new();
    let mut in_flight: Option<BoxFuture<'static, LinkEvent>> = None;

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            _ = &mut disconnected => {
                return LinkEnd::Dropped;
            },
            Some(event) = OptionFuture::from(in_flight.as_mut()) => {
                in_flight = None;
                report(event);
            },
            Some(command) = commands.next(), if in_flight.is_none() => {
                if let LinkCommand::WriteDescriptor(channel, _, value) = &command {
                    if *value == ENABLE_NOTIFICATION_VALUE {
                        subscribed.insert(*channel);
                    } else {
                        subscribed.shift_remove(channel);
                    }
                }
                in_flight = Some(run(command));
            },
            Some(notification) = notifications.next() => {
                let channel = subscribed
                    .iter()
                    .find(|channel| channel.characteristic == notification.uuid)
                    .copied()
                    .or_else(|| lookup(notification.uuid));

                match channel {
                    Some(channel) => report(LinkEvent::ChannelChanged { channel, value: notification.value }),
                    None => debug!("Dropping notification of unknown characteristic {}", notification.uuid),
                }
            },
        }
    }

    LinkEnd::Closed
}

async fn sighting(adapter: &Adapter, id: &PeripheralId) -> Option<ScanEvent> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;

    Some(ScanEvent::PeerSighted {
        name: properties.local_name,
        address: peer_address(id, properties.address),
        // unknown strength sorts below every real reading
        rssi: properties.rssi.unwrap_or(i16::MIN),
    })
}

async fn scan_events_task(adapter: Adapter, events: HostEventSink, scanning: Arc<AtomicBool>, cancel: CancellationToken) {
    let mut central_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("Cannot watch adapter events: {:?}", err);
            return;
        },
    };

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = central_events.next() => match event {
                None => break 'mainloop,
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    if !scanning.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Some(event) = sighting(&adapter, &id).await {
                        events.scan(event);
                    }
                },
                Some(_) => {},
            },
        }
    }

    debug!("Adapter event pump stopped");
}

impl HostRadio for BtleRadio {
    fn open_adapter(&mut self, events: HostEventSink) -> bool {
        self.adapter_cancel = CancellationToken::new();
        spawn(scan_events_task(self.adapter.clone(), events.clone(), self.scanning.clone(), self.adapter_cancel.clone()));
        self.events = Some(events);
        true
    }

    fn close_adapter(&mut self) {
        self.stop_scan();
        for (_, link) in self.links.drain() {
            link.cancel.cancel();
        }
        self.adapter_cancel.cancel();
        self.events = None;
    }

    fn establish_link(&mut self, address: &PeerAddress) -> Option<SessionHandle> {
        let events = self.events.clone()?;

        self.next_session += 1;
        let session = SessionHandle(self.next_session);
        let (commands, rx) = unbounded();
        let cancel = CancellationToken::new();

        spawn(link_task(self.adapter.clone(), address.clone(), session, events, rx, cancel.clone()));
        self.links.insert(session, LinkHandle { commands, cancel });
        Some(session)
    }

    fn discover_services(&mut self, session: SessionHandle) -> bool {
        self.send(session, LinkCommand::DiscoverServices)
    }

    fn read_channel(&mut self, session: SessionHandle, channel: &Channel) -> bool {
        self.send(session, LinkCommand::Read(*channel))
    }

    fn write_channel(&mut self, session: SessionHandle, channel: &Channel, value: &[u8]) -> bool {
        self.send(session, LinkCommand::Write(*channel, value.to_vec()))
    }

    fn write_descriptor(&mut self, session: SessionHandle, channel: &Channel, descriptor: Uuid, value: &[u8]) -> bool {
        self.send(session, LinkCommand::WriteDescriptor(*channel, descriptor, value.to_vec()))
    }

    fn close_session(&mut self, session: SessionHandle) {
        if let Some(link) = self.links.remove(&session) {
            link.cancel.cancel();
        }
    }

    fn start_scan(&mut self) -> bool {
        let events = match &self.events {
            Some(events) => events.clone(),
            None => return false,
        };

        self.scanning.store(true, Ordering::SeqCst);
        let adapter = self.adapter.clone();
        let scanning = self.scanning.clone();
        spawn(async move {
            if let Err(err) = adapter.start_scan(ScanFilter::default()).await {
                warn!("Starting scan failed: {:?}", err);
                scanning.store(false, Ordering::SeqCst);
                let status = match err {
                    btleplug::Error::PermissionDenied => SCAN_FAILED_PERMISSION,
                    _ => SCAN_FAILED_INTERNAL_ERROR,
                };
                events.scan(ScanEvent::Failed(status));
            }
        });
        true
    }

    fn stop_scan(&mut self) {
        if !self.scanning.swap(false, Ordering::SeqCst) {
            return;
        }

        let adapter = self.adapter.clone();
        spawn(async move {
            if let Err(err) = adapter.stop_scan().await {
                warn!("Stopping scan failed: {:?}", err);
            }
        });
    }
}
