//! The single task that owns every connector, the scanner and the host radio.
//!
//! Facade calls, host events, timeouts and permission results all arrive as `WorkerMessage`s on
//! one queue and are applied one at a time, so no link state is ever touched concurrently.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::types::LinkConfig;
use crate::device::connection::{AckReply, ConnectorSnapshot, LinkTimeouts, NotifySubscriber, ReadReply};
use crate::device::host::{HostEvent, HostEventSink, HostRadio, Permission, PermissionService};
use crate::device::registry::Registry;
use crate::device::scanner::{ScanListener, Scanner};
use crate::device::timeout::{TimeoutFired, TimeoutOwner, TimeoutSupervisor};
use crate::device::types::{Channel, ConnectEvent, ConnectionState, DataEvent, PeerAddress};
use crate::error::LinkError;

pub(crate) type WorkerSender = UnboundedSender<WorkerMessage>;

#[derive(Debug)]
pub(crate) enum Command {
    OpenRadio { reply: oneshot::Sender<bool> },
    CloseRadio { reply: oneshot::Sender<()> },
    Search { duration: Duration, cancel_existing: bool, listener: ScanListener },
    StopSearch { reply: oneshot::Sender<()> },
    Connect { address: PeerAddress, listener: UnboundedSender<ConnectEvent> },
    Disconnect { address: PeerAddress, reply: oneshot::Sender<()> },
    Read { address: PeerAddress, channel: Channel, reply: ReadReply },
    Write { address: PeerAddress, channel: Channel, value: Vec<u8>, reply: AckReply },
    SetNotification { address: PeerAddress, channel: Channel, enabled: bool, reply: AckReply },
    RegisterNotify { address: PeerAddress, channel: Channel, subscriber: NotifySubscriber },
    UnregisterNotify { address: PeerAddress, channel: Channel, reply: AckReply },
    DataEvents { address: PeerAddress, listener: UnboundedSender<DataEvent> },
    Clean { address: PeerAddress, reply: oneshot::Sender<()> },
    CleanAll { reply: oneshot::Sender<()> },
    State { address: PeerAddress, reply: oneshot::Sender<ConnectionState> },
    Snapshot { address: PeerAddress, reply: oneshot::Sender<Option<ConnectorSnapshot>> },
}

#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Command(Command),
    Host(HostEvent),
    Timeout(TimeoutFired),
    PermissionResult { request: u64, granted: bool },
}

struct LinkWorker {
    radio: Box<dyn HostRadio>,
    radio_open: bool,
    permissions: Arc<dyn PermissionService>,
    registry: Registry,
    scanner: Scanner,
    tx: WorkerSender,
}

impl LinkWorker {
    fn handle(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Command(command) => self.handle_command(command),
            WorkerMessage::Host(event) => self.handle_host_event(event),
            WorkerMessage::Timeout(fired) => self.handle_timeout(fired),
            WorkerMessage::PermissionResult { request, granted } => {
                self.scanner.permission_result(request, granted, self.radio.as_mut());
            },
        }
    }

    fn handle_command(&mut self, command: Command) {
        let radio = self.radio.as_mut();

        match command {
            Command::OpenRadio { reply } => {
                if !self.radio_open {
                    self.radio_open = radio.open_adapter(HostEventSink::new(self.tx.clone()));
                    if self.radio_open {
                        info!("Radio opened");
                    } else {
                        error!("Failed to open the radio");
                    }
                }
                let _ = reply.send(self.radio_open);
            },
            Command::CloseRadio { reply } => {
                if self.radio_open {
                    self.scanner.stop(radio);
                    for connector in self.registry.iter_mut() {
                        connector.disconnect(radio);
                    }
                    radio.close_adapter();
                    self.radio_open = false;
                    info!("Radio closed");
                }
                let _ = reply.send(());
            },
            Command::Search { duration, cancel_existing, listener } => {
                if !self.radio_open {
                    warn!("Scan requested while the radio is closed");
                    let _ = listener.unbounded_send(Err(LinkError::AdapterUnavailable));
                    return;
                }

                if let Some(request) = self.scanner.request(duration, cancel_existing, listener, radio) {
                    let permissions = self.permissions.clone();
                    let tx = self.tx.clone();
                    // the answer may take a user prompt; keep serving other messages meanwhile
                    spawn(async move {
                        let granted = permissions.request(Permission::Discovery).await;
                        if tx.unbounded_send(WorkerMessage::PermissionResult { request, granted }).is_err() {
                            debug!("Permission result arrived after the link worker stopped");
                        }
                    });
                }
            },
            Command::StopSearch { reply } => {
                self.scanner.stop(radio);
                let _ = reply.send(());
            },
            Command::Connect { address, listener } => {
                if !self.radio_open {
                    warn!("Connect to {} requested while the radio is closed", address);
                    let _ = listener.unbounded_send(ConnectEvent::Error(LinkError::AdapterUnavailable));
                    return;
                }
                self.registry.get_or_create(&address).connect(listener, radio);
            },
            Command::Disconnect { address, reply } => {
                if let Some(connector) = self.registry.get_mut(&address) {
                    connector.disconnect(radio);
                }
                let _ = reply.send(());
            },
            Command::Read { address, channel, reply } => match self.registry.get_mut(&address) {
                Some(connector) => connector.read(channel, reply, radio),
                None => {
                    let _ = reply.send(Err(LinkError::NotConnected));
                },
            },
            Command::Write { address, channel, value, reply } => match self.registry.get_mut(&address) {
                Some(connector) => connector.write(channel, &value, reply, radio),
                None => {
                    let _ = reply.send(Err(LinkError::NotConnected));
                },
            },
            Command::SetNotification { address, channel, enabled, reply } => match self.registry.get_mut(&address) {
                Some(connector) => connector.set_notification(channel, enabled, reply, radio),
                None => {
                    let _ = reply.send(Err(LinkError::NotConnected));
                },
            },
            Command::RegisterNotify { address, channel, subscriber } => match self.registry.get_mut(&address) {
                Some(connector) => connector.register_notify(channel, subscriber, radio),
                None => {
                    let _ = subscriber.unbounded_send(Err(LinkError::NotConnected));
                },
            },
            Command::UnregisterNotify { address, channel, reply } => match self.registry.get_mut(&address) {
                Some(connector) => connector.unregister_notify(channel, reply, radio),
                None => {
                    let _ = reply.send(Err(LinkError::NotConnected));
                },
            },
            Command::DataEvents { address, listener } => {
                self.registry.get_or_create(&address).set_data_listener(listener);
            },
            Command::Clean { address, reply } => {
                self.registry.remove(&address, radio);
                let _ = reply.send(());
            },
            Command::CleanAll { reply } => {
                self.registry.remove_all(radio);
                let _ = reply.send(());
            },
            Command::State { address, reply } => {
                let state = self.registry
                    .get(&address)
                    .map(|connector| connector.state())
                    .unwrap_or(ConnectionState::Disconnected);
                let _ = reply.send(state);
            },
            Command::Snapshot { address, reply } => {
                let _ = reply.send(self.registry.get(&address).map(|connector| connector.snapshot()));
            },
        }
    }

    fn handle_host_event(&mut self, event: HostEvent) {
        let radio = self.radio.as_mut();

        match event {
            HostEvent::Link { address, session, event } => match self.registry.get_mut(&address) {
                Some(connector) => connector.handle_link_event(session, event, radio),
                None => debug!("Ignoring link event for unknown peer {}: {:?}", address, event),
            },
            HostEvent::Scan(event) => self.scanner.handle_scan_event(event, radio),
        }
    }

    fn handle_timeout(&mut self, fired: TimeoutFired) {
        let radio = self.radio.as_mut();

        match &fired.owner {
            TimeoutOwner::Connector(address) => match self.registry.get_mut(address) {
                Some(connector) => connector.handle_timeout(&fired, radio),
                None => debug!("Ignoring timeout for evicted peer {}", address),
            },
            TimeoutOwner::Scanner => self.scanner.handle_timeout(&fired, radio),
        }
    }

    fn shutdown(&mut self) {
        let radio = self.radio.as_mut();
        self.scanner.stop(radio);
        self.registry.remove_all(radio);
        if self.radio_open {
            radio.close_adapter();
            self.radio_open = false;
        }
    }
}

/// Spawns the link worker. It runs until `cancel` is cancelled, then disconnects every peer and
/// closes the radio.
pub(crate) fn link_worker_task(
    cancel: CancellationToken,
    radio: Box<dyn HostRadio>,
    permissions: Arc<dyn PermissionService>,
    config: &LinkConfig,
    scanning: Arc<AtomicBool>,
) -> (WorkerSender, JoinHandle<()>) {
    let (tx, mut rx): (WorkerSender, UnboundedReceiver<WorkerMessage>) = unbounded();

    let timeouts = LinkTimeouts {
        connect: config.connect_timeout(),
        discover: config.discover_timeout(),
    };
    let mut worker = LinkWorker {
        radio,
        radio_open: false,
        permissions,
        registry: Registry::new(tx.clone(), timeouts),
        scanner: Scanner::new(TimeoutSupervisor::new(TimeoutOwner::Scanner, tx.clone()), config.min_rssi, scanning),
        tx: tx.clone(),
    };

    let handle = spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(message) = rx.next() => {
                    worker.handle(message);
                },
            }
        }

        info!("Link worker stopping");
        worker.shutdown();
    });

    (tx, handle)
}
