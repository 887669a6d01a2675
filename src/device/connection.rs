use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use futures::channel::mpsc::UnboundedSender;
use futures::channel::oneshot;
use log::{debug, error, info, warn};

use crate::device::constants::{
    make_client_characteristic_config_uuid, DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE, GATT_FAILURE,
    GATT_SUCCESS,
};
use crate::device::host::{HostRadio, LinkEvent};
use crate::device::timeout::{TimeoutFired, TimeoutKind, TimeoutSupervisor};
use crate::device::types::{Channel, ConnectEvent, ConnectionState, DataEvent, PeerAddress, ServiceTable, SessionHandle};
use crate::error::LinkError;

static NEXT_CONNECTOR_ID: AtomicU64 = AtomicU64::new(1);

pub type ReadReply = oneshot::Sender<Result<Vec<u8>, LinkError>>;
pub type AckReply = oneshot::Sender<Result<(), LinkError>>;
pub type NotifySubscriber = UnboundedSender<Result<Vec<u8>, LinkError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimeouts {
    pub connect: Duration,
    pub discover: Duration,
}

/// One-shot completion slots for in-flight commands, queued per channel in issue order.
#[derive(Debug)]
struct WaiterQueue<W> {
    waiters: HashMap<Channel, VecDeque<W>>,
}

impl<W> WaiterQueue<W> {
    fn new() -> Self {
        WaiterQueue { waiters: HashMap::new() }
    }

    fn push(&mut self, channel: Channel, waiter: W) {
        self.waiters.entry(channel).or_default().push_back(waiter);
    }

    fn pop(&mut self, channel: &Channel) -> Option<W> {
        let queue = self.waiters.get_mut(channel)?;
        let waiter = queue.pop_front();
        if queue.is_empty() {
            self.waiters.remove(channel);
        }
        waiter
    }

    fn drain(&mut self) -> Vec<W> {
        self.waiters.drain().flat_map(|(_, queue)| queue).collect()
    }
}

/// A pending CCCD write. A one-shot request carries `reply`; a `register_notify` carries the
/// subscriber it was made for, and a failure only ever ends that subscriber.
#[derive(Debug)]
struct NotifySetup {
    enabled: bool,
    reply: Option<AckReply>,
    subscriber: Option<NotifySubscriber>,
}

/// Point-in-time view of a connector, for status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSnapshot {
    pub address: PeerAddress,
    pub state: ConnectionState,
    pub has_session: bool,
    pub armed_timeout: Option<TimeoutKind>,
    pub last_connect: Option<Instant>,
    pub last_disconnect: Option<Instant>,
}

/// Lifecycle of the link to one peer.
///
/// A connector is only ever touched by the link worker, so its methods take `&mut self` and the
/// host radio by reference instead of locking anything.
#[derive(Debug)]
pub struct Connector {
    id: u64,
    address: PeerAddress,
    state: ConnectionState,
    session: Option<SessionHandle>,
    connect_listener: Option<UnboundedSender<ConnectEvent>>,
    data_listener: Option<UnboundedSender<DataEvent>>,
    subscriptions: HashMap<Channel, Vec<NotifySubscriber>>,
    reads: WaiterQueue<ReadReply>,
    writes: WaiterQueue<AckReply>,
    descriptor_writes: WaiterQueue<NotifySetup>,
    services: ServiceTable,
    services_started: bool,
    timeout: TimeoutSupervisor,
    timeouts: LinkTimeouts,
    last_connect: Option<Instant>,
    last_disconnect: Option<Instant>,
}

fn send_event<T>(listener: &mut Option<UnboundedSender<T>>, event: T) {
    if let Some(sender) = listener {
        if sender.unbounded_send(event).is_err() {
            debug!("Listener went away, dropping it");
            *listener = None;
        }
    }
}

impl Connector {
    pub fn new(address: PeerAddress, timeout: TimeoutSupervisor, timeouts: LinkTimeouts) -> Self {
        Connector {
            id: NEXT_CONNECTOR_ID.fetch_add(1, Ordering::Relaxed),
            address,
            state: ConnectionState::Disconnected,
            session: None,
            connect_listener: None,
            data_listener: None,
            subscriptions: HashMap::new(),
            reads: WaiterQueue::new(),
            writes: WaiterQueue::new(),
            descriptor_writes: WaiterQueue::new(),
            services: ServiceTable::default(),
            services_started: false,
            timeout,
            timeouts,
            last_connect: None,
            last_disconnect: None,
        }
    }

    /// Identifies this instance; a connector created later for the same address gets a new id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> Option<SessionHandle> {
        self.session
    }

    pub fn snapshot(&self) -> ConnectorSnapshot {
        ConnectorSnapshot {
            address: self.address.clone(),
            state: self.state,
            has_session: self.session.is_some(),
            armed_timeout: self.timeout.armed(),
            last_connect: self.last_connect,
            last_disconnect: self.last_disconnect,
        }
    }

    pub fn set_data_listener(&mut self, listener: UnboundedSender<DataEvent>) {
        self.data_listener = Some(listener);
    }

    pub fn clear_listeners(&mut self) {
        self.connect_listener = None;
        self.data_listener = None;
        self.subscriptions.clear();
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("{}: {} -> {}", self.address, self.state, state);
            self.state = state;
        }
    }

    fn report(&mut self, event: ConnectEvent) {
        if let ConnectEvent::Error(err) = &event {
            error!("{}: {}", self.address, err);
        }
        send_event(&mut self.connect_listener, event);
    }

    fn notify_data(&mut self, event: DataEvent) {
        send_event(&mut self.data_listener, event);
    }

    pub fn connect(&mut self, listener: UnboundedSender<ConnectEvent>, radio: &mut dyn HostRadio) {
        // the current attempt keeps its listener; only the caller of this attempt hears about the rejection
        if self.state != ConnectionState::Disconnected {
            warn!("{}: connect rejected, state is {}", self.address, self.state);
            let _ = listener.unbounded_send(ConnectEvent::Error(LinkError::AlreadyConnecting));
            return;
        }

        let session = match radio.establish_link(&self.address) {
            Some(session) => session,
            None => {
                error!("{}: host refused to establish a link", self.address);
                let _ = listener.unbounded_send(ConnectEvent::Error(LinkError::AdapterUnavailable));
                return;
            },
        };

        info!("{}: connecting", self.address);
        self.connect_listener = Some(listener);
        self.session = Some(session);
        self.services_started = false;
        self.last_connect = Some(Instant::now());
        self.set_state(ConnectionState::Connecting);
        self.timeout.arm(TimeoutKind::Connect, self.timeouts.connect);
    }

    /// Disconnects and releases the session. Calling this while disconnected does nothing.
    pub fn disconnect(&mut self, radio: &mut dyn HostRadio) {
        if self.state == ConnectionState::Disconnected && self.session.is_none() {
            debug!("{}: already disconnected", self.address);
            return;
        }

        if !self.services_started {
            self.report(ConnectEvent::Error(LinkError::PrematureDisconnect));
        }
        self.teardown(radio);
    }

    // Every path to Disconnected goes through here, so the session is always closed.
    fn teardown(&mut self, radio: &mut dyn HostRadio) {
        self.timeout.cancel();

        if let Some(session) = self.session.take() {
            debug!("{}: closing session {:?}", self.address, session);
            radio.close_session(session);
        }

        let previous = self.state;
        self.set_state(ConnectionState::Disconnected);
        self.last_disconnect = Some(Instant::now());
        self.services.clear();
        self.services_started = false;

        for reply in self.reads.drain() {
            let _ = reply.send(Err(LinkError::NotConnected));
        }
        for reply in self.writes.drain() {
            let _ = reply.send(Err(LinkError::NotConnected));
        }
        for setup in self.descriptor_writes.drain() {
            if let Some(reply) = setup.reply {
                let _ = reply.send(Err(LinkError::NotConnected));
            }
        }
        for (_, subscribers) in self.subscriptions.drain() {
            for subscriber in subscribers {
                let _ = subscriber.unbounded_send(Err(LinkError::NotConnected));
            }
        }

        if previous != ConnectionState::Disconnected {
            self.report(ConnectEvent::Disconnected);
        }
    }

    pub fn handle_link_event(&mut self, session: SessionHandle, event: LinkEvent, radio: &mut dyn HostRadio) {
        if self.session != Some(session) {
            debug!("{}: ignoring event for released session {:?}: {:?}", self.address, session, event);
            return;
        }

        match event {
            LinkEvent::StateChanged { status, connected } => {
                self.on_state_changed(session, status, connected, radio);
            },
            LinkEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, services, radio);
            },
            LinkEvent::ChannelRead { channel, status, value } => {
                match self.reads.pop(&channel) {
                    Some(reply) => {
                        let result = if status == GATT_SUCCESS { Ok(value) } else { Err(LinkError::ReadFailed(status)) };
                        let _ = reply.send(result);
                    },
                    None if status == GATT_SUCCESS => {
                        self.notify_data(DataEvent::DataRead { channel, value });
                    },
                    None => {
                        self.notify_data(DataEvent::Error(LinkError::ReadFailed(status)));
                    },
                }
            },
            LinkEvent::ChannelWritten { channel, status } => {
                match self.writes.pop(&channel) {
                    Some(reply) => {
                        let result = if status == GATT_SUCCESS { Ok(()) } else { Err(LinkError::WriteFailed(status)) };
                        let _ = reply.send(result);
                    },
                    None => self.notify_data(DataEvent::WriteAck { channel, status }),
                }
            },
            LinkEvent::DescriptorWritten { channel, descriptor, status } => {
                let setup = if descriptor == make_client_characteristic_config_uuid() {
                    self.descriptor_writes.pop(&channel)
                } else {
                    None
                };

                match setup {
                    Some(setup) => {
                        let result = if status == GATT_SUCCESS { Ok(()) } else { Err(LinkError::NotificationSetupFailed) };
                        self.finish_notify_setup(channel, setup, result);
                    },
                    None => self.notify_data(DataEvent::DescriptorAck { channel, descriptor, status }),
                }
            },
            LinkEvent::ChannelChanged { channel, value } => {
                if let Some(subscribers) = self.subscriptions.get_mut(&channel) {
                    subscribers.retain(|subscriber| subscriber.unbounded_send(Ok(value.clone())).is_ok());
                    if subscribers.is_empty() {
                        self.subscriptions.remove(&channel);
                    }
                }
                self.notify_data(DataEvent::DataChanged { channel, value });
            },
        }
    }

    fn on_state_changed(&mut self, session: SessionHandle, status: i32, connected: bool, radio: &mut dyn HostRadio) {
        if status != GATT_SUCCESS {
            self.report(ConnectEvent::Error(LinkError::LinkFailure(status)));
            self.teardown(radio);
            return;
        }

        if !connected {
            if !self.services_started {
                self.report(ConnectEvent::Error(LinkError::PrematureDisconnect));
            }
            info!("{}: link dropped by host", self.address);
            self.teardown(radio);
            return;
        }

        if self.state != ConnectionState::Connecting {
            debug!("{}: ignoring repeated connected event in state {}", self.address, self.state);
            return;
        }

        self.timeout.cancel();
        self.set_state(ConnectionState::Connected);
        self.report(ConnectEvent::Connected);

        self.services_started = false;
        if !radio.discover_services(session) {
            self.report(ConnectEvent::Error(LinkError::DiscoverRequestFailed));
            self.teardown(radio);
            return;
        }

        self.set_state(ConnectionState::DiscoveringServices);
        self.timeout.arm(TimeoutKind::Discover, self.timeouts.discover);
    }

    fn on_services_discovered(&mut self, status: i32, services: ServiceTable, radio: &mut dyn HostRadio) {
        if self.state != ConnectionState::DiscoveringServices {
            debug!("{}: ignoring service discovery result in state {}", self.address, self.state);
            return;
        }

        self.timeout.cancel();
        self.services_started = true;

        if status != GATT_SUCCESS {
            self.report(ConnectEvent::Error(LinkError::DiscoverFailure(status)));
            self.teardown(radio);
            return;
        }

        self.services = services;
        self.set_state(ConnectionState::Ready);
        self.report(ConnectEvent::ServicesReady);
    }

    pub fn handle_timeout(&mut self, fired: &TimeoutFired, radio: &mut dyn HostRadio) {
        if !self.timeout.take_fired(fired) {
            debug!("{}: ignoring stale {:?} timeout", self.address, fired.kind);
            return;
        }

        match fired.kind {
            TimeoutKind::Connect if self.state == ConnectionState::Connecting => {
                self.report(ConnectEvent::Error(LinkError::ConnectTimeout));
                self.teardown(radio);
            },
            TimeoutKind::Discover if self.state == ConnectionState::DiscoveringServices && !self.services_started => {
                self.report(ConnectEvent::Error(LinkError::DiscoverTimeout));
                self.teardown(radio);
            },
            kind => debug!("{}: {:?} timeout elapsed in state {}, nothing to do", self.address, kind, self.state),
        }
    }

    fn resolve(&self, channel: &Channel) -> Result<SessionHandle, LinkError> {
        let session = match (self.state, self.session) {
            (ConnectionState::Ready, Some(session)) => session,
            _ => return Err(LinkError::NotConnected),
        };

        match self.services.resolve(channel) {
            Some(_) => Ok(session),
            None => Err(LinkError::ChannelNotFound),
        }
    }

    pub fn read(&mut self, channel: Channel, reply: ReadReply, radio: &mut dyn HostRadio) {
        let session = match self.resolve(&channel) {
            Ok(session) => session,
            Err(err) => {
                warn!("{}: read of {} rejected: {}", self.address, channel, err);
                let _ = reply.send(Err(err));
                return;
            },
        };

        if !radio.read_channel(session, &channel) {
            warn!("{}: host refused to read {}", self.address, channel);
            let _ = reply.send(Err(LinkError::ReadFailed(GATT_FAILURE)));
            return;
        }

        self.reads.push(channel, reply);
    }

    pub fn write(&mut self, channel: Channel, value: &[u8], reply: AckReply, radio: &mut dyn HostRadio) {
        let session = match self.resolve(&channel) {
            Ok(session) => session,
            Err(err) => {
                warn!("{}: write to {} rejected: {}", self.address, channel, err);
                let _ = reply.send(Err(err));
                return;
            },
        };

        debug!("{}: writing {} bytes to {}", self.address, value.len(), channel);
        if !radio.write_channel(session, &channel, value) {
            warn!("{}: host refused to write {}", self.address, channel);
            let _ = reply.send(Err(LinkError::WriteFailed(GATT_FAILURE)));
            return;
        }

        self.writes.push(channel, reply);
    }

    /// Adds a persistent notification subscription and enables notifications on the channel.
    /// If enabling fails, this subscriber receives the error and is dropped. Other subscribers on
    /// the same channel keep their subscription.
    pub fn register_notify(&mut self, channel: Channel, subscriber: NotifySubscriber, radio: &mut dyn HostRadio) {
        if let Err(err) = self.resolve(&channel) {
            warn!("{}: notify registration for {} rejected: {}", self.address, channel, err);
            let _ = subscriber.unbounded_send(Err(err));
            return;
        }

        self.subscriptions.entry(channel).or_default().push(subscriber.clone());
        let setup = NotifySetup { enabled: true, reply: None, subscriber: Some(subscriber) };
        self.request_notification(channel, setup, radio);
    }

    pub fn unregister_notify(&mut self, channel: Channel, reply: AckReply, radio: &mut dyn HostRadio) {
        self.subscriptions.remove(&channel);
        self.set_notification(channel, false, reply, radio);
    }

    /// One-shot change of the notification state. The outcome goes to `reply` only; existing
    /// subscriptions are left alone whatever the result.
    pub fn set_notification(&mut self, channel: Channel, enabled: bool, reply: AckReply, radio: &mut dyn HostRadio) {
        let setup = NotifySetup { enabled, reply: Some(reply), subscriber: None };
        self.request_notification(channel, setup, radio);
    }

    fn request_notification(&mut self, channel: Channel, setup: NotifySetup, radio: &mut dyn HostRadio) {
        let session = match self.resolve(&channel) {
            Ok(session) => session,
            Err(err) => {
                self.finish_notify_setup(channel, setup, Err(err));
                return;
            },
        };

        let cccd = make_client_characteristic_config_uuid();
        let has_cccd = self.services
            .resolve(&channel)
            .map(|characteristic| characteristic.descriptors.contains(&cccd))
            .unwrap_or(false);
        if !has_cccd {
            warn!("{}: {} has no client characteristic configuration descriptor", self.address, channel);
            self.finish_notify_setup(channel, setup, Err(LinkError::NotificationSetupFailed));
            return;
        }

        let enabled = setup.enabled;
        info!("{}: {} notifications on {}", self.address, if enabled { "enabling" } else { "disabling" }, channel);
        let value = if enabled { ENABLE_NOTIFICATION_VALUE } else { DISABLE_NOTIFICATION_VALUE };
        if !radio.write_descriptor(session, &channel, cccd, &value) {
            warn!("{}: host refused to write descriptor of {}", self.address, channel);
            self.finish_notify_setup(channel, setup, Err(LinkError::NotificationSetupFailed));
            return;
        }

        self.descriptor_writes.push(channel, setup);
    }

    fn remove_subscriber(&mut self, channel: &Channel, subscriber: &NotifySubscriber) {
        if let Some(subscribers) = self.subscriptions.get_mut(channel) {
            subscribers.retain(|existing| !existing.same_receiver(subscriber));
            if subscribers.is_empty() {
                self.subscriptions.remove(channel);
            }
        }
    }

    fn finish_notify_setup(&mut self, channel: Channel, setup: NotifySetup, result: Result<(), LinkError>) {
        if let Err(err) = &result {
            error!("{}: notification setup for {} failed: {}", self.address, channel, err);
        }

        match (setup.reply, setup.subscriber, result) {
            (Some(reply), _, result) => {
                let _ = reply.send(result);
            },
            (None, _, Ok(())) => {},
            (None, Some(subscriber), Err(err)) => {
                self.remove_subscriber(&channel, &subscriber);
                if subscriber.unbounded_send(Err(err.clone())).is_err() {
                    self.notify_data(DataEvent::Error(err));
                }
            },
            (None, None, Err(err)) => self.notify_data(DataEvent::Error(err)),
        }
    }
}
