//! The collaborators the link core consumes: the host radio stack and the permission service.
//!
//! A `HostRadio` accepts or rejects each request synchronously and reports completion later as a
//! `HostEvent` through the `HostEventSink` it was handed in `open_adapter`. Every event lands on
//! the link worker's queue, so radio implementations may deliver from any thread.

use async_trait::async_trait;
use log::warn;
use uuid::Uuid;

use crate::device::types::{Channel, PeerAddress, ServiceTable, SessionHandle};
use crate::device::worker::{WorkerMessage, WorkerSender};

/// Completion events for one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StateChanged { status: i32, connected: bool },
    ServicesDiscovered { status: i32, services: ServiceTable },
    ChannelRead { channel: Channel, status: i32, value: Vec<u8> },
    ChannelWritten { channel: Channel, status: i32 },
    ChannelChanged { channel: Channel, value: Vec<u8> },
    DescriptorWritten { channel: Channel, descriptor: Uuid, status: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    PeerSighted { name: Option<String>, address: PeerAddress, rssi: i16 },
    BatchComplete,
    Failed(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Link { address: PeerAddress, session: SessionHandle, event: LinkEvent },
    Scan(ScanEvent),
}

/// Where a host radio delivers its events. Cheap to clone and usable from any thread.
#[derive(Debug, Clone)]
pub struct HostEventSink {
    tx: WorkerSender,
}

impl HostEventSink {
    pub(crate) fn new(tx: WorkerSender) -> Self {
        HostEventSink { tx }
    }

    pub fn deliver(&self, event: HostEvent) {
        if let Err(err) = self.tx.unbounded_send(WorkerMessage::Host(event)) {
            warn!("Dropping host event, link worker has stopped: {:?}", err.into_inner());
        }
    }

    pub fn link(&self, address: &PeerAddress, session: SessionHandle, event: LinkEvent) {
        self.deliver(HostEvent::Link { address: address.clone(), session, event });
    }

    pub fn scan(&self, event: ScanEvent) {
        self.deliver(HostEvent::Scan(event));
    }
}

/// The host radio/protocol stack.
///
/// Methods returning `bool` report whether the request was accepted; the outcome of an accepted
/// request arrives later as a `HostEvent`. Implementations must not block.
pub trait HostRadio: Send {
    fn open_adapter(&mut self, events: HostEventSink) -> bool;

    fn close_adapter(&mut self);

    /// Starts establishing a link. The result arrives as `LinkEvent::StateChanged`.
    fn establish_link(&mut self, address: &PeerAddress) -> Option<SessionHandle>;

    fn discover_services(&mut self, session: SessionHandle) -> bool;

    fn read_channel(&mut self, session: SessionHandle, channel: &Channel) -> bool;

    fn write_channel(&mut self, session: SessionHandle, channel: &Channel, value: &[u8]) -> bool;

    fn write_descriptor(&mut self, session: SessionHandle, channel: &Channel, descriptor: Uuid, value: &[u8]) -> bool;

    /// Releases the session. No further events are expected for it.
    fn close_session(&mut self, session: SessionHandle);

    fn start_scan(&mut self) -> bool;

    fn stop_scan(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Location access, required by some platforms before scanning.
    Discovery,
}

#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn request(&self, permission: Permission) -> bool;
}

/// Grants everything; for hosts where the operating system gates radio access on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

#[async_trait]
impl PermissionService for AlwaysGranted {
    async fn request(&self, _permission: Permission) -> bool {
        true
    }
}
