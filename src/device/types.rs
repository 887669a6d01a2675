use std::fmt;
use std::hash::{Hash, Hasher};
use serde::Serialize;
use uuid::Uuid;

use crate::device::constants::UNKNOWN_DEVICE_NAME;
use crate::error::LinkError;

/// Opaque identifier of a peripheral, usually its MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        PeerAddress(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        PeerAddress::new(address)
    }
}

impl From<String> for PeerAddress {
    fn from(address: String) -> Self {
        PeerAddress(address)
    }
}

/// A peripheral seen during a scan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    pub display_name: String,
    pub address: PeerAddress,
    pub signal_strength: i16,
}

impl DiscoveredPeer {
    pub fn new(display_name: Option<String>, address: PeerAddress, signal_strength: i16) -> Self {
        DiscoveredPeer {
            display_name: display_name.unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()),
            address,
            signal_strength,
        }
    }
}

// Two sightings are the same peer if their addresses match, whatever the name or signal strength.
impl PartialEq for DiscoveredPeer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for DiscoveredPeer {}

impl Hash for DiscoveredPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    DiscoveringServices,
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::DiscoveringServices => "Discovering services",
            ConnectionState::Ready => "Ready",
        };

        write!(f, "{}", result)
    }
}

/// Token for one established link, issued by the host radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// A named data endpoint on a peripheral: a characteristic within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl Channel {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Channel { service, characteristic }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// The services a peripheral reported after discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTable {
    services: Vec<ServiceInfo>,
}

impl ServiceTable {
    pub fn new(services: Vec<ServiceInfo>) -> Self {
        ServiceTable { services }
    }

    pub fn resolve(&self, channel: &Channel) -> Option<&CharacteristicInfo> {
        self.services
            .iter()
            .find(|service| service.uuid == channel.service)?
            .characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == channel.characteristic)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn clear(&mut self) {
        self.services.clear();
    }
}

/// Lifecycle events delivered to a connector's connect-listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectEvent {
    Connected,
    Disconnected,
    ServicesReady,
    Error(LinkError),
}

/// Data events that no in-flight command claimed, delivered to the long-lived data-listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEvent {
    DataRead { channel: Channel, value: Vec<u8> },
    DataChanged { channel: Channel, value: Vec<u8> },
    WriteAck { channel: Channel, status: i32 },
    DescriptorAck { channel: Channel, descriptor: Uuid, status: i32 },
    Error(LinkError),
}
