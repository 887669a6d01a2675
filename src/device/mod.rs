pub mod btle;
pub mod client;
pub mod connection;
pub mod constants;
pub mod host;
pub mod registry;
pub mod scanner;
pub mod timeout;
pub mod types;
pub(crate) mod worker;

pub use client::LinkClient;
pub use host::{AlwaysGranted, HostEvent, HostEventSink, HostRadio, LinkEvent, Permission, PermissionService, ScanEvent};
pub use types::{Channel, ConnectEvent, ConnectionState, DataEvent, DiscoveredPeer, PeerAddress, ServiceTable, SessionHandle};
