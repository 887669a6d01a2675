#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use uuid::Uuid;

use ble_link::config::types::LinkConfig;
use ble_link::device::constants::{make_client_characteristic_config_uuid, GATT_SUCCESS};
use ble_link::device::types::{CharacteristicInfo, ServiceInfo};
use ble_link::device::{
    Channel, HostEventSink, HostRadio, LinkClient, LinkEvent, Permission, PermissionService, PeerAddress, ScanEvent,
    ServiceTable, SessionHandle,
};

pub const SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const NOTIFYING: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
pub const PLAIN: Uuid = Uuid::from_u128(0x00002a39_0000_1000_8000_00805f9b34fb);

pub fn notifying_channel() -> Channel {
    Channel::new(SERVICE, NOTIFYING)
}

pub fn plain_channel() -> Channel {
    Channel::new(SERVICE, PLAIN)
}

/// One service with a characteristic that has a CCCD and one that does not.
pub fn services() -> ServiceTable {
    ServiceTable::new(vec![ServiceInfo {
        uuid: SERVICE,
        characteristics: vec![
            CharacteristicInfo { uuid: NOTIFYING, descriptors: vec![make_client_characteristic_config_uuid()] },
            CharacteristicInfo { uuid: PLAIN, descriptors: vec![] },
        ],
    }])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    OpenAdapter,
    CloseAdapter,
    EstablishLink(PeerAddress),
    DiscoverServices(SessionHandle),
    ReadChannel(SessionHandle, Channel),
    WriteChannel(SessionHandle, Channel, Vec<u8>),
    WriteDescriptor(SessionHandle, Channel, Uuid, Vec<u8>),
    CloseSession(SessionHandle),
    StartScan,
    StopScan,
}

#[derive(Debug)]
pub struct RadioState {
    pub sink: Option<HostEventSink>,
    pub calls: Vec<RadioCall>,
    pub accept_open: bool,
    pub accept_link: bool,
    pub accept_discover: bool,
    pub accept_commands: bool,
    pub accept_scan: bool,
    pub next_session: u64,
    pub sessions: HashMap<PeerAddress, SessionHandle>,
}

impl Default for RadioState {
    fn default() -> Self {
        RadioState {
            sink: None,
            calls: Vec::new(),
            accept_open: true,
            accept_link: true,
            accept_discover: true,
            accept_commands: true,
            accept_scan: true,
            next_session: 0,
            sessions: HashMap::new(),
        }
    }
}

/// A host radio that records every call and lets the test deliver host events by hand.
#[derive(Debug, Clone, Default)]
pub struct MockRadio {
    state: Arc<Mutex<RadioState>>,
}

impl MockRadio {
    pub fn with_state<R>(&self, f: impl FnOnce(&mut RadioState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.with_state(|state| state.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|state| state.calls.clear());
    }

    pub fn count(&self, matches: impl Fn(&RadioCall) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    pub fn closed_sessions(&self) -> Vec<SessionHandle> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RadioCall::CloseSession(session) => Some(session),
                _ => None,
            })
            .collect()
    }

    pub fn session(&self, address: &str) -> SessionHandle {
        self.with_state(|state| state.sessions[&PeerAddress::from(address)])
    }

    fn sink(&self) -> HostEventSink {
        self.with_state(|state| state.sink.clone()).expect("radio was not opened")
    }

    pub fn link_event(&self, address: &str, event: LinkEvent) {
        let session = self.session(address);
        self.sink().link(&PeerAddress::from(address), session, event);
    }

    pub fn scan_event(&self, event: ScanEvent) {
        self.sink().scan(event);
    }

    pub fn sighting(&self, address: &str, rssi: i16) {
        self.scan_event(ScanEvent::PeerSighted { name: Some(format!("peer {}", address)), address: address.into(), rssi });
    }

    fn record(&self, call: RadioCall) {
        self.with_state(|state| state.calls.push(call));
    }
}

impl HostRadio for MockRadio {
    fn open_adapter(&mut self, events: HostEventSink) -> bool {
        self.record(RadioCall::OpenAdapter);
        self.with_state(|state| {
            if state.accept_open {
                state.sink = Some(events);
            }
            state.accept_open
        })
    }

    fn close_adapter(&mut self) {
        self.record(RadioCall::CloseAdapter);
        self.with_state(|state| state.sink = None);
    }

    fn establish_link(&mut self, address: &PeerAddress) -> Option<SessionHandle> {
        self.record(RadioCall::EstablishLink(address.clone()));
        self.with_state(|state| {
            if !state.accept_link {
                return None;
            }
            state.next_session += 1;
            let session = SessionHandle(state.next_session);
            state.sessions.insert(address.clone(), session);
            Some(session)
        })
    }

    fn discover_services(&mut self, session: SessionHandle) -> bool {
        self.record(RadioCall::DiscoverServices(session));
        self.with_state(|state| state.accept_discover)
    }

    fn read_channel(&mut self, session: SessionHandle, channel: &Channel) -> bool {
        self.record(RadioCall::ReadChannel(session, *channel));
        self.with_state(|state| state.accept_commands)
    }

    fn write_channel(&mut self, session: SessionHandle, channel: &Channel, value: &[u8]) -> bool {
        self.record(RadioCall::WriteChannel(session, *channel, value.to_vec()));
        self.with_state(|state| state.accept_commands)
    }

    fn write_descriptor(&mut self, session: SessionHandle, channel: &Channel, descriptor: Uuid, value: &[u8]) -> bool {
        self.record(RadioCall::WriteDescriptor(session, *channel, descriptor, value.to_vec()));
        self.with_state(|state| state.accept_commands)
    }

    fn close_session(&mut self, session: SessionHandle) {
        self.record(RadioCall::CloseSession(session));
    }

    fn start_scan(&mut self) -> bool {
        self.record(RadioCall::StartScan);
        self.with_state(|state| state.accept_scan)
    }

    fn stop_scan(&mut self) {
        self.record(RadioCall::StopScan);
    }
}

#[derive(Debug)]
pub struct ScriptedPermissions {
    pub granted: AtomicBool,
    pub requests: AtomicUsize,
}

impl ScriptedPermissions {
    pub fn new(granted: bool) -> Arc<Self> {
        Arc::new(ScriptedPermissions {
            granted: AtomicBool::new(granted),
            requests: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionService for ScriptedPermissions {
    async fn request(&self, _permission: Permission) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.granted.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub client: LinkClient,
    pub radio: MockRadio,
    pub permissions: Arc<ScriptedPermissions>,
}

impl Harness {
    pub async fn new() -> Self {
        Harness::with_config(&LinkConfig::default()).await
    }

    pub async fn with_config(config: &LinkConfig) -> Self {
        let radio = MockRadio::default();
        let permissions = ScriptedPermissions::new(true);
        let client = LinkClient::with_config(Box::new(radio.clone()), permissions.clone(), config);
        assert!(client.open_radio().await);

        Harness { client, radio, permissions }
    }

    /// Waits until the worker has handled everything queued so far, including messages posted
    /// by tasks that were already runnable.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.client.state(PeerAddress::from("")).await;
    }

    /// Connects `address` and drives the host through link setup and service discovery.
    pub async fn ready(&self, address: &str) {
        let mut connect = self.client.connect(address.into());
        self.settle().await;
        self.radio.link_event(address, LinkEvent::StateChanged { status: GATT_SUCCESS, connected: true });
        self.settle().await;
        self.radio.link_event(address, LinkEvent::ServicesDiscovered { status: GATT_SUCCESS, services: services() });
        assert_eq!(connect.next().await, Some(Ok(PeerAddress::from(address))));
    }
}

/// Next item of `stream`, or `None` if nothing arrives within a minute of virtual time.
pub async fn next_within<T>(stream: &mut BoxStream<'static, T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(60), stream.next()).await.ok().flatten()
}
