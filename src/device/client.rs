use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::channel::mpsc::unbounded;
use futures::channel::oneshot;
use futures::future::ready;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::types::LinkConfig;
use crate::device::connection::ConnectorSnapshot;
use crate::device::host::{HostRadio, PermissionService};
use crate::device::types::{Channel, ConnectEvent, ConnectionState, DataEvent, DiscoveredPeer, PeerAddress};
use crate::device::worker::{link_worker_task, Command, WorkerMessage, WorkerSender};
use crate::error::LinkError;

/// Entry point for callers: scanning, connecting and exchanging data with peripherals.
///
/// Every call becomes a message to the link worker, which is spawned on the current tokio runtime
/// by `new`. Dropping the client stops the worker, which disconnects every peer and closes the
/// radio.
pub struct LinkClient {
    tx: WorkerSender,
    scanning: Arc<AtomicBool>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

fn fail<T: Send + 'static>(err: LinkError) -> BoxStream<'static, Result<T, LinkError>> {
    stream::once(ready(Err(err))).boxed()
}

// Yields the address once the worker acknowledges, or the error it reported instead.
fn ack_stream(address: PeerAddress, rx: oneshot::Receiver<Result<(), LinkError>>) -> BoxStream<'static, Result<PeerAddress, LinkError>> {
    stream::once(async move {
        match rx.await {
            Ok(Ok(())) => Ok(address),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(LinkError::Shutdown),
        }
    }).boxed()
}

impl LinkClient {
    /// Must be called from within a tokio runtime.
    pub fn new(radio: Box<dyn HostRadio>, permissions: Arc<dyn PermissionService>) -> Self {
        LinkClient::with_config(radio, permissions, &LinkConfig::default())
    }

    pub fn with_config(radio: Box<dyn HostRadio>, permissions: Arc<dyn PermissionService>, config: &LinkConfig) -> Self {
        let cancel = CancellationToken::new();
        let scanning = Arc::new(AtomicBool::new(false));
        let (tx, handle) = link_worker_task(cancel.clone(), radio, permissions, config, scanning.clone());

        LinkClient {
            tx,
            scanning,
            cancel,
            worker: Some(handle),
        }
    }

    fn send(&self, command: Command) -> bool {
        match self.tx.unbounded_send(WorkerMessage::Command(command)) {
            Ok(()) => true,
            Err(_) => {
                warn!("Link worker has stopped, dropping request");
                false
            },
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply));
        rx.await.map_err(|_| LinkError::Shutdown)
    }

    /// Initializes the host radio. Returns false if the radio could not be opened.
    pub async fn open_radio(&self) -> bool {
        self.request(|reply| Command::OpenRadio { reply }).await.unwrap_or(false)
    }

    /// Stops scanning, disconnects every peer and releases the host radio.
    pub async fn close_radio(&self) -> Result<(), LinkError> {
        self.request(|reply| Command::CloseRadio { reply }).await
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Scans for `duration`, yielding each peer once. The stream completes when the scan ends.
    ///
    /// Fails with `AlreadyScanning` if a scan is active, unless `cancel_existing` is set, in
    /// which case the active scan is stopped and a new one started.
    pub fn search(&self, duration: Duration, cancel_existing: bool) -> BoxStream<'static, Result<DiscoveredPeer, LinkError>> {
        if !cancel_existing && self.is_scanning() {
            debug!("Rejecting overlapping scan");
            return fail(LinkError::AlreadyScanning);
        }

        let (listener, rx) = unbounded();
        if !self.send(Command::Search { duration, cancel_existing, listener }) {
            return fail(LinkError::Shutdown);
        }
        rx.boxed()
    }

    pub async fn stop_search(&self) -> Result<(), LinkError> {
        self.request(|reply| Command::StopSearch { reply }).await
    }

    /// The lifecycle events of one connection attempt, in the order they happen.
    pub fn connect_events(&self, address: PeerAddress) -> BoxStream<'static, ConnectEvent> {
        let (listener, rx) = unbounded();
        if !self.send(Command::Connect { address, listener }) {
            return stream::once(ready(ConnectEvent::Error(LinkError::Shutdown))).boxed();
        }
        rx.boxed()
    }

    /// Connects and discovers services. Yields `address` once the peer is ready, then completes.
    pub fn connect(&self, address: PeerAddress) -> BoxStream<'static, Result<PeerAddress, LinkError>> {
        let ready_address = address.clone();

        self.connect_events(address)
            .filter_map(move |event| {
                let result = match event {
                    ConnectEvent::ServicesReady => Some(Ok(ready_address.clone())),
                    ConnectEvent::Error(err) => Some(Err(err)),
                    ConnectEvent::Connected | ConnectEvent::Disconnected => None,
                };
                ready(result)
            })
            .take(1)
            .boxed()
    }

    pub async fn disconnect(&self, address: PeerAddress) -> Result<(), LinkError> {
        self.request(|reply| Command::Disconnect { address, reply }).await
    }

    pub fn read(&self, address: PeerAddress, channel: Channel) -> BoxStream<'static, Result<Vec<u8>, LinkError>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Read { address, channel, reply });

        stream::once(async move {
            rx.await.unwrap_or(Err(LinkError::Shutdown))
        }).boxed()
    }

    /// Writes `value` and yields `address` once the peer acknowledges the write.
    pub fn write(&self, address: PeerAddress, channel: Channel, value: Vec<u8>) -> BoxStream<'static, Result<PeerAddress, LinkError>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Write { address: address.clone(), channel, value, reply });
        ack_stream(address, rx)
    }

    pub fn set_notification(&self, address: PeerAddress, channel: Channel, enabled: bool) -> BoxStream<'static, Result<PeerAddress, LinkError>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetNotification { address: address.clone(), channel, enabled, reply });
        ack_stream(address, rx)
    }

    /// Enables notifications and yields every value the peer pushes on `channel`.
    ///
    /// The stream does not complete on its own. It ends with `NotConnected` when the link goes
    /// down, and with `NotificationSetupFailed` if notifications could not be enabled.
    pub fn register_notify(&self, address: PeerAddress, channel: Channel) -> BoxStream<'static, Result<Vec<u8>, LinkError>> {
        let (subscriber, rx) = unbounded();
        if !self.send(Command::RegisterNotify { address, channel, subscriber }) {
            return fail(LinkError::Shutdown);
        }
        rx.boxed()
    }

    /// Ends every subscription on `channel` and disables notifications.
    pub fn unregister_notify(&self, address: PeerAddress, channel: Channel) -> BoxStream<'static, Result<PeerAddress, LinkError>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::UnregisterNotify { address: address.clone(), channel, reply });
        ack_stream(address, rx)
    }

    /// Installs the long-lived data listener for `address`, replacing the previous one. It
    /// receives every data event that no read, write or notification setup claimed.
    pub fn data_events(&self, address: PeerAddress) -> BoxStream<'static, DataEvent> {
        let (listener, rx) = unbounded();
        if !self.send(Command::DataEvents { address, listener }) {
            return stream::once(ready(DataEvent::Error(LinkError::Shutdown))).boxed();
        }
        rx.boxed()
    }

    /// Disconnects `address` and forgets it.
    pub async fn clean(&self, address: PeerAddress) -> Result<(), LinkError> {
        self.request(|reply| Command::Clean { address, reply }).await
    }

    pub async fn clean_all(&self) -> Result<(), LinkError> {
        self.request(|reply| Command::CleanAll { reply }).await
    }

    /// The state of the connector for `address`; `Disconnected` if there is none.
    pub async fn state(&self, address: PeerAddress) -> ConnectionState {
        self.request(|reply| Command::State { address, reply })
            .await
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn snapshot(&self, address: PeerAddress) -> Option<ConnectorSnapshot> {
        self.request(|reply| Command::Snapshot { address, reply })
            .await
            .ok()
            .flatten()
    }

    /// Stops the link worker and waits for it to release every session.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();

        if let Some(handle) = self.worker.take() {
            if let Err(err) = handle.await {
                warn!("Link worker did not stop cleanly: {:?}", err);
            }
        }
    }
}

impl Drop for LinkClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
