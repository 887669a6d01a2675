use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::channel::mpsc::UnboundedSender;
use indexmap::IndexSet;
use log::{debug, error, info, warn};

use crate::device::constants::SCAN_FAILED_APPLICATION_REGISTRATION_FAILED;
use crate::device::host::{HostRadio, ScanEvent};
use crate::device::timeout::{TimeoutFired, TimeoutKind, TimeoutSupervisor};
use crate::device::types::DiscoveredPeer;
use crate::error::LinkError;

pub type ScanListener = UnboundedSender<Result<DiscoveredPeer, LinkError>>;

#[derive(Debug)]
struct ScanSession {
    listener: ScanListener,
    // in emission order, one entry per address
    emitted: IndexSet<DiscoveredPeer>,
}

#[derive(Debug)]
enum ScanPhase {
    Idle,
    AwaitingPermission { request: u64, listener: ScanListener, duration: Duration },
    Scanning(ScanSession),
}

/// Runs one time-bounded discovery window at a time and emits each sighted address once.
#[derive(Debug)]
pub struct Scanner {
    phase: ScanPhase,
    timeout: TimeoutSupervisor,
    min_rssi: Option<i16>,
    next_request: u64,
    // read by the facade without going through the worker
    scanning: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(timeout: TimeoutSupervisor, min_rssi: Option<i16>, scanning: Arc<AtomicBool>) -> Self {
        Scanner {
            phase: ScanPhase::Idle,
            timeout,
            min_rssi,
            next_request: 0,
            scanning,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.phase, ScanPhase::Idle)
    }

    /// Begins a scan request. Returns the request id to hand to the permission check, or `None`
    /// if the request was rejected because another scan is active and `cancel_existing` is false.
    pub fn request(
        &mut self,
        duration: Duration,
        cancel_existing: bool,
        listener: ScanListener,
        radio: &mut dyn HostRadio,
    ) -> Option<u64> {
        if self.is_active() {
            if !cancel_existing {
                warn!("Scan requested while another scan is active");
                let _ = listener.unbounded_send(Err(LinkError::AlreadyScanning));
                return None;
            }
            info!("Restarting scan");
            self.stop(radio);
        }

        self.next_request += 1;
        let request = self.next_request;
        self.phase = ScanPhase::AwaitingPermission { request, listener, duration };
        self.scanning.store(true, Ordering::SeqCst);
        Some(request)
    }

    pub fn permission_result(&mut self, request: u64, granted: bool, radio: &mut dyn HostRadio) {
        let (listener, duration) = match std::mem::replace(&mut self.phase, ScanPhase::Idle) {
            ScanPhase::AwaitingPermission { request: pending, listener, duration } if pending == request => {
                (listener, duration)
            },
            other => {
                debug!("Ignoring permission result for abandoned scan request {}", request);
                self.phase = other;
                return;
            },
        };

        if !granted {
            error!("Scan permission denied");
            let _ = listener.unbounded_send(Err(LinkError::PermissionDenied));
            self.finish();
            return;
        }

        if !radio.start_scan() {
            error!("Host refused to start scanning");
            let _ = listener.unbounded_send(Err(LinkError::ScanFailed(SCAN_FAILED_APPLICATION_REGISTRATION_FAILED)));
            self.finish();
            return;
        }

        info!("Scanning for {}", humantime::format_duration(duration));
        self.phase = ScanPhase::Scanning(ScanSession {
            listener,
            emitted: IndexSet::new(),
        });
        self.timeout.arm(TimeoutKind::ScanStop, duration);
    }

    pub fn handle_scan_event(&mut self, event: ScanEvent, radio: &mut dyn HostRadio) {
        let session = match &mut self.phase {
            ScanPhase::Scanning(session) => session,
            _ => {
                debug!("Ignoring scan event outside a scan: {:?}", event);
                return;
            },
        };

        match event {
            ScanEvent::PeerSighted { name, address, rssi } => {
                if address.is_empty() {
                    return;
                }
                if let Some(min_rssi) = self.min_rssi {
                    if rssi < min_rssi {
                        debug!("Dropping weak sighting of {} ({} dBm)", address, rssi);
                        return;
                    }
                }

                let peer = DiscoveredPeer::new(name, address, rssi);
                if session.emitted.contains(&peer) {
                    return;
                }

                debug!("Discovered {} ({})", peer.address, peer.display_name);
                session.emitted.insert(peer.clone());
                if session.listener.unbounded_send(Ok(peer)).is_err() {
                    info!("Scan listener went away, stopping scan");
                    self.stop(radio);
                }
            },
            ScanEvent::BatchComplete => {
                info!("Scan batch complete, {} peers found", session.emitted.len());
                self.stop(radio);
            },
            ScanEvent::Failed(status) => {
                error!("Scan failed with status {}", status);
                let _ = session.listener.unbounded_send(Err(LinkError::ScanFailed(status)));
                self.stop(radio);
            },
        }
    }

    pub fn handle_timeout(&mut self, fired: &TimeoutFired, radio: &mut dyn HostRadio) {
        if !self.timeout.take_fired(fired) {
            debug!("Ignoring stale scan timeout");
            return;
        }

        info!("Scan window elapsed");
        self.stop(radio);
    }

    /// Stops the scan and completes its stream. Does nothing when idle.
    pub fn stop(&mut self, radio: &mut dyn HostRadio) {
        match std::mem::replace(&mut self.phase, ScanPhase::Idle) {
            ScanPhase::Idle => {},
            ScanPhase::AwaitingPermission { request, .. } => {
                debug!("Abandoning scan request {} before permission was granted", request);
            },
            ScanPhase::Scanning(session) => {
                debug!("Stopping scan after {} peers", session.emitted.len());
                radio.stop_scan();
            },
        }
        self.finish();
    }

    fn finish(&mut self) {
        self.timeout.cancel();
        self.phase = ScanPhase::Idle;
        self.scanning.store(false, Ordering::SeqCst);
    }
}
