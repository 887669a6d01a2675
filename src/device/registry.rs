use indexmap::IndexMap;
use log::{debug, info};

use crate::device::connection::{Connector, LinkTimeouts};
use crate::device::host::HostRadio;
use crate::device::timeout::{TimeoutOwner, TimeoutSupervisor};
use crate::device::types::PeerAddress;
use crate::device::worker::WorkerSender;

/// The connectors known to the link worker, one per address, in creation order.
#[derive(Debug)]
pub struct Registry {
    connectors: IndexMap<PeerAddress, Connector>,
    tx: WorkerSender,
    timeouts: LinkTimeouts,
}

impl Registry {
    pub(crate) fn new(tx: WorkerSender, timeouts: LinkTimeouts) -> Self {
        Registry {
            connectors: IndexMap::new(),
            tx,
            timeouts,
        }
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&Connector> {
        self.connectors.get(address)
    }

    pub fn get_mut(&mut self, address: &PeerAddress) -> Option<&mut Connector> {
        self.connectors.get_mut(address)
    }

    pub fn get_or_create(&mut self, address: &PeerAddress) -> &mut Connector {
        let tx = &self.tx;
        let timeouts = self.timeouts;
        self.connectors.entry(address.clone()).or_insert_with(|| {
            debug!("Creating connector for {}", address);
            let supervisor = TimeoutSupervisor::new(TimeoutOwner::Connector(address.clone()), tx.clone());
            Connector::new(address.clone(), supervisor, timeouts)
        })
    }

    /// Disconnects the connector for `address`, detaches its listeners and forgets it. Unknown
    /// addresses are ignored.
    pub fn remove(&mut self, address: &PeerAddress, radio: &mut dyn HostRadio) {
        if let Some(mut connector) = self.connectors.shift_remove(address) {
            info!("Removing connector for {}", address);
            connector.disconnect(radio);
            connector.clear_listeners();
        }
    }

    pub fn remove_all(&mut self, radio: &mut dyn HostRadio) {
        if !self.connectors.is_empty() {
            info!("Removing all {} connectors", self.connectors.len());
        }

        for (_, mut connector) in self.connectors.drain(..) {
            connector.disconnect(radio);
            connector.clear_listeners();
        }
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &PeerAddress> {
        self.connectors.keys()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connector> {
        self.connectors.values_mut()
    }
}
