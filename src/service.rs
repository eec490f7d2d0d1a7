//! The registry of transport services ports can bind to.
//!
//! A service is one transport factory on one local address for one variant,
//! e.g. the TCP4 stack of a network adapter. Binding a socket attaches a port
//! to every service matching its variant and address.

use crate::{
    address::Variant,
    id::{IdCounter, PortId, ServiceId},
    layer::LayerState,
    socket::SocketState,
    transport::{Transport, TransportFactory},
    SocketError,
};
use rustc_hash::FxHashMap;
use std::net::IpAddr;

pub(crate) struct Service {
    pub name: String,
    pub address: IpAddr,
    pub variant: Variant,
    pub factory: Box<dyn TransportFactory>,
    pub ports: Vec<PortId>,
    /// Removal was requested; the service goes once its ports are released.
    pub retiring: bool,
}

/// A description of a registered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub name: String,
    pub address: IpAddr,
    pub variant: Variant,
    /// Ports currently attached.
    pub ports: usize,
    pub retiring: bool,
}

#[derive(Default)]
pub(crate) struct ServiceRegistry {
    services: FxHashMap<ServiceId, Service>,
    /// Registration order, which is the order ports are attached in.
    order: Vec<ServiceId>,
    ids: IdCounter,
}

impl ServiceRegistry {
    pub fn register(
        &mut self,
        name: impl Into<String>,
        address: IpAddr,
        variant: Variant,
        factory: Box<dyn TransportFactory>,
    ) -> ServiceId {
        let id = ServiceId::new(self.ids.next());
        let service = Service {
            name: name.into(),
            address,
            variant,
            factory,
            ports: Vec::new(),
            retiring: false,
        };
        tracing::info!(target: "SERVICE", service = %id, name = %service.name, address = %address, variant = ?variant, "registered");
        self.services.insert(id, service);
        self.order.push(id);
        id
    }

    /// Services a socket of `variant` bound to `ip` attaches to. The
    /// unspecified address matches every service of the variant.
    pub fn matching(&self, variant: Variant, ip: IpAddr) -> Vec<ServiceId> {
        self.order
            .iter()
            .copied()
            .filter(|id| {
                self.services.get(id).is_some_and(|service| {
                    !service.retiring
                        && service.variant == variant
                        && (ip.is_unspecified() || service.address == ip)
                })
            })
            .collect()
    }

    pub fn create_transport(&mut self, id: ServiceId) -> Result<Box<dyn Transport>, SocketError> {
        let service = self
            .services
            .get_mut(&id)
            .filter(|service| !service.retiring)
            .ok_or(SocketError::AddressUnavailable)?;
        service.factory.create().map_err(|e| {
            tracing::warn!(target: "SERVICE", service = %id, error = %e, "transport creation failed");
            SocketError::from(e)
        })
    }

    pub fn attach(&mut self, id: ServiceId, port: PortId) {
        if let Some(service) = self.services.get_mut(&id) {
            service.ports.push(port);
        }
    }

    pub fn detach(&mut self, id: ServiceId, port: PortId) {
        let Some(service) = self.services.get_mut(&id) else {
            return;
        };
        service.ports.retain(|p| *p != port);
        if service.retiring && service.ports.is_empty() {
            self.remove(id);
        }
    }

    /// Marks the service for removal and returns the ports still attached.
    pub fn retire(&mut self, id: ServiceId) -> Option<Vec<PortId>> {
        let service = self.services.get_mut(&id)?;
        service.retiring = true;
        let ports = service.ports.clone();
        if ports.is_empty() {
            self.remove(id);
        }
        Some(ports)
    }

    fn remove(&mut self, id: ServiceId) {
        if self.services.remove(&id).is_some() {
            self.order.retain(|s| *s != id);
            tracing::info!(target: "SERVICE", service = %id, "removed");
        }
    }

    pub fn contains(&self, id: ServiceId) -> bool {
        self.services.contains_key(&id)
    }

    pub fn info(&self) -> Vec<ServiceInfo> {
        self.order
            .iter()
            .filter_map(|id| {
                self.services.get(id).map(|service| ServiceInfo {
                    id: *id,
                    name: service.name.clone(),
                    address: service.address,
                    variant: service.variant,
                    ports: service.ports.len(),
                    retiring: service.retiring,
                })
            })
            .collect()
    }
}

impl LayerState {
    /// Starts removing a service. Its ports close immediately and sockets
    /// racing a connect move on to their next port.
    pub(crate) fn unregister_service(&mut self, id: ServiceId) -> Result<(), SocketError> {
        let ports = self
            .services
            .retire(id)
            .ok_or(SocketError::InvalidArgument)?;
        let mut sockets: Vec<_> = ports
            .iter()
            .filter_map(|pid| self.ports.get(pid).map(|port| port.socket))
            .collect();
        sockets.sort();
        sockets.dedup();
        for pid in ports {
            self.port_abort(pid);
        }
        for fd in sockets {
            let Some(socket) = self.sockets.get(&fd) else {
                continue;
            };
            let state = socket.state;
            let orphaned = !socket.closing && self.live_ports(fd).is_empty();
            match state {
                SocketState::Connecting => self.connect_next(fd),
                SocketState::Bound | SocketState::Listening | SocketState::Connected if orphaned => {
                    if let Some(socket) = self.sockets.get_mut(&fd) {
                        socket.set_state(SocketState::NoPortsAvailable);
                        if let Some(wait) = &socket.accept_wait {
                            wait.notify_waiters();
                        }
                        socket.wake();
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::TransportError, transport::manual::ManualAdapter};
    use std::net::Ipv4Addr;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn registry() -> (ServiceRegistry, ServiceId, ServiceId) {
        let mut registry = ServiceRegistry::default();
        let (a, _) = ManualAdapter::new(LOCAL);
        let (b, _) = ManualAdapter::new(OTHER);
        let first = registry.register("eth0", LOCAL, Variant::Tcp4, Box::new(a));
        let second = registry.register("eth1", OTHER, Variant::Tcp4, Box::new(b));
        (registry, first, second)
    }

    #[test]
    fn unspecified_matches_every_service_in_order() {
        let (registry, first, second) = registry();
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        assert_eq!(registry.matching(Variant::Tcp4, any), vec![first, second]);
        assert_eq!(registry.matching(Variant::Tcp4, OTHER), vec![second]);
        assert!(registry.matching(Variant::Udp4, any).is_empty());
    }

    #[test]
    fn retired_service_lingers_until_ports_detach() {
        let (mut registry, first, _) = registry();
        let port = PortId::new(7);
        registry.attach(first, port);
        assert_eq!(registry.retire(first), Some(vec![port]));
        assert!(registry.contains(first));
        assert!(registry.matching(Variant::Tcp4, LOCAL).is_empty());
        registry.detach(first, port);
        assert!(!registry.contains(first));
        assert_eq!(registry.info().len(), 1);
    }

    #[test]
    fn factory_failure_is_reported() {
        let mut registry = ServiceRegistry::default();
        let (adapter, handle) = ManualAdapter::new(LOCAL);
        let id = registry.register("eth0", LOCAL, Variant::Udp4, Box::new(adapter));
        handle.fail_create(Some(TransportError::OutOfResources));
        assert_eq!(
            registry.create_transport(id).err(),
            Some(SocketError::ResourceExhausted)
        );
    }
}
