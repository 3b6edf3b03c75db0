//! The service value that owns the receive path.

use crate::address::{Ipv4Address, Ipv4Mask};
use crate::assembly::AssembleTable;
use crate::child::Child;
use crate::interface::Interface;
use crate::link::LinkDriver;
use crate::packet::{CastType, Packet};
use crate::wrap::RxWrap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Started,
    Destroying,
}

/// An upper-layer protocol handler the service dispatches to by protocol
/// tag. The handler may hand packets back through
/// [`Ip4Service::demultiplex`], which is how ICMP errors reach interested
/// children.
pub trait UpperHandler: Send + Sync {
    fn handle(&self, service: &mut Ip4Service, packet: Packet);
}

/// A consumer notification waiting for the dispatch pass.
pub(crate) struct Deferred {
    pub(crate) completion: oneshot::Sender<RxWrap>,
    pub(crate) wrap: RxWrap,
}

/// The IPv4 receive path for one host: its interfaces, its children, and
/// the reassembly state for in-flight datagrams.
///
/// There is no global state; the ingress entry point and the timer both
/// take the service by reference. The whole path runs on one logical
/// executor and never suspends. Downstream work happens by re-arming the
/// link receive and by signaling consumer completions, which are queued on
/// the service and drained by [`Ip4Service::dispatch`] before ingress
/// returns to the link layer.
pub struct Ip4Service {
    pub(crate) state: ServiceState,
    /// Whether the underlying link is receiving promiscuously
    pub(crate) promiscuous: bool,
    pub(crate) interfaces: Vec<Interface>,
    pub(crate) children: Vec<Arc<Child>>,
    pub(crate) assemble: AssembleTable,
    pub(crate) deferred: VecDeque<Deferred>,
    pub(crate) link: Arc<dyn LinkDriver>,
    pub(crate) icmp: Option<Arc<dyn UpperHandler>>,
    pub(crate) igmp: Option<Arc<dyn UpperHandler>>,
    transmit_ticker: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Ip4Service {
    pub fn new(link: Arc<dyn LinkDriver>) -> Self {
        Self {
            state: ServiceState::Started,
            promiscuous: false,
            interfaces: Vec::new(),
            children: Vec::new(),
            assemble: AssembleTable::new(),
            deferred: VecDeque::new(),
            link,
            icmp: None,
            igmp: None,
            transmit_ticker: None,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Marks the link as receiving promiscuously; destinations that match
    /// nothing then classify as [`CastType::Promiscuous`] instead of being
    /// dropped.
    pub fn set_promiscuous(&mut self, promiscuous: bool) {
        self.promiscuous = promiscuous;
    }

    /// Registers the handler invoked for finished ICMP datagrams.
    pub fn set_icmp_handler(&mut self, handler: Arc<dyn UpperHandler>) {
        self.icmp = Some(handler);
    }

    /// Registers the handler invoked for finished IGMP datagrams.
    pub fn set_igmp_handler(&mut self, handler: Arc<dyn UpperHandler>) {
        self.igmp = Some(handler);
    }

    /// Registers the transmit-side timeout iterator driven from
    /// [`Ip4Service::packet_timer_tick`]. The transmit path itself lives
    /// with the embedder.
    pub fn set_transmit_ticker(&mut self, ticker: Box<dyn Fn() + Send + Sync>) {
        self.transmit_ticker = Some(ticker);
    }

    /// Adds a configured interface and returns its index.
    pub fn add_interface(
        &mut self,
        addr: Ipv4Address,
        mask: Ipv4Mask,
        promisc_recv: bool,
    ) -> usize {
        self.interfaces.push(Interface::new(addr, mask, promisc_recv));
        self.interfaces.len() - 1
    }

    pub fn interface(&self, index: usize) -> &Interface {
        &self.interfaces[index]
    }

    /// Creates a child attached to the given interface. The child starts
    /// unconfigured and receives nothing until
    /// [`Child::configure`](crate::Child::configure) is called.
    pub fn add_child(&mut self, interface: usize) -> Arc<Child> {
        let child = Child::new();
        self.interfaces[interface].children.push(child.clone());
        self.children.push(child.clone());
        child
    }

    pub fn children(&self) -> impl Iterator<Item = &Arc<Child>> {
        self.children.iter()
    }

    /// The table of in-progress reassemblies.
    pub fn assemble(&self) -> &AssembleTable {
        &self.assemble
    }

    /// Classifies a destination relative to this host as a whole. `None`
    /// means the packet is not for us.
    pub(crate) fn host_cast(&self, dst: Ipv4Address, src: Ipv4Address) -> Option<CastType> {
        // Martian sources: nothing legitimate originates from a broadcast
        // or multicast address
        if src == Ipv4Address::BROADCAST || src.is_multicast() {
            return None;
        }
        if dst == Ipv4Address::BROADCAST {
            return Some(CastType::LocalBroadcast);
        }
        if dst.is_multicast() {
            return Some(CastType::Multicast);
        }
        for interface in self.interfaces.iter().filter(|i| i.is_configured()) {
            if let Some(cast) = interface.net_cast(dst) {
                return Some(cast);
            }
        }
        if self.promiscuous {
            return Some(CastType::Promiscuous);
        }
        None
    }

    /// Ages reassembly entries and queued-but-undelivered packets by one
    /// second, then drives the transmit-side timeout iteration.
    #[tracing::instrument(name = "Ip4Service::packet_timer_tick", skip_all)]
    pub fn packet_timer_tick(&mut self) {
        self.assemble.tick();
        for child in &self.children {
            child.tick();
        }
        if let Some(ticker) = &self.transmit_ticker {
            ticker();
        }
    }

    /// Drains the queued consumer notifications. A consumer that abandoned
    /// its receive token has its wrapper recycled on the spot.
    pub fn dispatch(&mut self) {
        while let Some(deferred) = self.deferred.pop_front() {
            if let Err(wrap) = deferred.completion.send(deferred.wrap) {
                tracing::debug!("receive token abandoned, recycling the delivery");
                drop(wrap);
            }
        }
    }

    /// Begins teardown: the assembly table is emptied and every child is
    /// closed. Frames still in flight are dropped at ingress from here on.
    pub fn shutdown(&mut self) {
        self.state = ServiceState::Destroying;
        self.assemble.clean();
        self.deferred.clear();
        for child in &self.children {
            child.close();
        }
    }
}
