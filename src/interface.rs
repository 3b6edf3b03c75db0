//! Interfaces: the attachment points between children and the link layer.

use crate::address::{Ipv4Address, Ipv4Mask, Ipv4Net};
use crate::child::Child;
use crate::packet::CastType;
use std::sync::Arc;

/// One configured attachment to the link: a station address, its subnet,
/// and the children receiving through it.
pub struct Interface {
    addr: Ipv4Address,
    mask: Ipv4Mask,
    /// Whether this interface receives frames not addressed to it
    promisc_recv: bool,
    configured: bool,
    pub(crate) children: Vec<Arc<Child>>,
}

impl Interface {
    pub(crate) fn new(addr: Ipv4Address, mask: Ipv4Mask, promisc_recv: bool) -> Self {
        Self {
            addr,
            mask,
            promisc_recv,
            configured: true,
            children: Vec::new(),
        }
    }

    pub fn addr(&self) -> Ipv4Address {
        self.addr
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub(crate) fn promisc_recv(&self) -> bool {
        self.promisc_recv
    }

    /// Classifies a destination against this interface's own net: its
    /// station address or its subnet's directed broadcast.
    pub fn net_cast(&self, dst: Ipv4Address) -> Option<CastType> {
        if self.addr == Ipv4Address::UNSPECIFIED {
            return None;
        }
        if dst == self.addr {
            return Some(CastType::LocalHost);
        }
        if dst == Ipv4Net::new(self.addr, self.mask).broadcast() {
            return Some(CastType::SubnetBroadcast);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface() -> Interface {
        Interface::new(
            Ipv4Address::new([192, 168, 1, 10]),
            Ipv4Mask::from_bitcount(24),
            false,
        )
    }

    #[test]
    fn station_address_is_local_host() {
        assert_eq!(
            iface().net_cast(Ipv4Address::new([192, 168, 1, 10])),
            Some(CastType::LocalHost)
        );
    }

    #[test]
    fn directed_broadcast_is_subnet_broadcast() {
        assert_eq!(
            iface().net_cast(Ipv4Address::new([192, 168, 1, 255])),
            Some(CastType::SubnetBroadcast)
        );
    }

    #[test]
    fn other_hosts_do_not_classify() {
        assert_eq!(iface().net_cast(Ipv4Address::new([192, 168, 1, 11])), None);
        assert_eq!(iface().net_cast(Ipv4Address::new([10, 0, 0, 1])), None);
    }

    #[test]
    fn unnumbered_interface_classifies_nothing() {
        let unnumbered = Interface::new(
            Ipv4Address::UNSPECIFIED,
            Ipv4Mask::from_bitcount(0),
            false,
        );
        assert_eq!(unnumbered.net_cast(Ipv4Address::new([10, 0, 0, 1])), None);
    }
}
