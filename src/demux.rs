//! Two-pass fan-out of a finished datagram to every interested child.

use crate::address::Ipv4Address;
use crate::child::Child;
use crate::interface::Interface;
use crate::packet::{CastType, Packet};
use crate::service::{Deferred, Ip4Service};
use crate::wrap::RxWrap;
use std::sync::Arc;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum DemuxError {
    #[error("no child accepted the datagram")]
    NotFound,
}

impl Ip4Service {
    /// Fans a finished datagram out to the children.
    ///
    /// Delivery runs in two passes. The first enqueues a shared copy of the
    /// packet to every child whose filter accepts it; the second pairs each
    /// child's queue with its pending receive tokens. Splitting the passes
    /// lets the service drop its own reference in between, so when exactly
    /// one consumer wants the packet the bytes are never copied: the lone
    /// queue entry is unshared by the time it is wrapped.
    #[tracing::instrument(name = "Ip4Service::demultiplex", skip_all)]
    pub fn demultiplex(&mut self, packet: Packet) -> Result<(), DemuxError> {
        let mut enqueued = 0;
        for interface in self.interfaces.iter().filter(|i| i.is_configured()) {
            enqueued += interface_enqueue(interface, &packet);
        }
        drop(packet);

        if enqueued == 0 {
            return Err(DemuxError::NotFound);
        }

        let children: Vec<Arc<Child>> = self
            .interfaces
            .iter()
            .filter(|i| i.is_configured())
            .flat_map(|i| i.children.iter().cloned())
            .collect();
        for child in &children {
            self.instance_deliver(child);
        }
        Ok(())
    }

    /// Pairs one child's queued packets with its pending receive tokens,
    /// queueing a completion for each pair. Runs until either side is
    /// empty.
    pub fn instance_deliver(&mut self, child: &Arc<Child>) {
        loop {
            let (mut packet, token) = {
                let mut received = child.received.lock().unwrap();
                let mut tokens = child.rx_tokens.lock().unwrap();
                if received.is_empty() || tokens.is_empty() {
                    return;
                }
                (received.pop_front().unwrap(), tokens.pop_front().unwrap())
            };

            // A shared packet means other children still hold the bytes:
            // this consumer gets its own contiguous copy. The last consumer
            // finds the packet unshared and wraps it in place.
            if packet.body.is_shared() {
                packet.body = packet.body.deep_copy();
            }

            let wrap = RxWrap::new(child, packet);
            self.deferred.push_back(Deferred {
                completion: token.completion,
                wrap,
            });
        }
    }
}

/// Pass 1 for one interface: rescope the cast to the interface and offer
/// the packet to each attached child. Returns how many accepted.
fn interface_enqueue(interface: &Interface, packet: &Packet) -> usize {
    // A datagram for 192.168.1.1 must not reach the children bound to
    // 10.0.0.1 unless they receive promiscuously, so the host-wide cast is
    // reclassified against this interface's net before filtering.
    let local_cast = match packet.clip.cast {
        cast @ (CastType::Multicast | CastType::LocalBroadcast) => Some(cast),
        _ if interface.addr() == Ipv4Address::UNSPECIFIED => Some(CastType::LocalHost),
        _ => interface.net_cast(packet.head.destination).or_else(|| {
            interface
                .promisc_recv()
                .then_some(CastType::Promiscuous)
        }),
    };
    let Some(local_cast) = local_cast else {
        return 0;
    };

    let mut enqueued = 0;
    for child in &interface.children {
        match child.enqueue(packet, local_cast, interface.addr()) {
            Ok(()) => enqueued += 1,
            Err(error) => tracing::trace!(%error, "child passed over"),
        }
    }
    enqueued
}
