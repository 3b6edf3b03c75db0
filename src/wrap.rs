//! The wrapper handed to a consumer for each delivered datagram.

use crate::buf::PacketBuf;
use crate::child::Child;
use crate::header::MIN_HEADER_OCTETS;
use crate::packet::{Packet, RxStatus};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// A delivered datagram: the header as it appeared on the wire, views onto
/// the payload, and a recycle handle.
///
/// The wrapper owns the packet's bytes exclusively. Dropping it, or calling
/// [`RxWrap::recycle`] where that reads better, releases the backing packet
/// and strikes the wrapper from the owning child's delivered set.
pub struct RxWrap {
    id: u64,
    child: Weak<Child>,
    status: RxStatus,
    /// Network byte order, options included
    header: Vec<u8>,
    packet: PacketBuf,
}

impl RxWrap {
    pub(crate) fn new(child: &Arc<Child>, packet: Packet) -> Self {
        debug_assert!(!packet.body.is_shared());
        let id = child.next_wrap.fetch_add(1, Ordering::Relaxed);
        child.delivered.insert(id);
        Self {
            id,
            child: Arc::downgrade(child),
            status: packet.clip.status,
            header: packet.head.to_bytes(),
            packet: packet.body,
        }
    }

    /// The terminal delivery status for this datagram.
    pub fn status(&self) -> RxStatus {
        self.status
    }

    /// The IPv4 header in network byte order, options included.
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// The option bytes of the header; empty when there were none.
    pub fn options(&self) -> &[u8] {
        &self.header[MIN_HEADER_OCTETS..]
    }

    /// The number of payload bytes.
    pub fn data_len(&self) -> usize {
        self.packet.len()
    }

    /// The payload buffer.
    pub fn payload(&self) -> &PacketBuf {
        &self.packet
    }

    /// The payload's fragment table: one slice per backing fragment.
    pub fn fragments(&self) -> impl Iterator<Item = &[u8]> {
        self.packet.fragments()
    }

    /// Returns the wrapper to the receive path.
    pub fn recycle(self) {}
}

impl Drop for RxWrap {
    fn drop(&mut self) {
        if let Some(child) = self.child.upgrade() {
            child.delivered.remove(&self.id);
        }
    }
}
