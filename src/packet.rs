//! Received packets and their side-band metadata.

use crate::buf::PacketBuf;
use crate::header::Ipv4Header;
use crate::link::LinkFlags;

/// How a destination address classified relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastType {
    /// Unicast to one of our configured addresses
    LocalHost,
    /// The directed broadcast of a configured subnet
    SubnetBroadcast,
    /// The limited broadcast address 255.255.255.255
    LocalBroadcast,
    /// A class-D group address
    Multicast,
    /// Not for us, visible only because the link receives promiscuously
    Promiscuous,
}

impl CastType {
    /// Whether the cast is one of the broadcast flavors.
    pub fn is_broadcast(self) -> bool {
        matches!(self, CastType::LocalBroadcast | CastType::SubnetBroadcast)
    }
}

/// The terminal delivery status a consumer observes for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStatus {
    Success,
    /// Set by the ICMP handler before it re-demultiplexes an ICMP error
    IcmpError,
}

/// Per-packet metadata carried beside the buffer, never on the wire.
#[derive(Debug, Clone)]
pub struct ClipInfo {
    /// First payload byte within the reconstructed datagram
    pub start: u32,
    /// One past the last payload byte; `start + length == end`
    pub end: u32,
    /// Payload bytes in this packet
    pub length: u32,
    pub cast: CastType,
    /// Opaque bitmap handed up by the link layer
    pub link_flags: LinkFlags,
    pub status: RxStatus,
    /// Seconds until timer eviction; zero means no timeout
    pub life: u32,
}

/// A received packet: the parsed header, its clip info, and the headless
/// payload. Cloning shares the payload bytes; [`PacketBuf::is_shared`] on the
/// body reports whether another clone is outstanding.
#[derive(Debug, Clone)]
pub struct Packet {
    pub head: Ipv4Header,
    pub clip: ClipInfo,
    pub body: PacketBuf,
}

impl Packet {
    /// Narrows the packet to the byte range `[start, end)` of the
    /// reconstructed datagram, trimming payload from either side.
    pub(crate) fn trim(&mut self, start: u32, end: u32) {
        debug_assert_eq!(self.clip.start + self.clip.length, self.clip.end);
        debug_assert!(self.clip.start < end && start < self.clip.end);

        if self.clip.start < start {
            let cut = start - self.clip.start;
            self.body.trim_front(cut as usize);
            self.clip.start = start;
            self.clip.length -= cut;
        }

        if end < self.clip.end {
            let cut = self.clip.end - end;
            self.body.trim_back(cut as usize);
            self.clip.end = end;
            self.clip.length -= cut;
        }
    }
}
