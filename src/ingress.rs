//! The ingress entry point: validate, classify, reassemble, dispatch.

use crate::buf::PacketBuf;
use crate::header::{proto, Ipv4Header, MAX_DATAGRAM_OCTETS, MIN_HEADER_OCTETS};
use crate::link::{LinkError, LinkFlags};
use crate::options::options_are_valid;
use crate::packet::{ClipInfo, Packet, RxStatus};
use crate::service::{Ip4Service, ServiceState};

impl Ip4Service {
    /// The link layer's receive completion. Every arriving frame lands
    /// here, and whether it is delivered, buffered for reassembly, or
    /// dropped, the next receive is armed before returning, unless the link
    /// failed or the service is tearing down.
    #[tracing::instrument(name = "Ip4Service::accept_frame", skip_all)]
    pub fn accept_frame(&mut self, completion: Result<PacketBuf, LinkError>, link_flags: LinkFlags) {
        let frame = match completion {
            Ok(frame) if self.state == ServiceState::Started => frame,
            Ok(_) => return,
            Err(error) => {
                tracing::debug!(%error, "link receive failed");
                return;
            }
        };

        if let Some(packet) = self.validate(frame, link_flags) {
            self.dispatch_protocol(packet);
        }

        // Run the consumer notifications queued by delivery before handing
        // control back to the link layer
        self.dispatch();
        self.link.receive_frame();
    }

    /// Header sanity, classification, and the fragment path. `None` means
    /// the frame was dropped or is still reassembling; either way the
    /// caller just re-arms.
    fn validate(&mut self, mut frame: PacketBuf, link_flags: LinkFlags) -> Option<Packet> {
        if frame.len() < MIN_HEADER_OCTETS {
            tracing::debug!("undersized frame");
            return None;
        }

        let head = match Ipv4Header::from_bytes(frame.iter()) {
            Ok(head) => head,
            Err(error) => {
                tracing::debug!(%error, "malformed header");
                return None;
            }
        };
        let header_octets = head.header_octets();
        let total_length = head.total_length as usize;

        // The link may hand up a frame trailer past the datagram; trim it
        // before comparing lengths
        if total_length < frame.len() {
            frame.trim_back(frame.len() - total_length);
        }
        if total_length < header_octets || total_length != frame.len() {
            tracing::debug!(total_length, "total length disagrees with the frame");
            return None;
        }

        let Some(cast) = self.host_cast(head.destination, head.source) else {
            tracing::trace!(destination = %head.destination, "not for us");
            return None;
        };

        let start = head.fragment_start();
        let length = (total_length - header_octets) as u32;
        let end = start + length;
        if end > MAX_DATAGRAM_OCTETS {
            tracing::debug!(end, "reassembled size would exceed the maximum");
            return None;
        }

        if !options_are_valid(&head.options) {
            tracing::debug!("malformed options");
            return None;
        }

        // Strip the header; the packet is headless from here on
        frame.trim_front(header_octets);

        let clip = ClipInfo {
            start,
            end,
            length,
            cast,
            link_flags,
            status: RxStatus::Success,
            life: 0,
        };
        let packet = Packet {
            head,
            clip,
            body: frame,
        };

        // A fragment has MF set or starts past zero
        if packet.head.flags.more_fragments || start != 0 {
            if packet.head.flags.dont_fragment {
                // Fragmented despite DF: a gateway would answer with ICMP,
                // a host just drops
                tracing::debug!("fragment with DF set");
                return None;
            }
            // Every fragment but the last covers a multiple of 8 bytes
            if packet.head.flags.more_fragments && (length == 0 || length % 8 != 0) {
                tracing::debug!(length, "misaligned non-terminal fragment");
                return None;
            }
            return self.assemble.reassemble(packet);
        }

        Some(packet)
    }

    /// Hands a finished datagram to its protocol: ICMP and IGMP to their
    /// registered handlers, everything else to fan-out. Without a handler
    /// registered, ICMP and IGMP fan out like any other protocol.
    fn dispatch_protocol(&mut self, packet: Packet) {
        let handler = match packet.head.protocol {
            proto::ICMP => self.icmp.clone(),
            proto::IGMP => self.igmp.clone(),
            _ => None,
        };
        match handler {
            Some(handler) => handler.handle(self, packet),
            None => {
                if let Err(error) = self.demultiplex(packet) {
                    tracing::debug!(%error, "datagram went undelivered");
                }
            }
        }
    }
}
