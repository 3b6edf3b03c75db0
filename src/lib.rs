//! The receive path of a host-side IPv4 stack: validation of arriving
//! datagrams, fragment reassembly, and demultiplexing to in-process
//! consumers.
//!
//! # Organization
//!
//! - [`PacketBuf`] is the shared-fragment byte buffer the whole path moves
//!   packets around in; [`Packet`] pairs a buffer with its parsed
//!   [`Ipv4Header`] and per-packet [`ClipInfo`] metadata.
//! - [`AssembleTable`] holds in-progress datagrams and merges out-of-order,
//!   overlapping, and duplicated fragments.
//! - [`Child`] is one registered consumer: a filter over protocol and cast
//!   type, a queue of matched packets, and pending receive tokens.
//! - [`Ip4Service`] owns all of the above and exposes the entry points the
//!   embedder drives: [`Ip4Service::accept_frame`] from the link layer,
//!   [`Ip4Service::packet_timer_tick`] from a one-second clock, and
//!   [`Ip4Service::demultiplex`] for handlers feeding datagrams back in.
//!
//! # Flow
//!
//! A raw frame is validated and classified, reassembled if it is a
//! fragment, and then fanned out in two passes: shared copies onto the
//! queues of every accepting child, then one exclusive wrapper per child
//! with a pending receive. A consumer gets each datagram as an [`RxWrap`]
//! and hands the bytes back by recycling (or simply dropping) the wrapper.

pub mod address;
pub mod assembly;
pub mod buf;
pub mod checksum;
pub mod child;
mod demux;
pub mod header;
mod ingress;
pub mod interface;
pub mod link;
pub mod options;
pub mod packet;
pub mod service;
pub mod wrap;

pub use address::Ipv4Address;
pub use assembly::AssembleTable;
pub use buf::PacketBuf;
pub use child::{Child, ChildConfig, ChildState, EnqueueError, ReceiveTimeout};
pub use demux::DemuxError;
pub use header::Ipv4Header;
pub use link::{LinkDriver, LinkError, LinkFlags};
pub use packet::{CastType, ClipInfo, Packet, RxStatus};
pub use service::{Ip4Service, ServiceState, UpperHandler};
pub use wrap::RxWrap;

use std::hash::BuildHasherDefault;
pub(crate) type FxDashSet<T> = dashmap::DashSet<T, BuildHasherDefault<rustc_hash::FxHasher>>;
