//! Consumers of the receive path and the filter that guards them.
//!
//! A child is one registered receiver: an upper-layer protocol or
//! application that configured its own filter and hands down receive tokens
//! to be completed as matching datagrams arrive.

use crate::address::Ipv4Address;
use crate::header::proto;
use crate::packet::{CastType, Packet};
use crate::wrap::RxWrap;
use crate::FxDashSet;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error as ThisError;
use tokio::sync::oneshot;

/// Offset of the protocol field of the IP header embedded in an ICMP error
/// body: 8 bytes of ICMP header, then 9 bytes into the inner IP header.
const EMBEDDED_PROTOCOL_OFFSET: usize = 17;

/// Destination unreachable, source quench, redirect, time exceeded, and
/// parameter problem are error messages; everything else is informational.
fn icmp_type_is_error(icmp_type: u8) -> bool {
    matches!(icmp_type, 3 | 4 | 5 | 11 | 12)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Unconfigured,
    Configured,
    Destroying,
}

/// How long a packet may sit in a child's receive queue before the timer
/// evicts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveTimeout {
    /// The child never receives; the filter rejects everything. Send-only
    /// children use this to skip the per-child packet copy entirely.
    Disabled,
    /// Queued packets wait indefinitely for a receive token
    Unlimited,
    /// Queued packets are dropped after this many seconds
    After(u32),
}

impl ReceiveTimeout {
    fn life(self) -> u32 {
        match self {
            ReceiveTimeout::Disabled | ReceiveTimeout::Unlimited => 0,
            ReceiveTimeout::After(seconds) => seconds,
        }
    }
}

/// A child's filter parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildConfig {
    pub receive_timeout: ReceiveTimeout,
    /// The protocol this child is interested in
    pub default_protocol: u8,
    pub accept_any_protocol: bool,
    /// Whether ICMP errors for `default_protocol` traffic are wanted
    pub accept_icmp_errors: bool,
    pub accept_broadcast: bool,
    /// Accept everything, filters be damned
    pub accept_promiscuous: bool,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            receive_timeout: ReceiveTimeout::Unlimited,
            default_protocol: 0,
            accept_any_protocol: false,
            accept_icmp_errors: false,
            accept_broadcast: false,
            accept_promiscuous: false,
        }
    }
}

/// A pending receive request supplied by the consumer.
pub(crate) struct RxToken {
    pub(crate) completion: oneshot::Sender<RxWrap>,
}

/// One registered consumer: filter configuration, multicast memberships,
/// the queue of matched-but-undelivered packets, pending receive tokens,
/// and the set of wrappers handed out and not yet recycled.
pub struct Child {
    state: RwLock<ChildState>,
    config: RwLock<ChildConfig>,
    groups: RwLock<FxHashSet<Ipv4Address>>,
    pub(crate) received: Mutex<VecDeque<Packet>>,
    pub(crate) rx_tokens: Mutex<VecDeque<RxToken>>,
    pub(crate) delivered: FxDashSet<u64>,
    pub(crate) next_wrap: AtomicU64,
}

impl Child {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ChildState::Unconfigured),
            config: RwLock::new(ChildConfig::default()),
            groups: RwLock::new(FxHashSet::default()),
            received: Mutex::new(VecDeque::new()),
            rx_tokens: Mutex::new(VecDeque::new()),
            delivered: FxDashSet::default(),
            next_wrap: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ChildState {
        *self.state.read().unwrap()
    }

    pub fn config(&self) -> ChildConfig {
        *self.config.read().unwrap()
    }

    /// Applies the filter configuration and marks the child ready to
    /// receive.
    pub fn configure(&self, config: ChildConfig) {
        *self.config.write().unwrap() = config;
        *self.state.write().unwrap() = ChildState::Configured;
    }

    /// Begins teardown: queued packets are released and pending receive
    /// tokens observe their channel closing. Wrappers already delivered
    /// drain through the recycle path.
    pub fn close(&self) {
        *self.state.write().unwrap() = ChildState::Destroying;
        self.received.lock().unwrap().clear();
        self.rx_tokens.lock().unwrap().clear();
    }

    /// Joins a multicast group.
    pub fn join_group(&self, group: Ipv4Address) {
        self.groups.write().unwrap().insert(group);
    }

    /// Leaves a multicast group.
    pub fn leave_group(&self, group: Ipv4Address) {
        self.groups.write().unwrap().remove(&group);
    }

    /// Queues a receive request. The returned channel completes with the
    /// wrapped datagram once one is delivered to this child.
    pub fn add_rx_token(&self) -> oneshot::Receiver<RxWrap> {
        let (completion, receiver) = oneshot::channel();
        self.rx_tokens
            .lock()
            .unwrap()
            .push_back(RxToken { completion });
        receiver
    }

    /// Packets matched to this child and not yet handed to a receive token.
    pub fn queued(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Wrappers handed to the consumer and not yet recycled.
    pub fn outstanding(&self) -> usize {
        self.delivered.len()
    }

    /// Whether this child wants the packet, evaluated against the cast type
    /// the enclosing interface computed.
    pub(crate) fn acceptable(
        &self,
        packet: &Packet,
        cast: CastType,
        iface_addr: Ipv4Address,
    ) -> bool {
        let config = *self.config.read().unwrap();

        if matches!(config.receive_timeout, ReceiveTimeout::Disabled) {
            return false;
        }

        if config.accept_promiscuous {
            return true;
        }

        // ICMP errors filter on the protocol of the embedded IP header, so
        // a UDP child sees the errors provoked by its own traffic.
        let mut protocol = packet.head.protocol;
        if protocol == proto::ICMP {
            let Some(icmp_type) = packet.body.iter().next() else {
                return false;
            };
            if icmp_type_is_error(icmp_type) {
                if !config.accept_icmp_errors {
                    return false;
                }
                match packet.body.iter().nth(EMBEDDED_PROTOCOL_OFFSET) {
                    Some(embedded) => protocol = embedded,
                    None => return false,
                }
            }
        }

        if !config.accept_any_protocol && protocol != config.default_protocol {
            return false;
        }

        if cast.is_broadcast() {
            return config.accept_broadcast;
        }

        if cast == CastType::Multicast {
            // A child on an unnumbered interface takes all multicast
            if iface_addr == Ipv4Address::UNSPECIFIED {
                return true;
            }
            return self
                .groups
                .read()
                .unwrap()
                .contains(&packet.head.destination);
        }

        true
    }

    /// Enqueues a shared copy of the packet if the filter accepts it. The
    /// copy shares the payload bytes; the queue node is this child's own.
    pub fn enqueue(
        &self,
        packet: &Packet,
        cast: CastType,
        iface_addr: Ipv4Address,
    ) -> Result<(), EnqueueError> {
        if self.state() != ChildState::Configured {
            return Err(EnqueueError::NotStarted);
        }
        if !self.acceptable(packet, cast, iface_addr) {
            return Err(EnqueueError::Rejected);
        }

        let mut clone = packet.clone();
        clone.clip.cast = cast;
        clone.clip.life = self.config.read().unwrap().receive_timeout.life();
        self.received.lock().unwrap().push_back(clone);
        Ok(())
    }

    /// Ages the queued packets by one second. A life of zero means the
    /// packet never times out.
    pub(crate) fn tick(&self) {
        self.received.lock().unwrap().retain_mut(|packet| {
            if packet.clip.life > 0 {
                packet.clip.life -= 1;
                packet.clip.life > 0
            } else {
                true
            }
        });
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The child was consulted before it was configured
    #[error("the child has not been configured")]
    NotStarted,
    /// The child's filter declined the packet
    #[error("the child's filter rejected the packet")]
    Rejected,
}
