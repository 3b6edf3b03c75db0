//! The seam between the receive path and the link layer beneath it.

use thiserror::Error as ThisError;

/// An opaque bitmap the link layer attaches to each received frame, e.g.
/// "arrived as a link-level multicast". The receive path carries it through
/// to consumers without interpreting it.
pub type LinkFlags = u32;

/// The completion status of a link-layer receive.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("the link-layer receive completed with an error")]
    Io,
}

/// The datagram-receive primitive the embedder supplies.
///
/// The receive path never polls: the driver calls
/// [`Ip4Service::accept_frame`](crate::Ip4Service::accept_frame) with each
/// completed frame, and the service re-arms the next receive through this
/// trait before it returns.
pub trait LinkDriver: Send + Sync {
    /// Arm the next link-layer receive.
    fn receive_frame(&self);
}
