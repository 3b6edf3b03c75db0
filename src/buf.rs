//! Byte buffers with efficient operations for the receive path.
//!
//! This module implements the [`PacketBuf`] collection.

use std::{collections::VecDeque, fmt::Display, sync::Arc};

/// A window into an immutable, reference-counted run of bytes.
///
/// Fragments allow packet data to be shared between consumers without
/// copying. The `From` impls let [`PacketBuf`] constructors be polymorphic
/// over common byte sources.
#[derive(Debug, Clone)]
pub struct Fragment {
    start: usize,
    end: usize,
    bytes: Arc<Vec<u8>>,
}

impl Fragment {
    /// Returns a new fragment covering all of the given bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            start: 0,
            end: bytes.len(),
            bytes: Arc::new(bytes),
        }
    }

    /// The visible bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }

    /// The number of visible bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the fragment covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_shared(&self) -> bool {
        Arc::strong_count(&self.bytes) > 1
    }
}

impl PartialEq for Fragment {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice().eq(other.as_slice())
    }
}

impl From<Vec<u8>> for Fragment {
    fn from(vector: Vec<u8>) -> Self {
        Self::new(vector)
    }
}

impl From<&[u8]> for Fragment {
    fn from(slice: &[u8]) -> Self {
        slice.to_vec().into()
    }
}

impl<const N: usize> From<&[u8; N]> for Fragment {
    fn from(array: &[u8; N]) -> Self {
        array.as_slice().into()
    }
}

impl<const N: usize> From<[u8; N]> for Fragment {
    fn from(array: [u8; N]) -> Self {
        array.as_slice().into()
    }
}

/// A byte collection tuned for the needs of a receive path.
///
/// Arriving frames get their headers trimmed off, fragments of one datagram
/// get stitched together without copying, and one finished datagram may be
/// handed to several consumers at once. A packet buffer is a deque of shared
/// [`Fragment`]s, so all of these are cheap: trimming adjusts a window,
/// stitching moves fragments, and sharing bumps a reference count. Whether a
/// buffer is currently shared is observable through [`PacketBuf::is_shared`],
/// which delivery uses to decide between wrapping a packet in place and
/// duplicating it first.
#[derive(Debug, Clone, Default)]
pub struct PacketBuf {
    frags: VecDeque<Fragment>,
    len: usize,
}

impl PacketBuf {
    /// Creates a new buffer with the given content.
    ///
    /// # Examples
    ///
    /// ```
    /// # use ipv4_rx::PacketBuf;
    /// let packet = PacketBuf::new(b"payload");
    /// assert_eq!(packet.len(), 7);
    /// ```
    pub fn new(body: impl Into<Fragment>) -> Self {
        let body = body.into();
        let len = body.len();
        let mut frags = VecDeque::new();
        frags.push_back(body);
        Self { frags, len }
    }

    /// Moves the fragments of `other` to the end of this buffer.
    ///
    /// This is how a reassembled datagram presents its fragment list as one
    /// logically contiguous buffer: no bytes are copied, and dropping the
    /// combined buffer releases every fragment.
    pub fn append(&mut self, other: PacketBuf) {
        self.len += other.len;
        self.frags.extend(other.frags);
    }

    /// Removes the first `len` bytes.
    pub fn trim_front(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len -= len;

        let mut to_remove = len;
        while let Some(head) = self.frags.front_mut() {
            let head_len = head.len();
            if head_len <= to_remove {
                to_remove -= head_len;
                self.frags.pop_front();
            } else {
                head.start += to_remove;
                break;
            }
        }
    }

    /// Removes the last `len` bytes.
    pub fn trim_back(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len -= len;

        let mut to_remove = len;
        while let Some(tail) = self.frags.back_mut() {
            let tail_len = tail.len();
            if tail_len <= to_remove {
                to_remove -= tail_len;
                self.frags.pop_back();
            } else {
                tail.end -= to_remove;
                break;
            }
        }
    }

    /// The number of bytes in the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether any fragment's backing bytes are referenced by another
    /// buffer. The last holder of a fan-out copy sees `false` here and can
    /// be handed the bytes without a copy.
    pub fn is_shared(&self) -> bool {
        self.frags.iter().any(Fragment::is_shared)
    }

    /// Copies the buffer into a single private, contiguous fragment.
    pub fn deep_copy(&self) -> Self {
        Self::new(self.to_vec())
    }

    /// Returns an iterator over the bytes of the entire buffer.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.frags
            .iter()
            .flat_map(|frag| frag.as_slice().iter().copied())
    }

    /// Returns the buffer's fragment table: one slice per backing fragment,
    /// in order.
    pub fn fragments(&self) -> impl Iterator<Item = &[u8]> {
        self.frags.iter().map(Fragment::as_slice)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.iter().collect()
    }
}

impl Display for PacketBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:x} ")?;
        }
        Ok(())
    }
}

impl PartialEq for PacketBuf {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for PacketBuf {}

impl From<Vec<u8>> for PacketBuf {
    fn from(val: Vec<u8>) -> Self {
        PacketBuf::new(val)
    }
}

impl From<&[u8]> for PacketBuf {
    fn from(val: &[u8]) -> Self {
        PacketBuf::new(val)
    }
}

impl<const L: usize> From<[u8; L]> for PacketBuf {
    fn from(val: [u8; L]) -> Self {
        PacketBuf::new(val)
    }
}
