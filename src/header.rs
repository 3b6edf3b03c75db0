//! Parsing and serialization of the [IPv4
//! header](https://datatracker.ietf.org/doc/html/rfc791).

use crate::address::Ipv4Address;
use crate::checksum::Checksum;
use thiserror::Error as ThisError;

/// The number of `u32` words in a minimal IPv4 header
const BASE_WORDS: u8 = 5;
/// The number of bytes in a minimal IPv4 header
pub const MIN_HEADER_OCTETS: usize = BASE_WORDS as usize * 4;
/// The largest header the wire format can express (`ihl` of 15)
pub const MAX_HEADER_OCTETS: usize = 60;
/// The largest total datagram length the wire format can express
pub const MAX_DATAGRAM_OCTETS: u32 = 65535;
/// Bitwise anded with the `u16` containing flags and fragment offset to
/// extract the fragment offset part
const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

/// Protocol numbers the receive path dispatches on.
pub mod proto {
    /// Internet Control Message Protocol
    pub const ICMP: u8 = 1;
    /// Internet Group Management Protocol
    pub const IGMP: u8 = 2;
}

/// The DF and MF bits of the fragment word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ControlFlags {
    /// The datagram must not be fragmented in transit
    pub dont_fragment: bool,
    /// More fragments of this datagram follow
    pub more_fragments: bool,
}

impl ControlFlags {
    fn from_bits(bits: u8) -> Self {
        Self {
            dont_fragment: bits & 0b010 != 0,
            more_fragments: bits & 0b001 != 0,
        }
    }

    fn to_bits(self) -> u8 {
        ((self.dont_fragment as u8) << 1) | self.more_fragments as u8
    }
}

/// An IPv4 header in host byte order, options included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Internet Header Length, the number of `u32` words in the header
    pub ihl: u8,
    /// The type of service byte, carried through unexamined
    pub type_of_service: u8,
    /// The length of the datagram in bytes, header included
    pub total_length: u16,
    /// Assigned by the sender to associate the fragments of one datagram
    pub identification: u16,
    /// The DF and MF control bits
    pub flags: ControlFlags,
    /// Where in the datagram this fragment belongs, in units of 8 bytes
    pub fragment_offset: u16,
    pub time_to_live: u8,
    /// The next level protocol in the data portion of the datagram
    pub protocol: u8,
    /// The header checksum as it appeared on the wire
    pub checksum: u16,
    pub source: Ipv4Address,
    pub destination: Ipv4Address,
    /// Raw option bytes, `(ihl - 5) * 4` of them
    pub options: Vec<u8>,
}

impl Ipv4Header {
    /// Parses a header from a byte iterator, verifying the checksum as the
    /// bytes go by.
    ///
    /// An on-wire checksum field of zero is accepted without verification;
    /// some senders never fill it in. Reserved bits are carried, not
    /// rejected: a receive path takes what the network gives it.
    pub fn from_bytes(mut bytes: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        let mut next =
            || -> Result<u8, ParseError> { bytes.next().ok_or(ParseError::HeaderTooShort) };

        let mut checksum = Checksum::new();

        let version_and_ihl = next()?;
        let version = version_and_ihl >> 4;
        if version != 4 {
            Err(ParseError::IncorrectIpv4Version)?
        }
        let ihl = version_and_ihl & 0b1111;
        if ihl < BASE_WORDS {
            Err(ParseError::InvalidHeaderLength)?
        }
        let type_of_service = next()?;
        checksum.add_u8(version_and_ihl, type_of_service);

        let total_length = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(total_length);

        let identification = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(identification);

        let flags_and_fragment_offset = u16::from_be_bytes([next()?, next()?]);
        let fragment_offset = flags_and_fragment_offset & FRAGMENT_OFFSET_MASK;
        let flags = ControlFlags::from_bits((flags_and_fragment_offset >> 13) as u8);
        checksum.add_u16(flags_and_fragment_offset);

        let time_to_live = next()?;
        let protocol = next()?;
        checksum.add_u8(time_to_live, protocol);

        let expected_checksum = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(expected_checksum);

        let source_bytes = [next()?, next()?, next()?, next()?];
        checksum.add_u8(source_bytes[0], source_bytes[1]);
        checksum.add_u8(source_bytes[2], source_bytes[3]);

        let destination_bytes = [next()?, next()?, next()?, next()?];
        checksum.add_u8(destination_bytes[0], destination_bytes[1]);
        checksum.add_u8(destination_bytes[2], destination_bytes[3]);

        let mut options = Vec::with_capacity((ihl - BASE_WORDS) as usize * 4);
        for _ in 0..(ihl - BASE_WORDS) as usize * 4 {
            options.push(next()?);
        }
        checksum.add_slice(&options);

        if expected_checksum != 0 && !checksum.verifies() {
            Err(ParseError::Checksum {
                expected: expected_checksum,
            })?
        }

        Ok(Self {
            ihl,
            type_of_service,
            total_length,
            identification,
            flags,
            fragment_offset,
            time_to_live,
            protocol,
            checksum: expected_checksum,
            source: u32::from_be_bytes(source_bytes).into(),
            destination: u32::from_be_bytes(destination_bytes).into(),
            options,
        })
    }

    /// The header length in bytes.
    pub fn header_octets(&self) -> usize {
        self.ihl as usize * 4
    }

    /// The first payload byte of this fragment within the reconstructed
    /// datagram.
    pub fn fragment_start(&self) -> u32 {
        ((self.fragment_offset & FRAGMENT_OFFSET_MASK) as u32) << 3
    }

    /// Serializes the header to network byte order, options included. The
    /// checksum field is written as stored; see [`Ipv4Header::compute_checksum`]
    /// to refresh it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_octets());
        out.push((4u8 << 4) | self.ihl);
        out.push(self.type_of_service);
        out.extend_from_slice(&self.total_length.to_be_bytes());
        out.extend_from_slice(&self.identification.to_be_bytes());
        let flags_and_fragment_offset = ((self.flags.to_bits() as u16) << 13)
            | (self.fragment_offset & FRAGMENT_OFFSET_MASK);
        out.extend_from_slice(&flags_and_fragment_offset.to_be_bytes());
        out.push(self.time_to_live);
        out.push(self.protocol);
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.source.to_bytes());
        out.extend_from_slice(&self.destination.to_bytes());
        out.extend_from_slice(&self.options);
        out
    }

    /// Computes the checksum this header should carry on the wire.
    pub fn compute_checksum(&self) -> u16 {
        let mut copy = self.clone();
        copy.checksum = 0;
        let mut checksum = Checksum::new();
        checksum.add_slice(&copy.to_bytes());
        checksum.finish()
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("the IPv4 header is incomplete")]
    HeaderTooShort,
    #[error("expected version 4 in IPv4 header")]
    IncorrectIpv4Version,
    #[error("the header length field is below the minimum")]
    InvalidHeaderLength,
    #[error("the header checksum {expected:#06x} does not verify")]
    Checksum { expected: u16 },
}
