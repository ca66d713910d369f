//! The transmission unit and its wire codec.
//!
//! # Packet Format
//!
//! Everything a node puts on the air is one `Packet`, laid out as follows (multi-byte integers
//! little-endian):
//!
//! ```notrust
//! +--------+-----------+-----------+----------+------------+---------------+
//! | header | tc0 (2B)* | tc1 (2B)* | path_len | path bytes | payload bytes |
//! +--------+-----------+-----------+----------+------------+---------------+
//! *only present when the route type is a transport variant
//! ```
//!
//! The header is a single byte:
//!
//! ```notrust
//! MSB                                      LSB
//! +-------------+--------------+------------+
//! |   version   | payload type | route type |
//! |  (2 bits)   |   (4 bits)   |  (2 bits)  |
//! +-------------+--------------+------------+
//! ```
//!
//! The all-ones header value `0xFF` is reserved as the "do not retransmit" sentinel: such a packet
//! still parses, but must never be queued for retransmission.
//!
//! `path` is an ordered sequence of single-byte node hashes. On flood routes it grows as the
//! packet travels (each relay appends its own hash); on direct routes it prescribes the remaining
//! hops, and each relay consumes the leading byte.

pub mod advert;

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::crypto;
use crate::Error;

/// Maximum number of hop bytes in a packet path.
pub const MAX_PATH_SIZE: usize = 64;

/// Maximum payload bytes in a single packet.
pub const MAX_PACKET_PAYLOAD: usize = 184;

/// Maximum size of an encoded packet: 1 header + 4 transport codes + 1 path length +
/// [`MAX_PATH_SIZE`] + [`MAX_PACKET_PAYLOAD`] rounded up to what a LoRa frame can carry.
///
/// [`MAX_PATH_SIZE`]: constant.MAX_PATH_SIZE.html
/// [`MAX_PACKET_PAYLOAD`]: constant.MAX_PACKET_PAYLOAD.html
pub const MAX_TRANS_UNIT: usize = 255;

/// Bytes of truncated SHA-256 identifying a packet in the seen table.
pub const MAX_HASH_SIZE: usize = 4;

/// A truncated packet hash, as stored in the seen table.
pub type PacketHash = [u8; MAX_HASH_SIZE];

const ROUTE_MASK: u8 = 0x03;
const TYPE_SHIFT: u8 = 2;
const TYPE_MASK: u8 = 0x0F;
const VER_SHIFT: u8 = 6;
const VER_MASK: u8 = 0x03;

/// Header sentinel marking a packet that must not be retransmitted.
const HEADER_DO_NOT_RETRANSMIT: u8 = 0xFF;

/// How a packet is routed through the mesh.
///
/// The transport variants behave exactly like their plain counterparts but carry two extra 16-bit
/// codes for an overlay transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RouteType {
    /// Flood routing with transport codes.
    TransportFlood,
    /// Flood routing: every relay that has not seen the packet re-transmits it, building up
    /// `path` along the way.
    Flood,
    /// Direct routing: `path` holds the remaining hops, next hop first.
    Direct,
    /// Direct routing with transport codes.
    TransportDirect,
}

impl RouteType {
    fn from_bits(bits: u8) -> Self {
        match bits & ROUTE_MASK {
            0b00 => RouteType::TransportFlood,
            0b01 => RouteType::Flood,
            0b10 => RouteType::Direct,
            _ => RouteType::TransportDirect,
        }
    }

    fn bits(self) -> u8 {
        match self {
            RouteType::TransportFlood => 0b00,
            RouteType::Flood => 0b01,
            RouteType::Direct => 0b10,
            RouteType::TransportDirect => 0b11,
        }
    }

    /// Returns whether this is one of the flood variants.
    pub fn is_flood(self) -> bool {
        matches!(self, RouteType::Flood | RouteType::TransportFlood)
    }

    /// Returns whether this is one of the direct variants.
    pub fn is_direct(self) -> bool {
        matches!(self, RouteType::Direct | RouteType::TransportDirect)
    }
}

enum_with_unknown! {
    /// What a packet's payload contains. Numeric tags are part of the wire format.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum PayloadType(u8) {
        /// Request to a known peer (dest/src hashes, then MAC-protected data).
        Req = 0x00,
        /// Response to a `Req` or `AnonReq`.
        Response = 0x01,
        /// A plain text message (dest/src hashes, then MAC-protected timestamp + text).
        TxtMsg = 0x02,
        /// A 4-byte acknowledgement tag.
        Ack = 0x03,
        /// A node advertising its identity.
        Advert = 0x04,
        /// An (unverified) group text message (channel hash, then MAC-protected data).
        GrpTxt = 0x05,
        /// An (unverified) group datagram.
        GrpData = 0x06,
        /// First-contact request carrying an ephemeral sender public key.
        AnonReq = 0x07,
        /// A returned path (dest/src hashes, then MAC-protected path + extra).
        Path = 0x08,
        /// Trace a route, collecting per-hop SNR.
        Trace = 0x09,
        /// Raw custom payload for applications with their own framing/encryption.
        RawCustom = 0x0F,
    }
}

/// Wire format version carried in the two header MSBs. Only version 1 is defined.
pub const PAYLOAD_VER_1: u8 = 0x00;

/// The fundamental transmission unit.
#[derive(Clone)]
pub struct Packet {
    /// Raw header byte; see the module docs for the bit layout.
    pub header: u8,
    /// Transport codes; zero unless the route type is a transport variant.
    pub transport_codes: [u16; 2],
    /// Number of valid bytes in `path`.
    pub path_len: u8,
    /// Hop bytes; see the module docs.
    pub path: [u8; MAX_PATH_SIZE],
    /// Number of valid bytes in `payload`.
    pub payload_len: u8,
    /// Payload bytes; interpretation depends on the payload type.
    pub payload: [u8; MAX_PACKET_PAYLOAD],
    /// SNR of the last hop in quarter-dB steps, stamped by the dispatcher on receive. Zero for
    /// locally built packets.
    pub snr: i8,
}

impl Packet {
    /// Creates an empty packet with the given payload type and route.
    pub fn new(payload_type: PayloadType, route: RouteType) -> Self {
        let mut pkt = Self::empty();
        pkt.set_header(payload_type, route);
        pkt
    }

    /// Rewrites the header for the given payload type and route, at wire format version 1.
    pub fn set_header(&mut self, payload_type: PayloadType, route: RouteType) {
        self.header = (PAYLOAD_VER_1 & VER_MASK) << VER_SHIFT
            | (u8::from(payload_type) & TYPE_MASK) << TYPE_SHIFT
            | route.bits();
    }

    /// Creates an all-zero packet (payload type `Req`, route `TransportFlood`).
    pub fn empty() -> Self {
        Packet {
            header: 0,
            transport_codes: [0; 2],
            path_len: 0,
            path: [0; MAX_PATH_SIZE],
            payload_len: 0,
            payload: [0; MAX_PACKET_PAYLOAD],
            snr: 0,
        }
    }

    /// Resets the variable-length parts, keeping the buffers themselves.
    pub fn clear(&mut self) {
        self.header = 0;
        self.transport_codes = [0; 2];
        self.path_len = 0;
        self.payload_len = 0;
        self.snr = 0;
    }

    /// Returns the route type encoded in the header.
    pub fn route_type(&self) -> RouteType {
        RouteType::from_bits(self.header)
    }

    /// Replaces the route type, keeping payload type and version.
    pub fn set_route_type(&mut self, route: RouteType) {
        self.header = (self.header & !ROUTE_MASK) | route.bits();
    }

    /// Returns whether this packet floods.
    pub fn is_route_flood(&self) -> bool {
        self.route_type().is_flood()
    }

    /// Returns whether this packet follows a prescribed path.
    pub fn is_route_direct(&self) -> bool {
        self.route_type().is_direct()
    }

    /// Returns whether the wire format includes the transport codes.
    pub fn has_transport_codes(&self) -> bool {
        matches!(
            self.route_type(),
            RouteType::TransportFlood | RouteType::TransportDirect
        )
    }

    /// Returns the payload type encoded in the header.
    pub fn payload_type(&self) -> PayloadType {
        PayloadType::from((self.header >> TYPE_SHIFT) & TYPE_MASK)
    }

    /// Returns the wire format version encoded in the header.
    pub fn payload_version(&self) -> u8 {
        (self.header >> VER_SHIFT) & VER_MASK
    }

    /// Marks this packet so it is never retransmitted, by either route mode.
    pub fn mark_do_not_retransmit(&mut self) {
        self.header = HEADER_DO_NOT_RETRANSMIT;
    }

    /// Returns whether the do-not-retransmit sentinel is set.
    pub fn is_marked_do_not_retransmit(&self) -> bool {
        self.header == HEADER_DO_NOT_RETRANSMIT
    }

    /// Last-hop SNR in dB.
    pub fn snr_db(&self) -> f32 {
        f32::from(self.snr) / 4.0
    }

    /// The valid portion of `payload`.
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload[..usize::from(self.payload_len)]
    }

    /// The valid portion of `path`.
    pub fn path_bytes(&self) -> &[u8] {
        &self.path[..usize::from(self.path_len)]
    }

    /// Returns the encoded length of this packet.
    pub fn raw_length(&self) -> usize {
        2 + usize::from(self.path_len)
            + usize::from(self.payload_len)
            + if self.has_transport_codes() { 4 } else { 0 }
    }

    /// Calculates the hash identifying this packet in the seen table.
    ///
    /// Only the payload type and payload feed the hash, so two flood copies of one packet that
    /// took different routes hash identically. `Trace` packets additionally hash the path length:
    /// their per-hop record accumulates in the path, and a copy re-observed with a different hop
    /// count must count as new.
    pub fn packet_hash(&self) -> PacketHash {
        let ty = u8::from(self.payload_type());
        let mut prefix = [ty, 0, 0];
        let prefix: &[u8] = if self.payload_type() == PayloadType::Trace {
            let len = u16::from(self.path_len).to_le_bytes();
            prefix[1] = len[0];
            prefix[2] = len[1];
            &prefix
        } else {
            &prefix[..1]
        };

        let mut hash = [0; MAX_HASH_SIZE];
        crypto::sha256_pair(&mut hash, prefix, self.payload_bytes());
        hash
    }

    /// Encodes this packet into `dest`, returning the number of bytes written.
    ///
    /// Fails with `Error::Eof` when `dest` is too small.
    pub fn write_to(&self, dest: &mut [u8]) -> Result<usize, Error> {
        let space = dest.len();
        let mut writer = ByteWriter::new(dest);
        self.to_bytes(&mut writer)?;
        Ok(space - writer.space_left())
    }

    /// Decodes a packet from `src`, as produced by [`write_to`].
    ///
    /// [`write_to`]: #method.write_to
    pub fn read_from(src: &[u8]) -> Result<Packet, Error> {
        Self::from_bytes(&mut ByteReader::new(src))
    }
}

impl ToBytes for Packet {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.header)?;
        if self.has_transport_codes() {
            writer.write_u16_le(self.transport_codes[0])?;
            writer.write_u16_le(self.transport_codes[1])?;
        }
        writer.write_u8(self.path_len)?;
        writer.write_slice(self.path_bytes())?;
        writer.write_slice(self.payload_bytes())?;
        Ok(())
    }
}

impl<'a> FromBytes<'a> for Packet {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let mut pkt = Packet::empty();
        pkt.header = bytes.read_u8()?;
        if pkt.has_transport_codes() {
            pkt.transport_codes[0] = bytes.read_u16_le()?;
            pkt.transport_codes[1] = bytes.read_u16_le()?;
        }

        pkt.path_len = bytes.read_u8()?;
        if usize::from(pkt.path_len) > MAX_PATH_SIZE {
            return Err(Error::InvalidLength);
        }
        let path = bytes.read_slice(usize::from(pkt.path_len))?;
        pkt.path[..path.len()].copy_from_slice(path);

        let payload = bytes.read_rest();
        if payload.is_empty() || payload.len() > MAX_PACKET_PAYLOAD {
            return Err(Error::InvalidLength);
        }
        pkt.payload_len = payload.len() as u8;
        pkt.payload[..payload.len()].copy_from_slice(payload);

        Ok(pkt)
    }
}
