//! Advertisement application data.
//!
//! The signed portion of an advertisement carries a small self-describing blob chosen by the
//! application: one flag byte, then only the fields the flags announce.
//!
//! ```notrust
//! +-------+----------+----------+---------+---------+----------------+
//! | flags | lat (4B) | lon (4B) | feat1   | feat2   | name (UTF-8,   |
//! |       | optional | optional | (2B) o. | (2B) o. |  no terminator)|
//! +-------+----------+----------+---------+---------+----------------+
//! ```
//!
//! Flag byte: bit 7 name present, bits 6/5 feature words, bit 4 lat/lon present, low nibble node
//! type. Latitude and longitude are 1e-6-degree fixed point.

use bitflags::bitflags;

use crate::bytes::{ByteReader, ByteWriter};
use crate::Error;

/// Maximum encoded size of advertisement app-data.
pub const MAX_ADVERT_DATA_SIZE: usize = 32;

/// Maximum name length that fits next to the flag byte.
pub const MAX_ADVERT_NAME_LEN: usize = MAX_ADVERT_DATA_SIZE - 1;

enum_with_unknown! {
    /// What kind of node an advertisement announces.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum NodeType(u8) {
        /// No type given.
        None = 0,
        /// An interactive chat client.
        Chat = 1,
        /// A store-and-forward repeater.
        Repeater = 2,
        /// A room server.
        Room = 3,
        /// An unattended sensor.
        Sensor = 4,
    }
}

bitflags! {
    /// Field-presence bits in the advertisement flag byte. The low nibble holds the node type and
    /// is not part of these flags.
    pub struct AdvertFlags: u8 {
        const HAS_LAT_LON = 0x10;
        const HAS_FEAT1 = 0x20;
        const HAS_FEAT2 = 0x40;
        const HAS_NAME = 0x80;
    }
}

/// Builds advertisement app-data for this node.
pub struct AdvertDataBuilder<'a> {
    node_type: NodeType,
    name: Option<&'a str>,
    lat_lon: Option<(i32, i32)>,
    feat1: u16,
    feat2: u16,
}

impl<'a> AdvertDataBuilder<'a> {
    /// Starts app-data announcing the given node type.
    pub fn new(node_type: NodeType) -> Self {
        AdvertDataBuilder {
            node_type,
            name: None,
            lat_lon: None,
            feat1: 0,
            feat2: 0,
        }
    }

    /// Adds a human-readable name. Names longer than [`MAX_ADVERT_NAME_LEN`] bytes are truncated
    /// at a character boundary.
    ///
    /// [`MAX_ADVERT_NAME_LEN`]: constant.MAX_ADVERT_NAME_LEN.html
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Adds a location in 1e-6-degree fixed point.
    pub fn lat_lon(mut self, lat: i32, lon: i32) -> Self {
        self.lat_lon = Some((lat, lon));
        self
    }

    /// Sets the first feature word. Zero means absent.
    pub fn feat1(mut self, value: u16) -> Self {
        self.feat1 = value;
        self
    }

    /// Sets the second feature word. Zero means absent.
    pub fn feat2(mut self, value: u16) -> Self {
        self.feat2 = value;
        self
    }

    /// Encodes the app-data into `dest`, returning the encoded length.
    ///
    /// `dest` should be [`MAX_ADVERT_DATA_SIZE`] bytes; a longer name is truncated rather than
    /// reported as an error.
    ///
    /// [`MAX_ADVERT_DATA_SIZE`]: constant.MAX_ADVERT_DATA_SIZE.html
    pub fn encode_to(&self, dest: &mut [u8]) -> Result<usize, Error> {
        let space = dest.len().min(MAX_ADVERT_DATA_SIZE);
        let dest = &mut dest[..space];
        let mut flags = u8::from(self.node_type) & 0x0F;

        let mut w = ByteWriter::new(dest);
        w.skip(1)?;
        if let Some((lat, lon)) = self.lat_lon {
            flags |= AdvertFlags::HAS_LAT_LON.bits();
            w.write_u32_le(lat as u32)?;
            w.write_u32_le(lon as u32)?;
        }
        if self.feat1 != 0 {
            flags |= AdvertFlags::HAS_FEAT1.bits();
            w.write_u16_le(self.feat1)?;
        }
        if self.feat2 != 0 {
            flags |= AdvertFlags::HAS_FEAT2.bits();
            w.write_u16_le(self.feat2)?;
        }
        if let Some(name) = self.name {
            if !name.is_empty() {
                flags |= AdvertFlags::HAS_NAME.bits();
                let mut n = name.len().min(w.space_left());
                while !name.is_char_boundary(n) {
                    n -= 1;
                }
                w.write_slice(&name.as_bytes()[..n])?;
            }
        }

        let written = space - w.space_left();
        dest[0] = flags;
        Ok(written)
    }
}

/// Advertisement app-data parsed from a received advertisement.
///
/// The name borrows from the receive buffer; copy it out before the packet is released.
#[derive(Debug, Copy, Clone)]
pub struct AdvertData<'a> {
    /// Announced node type.
    pub node_type: NodeType,
    /// Location in 1e-6-degree fixed point, if announced.
    pub lat_lon: Option<(i32, i32)>,
    /// First feature word, if announced.
    pub feat1: u16,
    /// Second feature word, if announced.
    pub feat2: u16,
    /// Announced name, if present and valid UTF-8.
    pub name: Option<&'a str>,
}

impl<'a> AdvertData<'a> {
    /// Parses advertisement app-data. Returns `None` when the blob is shorter than its flags
    /// announce or the name is not UTF-8.
    pub fn parse(app_data: &'a [u8]) -> Option<Self> {
        let mut r = ByteReader::new(app_data);
        let flag_byte = r.read_u8().ok()?;
        let flags = AdvertFlags::from_bits_truncate(flag_byte);

        let lat_lon = if flags.contains(AdvertFlags::HAS_LAT_LON) {
            let lat = r.read_u32_le().ok()? as i32;
            let lon = r.read_u32_le().ok()? as i32;
            Some((lat, lon))
        } else {
            None
        };
        let feat1 = if flags.contains(AdvertFlags::HAS_FEAT1) {
            r.read_u16_le().ok()?
        } else {
            0
        };
        let feat2 = if flags.contains(AdvertFlags::HAS_FEAT2) {
            r.read_u16_le().ok()?
        } else {
            0
        };
        let name = if flags.contains(AdvertFlags::HAS_NAME) && !r.is_empty() {
            Some(core::str::from_utf8(r.read_rest()).ok()?)
        } else {
            None
        };

        Some(AdvertData {
            node_type: NodeType::from(flag_byte & 0x0F),
            lat_lon,
            feat1,
            feat2,
            name,
        })
    }

    /// Converts the fixed-point location to degrees.
    pub fn lat_lon_degrees(&self) -> Option<(f64, f64)> {
        self.lat_lon
            .map(|(lat, lon)| (f64::from(lat) / 1e6, f64::from(lon) / 1e6))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_only() {
        let mut buf = [0; MAX_ADVERT_DATA_SIZE];
        let len = AdvertDataBuilder::new(NodeType::Chat)
            .name("Alice")
            .encode_to(&mut buf)
            .unwrap();
        assert_eq!(len, 6);
        assert_eq!(buf[0], 0x81);

        let parsed = AdvertData::parse(&buf[..len]).unwrap();
        assert_eq!(parsed.node_type, NodeType::Chat);
        assert_eq!(parsed.name, Some("Alice"));
        assert_eq!(parsed.lat_lon, None);
        assert_eq!(parsed.feat1, 0);
    }

    #[test]
    fn all_fields() {
        let mut buf = [0; MAX_ADVERT_DATA_SIZE];
        let len = AdvertDataBuilder::new(NodeType::Repeater)
            .name("rpt")
            .lat_lon(-33_865_143, 151_209_900)
            .feat1(7)
            .feat2(9)
            .encode_to(&mut buf)
            .unwrap();
        assert_eq!(len, 1 + 8 + 2 + 2 + 3);

        let parsed = AdvertData::parse(&buf[..len]).unwrap();
        assert_eq!(parsed.node_type, NodeType::Repeater);
        assert_eq!(parsed.lat_lon, Some((-33_865_143, 151_209_900)));
        assert_eq!(parsed.feat1, 7);
        assert_eq!(parsed.feat2, 9);
        assert_eq!(parsed.name, Some("rpt"));
        let (lat, _lon) = parsed.lat_lon_degrees().unwrap();
        assert!((lat - -33.865143).abs() < 1e-9);
    }

    #[test]
    fn long_name_is_truncated() {
        let mut buf = [0; MAX_ADVERT_DATA_SIZE];
        let long = "abcdefghijklmnopqrstuvwxyz0123456789";
        let len = AdvertDataBuilder::new(NodeType::Chat)
            .name(long)
            .encode_to(&mut buf)
            .unwrap();
        assert_eq!(len, MAX_ADVERT_DATA_SIZE);
        let parsed = AdvertData::parse(&buf[..len]).unwrap();
        assert_eq!(parsed.name, Some(&long[..MAX_ADVERT_NAME_LEN]));
    }

    #[test]
    fn truncated_fields_are_rejected() {
        // Flags announce lat/lon but only 3 bytes follow.
        assert!(AdvertData::parse(&[0x11, 1, 2, 3]).is_none());
        assert!(AdvertData::parse(&[]).is_none());
    }

    #[test]
    fn node_type_without_name() {
        let mut buf = [0; MAX_ADVERT_DATA_SIZE];
        let len = AdvertDataBuilder::new(NodeType::Sensor)
            .encode_to(&mut buf)
            .unwrap();
        assert_eq!(len, 1);
        let parsed = AdvertData::parse(&buf[..len]).unwrap();
        assert_eq!(parsed.node_type, NodeType::Sensor);
        assert_eq!(parsed.name, None);
    }
}
