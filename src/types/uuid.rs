//! Attribute UUIDs in 16, 32 and 128-bit form.
use core::fmt;

use crate::codec::{Encode, Error, Type};

/// The Bluetooth Base UUID, little endian, with the short value zeroed.
///
/// A short UUID `v` expands to `0000xxxx-0000-1000-8000-00805F9B34FB` with
/// `v` at byte offset 12 of the little-endian form.
const BASE_UUID: [u8; 16] = [
    0xfb, 0x34, 0x9b, 0x5f, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Find Information format octet for a list of 16-bit UUIDs.
pub(crate) const FORMAT_UUID16: u8 = 0x01;

/// Find Information format octet for a list of 128-bit UUIDs.
pub(crate) const FORMAT_UUID128: u8 = 0x02;

/// An attribute UUID.
///
/// Stored in the form it appeared in (little-endian bytes). Two UUIDs are
/// equal when their canonical 128-bit forms are equal, so a 16-bit alias
/// compares equal to its Base UUID expansion.
#[derive(Clone)]
pub enum Uuid {
    /// A 16-bit short UUID.
    Uuid16([u8; 2]),
    /// A 32-bit short UUID.
    Uuid32([u8; 4]),
    /// A full 128-bit UUID.
    Uuid128([u8; 16]),
}

impl Uuid {
    /// Create a 16-bit UUID.
    pub const fn new_short(val: u16) -> Self {
        Self::Uuid16(val.to_le_bytes())
    }

    /// Create a 128-bit UUID from little-endian bytes.
    pub const fn new_long(val: [u8; 16]) -> Self {
        Self::Uuid128(val)
    }

    /// Parse a UUID from its wire form (2, 4 or 16 little-endian bytes).
    pub fn try_from_slice(data: &[u8]) -> Result<Self, Error> {
        match data.len() {
            2 => Ok(Self::Uuid16([data[0], data[1]])),
            4 => Ok(Self::Uuid32([data[0], data[1], data[2], data[3]])),
            16 => {
                let mut raw = [0; 16];
                raw.copy_from_slice(data);
                Ok(Self::Uuid128(raw))
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// The wire form: little-endian bytes in the stored width.
    pub fn as_raw(&self) -> &[u8] {
        match self {
            Self::Uuid16(b) => b,
            Self::Uuid32(b) => b,
            Self::Uuid128(b) => b,
        }
    }

    /// The 16-bit alias. Only meaningful for `Uuid16` values.
    pub fn as_short(&self) -> u16 {
        match self {
            Self::Uuid16(b) => u16::from_le_bytes(*b),
            Self::Uuid32(b) => u32::from_le_bytes(*b) as u16,
            Self::Uuid128(b) => u16::from_le_bytes([b[12], b[13]]),
        }
    }

    /// The canonical 128-bit form, little endian. Short forms expand
    /// through the Bluetooth Base UUID.
    pub fn canonical(&self) -> [u8; 16] {
        match self {
            Self::Uuid16(b) => {
                let mut out = BASE_UUID;
                out[12] = b[0];
                out[13] = b[1];
                out
            }
            Self::Uuid32(b) => {
                let mut out = BASE_UUID;
                out[12..16].copy_from_slice(b);
                out
            }
            Self::Uuid128(b) => *b,
        }
    }

    /// Find Information format octet for this UUID's wire width.
    pub fn get_type(&self) -> u8 {
        match self {
            Self::Uuid16(_) => FORMAT_UUID16,
            _ => FORMAT_UUID128,
        }
    }

    /// Whether this UUID is a short (16-bit) alias on the wire.
    pub fn is_short(&self) -> bool {
        matches!(self, Self::Uuid16(_))
    }
}

impl PartialEq for Uuid {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for Uuid {}

impl From<u16> for Uuid {
    fn from(val: u16) -> Self {
        Self::new_short(val)
    }
}

impl From<u32> for Uuid {
    fn from(val: u32) -> Self {
        Self::Uuid32(val.to_le_bytes())
    }
}

impl From<[u8; 16]> for Uuid {
    fn from(val: [u8; 16]) -> Self {
        Self::Uuid128(val)
    }
}

impl Type for Uuid {
    fn size(&self) -> usize {
        self.as_raw().len()
    }
}

impl Encode for Uuid {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let raw = self.as_raw();
        if dest.len() < raw.len() {
            return Err(Error::InsufficientSpace);
        }
        dest[..raw.len()].copy_from_slice(raw);
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid16(_) => write!(f, "Uuid16(0x{:04x})", self.as_short()),
            Self::Uuid32(b) => write!(f, "Uuid32(0x{:08x})", u32::from_le_bytes(*b)),
            Self::Uuid128(b) => {
                write!(f, "Uuid128(")?;
                for octet in b.iter().rev() {
                    write!(f, "{:02x}", octet)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Uuid {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", defmt::Debug2Format(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_forms_compare_canonically() {
        let short = Uuid::new_short(0x2800);
        let mut long = BASE_UUID;
        long[12] = 0x00;
        long[13] = 0x28;
        assert_eq!(short, Uuid::Uuid128(long));
        assert_eq!(Uuid::from(0x2800u32), short);
        assert_ne!(short, Uuid::new_short(0x2801));
    }

    #[test]
    fn wire_round_trip() {
        for uuid in [
            Uuid::new_short(0x1800),
            Uuid::from(0x12345678u32),
            Uuid::new_long([7; 16]),
        ] {
            let parsed = Uuid::try_from_slice(uuid.as_raw()).unwrap();
            assert_eq!(parsed, uuid);
        }
        assert!(Uuid::try_from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn find_information_format() {
        assert_eq!(Uuid::new_short(0x2902).get_type(), FORMAT_UUID16);
        assert_eq!(Uuid::new_long([0; 16]).get_type(), FORMAT_UUID128);
    }
}
