//! IEEE 1722/1722a AVTP wire format: the common header fields shared by
//! every subtype (AAF, CVF, CRF), encoded/decoded bit-exact to the standard.
//! Payload framing past the common header is delegated to stream objects;
//! this module never interprets payload bytes.

use crate::error::{Error, Result};

/// A 48-bit Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    #[must_use]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        let b = self.0;
        b[0] == 0 && b[1] == 0 && b[2] == 0 && b[3] == 0 && b[4] == 0 && b[5] == 0
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// AVTP subtype byte values relevant to this core (IEEE 1722-2016 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvtpSubtype {
    /// AVTP Audio Format.
    Aaf,
    /// Compressed Video Format.
    Cvf,
    /// Clock Reference Format.
    Crf,
}

impl AvtpSubtype {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Aaf => 0x02,
            Self::Cvf => 0x03,
            Self::Crf => 0x04,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x02 => Some(Self::Aaf),
            0x03 => Some(Self::Cvf),
            0x04 => Some(Self::Crf),
            _ => None,
        }
    }
}

/// AVTP version this implementation emits and accepts.
pub const AVTP_VERSION: u8 = 0;

/// Fixed length, in bytes, of the common AVTPDU header (subtype through
/// `stream_id`, before the subtype-specific fields).
pub const COMMON_HEADER_LEN: usize = 12;

/// The AVTPDU common header fields, bit-exact to IEEE 1722.
///
/// Layout (big-endian on the wire):
/// ```text
/// byte 0:    subtype
/// byte 1:    sv(1) version(3) mr(1) r(1) gv(1) tv(1)
/// byte 2:    sequence_num
/// byte 3:    r(1) tu(1) reserved(6)
/// bytes 4-11: stream_id (u64)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvtpHeader {
    pub subtype: AvtpSubtype,
    pub sv: bool,
    pub version: u8,
    pub mr: bool,
    pub gv: bool,
    pub tv: bool,
    pub sequence_num: u8,
    pub tu: bool,
    pub stream_id: u64,
}

impl AvtpHeader {
    /// Encodes the common header into `out[..COMMON_HEADER_LEN]`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParam`] if `out` is too short.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < COMMON_HEADER_LEN {
            return Err(Error::InvalidParam("buffer too short for AVTP header".into()));
        }
        out[0] = self.subtype.code();
        out[1] = (u8::from(self.sv) << 7)
            | ((self.version & 0x7) << 4)
            | (u8::from(self.mr) << 3)
            | (u8::from(self.gv) << 1)
            | u8::from(self.tv);
        out[2] = self.sequence_num;
        out[3] = u8::from(self.tu) << 6;
        out[4..12].copy_from_slice(&self.stream_id.to_be_bytes());
        Ok(())
    }

    /// Decodes the common header from the start of `buf`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParam`] if `buf` is too short or the subtype
    /// byte is not one recognized by this core.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < COMMON_HEADER_LEN {
            return Err(Error::InvalidParam("frame shorter than AVTP header".into()));
        }
        let subtype = AvtpSubtype::from_code(buf[0])
            .ok_or_else(|| Error::InvalidParam(format!("unsupported AVTP subtype {:#x}", buf[0])))?;
        let sv = buf[1] & 0x80 != 0;
        let version = (buf[1] >> 4) & 0x7;
        let mr = buf[1] & 0x08 != 0;
        let gv = buf[1] & 0x02 != 0;
        let tv = buf[1] & 0x01 != 0;
        let sequence_num = buf[2];
        let tu = buf[3] & 0x40 != 0;
        let stream_id = u64::from_be_bytes(buf[4..12].try_into().unwrap());
        Ok(Self {
            subtype,
            sv,
            version,
            mr,
            gv,
            tv,
            sequence_num,
            tu,
            stream_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_encode_decode() {
        let hdr = AvtpHeader {
            subtype: AvtpSubtype::Aaf,
            sv: true,
            version: AVTP_VERSION,
            mr: true,
            gv: false,
            tv: true,
            sequence_num: 0xAB,
            tu: false,
            stream_id: 0x91E0_F000_FE01_0000,
        };
        let mut buf = [0u8; COMMON_HEADER_LEN];
        hdr.encode(&mut buf).unwrap();
        let decoded = AvtpHeader::decode(&buf).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn decode_rejects_unknown_subtype() {
        let mut buf = [0u8; COMMON_HEADER_LEN];
        buf[0] = 0xFF;
        assert!(AvtpHeader::decode(&buf).is_err());
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let buf = [0u8; 4];
        assert!(AvtpHeader::decode(&buf).is_err());
    }

    #[test]
    fn mac_display_is_colon_separated_hex() {
        let mac = MacAddr::new([0x91, 0xe0, 0xf0, 0x00, 0xfe, 0x01]);
        assert_eq!(mac.to_string(), "91:e0:f0:00:fe:01");
    }
}
