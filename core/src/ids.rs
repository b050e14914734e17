//! Subscriber and equipment identifiers.
//!
//! Identifiers arrive either TBCD-packed from control-plane signalling (IMSI,
//! IMEISV) or as a link-layer hardware address. The engine treats them as
//! opaque: it stores the raw bytes for the binary packet log and renders
//! digits only for the text outputs.

use std::fmt;

/// Number of raw bytes carried per identifier in the binary packet log.
pub const ID_RAW_LENGTH: usize = 8;

/// A subscriber or equipment identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceId {
    /// TBCD-packed digit string, e.g. an IMSI or IMEISV.
    Tbcd([u8; ID_RAW_LENGTH]),
    /// A hardware (MAC) address used as an equipment identifier.
    Mac([u8; 6]),
}

impl DeviceId {
    /// Builds an identifier from a TBCD-packed information element.
    /// Returns `None` for an empty element; longer elements are truncated to
    /// the stored width.
    pub fn from_tbcd(bytes: &[u8]) -> Option<DeviceId> {
        if bytes.is_empty() {
            return None;
        }
        let mut raw = [0xffu8; ID_RAW_LENGTH];
        let n = bytes.len().min(ID_RAW_LENGTH);
        raw[..n].copy_from_slice(&bytes[..n]);
        Some(DeviceId::Tbcd(raw))
    }

    pub fn from_mac(bytes: &[u8]) -> Option<DeviceId> {
        let mac: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(DeviceId::Mac(mac))
    }

    /// Raw bytes as packed into the binary packet log.
    pub fn raw(&self) -> &[u8] {
        match self {
            DeviceId::Tbcd(b) => b,
            DeviceId::Mac(b) => b,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Tbcd(raw) => {
                // Low nibble holds the first digit of each pair; any
                // non-decimal nibble (0xf filler included) ends the string.
                for byte in raw.iter() {
                    for nibble in [byte & 0x0f, byte >> 4] {
                        if nibble > 9 {
                            return Ok(());
                        }
                        write!(f, "{}", nibble)?;
                    }
                }
                Ok(())
            }
            DeviceId::Mac(mac) => {
                write!(
                    f,
                    "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                    mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
                )
            }
        }
    }
}

/// Parses a textual MAC address of the form `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for slot in mac.iter_mut() {
        *slot = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tbcd_renders_swapped_digits() {
        // 234150999999999 packed as TBCD (swapped nibbles, 0xf filler).
        let packed = [0x32, 0x14, 0x05, 0x99, 0x99, 0x99, 0x99, 0xf9];
        let id = DeviceId::from_tbcd(&packed).unwrap();
        assert_eq!(id.to_string(), "234150999999999");
    }

    #[test]
    fn short_tbcd_pads_with_filler() {
        let id = DeviceId::from_tbcd(&[0x21, 0xf3]).unwrap();
        assert_eq!(id.to_string(), "123");
        assert_eq!(id.raw().len(), ID_RAW_LENGTH);
    }

    #[test]
    fn mac_parse_and_render() {
        let mac = parse_mac("00:1a:2b:3c:4d:5e").unwrap();
        let id = DeviceId::from_mac(&mac).unwrap();
        assert_eq!(id.to_string(), "00:1a:2b:3c:4d:5e");
        assert!(parse_mac("00:1a:2b:3c:4d").is_none());
        assert!(parse_mac("00:1a:2b:3c:4d:5e:6f").is_none());
    }
}
