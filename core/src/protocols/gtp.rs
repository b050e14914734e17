//! Shared GTP header handling for the control and user plane stages.

use crate::protocols::{be_u16, be_u32};

use thiserror::Error;

/// Version bits of the first flag byte.
pub const GTP_VER_MASK: u8 = 0xe0;
/// Extension-header-present flag.
pub const GTP_EXT_MASK: u8 = 0x04;
/// Sequence-number-present flag.
pub const GTP_SEQ_MASK: u8 = 0x02;
/// N-PDU-number-present flag.
pub const GTP_NPDU_MASK: u8 = 0x01;
/// Any of the optional fields: their presence extends the base header.
pub const GTP_OPTS_MASK: u8 = 0x07;

/// Base header without optional fields.
pub const GTP_HEADER_CORE_LENGTH: usize = 8;
/// Sequence number, N-PDU number and next-extension-type fields.
pub const GTP_HEADER_OPTS_LENGTH: usize = 4;

/// GTP-U message type carrying a tunnelled PDU.
pub const GTP_MESSAGE_TPDU: u8 = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum GtpError {
    #[error("payload too short for a GTP header")]
    Truncated,
    #[error("GTP version 0")]
    Version0,
    #[error("malformed extension header chain")]
    BadExtension,
}

/// Fixed fields plus the resolved header length of a peeled GTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GtpHeader {
    pub msg_type: u8,
    pub teid: u32,
    /// Payload length as declared by the header (extension headers and
    /// optional fields already subtracted).
    pub ies_len: usize,
    /// Total header length including optional fields and extensions.
    pub header_len: usize,
}

/// Parses the GTP base header and walks the extension chain.
pub(crate) fn peel(payload: &[u8]) -> Result<GtpHeader, GtpError> {
    if payload.len() < GTP_HEADER_CORE_LENGTH {
        return Err(GtpError::Truncated);
    }
    let flags = payload[0];
    if flags & GTP_VER_MASK == 0 {
        return Err(GtpError::Version0);
    }

    let mut header_len = if flags & GTP_OPTS_MASK != 0 {
        GTP_HEADER_CORE_LENGTH + GTP_HEADER_OPTS_LENGTH
    } else {
        GTP_HEADER_CORE_LENGTH
    };
    let mut ies_len = be_u16(payload, 2) as isize;
    if flags & GTP_OPTS_MASK != 0 {
        ies_len -= GTP_HEADER_OPTS_LENGTH as isize;
    }

    if flags & GTP_EXT_MASK != 0 {
        // Each extension header states its own length; a terminating zero in
        // its last byte ends the chain.
        loop {
            if header_len >= payload.len() {
                return Err(GtpError::BadExtension);
            }
            let ext_len = payload[header_len] as usize;
            if ext_len == 0 || header_len + ext_len > payload.len() {
                return Err(GtpError::BadExtension);
            }
            let more = payload[header_len + ext_len - 1] != 0;
            header_len += ext_len;
            ies_len -= ext_len as isize;
            if ies_len < 0 {
                return Err(GtpError::BadExtension);
            }
            if !more {
                break;
            }
        }
    }

    if payload.len() < header_len {
        return Err(GtpError::Truncated);
    }

    Ok(GtpHeader {
        msg_type: payload[1],
        teid: be_u32(payload, 4),
        ies_len: ies_len.max(0) as usize,
        header_len,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a GTP header (v1) for tests: optional fields and one empty
    /// extension slot appear when `ext` is set.
    pub(crate) fn build(msg_type: u8, teid: u32, body: &[u8], ext: bool) -> Vec<u8> {
        let mut bytes = vec![];
        let flags = 0x30 | if ext { GTP_EXT_MASK } else { 0 };
        bytes.push(flags);
        bytes.push(msg_type);
        let opt_len = if ext { GTP_HEADER_OPTS_LENGTH + 4 } else { 0 };
        bytes.extend_from_slice(&((body.len() + opt_len) as u16).to_be_bytes());
        bytes.extend_from_slice(&teid.to_be_bytes());
        if ext {
            bytes.extend_from_slice(&[0, 0, 0, 1]); // seq, npdu, next ext type
            bytes.extend_from_slice(&[4, 0, 0, 0]); // one 4-byte extension, chain ends
        }
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn peels_base_header() {
        let bytes = build(GTP_MESSAGE_TPDU, 0xdeadbeef, &[1, 2, 3], false);
        let header = peel(&bytes).unwrap();
        assert_eq!(header.msg_type, GTP_MESSAGE_TPDU);
        assert_eq!(header.teid, 0xdeadbeef);
        assert_eq!(header.header_len, GTP_HEADER_CORE_LENGTH);
        assert_eq!(header.ies_len, 3);
    }

    #[test]
    fn peels_extension_chain() {
        let bytes = build(16, 0, &[9, 9], true);
        let header = peel(&bytes).unwrap();
        assert_eq!(header.header_len, 16);
        assert_eq!(header.ies_len, 2);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(peel(&[0x30, 1]), Err(GtpError::Truncated));
        assert_eq!(
            peel(&[0x00, 1, 0, 0, 0, 0, 0, 0]),
            Err(GtpError::Version0)
        );
        // Extension flag set but a zero-length extension follows.
        let mut bytes = build(16, 0, &[], true);
        bytes[12] = 0;
        assert_eq!(peel(&bytes), Err(GtpError::BadExtension));
    }
}
