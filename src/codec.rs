//! Message-header and ack codecs plus CCB preamble detection
//!
//! The wire layout is pure ASCII decimal; there is no binary integer on the
//! wire. A product frame is a 10-byte message header and a 22-byte product
//! header followed by the payload:
//!
//! ```text
//! %.8d   msg_size (PROD_HDR_LEN + payload bytes)
//! BI     message type tag
//! 0x01 \r \r \n
//! %.5d   product sequence number
//! %.10d  epoch queue time
//! \r \r \n
//! ```
//!
//! An ack is 6 bytes: a 5-digit sequence number and a single code byte.

use anyhow::{bail, Result};

use crate::protocol::{
    ccb, ACK_MSG_LEN, FULL_HDR_LEN, MAX_PROD_SEQNO, MAX_PROD_SIZE, PROD_HDR_LEN,
};

/// Fields carried by the fixed-length frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    pub seqno: u32,
    pub queue_time: i64,
    pub size: u64,
}

/// Acknowledgement codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckCode {
    Ok,
    Fail,
    Retry,
}

impl AckCode {
    pub fn as_byte(self) -> u8 {
        match self {
            AckCode::Ok => b'K',
            AckCode::Fail => b'F',
            AckCode::Retry => b'R',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'K' => Some(AckCode::Ok),
            b'F' => Some(AckCode::Fail),
            b'R' => Some(AckCode::Retry),
            _ => None,
        }
    }
}

impl std::fmt::Display for AckCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

/// Format the 32-byte frame header for a product of `size` payload bytes.
pub fn format_msghdr(buf: &mut [u8], seqno: u32, queue_time: i64, size: u64) -> Result<usize> {
    if size == 0 || size > MAX_PROD_SIZE {
        bail!("invalid prod size {}, max {}", size, MAX_PROD_SIZE);
    }
    if seqno > MAX_PROD_SEQNO {
        bail!("invalid prod seqno {}, max {}", seqno, MAX_PROD_SEQNO);
    }
    if !(0..=9_999_999_999).contains(&queue_time) {
        bail!("queue time {} does not fit the header field", queue_time);
    }

    let msg_size = PROD_HDR_LEN as u64 + size;
    let header = format!(
        "{:08}BI\x01\r\r\n{:05}{:010}\r\r\n",
        msg_size, seqno, queue_time
    );
    debug_assert_eq!(header.len(), FULL_HDR_LEN);
    buf[..FULL_HDR_LEN].copy_from_slice(header.as_bytes());
    Ok(FULL_HDR_LEN)
}

fn ascii_decimal(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || !bytes.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut v: u64 = 0;
    for &b in bytes {
        v = v.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(v)
}

/// Parse a frame header; rejects any deviation from the literal template.
pub fn parse_msghdr(buf: &[u8]) -> Result<MsgHeader> {
    if buf.len() < FULL_HDR_LEN {
        bail!("can not parse header, min length is {} bytes", FULL_HDR_LEN);
    }
    let hdr = &buf[..FULL_HDR_LEN];

    let msg_size = ascii_decimal(&hdr[0..8]);
    let tag_ok = matches!(&hdr[8..10], b"BI" | b"AN" | b"FX");
    let sep1_ok = &hdr[10..14] == b"\x01\r\r\n";
    let seqno = ascii_decimal(&hdr[14..19]);
    let queue_time = ascii_decimal(&hdr[19..29]);
    let sep2_ok = &hdr[29..32] == b"\r\r\n";

    match (msg_size, tag_ok, sep1_ok, seqno, queue_time, sep2_ok) {
        (Some(msg_size), true, true, Some(seqno), Some(queue_time), true)
            if msg_size >= PROD_HDR_LEN as u64 =>
        {
            Ok(MsgHeader {
                seqno: seqno as u32,
                queue_time: queue_time as i64,
                size: msg_size - PROD_HDR_LEN as u64,
            })
        }
        _ => bail!(
            "invalid header received [{}]",
            crate::wmo::debug_buf(hdr)
        ),
    }
}

/// Format a 6-byte acknowledgement.
pub fn format_ack(seqno: u32, code: AckCode) -> Result<[u8; ACK_MSG_LEN]> {
    if seqno > MAX_PROD_SEQNO {
        bail!("invalid ack seqno {}, max {}", seqno, MAX_PROD_SEQNO);
    }
    let text = format!("{:05}", seqno);
    let mut buf = [0u8; ACK_MSG_LEN];
    buf[..5].copy_from_slice(text.as_bytes());
    buf[5] = code.as_byte();
    Ok(buf)
}

/// Parse a 6-byte acknowledgement. The sequence field tolerates leading
/// spaces since historical peers space-pad it.
pub fn parse_ack(buf: &[u8]) -> Result<(u32, AckCode)> {
    if buf.len() < ACK_MSG_LEN {
        bail!("can not parse ack, min length is {} bytes", ACK_MSG_LEN);
    }
    let mut digits = &buf[..5];
    while let Some((b' ', rest)) = digits.split_first() {
        digits = rest;
    }
    let seqno = match ascii_decimal(digits) {
        Some(v) if v <= MAX_PROD_SEQNO as u64 => v as u32,
        _ => bail!("invalid ack received [{}]", crate::wmo::debug_buf(&buf[..6])),
    };
    let code = match AckCode::from_byte(buf[5]) {
        Some(c) => c,
        None => bail!("invalid ack code {:#04x}", buf[5]),
    };
    Ok((seqno, code))
}

/// Length of a CCB preamble at the start of `buf`, or 0 when there is none.
/// The length byte counts 2-byte pairs; implausible lengths mean no CCB.
pub fn ccb_len(buf: &[u8]) -> usize {
    if buf.len() <= ccb::LENGTH_BYTE || buf[ccb::FLAG_BYTE] != ccb::FLAG_VAL {
        return 0;
    }
    let len = buf[ccb::LENGTH_BYTE] as usize * 2;
    if !(ccb::MIN_HDR_LEN..=ccb::MAX_HDR_LEN).contains(&len) || len > buf.len() {
        return 0;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msghdr_round_trip() {
        let mut buf = [0u8; FULL_HDR_LEN];
        for (seqno, size, queue_time) in [
            (0u32, 1u64, 0i64),
            (99_999, MAX_PROD_SIZE, 1_700_000_000),
            (42, 1024, 9_999_999_999),
        ] {
            format_msghdr(&mut buf, seqno, queue_time, size).unwrap();
            let hdr = parse_msghdr(&buf).unwrap();
            assert_eq!(hdr.seqno, seqno);
            assert_eq!(hdr.queue_time, queue_time);
            assert_eq!(hdr.size, size);
        }
    }

    #[test]
    fn msghdr_layout_is_literal() {
        let mut buf = [0u8; FULL_HDR_LEN];
        format_msghdr(&mut buf, 7, 1234567890, 1024).unwrap();
        assert_eq!(&buf[..], b"00001046BI\x01\r\r\n000071234567890\r\r\n");
    }

    #[test]
    fn msghdr_rejects_bad_sizes() {
        let mut buf = [0u8; FULL_HDR_LEN];
        assert!(format_msghdr(&mut buf, 0, 0, 0).is_err());
        assert!(format_msghdr(&mut buf, 0, 0, MAX_PROD_SIZE + 1).is_err());
        assert!(format_msghdr(&mut buf, MAX_PROD_SEQNO + 1, 0, 10).is_err());
    }

    #[test]
    fn parse_rejects_mangled_headers() {
        let mut buf = [0u8; FULL_HDR_LEN];
        format_msghdr(&mut buf, 7, 1234567890, 1024).unwrap();

        let mut bad = buf;
        bad[10] = b' '; // SOH missing
        assert!(parse_msghdr(&bad).is_err());

        let mut bad = buf;
        bad[8] = b'Q'; // unknown type tag
        bad[9] = b'Q';
        assert!(parse_msghdr(&bad).is_err());

        let mut bad = buf;
        bad[0] = b'x'; // non-decimal size
        assert!(parse_msghdr(&bad).is_err());

        let mut bad = buf;
        bad[31] = b'x'; // trailing separator
        assert!(parse_msghdr(&bad).is_err());

        assert!(parse_msghdr(&buf[..FULL_HDR_LEN - 1]).is_err());
    }

    #[test]
    fn parse_accepts_alternate_type_tags() {
        let mut buf = [0u8; FULL_HDR_LEN];
        format_msghdr(&mut buf, 3, 5, 10).unwrap();
        for tag in [b"AN", b"FX"] {
            let mut alt = buf;
            alt[8..10].copy_from_slice(tag);
            assert!(parse_msghdr(&alt).is_ok());
        }
    }

    #[test]
    fn ack_round_trip() {
        for (seqno, code) in [
            (0u32, AckCode::Ok),
            (99_999, AckCode::Fail),
            (17, AckCode::Retry),
        ] {
            let buf = format_ack(seqno, code).unwrap();
            let (s, c) = parse_ack(&buf).unwrap();
            assert_eq!(s, seqno);
            assert_eq!(c, code);
        }
    }

    #[test]
    fn ack_layout() {
        assert_eq!(&format_ack(0, AckCode::Ok).unwrap(), b"00000K");
        assert_eq!(&format_ack(123, AckCode::Retry).unwrap(), b"00123R");
    }

    #[test]
    fn ack_accepts_space_padding() {
        let (s, c) = parse_ack(b"  123K").unwrap();
        assert_eq!(s, 123);
        assert_eq!(c, AckCode::Ok);
    }

    #[test]
    fn ack_rejects_unknown_codes() {
        assert!(parse_ack(b"00000X").is_err());
        assert!(parse_ack(b"0000").is_err());
        assert!(parse_ack(b"abcdeK").is_err());
    }

    #[test]
    fn ccb_detection() {
        // 24 byte preamble: flag 0x40, length byte 12 pairs
        let mut buf = vec![0u8; 64];
        buf[0] = 0x40;
        buf[1] = 12;
        assert_eq!(ccb_len(&buf), 24);

        // not a CCB at all
        buf[0] = 0x41;
        assert_eq!(ccb_len(&buf), 0);

        // too short to be plausible
        buf[0] = 0x40;
        buf[1] = 11;
        assert_eq!(ccb_len(&buf), 0);

        // length runs past the buffered bytes
        buf[1] = 40;
        assert_eq!(ccb_len(&buf[..64]), 0);
        let long = vec![0x40, 40, 0, 0].into_iter().chain(std::iter::repeat(0).take(96)).collect::<Vec<_>>();
        assert_eq!(ccb_len(&long), 80);
    }

    #[test]
    fn ccb_empty_buffer() {
        assert_eq!(ccb_len(&[]), 0);
        assert_eq!(ccb_len(&[0x40]), 0);
    }
}
