//! Shared wire-protocol constants for the framed product transport

// Message layout: 10-byte message header, 22-byte product header, payload.
// msg_size on the wire counts the product header plus the payload only.
pub const MSG_HDR_LEN: usize = 10;
pub const PROD_HDR_LEN: usize = 22;
pub const FULL_HDR_LEN: usize = MSG_HDR_LEN + PROD_HDR_LEN;

pub const ACK_MSG_LEN: usize = 6;

// The size field is 8 decimal digits and includes the product header
pub const MAX_PROD_SIZE: u64 = 99_999_999 - PROD_HDR_LEN as u64;

// The seqno field is 5 decimal digits
pub const MAX_PROD_SEQNO: u32 = 99_999;

/// Advance a product sequence number with wrap-around.
pub fn next_seqno(seqno: u32) -> u32 {
    (seqno + 1) % (MAX_PROD_SEQNO + 1)
}

pub const DFLT_LISTEN_PORT: u16 = 53_000;
pub const DFLT_BUFSIZE: usize = 32 * 1024;

// A buffer must be big enough to hold a full header or an ack
pub const MIN_BUFSIZE: usize = FULL_HDR_LEN + 1;
pub const MAX_BUFSIZE: usize = 1024 * 1024;

// The well-known discard service; a destination of "null" sends here and
// every ack is fabricated locally
pub const DISCARD_PORT: u16 = 9;

// First receive block must be big enough to always contain a complete WMO
pub const FIRST_BLK_SIZE: usize = 1024;

/// CCB preamble framing.
pub mod ccb {
    pub const FLAG_BYTE: usize = 0;
    pub const LENGTH_BYTE: usize = 1;
    pub const FLAG_VAL: u8 = 0x40;
    pub const MIN_HDR_LEN: usize = 24;
    pub const MAX_HDR_LEN: usize = 1024;
}

/// Connection-announcement payload tokens.
pub mod conn_msg {
    pub const START: &str = "CONNECTION MESSAGE";
    pub const REMOTE_ID: &str = "REMOTE";
    pub const SOURCE_ID: &str = "SOURCE";
    pub const LINK_ID: &str = "LINK";
}

pub mod defaults {
    pub const SEND_TIMEOUT: u64 = 5 * 60;
    pub const POLL_INTERVAL: u64 = 3;
    pub const WINDOW_SIZE: usize = 100;
    pub const REFRESH_INTERVAL: i64 = 20;
    pub const MAX_RETRY: i32 = 3;
    pub const MAX_QUEUE_LEN: usize = 2000;
    pub const SENT_COUNT: u32 = 1000;
    pub const RECV_TIMEOUT: u64 = 30 * 60;
    pub const MAX_WORKER: usize = 99;
    pub const INPUT_SUBDIR: &str = "input";
    pub const SENT_SUBDIR: &str = "sent";
    pub const FAIL_SUBDIR: &str = "fail";
    pub const OUTPUT_SUBDIR: &str = "output";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_wraps_at_one_hundred_thousand() {
        assert_eq!(next_seqno(0), 1);
        assert_eq!(next_seqno(MAX_PROD_SEQNO - 1), MAX_PROD_SEQNO);
        assert_eq!(next_seqno(MAX_PROD_SEQNO), 0);
    }

    #[test]
    fn buffer_floor_holds_a_full_header() {
        assert!(MIN_BUFSIZE > FULL_HDR_LEN);
        assert!(MIN_BUFSIZE > ACK_MSG_LEN);
    }
}
