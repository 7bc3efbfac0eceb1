//! Connection announcement
//!
//! When configured, the sender's first product is a fabricated message
//! identifying the data stream: a WMO heading line followed by a marker
//! line and SOURCE/LINK/REMOTE key/value pairs. The receiver validates it
//! before accepting real products and adopts the sender's identity for its
//! log records.

use anyhow::{bail, Context, Result};

use crate::protocol::conn_msg::{LINK_ID, REMOTE_ID, SOURCE_ID, START};

pub const SOURCE_MAX_LEN: usize = 32;
pub const HOSTNAME_MAX_LEN: usize = 64;

/// Identity carried by a parsed announcement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnInfo {
    pub wmo_ttaaii: String,
    pub wmo_cccc: String,
    pub source: String,
    pub remotehost: String,
    pub link_id: i32,
}

/// Build the announcement payload. The date-time group is the current UTC
/// day/hour/minute.
pub fn build_announcement(connect_wmo: &str, source: Option<&str>, link_id: i32) -> String {
    let now = chrono::Utc::now();
    let mut body = format!("{} {}\r\r\n", connect_wmo, now.format("%d%H%M"));
    body.push('\n');
    body.push_str(START);
    body.push('\n');
    body.push_str(&format!("{} {}\n", SOURCE_ID, source.unwrap_or("UNKNOWN")));
    body.push_str(&format!("{} {}\n", LINK_ID, link_id));
    body.push_str(&format!("{} {}\n", REMOTE_ID, crate::fsutil::hostname()));
    body
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Parse an announcement payload. The marker must appear alone on a line;
/// every token after it must be one of the known keys followed by a value.
pub fn parse_announcement(body: &str) -> Result<ConnInfo> {
    let lines: Vec<&str> = body.split(['\r', '\n']).collect();
    let marker = lines
        .iter()
        .position(|l| *l == START)
        .context("no announcement marker line")?;

    let mut info = ConnInfo::default();
    let mut tokens = lines[marker + 1..]
        .iter()
        .flat_map(|l| l.split_ascii_whitespace());

    while let Some(tok) = tokens.next() {
        let val = match tokens.next() {
            Some(v) => v,
            None => bail!("invalid connect message, no value for token={}", tok),
        };
        if tok == REMOTE_ID {
            info.remotehost = truncate(val, HOSTNAME_MAX_LEN);
        } else if tok == SOURCE_ID {
            info.source = truncate(val, SOURCE_MAX_LEN);
        } else if tok == LINK_ID {
            info.link_id = val.parse().unwrap_or(0);
        } else {
            bail!("invalid connect message, token={}", tok);
        }
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let body = build_announcement("SXUS20", Some("nwstg"), 3);
        let info = parse_announcement(&body).unwrap();
        assert_eq!(info.source, "nwstg");
        assert_eq!(info.link_id, 3);
        assert_eq!(info.remotehost, crate::fsutil::hostname());
    }

    #[test]
    fn heading_line_yields_ttaaii() {
        // the announcement heading has no CCCC, so the WMO parse fails
        // overall but still captures the TTAAII the receiver matches on
        let body = build_announcement("SXUS20", None, 0);
        let mut wmo = crate::wmo::WmoHeading::default();
        assert!(!crate::wmo::parse_wmo(body.as_bytes(), &mut wmo));
        assert_eq!(wmo.ttaaii, "SXUS20");
    }

    #[test]
    fn default_source_is_unknown() {
        let body = build_announcement("SXUS20", None, 1);
        let info = parse_announcement(&body).unwrap();
        assert_eq!(info.source, "UNKNOWN");
    }

    #[test]
    fn missing_marker_rejected() {
        assert!(parse_announcement("SXUS20 011230\r\r\nSOURCE x\n").is_err());
    }

    #[test]
    fn unknown_token_rejected() {
        let body = format!("head\r\r\n{}\nBOGUS value\n", START);
        assert!(parse_announcement(&body).is_err());
    }

    #[test]
    fn missing_value_rejected() {
        let body = format!("head\r\r\n{}\nSOURCE\n", START);
        assert!(parse_announcement(&body).is_err());
    }

    #[test]
    fn pairs_in_any_order() {
        let body = format!(
            "head\r\r\n{}\nREMOTE box1 LINK 9\nSOURCE feed\n",
            START
        );
        let info = parse_announcement(&body).unwrap();
        assert_eq!(info.remotehost, "box1");
        assert_eq!(info.link_id, 9);
        assert_eq!(info.source, "feed");
    }
}
