//! WMO heading parser
//!
//! The heading format is nominally
//!
//! ```text
//! TTAAII CCCC DDHHMM[ BBB]\r\r\n
//! [NNNXXX\r\r\n]
//! ```
//!
//! but real feeds are sloppy, so the parser is deliberately generous: four
//! spacings of the `ii` group are accepted ("TTAAII ", "TTAAI C", "TTAA I ",
//! "TTAAIC"), a heading with no `ii` at all synthesizes `ii=00`, the
//! date-time group may be 4, 5, or 6 digits with an optional trailing `Z`,
//! and the optional `BBB` and `NNNXXX` groups stay empty when absent. The
//! parse only fails outright when no `CCCC` can be located. Character
//! classes are case-insensitive; the matched text is stored as-is.

pub const TTAAII_LEN: usize = 6;
pub const CCCC_LEN: usize = 4;
pub const DDHHMM_LEN: usize = 6;
pub const BBB_LEN: usize = 3;
pub const NNNXXX_LEN: usize = 6;
pub const NNNXXX_MIN_LEN: usize = 4;

/// Parsed WMO heading fields. Missing optional groups are empty strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WmoHeading {
    pub ttaaii: String,
    pub cccc: String,
    pub ddhhmm: String,
    pub bbb: String,
    pub nnnxxx: String,
}

impl WmoHeading {
    pub fn clear(&mut self) {
        self.ttaaii.clear();
        self.cccc.clear();
        self.ddhhmm.clear();
        self.bbb.clear();
        self.nnnxxx.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ttaaii.is_empty()
    }
}

// isspace(3) character set, not the Rust ASCII whitespace set
fn sp(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\x0b' | b'\x0c' | b'\r')
}

fn al(b: u8) -> bool {
    b.is_ascii_alphabetic()
}

fn dg(b: u8) -> bool {
    b.is_ascii_digit()
}

fn an(b: u8) -> bool {
    b.is_ascii_alphanumeric()
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parse a WMO heading out of `buf`, filling `wmo` with whatever groups are
/// found. Returns false when no heading could be located; fields parsed
/// before the failure point are left populated for diagnostics.
pub fn parse_wmo(buf: &[u8], wmo: &mut WmoHeading) -> bool {
    wmo.clear();
    let len = buf.len();
    let mut cursor: Option<usize> = None;

    // locate the TTAAII group
    let mut p = 0;
    while p + 6 < len {
        let b = &buf[p..];
        if al(b[0]) && al(b[1]) && al(b[2]) && al(b[3]) {
            if dg(b[4]) && dg(b[5]) && (sp(b[6]) || al(b[6])) {
                // 'TTAAII '
                wmo.ttaaii = text(&b[..6]);
                cursor = Some(p + 6);
                break;
            } else if dg(b[4]) && sp(b[5]) && (sp(b[6]) || al(b[6])) {
                // 'TTAAI C'
                wmo.ttaaii = format!("{}0{}", text(&b[..4]), b[4] as char);
                cursor = Some(p + 5);
                break;
            } else if sp(b[4]) && dg(b[5]) && (sp(b[6]) || al(b[6])) {
                // 'TTAA I '
                wmo.ttaaii = format!("{}0{}", text(&b[..4]), b[5] as char);
                cursor = Some(p + 6);
                break;
            } else if dg(b[4]) && al(b[5]) {
                // 'TTAAIC'
                wmo.ttaaii = format!("{}0{}", text(&b[..4]), b[4] as char);
                cursor = Some(p + 5);
                break;
            }
        } else if al(b[0]) && al(b[1]) && al(b[2]) && dg(b[3]) {
            // 'TTA#II '
            if dg(b[4]) && dg(b[5]) && (sp(b[6]) || al(b[6])) {
                wmo.ttaaii = text(&b[..6]);
                cursor = Some(p + 6);
                break;
            }
        } else if b.starts_with(b"\r\r\n") {
            // end of heading line with no TTAAII; the no-ii form may still match
            break;
        }
        p += 1;
    }

    if wmo.ttaaii.is_empty() {
        // look for TTAA CCCC DDHHMM
        let mut p = 0;
        while p + 9 < len {
            let b = &buf[p..];
            if al(b[0]) && al(b[1]) && al(b[2]) && al(b[3]) && sp(b[4])
                && al(b[5]) && al(b[6]) && al(b[7]) && al(b[8]) && sp(b[9])
            {
                wmo.ttaaii = format!("{}00", text(&b[..4]));
                cursor = Some(p + 4);
                break;
            } else if b.starts_with(b"\r\r\n") {
                return false;
            }
            p += 1;
        }
    }

    let mut p = match cursor {
        Some(p) => p,
        None => return false,
    };

    while p < len && sp(buf[p]) {
        p += 1;
    }

    if p + CCCC_LEN > len {
        return false;
    }
    if al(buf[p]) && an(buf[p + 1]) && al(buf[p + 2]) && an(buf[p + 3]) {
        wmo.cccc = text(&buf[p..p + CCCC_LEN]);
        p += CCCC_LEN;
    } else {
        return false;
    }

    let mut spaces = 0;
    while p < len && sp(buf[p]) {
        p += 1;
        spaces += 1;
    }

    // case1: 6 digit date-time group
    if p + 6 <= len && buf[p..p + 6].iter().all(|&b| dg(b)) {
        wmo.ddhhmm = text(&buf[p..p + 6]);
        p += 6;
    }

    // case2: 4 digit date-time group
    if wmo.ddhhmm.is_empty()
        && p + 5 <= len
        && buf[p..p + 4].iter().all(|&b| dg(b))
        && sp(buf[p + 4])
    {
        wmo.ddhhmm = format!("{}00", text(&buf[p..p + 4]));
        p += 4;
    }

    // case3: leading 0 of the date-time group arrived as a space
    if wmo.ddhhmm.is_empty()
        && p + 5 <= len
        && spaces > 1
        && buf[p..p + 5].iter().all(|&b| dg(b))
    {
        wmo.ddhhmm = format!("0{}", text(&buf[p..p + 5]));
        p += 5;
    }

    if p < len && buf[p] == b'Z' {
        p += 1;
    }

    // require a heading terminator, picking up a BBB on the way
    while p < len {
        let b = buf[p];
        if b == b'\r' || b == b'\n' {
            break;
        } else if al(b) {
            if !wmo.bbb.is_empty() {
                return false;
            }
            let mut n = 1;
            while p + n < len && n < BBB_LEN && al(buf[p + n]) {
                n += 1;
            }
            if p + n < len && sp(buf[p + n]) {
                wmo.bbb = text(&buf[p..p + n]);
                p += n;
            } else {
                // bbb is too long or maybe not a bbb at all
                return false;
            }
        } else if sp(b) {
            p += 1;
        } else {
            return false;
        }
    }

    while p < len && sp(buf[p]) {
        p += 1;
    }

    let mut n = 1;
    while p + n < len && n < NNNXXX_LEN && an(buf[p + n]) {
        n += 1;
    }

    if n >= NNNXXX_MIN_LEN {
        // the NNNXXX must be alone on its line
        let mut k = n;
        while p + k < len {
            let b = buf[p + k];
            if b == b'\r' || b == b'\n' {
                wmo.nnnxxx = text(&buf[p..p + n]);
                break;
            }
            if !sp(b) {
                break;
            }
            k += 1;
        }
    }

    true
}

/// Fixed-width WMO segment used by the product records.
pub fn wmo_tag(wmo: &WmoHeading) -> String {
    format!(
        "WMO[{:<6} {:<4} {:<6} {:<3}] {{{}}}",
        wmo.ttaaii, wmo.cccc, wmo.ddhhmm, wmo.bbb, wmo.nnnxxx
    )
}

/// Render a buffer for diagnostics: printable bytes pass through, CR/LF
/// become '*', everything else '?'. Capped at 99 bytes.
pub fn debug_buf(buf: &[u8]) -> String {
    buf.iter()
        .take(99)
        .map(|&b| {
            if b == b'\r' || b == b'\n' {
                '*'
            } else if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(buf: &[u8]) -> (bool, WmoHeading) {
        let mut wmo = WmoHeading::default();
        let ok = parse_wmo(buf, &mut wmo);
        (ok, wmo)
    }

    #[test]
    fn standard_heading() {
        let (ok, wmo) = parse(b"SXUS20 KWAL 011230\r\r\nSFOMIA\r\r\ndata...");
        assert!(ok);
        assert_eq!(wmo.ttaaii, "SXUS20");
        assert_eq!(wmo.cccc, "KWAL");
        assert_eq!(wmo.ddhhmm, "011230");
        assert_eq!(wmo.bbb, "");
        assert_eq!(wmo.nnnxxx, "SFOMIA");
    }

    #[test]
    fn heading_with_bbb() {
        let (ok, wmo) = parse(b"SXUS20 KWAL 011230 RRA\r\r\nbody");
        assert!(ok);
        assert_eq!(wmo.bbb, "RRA");
        assert_eq!(wmo.nnnxxx, "");
    }

    #[test]
    fn four_letter_bbb_rejected() {
        let (ok, wmo) = parse(b"SXUS20 KWAL 011230 RRAA\r\r\n");
        assert!(!ok);
        // groups before the failure are retained
        assert_eq!(wmo.cccc, "KWAL");
        assert_eq!(wmo.bbb, "");
    }

    #[test]
    fn single_digit_ii_before_space() {
        // 'TTAAI C'
        let (ok, wmo) = parse(b"SXUS2 KWAL 011230\r\r\n");
        assert!(ok);
        assert_eq!(wmo.ttaaii, "SXUS02");
        assert_eq!(wmo.cccc, "KWAL");
    }

    #[test]
    fn split_ii_group() {
        // 'TTAA I '
        let (ok, wmo) = parse(b"SXUS 2 KWAL 011230\r\r\n");
        assert!(ok);
        assert_eq!(wmo.ttaaii, "SXUS02");
    }

    #[test]
    fn ii_run_into_cccc() {
        // 'TTAAIC'
        let (ok, wmo) = parse(b"SXUS2KWAL 011230\r\r\n");
        assert!(ok);
        assert_eq!(wmo.ttaaii, "SXUS02");
        assert_eq!(wmo.cccc, "KWAL");
    }

    #[test]
    fn missing_ii_synthesized() {
        let (ok, wmo) = parse(b"SXUS KWAL 011230\r\r\n");
        assert!(ok);
        assert_eq!(wmo.ttaaii, "SXUS00");
        assert_eq!(wmo.cccc, "KWAL");
    }

    #[test]
    fn four_digit_time_group() {
        let (ok, wmo) = parse(b"SXUS20 KWAL 0112 \r\r\n");
        assert!(ok);
        assert_eq!(wmo.ddhhmm, "011200");
    }

    #[test]
    fn space_led_time_group() {
        // extra space before a 5 digit group means the leading 0 got lost
        let (ok, wmo) = parse(b"SXUS20 KWAL  11230\r\r\n");
        assert!(ok);
        assert_eq!(wmo.ddhhmm, "011230");
    }

    #[test]
    fn trailing_z_stripped() {
        let (ok, wmo) = parse(b"SXUS20 KWAL 011230Z\r\r\n");
        assert!(ok);
        assert_eq!(wmo.ddhhmm, "011230");
    }

    #[test]
    fn no_cccc_fails() {
        let (ok, _) = parse(b"12345 67890\r\r\n");
        assert!(!ok);
    }

    #[test]
    fn nnnxxx_must_be_alone_on_line() {
        let (ok, wmo) = parse(b"SXUS20 KWAL 011230\r\r\nSFOMIA more\r\r\n");
        assert!(ok);
        assert_eq!(wmo.nnnxxx, "");
    }

    #[test]
    fn short_nnnxxx_ignored() {
        let (ok, wmo) = parse(b"SXUS20 KWAL 011230\r\r\nAB\r\r\n");
        assert!(ok);
        assert_eq!(wmo.nnnxxx, "");
    }

    #[test]
    fn lower_case_accepted() {
        let (ok, wmo) = parse(b"sxus20 kwal 011230\r\r\n");
        assert!(ok);
        assert_eq!(wmo.ttaaii, "sxus20");
        assert_eq!(wmo.cccc, "kwal");
    }

    #[test]
    fn scan_gives_up_at_heading_terminator() {
        // a \r\r\n before any TTAAII candidate ends the search
        let (ok, _) = parse(b"\x01\r\r\nSXUS20 KWAL 011230\r\r\n");
        assert!(!ok);
    }

    #[test]
    fn debug_buf_masks_controls() {
        assert_eq!(debug_buf(b"AB\r\r\n\x02C"), "AB***?C");
    }
}
