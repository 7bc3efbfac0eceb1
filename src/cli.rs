//! Command-line options shared by the two binaries
//!
//! The short option letters are a compatibility surface with the
//! historical tools; long names are provided for readability. Validation
//! beyond simple type checks lives in `validate` so the binaries can exit
//! with the documented argument-error status.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};

use crate::protocol::{defaults, DFLT_BUFSIZE, DFLT_LISTEN_PORT, DISCARD_PORT, MAX_BUFSIZE, MIN_BUFSIZE};

/// Parse a TTL of the form `N[smhd]` into seconds.
pub fn parse_ttl(arg: &str) -> Result<i64, String> {
    let split = arg
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(arg.len());
    let (digits, unit) = arg.split_at(split);
    let n: i64 = digits
        .parse()
        .map_err(|_| format!("invalid ttl {:?}", arg))?;
    if n < 1 {
        return Err("ttl must be at least 1 second".to_string());
    }
    let mult = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        other => return Err(format!("unknown ttl unit {:?}", other)),
    };
    Ok(n * mult)
}

/// Base name of the running executable.
pub fn program_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "prodlink".to_string())
}

#[derive(Clone, Debug, Parser)]
#[command(
    name = "prodsend",
    about = "Poll input directories and ship each file to a receiver over TCP",
    disable_help_flag = true
)]
pub struct SendArgs {
    /// Remote port to connect to
    #[arg(short = 'p', long = "port", default_value_t = DFLT_LISTEN_PORT)]
    pub port: u16,

    /// Destination host; repeat for alternates ("null" selects discard mode)
    #[arg(short = 'n', long = "host", action = ArgAction::Append)]
    pub hosts: Vec<String>,

    /// Socket timeout and ack deadline in seconds
    #[arg(short = 't', long = "timeout", default_value_t = defaults::SEND_TIMEOUT)]
    pub timeout: u64,

    /// Input poll interval in seconds when idle
    #[arg(short = 'i', long = "poll-interval", default_value_t = defaults::POLL_INTERVAL)]
    pub poll_interval: u64,

    /// Discard files older than this before sending (suffix s, m, h, or d)
    #[arg(short = 'l', long = "ttl", value_parser = parse_ttl)]
    pub queue_ttl: Option<i64>,

    /// Ack window size
    #[arg(short = 'w', long = "window", default_value_t = defaults::WINDOW_SIZE)]
    pub window_size: usize,

    /// Max send attempts per product; -1 is unbounded
    #[arg(short = 'r', long = "retry", default_value_t = defaults::MAX_RETRY, allow_hyphen_values = true)]
    pub max_retry: i32,

    /// Send/receive buffer size in bytes
    #[arg(short = 'b', long = "bufsize", default_value_t = DFLT_BUFSIZE)]
    pub bufsize: usize,

    /// Send a connection announcement with this WMO heading
    #[arg(short = 'c', long = "connect-wmo")]
    pub connect_wmo: Option<String>,

    /// Source identifier for this data stream
    #[arg(short = 's', long = "source")]
    pub source: Option<String>,

    /// Strip CCB preambles before transmission
    #[arg(short = 'x', long = "strip-ccb")]
    pub strip_ccb: bool,

    /// Input directory; repeat in decreasing priority order
    #[arg(short = 'D', long = "indir", action = ArgAction::Append)]
    pub indirs: Vec<PathBuf>,

    /// Hold the newest file back until a newer one arrives
    #[arg(short = 'L', long = "wait-last-file")]
    pub wait_last_file: bool,

    /// Queue refresh interval in seconds; -1 only refreshes when empty
    #[arg(short = 'I', long = "refresh", default_value_t = defaults::REFRESH_INTERVAL, allow_hyphen_values = true)]
    pub refresh_interval: i64,

    /// Stop scanning after this many queued items; -1 is unbounded
    #[arg(short = 'Q', long = "max-queue", default_value_t = defaults::MAX_QUEUE_LEN as i64, allow_hyphen_values = true)]
    pub max_queue_len: i64,

    /// Keep up to this many files in the sent and fail rotations
    #[arg(short = 'N', long = "sent-count", default_value_t = defaults::SENT_COUNT)]
    pub sent_count: u32,

    /// Sent directory (default: sibling "sent" of the first input dir)
    #[arg(short = 'S', long = "sent-dir")]
    pub sent_dir: Option<PathBuf>,

    /// Failure directory (default: sibling "fail" of the first input dir)
    #[arg(short = 'F', long = "fail-dir")]
    pub fail_dir: Option<PathBuf>,

    /// Stay in the foreground and echo records to stdout
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Verbosity level
    #[arg(short = 'v', long = "verbosity", default_value_t = 0)]
    pub verbosity: u8,

    /// Archive rolled log files instead of renaming to .old
    #[arg(short = 'a', long = "archive-logs")]
    pub archive_logs: bool,

    /// Log directory
    #[arg(short = 'P', long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    /// Statistics region index; enables the stats snapshot
    #[arg(short = 'm', long = "stats-region", default_value_t = -1, allow_hyphen_values = true)]
    pub shm_region: i32,

    /// Statistics host index
    #[arg(short = 'h', long = "host-id", default_value_t = 0)]
    pub host_id: i32,

    /// Statistics link index
    #[arg(short = 'k', long = "link-id", default_value_t = 0)]
    pub link_id: i32,

    #[arg(long = "help", action = ArgAction::Help, help = "Print help")]
    help: Option<bool>,
}

impl SendArgs {
    pub fn validate(&self) -> Result<()> {
        if self.port < 1024 && self.port != DISCARD_PORT {
            bail!("invalid port {}; use a port above 1024", self.port);
        }
        if self.timeout < 1 {
            bail!("invalid timeout interval; must be > 0");
        }
        if self.poll_interval < 1 {
            bail!("invalid poll interval; must be > 0");
        }
        if self.window_size < 1 {
            bail!("invalid window size; must be > 0");
        }
        if !(-1..=99).contains(&self.max_retry) {
            bail!("invalid max retry {}; must be in [-1, 99]", self.max_retry);
        }
        if !(MIN_BUFSIZE..=MAX_BUFSIZE).contains(&self.bufsize) {
            bail!(
                "invalid buffer size {}; must be in [{}, {}]",
                self.bufsize,
                MIN_BUFSIZE,
                MAX_BUFSIZE
            );
        }
        if self.refresh_interval != -1 && self.refresh_interval <= 0 {
            bail!("invalid refresh interval; must be -1 or > 0");
        }
        if self.refresh_interval > 0 && (self.refresh_interval as u64) < self.poll_interval {
            bail!(
                "refresh interval {} must be >= poll interval {}",
                self.refresh_interval,
                self.poll_interval
            );
        }
        if self.max_queue_len != -1 && self.max_queue_len <= 0 {
            bail!("invalid max queue len; must be -1 or > 0");
        }
        if self.max_queue_len == 1 && self.wait_last_file {
            bail!("max queue len must be > 1 for the last-file wait option");
        }
        if self.sent_count < 1 {
            bail!("invalid sent count; must be >= 1");
        }
        if self.wait_last_file && self.sent_count < 2 {
            bail!("sent count must be >= 2 with the last-file wait option");
        }
        if !(-1..=99).contains(&self.shm_region) {
            bail!("invalid stats region; must be -1 or in [0, 99]");
        }
        if !(0..=99).contains(&self.host_id) {
            bail!("invalid host_id; must be in [0, 99]");
        }
        if !(0..=99).contains(&self.link_id) {
            bail!("invalid link_id; must be in [0, 99]");
        }
        Ok(())
    }

    /// Host list and effective port. A host named "null" switches to the
    /// local host and the discard port: everything is "sent" with no
    /// receiver involved.
    pub fn resolve_hosts(&self) -> (Vec<String>, u16) {
        if self.hosts.is_empty() {
            return (vec![crate::fsutil::hostname()], self.port);
        }
        let discard = self
            .hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case("null"));
        if discard {
            (vec![crate::fsutil::hostname()], DISCARD_PORT)
        } else {
            (self.hosts.clone(), self.port)
        }
    }

    /// Input, sent, and fail directories with their defaults applied.
    pub fn resolve_dirs(&self) -> Result<(Vec<PathBuf>, PathBuf, PathBuf)> {
        let indirs = if self.indirs.is_empty() {
            vec![std::env::current_dir()?.join(defaults::INPUT_SUBDIR)]
        } else {
            self.indirs.clone()
        };

        let sibling = |name: &str| -> PathBuf {
            match indirs[0].parent() {
                Some(parent) => parent.join(name),
                None => PathBuf::from(name),
            }
        };
        let sent_dir = self
            .sent_dir
            .clone()
            .unwrap_or_else(|| sibling(defaults::SENT_SUBDIR));
        let fail_dir = self
            .fail_dir
            .clone()
            .unwrap_or_else(|| sibling(defaults::FAIL_SUBDIR));

        Ok((indirs, sent_dir, fail_dir))
    }
}

#[derive(Clone, Debug, Parser)]
#[command(
    name = "prodrecv",
    about = "Accept product streams and store each file under the output directory"
)]
pub struct RecvArgs {
    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value_t = DFLT_LISTEN_PORT)]
    pub port: u16,

    /// Max concurrent workers; 0 serves connections inline
    #[arg(short = 'w', long = "max-worker", default_value_t = defaults::MAX_WORKER)]
    pub max_worker: usize,

    /// Socket timeout in seconds
    #[arg(short = 't', long = "timeout", default_value_t = defaults::RECV_TIMEOUT)]
    pub timeout: u64,

    /// Receive buffer size in bytes
    #[arg(short = 'b', long = "bufsize", default_value_t = DFLT_BUFSIZE)]
    pub bufsize: usize,

    /// Append this suffix to the program identity
    #[arg(short = 's', long = "source")]
    pub source: Option<String>,

    /// Output directory (default: ./output)
    #[arg(short = 'D', long = "outdir")]
    pub outdir: Option<PathBuf>,

    /// Overwrite colliding output files instead of waiting them out
    #[arg(short = 'O', long = "overwrite")]
    pub overwrite: bool,

    /// Create files write-only, flip readable after the last byte
    #[arg(short = 'P', long = "toggle-perms")]
    pub toggle_perms: bool,

    /// Require a connection announcement with this WMO heading
    #[arg(short = 'c', long = "connect-wmo")]
    pub connect_wmo: Option<String>,

    /// Log directory
    #[arg(short = 'l', long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    /// Verbosity level
    #[arg(short = 'v', long = "verbosity", default_value_t = 0)]
    pub verbosity: u8,

    /// Archive rolled log files instead of renaming to .old
    #[arg(short = 'a', long = "archive-logs")]
    pub archive_logs: bool,

    /// Stay in the foreground and echo records to stdout
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Statistics region index (accepted for compatibility)
    #[arg(short = 'm', long = "stats-region", default_value_t = -1, allow_hyphen_values = true)]
    pub shm_region: i32,
}

impl RecvArgs {
    pub fn validate(&self) -> Result<()> {
        if self.max_worker > 100_000 {
            bail!("invalid max_worker {}; max is 100000", self.max_worker);
        }
        if !(MIN_BUFSIZE..=MAX_BUFSIZE).contains(&self.bufsize) {
            bail!(
                "invalid buffer size {}; must be in [{}, {}]",
                self.bufsize,
                MIN_BUFSIZE,
                MAX_BUFSIZE
            );
        }
        Ok(())
    }

    pub fn resolve_outdir(&self) -> Result<PathBuf> {
        Ok(match &self.outdir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?.join(defaults::OUTPUT_SUBDIR),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_units() {
        assert_eq!(parse_ttl("30").unwrap(), 30);
        assert_eq!(parse_ttl("30s").unwrap(), 30);
        assert_eq!(parse_ttl("5m").unwrap(), 300);
        assert_eq!(parse_ttl("2h").unwrap(), 7200);
        assert_eq!(parse_ttl("1d").unwrap(), 86400);
        assert!(parse_ttl("0").is_err());
        assert!(parse_ttl("5w").is_err());
        assert!(parse_ttl("abc").is_err());
    }

    #[test]
    fn send_args_defaults() {
        let args = SendArgs::try_parse_from(["prodsend"]).unwrap();
        assert_eq!(args.port, DFLT_LISTEN_PORT);
        assert_eq!(args.window_size, defaults::WINDOW_SIZE);
        assert_eq!(args.max_retry, defaults::MAX_RETRY);
        assert!(args.queue_ttl.is_none());
        args.validate().unwrap();
    }

    #[test]
    fn send_args_repeatable_flags() {
        let args = SendArgs::try_parse_from([
            "prodsend", "-n", "primary", "-n", "backup", "-D", "/a", "-D", "/b",
        ])
        .unwrap();
        assert_eq!(args.hosts, ["primary", "backup"]);
        assert_eq!(args.indirs.len(), 2);
        let (hosts, port) = args.resolve_hosts();
        assert_eq!(hosts, ["primary", "backup"]);
        assert_eq!(port, DFLT_LISTEN_PORT);
    }

    #[test]
    fn null_host_selects_discard_mode() {
        let args = SendArgs::try_parse_from(["prodsend", "-n", "null"]).unwrap();
        let (hosts, port) = args.resolve_hosts();
        assert_eq!(port, DISCARD_PORT);
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn wait_last_file_needs_deeper_queue() {
        let args =
            SendArgs::try_parse_from(["prodsend", "-L", "-Q", "1"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn refresh_must_cover_poll_interval() {
        let args =
            SendArgs::try_parse_from(["prodsend", "-i", "30", "-I", "5"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn sent_dir_defaults_to_sibling() {
        let args = SendArgs::try_parse_from(["prodsend", "-D", "/data/input"]).unwrap();
        let (indirs, sent, fail) = args.resolve_dirs().unwrap();
        assert_eq!(indirs[0], PathBuf::from("/data/input"));
        assert_eq!(sent, PathBuf::from("/data/sent"));
        assert_eq!(fail, PathBuf::from("/data/fail"));
    }

    #[test]
    fn recv_args_validation() {
        let args = RecvArgs::try_parse_from(["prodrecv"]).unwrap();
        args.validate().unwrap();

        let args = RecvArgs::try_parse_from(["prodrecv", "-b", "4"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn ttl_flag_parses_into_seconds() {
        let args = SendArgs::try_parse_from(["prodsend", "-l", "10m"]).unwrap();
        assert_eq!(args.queue_ttl, Some(600));
    }
}
