//! Record sinks
//!
//! Error, debug, and product records share one append-only log file per
//! program. The file rolls over on a size threshold (checked every 50
//! writes or 30 seconds) and on a day boundary; rollover either renames to
//! `<name>.old` or, in archive mode, moves the file under
//! `<dir>/ARCHIVE/<MonDD>/`. Writes are buffered and flushed every 5
//! records or 2 seconds.
//!
//! Environment overrides: `LOG_DIR_PATH`, `LOG_MAX_FILE_SIZE`,
//! `LOG_FLUSH_TIME_INTERVAL`, `LOG_RETENTION=archive`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use parking_lot::Mutex;

use crate::fsutil;

const DFLT_LOG_DIR: &str = "/tmp/logs";
const DFLT_MAX_SIZE: u64 = 1024 * 4096;
const WRITES_PER_CHECK: u32 = 50;
const CHECK_TIME_INTERVAL: i64 = 30;
const WRITES_PER_FLUSH: u32 = 5;
const DFLT_FLUSH_TIME_INTERVAL: i64 = 2;

/// Destination for the three record streams. The product stream carries
/// the structured START/CONNECT/STATUS/END/ABORT/RETRY/EXIT records.
pub trait RecordSink: Send + Sync {
    fn error(&self, line: &str);
    fn debug(&self, line: &str);
    fn product(&self, line: &str);
    /// Re-point the sink at a new base name (worker identity change).
    fn rename(&self, _new_name: &str) {}
    fn flush(&self) {}
}

/// Sink that drops everything; used by tests and embedded engines.
pub struct NoopSink;

impl RecordSink for NoopSink {
    fn error(&self, _line: &str) {}
    fn debug(&self, _line: &str) {}
    fn product(&self, _line: &str) {}
}

#[derive(Clone, Debug)]
pub struct LogOptions {
    /// log directory; empty means `LOG_DIR_PATH` or the built-in default
    pub dir: PathBuf,
    /// move rolled files to an ARCHIVE tree instead of `.old`
    pub archive: bool,
    /// echo every record to stdout (foreground/debug mode)
    pub echo: bool,
    /// size threshold for rollover; 0 means `LOG_MAX_FILE_SIZE` or 4 MiB
    pub max_size: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            dir: PathBuf::new(),
            archive: false,
            echo: false,
            max_size: 0,
        }
    }
}

struct LogState {
    program: String,
    dir: PathBuf,
    path: PathBuf,
    max_size: u64,
    archive: bool,
    echo: bool,
    flush_interval: i64,
    stream: Option<BufWriter<File>>,
    writes_since_check: u32,
    last_check: i64,
    writes_since_flush: u32,
    last_flush: i64,
    last_write: i64,
}

/// File-backed record sink.
pub struct LogFile {
    state: Mutex<LogState>,
}

impl LogFile {
    pub fn open(program: &str, opts: &LogOptions) -> Result<LogFile> {
        let dir = if opts.dir.as_os_str().is_empty() {
            match std::env::var_os("LOG_DIR_PATH") {
                Some(d) if !d.is_empty() => PathBuf::from(d),
                _ => PathBuf::from(DFLT_LOG_DIR),
            }
        } else {
            opts.dir.clone()
        };

        let max_size = if opts.max_size > 0 {
            opts.max_size
        } else {
            std::env::var("LOG_MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v: &u64| v > 0)
                .unwrap_or(DFLT_MAX_SIZE)
        };

        let archive = opts.archive
            || std::env::var("LOG_RETENTION")
                .map(|v| v.starts_with("archive"))
                .unwrap_or(false);

        let flush_interval = std::env::var("LOG_FLUSH_TIME_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v: &i64| v > 0)
            .unwrap_or(DFLT_FLUSH_TIME_INTERVAL);

        let path = dir.join(format!("{}.log", program));
        let now = crate::control::unix_now();
        let mut state = LogState {
            program: program.to_string(),
            dir,
            path,
            max_size,
            archive,
            echo: opts.echo,
            flush_interval,
            stream: None,
            writes_since_check: 0,
            last_check: now,
            writes_since_flush: 0,
            last_flush: now,
            last_write: now,
        };
        state.ensure_stream()?;
        Ok(LogFile {
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.state.lock().path.clone()
    }

    fn write_line(&self, line: &str) {
        let mut st = self.state.lock();
        if let Err(e) = st.write_line(line) {
            eprintln!("{}: log write failed: {:#}", st.program, e);
        }
    }
}

impl RecordSink for LogFile {
    fn error(&self, line: &str) {
        let prefix = log_prefix(&self.state.lock().program);
        self.write_line(&format!("{}: {}", prefix, line));
    }

    fn debug(&self, line: &str) {
        let prefix = log_prefix(&self.state.lock().program);
        self.write_line(&format!("{}: {}", prefix, line));
    }

    fn product(&self, line: &str) {
        self.write_line(line);
    }

    fn rename(&self, new_name: &str) {
        let mut st = self.state.lock();
        let _ = st.flush();
        st.stream = None;
        st.program = new_name.to_string();
        st.path = st.dir.join(format!("{}.log", new_name));
        if let Err(e) = st.ensure_stream() {
            eprintln!("{}: log rename failed: {:#}", st.program, e);
        }
    }

    fn flush(&self) {
        let _ = self.state.lock().flush();
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        let _ = self.state.lock().flush();
    }
}

/// Heading of each error and debug entry: program name and a local
/// timestamp.
pub fn log_prefix(program: &str) -> String {
    format!("{} {}", program, Local::now().format("%m/%d/%Y %T"))
}

impl LogState {
    fn ensure_stream(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fsutil::make_dirs(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open log file {}", self.path.display()))?;
        self.stream = Some(BufWriter::new(file));
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.ensure_stream()?;
        let now = crate::control::unix_now();

        if self.day_changed(now) {
            self.roll(now)?;
        }

        self.writes_since_check += 1;
        if self.writes_since_check > WRITES_PER_CHECK
            || now - self.last_check > CHECK_TIME_INTERVAL
        {
            self.writes_since_check = 0;
            self.last_check = now;
            if self.over_size()? {
                self.roll(now)?;
            }
        }

        let stream = self.stream.as_mut().expect("stream opened above");
        writeln!(stream, "{}", line)?;
        if self.echo {
            println!("{}", line);
        }

        self.last_write = now;
        self.writes_since_flush += 1;
        if self.writes_since_flush > WRITES_PER_FLUSH
            || now - self.last_flush > self.flush_interval
        {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream.flush()?;
            self.last_flush = crate::control::unix_now();
            self.writes_since_flush = 0;
        }
        Ok(())
    }

    fn over_size(&mut self) -> Result<bool> {
        self.flush()?;
        match std::fs::metadata(&self.path) {
            Ok(md) => Ok(md.len() > self.max_size),
            Err(_) => Ok(false),
        }
    }

    fn day_changed(&self, now: i64) -> bool {
        let last = Local
            .timestamp_opt(self.last_write, 0)
            .single()
            .map(|t| t.date_naive());
        let curr = Local.timestamp_opt(now, 0).single().map(|t| t.date_naive());
        matches!((last, curr), (Some(a), Some(b)) if a != b)
    }

    fn roll(&mut self, _now: i64) -> Result<()> {
        self.flush()?;
        self.stream = None;
        let result = if self.archive {
            self.archive_current()
        } else {
            rotate_to_old(&self.path)
        };
        if let Err(e) = result {
            eprintln!("{}: log rollover failed: {:#}", self.program, e);
        }
        self.ensure_stream()
    }

    fn archive_current(&self) -> Result<()> {
        let when = Local
            .timestamp_opt(self.last_write, 0)
            .single()
            .unwrap_or_else(Local::now);
        let subdir = self.dir.join("ARCHIVE").join(when.format("%b%d").to_string());
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        let name = format!("{}.{}", stem, when.format("%H.%M.%S"));
        fsutil::rename_file(&self.path, &subdir.join(name))
    }
}

fn rotate_to_old(path: &Path) -> Result<()> {
    fsutil::rename_file(path, &path.with_extension("old"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_sink(dir: &Path, max_size: u64) -> LogFile {
        LogFile::open(
            "testprog",
            &LogOptions {
                dir: dir.to_path_buf(),
                max_size,
                ..LogOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn records_are_appended_in_order() {
        let tmp = TempDir::new().unwrap();
        let sink = open_sink(tmp.path(), 0);
        sink.product("START one");
        sink.product("END two");
        sink.flush();
        let body = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines, ["START one", "END two"]);
    }

    #[test]
    fn error_records_carry_program_prefix() {
        let tmp = TempDir::new().unwrap();
        let sink = open_sink(tmp.path(), 0);
        sink.error("FAIL something");
        sink.flush();
        let body = std::fs::read_to_string(sink.path()).unwrap();
        assert!(body.starts_with("testprog "));
        assert!(body.contains(": FAIL something"));
    }

    #[test]
    fn size_rollover_to_dot_old() {
        let tmp = TempDir::new().unwrap();
        let sink = open_sink(tmp.path(), 64);
        // exceed 64 bytes, then push past the 50-write check threshold
        for i in 0..60 {
            sink.product(&format!("END record number {}", i));
        }
        sink.flush();
        assert!(tmp.path().join("testprog.old").exists());
        assert!(sink.path().exists());
    }

    #[test]
    fn rename_moves_subsequent_records() {
        let tmp = TempDir::new().unwrap();
        let sink = open_sink(tmp.path(), 0);
        sink.product("before");
        sink.rename("testprog-src");
        sink.product("after");
        sink.flush();
        let renamed = std::fs::read_to_string(tmp.path().join("testprog-src.log")).unwrap();
        assert!(renamed.contains("after"));
        assert!(!renamed.contains("before"));
        let original = std::fs::read_to_string(tmp.path().join("testprog.log")).unwrap();
        assert!(original.contains("before"));
    }

    #[test]
    fn missing_log_dir_is_created() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("logs/deep");
        let sink = open_sink(&dir, 0);
        sink.product("hello");
        sink.flush();
        assert!(dir.join("testprog.log").exists());
    }
}
