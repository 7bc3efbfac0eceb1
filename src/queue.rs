//! Sender-side input queue
//!
//! Input directories are polled in configured order, highest priority
//! first, into an in-memory candidate list sorted by priority then age.
//! The list is rebuilt when it runs dry or when the refresh interval
//! elapses; a scan bound keeps severe backlogs from starving the send
//! loop. Files that are dot-named, unreadable, suspiciously fresh and
//! empty, or already inside the in-flight window are skipped.
//!
//! After the protocol decides a product's fate, the `Outbox` moves the
//! file into the circular sent or fail area and writes the product record.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use walkdir::WalkDir;

use crate::control::unix_now;
use crate::logger::RecordSink;
use crate::product::{ProdState, Product, ProductTable};
use crate::wmo::{self, wmo_tag};

// grace period for zero-length files that may still be in progress
const ZERO_LEN_GRACE: i64 = 3;

// read-back size for attributing an abort with no parsed WMO
const BACKFILL_READ: usize = 8192;

#[derive(Clone, Debug)]
pub struct QueueOptions {
    /// input directories in decreasing priority order
    pub indirs: Vec<PathBuf>,
    /// rebuild the candidate list this often; <= 0 only rebuilds when empty
    pub refresh_interval: i64,
    /// stop scanning once this many candidates are queued; 0 is unbounded
    pub max_queue_len: usize,
    /// hold back the newest file until a newer one appears
    pub wait_last_file: bool,
    pub verbosity: u8,
}

/// Lightweight scan result; becomes a `Product` when a window slot opens.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub filename: PathBuf,
    pub queue_time: i64,
    pub size: u64,
    pub priority: i32,
}

pub struct InputQueue {
    opt: QueueOptions,
    sink: Arc<dyn RecordSink>,
    queue: Vec<Candidate>,
    cursor: usize,
    last_scan: i64,
}

impl InputQueue {
    pub fn new(opt: QueueOptions, sink: Arc<dyn RecordSink>) -> InputQueue {
        InputQueue {
            opt,
            sink,
            queue: Vec::new(),
            cursor: 0,
            last_scan: 0,
        }
    }

    /// Produce the next candidate. Returns the queue length including the
    /// returned item; 0 means nothing is ready to send.
    pub fn next_file(&mut self, table: &ProductTable) -> (usize, Option<Candidate>) {
        let now = unix_now();

        if self.opt.verbosity > 2 {
            let timer = if self.opt.refresh_interval > 0 && self.last_scan > 0 {
                self.last_scan + self.opt.refresh_interval - now
            } else {
                0
            };
            self.sink.debug(&format!(
                "qlen = {} refresh timer = {}",
                self.queue.len() - self.cursor,
                timer
            ));
        }

        if self.queue.len() == self.cursor
            || (self.opt.refresh_interval > 0
                && now >= self.last_scan + self.opt.refresh_interval)
        {
            self.rescan(table, now);
        }

        if self.cursor < self.queue.len() {
            let newest = self.queue.last().map(|c| c.queue_time).unwrap_or(0);
            let head = &self.queue[self.cursor];
            if !self.opt.wait_last_file || head.queue_time < newest {
                let cand = head.clone();
                if self.opt.verbosity > 1 {
                    self.sink.debug(&format!(
                        "next item is {}, p={}, t={}",
                        cand.filename.display(),
                        cand.priority,
                        cand.queue_time
                    ));
                }
                let remaining = self.queue.len() - self.cursor;
                self.cursor += 1;
                return (remaining, Some(cand));
            }
        }

        if self.opt.verbosity > 1 {
            self.sink.debug("no items to send");
        }
        (0, None)
    }

    fn rescan(&mut self, table: &ProductTable, now: i64) {
        self.queue.clear();
        self.cursor = 0;

        // directories are in prioritized order; items found earlier beat
        // items found later
        let top = self.opt.indirs.len() as i32 - 1;

        'scan: for (i, dir) in self.opt.indirs.iter().enumerate() {
            let priority = top - i as i32;

            let walker = WalkDir::new(dir)
                .min_depth(1)
                .max_depth(1)
                .follow_links(false);
            for entry in walker {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        self.sink
                            .error(&format!("FAIL scan directory {}: {}", dir.display(), e));
                        continue 'scan;
                    }
                };

                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }

                let path = entry.path().to_path_buf();
                // follow symlinks so a linked file is measured, not the link
                let md = match fs::metadata(&path) {
                    Ok(md) => md,
                    Err(e) => {
                        self.sink
                            .error(&format!("FAIL stat file {}: {}", path.display(), e));
                        continue;
                    }
                };
                if !md.is_file() {
                    continue;
                }

                // no read permission for any class means still in progress
                if md.permissions().mode() & 0o444 == 0 {
                    continue;
                }

                let mtime = md
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);

                if md.len() == 0 && mtime > now - ZERO_LEN_GRACE {
                    // give a fresh empty file a few seconds to fill in
                    continue;
                }

                if table.in_flight(&path) {
                    continue;
                }

                self.queue.push(Candidate {
                    filename: path,
                    queue_time: mtime,
                    size: md.len(),
                    priority,
                });

                if self.opt.verbosity > 2 {
                    let c = self.queue.last().expect("just pushed");
                    self.sink.debug(&format!(
                        "added item {}, cnt={} p={}, t={}",
                        c.filename.display(),
                        self.queue.len() - 1,
                        c.priority,
                        c.queue_time
                    ));
                }

                if self.opt.max_queue_len > 0 && self.queue.len() >= self.opt.max_queue_len {
                    break 'scan;
                }
            }
        }

        self.queue
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.queue_time.cmp(&b.queue_time)));

        self.last_scan = now;
    }
}

#[derive(Clone, Debug)]
pub struct OutboxOptions {
    pub sent_dir: PathBuf,
    pub fail_dir: PathBuf,
    /// rotation modulus; also sets the slot filename width
    pub sent_count: u32,
    pub queue_ttl: i64,
    pub verbosity: u8,
}

/// Post-send disposition of products: the circular sent/fail areas and the
/// associated product records.
pub struct Outbox {
    opt: OutboxOptions,
    sink: Arc<dyn RecordSink>,
    sent_slot: u32,
    fail_slot: u32,
    total_count: u64,
}

impl Outbox {
    pub fn new(opt: OutboxOptions, sink: Arc<dyn RecordSink>) -> Outbox {
        Outbox {
            opt,
            sink,
            sent_slot: 0,
            fail_slot: 0,
            total_count: 0,
        }
    }

    fn slot_name(&self, slot: u32) -> String {
        let width = self.opt.sent_count.saturating_sub(1).to_string().len();
        format!("{:0width$}", slot, width = width)
    }

    fn basename(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned())
    }

    fn delay_note(prod: &Product, now: i64) -> String {
        if now > prod.queue_time {
            format!(
                " +{}/{}s",
                prod.send_time - prod.queue_time,
                now - prod.send_time
            )
        } else {
            String::new()
        }
    }

    fn ccb_note(prod: &Product) -> String {
        if prod.ccb_len > 0 {
            format!("+{} ccb", prod.ccb_len)
        } else {
            String::new()
        }
    }

    /// Successfully acknowledged: rotate the file into the sent area and
    /// record the END. Returns the running total of finished products.
    pub fn finish(&mut self, prod: &mut Product) -> u64 {
        if self.opt.verbosity > 2 {
            self.sink
                .debug(&format!("finishing {}", prod.filename.display()));
        }

        let now = unix_now();
        let slot = self.slot_name(self.sent_slot);
        let sentpath = self.opt.sent_dir.join(&slot);
        let log_path = format!("{},{}", Self::basename(&prod.filename), slot);

        if let Err(e) = crate::fsutil::rename_file(&prod.filename, &sentpath) {
            self.sink.error(&format!(
                "FAIL rename {} to {}: {:#}",
                prod.filename.display(),
                sentpath.display(),
                e
            ));
        } else {
            prod.filename = sentpath;
        }

        self.sink.product(&format!(
            "END {} {} #{} bytes({}{}) f({}) /P{}{}",
            Local::now().format("%m/%d/%Y %T"),
            wmo_tag(&prod.wmo),
            prod.seqno,
            prod.size,
            Self::ccb_note(prod),
            log_path,
            prod.priority,
            Self::delay_note(prod, now),
        ));

        self.sent_slot = (self.sent_slot + 1) % self.opt.sent_count.max(1);
        self.total_count += 1;
        self.total_count
    }

    /// Fatally failed: rotate the file into the fail area and record the
    /// ABORT with its reason.
    pub fn abort(&mut self, prod: &mut Product) {
        if self.opt.verbosity > 0 {
            self.sink
                .debug(&format!("discarding {}", prod.filename.display()));
        }

        let now = unix_now();
        let slot = self.slot_name(self.fail_slot);
        let failpath = self.opt.fail_dir.join(&slot);
        let log_path = format!("{},{}", Self::basename(&prod.filename), slot);

        if let Err(e) = crate::fsutil::rename_file(&prod.filename, &failpath) {
            self.sink.error(&format!(
                "FAIL rename {} to {}: {:#}",
                prod.filename.display(),
                failpath.display(),
                e
            ));
        } else {
            prod.filename = failpath;
        }

        // attribute the abort even when the product never got far enough
        // for its heading to be parsed
        if prod.wmo.is_empty() {
            if let Ok(body) = fs::read(&prod.filename) {
                let head = &body[..body.len().min(BACKFILL_READ)];
                wmo::parse_wmo(head, &mut prod.wmo);
            }
        }

        let reason = match prod.state {
            ProdState::Nacked => "NACK".to_string(),
            ProdState::Dead => format!("TTL {} SECS", self.opt.queue_ttl),
            _ => format!("{} ERRS", prod.send_count),
        };

        self.sink.product(&format!(
            "ABORT({}) {} {} #{} bytes({}{}) f({}) /P{}{}",
            reason,
            Local::now().format("%m/%d/%Y %T"),
            wmo_tag(&prod.wmo),
            prod.seqno,
            prod.size,
            Self::ccb_note(prod),
            log_path,
            prod.priority,
            Self::delay_note(prod, now),
        ));

        self.fail_slot = (self.fail_slot + 1) % self.opt.sent_count.max(1);
    }

    /// A retransmission was requested; record it.
    pub fn retry(&self, prod: &Product) {
        if self.opt.verbosity > 0 {
            self.sink
                .debug(&format!("retrying {}", prod.filename.display()));
        }

        let now = unix_now();
        self.sink.product(&format!(
            "RETRY[{}] {} {} #{} bytes({}{}) f({}) /P{}{}",
            prod.send_count,
            Local::now().format("%m/%d/%Y %T"),
            wmo_tag(&prod.wmo),
            prod.seqno,
            prod.size,
            Self::ccb_note(prod),
            Self::basename(&prod.filename),
            prod.priority,
            Self::delay_note(prod, now),
        ));
    }
}
