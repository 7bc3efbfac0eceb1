//! Transfer statistics observer
//!
//! A snapshot of the sender's state is serialized to a JSON file for
//! monitoring tools to poll. The file is replaced with a rename so a
//! reader can never observe a torn write, and updates are coalesced to at
//! most one write per second.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::control::unix_now;

#[derive(Clone, Debug, Default, Serialize)]
pub struct SenderStats {
    pub pid: u32,
    pub start_time: i64,
    pub host: String,
    pub port: u16,
    pub connected: bool,
    pub region: i32,
    pub link_id: i32,
    pub host_id: i32,
    pub seqno: u32,
    pub queue_len: usize,
    pub tot_prods: u64,
    pub tot_bytes: u64,
    pub conn_fails: u32,
    pub write_fails: u32,
    pub last_conn_time: i64,
    pub last_send_time: i64,
    pub last_file: String,
}

pub struct StatsWriter {
    path: PathBuf,
    stats: SenderStats,
    last_write: i64,
}

impl StatsWriter {
    pub fn create(path: PathBuf, region: i32, link_id: i32, host_id: i32) -> StatsWriter {
        let stats = SenderStats {
            pid: std::process::id(),
            start_time: unix_now(),
            region,
            link_id,
            host_id,
            ..SenderStats::default()
        };
        StatsWriter {
            path,
            stats,
            last_write: 0,
        }
    }

    /// Apply a mutation and publish it, rate-limited to one write per
    /// second. Failures to publish are ignored; statistics are advisory.
    pub fn update(&mut self, apply: impl FnOnce(&mut SenderStats)) {
        apply(&mut self.stats);
        let now = unix_now();
        if now > self.last_write {
            if self.write_snapshot().is_ok() {
                self.last_write = now;
            }
        }
    }

    /// Publish unconditionally.
    pub fn flush(&mut self) {
        let _ = self.write_snapshot();
        self.last_write = unix_now();
    }

    fn write_snapshot(&self) -> Result<()> {
        let body = serde_json::to_vec_pretty(&self.stats)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            crate::fsutil::make_dirs(parent)?;
        }
        std::fs::write(&tmp, body)
            .with_context(|| format!("write stats snapshot {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("publish stats snapshot {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn snapshot_is_published_whole() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stats.json");
        let mut w = StatsWriter::create(path.clone(), 1, 2, 3);
        w.update(|s| {
            s.host = "collector".to_string();
            s.tot_prods = 42;
        });
        w.flush();

        let body = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["host"], "collector");
        assert_eq!(value["tot_prods"], 42);
        assert_eq!(value["region"], 1);
        assert_eq!(value["pid"], std::process::id());
        // no temp file is left behind
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_parent_is_created() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deep/stats.json");
        let mut w = StatsWriter::create(path.clone(), 0, 0, 0);
        w.flush();
        assert!(path.exists());
    }
}
