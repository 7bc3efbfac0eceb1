//! Receiver-side product storage hooks
//!
//! The service decides protocol matters; everything about where a product
//! lands and what happens once it is complete sits behind the `Store`
//! trait so deployments can swap in their own naming scheme. The default
//! store files products as `<outdir>/<pid>-<seqno>` and writes the END
//! records.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use parking_lot::Mutex;

use crate::announce::ConnInfo;
use crate::control::unix_now;
use crate::logger::RecordSink;
use crate::product::Product;
use crate::wmo::wmo_tag;

/// Outcome of the post-receipt hook; decides the ack code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Ok,
    Retry,
    Fail,
}

pub trait Store: Send + Sync {
    /// Choose the output path for a product about to be received.
    fn out_path(&self, prod: &Product) -> Result<PathBuf>;

    /// The product is complete on disk.
    fn finish(&self, prod: &Product, conn: Option<&ConnInfo>) -> Disposition;

    /// Remove a product that cannot be completed.
    fn abort(&self, prod: &Product);
}

/// Default store: `<outdir>/<pid>-<seqno>` naming, END/ABORT records, and
/// a STATUS heartbeat every 100 products.
pub struct FileStore {
    outdir: PathBuf,
    program: String,
    verbosity: u8,
    sink: Arc<dyn RecordSink>,
    total_count: Mutex<u64>,
}

impl FileStore {
    pub fn new(
        outdir: PathBuf,
        program: &str,
        verbosity: u8,
        sink: Arc<dyn RecordSink>,
    ) -> FileStore {
        FileStore {
            outdir,
            program: program.to_string(),
            verbosity,
            sink,
            total_count: Mutex::new(0),
        }
    }

    fn log_path(&self, prod: &Product) -> String {
        prod.filename
            .strip_prefix(&self.outdir)
            .unwrap_or(&prod.filename)
            .to_string_lossy()
            .into_owned()
    }
}

fn delay_note(queue_time: i64, now: i64) -> String {
    if now > queue_time {
        format!(" +{}s", now - queue_time)
    } else {
        String::new()
    }
}

impl Store for FileStore {
    fn out_path(&self, prod: &Product) -> Result<PathBuf> {
        let name = format!("{:05}-{:06}", std::process::id(), prod.seqno % 1_000_000);
        Ok(self.outdir.join(name))
    }

    fn finish(&self, prod: &Product, conn: Option<&ConnInfo>) -> Disposition {
        if self.verbosity > 2 {
            self.sink.debug(&format!(
                "received {}, {} bytes",
                prod.filename.display(),
                prod.size
            ));
        }

        let now = unix_now();
        let total = {
            let mut count = self.total_count.lock();
            *count += 1;
            *count
        };

        if total % 100 == 0 {
            let source = conn.map(|c| c.source.as_str()).filter(|s| !s.is_empty());
            let remote = conn
                .map(|c| c.remotehost.as_str())
                .filter(|s| !s.is_empty());
            self.sink.product(&format!(
                "STATUS [{}] pid({}) host:{} {}-l{} from={} tot({}) dir({})",
                self.program,
                std::process::id(),
                crate::fsutil::hostname(),
                source.unwrap_or("unknown"),
                conn.map(|c| c.link_id).unwrap_or(0),
                remote.unwrap_or("unknown"),
                total,
                self.outdir.display(),
            ));
        }

        self.sink.product(&format!(
            "END {} {} #{} bytes({}) f({}){}",
            Local::now().format("%m/%d/%Y %T"),
            wmo_tag(&prod.wmo),
            prod.seqno,
            prod.size,
            self.log_path(prod),
            delay_note(prod.queue_time, now),
        ));

        Disposition::Ok
    }

    fn abort(&self, prod: &Product) {
        if self.verbosity > 2 {
            self.sink.debug(&format!(
                "aborting #{} {}, {} bytes",
                prod.seqno,
                prod.filename.display(),
                prod.size
            ));
        }

        self.sink.product(&format!(
            "ABORT {} {} #{} bytes({}) f({}){}",
            Local::now().format("%m/%d/%Y %T"),
            wmo_tag(&prod.wmo),
            prod.seqno,
            prod.size,
            prod.filename.display(),
            delay_note(prod.queue_time, unix_now()),
        ));

        if let Err(e) = std::fs::remove_file(&prod.filename) {
            if e.kind() != std::io::ErrorKind::NotFound {
                self.sink.error(&format!(
                    "FAIL unlink {}: {}",
                    prod.filename.display(),
                    e
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopSink;
    use tempfile::TempDir;

    fn store(dir: &std::path::Path) -> FileStore {
        FileStore::new(dir.to_path_buf(), "testrecv", 0, Arc::new(NoopSink))
    }

    #[test]
    fn default_naming_embeds_pid_and_seqno() {
        let tmp = TempDir::new().unwrap();
        let st = store(tmp.path());
        let mut prod = Product::default();
        prod.seqno = 17;
        let path = st.out_path(&prod).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-000017"));
        assert!(name.contains(&std::process::id().to_string()));
        assert!(path.starts_with(tmp.path()));
    }

    #[test]
    fn finish_is_ok_and_counts() {
        let tmp = TempDir::new().unwrap();
        let st = store(tmp.path());
        let prod = Product::default();
        assert_eq!(st.finish(&prod, None), Disposition::Ok);
        assert_eq!(st.finish(&prod, None), Disposition::Ok);
        assert_eq!(*st.total_count.lock(), 2);
    }

    #[test]
    fn abort_removes_partial_file() {
        let tmp = TempDir::new().unwrap();
        let st = store(tmp.path());
        let mut prod = Product::default();
        prod.filename = tmp.path().join("partial");
        std::fs::write(&prod.filename, b"half").unwrap();
        st.abort(&prod);
        assert!(!prod.filename.exists());
        // a second abort finds nothing to remove and stays quiet
        st.abort(&prod);
    }
}
