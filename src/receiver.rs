//! Per-connection receive service
//!
//! One service instance owns one accepted socket. Products arrive as a
//! fixed 32-byte header followed by the payload; the sequence number must
//! match the expected counter or be 0 (a sender that reconnected starts
//! over). The payload streams to disk in `bufsize` blocks, except that the
//! first block must be large enough to hold a complete WMO heading so the
//! output path can be chosen before anything is written. Each product is
//! answered with a 6-byte ack whose code classifies the outcome.
//!
//! Filesystem trouble while opening the output file is retried in place
//! (see `open_out_file`); a write failure abandons the file but keeps
//! draining the socket so the byte stream stays synchronized.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;

use crate::announce::{self, ConnInfo};
use crate::codec::{self, AckCode};
use crate::control::{sleep_interruptible, Control};
use crate::fsutil;
use crate::logger::RecordSink;
use crate::product::Product;
use crate::protocol::{FIRST_BLK_SIZE, FULL_HDR_LEN, MAX_PROD_SIZE};
use crate::store::{Disposition, Store};
use crate::wmo::{self, debug_buf, wmo_tag};

const SHORT_RETRY_SLEEP: u64 = 3;
const LONG_RETRY_SLEEP: u64 = 30;
const SHORT_RETRIES: u32 = 3;

#[derive(Clone, Debug)]
pub struct ReceiverOptions {
    /// per-operation socket timeout in seconds, 0 disables
    pub timeout: u64,
    pub bufsize: usize,
    pub verbosity: u8,
    /// when set, the first product must be an announcement with this heading
    pub connect_wmo: Option<String>,
    /// create files write-only and flip them readable when complete
    pub toggle_perms: bool,
    /// overwrite colliding output files instead of failing with EEXIST
    pub overwrite: bool,
}

/// One worker's receive engine.
pub struct Service {
    opt: ReceiverOptions,
    ctl: Control,
    sink: Arc<dyn RecordSink>,
    store: Arc<dyn Store>,
    program: String,
    conn_info: Option<ConnInfo>,
    /// true until the connection's first record has been processed; the
    /// announcement requirement applies only to that record, never to a
    /// later seqno 0 from a sender whose counter wrapped
    first_frame: bool,
}

impl Service {
    pub fn new(
        opt: ReceiverOptions,
        ctl: Control,
        sink: Arc<dyn RecordSink>,
        store: Arc<dyn Store>,
        program: String,
    ) -> Service {
        Service {
            opt,
            ctl,
            sink,
            store,
            program,
            conn_info: None,
            first_frame: true,
        }
    }

    pub fn conn_info(&self) -> Option<&ConnInfo> {
        self.conn_info.as_ref()
    }

    /// Serve one connection to completion. A clean disconnect or shutdown
    /// returns Ok; a protocol violation returns the error that killed the
    /// connection.
    pub fn run(&mut self, stream: &mut TcpStream, rhost: &str) -> Result<()> {
        let mut expected: u32 = 0;
        let mut recvbuf = vec![0u8; self.opt.bufsize];
        self.first_frame = true;

        if self.opt.verbosity > 1 {
            self.sink
                .debug(&format!("begin service for client on host {}", rhost));
        }

        let mut failure: Option<anyhow::Error> = None;
        while !self.ctl.shutdown() && !self.ctl.disconnect() {
            let mut prod = match self.recv_msghdr(stream, expected) {
                Ok(p) => p,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            if self.ctl.disconnect() {
                break;
            }

            if let Err(e) = self.recv_prod(stream, &mut recvbuf, &mut prod) {
                failure = Some(e);
                break;
            }

            self.first_frame = false;
            expected = prod.seqno + 1;
        }

        if self.opt.verbosity > 1 {
            self.sink
                .debug(&format!("end service for client on host {}", rhost));
        }

        if self.ctl.shutdown() || self.ctl.disconnect() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return Ok(());
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn recv_msghdr(&self, stream: &mut TcpStream, expected: u32) -> Result<Product> {
        let mut hdrbuf = [0u8; FULL_HDR_LEN];
        let n = self.recv_block(stream, &mut hdrbuf, FULL_HDR_LEN)?;
        if n == 0 {
            bail!("interrupted while waiting for a header");
        }

        let hdr = codec::parse_msghdr(&hdrbuf).map_err(|e| {
            self.sink.error(&format!("{:#}", e));
            e
        })?;

        let mut prod = Product::default();
        prod.seqno = hdr.seqno;
        prod.queue_time = hdr.queue_time;
        prod.size = hdr.size;

        if self.opt.verbosity > 1 {
            self.sink.debug(&format!(
                "prod seqno={} size={} time={}",
                prod.seqno, prod.size, prod.queue_time
            ));
        }

        // a sender that reconnected restarts at 0; anything else must run
        // in sequence
        if prod.seqno != expected && prod.seqno != 0 {
            let msg = format!("expected seqno {} but got {}", expected, prod.seqno);
            self.sink.error(&msg);
            bail!(msg);
        }

        if prod.size == 0 || prod.size > MAX_PROD_SIZE {
            let msg = format!("invalid prod size {}, max {}", prod.size, MAX_PROD_SIZE);
            self.sink.error(&msg);
            bail!(msg);
        }

        Ok(prod)
    }

    fn recv_prod(
        &mut self,
        stream: &mut TcpStream,
        recvbuf: &mut [u8],
        prod: &mut Product,
    ) -> Result<()> {
        let bufsize = recvbuf.len();
        // the first block must hold the complete WMO heading
        let mut minsiz = (prod.size as usize).min(FIRST_BLK_SIZE);
        let mut out_file: Option<File> = None;
        let mut started = false;
        let mut ack_code = AckCode::Retry;

        let mut bytes_left = prod.size;
        while bytes_left > 0 {
            let recvsiz = (bytes_left as usize).min(bufsize);
            let n = match self.recv_block(stream, &mut recvbuf[..recvsiz], minsiz.min(recvsiz)) {
                Ok(0) => {
                    if self.ctl.shutdown() {
                        drop(out_file.take());
                        if started {
                            self.store.abort(prod);
                        }
                        bail!("shutdown during receive");
                    }
                    continue;
                }
                Ok(n) => n,
                Err(e) => {
                    drop(out_file.take());
                    if started {
                        self.store.abort(prod);
                    }
                    return Err(e);
                }
            };

            if bytes_left == prod.size {
                // first block
                if !wmo::parse_wmo(&recvbuf[..n], &mut prod.wmo) {
                    self.sink.error(&format!(
                        "FAIL parse wmo prod {} buf [{}], ttaaii={}",
                        prod.seqno,
                        debug_buf(&recvbuf[..n.min(50)]),
                        prod.wmo.ttaaii
                    ));
                    // process anyway
                }

                minsiz = 1;

                if self.first_frame {
                    if let Some(connect_wmo) = self.opt.connect_wmo.clone() {
                        if prod.wmo.ttaaii == connect_wmo {
                            let first = recvbuf[..n].to_vec();
                            return self.recv_conn_msg(stream, &first, prod);
                        }
                        // an announcement is mandatory; refuse the stream
                        return self.refuse_stream(stream, recvbuf, prod, n);
                    }
                }

                match self.store.out_path(prod) {
                    Ok(path) => {
                        prod.filename = path;
                        match self.open_out_file(&prod.filename) {
                            Ok(f) => out_file = Some(f),
                            Err(e) => {
                                self.sink.error(&format!(
                                    "FAIL open file {}: {:#}",
                                    prod.filename.display(),
                                    e
                                ));
                                ack_code = AckCode::Retry;
                            }
                        }
                    }
                    Err(e) => {
                        self.sink.error(&format!(
                            "FAIL get out path, discard prod {}: {:#}",
                            prod.seqno, e
                        ));
                        ack_code = AckCode::Fail;
                    }
                }
            }

            let mut write_failed = false;
            match out_file.as_mut() {
                None => {
                    if self.opt.verbosity > 0 {
                        self.sink
                            .debug(&format!("discarding {} bytes", prod.size));
                    }
                }
                Some(file) => {
                    started = true;
                    if let Err(e) = self.write_block(file, &recvbuf[..n]) {
                        self.sink.error(&format!(
                            "FAIL write {} bytes to {}: {:#}",
                            n,
                            prod.filename.display(),
                            e
                        ));
                        write_failed = true;
                    }
                }
            }
            if write_failed {
                drop(out_file.take());
                self.store.abort(prod);
                // keep reading the socket to stay in sync
                ack_code = AckCode::Retry;
            }

            bytes_left -= n as u64;
        }

        if let Some(file) = out_file.take() {
            drop(file);

            if self.opt.toggle_perms {
                if let Err(e) = fsutil::make_readable(&prod.filename) {
                    // perhaps the file was moved away before completion
                    self.sink.error(&format!("{:#}", e));
                    self.store.abort(prod);
                    self.send_ack(stream, prod.seqno, AckCode::Retry)?;
                    return Ok(());
                }
            }

            ack_code = match self.store.finish(prod, self.conn_info.as_ref()) {
                Disposition::Ok => AckCode::Ok,
                Disposition::Retry => AckCode::Retry,
                Disposition::Fail => AckCode::Fail,
            };
        }

        self.send_ack(stream, prod.seqno, ack_code)?;
        Ok(())
    }

    /// First product was not the required announcement: drain it to stay
    /// synchronized, reject it, and kill the connection.
    fn refuse_stream(
        &self,
        stream: &mut TcpStream,
        recvbuf: &mut [u8],
        prod: &Product,
        already_read: usize,
    ) -> Result<()> {
        let mut bytes_left = prod.size - already_read as u64;
        while bytes_left > 0 {
            let recvsiz = (bytes_left as usize).min(recvbuf.len());
            match self.recv_block(stream, &mut recvbuf[..recvsiz], 1) {
                Ok(0) => {
                    if self.ctl.shutdown() {
                        bail!("shutdown while refusing a stream");
                    }
                }
                Ok(n) => bytes_left -= n as u64,
                Err(e) => return Err(e),
            }
        }
        self.send_ack(stream, prod.seqno, AckCode::Fail)?;
        let msg = format!(
            "first product [{}] is not the required connection announcement",
            prod.wmo.ttaaii
        );
        self.sink.error(&msg);
        bail!(msg);
    }

    fn recv_conn_msg(
        &mut self,
        stream: &mut TcpStream,
        first: &[u8],
        prod: &mut Product,
    ) -> Result<()> {
        if self.opt.verbosity > 1 {
            self.sink.debug(&format!(
                "recv connect msg [{} {} {}] {} bytes",
                prod.wmo.ttaaii, prod.wmo.cccc, prod.wmo.ddhhmm, prod.size
            ));
        }

        let mut msgbuf = first.to_vec();
        let bytes_left = prod.size as usize - first.len();
        if bytes_left > 0 {
            let mut rest = vec![0u8; bytes_left];
            let n = self.recv_block(stream, &mut rest, bytes_left)?;
            if n == 0 {
                bail!("interrupted reading connect message");
            }
            msgbuf.extend_from_slice(&rest);
        }

        let body = String::from_utf8_lossy(&msgbuf);
        let parsed = announce::parse_announcement(&body);
        let ack_code = if parsed.is_ok() {
            AckCode::Ok
        } else {
            AckCode::Fail
        };

        self.send_ack(stream, prod.seqno, ack_code)?;

        let mut info = match parsed {
            Ok(info) => info,
            Err(e) => {
                self.sink
                    .error(&format!("invalid connection announcement: {:#}", e));
                return Ok(());
            }
        };
        info.wmo_ttaaii = prod.wmo.ttaaii.clone();
        info.wmo_cccc = prod.wmo.cccc.clone();

        // adopt the sender's identity in the worker's records
        let suffix = if !info.source.is_empty() {
            Some(info.source.clone())
        } else if !info.remotehost.is_empty() {
            Some(info.remotehost.clone())
        } else {
            None
        };
        if let Some(suffix) = suffix {
            let base = match self.program.rfind('_') {
                Some(i) => &self.program[..i],
                None => self.program.as_str(),
            };
            self.program = format!("{}-{}", base, suffix);
            self.sink.rename(&self.program);
        }

        self.sink.product(&format!(
            "CONNECT {} {} REMOTE={} SOURCE={} LINK={}",
            Local::now().format("%m/%d/%Y %T"),
            wmo_tag(&prod.wmo),
            info.remotehost,
            info.source,
            info.link_id,
        ));

        self.conn_info = Some(info);
        Ok(())
    }

    /// Open the output file, riding out filesystem conditions that are
    /// about the directory or the filesystem rather than this product:
    /// collisions and a full filesystem sleep and retry, a missing or
    /// wrong-kind path component is repaired once without sleeping.
    fn open_out_file(&self, path: &Path) -> Result<File> {
        let perms = if self.opt.toggle_perms {
            fsutil::WRITING_PERMS
        } else {
            fsutil::READABLE_PERMS
        };

        let mut options = OpenOptions::new();
        options.write(true).mode(perms);
        if self.opt.overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let mut retry: u32 = 0;
        while !self.ctl.disconnect() {
            let err = match options.open(path) {
                Ok(file) => {
                    if retry > 0 {
                        self.sink.error(&format!(
                            "OK open file {}, after {} retries",
                            path.display(),
                            retry
                        ));
                    }
                    return Ok(file);
                }
                Err(e) => e,
            };

            let errno = err.raw_os_error().unwrap_or(0);
            if errno != libc::ENOENT && retry == 0 {
                self.sink.error(&format!(
                    "FAIL {} open file {}: {}",
                    retry + 1,
                    path.display(),
                    err
                ));
            }

            let mut sleep_retry = false;
            match errno {
                // no-overwrite collision or a full filesystem
                libc::EEXIST | libc::ENOSPC => sleep_retry = true,
                libc::ENOTDIR => {
                    let parent = path.parent().context("no parent directory")?;
                    if let Err(e) = std::fs::remove_file(parent) {
                        self.sink
                            .error(&format!("FAIL unlink {}: {}", parent.display(), e));
                    } else if let Err(e) = fsutil::make_dirs(parent) {
                        self.sink.error(&format!("{:#}", e));
                    } else if retry == 0 {
                        retry += 1;
                        continue;
                    }
                    sleep_retry = true;
                }
                libc::ENOENT => {
                    let parent = path.parent().context("no parent directory")?;
                    if let Err(e) = fsutil::make_dirs(parent) {
                        self.sink.error(&format!("{:#}", e));
                    } else if retry == 0 {
                        retry += 1;
                        continue;
                    }
                    sleep_retry = true;
                }
                libc::EISDIR => {
                    if let Err(e) = std::fs::remove_dir(path) {
                        self.sink
                            .error(&format!("FAIL rmdir {}: {}", path.display(), e));
                        return Err(err).context("output path is a directory");
                    }
                    if retry == 0 {
                        retry += 1;
                        continue;
                    }
                    return Err(err).context("output path keeps turning into a directory");
                }
                libc::EINTR => {
                    retry += 1;
                    continue;
                }
                _ => return Err(err).with_context(|| format!("open {}", path.display())),
            }

            if sleep_retry {
                if self.ctl.shutdown() {
                    bail!("shutdown while retrying open");
                }
                let secs = if retry < SHORT_RETRIES {
                    SHORT_RETRY_SLEEP
                } else {
                    LONG_RETRY_SLEEP
                };
                if self.opt.verbosity > 1 {
                    self.sink
                        .debug(&format!("retry #{} in {} seconds", retry + 1, secs));
                }
                sleep_interruptible(&self.ctl, secs);
                retry += 1;
            }
        }

        bail!("disconnect while opening {}", path.display())
    }

    fn write_block(&self, file: &mut File, block: &[u8]) -> Result<()> {
        let mut written = 0;
        let mut retry: u32 = 0;
        while written < block.len() {
            match file.write(&block[written..]) {
                Ok(0) => bail!("write returned 0 bytes"),
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                    if self.ctl.shutdown() {
                        return Err(e).context("full filesystem during shutdown");
                    }
                    let secs = if retry < SHORT_RETRIES {
                        SHORT_RETRY_SLEEP
                    } else {
                        LONG_RETRY_SLEEP
                    };
                    if self.opt.verbosity > 1 {
                        self.sink
                            .debug(&format!("retry #{} in {} seconds", retry + 1, secs));
                    }
                    sleep_interruptible(&self.ctl, secs);
                    retry += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if retry > 0 {
            self.sink
                .error(&format!("OK write after {} retries", retry));
        }
        Ok(())
    }

    fn send_ack(&self, stream: &mut TcpStream, seqno: u32, code: AckCode) -> Result<()> {
        let ack = codec::format_ack(seqno, code)?;
        self.set_write_deadline(stream);
        if let Err(e) = stream.write_all(&ack) {
            self.sink
                .error(&format!("FAIL send ack for prod {}: {}", seqno, e));
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                self.ctl.set_no_peer();
            } else {
                self.ctl.set_disconnect();
            }
            bail!("ack send failed for prod {}", seqno);
        }
        Ok(())
    }

    /// Read at least `minsiz` bytes, at most `buf.len()`. A timeout or a
    /// peer close flags a disconnect. Returns 0 only when interrupted by a
    /// shutdown before anything was read.
    fn recv_block(&self, stream: &mut TcpStream, buf: &mut [u8], minsiz: usize) -> Result<usize> {
        self.set_read_deadline(stream);

        let mut total = 0;
        while !self.ctl.disconnect() && total < minsiz {
            match stream.read(&mut buf[total..]) {
                Ok(0) => {
                    self.sink.error("recv 0 bytes from socket, flag disconnect");
                    self.ctl.set_disconnect();
                    break;
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    if self.opt.verbosity > 1 {
                        self.sink.debug("recv interrupted");
                    }
                    if self.ctl.shutdown() && total == 0 {
                        // let the caller decide whether to exit or retry
                        return Ok(0);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    self.sink.error("recv timed out, flag disconnect");
                    self.ctl.set_disconnect();
                    break;
                }
                Err(e) => {
                    self.sink.error(&format!("FAIL recv from socket: {}", e));
                    break;
                }
            }
        }

        if total < minsiz {
            bail!("short read: {} of {} bytes", total, minsiz);
        }

        if self.opt.verbosity > 2 {
            self.sink.debug(&format!("received {} bytes", total));
        }
        Ok(total)
    }

    fn set_read_deadline(&self, stream: &TcpStream) {
        let timeout = match self.opt.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let _ = stream.set_read_timeout(timeout);
    }

    fn set_write_deadline(&self, stream: &TcpStream) {
        let timeout = match self.opt.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let _ = stream.set_write_timeout(timeout);
    }
}
