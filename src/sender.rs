//! Poll-and-send engine
//!
//! One loop drives everything: tear down a flagged connection, reconnect
//! (rotating through alternate hosts), draw the next product from the
//! retransmit list or the input queue, evict anything past its TTL,
//! transmit, then drain acknowledgements. Products enter the ack list in
//! transmission order and acks must arrive in that order; the head of the
//! ack list carries the timeout deadline. On reconnect the sequence
//! counter restarts at 0 and everything still unacknowledged is replayed
//! from the retransmit list.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::announce;
use crate::codec::{self, AckCode};
use crate::control::{sleep_interruptible, unix_now, Control};
use crate::logger::RecordSink;
use crate::product::{ProdList, ProdState, ProductTable};
use crate::protocol::{next_seqno, DISCARD_PORT, FULL_HDR_LEN};
use crate::queue::{InputQueue, Outbox};
use crate::stats::StatsWriter;
use crate::wmo;

const RECOVERY_SLEEP: u64 = 20;
const FAILURE_STREAK: u32 = 3;

#[derive(Clone, Debug)]
pub struct SenderOptions {
    pub port: u16,
    /// destination hosts, tried round-robin
    pub hosts: Vec<String>,
    /// per-operation socket timeout and ack deadline, seconds
    pub timeout: u64,
    /// idle sleep between input polls, seconds
    pub poll_interval: u64,
    /// discard queued files older than this, seconds; 0 keeps forever
    pub queue_ttl: i64,
    /// max transmission attempts per product; -1 is unbounded
    pub max_retry: i32,
    pub bufsize: usize,
    /// fabricate a connection announcement with this heading on connect
    pub connect_wmo: Option<String>,
    pub source: Option<String>,
    pub strip_ccb: bool,
    pub verbosity: u8,
    pub program: String,
    pub link_id: i32,
    pub host_id: i32,
    pub shm_region: i32,
    /// input-directory summary used in STATUS records
    pub indir_label: String,
}

enum SendOutcome {
    Sent,
    Failed,
    Retry,
}

pub struct Sender {
    opt: SenderOptions,
    ctl: Control,
    sink: Arc<dyn RecordSink>,
    queue: InputQueue,
    outbox: Outbox,
    table: ProductTable,
    stats: Option<StatsWriter>,
    stream: Option<TcpStream>,
    seqno: u32,
    host_idx: usize,
    current: Option<usize>,
    announce_idx: Option<usize>,
    sendbuf: Vec<u8>,
    queue_len: usize,
    connect_failures: u32,
}

impl Sender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opt: SenderOptions,
        window_size: usize,
        ctl: Control,
        sink: Arc<dyn RecordSink>,
        queue: InputQueue,
        outbox: Outbox,
        stats: Option<StatsWriter>,
    ) -> Sender {
        let bufsize = opt.bufsize;
        Sender {
            opt,
            ctl,
            sink,
            queue,
            outbox,
            table: ProductTable::new(window_size),
            stats,
            stream: None,
            seqno: 0,
            host_idx: 0,
            current: None,
            announce_idx: None,
            sendbuf: vec![0u8; bufsize],
            queue_len: 0,
            connect_failures: 0,
        }
    }

    /// Drive the send loop until shutdown.
    pub fn run(&mut self) -> Result<()> {
        if self.opt.connect_wmo.is_some() {
            self.current = self.create_conn_msg();
            self.announce_idx = self.current;
        }

        while !self.ctl.shutdown() {
            if self.stream.is_some() && self.ctl.disconnect() {
                self.teardown();
                if self.opt.connect_wmo.is_some() {
                    // replay the in-flight product, never the announcement
                    if let Some(idx) = self.current.take() {
                        if self.announce_idx == Some(idx) {
                            self.drop_announcement(idx);
                        } else {
                            self.table.push(ProdList::Retr, idx);
                        }
                    }
                    self.current = self.create_conn_msg();
                    self.announce_idx = self.current;
                }
            }

            if self.stream.is_none() {
                self.try_connect();
            }

            if self.current.is_none() {
                self.acquire_next();
            }

            self.evict_expired();

            if self.current.is_some() && self.stream.is_some() {
                let idx = self.current.expect("checked above");
                match self.send_prod(idx) {
                    SendOutcome::Sent => {
                        let prod = self.table.slot(idx);
                        let (seqno, size, file) = (
                            prod.seqno,
                            prod.size,
                            prod.filename.display().to_string(),
                        );
                        if let Some(stats) = self.stats.as_mut() {
                            stats.update(|s| {
                                s.seqno = seqno;
                                s.tot_prods += 1;
                                s.tot_bytes += size;
                                s.last_send_time = unix_now();
                                s.write_fails = 0;
                                s.last_file = file;
                            });
                        }
                        self.table.push(ProdList::Ack, idx);
                        self.current = None;
                    }
                    SendOutcome::Failed => {
                        self.abort_slot(idx);
                        self.current = None;
                    }
                    SendOutcome::Retry => {
                        // transient; the same product goes again next pass
                    }
                }
            }

            self.drain_acks();

            if !self.ctl.disconnect() && (self.queue_len == 0 || self.stream.is_none()) {
                let wait = if self.connect_failures > FAILURE_STREAK {
                    RECOVERY_SLEEP
                } else if let Some(head) = self.table.ack_head() {
                    let remaining =
                        self.table.slot(head).send_time + self.opt.timeout as i64 - unix_now();
                    (self.opt.poll_interval as i64).min(remaining).max(0) as u64
                } else {
                    self.opt.poll_interval
                };
                sleep_interruptible(&self.ctl, wait);
            }
        }

        self.teardown();
        if let Some(stats) = self.stats.as_mut() {
            stats.update(|s| s.connected = false);
            stats.flush();
        }
        Ok(())
    }

    fn try_connect(&mut self) {
        let host = self.opt.hosts[self.host_idx].clone();
        match self.connect_to_server(&host) {
            Err(e) => {
                self.sink.error(&format!(
                    "FAIL connect to port {} on host {}: {:#}",
                    self.opt.port, host, e
                ));
                self.connect_failures += 1;
                self.host_idx = (self.host_idx + 1) % self.opt.hosts.len();
                if let Some(stats) = self.stats.as_mut() {
                    stats.update(|s| {
                        s.connected = false;
                        s.conn_fails += 1;
                    });
                }
            }
            Ok(stream) => {
                self.sink.product(&format!(
                    "STATUS CONNECT [{}] pid({}) {} to={}/{} dir({})",
                    self.opt.program,
                    std::process::id(),
                    self.opt.source.as_deref().unwrap_or("unknown"),
                    host,
                    self.opt.port,
                    self.opt.indir_label,
                ));
                self.stream = Some(stream);
                self.seqno = 0;
                self.connect_failures = 0;
                if let Some(stats) = self.stats.as_mut() {
                    stats.update(|s| {
                        s.host = host.clone();
                        s.port = self.opt.port;
                        s.connected = true;
                        s.conn_fails = 0;
                        s.last_conn_time = unix_now();
                    });
                }
                self.requeue_unacked();
            }
        }
    }

    fn connect_to_server(&self, host: &str) -> Result<TcpStream> {
        if self.opt.verbosity > 0 {
            self.sink.debug(&format!("connecting to {}", host));
        }
        let addr = (host, self.opt.port)
            .to_socket_addrs()
            .with_context(|| format!("resolve host {}", host))?
            .next()
            .with_context(|| format!("no address for host {}", host))?;
        let stream = if self.opt.timeout > 0 {
            TcpStream::connect_timeout(&addr, Duration::from_secs(self.opt.timeout))?
        } else {
            TcpStream::connect(addr)?
        };
        tune_socket(&stream);
        Ok(stream)
    }

    /// Acks for previously sent items are presumed lost on reconnect; move
    /// every unacknowledged product to the retransmit list. The replays do
    /// not count against max_retry, except for the head of the window.
    fn requeue_unacked(&mut self) {
        let mut replayed = 0;
        while self.table.len(ProdList::Ack) > 0 {
            let idx = match self.table.pop(ProdList::Ack) {
                Some(idx) => idx,
                None => {
                    self.sink.error(&format!(
                        "ack list underflow, count = {}",
                        self.table.len(ProdList::Ack)
                    ));
                    self.table.rebuild();
                    continue;
                }
            };
            if self.table.slot(idx).announcement {
                // an announcement only ever belongs to its own connection
                self.drop_announcement(idx);
                continue;
            }
            let prod = self.table.slot_mut(idx);
            if replayed > 0 && prod.send_count > 0 {
                prod.send_count -= 1;
            }
            if self.opt.verbosity > 0 {
                let prod = self.table.slot(idx);
                self.sink.debug(&format!(
                    "resend seq={} f({}) bytes({})",
                    prod.seqno,
                    prod.filename.display(),
                    prod.size
                ));
            }
            self.table.push(ProdList::Retr, idx);
            replayed += 1;
        }
    }

    fn acquire_next(&mut self) {
        let window = self.table.window_size();
        let ack_count = self.table.len(ProdList::Ack);
        if ack_count >= window {
            if self.opt.verbosity > 0 {
                self.sink.debug("full window, skip input poll");
            }
            return;
        }

        if self.table.len(ProdList::Retr) > 0 {
            match self.table.pop(ProdList::Retr) {
                Some(idx) => self.current = Some(idx),
                None => {
                    self.sink.error("retr list underflow");
                    self.table.rebuild();
                }
            }
            return;
        }

        let idx = match self.table.pop(ProdList::Free) {
            Some(idx) => idx,
            None => {
                self.sink.error(&format!(
                    "free list underflow, ack_count = {}",
                    ack_count
                ));
                self.table.rebuild();
                return;
            }
        };

        let (queue_len, cand) = self.queue.next_file(&self.table);
        self.queue_len = queue_len;
        if let Some(stats) = self.stats.as_mut() {
            stats.update(|s| s.queue_len = queue_len);
        }
        match cand {
            Some(cand) => {
                let prod = self.table.slot_mut(idx);
                prod.assign(cand.filename, cand.queue_time, cand.size, cand.priority);
                prod.state = ProdState::Queued;
                self.current = Some(idx);
            }
            None => {
                self.table.push(ProdList::Free, idx);
            }
        }
    }

    fn evict_expired(&mut self) {
        let Some(idx) = self.current else { return };
        if self.opt.queue_ttl <= 0 {
            return;
        }
        let prod = self.table.slot(idx);
        let age = unix_now() - prod.queue_time;
        if age <= self.opt.queue_ttl {
            return;
        }
        self.sink.error(&format!(
            "discarding {}, age={} ttl={} secs",
            prod.filename.display(),
            age,
            self.opt.queue_ttl
        ));
        self.table.slot_mut(idx).state = ProdState::Dead;
        self.abort_slot(idx);
        self.current = None;
        if let Some(stats) = self.stats.as_mut() {
            stats.update(|s| s.write_fails += 1);
        }
    }

    fn abort_slot(&mut self, idx: usize) {
        let outbox = &mut self.outbox;
        outbox.abort(self.table.slot_mut(idx));
        let prod = self.table.slot_mut(idx);
        prod.state = ProdState::Free;
        if self.announce_idx == Some(idx) {
            self.announce_idx = None;
        }
        self.table.push(ProdList::Free, idx);
    }

    fn finish_slot(&mut self, idx: usize) {
        let total = {
            let outbox = &mut self.outbox;
            outbox.finish(self.table.slot_mut(idx))
        };
        if total % 100 == 0 {
            self.sink.product(&format!(
                "STATUS [{}] pid({}) host({}) {}-m{}-l{}-h{} to={} tot({}) dir({})",
                self.opt.program,
                std::process::id(),
                crate::fsutil::hostname(),
                self.opt.source.as_deref().unwrap_or("unknown"),
                self.opt.shm_region,
                self.opt.link_id,
                self.opt.host_id,
                self.opt.hosts[self.host_idx],
                total,
                self.opt.indir_label,
            ));
        }
        let prod = self.table.slot_mut(idx);
        prod.state = ProdState::Free;
        if self.announce_idx == Some(idx) {
            self.announce_idx = None;
        }
        self.table.push(ProdList::Free, idx);
    }

    /// Transmit one product: header plus payload, streamed through the
    /// send buffer. The first block reserves space for the 32-byte header
    /// and is where the CCB strip and WMO parse happen.
    fn send_prod(&mut self, idx: usize) -> SendOutcome {
        {
            let max_retry = self.opt.max_retry;
            let prod = self.table.slot_mut(idx);
            if max_retry >= 0 && prod.send_count > max_retry as u32 {
                let msg = format!(
                    "FAIL prod #{} ({}) after {} retries",
                    prod.seqno,
                    prod.filename.display(),
                    max_retry
                );
                prod.state = ProdState::Failed;
                self.sink.error(&msg);
                return SendOutcome::Failed;
            }
            prod.send_count += 1;
            prod.seqno = self.seqno;
            // a retransmission starts over from the on-disk size; any CCB
            // is re-detected and re-stripped below
            prod.size += prod.ccb_len as u64;
            prod.ccb_len = 0;
        }

        let path = self.table.slot(idx).filename.clone();
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                self.sink
                    .error(&format!("FAIL open prod file {}: {}", path.display(), e));
                self.table.slot_mut(idx).state = ProdState::Failed;
                return SendOutcome::Failed;
            }
        };

        if self.opt.verbosity > 1 {
            let prod = self.table.slot(idx);
            self.sink.debug(&format!(
                "sending prod seq {} {} [{} bytes] try={}",
                prod.seqno,
                path.display(),
                prod.size,
                prod.send_count
            ));
        }

        let bufsize = self.sendbuf.len();
        // first block is offset past the fixed-size header
        let mut data_start = FULL_HDR_LEN;
        let mut read_size = bufsize - FULL_HDR_LEN;
        let mut first = true;
        let mut wire_bytes = false;
        let mut bytes_left = self.table.slot(idx).size;

        while bytes_left > 0 {
            let n = match file.read(&mut self.sendbuf[data_start..data_start + read_size]) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.sink
                        .error(&format!("FAIL read prod file {}: {}", path.display(), e));
                    self.table.slot_mut(idx).state = ProdState::Failed;
                    break;
                }
            };

            if n == 0 || n as u64 > bytes_left {
                let prod = self.table.slot_mut(idx);
                self.sink.error(&format!(
                    "file {} size changed from {} to {} bytes",
                    path.display(),
                    prod.size + prod.ccb_len as u64,
                    prod.size + prod.ccb_len as u64 - bytes_left + n as u64
                ));
                prod.state = ProdState::Failed;
                break;
            }

            let mut data_offset = 0;
            if first {
                if self.opt.strip_ccb {
                    let ccb = codec::ccb_len(&self.sendbuf[FULL_HDR_LEN..FULL_HDR_LEN + n]);
                    if ccb > 0 {
                        let prod = self.table.slot_mut(idx);
                        prod.ccb_len = ccb;
                        prod.size -= ccb as u64;
                        self.sink.debug(&format!(
                            "found CCB len {} in file {} seqno {}",
                            ccb,
                            path.display(),
                            prod.seqno
                        ));
                        self.sendbuf
                            .copy_within(FULL_HDR_LEN + ccb..FULL_HDR_LEN + n, FULL_HDR_LEN);
                        data_offset = ccb;
                    }
                }

                let payload = n - data_offset;
                if self.table.slot(idx).wmo.is_empty() {
                    let prod = self.table.slot_mut(idx);
                    let region = FULL_HDR_LEN..FULL_HDR_LEN + payload;
                    if !wmo::parse_wmo(&self.sendbuf[region.clone()], &mut prod.wmo) {
                        let shown = payload.min(50);
                        self.sink.error(&format!(
                            "FAIL parse wmo prod {} buf [{}], ttaaii={}",
                            prod.seqno,
                            wmo::debug_buf(&self.sendbuf[FULL_HDR_LEN..FULL_HDR_LEN + shown]),
                            prod.wmo.ttaaii
                        ));
                        // process anyway
                    }
                }

                let prod = self.table.slot(idx);
                if let Err(e) = codec::format_msghdr(
                    &mut self.sendbuf[..FULL_HDR_LEN],
                    prod.seqno,
                    prod.queue_time,
                    prod.size,
                ) {
                    self.sink.error(&format!("{:#}", e));
                    self.table.slot_mut(idx).state = ProdState::Failed;
                    return SendOutcome::Failed;
                }
            }

            let send_len = if first {
                FULL_HDR_LEN + n - data_offset
            } else {
                n
            };

            if self.opt.verbosity > 1 {
                self.sink.debug(&format!(
                    "sending seqno {}, {} bytes",
                    self.table.slot(idx).seqno,
                    send_len
                ));
            }

            let sent = self.send_buffer(idx, send_len, &mut wire_bytes);
            if sent < send_len {
                self.table.slot_mut(idx).state = ProdState::Retry;
                break;
            }

            bytes_left -= n as u64;
            first = false;
            data_start = 0;
            read_size = bufsize;
        }

        drop(file);

        if self.opt.verbosity > 0 {
            let prod = self.table.slot(idx);
            self.sink.debug(&format!(
                "sent prod {} f({}) bytes({}+{})",
                prod.seqno,
                path.display(),
                prod.size,
                prod.ccb_len
            ));
        }

        if bytes_left > 0 {
            if wire_bytes {
                // part of this product is on the wire; the connection must
                // be resynchronized
                self.seqno = next_seqno(self.seqno);
                self.ctl.set_disconnect();
            }
            return match self.table.slot(idx).state {
                ProdState::Failed => SendOutcome::Failed,
                _ => SendOutcome::Retry,
            };
        }

        self.seqno = next_seqno(self.seqno);
        let prod = self.table.slot_mut(idx);
        prod.state = ProdState::Sent;
        prod.send_time = unix_now();
        SendOutcome::Sent
    }

    /// Push `len` bytes of the send buffer to the socket under the send
    /// deadline. Returns how much was actually written.
    fn send_buffer(&mut self, idx: usize, len: usize, wire_bytes: &mut bool) -> usize {
        let stream = self.stream.as_mut().expect("send requires a connection");
        let timeout = match self.opt.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let _ = stream.set_write_timeout(timeout);

        let mut sent = 0;
        while sent < len {
            match stream.write(&self.sendbuf[sent..len]) {
                Ok(0) => {
                    self.sink.error("send wrote 0 bytes");
                    self.ctl.set_no_peer();
                    break;
                }
                Ok(k) => {
                    sent += k;
                    *wire_bytes = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    if self.ctl.disconnect() {
                        break;
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    self.sink.error(&format!(
                        "send timed out after {} secs, flag disconnect",
                        self.opt.timeout
                    ));
                    self.ctl.set_disconnect();
                    break;
                }
                Err(e) => {
                    let send_count = self.table.slot(idx).send_count;
                    self.sink.error(&format!(
                        "FAIL[{}] send {} to socket: {}",
                        send_count,
                        self.table.slot(idx).filename.display(),
                        e
                    ));
                    self.ctl.set_no_peer();
                    break;
                }
            }
        }
        sent
    }

    fn drain_acks(&mut self) {
        let window = self.table.window_size();
        let mut ack_ready = self.table.len(ProdList::Ack) as i64;

        while self.stream.is_some() && self.table.len(ProdList::Ack) > 0 && ack_ready > 0 {
            let wait = if self.table.len(ProdList::Ack) == window {
                let head = self.table.ack_head().expect("nonempty ack list");
                let remaining =
                    self.table.slot(head).send_time + self.opt.timeout as i64 - unix_now();
                let wait = remaining.max(0) as u64;
                if self.opt.verbosity > 0 {
                    self.sink.debug(&format!(
                        "full window, blocking up to {} sec for ack",
                        wait
                    ));
                }
                wait
            } else {
                0
            };

            ack_ready = self.check_for_ack(wait);
            if ack_ready > 0 {
                let idx = match self.table.pop(ProdList::Ack) {
                    Some(idx) => idx,
                    None => {
                        self.sink.error("ack list underflow");
                        self.table.rebuild();
                        continue;
                    }
                };

                let code = match self.recv_ack(idx) {
                    Ok(code) => code,
                    Err(_) => {
                        self.ctl.set_disconnect();
                        self.table.push_front(ProdList::Ack, idx);
                        break;
                    }
                };

                match code {
                    AckCode::Ok => {
                        self.table.slot_mut(idx).state = ProdState::Acked;
                        self.finish_slot(idx);
                    }
                    AckCode::Fail => {
                        self.table.slot_mut(idx).state = ProdState::Nacked;
                        self.abort_slot(idx);
                    }
                    AckCode::Retry => {
                        if self.announce_idx == Some(idx) {
                            // an announcement must never be retried on the
                            // same connection
                            self.sink.error("retry for conn msg aborted");
                            self.drop_announcement(idx);
                        } else {
                            let prod = self.table.slot_mut(idx);
                            prod.state = ProdState::Retry;
                            let outbox = &self.outbox;
                            outbox.retry(self.table.slot(idx));
                            self.table.push(ProdList::Retr, idx);
                        }
                    }
                }
            } else if ack_ready == 0 {
                let head = self.table.ack_head().expect("nonempty ack list");
                let deadline = self.table.slot(head).send_time + self.opt.timeout as i64;
                if unix_now() >= deadline {
                    self.sink.error(&format!(
                        "ack seqno {} timed out",
                        self.table.slot(head).seqno
                    ));
                    self.ctl.set_disconnect();
                }
            } else {
                self.ctl.set_disconnect();
            }
        }
    }

    /// Poll for a waiting ack: 1 ready, 0 none, -1 error. In discard mode
    /// every ack is pretended.
    fn check_for_ack(&mut self, wait: u64) -> i64 {
        if self.opt.port == DISCARD_PORT {
            return 1;
        }
        if self.opt.verbosity > 2 {
            self.sink
                .debug(&format!("checking for acks with timeout={} secs", wait));
        }

        let stream = self.stream.as_ref().expect("ack check requires a connection");
        let mut probe = [0u8; 1];
        let result = if wait == 0 {
            let _ = stream.set_nonblocking(true);
            let r = stream.peek(&mut probe);
            let _ = stream.set_nonblocking(false);
            r
        } else {
            let _ = stream.set_read_timeout(Some(Duration::from_secs(wait)));
            stream.peek(&mut probe)
        };

        match result {
            // a peer close also reads as ready; the ack read observes it
            Ok(_) => 1,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                0
            }
            Err(e) => {
                self.sink.error(&format!("FAIL poll for ack: {}", e));
                -1
            }
        }
    }

    /// Read one ack and match it against the product it must belong to.
    fn recv_ack(&mut self, idx: usize) -> Result<AckCode> {
        if self.opt.port == DISCARD_PORT {
            return Ok(AckCode::Ok);
        }

        let expected = self.table.slot(idx).seqno;
        let stream = self.stream.as_mut().expect("ack read requires a connection");
        let timeout = match self.opt.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let _ = stream.set_read_timeout(timeout);

        let mut ackbuf = [0u8; crate::protocol::ACK_MSG_LEN];
        let mut total = 0;
        while total < ackbuf.len() {
            match stream.read(&mut ackbuf[total..]) {
                Ok(0) => {
                    self.sink
                        .error("recv 0 bytes from socket, flag reconnect");
                    self.ctl.set_no_peer();
                    bail!("peer closed while reading ack");
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    if self.ctl.disconnect() {
                        bail!("disconnect while reading ack");
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    self.sink.error("timed out reading ack");
                    self.ctl.set_disconnect();
                    bail!("ack read timed out");
                }
                Err(e) => {
                    self.sink.error(&format!("FAIL recv from socket: {}", e));
                    bail!("ack read failed: {}", e);
                }
            }
        }

        let (seqno, code) = codec::parse_ack(&ackbuf).map_err(|e| {
            self.sink.error(&format!("{:#}", e));
            e
        })?;

        if self.opt.verbosity > 0 {
            self.sink.debug(&format!(
                "ack received for prod {}, code = {}",
                seqno, code
            ));
        }

        if seqno != expected {
            let msg = format!("invalid ack, expected #{} but got {}", expected, seqno);
            self.sink.error(&msg);
            bail!(msg);
        }

        Ok(code)
    }

    /// Fabricate the connection announcement as the next product to send.
    fn create_conn_msg(&mut self) -> Option<usize> {
        let connect_wmo = self.opt.connect_wmo.clone()?;
        let idx = match self.table.pop(ProdList::Free) {
            Some(idx) => idx,
            None => {
                self.sink.error("free list underflow for connect msg");
                self.table.rebuild();
                return None;
            }
        };

        let body = announce::build_announcement(
            &connect_wmo,
            self.opt.source.as_deref(),
            self.opt.link_id,
        );

        // the file lives outside the input directories and is disposed of
        // through the sent/fail rotation like any other product
        let path = (|| -> Result<std::path::PathBuf> {
            let mut tmp = tempfile::Builder::new().prefix("conn").tempfile()?;
            tmp.write_all(body.as_bytes())?;
            let (_file, path) = tmp.keep()?;
            Ok(path)
        })();

        let path = match path {
            Ok(path) => path,
            Err(e) => {
                self.sink
                    .error(&format!("FAIL create connect msg file: {:#}", e));
                self.table.push(ProdList::Free, idx);
                return None;
            }
        };

        let prod = self.table.slot_mut(idx);
        prod.reset();
        prod.filename = path;
        prod.size = body.len() as u64;
        prod.queue_time = unix_now();
        prod.state = ProdState::Queued;
        prod.announcement = true;
        Some(idx)
    }

    /// Release an announcement slot without routing it through the fail
    /// area; its temp file goes with it.
    fn drop_announcement(&mut self, idx: usize) {
        let prod = self.table.slot_mut(idx);
        let _ = std::fs::remove_file(&prod.filename);
        prod.reset();
        self.table.push(ProdList::Free, idx);
        if self.announce_idx == Some(idx) {
            self.announce_idx = None;
        }
    }

    fn teardown(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.sink.debug("disconnecting from remote host");
            if !self.ctl.no_peer() {
                let _ = stream.shutdown(Shutdown::Both);
            } else {
                self.ctl.clear_no_peer();
            }
        }
        self.ctl.clear_disconnect();
        if let Some(stats) = self.stats.as_mut() {
            stats.update(|s| s.connected = false);
        }
    }
}

/// Keepalive so a silently dead peer is eventually noticed even between
/// transfers.
fn tune_socket(stream: &TcpStream) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    unsafe {
        let keepalive: libc::c_int = 1;
        let _ = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &keepalive as *const _ as *const libc::c_void,
            std::mem::size_of_val(&keepalive) as libc::socklen_t,
        );
    }
}
