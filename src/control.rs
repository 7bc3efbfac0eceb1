//! Process control flags
//!
//! A control word carries three bits: SHUTDOWN, DISCONNECT, and NO_PEER.
//! The shutdown bit is process-wide and may be set asynchronously from a
//! signal handler; the connection bits are scoped to one connection so
//! receiver workers cannot disturb each other. Hot loops test the flags at
//! the top of each iteration and after every blocking call.
//!
//! Terminate signals follow the two-step rule: the first sets SHUTDOWN for
//! a graceful drain, a second one exits the process on the spot. Handlers
//! perform signal-safe stores only. SIGPIPE stays ignored (the runtime
//! default), so a lost peer surfaces as an EPIPE write error at the call
//! site, which sets DISCONNECT and NO_PEER there.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

pub const SHUTDOWN: u32 = 1;
pub const DISCONNECT: u32 = 2;
pub const NO_PEER: u32 = 4;

static PROCESS_FLAGS: AtomicU32 = AtomicU32::new(0);

/// Handle on the control word. Clones share both scopes; `for_worker`
/// derives a handle with a fresh connection scope.
#[derive(Clone)]
pub struct Control {
    global: &'static AtomicU32,
    conn: Arc<AtomicU32>,
}

impl Control {
    /// The process-wide control word, shared with the signal handlers.
    pub fn process() -> Control {
        Control {
            global: &PROCESS_FLAGS,
            conn: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A control word detached from the process signal handlers. Used by
    /// tests and embedded engines.
    pub fn isolated() -> Control {
        Control {
            global: Box::leak(Box::new(AtomicU32::new(0))),
            conn: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Same shutdown scope, fresh connection scope.
    pub fn for_worker(&self) -> Control {
        Control {
            global: self.global,
            conn: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn shutdown(&self) -> bool {
        self.global.load(Ordering::SeqCst) & SHUTDOWN != 0
    }

    pub fn disconnect(&self) -> bool {
        self.conn.load(Ordering::SeqCst) & DISCONNECT != 0
    }

    pub fn no_peer(&self) -> bool {
        self.conn.load(Ordering::SeqCst) & NO_PEER != 0
    }

    /// Shutdown or disconnect pending.
    pub fn stopping(&self) -> bool {
        self.shutdown() || self.disconnect()
    }

    pub fn set_shutdown(&self) {
        self.global.fetch_or(SHUTDOWN, Ordering::SeqCst);
    }

    pub fn set_disconnect(&self) {
        self.conn.fetch_or(DISCONNECT, Ordering::SeqCst);
    }

    /// The peer is gone; disconnect without attempting a socket shutdown.
    pub fn set_no_peer(&self) {
        self.conn.fetch_or(DISCONNECT | NO_PEER, Ordering::SeqCst);
    }

    pub fn clear_disconnect(&self) {
        self.conn.fetch_and(!DISCONNECT, Ordering::SeqCst);
    }

    pub fn clear_no_peer(&self) {
        self.conn.fetch_and(!NO_PEER, Ordering::SeqCst);
    }
}

extern "C" fn on_terminate(_sig: libc::c_int) {
    if PROCESS_FLAGS.fetch_or(SHUTDOWN, Ordering::SeqCst) & SHUTDOWN != 0 {
        // second request: exit directly in case we are hanging somewhere
        const MSG: &[u8] = b"terminate signal repeated, exiting\n";
        unsafe {
            libc::write(2, MSG.as_ptr() as *const libc::c_void, MSG.len());
            libc::_exit(0);
        }
    }
}

extern "C" fn on_wakeup(_sig: libc::c_int) {
    // nothing to do; delivery alone unblocks a syscall with EINTR
}

/// Signal used to knock a worker thread out of a blocking syscall so it
/// notices the shutdown flag.
pub const WAKEUP_SIGNAL: libc::c_int = libc::SIGUSR1;

/// Register SIGTERM/SIGINT with the two-step shutdown handler and the
/// wakeup signal with a no-op. SA_RESTART is deliberately left off so
/// blocking calls return EINTR and the loops get to observe the flags.
pub fn install_terminate_handlers() -> Result<()> {
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = on_terminate as usize;
        libc::sigemptyset(&mut act.sa_mask);
        act.sa_flags = 0;
        for sig in [libc::SIGTERM, libc::SIGINT] {
            if libc::sigaction(sig, &act, std::ptr::null_mut()) != 0 {
                bail!(
                    "sigaction failed for signal {}: {}",
                    sig,
                    std::io::Error::last_os_error()
                );
            }
        }

        let mut wake: libc::sigaction = std::mem::zeroed();
        wake.sa_sigaction = on_wakeup as usize;
        libc::sigemptyset(&mut wake.sa_mask);
        wake.sa_flags = 0;
        if libc::sigaction(WAKEUP_SIGNAL, &wake, std::ptr::null_mut()) != 0 {
            bail!(
                "sigaction failed for wakeup signal: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    Ok(())
}

/// Epoch seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Sleep up to `secs`, returning early once a shutdown or disconnect is
/// requested.
pub fn sleep_interruptible(ctl: &Control, secs: u64) {
    let mut left = secs;
    while left > 0 && !ctl.stopping() {
        std::thread::sleep(Duration::from_secs(1));
        left -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_scope_isolates_connection_bits() {
        let ctl = Control::isolated();
        let worker = ctl.for_worker();
        worker.set_no_peer();
        assert!(worker.disconnect());
        assert!(worker.no_peer());
        assert!(!ctl.disconnect());

        ctl.set_shutdown();
        assert!(worker.shutdown());
    }

    #[test]
    fn clear_leaves_other_bits() {
        let ctl = Control::isolated();
        ctl.set_no_peer();
        ctl.clear_disconnect();
        assert!(!ctl.disconnect());
        assert!(ctl.no_peer());
        ctl.clear_no_peer();
        assert!(!ctl.no_peer());
    }

    #[test]
    fn stopping_tracks_either_bit() {
        let ctl = Control::isolated();
        assert!(!ctl.stopping());
        ctl.set_disconnect();
        assert!(ctl.stopping());
        ctl.clear_disconnect();
        assert!(!ctl.stopping());
    }
}
