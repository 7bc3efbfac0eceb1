//! Connection dispatcher
//!
//! Listens on the well-known port and hands each accepted connection to a
//! worker running the receive service. Workers are OS threads with a
//! strict cap: when every slot is taken the dispatcher probes slot
//! liveness, and if the table is genuinely full it stops accepting until
//! something exits. Workers share nothing with each other; each gets its
//! own connection-scoped control word and its own record sink named after
//! its slot.
//!
//! A failed accept closes the listen socket so it is recreated on the
//! next pass. Shutdown closes the listener and drains the live workers,
//! which observe the shared shutdown flag on their own.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::FromRawFd;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, Result};

use crate::control::{sleep_interruptible, Control};
use crate::logger::RecordSink;
use crate::receiver::{ReceiverOptions, Service};
use crate::store::Store;

const RECOVER_SLEEP: u64 = 3;
const MAX_WORKER_SLEEP: u64 = 30;
const LISTEN_BACKLOG: libc::c_int = 10;

#[derive(Clone, Debug)]
pub struct DispatchOptions {
    pub listen_port: u16,
    /// worker cap; 0 runs the service inline on the dispatcher
    pub max_worker: usize,
    pub verbosity: u8,
}

/// Everything needed to stamp out one worker.
pub struct WorkerSpec {
    pub recv_opt: ReceiverOptions,
    pub store: Arc<dyn Store>,
    pub program: String,
    /// builds the record sink for a worker identity
    pub sink_factory: Arc<dyn Fn(&str) -> Arc<dyn RecordSink> + Send + Sync>,
}

pub struct Dispatcher {
    opt: DispatchOptions,
    ctl: Control,
    sink: Arc<dyn RecordSink>,
    spec: WorkerSpec,
    workers: Vec<Option<JoinHandle<i32>>>,
    count: usize,
    listener: Option<TcpListener>,
}

impl Dispatcher {
    pub fn new(
        opt: DispatchOptions,
        ctl: Control,
        sink: Arc<dyn RecordSink>,
        spec: WorkerSpec,
    ) -> Dispatcher {
        let slots = opt.max_worker;
        Dispatcher {
            opt,
            ctl,
            sink,
            spec,
            workers: (0..slots).map(|_| None).collect(),
            count: 0,
            listener: None,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        while !self.ctl.shutdown() {
            if self.listener.is_none() {
                let listener = new_listen_socket(self.opt.listen_port)?;
                if self.opt.verbosity > 0 {
                    self.sink.debug(&format!(
                        "listening on port {}",
                        self.opt.listen_port
                    ));
                }
                self.listener = Some(listener);
            }

            if self.opt.max_worker > 0 && self.count >= self.opt.max_worker {
                self.reap_finished();
                if self.count >= self.opt.max_worker {
                    self.sink.error(&format!(
                        "WARNING: {} workers running, no more connections",
                        self.count
                    ));
                    sleep_interruptible(&self.ctl, MAX_WORKER_SLEEP);
                    continue;
                }
            }

            let accepted = self
                .listener
                .as_ref()
                .expect("listener created above")
                .accept();
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.sink.error(&format!("FAIL accept: {}", e));
                    self.listener = None;
                    sleep_interruptible(&self.ctl, RECOVER_SLEEP);
                    continue;
                }
            };

            let rhost = resolve_host(&addr);
            if self.opt.verbosity > 0 {
                self.sink.debug(&format!(
                    "accepted connection from host {}, port {}",
                    rhost,
                    addr.port()
                ));
            }

            if self.opt.max_worker == 0 {
                self.serve_inline(stream, &rhost);
            } else {
                self.spawn_worker(stream, rhost);
            }

            self.reap_finished();
        }

        self.listener = None;
        self.drain_workers();
        Ok(())
    }

    fn serve_inline(&self, mut stream: TcpStream, rhost: &str) {
        let sink = (self.spec.sink_factory)(&self.spec.program);
        let mut service = Service::new(
            self.spec.recv_opt.clone(),
            self.ctl.for_worker(),
            sink,
            self.spec.store.clone(),
            self.spec.program.clone(),
        );
        if let Err(e) = service.run(&mut stream, rhost) {
            self.sink
                .error(&format!("service for {} failed: {:#}", rhost, e));
        }
    }

    fn spawn_worker(&mut self, stream: TcpStream, rhost: String) {
        let slot = match self.workers.iter().position(|w| w.is_none()) {
            Some(slot) => slot,
            None => {
                self.sink.error("no worker slots available");
                let _ = stream.shutdown(std::net::Shutdown::Both);
                return;
            }
        };

        let program = format!("{}_{}", self.spec.program, slot);
        let sink = (self.spec.sink_factory)(&program);
        let mut service = Service::new(
            self.spec.recv_opt.clone(),
            self.ctl.for_worker(),
            sink.clone(),
            self.spec.store.clone(),
            program.clone(),
        );

        let spawned = std::thread::Builder::new()
            .name(format!("worker-{}", slot))
            .spawn(move || {
                sink.debug(&format!("worker {} starting", program));
                let mut stream = stream;
                let status = match service.run(&mut stream, &rhost) {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                sink.debug(&format!(
                    "worker {} exiting with status {}",
                    program, status
                ));
                sink.flush();
                status
            });

        match spawned {
            Ok(handle) => {
                self.workers[slot] = Some(handle);
                self.count += 1;
            }
            Err(e) => {
                self.sink.error(&format!("FAIL spawn worker: {}", e));
            }
        }
    }

    /// Clear the slots of workers that have exited.
    fn reap_finished(&mut self) {
        for slot in 0..self.workers.len() {
            let finished = self.workers[slot]
                .as_ref()
                .map(|h| h.is_finished())
                .unwrap_or(false);
            if !finished {
                continue;
            }
            if let Some(handle) = self.workers[slot].take() {
                match handle.join() {
                    Ok(status) => {
                        if self.opt.verbosity > 0 {
                            self.sink.debug(&format!(
                                "worker {} exited with status {}",
                                slot, status
                            ));
                        }
                    }
                    Err(_) => {
                        self.sink
                            .error(&format!("worker {} terminated abnormally", slot));
                    }
                }
                self.count -= 1;
            }
        }
    }

    /// Shutdown path: knock every live worker out of its blocking read so
    /// it observes the shared shutdown flag, then wait for them all.
    fn drain_workers(&mut self) {
        use std::os::unix::thread::JoinHandleExt;
        for slot in 0..self.workers.len() {
            if let Some(handle) = self.workers[slot].take() {
                unsafe {
                    libc::pthread_kill(handle.as_pthread_t(), crate::control::WAKEUP_SIGNAL);
                }
                let _ = handle.join();
                self.count = self.count.saturating_sub(1);
            }
        }
    }
}

/// Create the listen socket: reusable address, any interface, a short
/// backlog.
pub fn new_listen_socket(port: u16) -> Result<TcpListener> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            bail!("socket failed: {}", std::io::Error::last_os_error());
        }

        let close_and = |msg: &str| -> anyhow::Error {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            anyhow::anyhow!("{}: {}", msg, err)
        };

        let option: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &option as *const _ as *const libc::c_void,
            std::mem::size_of_val(&option) as libc::socklen_t,
        ) != 0
        {
            return Err(close_and("setsockopt failed"));
        }

        let local = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &local as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            return Err(close_and("bind failed"));
        }

        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            return Err(close_and("listen failed"));
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

/// Reverse-resolve the client address; "unknown" when resolution fails.
fn resolve_host(addr: &SocketAddr) -> String {
    let mut host = [0 as libc::c_char; 256];
    let rc = unsafe {
        match addr {
            SocketAddr::V4(sa) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: sa.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(sa.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::getnameinfo(
                    &sin as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    0,
                )
            }
            SocketAddr::V6(sa) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: sa.port().to_be(),
                    sin6_flowinfo: sa.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: sa.ip().octets(),
                    },
                    sin6_scope_id: sa.scope_id(),
                };
                libc::getnameinfo(
                    &sin6 as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    0,
                )
            }
        }
    };

    if rc == 0 {
        let bytes: Vec<u8> = host
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        if !bytes.is_empty() {
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_socket_accepts_connections() {
        let listener = new_listen_socket(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);

        let client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (_, addr) = listener.accept().unwrap();
        assert_eq!(addr.ip(), client.local_addr().unwrap().ip());
    }

    #[test]
    fn loopback_resolves_to_something() {
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let name = resolve_host(&addr);
        assert!(!name.is_empty());
    }
}
