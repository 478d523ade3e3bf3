//! The event loop: accept policy, readiness dispatch, signal handling, and
//! idle-connection reaping.
//!
//! One loop thread owns the slot table and the timer list; workers only see
//! `ConnCell`s. Per descriptor, one-shot registration means at most one
//! thread works a connection at a time.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ActorModel, Config};
use crate::conn::Connection;
use crate::error::ServerResult;
use crate::pool::{IoKind, WorkerPool};
use crate::response::WriteOutcome;
use crate::signals::{self, SignalBridge};
use crate::slot::{ClientRecord, ConnCell, SlotTable, MAX_FD};
use crate::syscalls::{self, epoll_event, Epoll, Interest, TriggerMode};
use crate::timer::TimerList;
use crate::users::{DbPool, UsersCache};

pub const MAX_EVENT_NUMBER: usize = 10_000;

/// Base tick interval in seconds; idle timeout is three timeslots.
pub const TIMESLOT: u32 = 5;

const BUSY_MESSAGE: &[u8] = b"Internal server busy";

pub struct Server<P: DbPool> {
    actor: ActorModel,
    listen_trigger: TriggerMode,
    conn_trigger: TriggerMode,

    epoll: Arc<Epoll>,
    listen_fd: RawFd,
    signals: SignalBridge,
    slots: SlotTable,
    timers: TimerList,
    pool: WorkerPool<P>,
    db: Arc<P>,
    doc_root: Arc<PathBuf>,
    user_count: usize,
}

impl<P: DbPool> Server<P> {
    /// Wire the whole graph: listen socket, reactor, signal pipe, workers.
    pub fn new(cfg: &Config, db: Arc<P>, users: Arc<UsersCache>) -> ServerResult<Self> {
        let epoll = Arc::new(Epoll::new()?);

        let listen_fd = syscalls::create_listen_socket(cfg.port, cfg.opt_linger == 1)?;
        epoll.add(listen_fd, Interest::Read, cfg.listen_trigger, false)?;

        let signals = SignalBridge::install()?;
        epoll.add(signals.read_fd(), Interest::Read, TriggerMode::Level, false)?;

        let pool = WorkerPool::new(
            cfg.thread_num as usize,
            cfg.actor(),
            users,
            Arc::clone(&db),
            Arc::clone(&epoll),
        )?;

        let doc_root = Arc::new(std::env::current_dir()?.join("root"));
        tracing::info!(port = cfg.port, root = %doc_root.display(), "listening");

        signals::schedule_alarm(TIMESLOT);

        Ok(Self {
            actor: cfg.actor(),
            listen_trigger: cfg.listen_trigger,
            conn_trigger: cfg.conn_trigger,
            epoll,
            listen_fd,
            signals,
            slots: SlotTable::new(MAX_FD),
            timers: TimerList::new(),
            pool,
            db,
            doc_root,
            user_count: 0,
        })
    }

    /// Run until SIGTERM. Returns an error only on a readiness-wait failure.
    pub fn run(&mut self) -> ServerResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENT_NUMBER];
        let mut timeout = false;
        let mut stop = false;

        while !stop {
            let n = match self.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "epoll failure");
                    return Err(e.into());
                }
            };

            for event in &events[..n] {
                let fd = event.u64 as RawFd;
                let mask = event.events;

                if fd == self.listen_fd {
                    self.accept_all();
                } else if mask & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                    self.destroy(fd);
                } else if fd == self.signals.read_fd() {
                    if !self.signals.drain(|sig| match sig {
                        libc::SIGALRM => timeout = true,
                        libc::SIGTERM => stop = true,
                        _ => {}
                    }) {
                        tracing::error!("signal pipe drain failed");
                    }
                } else if mask & libc::EPOLLIN as u32 != 0 {
                    self.handle_read(fd);
                } else if mask & libc::EPOLLOUT as u32 != 0 {
                    self.handle_write(fd);
                }
            }

            if timeout {
                self.tick();
                timeout = false;
            }
        }

        tracing::info!("stop signal received; shutting down");
        self.shutdown();
        Ok(())
    }

    // ─── Accept ───────────────────────────────────────────────

    fn accept_all(&mut self) {
        match self.listen_trigger {
            TriggerMode::Level => {
                self.accept_one();
            }
            TriggerMode::Edge => while self.accept_one() {},
        }
    }

    fn accept_one(&mut self) -> bool {
        let (fd, addr) = match syscalls::accept_connection(self.listen_fd) {
            Ok(Some(pair)) => pair,
            Ok(None) => return false,
            Err(e) => {
                tracing::error!(error = %e, "accept error");
                return false;
            }
        };

        if self.user_count >= MAX_FD {
            syscalls::send_best_effort(fd, BUSY_MESSAGE);
            syscalls::close_fd(fd);
            tracing::error!("internal server busy");
            return false;
        }

        self.register_client(fd, addr);
        true
    }

    fn register_client(&mut self, fd: RawFd, addr: SocketAddr) {
        let conn = Connection::new(fd, addr, self.conn_trigger, Arc::clone(&self.doc_root));
        let cell = ConnCell::new(conn);

        if let Err(e) = self.epoll.add(fd, Interest::Read, self.conn_trigger, true) {
            tracing::error!(fd, error = %e, "cannot register connection");
            syscalls::close_fd(fd);
            return;
        }

        let expires = Instant::now() + Duration::from_secs((3 * TIMESLOT) as u64);
        let timer = self.timers.add(expires, fd);

        if !self.slots.insert(ClientRecord {
            addr,
            fd,
            timer: Some(timer),
            cell,
        }) {
            tracing::error!(fd, "slot table rejected descriptor");
            self.timers.remove(timer);
            let _ = self.epoll.delete(fd);
            syscalls::close_fd(fd);
            return;
        }

        self.user_count += 1;
        tracing::info!(fd, peer = %addr, "connection accepted");
    }

    // ─── Readiness dispatch ───────────────────────────────────

    fn handle_read(&mut self, fd: RawFd) {
        let Some(record) = self.slots.get(fd) else {
            return;
        };
        let cell = Arc::clone(&record.cell);

        match self.actor {
            ActorModel::Reactor => {
                self.adjust_timer(fd);
                if !self.pool.append(Arc::clone(&cell), IoKind::Read) {
                    self.refuse_busy(fd);
                    return;
                }
                if cell.latch.wait() {
                    self.destroy(fd);
                }
            }
            ActorModel::Proactor => {
                let ok = cell.lock().read_once();
                if !ok {
                    self.destroy(fd);
                    return;
                }
                tracing::debug!(fd, "request bytes received");
                if !self.pool.append_proactor(cell) {
                    self.refuse_busy(fd);
                    return;
                }
                self.adjust_timer(fd);
            }
        }
    }

    fn handle_write(&mut self, fd: RawFd) {
        let Some(record) = self.slots.get(fd) else {
            return;
        };
        let cell = Arc::clone(&record.cell);

        match self.actor {
            ActorModel::Reactor => {
                self.adjust_timer(fd);
                if !self.pool.append(Arc::clone(&cell), IoKind::Write) {
                    self.refuse_busy(fd);
                    return;
                }
                if cell.latch.wait() {
                    self.destroy(fd);
                }
            }
            ActorModel::Proactor => {
                let outcome = cell.lock().write();
                match outcome {
                    WriteOutcome::Again => {
                        if let Err(e) =
                            self.epoll.rearm(fd, Interest::Write, self.conn_trigger, true)
                        {
                            tracing::error!(fd, error = %e, "rearm for write failed");
                        }
                        self.adjust_timer(fd);
                    }
                    WriteOutcome::Complete { keep_alive: true } => {
                        cell.lock().reset();
                        if let Err(e) =
                            self.epoll.rearm(fd, Interest::Read, self.conn_trigger, true)
                        {
                            tracing::error!(fd, error = %e, "rearm for read failed");
                        }
                        self.adjust_timer(fd);
                        tracing::debug!(fd, "response sent; keeping alive");
                    }
                    WriteOutcome::Complete { keep_alive: false } | WriteOutcome::Error => {
                        self.destroy(fd);
                    }
                }
            }
        }
    }

    /// Worker queue full: best-effort refusal on the wire, then teardown.
    fn refuse_busy(&mut self, fd: RawFd) {
        tracing::warn!(fd, "worker queue full; refusing request");
        syscalls::send_best_effort(fd, BUSY_MESSAGE);
        self.destroy(fd);
    }

    // ─── Timers ───────────────────────────────────────────────

    /// Every successful I/O pushes the idle deadline out to now + 3
    /// timeslots.
    fn adjust_timer(&mut self, fd: RawFd) {
        if let Some(record) = self.slots.get(fd) {
            if let Some(timer) = record.timer {
                let expires = Instant::now() + Duration::from_secs((3 * TIMESLOT) as u64);
                self.timers.adjust(timer, expires);
                tracing::debug!(fd, "adjust timer once");
            }
        }
    }

    fn tick(&mut self) {
        let expired = self.timers.tick(Instant::now());
        for fd in expired {
            // The node is already unlinked; drop the handle before teardown.
            if let Some(record) = self.slots.get_mut(fd) {
                record.timer = None;
            }
            tracing::info!(fd, "idle timeout");
            self.destroy(fd);
        }
        signals::schedule_alarm(TIMESLOT);
        tracing::debug!("timer tick");
    }

    // ─── Teardown ─────────────────────────────────────────────

    fn destroy(&mut self, fd: RawFd) {
        let Some(record) = self.slots.remove(fd) else {
            return;
        };
        if let Err(e) = self.epoll.delete(fd) {
            tracing::debug!(fd, error = %e, "epoll delete failed");
        }
        syscalls::close_fd(fd);
        if let Some(timer) = record.timer {
            self.timers.remove(timer);
        }
        self.user_count -= 1;
        tracing::info!(fd, peer = %record.addr, "connection closed");
    }

    fn shutdown(&mut self) {
        self.pool.shutdown();
        self.db.shutdown();
        syscalls::close_fd(self.listen_fd);
        tracing::info!("server stopped");
    }
}
