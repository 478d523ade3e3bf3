//! Worker pool: a bounded FIFO queue drained by N threads.
//!
//! Two dispatch disciplines, chosen at startup:
//!
//! - Proactor: the event loop performs the socket I/O and hands the
//!   fully-received request to a worker, which runs parse → handle → header
//!   assembly and re-arms the descriptor for write readiness.
//! - Reactor: the loop only enqueues; the worker performs the I/O call
//!   itself and then the same processing. The loop blocks on the item's
//!   completion latch so it never advances past a descriptor whose work is
//!   still in flight, and only the loop thread ever touches timers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use crate::config::ActorModel;
use crate::parser::HttpCode;
use crate::response::WriteOutcome;
use crate::slot::ConnCell;
use crate::syscalls::{Epoll, Interest};
use crate::users::{DbLease, DbPool, UsersCache};

pub const MAX_REQUESTS: usize = 10_000;

/// Which I/O call a reactor-mode worker performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

struct WorkItem {
    cell: Arc<ConnCell>,
    /// None for proactor items: the loop already did the I/O.
    kind: Option<IoKind>,
}

/// Completion handshake between a reactor-mode worker and the event loop.
///
/// The worker signals done plus an `io_failed` bit; the loop consumes the
/// bit to decide whether to tear the connection down.
pub struct CompletionLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

#[derive(Default)]
struct LatchState {
    done: bool,
    io_failed: bool,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn complete(&self, io_failed: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.done = true;
        state.io_failed = io_failed;
        drop(state);
        self.cond.notify_one();
    }

    /// Block until the worker acknowledges; returns the failure bit and
    /// resets for the next handoff.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !state.done {
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        let failed = state.io_failed;
        state.done = false;
        state.io_failed = false;
        failed
    }
}

impl Default for CompletionLatch {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared<P: DbPool> {
    queue: Mutex<VecDeque<WorkItem>>,
    cond: Condvar,
    stop: AtomicBool,
    actor: ActorModel,
    users: Arc<UsersCache>,
    db: Arc<P>,
    epoll: Arc<Epoll>,
}

pub struct WorkerPool<P: DbPool> {
    shared: Arc<Shared<P>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl<P: DbPool> WorkerPool<P> {
    pub fn new(
        thread_count: usize,
        actor: ActorModel,
        users: Arc<UsersCache>,
        db: Arc<P>,
        epoll: Arc<Epoll>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
            actor,
            users,
            db,
            epoll,
        });

        let mut threads = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("minuet-worker-{}", i))
                .spawn(move || worker_run(shared))?;
            threads.push(handle);
        }

        Ok(Self { shared, threads })
    }

    /// Enqueue a reactor-mode item. False when the queue is at capacity.
    pub fn append(&self, cell: Arc<ConnCell>, kind: IoKind) -> bool {
        self.push(WorkItem {
            cell,
            kind: Some(kind),
        })
    }

    /// Enqueue a proactor-mode item. False when the queue is at capacity.
    pub fn append_proactor(&self, cell: Arc<ConnCell>) -> bool {
        self.push(WorkItem { cell, kind: None })
    }

    fn push(&self, item: WorkItem) -> bool {
        {
            let mut queue = self.lock_queue();
            if queue.len() >= MAX_REQUESTS {
                return false;
            }
            queue.push_back(item);
        }
        self.shared.cond.notify_one();
        true
    }

    /// Signal stop, let workers drain the queue, and join them.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<P: DbPool> Drop for WorkerPool<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_run<P: DbPool>(shared: Arc<Shared<P>>) {
    loop {
        let item = {
            let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(item) = queue.pop_front() {
                    break item;
                }
                if shared.stop.load(Ordering::SeqCst) {
                    return;
                }
                queue = shared.cond.wait(queue).unwrap_or_else(|e| e.into_inner());
            }
        };

        // A panicking request must not kill the worker, and in reactor mode
        // the loop is blocked on the latch, so completion happens here no
        // matter what.
        match (shared.actor, item.kind) {
            (ActorModel::Reactor, Some(kind)) => {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    reactor_item(&shared, &item.cell, kind)
                }));
                let failed = match result {
                    Ok(failed) => failed,
                    Err(_) => {
                        tracing::error!("worker task panicked; dropping item");
                        true
                    }
                };
                item.cell.latch.complete(failed);
            }
            _ => {
                // Proactor: the loop already read; just process.
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    process_item(&shared, &item.cell)
                }));
                if result.is_err() {
                    tracing::error!("worker task panicked; dropping item");
                }
            }
        }
    }
}

/// Reactor discipline: the worker performs the I/O call itself.
/// Returns true when the loop should destroy the connection.
fn reactor_item<P: DbPool>(shared: &Shared<P>, cell: &Arc<ConnCell>, kind: IoKind) -> bool {
    match kind {
        IoKind::Read => {
            if !cell.lock().read_once() {
                return true;
            }
            process_item(shared, cell);
            false
        }
        IoKind::Write => drive_write(shared, cell),
    }
}

/// parse → handle → stage response headers, then re-arm for write.
fn process_item<P: DbPool>(shared: &Shared<P>, cell: &Arc<ConnCell>) {
    let Some(mut lease) = DbLease::acquire(&*shared.db) else {
        tracing::warn!("db pool shut down; dropping request");
        return;
    };

    let (fd, trigger) = {
        let mut conn = cell.lock();
        let code = conn.process_read();
        if code == HttpCode::NoRequest {
            let fd = conn.fd();
            let trigger = conn.trigger;
            drop(conn);
            if let Err(e) = shared.epoll.rearm(fd, Interest::Read, trigger, true) {
                tracing::error!(fd, error = %e, "rearm for read failed");
            }
            return;
        }

        let code = if code == HttpCode::GetRequest {
            conn.do_request(&shared.users, lease.conn_mut())
        } else {
            code
        };

        if !conn.process_write(code) {
            tracing::error!(fd = conn.fd(), "response assembly failed; sending 500");
            conn.reset_write();
            if !conn.process_write(HttpCode::InternalError) {
                conn.keep_alive = false;
            }
        }
        (conn.fd(), conn.trigger)
    };

    if let Err(e) = shared.epoll.rearm(fd, Interest::Write, trigger, true) {
        tracing::error!(fd, error = %e, "rearm for write failed");
    }
}

/// Reactor-mode write: run the emitter and apply its verdict.
/// Returns true when the loop should destroy the connection.
fn drive_write<P: DbPool>(shared: &Shared<P>, cell: &Arc<ConnCell>) -> bool {
    let (outcome, fd, trigger) = {
        let mut conn = cell.lock();
        (conn.write(), conn.fd(), conn.trigger)
    };

    match outcome {
        WriteOutcome::Again => {
            if let Err(e) = shared.epoll.rearm(fd, Interest::Write, trigger, true) {
                tracing::error!(fd, error = %e, "rearm for write failed");
            }
            false
        }
        WriteOutcome::Complete { keep_alive: true } => {
            cell.lock().reset();
            if let Err(e) = shared.epoll.rearm(fd, Interest::Read, trigger, true) {
                tracing::error!(fd, error = %e, "rearm for read failed");
            }
            false
        }
        WriteOutcome::Complete { keep_alive: false } | WriteOutcome::Error => true,
    }
}
