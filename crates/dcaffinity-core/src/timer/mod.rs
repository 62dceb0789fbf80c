//! Wakeable timer shared by the two worker loops
//!
//! A worker owns a [`WakeableTimer`] and sleeps on it between ticks. Anyone
//! holding a [`WakeHandle`] can cut the sleep short, ask the worker to stop,
//! or wake it and wait until a full tick has run.
//!
//! ```text
//!  WakeHandle::wake()           ──try_send──▶ ┌──────────────┐
//!  WakeHandle::wake_and_wait()  ──register──▶ │ WakeableTimer│ ── sleep_until() ──▶ WakeReason
//!  WakeHandle::request_shutdown() ─flag+wake▶ └──────────────┘
//! ```
//!
//! ## Wake coalescing
//!
//! The wake channel has capacity 1 and sends never block. Any number of
//! wakes delivered while the worker is busy produce exactly one extra tick.
//!
//! ## Acknowledgement
//!
//! `wake_and_wait` parks a waiter in the pending list. `begin_tick` moves
//! pending waiters in flight, so a waiter is only released by a tick that
//! started after it registered. `finish_tick` releases them.
//!
//! | AckState    | meaning                                     |
//! |-------------|---------------------------------------------|
//! | `Idle`      | no tick has run since attach                |
//! | `Running`   | a tick is in progress                       |
//! | `Updated`   | the last tick finished, nobody was waiting  |
//! | `Signalled` | the last tick finished and released waiters |

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Why `sleep_until` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    TimedOut,
    Woken,
    Shutdown,
}

/// Acknowledgement progress of the owning worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckState {
    #[default]
    Idle,
    Running,
    Updated,
    Signalled,
}

type AckSender = oneshot::Sender<Result<()>>;

#[derive(Default)]
struct AckBook {
    state: AckState,
    attached: bool,
    pending: Vec<AckSender>,
    in_flight: Vec<AckSender>,
}

struct Shared {
    name: &'static str,
    shutdown: AtomicBool,
    completed_ticks: AtomicU64,
    book: Mutex<AckBook>,
}

impl Shared {
    fn book(&self) -> MutexGuard<'_, AckBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Worker side of the timer
pub struct WakeableTimer {
    rx: mpsc::Receiver<()>,
    handle: WakeHandle,
}

/// Caller side of the timer
#[derive(Clone)]
pub struct WakeHandle {
    tx: mpsc::Sender<()>,
    shared: Arc<Shared>,
}

impl WakeableTimer {
    /// `name` only appears in logs
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            name,
            shutdown: AtomicBool::new(false),
            completed_ticks: AtomicU64::new(0),
            book: Mutex::new(AckBook::default()),
        });
        Self {
            rx,
            handle: WakeHandle { tx, shared },
        }
    }

    pub fn handle(&self) -> WakeHandle {
        self.handle.clone()
    }

    /// Sleep until `deadline`, an explicit wake, or shutdown
    pub async fn sleep_until(&mut self, deadline: Instant) -> WakeReason {
        if self.handle.is_shutdown_requested() {
            return WakeReason::Shutdown;
        }

        let reason = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => WakeReason::TimedOut,
            msg = self.rx.recv() => match msg {
                Some(()) => WakeReason::Woken,
                None => WakeReason::Shutdown,
            },
        };

        if self.handle.is_shutdown_requested() {
            WakeReason::Shutdown
        } else {
            trace!(timer = self.handle.shared.name, ?reason, "Timer returned");
            reason
        }
    }

    /// Mark a worker as serving this timer; waiters block from now on
    pub fn attach(&self) {
        self.handle.shared.book().attached = true;
    }

    /// A tick is starting; waiters registered so far will be released by it
    pub fn begin_tick(&self) {
        let mut book = self.handle.shared.book();
        let pending = std::mem::take(&mut book.pending);
        book.in_flight.extend(pending);
        book.state = AckState::Running;
    }

    /// Whether the running tick has callers waiting on it
    pub fn has_waiters(&self) -> bool {
        !self.handle.shared.book().in_flight.is_empty()
    }

    /// The tick finished; release its waiters
    pub fn finish_tick(&self) {
        self.handle.shared.completed_ticks.fetch_add(1, Ordering::SeqCst);

        let mut book = self.handle.shared.book();
        book.state = AckState::Updated;
        let waiters = std::mem::take(&mut book.in_flight);
        let mut released = 0usize;
        for waiter in waiters {
            if waiter.send(Ok(())).is_ok() {
                released += 1;
            }
        }
        if released > 0 {
            book.state = AckState::Signalled;
            debug!(timer = self.handle.shared.name, released, "Released tick waiters");
        }
    }

    /// Detach and release every waiter with `ShuttingDown`. Idempotent
    pub fn close(&self) {
        let mut book = self.handle.shared.book();
        book.attached = false;
        book.state = AckState::Idle;
        let pending = std::mem::take(&mut book.pending);
        let in_flight = std::mem::take(&mut book.in_flight);
        for waiter in pending.into_iter().chain(in_flight) {
            let _ = waiter.send(Err(Error::ShuttingDown));
        }
    }
}

impl Drop for WakeableTimer {
    fn drop(&mut self) {
        self.close();
    }
}

impl WakeHandle {
    /// Non-blocking wake. Returns `false` if a wake was already queued
    pub fn wake(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                trace!(timer = self.shared.name, "Wake coalesced");
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    /// Wake the worker and wait for a full tick that started after this call
    ///
    /// Resolves immediately when no worker is attached.
    ///
    /// # Errors
    ///
    /// - `ShuttingDown` if shutdown began before or during the wait
    pub async fn wake_and_wait(&self) -> Result<()> {
        let rx = {
            let mut book = self.shared.book();
            if self.is_shutdown_requested() {
                return Err(Error::ShuttingDown);
            }
            if !book.attached {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            book.pending.push(tx);
            rx
        };

        self.wake();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ShuttingDown),
        }
    }

    /// Set the shutdown flag and wake the worker
    pub fn request_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        self.shared.book().attached
    }

    pub fn ack_state(&self) -> AckState {
        self.shared.book().state
    }

    /// Ticks finished since the timer was created
    pub fn completed_ticks(&self) -> u64 {
        self.shared.completed_ticks.load(Ordering::SeqCst)
    }
}
