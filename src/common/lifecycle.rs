//! Consumer lifecycle: status machine, shutdown signal, stop handle
//!
//! The status machine is `Unstarted → Starting → Running → Stopping →
//! Stopped`; `start` is only valid from `Unstarted` or `Stopped` (restart
//! after stop re-acquires the slot), and `enqueue`/`send` only succeed in
//! `Running`.

use crate::common::{HermesError, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// Lifecycle states of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerStatus {
    Unstarted = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ConsumerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Unstarted,
        }
    }
}

/// Shared, atomically updated consumer status.
#[derive(Clone)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConsumerStatus::Unstarted as u8)))
    }

    pub fn get(&self) -> ConsumerStatus {
        ConsumerStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, status: ConsumerStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    /// Transition into `Starting`, failing unless currently startable.
    pub fn begin_start(&self) -> Result<()> {
        let current = self.get();
        match current {
            ConsumerStatus::Unstarted | ConsumerStatus::Stopped => {
                self.set(ConsumerStatus::Starting);
                Ok(())
            }
            _ => Err(HermesError::InvalidState(format!(
                "start is not valid from {current:?}"
            ))),
        }
    }

    /// Fail with `NotStarted` unless the consumer is running.
    pub fn require_running(&self) -> Result<()> {
        if self.get() == ConsumerStatus::Running {
            Ok(())
        } else {
            Err(HermesError::NotStarted)
        }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative shutdown signal watched by all consumer tasks.
pub struct Shutdown {
    triggered: AtomicBool,
    notify: Notify,
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.triggered.load(Ordering::SeqCst))
            .finish()
    }
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            triggered: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Trigger the shutdown; idempotent.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Wait until the shutdown is triggered.
    pub async fn wait(&self) {
        while !self.is_triggered() {
            // Register before re-checking the flag: notify_waiters only
            // wakes already-registered waiters.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Idempotent stop handle returned by `start`.
///
/// The first `stop` triggers the shutdown signal and waits for the
/// consumer's supervisor to finish teardown; later (or concurrent) calls
/// wait for the same teardown and return success without repeating it.
#[derive(Clone, Debug)]
pub struct StopHandle {
    shutdown: Arc<Shutdown>,
    done: watch::Receiver<bool>,
}

impl StopHandle {
    pub(crate) fn new(shutdown: Arc<Shutdown>, done: watch::Receiver<bool>) -> Self {
        Self { shutdown, done }
    }

    /// Stop the consumer. Safe to call any number of times, concurrently.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.trigger();
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                // Supervisor dropped the sender; teardown is over either way.
                break;
            }
        }
        Ok(())
    }

    /// True once teardown has completed.
    pub fn is_stopped(&self) -> bool {
        *self.done.borrow()
    }
}
