//! Admission control for connection handlers.
//!
//! The gate is a counting semaphore backed by a bounded channel: taking a
//! slot pushes a token, releasing one pops it. Once `capacity` tokens are
//! buffered the next [`AdmissionGate::acquire`] blocks until a [`Permit`] is
//! dropped.
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
    mpsc::{self, Receiver, SyncSender},
};

use log::trace;

/// Default number of handlers allowed to run at once.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    capacity: usize,
    in_use: AtomicUsize,
    slots: SyncSender<()>,
    released: Mutex<Receiver<()>>,
}

impl AdmissionGate {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);

        let (slots, released) = mpsc::sync_channel(capacity);
        Self {
            inner: Arc::new(GateInner {
                capacity,
                in_use: AtomicUsize::new(0),
                slots,
                released: Mutex::new(released),
            }),
        }
    }

    /// Take a slot, blocking while the gate is full.
    pub fn acquire(&self) -> Permit {
        // The receiver lives as long as `inner`, so the send cannot fail.
        let _ = self.inner.slots.send(());
        let in_use = self.inner.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("admission slot taken ({in_use}/{})", self.inner.capacity);

        Permit {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        self.inner.slots.try_send(()).ok()?;
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);

        Some(Permit {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A held gate slot; dropping it frees the slot.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct Permit {
    inner: Arc<GateInner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.in_use.fetch_sub(1, Ordering::AcqRel);

        let released = match self.inner.released.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // every live permit has a buffered token, so this never waits
        let _ = released.try_recv();
    }
}
