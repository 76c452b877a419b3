//! Writer-priority reader/writer protocol over the named primitives.
//!
//! Writers serialize on the write gate, announce themselves on the writer
//! flag and then drain every read slot. Readers wait for the flag before
//! taking one slot, so a reader that shows up after a writer announced
//! itself queues behind that writer even if slots are still free.

use std::time::Duration;

use tracing::{debug, error, trace, warn, Span};

use crate::config::LockConfig;
use crate::errors::{Result, StoreError};
use crate::segment::{self, GateEntry, Segment};

/// Reader/writer locking capability.
///
/// `acquire_*` either returns with the lock held or returns an error with
/// nothing held. Prefer the scoped [`LockCoordinator::read`] and
/// [`LockCoordinator::write`] guards over pairing calls by hand.
pub trait LockCoordinator {
    fn acquire_read(&self) -> Result<()>;

    fn release_read(&self) -> Result<()>;

    fn acquire_write(&self) -> Result<()>;

    fn release_write(&self) -> Result<()>;

    fn read(&self) -> Result<LockGuard<'_, Self>>
    where
        Self: Sized,
    {
        self.acquire_read()?;
        Ok(LockGuard {
            coordinator: self,
            mode: LockMode::Read,
            held: true,
        })
    }

    fn write(&self) -> Result<LockGuard<'_, Self>>
    where
        Self: Sized,
    {
        self.acquire_write()?;
        Ok(LockGuard {
            coordinator: self,
            mode: LockMode::Write,
            held: true,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Releases its lock when dropped. Use [`LockGuard::release`] to see the
/// release error instead of having it logged.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a, C: LockCoordinator> {
    coordinator: &'a C,
    mode: LockMode,
    held: bool,
}

impl<'a, C: LockCoordinator> LockGuard<'a, C> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn release(mut self) -> Result<()> {
        self.held = false;
        self.release_inner()
    }

    fn release_inner(&self) -> Result<()> {
        match self.mode {
            LockMode::Read => self.coordinator.release_read(),
            LockMode::Write => self.coordinator.release_write(),
        }
    }
}

impl<'a, C: LockCoordinator> Drop for LockGuard<'a, C> {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = self.release_inner() {
                error!(mode = ?self.mode, error = %e, "failed to release lock");
            }
        }
    }
}

/// Coordinator backed by a named shared-memory segment, so every process
/// opening the same lock name takes part in the same protocol.
pub struct Coordinator {
    segment: Segment,
    reader_bound: u32,
    timeout: Duration,
    span: Span,
}

impl Coordinator {
    pub fn open(cfg: &LockConfig, span: Span) -> Result<Coordinator> {
        cfg.validate()?;
        let segment = Segment::open(cfg)?;
        debug!(
            parent: &span,
            os_id = %segment.os_id(),
            created = segment.created(),
            reader_bound = cfg.reader_bound,
            timeout = ?cfg.timeout(),
            "coordinator ready"
        );
        Ok(Coordinator {
            segment,
            reader_bound: cfg.reader_bound,
            timeout: cfg.timeout(),
            span,
        })
    }

    pub fn reader_bound(&self) -> u32 {
        self.reader_bound
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read slots currently free. `reader_bound()` means nobody holds a lock.
    pub fn available_slots(&self) -> Result<u32> {
        self.segment.slots.available()
    }

    pub fn gate_owner(&self) -> Result<Option<u32>> {
        self.segment.gate.owner()
    }

    #[cfg(test)]
    pub(crate) fn segment(&self) -> &Segment {
        &self.segment
    }
}

/// Partially acquired write lock; whatever it still records on drop is
/// handed back.
struct WriteAttempt<'a> {
    coordinator: &'a Coordinator,
    gate_held: bool,
    announced: bool,
    slots_held: u32,
}

impl<'a> WriteAttempt<'a> {
    fn new(coordinator: &'a Coordinator) -> Self {
        WriteAttempt {
            coordinator,
            gate_held: false,
            announced: false,
            slots_held: 0,
        }
    }

    fn commit(mut self) {
        self.gate_held = false;
        self.announced = false;
        self.slots_held = 0;
    }
}

impl Drop for WriteAttempt<'_> {
    fn drop(&mut self) {
        if !self.gate_held && !self.announced && self.slots_held == 0 {
            return;
        }
        let segment = &self.coordinator.segment;
        warn!(
            parent: &self.coordinator.span,
            slots_held = self.slots_held,
            reader_bound = self.coordinator.reader_bound,
            "rolling back partial write acquisition"
        );
        if self.slots_held > 0 {
            if let Err(e) = segment.slots.release(self.slots_held) {
                error!(parent: &self.coordinator.span, error = %e, "failed to return drained read slots");
            }
        }
        if self.announced {
            if let Err(e) = segment.writer_flag.mark_idle() {
                error!(parent: &self.coordinator.span, error = %e, "failed to clear writer flag");
            }
        }
        if self.gate_held {
            if let Err(e) = segment.gate.release() {
                error!(parent: &self.coordinator.span, error = %e, "failed to release write gate");
            }
        }
    }
}

impl LockCoordinator for Coordinator {
    fn acquire_read(&self) -> Result<()> {
        let acquired = self
            .segment
            .writer_flag
            .wait_idle(self.timeout)
            .and_then(|()| self.segment.slots.acquire(self.timeout));
        if let Err(e) = &acquired {
            error!(error = %e, "read lock not acquired");
        } else {
            trace!("read lock acquired");
        }
        acquired
    }

    fn release_read(&self) -> Result<()> {
        self.segment.slots.release(1)
    }

    fn acquire_write(&self) -> Result<()> {
        let mut attempt = WriteAttempt::new(self);
        let acquired = (|| -> Result<()> {
            let entry = self.segment.gate.acquire(self.timeout)?;
            attempt.gate_held = true;
            if let GateEntry::Inherited {
                owner_pid,
                announced,
                drained,
            } = entry
            {
                // Undone by the rollback, like our own partial progress.
                attempt.announced = announced;
                attempt.slots_held = drained;
                return Err(StoreError::LockAbandoned {
                    primitive: segment::WRITE_GATE,
                    owner_pid,
                });
            }
            self.segment.gate.record_progress(true, 0)?;
            self.segment.writer_flag.mark_writing()?;
            attempt.announced = true;
            for drained in 1..=self.reader_bound {
                self.segment.slots.acquire(self.timeout)?;
                attempt.slots_held = drained;
                self.segment.gate.record_progress(true, drained)?;
            }
            Ok(())
        })();
        match acquired {
            Ok(()) => {
                attempt.commit();
                trace!("write lock acquired");
                Ok(())
            }
            Err(e) => {
                error!(
                    error = %e,
                    slots_drained = attempt.slots_held,
                    reader_bound = self.reader_bound,
                    "write lock not acquired"
                );
                Err(e)
            }
        }
    }

    fn release_write(&self) -> Result<()> {
        let slots = self.segment.slots.release(self.reader_bound);
        let progress = self.segment.gate.record_progress(true, 0);
        let flag = self.segment.writer_flag.mark_idle();
        let gate = self.segment.gate.release();
        slots.and(progress).and(flag).and(gate)
    }
}

/// Removes the named segment of `cfg`; see [`segment::unlink`].
pub fn unlink_primitives(cfg: &LockConfig) -> Result<bool> {
    segment::unlink(cfg)
}
