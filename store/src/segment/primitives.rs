//! The three named primitives, each built from raw_sync objects living in
//! the shared segment.
//!
//! raw_sync events are manual-reset and only expose `wait`/`set`, so the
//! counters they announce are kept next to them under a raw_sync mutex.

use std::io;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use raw_sync::events::{EventImpl, EventState};
use raw_sync::locks::LockImpl;
use raw_sync::Timeout;
use tracing::trace;

use super::{GateState, SlotState, POLL_INTERVAL};
use crate::errors::{Result, StoreError};

pub const WRITE_GATE: &str = "write gate";
pub const READ_SLOTS: &str = "read slots";
pub const WRITER_FLAG: &str = "writer flag";

// raw_sync builds the absolute deadline of a timed wait without carrying
// nanoseconds into seconds, so a wait can fail at once with EINVAL.
const FAILED_WAIT_BACKOFF: Duration = Duration::from_millis(1);

/// Waits for `event` for one slice of at most `POLL_INTERVAL`, never past
/// `until`. Returns true when the event is signaled. False covers timeouts
/// and failed waits alike: callers re-check their state and deadline.
fn wait_slice(event: &dyn EventImpl, until: Instant, primitive: &'static str) -> bool {
    let started = Instant::now();
    if started >= until {
        return false;
    }
    let slice = (until - started).min(POLL_INTERVAL);
    match event.wait(Timeout::Val(slice)) {
        Ok(()) => true,
        Err(e) => {
            let waited = started.elapsed();
            if waited < slice {
                trace!(primitive, error = %e, ?waited, "timed wait returned early");
                thread::sleep(FAILED_WAIT_BACKOFF.min(slice - waited));
            }
            false
        }
    }
}

fn set_event(event: &dyn EventImpl, state: EventState, primitive: &'static str) -> Result<()> {
    event
        .set(state)
        .map_err(|e| StoreError::primitive(primitive, e))
}

fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// How [`WriteGate::acquire`] obtained the token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateEntry {
    Free,
    /// Taken over from a process that died holding it. `announced` and
    /// `drained` are that process' last recorded progress, which the new
    /// holder has to give back.
    Inherited {
        owner_pid: u32,
        announced: bool,
        drained: u32,
    },
}

fn take(state: &mut GateState, pid: u32) {
    state.held = 1;
    state.owner_pid = pid;
    state.announced = 0;
    state.drained = 0;
}

fn clear(state: &mut GateState) {
    state.held = 0;
    state.owner_pid = 0;
    state.announced = 0;
    state.drained = 0;
}

/// Mutual-exclusion token shared by all writers of every process.
pub struct WriteGate {
    lock: Box<dyn LockImpl>,
    free: Box<dyn EventImpl>,
}

impl WriteGate {
    pub(super) fn new(lock: Box<dyn LockImpl>, free: Box<dyn EventImpl>) -> WriteGate {
        WriteGate { lock, free }
    }

    pub(super) fn init(&self) -> Result<()> {
        self.with_state(clear)?;
        set_event(&*self.free, EventState::Signaled, WRITE_GATE)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut GateState) -> R) -> Result<R> {
        let guard = self
            .lock
            .lock()
            .map_err(|e| StoreError::primitive(WRITE_GATE, e))?;
        let state = unsafe { &mut *(*guard as *mut GateState) };
        Ok(f(state))
    }

    /// Takes the token. A token whose owner process is gone is taken over
    /// in one step, so nobody else can grab it before the dead owner's
    /// progress is undone.
    pub fn acquire(&self, timeout: Duration) -> Result<GateEntry> {
        let deadline = Instant::now() + timeout;
        let pid = process::id();
        loop {
            let entry = self.with_state(|state| {
                if state.held == 0 {
                    take(state, pid);
                    return Some(GateEntry::Free);
                }
                if state.owner_pid != pid && !process_alive(state.owner_pid) {
                    let inherited = GateEntry::Inherited {
                        owner_pid: state.owner_pid,
                        announced: state.announced != 0,
                        drained: state.drained,
                    };
                    take(state, pid);
                    return Some(inherited);
                }
                None
            })?;
            if let Some(entry) = entry {
                set_event(&*self.free, EventState::Clear, WRITE_GATE)?;
                return Ok(entry);
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout {
                    primitive: WRITE_GATE,
                    waited: timeout,
                });
            }
            // Sliced, so a dead owner is noticed even though nobody signals.
            wait_slice(&*self.free, deadline, WRITE_GATE);
        }
    }

    /// Records how far the holder got in announcing itself and draining
    /// read slots.
    pub fn record_progress(&self, announced: bool, drained: u32) -> Result<()> {
        self.with_state(|state| {
            state.announced = announced as u32;
            state.drained = drained;
        })
    }

    pub fn release(&self) -> Result<()> {
        let was_held = self.with_state(|state| {
            let was_held = state.held != 0;
            clear(state);
            was_held
        })?;
        set_event(&*self.free, EventState::Signaled, WRITE_GATE)?;
        if !was_held {
            return Err(StoreError::primitive(WRITE_GATE, "released while not held"));
        }
        Ok(())
    }

    pub fn owner(&self) -> Result<Option<u32>> {
        self.with_state(|state| (state.held != 0).then_some(state.owner_pid))
    }

    #[cfg(test)]
    pub(crate) fn force_owner(&self, pid: u32, announced: bool, drained: u32) -> Result<()> {
        self.with_state(|state| {
            take(state, pid);
            state.announced = announced as u32;
            state.drained = drained;
        })?;
        set_event(&*self.free, EventState::Clear, WRITE_GATE)
    }
}

/// Bounded counting resource. The `free` event is signaled exactly while
/// `available > 0`; both change only under `lock`.
pub struct ReadSlots {
    lock: Box<dyn LockImpl>,
    free: Box<dyn EventImpl>,
}

impl ReadSlots {
    pub(super) fn new(lock: Box<dyn LockImpl>, free: Box<dyn EventImpl>) -> ReadSlots {
        ReadSlots { lock, free }
    }

    pub(super) fn init(&self, bound: u32) -> Result<()> {
        self.with_state(|state| {
            state.available = bound;
            state.bound = bound;
            Ok(())
        })?;
        set_event(&*self.free, EventState::Signaled, READ_SLOTS)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SlotState) -> Result<R>) -> Result<R> {
        let guard = self
            .lock
            .lock()
            .map_err(|e| StoreError::primitive(READ_SLOTS, e))?;
        let state = unsafe { &mut *(*guard as *mut SlotState) };
        f(state)
    }

    fn try_take(&self) -> Result<bool> {
        self.with_state(|state| {
            if state.available == 0 {
                return Ok(false);
            }
            state.available -= 1;
            if state.available == 0 {
                set_event(&*self.free, EventState::Clear, READ_SLOTS)?;
            }
            Ok(true)
        })
    }

    /// Takes one unit, waiting at most `timeout`.
    pub fn acquire(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_take()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout {
                    primitive: READ_SLOTS,
                    waited: timeout,
                });
            }
            wait_slice(&*self.free, deadline, READ_SLOTS);
        }
    }

    pub fn release(&self, units: u32) -> Result<()> {
        self.with_state(|state| {
            if state.available + units > state.bound {
                return Err(StoreError::primitive(
                    READ_SLOTS,
                    format!(
                        "releasing {} units would exceed the bound of {} ({} available)",
                        units, state.bound, state.available
                    ),
                ));
            }
            state.available += units;
            set_event(&*self.free, EventState::Signaled, READ_SLOTS)
        })
    }

    pub fn available(&self) -> Result<u32> {
        self.with_state(|state| Ok(state.available))
    }

    pub fn bound(&self) -> Result<u32> {
        self.with_state(|state| Ok(state.bound))
    }
}

/// Broadcast flag; signaled means no writer is active or waiting.
pub struct WriterFlag {
    event: Box<dyn EventImpl>,
}

impl WriterFlag {
    pub(super) fn new(event: Box<dyn EventImpl>) -> WriterFlag {
        WriterFlag { event }
    }

    pub fn mark_writing(&self) -> Result<()> {
        set_event(&*self.event, EventState::Clear, WRITER_FLAG)
    }

    pub fn mark_idle(&self) -> Result<()> {
        set_event(&*self.event, EventState::Signaled, WRITER_FLAG)
    }

    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if wait_slice(&*self.event, deadline, WRITER_FLAG) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout {
                    primitive: WRITER_FLAG,
                    waited: timeout,
                });
            }
        }
    }
}
