//! Named shared-memory segment holding the primitives of one lock name.
//!
//! Layout (offsets are 64-byte aligned, sizes come from raw_sync):
//!
//! ```text
//! | header | gate mutex | gate state | gate-free event | writer flag event |
//! | slots mutex | slots state | slots-free event |
//! ```
//!
//! The first process to create the segment initializes every primitive and
//! then publishes `SEGMENT_MAGIC` in the header; everybody else attaches
//! once the magic is visible.

mod primitives;

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use raw_sync::events::{Event, EventInit};
use raw_sync::locks::{LockInit, Mutex};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, trace};

use crate::config::LockConfig;
use crate::errors::{Result, StoreError};

pub use primitives::{
    GateEntry, ReadSlots, WriteGate, WriterFlag, READ_SLOTS, WRITER_FLAG, WRITE_GATE,
};

pub const SEGMENT: &str = "primitive segment";

const SEGMENT_MAGIC: u32 = 0x5359_4e43;
const ALIGN: usize = 64;
const ATTACH_RETRY: Duration = Duration::from_millis(1);
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[repr(C)]
struct Header {
    ready: AtomicU32,
    reader_bound: u32,
}

/// Token plus the owner's acquisition progress, so whoever inherits an
/// abandoned token knows what to give back.
#[repr(C)]
struct GateState {
    held: u32,
    owner_pid: u32,
    announced: u32,
    drained: u32,
}

#[repr(C)]
struct SlotState {
    available: u32,
    bound: u32,
}

#[inline]
fn align(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

#[inline]
fn bump(offset: &mut usize, len: usize) -> usize {
    let at = *offset;
    *offset += align(len);
    at
}

struct Layout {
    gate_lock: usize,
    gate_state: usize,
    gate_free: usize,
    writer_flag: usize,
    slots_lock: usize,
    slots_state: usize,
    slots_free: usize,
    size: usize,
}

impl Layout {
    fn new() -> Layout {
        let lock = Mutex::size_of(None);
        let event = Event::size_of(None);
        let mut offset = align(mem::size_of::<Header>());
        let gate_lock = bump(&mut offset, lock);
        let gate_state = bump(&mut offset, mem::size_of::<GateState>());
        let gate_free = bump(&mut offset, event);
        let writer_flag = bump(&mut offset, event);
        let slots_lock = bump(&mut offset, lock);
        let slots_state = bump(&mut offset, mem::size_of::<SlotState>());
        let slots_free = bump(&mut offset, event);
        Layout {
            gate_lock,
            gate_state,
            gate_free,
            writer_flag,
            slots_lock,
            slots_state,
            slots_free,
            size: offset,
        }
    }
}

pub struct Segment {
    pub gate: WriteGate,
    pub slots: ReadSlots,
    pub writer_flag: WriterFlag,
    created: bool,
    // Dropped after the primitives that point into it.
    shmem: Box<Shmem>,
}

impl Segment {
    /// Creates the named segment, or attaches to it when another instance
    /// already did.
    pub fn open(cfg: &LockConfig) -> Result<Segment> {
        let layout = Layout::new();
        let os_id = cfg.os_id();
        let timeout = cfg.timeout();
        let deadline = Instant::now() + timeout;
        loop {
            match ShmemConf::new().size(layout.size).os_id(&os_id).create() {
                Ok(mut shmem) => {
                    shmem.set_owner(!cfg.persist_primitives);
                    debug!(os_id = %os_id, size = layout.size, "created primitive segment");
                    return unsafe { Segment::initialize(Box::new(shmem), &layout, cfg.reader_bound) };
                }
                Err(ShmemError::MappingIdExists) => match ShmemConf::new().os_id(&os_id).open() {
                    Ok(shmem) if shmem.len() >= layout.size => {
                        trace!(os_id = %os_id, "attaching to primitive segment");
                        return unsafe {
                            Segment::attach(Box::new(shmem), &layout, cfg.reader_bound, deadline, timeout)
                        };
                    }
                    Ok(shmem) => trace!(os_id = %os_id, len = shmem.len(), "segment not sized yet"),
                    Err(e) => trace!(os_id = %os_id, error = %e, "segment not attachable yet"),
                },
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout {
                    primitive: SEGMENT,
                    waited: timeout,
                });
            }
            thread::sleep(ATTACH_RETRY);
        }
    }

    unsafe fn initialize(shmem: Box<Shmem>, layout: &Layout, reader_bound: u32) -> Result<Segment> {
        let base = shmem.as_ptr();
        let (gate_lock, _) = Mutex::new(base.add(layout.gate_lock), base.add(layout.gate_state))
            .map_err(|e| StoreError::primitive(WRITE_GATE, e))?;
        let (gate_free, _) = Event::new(base.add(layout.gate_free), false)
            .map_err(|e| StoreError::primitive(WRITE_GATE, e))?;
        let (writer_flag, _) = Event::new(base.add(layout.writer_flag), false)
            .map_err(|e| StoreError::primitive(WRITER_FLAG, e))?;
        let (slots_lock, _) = Mutex::new(base.add(layout.slots_lock), base.add(layout.slots_state))
            .map_err(|e| StoreError::primitive(READ_SLOTS, e))?;
        let (slots_free, _) = Event::new(base.add(layout.slots_free), false)
            .map_err(|e| StoreError::primitive(READ_SLOTS, e))?;

        let segment = Segment {
            gate: WriteGate::new(gate_lock, gate_free),
            slots: ReadSlots::new(slots_lock, slots_free),
            writer_flag: WriterFlag::new(writer_flag),
            created: true,
            shmem,
        };
        segment.gate.init()?;
        segment.slots.init(reader_bound)?;
        segment.writer_flag.mark_idle()?;

        let header = base as *mut Header;
        ptr::addr_of_mut!((*header).reader_bound).write(reader_bound);
        (*header).ready.store(SEGMENT_MAGIC, Ordering::Release);
        Ok(segment)
    }

    unsafe fn attach(
        shmem: Box<Shmem>,
        layout: &Layout,
        reader_bound: u32,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Segment> {
        let base = shmem.as_ptr();
        let header = &*(base as *const Header);
        while header.ready.load(Ordering::Acquire) != SEGMENT_MAGIC {
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout {
                    primitive: SEGMENT,
                    waited: timeout,
                });
            }
            thread::sleep(ATTACH_RETRY);
        }
        if header.reader_bound != reader_bound {
            return Err(StoreError::Config(format!(
                "segment {} was created with reader bound {}, configured {}",
                shmem.get_os_id(),
                header.reader_bound,
                reader_bound
            )));
        }

        let (gate_lock, _) = Mutex::from_existing(base.add(layout.gate_lock), base.add(layout.gate_state))
            .map_err(|e| StoreError::primitive(WRITE_GATE, e))?;
        let (gate_free, _) = Event::from_existing(base.add(layout.gate_free))
            .map_err(|e| StoreError::primitive(WRITE_GATE, e))?;
        let (writer_flag, _) = Event::from_existing(base.add(layout.writer_flag))
            .map_err(|e| StoreError::primitive(WRITER_FLAG, e))?;
        let (slots_lock, _) = Mutex::from_existing(base.add(layout.slots_lock), base.add(layout.slots_state))
            .map_err(|e| StoreError::primitive(READ_SLOTS, e))?;
        let (slots_free, _) = Event::from_existing(base.add(layout.slots_free))
            .map_err(|e| StoreError::primitive(READ_SLOTS, e))?;

        Ok(Segment {
            gate: WriteGate::new(gate_lock, gate_free),
            slots: ReadSlots::new(slots_lock, slots_free),
            writer_flag: WriterFlag::new(writer_flag),
            created: false,
            shmem,
        })
    }

    /// True when this instance created (and initialized) the segment.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }
}

/// Removes the named segment. Instances still attached keep working on
/// their mapping, but new instances will create a fresh segment.
pub fn unlink(cfg: &LockConfig) -> Result<bool> {
    match ShmemConf::new().os_id(cfg.os_id()).open() {
        Ok(mut shmem) => {
            shmem.set_owner(true);
            debug!(os_id = %shmem.get_os_id(), "unlinking primitive segment");
            Ok(true)
        }
        Err(e) => {
            debug!(os_id = %cfg.os_id(), error = %e, "no primitive segment to unlink");
            Ok(false)
        }
    }
}
