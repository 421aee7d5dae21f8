//! Submission/completion queue objects and the table that owns them.
//!
//! A queue goes `Prepared -> Created` and leaves the table when released.
//! Admin queues (id 0) skip `Prepared`. I/O queues are promoted when the
//! completion of their create command is reaped.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::chain::{DescriptorChain, Release};
use crate::command::{CommandBytes, COMMAND_SIZE, COMPLETION_STATUS_OFFSET};
use crate::dma::{DmaBlock, DmaPool};
use crate::error::{Error, Object, Result};
use crate::platform::MemoryBus;
use crate::tracker::CommandTracker;

pub const ADMIN_QID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Submission,
    Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Host memory is reserved; the controller has not been told yet.
    Prepared,
    Created,
}

/// Where a ring lives.
#[derive(Debug)]
pub(crate) enum RingStorage {
    Contiguous(DmaBlock),
    /// Pinned user pages handed over by the create-queue command.
    Chain(DescriptorChain),
    /// Non-contiguous ring whose create command has not been submitted yet.
    Unbacked,
}

impl RingStorage {
    fn phys_at(&self, offset: usize) -> Result<u64> {
        match self {
            RingStorage::Contiguous(block) if offset < block.len() => {
                Ok(block.paddr() + offset as u64)
            }
            RingStorage::Contiguous(_) => Err(Error::invalid("ring offset past contiguous buffer")),
            RingStorage::Chain(chain) => chain
                .phys_at(offset)
                .ok_or_else(|| Error::invalid("ring offset past pinned buffer")),
            RingStorage::Unbacked => Err(Error::invalid(
                "non-contiguous ring has no storage until its create command is submitted",
            )),
        }
    }

    pub(crate) fn base(&self) -> Option<u64> {
        match self {
            RingStorage::Contiguous(block) => Some(block.paddr()),
            _ => None,
        }
    }

    fn zero(&self, bus: &dyn MemoryBus, len: usize, page_size: usize) -> Result<()> {
        match self {
            RingStorage::Contiguous(block) => block.zero(),
            RingStorage::Chain(_) => {
                let mut offset = 0;
                while offset < len {
                    let n = (page_size - offset % page_size).min(len - offset);
                    bus.fill_zero(self.phys_at(offset)?, n)?;
                    offset += n;
                }
                Ok(())
            }
            RingStorage::Unbacked => Ok(()),
        }
    }

    fn release(&mut self) {
        if let RingStorage::Chain(chain) = self {
            chain.release();
        }
        *self = RingStorage::Unbacked;
    }
}

pub(crate) fn allocate_ring(
    rings: &DmaPool,
    elements: u32,
    entry_shift: u8,
    page_size: usize,
) -> Result<RingStorage> {
    let bytes = (elements as usize) << entry_shift;
    let block = rings.alloc_len(bytes.div_ceil(page_size) * page_size)?;
    Ok(RingStorage::Contiguous(block))
}

#[derive(Debug)]
pub struct SubmissionQueue {
    pub(crate) id: u16,
    pub(crate) cq_id: u16,
    pub(crate) elements: u32,
    pub(crate) entry_shift: u8,
    pub(crate) contiguous: bool,
    pub(crate) state: QueueState,
    pub(crate) storage: RingStorage,
    pub(crate) doorbell: u64,
    /// Controller's consumer index as last reported by a completion.
    pub(crate) head: u32,
    /// Next free slot.
    pub(crate) tail_virt: u32,
    /// Tail last written to the doorbell.
    pub(crate) tail_hw: u32,
    pub(crate) tracker: CommandTracker,
}

impl SubmissionQueue {
    pub(crate) fn new(
        id: u16,
        cq_id: u16,
        elements: u32,
        entry_shift: u8,
        contiguous: bool,
        storage: RingStorage,
        doorbell: u64,
    ) -> Self {
        Self {
            id,
            cq_id,
            elements,
            entry_shift,
            contiguous,
            state: QueueState::Prepared,
            storage,
            doorbell,
            head: 0,
            tail_virt: 0,
            tail_hw: 0,
            tracker: CommandTracker::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_full(&self) -> bool {
        (self.tail_virt + 1) % self.elements == self.head
    }

    /// Slots written but not yet consumed by the controller.
    pub fn occupied(&self) -> u32 {
        (self.tail_virt + self.elements - self.head) % self.elements
    }

    pub(crate) fn ring_bytes(&self) -> usize {
        (self.elements as usize) << self.entry_shift
    }

    /// Copy `cmd` into the slot at the visible tail and advance it.
    pub(crate) fn push(&mut self, bus: &dyn MemoryBus, cmd: &CommandBytes) -> Result<()> {
        if self.is_full() {
            return Err(Error::QueueFull { sqid: self.id });
        }
        let entry_size = 1usize << self.entry_shift;
        let offset = (self.tail_virt as usize) << self.entry_shift;
        let paddr = self.storage.phys_at(offset)?;
        bus.write_physical(paddr, &cmd.0)?;
        if entry_size > COMMAND_SIZE {
            bus.fill_zero(paddr + COMMAND_SIZE as u64, entry_size - COMMAND_SIZE)?;
        }
        self.tail_virt = (self.tail_virt + 1) % self.elements;
        Ok(())
    }

    pub fn info(&self) -> SqInfo {
        SqInfo {
            id: self.id,
            cq_id: self.cq_id,
            elements: self.elements,
            head: self.head,
            tail_virt: self.tail_virt,
            tail_hw: self.tail_hw,
            contiguous: self.contiguous,
            state: self.state,
            outstanding: self.tracker.len(),
            full: self.is_full(),
        }
    }
}

#[derive(Debug)]
pub struct CompletionQueue {
    pub(crate) id: u16,
    pub(crate) elements: u32,
    pub(crate) entry_shift: u8,
    pub(crate) contiguous: bool,
    pub(crate) state: QueueState,
    pub(crate) storage: RingStorage,
    pub(crate) doorbell: u64,
    pub(crate) head: u32,
    /// Boundary found by the last inquiry; not committed to hardware.
    pub(crate) tail: u32,
    pub(crate) phase: bool,
    /// Interrupt line, present when the queue was created with interrupts
    /// enabled.
    pub(crate) irq: Option<u16>,
}

impl CompletionQueue {
    pub(crate) fn new(
        id: u16,
        elements: u32,
        entry_shift: u8,
        contiguous: bool,
        storage: RingStorage,
        doorbell: u64,
        irq: Option<u16>,
    ) -> Self {
        Self {
            id,
            elements,
            entry_shift,
            contiguous,
            state: QueueState::Prepared,
            storage,
            doorbell,
            head: 0,
            tail: 0,
            phase: true,
            irq,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn entry_size(&self) -> usize {
        1 << self.entry_shift
    }

    pub(crate) fn ring_bytes(&self) -> usize {
        (self.elements as usize) << self.entry_shift
    }

    pub(crate) fn read_status(&self, bus: &dyn MemoryBus, index: u32) -> Result<u16> {
        let offset = (index as usize) << self.entry_shift;
        let paddr = self.storage.phys_at(offset)?;
        Ok(bus.read_u16(paddr + COMPLETION_STATUS_OFFSET)?)
    }

    pub(crate) fn read_entry(&self, bus: &dyn MemoryBus, index: u32, out: &mut [u8]) -> Result<()> {
        let offset = (index as usize) << self.entry_shift;
        let paddr = self.storage.phys_at(offset)?;
        bus.read_physical(paddr, out)?;
        Ok(())
    }

    pub fn info(&self) -> CqInfo {
        CqInfo {
            id: self.id,
            elements: self.elements,
            head: self.head,
            tail: self.tail,
            phase: self.phase,
            irq_enabled: self.irq.is_some(),
            irq_line: self.irq,
            contiguous: self.contiguous,
            state: self.state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqInfo {
    pub id: u16,
    pub cq_id: u16,
    pub elements: u32,
    pub head: u32,
    pub tail_virt: u32,
    pub tail_hw: u32,
    pub contiguous: bool,
    pub state: QueueState,
    pub outstanding: usize,
    pub full: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqInfo {
    pub id: u16,
    pub elements: u32,
    pub head: u32,
    pub tail: u32,
    pub phase: bool,
    pub irq_enabled: bool,
    pub irq_line: Option<u16>,
    pub contiguous: bool,
    pub state: QueueState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    /// Release every queue, admin included.
    Full,
    /// Release I/O queues and reset the admin pair to an empty ring.
    KeepAdmin,
}

/// Every queue of one device, keyed by id.
#[derive(Debug, Default)]
pub struct QueueTable {
    pub(crate) sqs: BTreeMap<u16, SubmissionQueue>,
    pub(crate) cqs: BTreeMap<u16, CompletionQueue>,
}

impl QueueTable {
    pub fn sq(&self, id: u16) -> Result<&SubmissionQueue> {
        self.sqs
            .get(&id)
            .ok_or_else(|| Error::not_found(Object::SubmissionQueue, id))
    }

    pub fn sq_mut(&mut self, id: u16) -> Result<&mut SubmissionQueue> {
        self.sqs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(Object::SubmissionQueue, id))
    }

    pub fn cq(&self, id: u16) -> Result<&CompletionQueue> {
        self.cqs
            .get(&id)
            .ok_or_else(|| Error::not_found(Object::CompletionQueue, id))
    }

    pub fn cq_mut(&mut self, id: u16) -> Result<&mut CompletionQueue> {
        self.cqs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(Object::CompletionQueue, id))
    }

    pub(crate) fn ensure_free(&self, kind: QueueKind, id: u16) -> Result<()> {
        let taken = match kind {
            QueueKind::Submission => self.sqs.contains_key(&id),
            QueueKind::Completion => self.cqs.contains_key(&id),
        };
        if taken {
            let object = match kind {
                QueueKind::Submission => Object::SubmissionQueue,
                QueueKind::Completion => Object::CompletionQueue,
            };
            return Err(Error::exists(object, id));
        }
        Ok(())
    }

    pub(crate) fn insert_sq(&mut self, sq: SubmissionQueue) {
        debug!(sqid = sq.id, cqid = sq.cq_id, elements = sq.elements, state = ?sq.state, "submission queue prepared");
        self.sqs.insert(sq.id, sq);
    }

    pub(crate) fn insert_cq(&mut self, cq: CompletionQueue) {
        debug!(cqid = cq.id, elements = cq.elements, irq = ?cq.irq, state = ?cq.state, "completion queue prepared");
        self.cqs.insert(cq.id, cq);
    }

    /// Drop a submission queue, its ring and every command still in flight.
    pub fn release_sq(&mut self, id: u16) -> Release {
        match self.sqs.remove(&id) {
            Some(mut sq) => {
                let dropped = sq.tracker.clear();
                sq.storage.release();
                debug!(sqid = id, dropped_commands = dropped, "submission queue released");
                Release::Released
            }
            None => {
                warn!(sqid = id, "submission queue already gone");
                Release::AlreadyGone
            }
        }
    }

    /// Drop a completion queue. Returns the interrupt line it was bound to.
    pub fn release_cq(&mut self, id: u16) -> (Release, Option<u16>) {
        match self.cqs.remove(&id) {
            Some(mut cq) => {
                cq.storage.release();
                debug!(cqid = id, "completion queue released");
                (Release::Released, cq.irq)
            }
            None => {
                warn!(cqid = id, "completion queue already gone");
                (Release::AlreadyGone, None)
            }
        }
    }

    /// Returns `(cq id, bound line)` for each completion queue released.
    pub(crate) fn teardown(
        &mut self,
        mode: TeardownMode,
        bus: &dyn MemoryBus,
        page_size: usize,
    ) -> Result<Vec<(u16, Option<u16>)>> {
        let keep_admin = mode == TeardownMode::KeepAdmin;
        let sq_ids: Vec<u16> = self
            .sqs
            .keys()
            .copied()
            .filter(|&id| !(keep_admin && id == ADMIN_QID))
            .collect();
        for id in sq_ids {
            self.release_sq(id);
        }
        let cq_ids: Vec<u16> = self
            .cqs
            .keys()
            .copied()
            .filter(|&id| !(keep_admin && id == ADMIN_QID))
            .collect();
        let mut released = Vec::with_capacity(cq_ids.len());
        for id in cq_ids {
            let (_, line) = self.release_cq(id);
            released.push((id, line));
        }

        if keep_admin {
            if let Some(sq) = self.sqs.get_mut(&ADMIN_QID) {
                sq.tracker.reset();
                sq.head = 0;
                sq.tail_virt = 0;
                sq.tail_hw = 0;
                sq.storage.zero(bus, sq.ring_bytes(), page_size)?;
            }
            if let Some(cq) = self.cqs.get_mut(&ADMIN_QID) {
                cq.head = 0;
                cq.tail = 0;
                cq.phase = true;
                cq.storage.zero(bus, cq.ring_bytes(), page_size)?;
            }
        }
        debug!(mode = ?mode, released_cqs = released.len(), "queues torn down");
        Ok(released)
    }
}
