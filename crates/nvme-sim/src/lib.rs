//! In-process NVMe controller and host platform for exercising the harness.
//!
//! [`SimPlatform`] implements every host trait the harness needs:
//! - sparse physical memory and coherent DMA allocation
//! - a test program address space whose pages land on scattered frames
//! - the controller's BAR0 registers and doorbells
//! - pin, MSI and MSI-X interrupt delivery with masks and pending bits
//!
//! The controller processes a submission queue synchronously when its
//! doorbell is written. Interrupt handlers are always invoked after the
//! platform's internal lock is released, so a handler may call back into the
//! platform (for example to mask its line).
//!
//! Fault knobs let tests make pinning or allocation fail, corrupt the next
//! completion, keep CSTS.RDY from rising, fail the next admin command or
//! fault a completion-entry read.

mod controller;
mod interrupts;
mod memory;

use std::sync::{Arc, Mutex, MutexGuard};

use nvme_harness::command::COMMAND_SIZE;
use nvme_harness::platform::{
    DmaMemory, InterruptController, IrqHandler, IrqReturn, MemoryBus, RegisterBus, UserMemory,
};
use nvme_harness::{InterruptScheme, PlatformError};
use tracing::trace;

pub use controller::{Corruption, SECTOR_SIZE};
pub use interrupts::InterruptCaps;
pub use memory::PAGE_SIZE;

use controller::Controller;
use interrupts::Interrupts;
use memory::Memory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// CAP.MQES + 1.
    pub max_queue_entries: u32,
    /// CAP.CQR.
    pub contiguous_required: bool,
    /// CAP.TO, in 500 ms units.
    pub timeout_units: u8,
    /// CAP.DSTRD.
    pub doorbell_stride: u8,
    /// CAP.NSSRS.
    pub subsystem_reset: bool,
    /// Size of namespace 1 in 512-byte blocks.
    pub namespace_blocks: u64,
    pub interrupts: InterruptCaps,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_queue_entries: 1024,
            contiguous_required: false,
            timeout_units: 1,
            doorbell_stride: 0,
            subsystem_reset: true,
            namespace_blocks: 2048,
            interrupts: InterruptCaps::default(),
        }
    }
}

struct SimState {
    memory: Memory,
    controller: Controller,
    interrupts: Interrupts,
    /// The next harness read of a whole entry at this address faults.
    fail_read_at: Option<u64>,
}

pub struct SimPlatform {
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimPlatform")
            .field("pinned_pages", &state.memory.pinned_pages())
            .field("coherent_regions", &state.memory.coherent_regions())
            .finish()
    }
}

impl SimPlatform {
    pub fn new(config: SimConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState {
                memory: Memory::new(),
                controller: Controller::new(&config),
                interrupts: Interrupts::new(config.interrupts),
                fail_read_at: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run handlers for `vectors`. Must be called without the state lock.
    fn deliver(&self, vectors: Vec<u32>) {
        for vector in vectors {
            let handler = {
                let mut state = self.lock();
                state.interrupts.record_delivery(vector);
                state.interrupts.handler(vector)
            };
            trace!(vector, "delivering interrupt");
            if let Some(handler) = handler {
                handler.handle(vector);
            }
        }
    }

    /// Map `len` bytes of zeroed memory into the test program's address
    /// space. The returned address is page aligned.
    pub fn map_user(&self, len: usize) -> u64 {
        self.lock().memory.map_user(len)
    }

    pub fn write_user(&self, uaddr: u64, data: &[u8]) -> Result<(), PlatformError> {
        self.lock().memory.copy_to_user(uaddr, data)
    }

    pub fn read_user(&self, uaddr: u64, len: usize) -> Result<Vec<u8>, PlatformError> {
        let mut buf = vec![0u8; len];
        self.lock().memory.copy_from_user(uaddr, &mut buf)?;
        Ok(buf)
    }

    /// Pins currently held, summed over frames.
    pub fn pinned_pages(&self) -> usize {
        self.lock().memory.pinned_pages()
    }

    /// Frames released with the dirty flag, over the platform's lifetime.
    pub fn dirty_unpins(&self) -> usize {
        self.lock().memory.dirty_unpins
    }

    pub fn coherent_regions(&self) -> usize {
        self.lock().memory.coherent_regions()
    }

    pub fn fail_next_pin(&self) {
        self.lock().memory.fail_next_pin = true;
    }

    pub fn fail_coherent_allocs(&self, fail: bool) {
        self.lock().memory.fail_coherent = fail;
    }

    /// Keep CSTS.RDY clear on the next enable.
    pub fn stick_ready(&self, stuck: bool) {
        self.lock().controller.faults.stuck_ready = stuck;
    }

    /// Complete the next admin command with this status, without executing
    /// it.
    pub fn fail_next_admin(&self, sct: u8, sc: u8) {
        self.lock().controller.faults.fail_next_admin = Some((sct, sc));
    }

    /// Complete the next delete of queue 0 successfully instead of refusing
    /// it.
    pub fn acknowledge_next_admin_delete(&self) {
        self.lock().controller.faults.ack_admin_delete = true;
    }

    /// Fail the next full read of slot `index` in completion queue `cqid`.
    /// Phase-tag reads of the slot still succeed. Returns false if the
    /// controller does not know the queue.
    pub fn fail_entry_read(&self, cqid: u16, index: u32) -> bool {
        let mut state = self.lock();
        match state.controller.cq_slot(cqid, index) {
            Some(addr) => {
                state.fail_read_at = Some(addr);
                true
            }
            None => false,
        }
    }

    pub fn corrupt_next_completion(&self, corruption: Corruption) {
        self.lock().controller.faults.corrupt_next = Some(corruption);
    }

    /// Mark every slot of `cqid` as a new completion. Returns false if the
    /// controller does not know the queue.
    pub fn flood_completion_queue(&self, cqid: u16) -> Result<bool, PlatformError> {
        let mut state = self.lock();
        let SimState {
            memory, controller, ..
        } = &mut *state;
        controller.flood(cqid, memory)
    }

    pub fn namespace_read(&self, lba: u64, blocks: usize) -> Vec<u8> {
        let state = self.lock();
        let start = lba as usize * SECTOR_SIZE;
        state.controller.namespace()[start..start + blocks * SECTOR_SIZE].to_vec()
    }

    pub fn namespace_write(&self, lba: u64, data: &[u8]) {
        let mut state = self.lock();
        let start = lba as usize * SECTOR_SIZE;
        state.controller.namespace_mut()[start..start + data.len()].copy_from_slice(data);
    }

    /// Every command the controller fetched, in order.
    pub fn command_log(&self) -> Vec<[u8; COMMAND_SIZE]> {
        self.lock().controller.log.clone()
    }

    /// Invoke the handler registered for `vector` as if the interrupt had
    /// arrived, regardless of masks.
    pub fn fire_vector(&self, vector: u32) -> IrqReturn {
        let handler = {
            let mut state = self.lock();
            state.interrupts.record_delivery(vector);
            state.interrupts.handler(vector)
        };
        match handler {
            Some(handler) => handler.handle(vector),
            None => IrqReturn::None,
        }
    }

    /// Signal `line` from the device side, honouring masks.
    pub fn raise_line(&self, line: u16) {
        let vector = self.lock().interrupts.raise(line);
        self.deliver(vector.into_iter().collect());
    }

    pub fn vector_of(&self, line: u16) -> Option<u32> {
        self.lock().interrupts.vector(line)
    }

    pub fn deliveries(&self, vector: u32) -> u64 {
        self.lock().interrupts.deliveries(vector)
    }

    pub fn line_masked(&self, line: u16) -> bool {
        self.lock().interrupts.is_masked(line)
    }

    /// MSI-X entries whose pending bit is set when interrupts are next
    /// enabled.
    pub fn set_stale_msix_pending(&self, entries: &[u16]) {
        self.lock().interrupts.stale_pending = entries.to_vec();
    }
}

impl MemoryBus for SimPlatform {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), PlatformError> {
        let mut state = self.lock();
        if buf.len() > 2 && state.fail_read_at == Some(paddr) {
            state.fail_read_at = None;
            return Err(PlatformError::Fault {
                addr: paddr,
                len: buf.len(),
            });
        }
        state.memory.read(paddr, buf)
    }

    fn write_physical(&self, paddr: u64, buf: &[u8]) -> Result<(), PlatformError> {
        self.lock().memory.write(paddr, buf)
    }
}

impl UserMemory for SimPlatform {
    fn copy_from_user(&self, uaddr: u64, buf: &mut [u8]) -> Result<(), PlatformError> {
        self.lock().memory.copy_from_user(uaddr, buf)
    }

    fn copy_to_user(&self, uaddr: u64, buf: &[u8]) -> Result<(), PlatformError> {
        self.lock().memory.copy_to_user(uaddr, buf)
    }

    fn pin_user_pages(&self, uaddr: u64, count: usize) -> Result<Vec<u64>, PlatformError> {
        self.lock().memory.pin(uaddr, count)
    }

    fn unpin_user_pages(&self, frames: &[u64], dirty: bool) {
        self.lock().memory.unpin(frames, dirty);
    }
}

impl DmaMemory for SimPlatform {
    fn alloc_coherent(&self, len: usize) -> Result<u64, PlatformError> {
        self.lock().memory.alloc_coherent(len)
    }

    fn free_coherent(&self, paddr: u64, _len: usize) {
        self.lock().memory.free_coherent(paddr);
    }
}

impl RegisterBus for SimPlatform {
    fn read32(&self, offset: u64) -> u32 {
        let state = self.lock();
        state.controller.mmio_read(offset, &state.interrupts) as u32
    }

    fn write32(&self, offset: u64, value: u32) {
        let vectors = {
            let mut state = self.lock();
            let SimState {
                memory,
                controller,
                interrupts,
            } = &mut *state;
            controller.mmio_write(offset, u64::from(value), memory, interrupts)
        };
        self.deliver(vectors);
    }

    fn read64(&self, offset: u64) -> u64 {
        let state = self.lock();
        state.controller.mmio_read(offset, &state.interrupts)
    }

    fn write64(&self, offset: u64, value: u64) {
        let vectors = {
            let mut state = self.lock();
            let SimState {
                memory,
                controller,
                interrupts,
            } = &mut *state;
            controller.mmio_write(offset, value, memory, interrupts)
        };
        self.deliver(vectors);
    }
}

impl InterruptController for SimPlatform {
    fn max_lines(&self, scheme: InterruptScheme) -> u16 {
        self.lock().interrupts.max_lines(scheme)
    }

    fn enable_interrupts(
        &self,
        scheme: InterruptScheme,
        count: u16,
    ) -> Result<Vec<u32>, PlatformError> {
        self.lock().interrupts.enable(scheme, count)
    }

    fn disable_interrupts(&self, _scheme: InterruptScheme) {
        self.lock().interrupts.disable();
    }

    fn request_irq(&self, vector: u32, handler: Arc<dyn IrqHandler>) -> Result<(), PlatformError> {
        self.lock().interrupts.request(vector, handler)
    }

    fn free_irq(&self, vector: u32) {
        self.lock().interrupts.free(vector);
    }

    fn set_msix_mask(&self, entry: u16, masked: bool) {
        let vectors = self.lock().interrupts.set_msix_mask(entry, masked);
        self.deliver(vectors);
    }

    fn msix_pending(&self, entry: u16) -> bool {
        self.lock().interrupts.msix_pending(entry)
    }
}
