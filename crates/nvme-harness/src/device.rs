//! One harness device session.
//!
//! Every control operation takes the device lock for its whole duration, so
//! operations on one device are serialized. Interrupt top halves and the
//! bottom-half worker never take it.

use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::chain::{
    BitBucket, ChainBuilder, ChainKind, ChainRequest, DescriptorChain, Framing, Release,
    UserBuffer,
};
use crate::command::{admin, CommandBytes, DataDirection, DescriptorCaps};
use crate::config::HarnessConfig;
use crate::dma::DmaPools;
use crate::error::{Error, Result};
use crate::irq::{InterruptEngine, InterruptScheme, LineInfo};
use crate::meta::MetadataStore;
use crate::platform::SharedPlatform;
use crate::queue::{
    allocate_ring, CompletionQueue, CqInfo, QueueKind, QueueState, QueueTable, RingStorage,
    SqInfo, SubmissionQueue, TeardownMode, ADMIN_QID,
};
use crate::reap::ReapOutcome;
use crate::regs::{self, Capabilities, Csts};
use crate::tracker::TrackedCommand;

const ADMIN_SQ_SHIFT: u8 = 6;
const ADMIN_CQ_SHIFT: u8 = 4;

/// Host-side reservation for an I/O submission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareSq {
    pub id: u16,
    pub cq_id: u16,
    pub elements: u32,
    pub contiguous: bool,
}

/// Host-side reservation for an I/O completion queue. `irq` names the line
/// the queue is bound to when interrupts are enabled for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareCq {
    pub id: u16,
    pub elements: u32,
    pub contiguous: bool,
    pub irq: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub sqid: u16,
    pub command: CommandBytes,
    pub data: Option<UserBuffer>,
    pub direction: DataDirection,
    pub caps: DescriptorCaps,
    pub meta_id: Option<u32>,
    pub bit_buckets: Vec<BitBucket>,
}

impl SubmitRequest {
    pub fn new(sqid: u16, command: CommandBytes) -> Self {
        Self {
            sqid,
            command,
            data: None,
            direction: DataDirection::None,
            caps: DescriptorCaps::empty(),
            meta_id: None,
            bit_buckets: Vec::new(),
        }
    }

    pub fn with_data(mut self, buffer: UserBuffer, direction: DataDirection) -> Self {
        self.data = Some(buffer);
        self.direction = direction;
        self
    }

    pub fn with_caps(mut self, caps: DescriptorCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_metadata(mut self, id: u32) -> Self {
        self.meta_id = Some(id);
        self.caps |= DescriptorCaps::MPTR;
        self
    }

    pub fn with_bit_buckets(mut self, buckets: Vec<BitBucket>) -> Self {
        self.bit_buckets = buckets;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Program I/O entry sizes, set CC.EN and wait for CSTS.RDY.
    Enable,
    /// Clear CC.EN and reset the admin queues, releasing everything else.
    Disable,
    /// Clear CC.EN and release everything, admin queues and interrupts
    /// included.
    DisableComplete,
    /// NVM subsystem reset followed by a complete teardown.
    SubsystemReset,
}

impl ControllerState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ControllerState::Enable,
            1 => ControllerState::Disable,
            2 => ControllerState::DisableComplete,
            3 => ControllerState::SubsystemReset,
            _ => return None,
        })
    }
}

pub(crate) struct DeviceState {
    pub(crate) platform: SharedPlatform,
    pub(crate) config: HarnessConfig,
    pub(crate) caps: Capabilities,
    pub(crate) queues: QueueTable,
    pub(crate) pools: DmaPools,
    pub(crate) meta: MetadataStore,
    pub(crate) irq: InterruptEngine,
}

pub struct Device {
    state: Mutex<DeviceState>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Device")
            .field("sqs", &state.queues.sqs.keys().collect::<Vec<_>>())
            .field("cqs", &state.queues.cqs.keys().collect::<Vec<_>>())
            .field("irq", &state.irq.scheme())
            .finish()
    }
}

impl Device {
    pub fn new(platform: SharedPlatform, config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let caps = Capabilities(platform.read64(regs::CAP));
        debug!(
            cap = caps.0,
            max_entries = caps.max_queue_entries(),
            contiguous_required = caps.contiguous_required(),
            "harness device opened"
        );
        let state = DeviceState {
            pools: DmaPools::new(platform.clone(), config.page_size as usize),
            irq: InterruptEngine::new(platform.clone()),
            meta: MetadataStore::default(),
            queues: QueueTable::default(),
            platform,
            config,
            caps,
        };
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn config(&self) -> HarnessConfig {
        self.lock().config.clone()
    }

    pub(crate) fn platform(&self) -> SharedPlatform {
        self.lock().platform.clone()
    }

    /// Entry size and element count of `cqid`.
    pub(crate) fn cq_geometry(&self, cqid: u16) -> Result<(usize, u32)> {
        let state = self.lock();
        let cq = state.queues.cq(cqid)?;
        Ok((cq.entry_size(), cq.elements))
    }

    pub fn create_admin_queue(&self, kind: QueueKind, elements: u32) -> Result<()> {
        self.lock().create_admin_queue(kind, elements)
    }

    pub fn prepare_sq(&self, req: PrepareSq) -> Result<()> {
        self.lock().prepare_sq(req)
    }

    pub fn prepare_cq(&self, req: PrepareCq) -> Result<()> {
        self.lock().prepare_cq(req)
    }

    /// Place a command in its submission queue. Returns the assigned
    /// command id. The doorbell is not rung.
    pub fn submit(&self, req: &SubmitRequest) -> Result<u16> {
        self.lock().submit(req)
    }

    pub fn ring_doorbell(&self, sqid: u16) -> Result<()> {
        self.lock().ring_doorbell(sqid)
    }

    pub fn inquire(&self, cqid: u16) -> Result<u32> {
        self.lock().inquire(cqid)
    }

    /// Reap up to `max_count` entries into `out` (`0` = as many as fit).
    pub fn reap(&self, cqid: u16, max_count: u32, out: &mut [u8]) -> Result<ReapOutcome> {
        self.lock().reap(cqid, max_count, out)
    }

    /// Wait for `expect` entries, then reap exactly that many. `None` waits
    /// forever. The device lock is dropped between polls. An `expect` of 0
    /// reaps nothing and only reports what is ready.
    pub fn reap_blocking(
        &self,
        cqid: u16,
        expect: u32,
        out: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<ReapOutcome> {
        let (entry_size, poll) = {
            let state = self.lock();
            (
                state.queues.cq(cqid)?.entry_size(),
                state.config.reap_poll_interval(),
            )
        };
        if expect == 0 {
            let remaining = self.lock().inquire(cqid)?;
            return Ok(ReapOutcome {
                reaped: 0,
                remaining,
                line: None,
            });
        }
        if expect as usize > out.len() / entry_size {
            return Err(Error::invalid(format!(
                "buffer of {} bytes cannot hold {expect} completions",
                out.len()
            )));
        }

        let start = Instant::now();
        loop {
            {
                let mut state = self.lock();
                if state.inquire(cqid)? >= expect {
                    return state.reap(cqid, expect, out);
                }
            }
            let waited = start.elapsed();
            if timeout.is_some_and(|limit| waited >= limit) {
                return Err(Error::Timeout {
                    what: "completions",
                    waited_ms: waited.as_millis() as u64,
                });
            }
            thread::sleep(poll);
        }
    }

    /// Release a submission queue on the host side without talking to the
    /// controller.
    pub fn release_sq(&self, id: u16) -> Release {
        self.lock().queues.release_sq(id)
    }

    pub fn release_cq(&self, id: u16) -> Release {
        self.lock().release_cq(id)
    }

    /// Abandon every command still tracked on `sqid`. Returns how many were
    /// dropped.
    pub fn drop_outstanding(&self, sqid: u16) -> Result<usize> {
        let mut state = self.lock();
        let dropped = state.queues.sq_mut(sqid)?.tracker.clear();
        debug!(sqid, dropped, "outstanding commands abandoned");
        Ok(dropped)
    }

    pub fn sq_info(&self, id: u16) -> Result<SqInfo> {
        Ok(self.lock().queues.sq(id)?.info())
    }

    pub fn cq_info(&self, id: u16) -> Result<CqInfo> {
        Ok(self.lock().queues.cq(id)?.info())
    }

    pub fn sq_is_full(&self, id: u16) -> Result<bool> {
        Ok(self.lock().queues.sq(id)?.is_full())
    }

    pub fn set_interrupts(&self, scheme: InterruptScheme, count: u16) -> Result<()> {
        let mut state = self.lock();
        if state.platform.read32(regs::CC) & regs::CC_EN != 0 {
            return Err(Error::invalid(
                "interrupt scheme cannot change while the controller is enabled",
            ));
        }
        let DeviceState { irq, config, .. } = &mut *state;
        irq.configure(scheme, count, config)
    }

    pub fn interrupt_scheme(&self) -> InterruptScheme {
        self.lock().irq.scheme()
    }

    pub fn mask_line(&self, line: u16) -> Result<()> {
        self.lock().irq.mask(line)
    }

    pub fn unmask_line(&self, line: u16) -> Result<()> {
        self.lock().irq.unmask(line)
    }

    pub fn line_info(&self, line: u16) -> Result<LineInfo> {
        self.lock().irq.line_info(line)
    }

    /// Wait for every bottom half queued so far.
    pub fn flush_interrupt_work(&self) -> Result<()> {
        self.lock().irq.flush()
    }

    pub fn set_state(&self, target: ControllerState) -> Result<()> {
        self.lock().set_state(target)
    }

    pub fn teardown(&self, mode: TeardownMode) -> Result<()> {
        self.lock().teardown(mode)
    }

    pub fn create_meta_pool(&self, size: u32) -> Result<()> {
        let mut state = self.lock();
        let platform = state.platform.clone();
        let page_size = state.config.page_size as usize;
        state.meta.create_pool(platform, size, page_size)
    }

    /// Allocate metadata buffer `id`; returns its physical address.
    pub fn create_meta(&self, id: u32) -> Result<u64> {
        self.lock().meta.create(id)
    }

    pub fn delete_meta(&self, id: u32) -> Release {
        self.lock().meta.delete(id)
    }

    pub fn read_register(&self, offset: u64, width: u32) -> Result<u64> {
        check_register_access(offset, width)?;
        let state = self.lock();
        Ok(match width {
            4 => state.platform.read32(offset) as u64,
            _ => state.platform.read64(offset),
        })
    }

    pub fn write_register(&self, offset: u64, width: u32, value: u64) -> Result<()> {
        check_register_access(offset, width)?;
        let state = self.lock();
        match width {
            4 => state.platform.write32(offset, value as u32),
            _ => state.platform.write64(offset, value),
        }
        Ok(())
    }

    /// Pin and describe a buffer outside of any command.
    pub fn build_chain(&self, req: &ChainRequest<'_>) -> Result<DescriptorChain> {
        let state = self.lock();
        ChainBuilder::new(&state.pools.descriptors, state.config.page_size as usize).build(req)
    }

    pub fn descriptor_pages_outstanding(&self) -> usize {
        self.lock().pools.descriptors.outstanding()
    }

    pub fn ring_buffers_outstanding(&self) -> usize {
        self.lock().pools.rings.outstanding()
    }

    pub fn metadata_buffers_outstanding(&self) -> usize {
        self.lock().meta.outstanding()
    }
}

fn check_register_access(offset: u64, width: u32) -> Result<()> {
    if width != 4 && width != 8 {
        return Err(Error::invalid(format!("register width {width} must be 4 or 8")));
    }
    if offset % width as u64 != 0 {
        return Err(Error::invalid(format!(
            "register offset {offset:#x} not aligned to {width}"
        )));
    }
    Ok(())
}

impl DeviceState {
    fn page_size(&self) -> usize {
        self.config.page_size as usize
    }

    fn max_io_entries(&self) -> u32 {
        self.config
            .max_queue_entries
            .min(self.caps.max_queue_entries())
    }

    fn create_admin_queue(&mut self, kind: QueueKind, elements: u32) -> Result<()> {
        if self.platform.read32(regs::CC) & regs::CC_EN != 0 {
            return Err(Error::invalid(
                "admin queues cannot be created while the controller is enabled",
            ));
        }
        if elements == 0 || elements > self.config.admin_max_entries {
            return Err(Error::invalid(format!(
                "admin queue of {elements} entries outside 1..={}",
                self.config.admin_max_entries
            )));
        }
        self.queues.ensure_free(kind, ADMIN_QID)?;

        let stride = self.caps.doorbell_stride();
        let shift = match kind {
            QueueKind::Submission => ADMIN_SQ_SHIFT,
            QueueKind::Completion => ADMIN_CQ_SHIFT,
        };
        let storage = allocate_ring(&self.pools.rings, elements, shift, self.page_size())?;
        let base = storage.base().unwrap_or_default();

        let aqa = self.platform.read32(regs::AQA);
        match kind {
            QueueKind::Submission => {
                let aqa = (aqa & !regs::AQA_ASQS_MASK) | ((elements - 1) << regs::AQA_ASQS_SHIFT);
                self.platform.write32(regs::AQA, aqa);
                self.platform.write64(regs::ASQ, base);
                let mut sq = SubmissionQueue::new(
                    ADMIN_QID,
                    ADMIN_QID,
                    elements,
                    shift,
                    true,
                    storage,
                    regs::doorbell_offset(ADMIN_QID, false, stride),
                );
                sq.state = QueueState::Created;
                self.queues.insert_sq(sq);
            }
            QueueKind::Completion => {
                let aqa = (aqa & !regs::AQA_ACQS_MASK) | (elements - 1);
                self.platform.write32(regs::AQA, aqa);
                self.platform.write64(regs::ACQ, base);
                let mut cq = CompletionQueue::new(
                    ADMIN_QID,
                    elements,
                    shift,
                    true,
                    storage,
                    regs::doorbell_offset(ADMIN_QID, true, stride),
                    Some(0),
                );
                cq.state = QueueState::Created;
                self.queues.insert_cq(cq);
            }
        }
        Ok(())
    }

    fn check_io_prepare(&self, kind: QueueKind, id: u16, elements: u32, contiguous: bool) -> Result<()> {
        if id == ADMIN_QID {
            return Err(Error::invalid("queue id 0 is reserved for the admin queue"));
        }
        let max = self.max_io_entries();
        if elements == 0 || elements > max {
            return Err(Error::invalid(format!(
                "queue of {elements} entries outside 1..={max}"
            )));
        }
        self.queues.ensure_free(kind, id)?;
        if !contiguous && self.caps.contiguous_required() {
            return Err(Error::invalid("controller requires physically contiguous queues"));
        }
        Ok(())
    }

    fn prepare_sq(&mut self, req: PrepareSq) -> Result<()> {
        self.check_io_prepare(QueueKind::Submission, req.id, req.elements, req.contiguous)?;
        let shift = self.config.sq_entry_shift;
        let storage = if req.contiguous {
            allocate_ring(&self.pools.rings, req.elements, shift, self.page_size())?
        } else {
            RingStorage::Unbacked
        };
        let doorbell = regs::doorbell_offset(req.id, false, self.caps.doorbell_stride());
        self.queues.insert_sq(SubmissionQueue::new(
            req.id,
            req.cq_id,
            req.elements,
            shift,
            req.contiguous,
            storage,
            doorbell,
        ));
        Ok(())
    }

    fn prepare_cq(&mut self, req: PrepareCq) -> Result<()> {
        self.check_io_prepare(QueueKind::Completion, req.id, req.elements, req.contiguous)?;
        if let Some(line) = req.irq {
            self.irq.check_bindable(line, req.id)?;
        }
        let shift = self.config.cq_entry_shift;
        let storage = if req.contiguous {
            allocate_ring(&self.pools.rings, req.elements, shift, self.page_size())?
        } else {
            RingStorage::Unbacked
        };
        let doorbell = regs::doorbell_offset(req.id, true, self.caps.doorbell_stride());
        self.queues.insert_cq(CompletionQueue::new(
            req.id,
            req.elements,
            shift,
            req.contiguous,
            storage,
            doorbell,
            req.irq,
        ));
        if let Some(line) = req.irq {
            self.irq.bind(line, req.id);
        }
        Ok(())
    }

    pub(crate) fn release_cq(&mut self, id: u16) -> Release {
        let (outcome, line) = self.queues.release_cq(id);
        if let Some(line) = line {
            self.irq.unbind(line, id);
        }
        outcome
    }

    /// Validate a create-queue command against its prepared target and fill
    /// in the ring pointer. Returns the chain describing a non-contiguous
    /// ring, to be attached to the queue once the command is queued.
    fn frame_create_queue(
        &self,
        req: &SubmitRequest,
        cmd: &mut CommandBytes,
    ) -> Result<Option<DescriptorChain>> {
        let target = cmd.target_qid();
        let (contiguous, state, ring_bytes, unbacked, base) = if cmd.opcode() == admin::CREATE_SQ {
            let sq = self.queues.sq(target)?;
            (
                sq.contiguous,
                sq.state,
                sq.ring_bytes(),
                matches!(sq.storage, RingStorage::Unbacked),
                sq.storage.base(),
            )
        } else {
            let cq = self.queues.cq(target)?;
            if cmd.create_irq_enabled() && self.irq.scheme() == InterruptScheme::None {
                return Err(Error::invalid(
                    "create-CQ asks for interrupts but no interrupt scheme is active",
                ));
            }
            let requested = cmd
                .create_irq_enabled()
                .then(|| cmd.create_irq_vector());
            if requested != cq.irq {
                return Err(Error::invalid(format!(
                    "create-CQ interrupt {requested:?} does not match queue {target}, prepared with {:?}",
                    cq.irq
                )));
            }
            (
                cq.contiguous,
                cq.state,
                cq.ring_bytes(),
                matches!(cq.storage, RingStorage::Unbacked),
                cq.storage.base(),
            )
        };

        if state != QueueState::Prepared {
            return Err(Error::invalid(format!("queue {target} is already created")));
        }
        if cmd.create_contiguous() != contiguous {
            return Err(Error::invalid(format!(
                "PC flag {} does not match queue {target}, prepared contiguous={contiguous}",
                cmd.create_contiguous()
            )));
        }

        if contiguous {
            if req.data.is_some() {
                return Err(Error::invalid("contiguous queue create must not carry a buffer"));
            }
            cmd.set_prp1(base.unwrap_or_default());
            cmd.set_prp2(0);
            return Ok(None);
        }

        if !unbacked {
            return Err(Error::invalid(format!(
                "create command for queue {target} already submitted"
            )));
        }
        let buffer = req
            .data
            .ok_or_else(|| Error::invalid("non-contiguous queue create needs a ring buffer"))?;
        if buffer.len < ring_bytes {
            return Err(Error::invalid(format!(
                "ring buffer of {} bytes is smaller than the {ring_bytes}-byte queue",
                buffer.len
            )));
        }
        let chain = ChainBuilder::new(&self.pools.descriptors, self.page_size()).build(
            &ChainRequest {
                buffer,
                direction: DataDirection::Bidirectional,
                caps: req.caps,
                framing: Framing::Prp,
                kind: ChainKind::QueueRing,
                bit_buckets: &[],
            },
        )?;
        chain.pointer().apply(cmd);
        Ok(Some(chain))
    }

    fn submit(&mut self, req: &SubmitRequest) -> Result<u16> {
        let admin_queue = req.sqid == ADMIN_QID;
        let cid = {
            let sq = self.queues.sq(req.sqid)?;
            if sq.is_full() {
                return Err(Error::QueueFull { sqid: req.sqid });
            }
            sq.tracker.peek_cid().ok_or_else(|| {
                Error::ResourceExhausted(format!("no free command id on queue {}", req.sqid))
            })?
        };

        let mut cmd = req.command;
        cmd.set_cid(cid);
        match req.meta_id {
            Some(id) if req.caps.contains(DescriptorCaps::MPTR) => {
                cmd.set_metadata_ptr(self.meta.lookup(id)?);
            }
            Some(id) => {
                return Err(Error::invalid(format!(
                    "metadata buffer {id} given without the MPTR capability"
                )))
            }
            None if req.caps.contains(DescriptorCaps::MPTR) => {
                return Err(Error::invalid("MPTR capability given without a metadata buffer"))
            }
            None => {}
        }

        let opcode = cmd.opcode();
        let queue_op = admin_queue
            && matches!(
                opcode,
                admin::CREATE_SQ | admin::CREATE_CQ | admin::DELETE_SQ | admin::DELETE_CQ
            );
        let target = queue_op.then(|| cmd.target_qid());

        let mut ring_chain = None;
        let mut data_chain = None;
        if queue_op && matches!(opcode, admin::CREATE_SQ | admin::CREATE_CQ) {
            ring_chain = self.frame_create_queue(req, &mut cmd)?;
        } else if let Some(buffer) = req.data {
            let framing = if !admin_queue && cmd.psdt() != 0 {
                Framing::Sgl
            } else {
                Framing::Prp
            };
            let chain = ChainBuilder::new(&self.pools.descriptors, self.page_size()).build(
                &ChainRequest {
                    buffer,
                    direction: req.direction,
                    caps: req.caps,
                    framing,
                    kind: ChainKind::Data,
                    bit_buckets: &req.bit_buckets,
                },
            )?;
            chain.pointer().apply(&mut cmd);
            data_chain = Some(chain);
        } else if !req.bit_buckets.is_empty() {
            return Err(Error::invalid("bit buckets given without a data buffer"));
        }

        let sq = self.queues.sq_mut(req.sqid)?;
        sq.push(self.platform.as_ref(), &cmd)?;
        sq.tracker.insert(TrackedCommand {
            cid,
            opcode,
            sqid: req.sqid,
            target,
            chain: data_chain,
        });

        if let (Some(chain), Some(target)) = (ring_chain, target) {
            let storage = if opcode == admin::CREATE_SQ {
                self.queues.sq_mut(target).map(|sq| &mut sq.storage)
            } else {
                self.queues.cq_mut(target).map(|cq| &mut cq.storage)
            };
            if let Ok(storage) = storage {
                *storage = RingStorage::Chain(chain);
            }
        }

        debug!(sqid = req.sqid, cid, opcode, ?target, "command queued");
        Ok(cid)
    }

    fn ring_doorbell(&mut self, sqid: u16) -> Result<()> {
        let sq = self.queues.sq_mut(sqid)?;
        sq.tail_hw = sq.tail_virt;
        trace!(sqid, tail = sq.tail_hw, doorbell = sq.doorbell, "sq doorbell");
        self.platform.write32(sq.doorbell, sq.tail_hw);
        Ok(())
    }

    fn wait_ready(&self, ready: bool) -> Result<()> {
        let budget = Duration::from_millis((self.caps.timeout_units() + 1) * 500);
        let start = Instant::now();
        loop {
            let raw = self.platform.read32(regs::CSTS);
            if raw == u32::MAX {
                return Err(Error::ProtocolViolation(
                    "CSTS reads all ones; controller is gone".into(),
                ));
            }
            if Csts::from_bits_truncate(raw).contains(Csts::RDY) == ready {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= budget {
                return Err(Error::Timeout {
                    what: if ready { "CSTS.RDY set" } else { "CSTS.RDY clear" },
                    waited_ms: waited.as_millis() as u64,
                });
            }
            thread::sleep(self.config.ready_poll_interval());
        }
    }

    fn set_state(&mut self, target: ControllerState) -> Result<()> {
        let cc = self.platform.read32(regs::CC);
        match target {
            ControllerState::Enable => {
                let cc = regs::cc_with_entry_sizes(
                    cc,
                    self.config.sq_entry_shift,
                    self.config.cq_entry_shift,
                );
                self.platform.write32(regs::CC, cc | regs::CC_EN);
                self.wait_ready(true)
            }
            ControllerState::Disable => {
                self.platform.write32(regs::CC, cc & !regs::CC_EN);
                self.wait_ready(false)?;
                self.teardown(TeardownMode::KeepAdmin)
            }
            ControllerState::DisableComplete => {
                self.platform.write32(regs::CC, cc & !regs::CC_EN);
                self.wait_ready(false)?;
                self.teardown(TeardownMode::Full)
            }
            ControllerState::SubsystemReset => {
                if !self.caps.subsystem_reset_supported() {
                    warn!("controller does not advertise NSSR support");
                }
                self.platform.write32(regs::NSSR, regs::NSSR_RESET_MAGIC);
                self.teardown(TeardownMode::Full)
            }
        }
    }

    fn teardown(&mut self, mode: TeardownMode) -> Result<()> {
        let page_size = self.page_size();
        let released = self
            .queues
            .teardown(mode, self.platform.as_ref(), page_size)?;
        for (cq, line) in released {
            if let Some(line) = line {
                self.irq.unbind(line, cq);
            }
        }
        if mode == TeardownMode::Full {
            self.platform.write32(regs::AQA, 0);
            self.platform.write64(regs::ASQ, 0);
            self.platform.write64(regs::ACQ, 0);
            self.meta.clear();
            self.irq.teardown();
        }
        Ok(())
    }
}
