//! Simulated NVMe controller: BAR0 registers, admin and I/O queue processing,
//! PRP and SGL data movement, and completion posting.
//!
//! Doorbell writes are processed synchronously. Queue rings may be contiguous
//! or described by a PRP list (create with PC=0).

use std::collections::{BTreeMap, VecDeque};

use nvme_harness::command::{admin, CompletionEntry, COMMAND_SIZE, COMPLETION_SIZE};
use nvme_harness::regs;
use nvme_harness::PlatformError;
use tracing::{debug, trace, warn};

use crate::interrupts::Interrupts;
use crate::memory::{Memory, PAGE_SIZE};
use crate::SimConfig;

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;
pub const SECTOR_SIZE: usize = 512;

const OPC_IDENTIFY: u8 = 0x06;
const OPC_FLUSH: u8 = 0x00;
const OPC_WRITE: u8 = 0x01;
const OPC_READ: u8 = 0x02;

const SGL_DATA: u8 = 0x0;
const SGL_BIT_BUCKET: u8 = 0x1;
const SGL_SEGMENT: u8 = 0x2;
const SGL_LAST_SEGMENT: u8 = 0x3;
const SGL_MAX_SEGMENTS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NvmeStatus {
    sct: u8,
    sc: u8,
    dnr: bool,
}

impl NvmeStatus {
    const SUCCESS: NvmeStatus = NvmeStatus::generic(0x0);
    const INVALID_OPCODE: NvmeStatus = NvmeStatus::generic(0x1);
    const INVALID_FIELD: NvmeStatus = NvmeStatus::generic(0x2);
    const DATA_TRANSFER_ERROR: NvmeStatus = NvmeStatus::generic(0x4);
    const INVALID_NS: NvmeStatus = NvmeStatus::generic(0xb);
    const SGL_LENGTH_INVALID: NvmeStatus = NvmeStatus::generic(0xf);
    const SGL_TYPE_INVALID: NvmeStatus = NvmeStatus::generic(0x11);
    const LBA_OUT_OF_RANGE: NvmeStatus = NvmeStatus::generic(0x80);

    const CQ_INVALID: NvmeStatus = NvmeStatus::specific(0x0);
    const INVALID_QID: NvmeStatus = NvmeStatus::specific(0x1);
    const INVALID_QUEUE_SIZE: NvmeStatus = NvmeStatus::specific(0x2);
    const INVALID_VECTOR: NvmeStatus = NvmeStatus::specific(0x8);
    const INVALID_QUEUE_DELETION: NvmeStatus = NvmeStatus::specific(0xc);

    const fn generic(sc: u8) -> Self {
        NvmeStatus {
            sct: 0,
            sc,
            dnr: sc != 0,
        }
    }

    const fn specific(sc: u8) -> Self {
        NvmeStatus {
            sct: 1,
            sc,
            dnr: true,
        }
    }

    fn encode_without_phase(self) -> u16 {
        let mut val: u16 = 0;
        val |= (self.sc as u16) << 1;
        val |= (self.sct as u16) << 9;
        if self.dnr {
            val |= 1 << 14;
        }
        val
    }
}

#[derive(Debug, Clone, Copy)]
struct Command {
    raw: [u8; COMMAND_SIZE],
}

impl Command {
    fn dword(&self, index: usize) -> u32 {
        let at = index * 4;
        u32::from_le_bytes([
            self.raw[at],
            self.raw[at + 1],
            self.raw[at + 2],
            self.raw[at + 3],
        ])
    }

    fn qword(&self, at: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.raw[at..at + 8]);
        u64::from_le_bytes(bytes)
    }

    fn opcode(&self) -> u8 {
        self.raw[0]
    }

    fn psdt(&self) -> u8 {
        (self.raw[1] >> 6) & 0x3
    }

    fn cid(&self) -> u16 {
        u16::from_le_bytes([self.raw[2], self.raw[3]])
    }

    fn nsid(&self) -> u32 {
        self.dword(1)
    }

    fn prp1(&self) -> u64 {
        self.qword(24)
    }

    fn prp2(&self) -> u64 {
        self.qword(32)
    }

    fn sgl1(&self) -> [u8; 16] {
        let mut desc = [0u8; 16];
        desc.copy_from_slice(&self.raw[24..40]);
        desc
    }

    fn cdw10(&self) -> u32 {
        self.dword(10)
    }

    fn cdw11(&self) -> u32 {
        self.dword(11)
    }

    fn cdw12(&self) -> u32 {
        self.dword(12)
    }
}

/// Where a queue ring lives in host memory.
#[derive(Debug, Clone)]
enum Ring {
    Contiguous(u64),
    Pages(Vec<u64>),
}

impl Ring {
    fn slot(&self, index: u32, entry_size: usize) -> u64 {
        let offset = index as usize * entry_size;
        match self {
            Ring::Contiguous(base) => base + offset as u64,
            Ring::Pages(pages) => {
                pages.get(offset / PAGE_SIZE).copied().unwrap_or(0) + (offset % PAGE_SIZE) as u64
            }
        }
    }
}

#[derive(Debug)]
struct SimSq {
    size: u32,
    ring: Ring,
    entry_size: usize,
    head: u32,
    tail: u32,
    cqid: u16,
}

#[derive(Debug)]
struct SimCq {
    size: u32,
    ring: Ring,
    entry_size: usize,
    head: u32,
    tail: u32,
    phase: bool,
    ien: bool,
    iv: u16,
}

/// One-shot misbehaviour injected by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// Report this submission queue id in the next completion.
    SqId(u16),
    /// Report this command id in the next completion.
    Cid(u16),
    /// Report this SQ head pointer in the next completion.
    SqHead(u16),
}

#[derive(Debug, Default)]
pub(crate) struct Faults {
    pub(crate) stuck_ready: bool,
    pub(crate) fail_next_admin: Option<(u8, u8)>,
    pub(crate) corrupt_next: Option<Corruption>,
    /// Acknowledge the next delete that targets queue 0.
    pub(crate) ack_admin_delete: bool,
}

enum Piece {
    Memory(u64, usize),
    Discard(usize),
}

pub(crate) struct Controller {
    cap: u64,
    vs: u32,
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    sqs: BTreeMap<u16, SimSq>,
    cqs: BTreeMap<u16, SimCq>,
    namespace: Vec<u8>,
    pub(crate) faults: Faults,
    pub(crate) log: Vec<[u8; COMMAND_SIZE]>,
}

type MemResult<T> = Result<T, PlatformError>;

impl Controller {
    pub(crate) fn new(config: &SimConfig) -> Self {
        let mqes = u64::from(config.max_queue_entries.clamp(2, 65536) - 1);
        let cqr = u64::from(config.contiguous_required);
        let to = u64::from(config.timeout_units);
        let dstrd = u64::from(config.doorbell_stride & 0xf);
        let nssrs = u64::from(config.subsystem_reset);
        let css_nvm: u64 = 1;
        let cap = mqes | (cqr << 16) | (to << 24) | (dstrd << 32) | (nssrs << 36) | (css_nvm << 37);
        Controller {
            cap,
            vs: 0x0001_0400,
            cc: 0,
            csts: 0,
            aqa: 0,
            asq: 0,
            acq: 0,
            sqs: BTreeMap::new(),
            cqs: BTreeMap::new(),
            namespace: vec![0u8; config.namespace_blocks as usize * SECTOR_SIZE],
            faults: Faults::default(),
            log: Vec::new(),
        }
    }

    fn stride(&self) -> u64 {
        4 << ((self.cap >> 32) & 0xf)
    }

    fn ready(&self) -> bool {
        self.csts & regs::Csts::RDY.bits() != 0
    }

    pub(crate) fn mmio_read(&self, offset: u64, irq: &Interrupts) -> u64 {
        match offset {
            regs::CAP => self.cap,
            regs::VS => u64::from(self.vs),
            regs::INTMS => u64::from(irq.intms()),
            regs::INTMC => u64::from(irq.intms()),
            regs::CC => u64::from(self.cc),
            regs::CSTS => u64::from(self.csts),
            regs::AQA => u64::from(self.aqa),
            regs::ASQ => self.asq,
            regs::ACQ => self.acq,
            _ => 0,
        }
    }

    /// Returns vectors that became deliverable.
    pub(crate) fn mmio_write(
        &mut self,
        offset: u64,
        value: u64,
        memory: &mut Memory,
        irq: &mut Interrupts,
    ) -> Vec<u32> {
        match offset {
            regs::INTMS => irq.write_intms(value as u32),
            regs::INTMC => return irq.write_intmc(value as u32),
            regs::CC => {
                let was_enabled = self.cc & regs::CC_EN != 0;
                self.cc = value as u32;
                let enabled = self.cc & regs::CC_EN != 0;
                if !was_enabled && enabled {
                    self.enable();
                } else if was_enabled && !enabled {
                    self.reset();
                }
            }
            regs::NSSR => {
                if value as u32 == regs::NSSR_RESET_MAGIC && self.cap & (1 << 36) != 0 {
                    debug!("subsystem reset");
                    self.reset();
                    self.cc = 0;
                    self.csts = regs::Csts::NSSRO.bits();
                }
            }
            regs::AQA if !self.ready() => self.aqa = value as u32,
            regs::ASQ if !self.ready() => self.asq = value,
            regs::ACQ if !self.ready() => self.acq = value,
            _ if offset >= regs::DOORBELL_BASE => {
                return self.write_doorbell(offset, value as u32, memory, irq);
            }
            _ => {}
        }
        Vec::new()
    }

    fn enable(&mut self) {
        let asqs = ((self.aqa >> regs::AQA_ASQS_SHIFT) & 0x0fff) + 1;
        let acqs = (self.aqa & regs::AQA_ACQS_MASK) + 1;
        if self.asq == 0 || self.acq == 0 || self.asq & PAGE_MASK != 0 || self.acq & PAGE_MASK != 0 {
            warn!(asq = self.asq, acq = self.acq, "enable with bad admin queue registers");
            self.csts = regs::Csts::CFS.bits();
            return;
        }
        self.sqs.clear();
        self.cqs.clear();
        self.sqs.insert(
            0,
            SimSq {
                size: asqs,
                ring: Ring::Contiguous(self.asq),
                entry_size: COMMAND_SIZE,
                head: 0,
                tail: 0,
                cqid: 0,
            },
        );
        self.cqs.insert(
            0,
            SimCq {
                size: acqs,
                ring: Ring::Contiguous(self.acq),
                entry_size: COMPLETION_SIZE,
                head: 0,
                tail: 0,
                phase: true,
                ien: true,
                iv: 0,
            },
        );
        if !self.faults.stuck_ready {
            self.csts = regs::Csts::RDY.bits();
        }
        debug!(asqs, acqs, "controller enabled");
    }

    fn reset(&mut self) {
        self.csts = 0;
        self.sqs.clear();
        self.cqs.clear();
    }

    fn io_sq_entry_size(&self) -> usize {
        match (self.cc >> 16) & 0xf {
            0 => COMMAND_SIZE,
            shift => 1 << shift,
        }
    }

    fn io_cq_entry_size(&self) -> usize {
        match (self.cc >> 20) & 0xf {
            0 => COMPLETION_SIZE,
            shift => 1 << shift,
        }
    }

    fn write_doorbell(
        &mut self,
        offset: u64,
        value: u32,
        memory: &mut Memory,
        irq: &mut Interrupts,
    ) -> Vec<u32> {
        if !self.ready() {
            return Vec::new();
        }
        let index = (offset - regs::DOORBELL_BASE) / self.stride();
        let qid = (index / 2) as u16;
        if index % 2 == 1 {
            if let Some(cq) = self.cqs.get_mut(&qid) {
                cq.head = value % cq.size;
            }
            return Vec::new();
        }
        match self.sqs.get_mut(&qid) {
            Some(sq) => sq.tail = value % sq.size,
            None => {
                warn!(qid, "doorbell for unknown submission queue");
                return Vec::new();
            }
        }
        match self.process_sq(qid, memory) {
            Ok(ivs) => ivs
                .into_iter()
                .filter_map(|iv| irq.raise(irq.line_for(iv)))
                .collect(),
            Err(err) => {
                warn!(qid, %err, "controller fatal status");
                self.csts |= regs::Csts::CFS.bits();
                Vec::new()
            }
        }
    }

    /// Consume every queued command. Returns the interrupt vector fields of
    /// the completion queues to signal, deduplicated.
    fn process_sq(&mut self, qid: u16, memory: &mut Memory) -> MemResult<Vec<u16>> {
        let mut lines = Vec::new();
        loop {
            let Some(sq) = self.sqs.get(&qid) else {
                break;
            };
            if sq.head == sq.tail {
                break;
            }
            let mut raw = [0u8; COMMAND_SIZE];
            memory.read(sq.ring.slot(sq.head, sq.entry_size), &mut raw)?;
            let cmd = Command { raw };
            let cqid = sq.cqid;
            self.log.push(raw);
            trace!(qid, cid = cmd.cid(), opcode = cmd.opcode(), "command fetched");

            let (status, result) = if qid == 0 {
                self.execute_admin(cmd, memory)?
            } else {
                self.execute_io(cmd, memory)?
            };

            let sq_head = match self.sqs.get_mut(&qid) {
                Some(sq) => {
                    sq.head = (sq.head + 1) % sq.size;
                    sq.head
                }
                None => 0,
            };
            if let Some(line) = self.post_completion(cqid, qid, sq_head, cmd.cid(), status, result, memory)? {
                if !lines.contains(&line) {
                    lines.push(line);
                }
            }
        }
        Ok(lines)
    }

    #[allow(clippy::too_many_arguments)]
    fn post_completion(
        &mut self,
        cqid: u16,
        sqid: u16,
        sq_head: u32,
        cid: u16,
        status: NvmeStatus,
        result: u32,
        memory: &mut Memory,
    ) -> MemResult<Option<u16>> {
        let corruption = self.faults.corrupt_next.take();
        let Some(cq) = self.cqs.get_mut(&cqid) else {
            warn!(cqid, "completion for missing completion queue dropped");
            return Ok(None);
        };
        let next_tail = (cq.tail + 1) % cq.size;
        if next_tail == cq.head {
            warn!(cqid, "completion queue full; entry dropped");
            return Ok(None);
        }

        let mut entry = CompletionEntry {
            dw0: result,
            dw1: 0,
            sq_head: sq_head as u16,
            sq_id: sqid,
            cid,
            status: status.encode_without_phase() | u16::from(cq.phase),
        };
        match corruption {
            Some(Corruption::SqId(id)) => entry.sq_id = id,
            Some(Corruption::Cid(id)) => entry.cid = id,
            Some(Corruption::SqHead(head)) => entry.sq_head = head,
            None => {}
        }

        let slot = cq.ring.slot(cq.tail, cq.entry_size);
        memory.write(slot, &entry.to_bytes())?;
        cq.tail = next_tail;
        if cq.tail == 0 {
            cq.phase = !cq.phase;
        }
        Ok(cq.ien.then_some(cq.iv))
    }

    /// Fill every slot of a completion queue with entries carrying the
    /// current phase, as a runaway controller would.
    pub(crate) fn flood(&mut self, cqid: u16, memory: &mut Memory) -> MemResult<bool> {
        let Some(cq) = self.cqs.get(&cqid) else {
            return Ok(false);
        };
        // Phase the host expects at its head.
        let host_phase = if cq.tail >= cq.head { cq.phase } else { !cq.phase };
        for index in 0..cq.size {
            let phase = if index >= cq.head { host_phase } else { !host_phase };
            let entry = CompletionEntry {
                dw0: 0,
                dw1: 0,
                sq_head: 0,
                sq_id: 0,
                cid: 0xffff,
                status: u16::from(phase),
            };
            memory.write(cq.ring.slot(index, cq.entry_size), &entry.to_bytes())?;
        }
        Ok(true)
    }

    /// Physical address of slot `index` in completion queue `cqid`.
    pub(crate) fn cq_slot(&self, cqid: u16, index: u32) -> Option<u64> {
        let cq = self.cqs.get(&cqid)?;
        (index < cq.size).then(|| cq.ring.slot(index, cq.entry_size))
    }

    fn execute_admin(&mut self, cmd: Command, memory: &mut Memory) -> MemResult<(NvmeStatus, u32)> {
        if let Some((sct, sc)) = self.faults.fail_next_admin.take() {
            return Ok((NvmeStatus { sct, sc, dnr: true }, 0));
        }
        if cmd.psdt() != 0 {
            return Ok((NvmeStatus::INVALID_FIELD, 0));
        }
        match cmd.opcode() {
            admin::CREATE_CQ => self.cmd_create_io_cq(cmd, memory),
            admin::CREATE_SQ => self.cmd_create_io_sq(cmd, memory),
            admin::DELETE_SQ => Ok((self.cmd_delete_io_sq(cmd), 0)),
            admin::DELETE_CQ => Ok((self.cmd_delete_io_cq(cmd), 0)),
            OPC_IDENTIFY => self.cmd_identify(cmd, memory),
            _ => Ok((NvmeStatus::INVALID_OPCODE, 0)),
        }
    }

    fn execute_io(&mut self, cmd: Command, memory: &mut Memory) -> MemResult<(NvmeStatus, u32)> {
        match cmd.opcode() {
            OPC_FLUSH => Ok((NvmeStatus::SUCCESS, 0)),
            OPC_WRITE => self.cmd_write(cmd, memory),
            OPC_READ => self.cmd_read(cmd, memory),
            _ => Ok((NvmeStatus::INVALID_OPCODE, 0)),
        }
    }

    /// Ring storage named by PRP1: the base itself when contiguous, else a
    /// PRP list of the ring's pages.
    fn queue_ring(
        &self,
        cmd: Command,
        size: u32,
        entry_size: usize,
        memory: &Memory,
    ) -> Result<Ring, NvmeStatus> {
        let prp1 = cmd.prp1();
        if prp1 == 0 || prp1 & PAGE_MASK != 0 {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        if cmd.cdw11() & 1 != 0 {
            return Ok(Ring::Contiguous(prp1));
        }
        if self.cap & (1 << 16) != 0 {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        let pages = (size as usize * entry_size).div_ceil(PAGE_SIZE);
        read_prp_list(memory, prp1, pages).map(Ring::Pages)
    }

    fn check_new_queue(&self, cmd: Command) -> Result<(u16, u32), NvmeStatus> {
        let qid = (cmd.cdw10() & 0xffff) as u16;
        let size = (cmd.cdw10() >> 16) + 1;
        if qid == 0 {
            return Err(NvmeStatus::INVALID_QID);
        }
        if size < 2 || u64::from(size) > (self.cap & 0xffff) + 1 {
            return Err(NvmeStatus::INVALID_QUEUE_SIZE);
        }
        Ok((qid, size))
    }

    fn cmd_create_io_cq(&mut self, cmd: Command, memory: &Memory) -> MemResult<(NvmeStatus, u32)> {
        let (qid, size) = match self.check_new_queue(cmd) {
            Ok(v) => v,
            Err(status) => return Ok((status, 0)),
        };
        if self.cqs.contains_key(&qid) {
            return Ok((NvmeStatus::INVALID_QID, 0));
        }
        let ien = cmd.cdw11() & 0x2 != 0;
        let iv = (cmd.cdw11() >> 16) as u16;
        if ien && iv >= 2048 {
            return Ok((NvmeStatus::INVALID_VECTOR, 0));
        }
        let entry_size = self.io_cq_entry_size();
        let ring = match self.queue_ring(cmd, size, entry_size, memory) {
            Ok(ring) => ring,
            Err(status) => return Ok((status, 0)),
        };
        self.cqs.insert(
            qid,
            SimCq {
                size,
                ring,
                entry_size,
                head: 0,
                tail: 0,
                phase: true,
                ien,
                iv,
            },
        );
        debug!(qid, size, ien, iv, "io completion queue created");
        Ok((NvmeStatus::SUCCESS, 0))
    }

    fn cmd_create_io_sq(&mut self, cmd: Command, memory: &Memory) -> MemResult<(NvmeStatus, u32)> {
        let (qid, size) = match self.check_new_queue(cmd) {
            Ok(v) => v,
            Err(status) => return Ok((status, 0)),
        };
        if self.sqs.contains_key(&qid) {
            return Ok((NvmeStatus::INVALID_QID, 0));
        }
        let cqid = (cmd.cdw11() >> 16) as u16;
        if cqid == 0 || !self.cqs.contains_key(&cqid) {
            return Ok((NvmeStatus::CQ_INVALID, 0));
        }
        let entry_size = self.io_sq_entry_size();
        let ring = match self.queue_ring(cmd, size, entry_size, memory) {
            Ok(ring) => ring,
            Err(status) => return Ok((status, 0)),
        };
        self.sqs.insert(
            qid,
            SimSq {
                size,
                ring,
                entry_size,
                head: 0,
                tail: 0,
                cqid,
            },
        );
        debug!(qid, size, cqid, "io submission queue created");
        Ok((NvmeStatus::SUCCESS, 0))
    }

    fn cmd_delete_io_sq(&mut self, cmd: Command) -> NvmeStatus {
        let qid = (cmd.cdw10() & 0xffff) as u16;
        if qid == 0 && std::mem::take(&mut self.faults.ack_admin_delete) {
            debug!("acknowledging admin submission queue deletion");
            return NvmeStatus::SUCCESS;
        }
        if qid == 0 || self.sqs.remove(&qid).is_none() {
            return NvmeStatus::INVALID_QID;
        }
        debug!(qid, "io submission queue deleted");
        NvmeStatus::SUCCESS
    }

    fn cmd_delete_io_cq(&mut self, cmd: Command) -> NvmeStatus {
        let qid = (cmd.cdw10() & 0xffff) as u16;
        if qid == 0 && std::mem::take(&mut self.faults.ack_admin_delete) {
            debug!("acknowledging admin completion queue deletion");
            return NvmeStatus::SUCCESS;
        }
        if qid == 0 || !self.cqs.contains_key(&qid) {
            return NvmeStatus::INVALID_QID;
        }
        if self.sqs.values().any(|sq| sq.cqid == qid) {
            return NvmeStatus::INVALID_QUEUE_DELETION;
        }
        self.cqs.remove(&qid);
        debug!(qid, "io completion queue deleted");
        NvmeStatus::SUCCESS
    }

    fn cmd_identify(&mut self, cmd: Command, memory: &mut Memory) -> MemResult<(NvmeStatus, u32)> {
        let data = match cmd.cdw10() & 0xff {
            0x01 => self.identify_controller(),
            0x00 => self.identify_namespace(cmd.nsid()),
            _ => return Ok((NvmeStatus::INVALID_FIELD, 0)),
        };
        let pieces = match prp_pieces(memory, cmd.prp1(), cmd.prp2(), data.len()) {
            Ok(pieces) => pieces,
            Err(status) => return Ok((status, 0)),
        };
        scatter(memory, &pieces, &data)?;
        Ok((NvmeStatus::SUCCESS, 0))
    }

    fn identify_controller(&self) -> Vec<u8> {
        let mut data = vec![0u8; 4096];
        data[0..2].copy_from_slice(&0x1b36u16.to_le_bytes());
        data[2..4].copy_from_slice(&0x1b36u16.to_le_bytes());
        write_ascii_padded(&mut data[4..24], "SIM0000000000000001");
        write_ascii_padded(&mut data[24..64], "Simulated NVMe Controller");
        write_ascii_padded(&mut data[64..72], "0.1");
        // SGLS: SGLs and bit buckets supported.
        data[536..540].copy_from_slice(&(1u32 | 1 << 16).to_le_bytes());
        data[516..520].copy_from_slice(&1u32.to_le_bytes());
        data
    }

    fn identify_namespace(&self, nsid: u32) -> Vec<u8> {
        let mut data = vec![0u8; 4096];
        if nsid != 1 {
            return data;
        }
        let nsze = (self.namespace.len() / SECTOR_SIZE) as u64;
        data[0..8].copy_from_slice(&nsze.to_le_bytes());
        data[8..16].copy_from_slice(&nsze.to_le_bytes());
        data[16..24].copy_from_slice(&nsze.to_le_bytes());
        data[128 + 2] = 9;
        data
    }

    /// LBA range and byte length of a read/write command.
    fn io_range(&self, cmd: Command) -> Result<(usize, usize), NvmeStatus> {
        if cmd.nsid() != 1 {
            return Err(NvmeStatus::INVALID_NS);
        }
        let slba = (u64::from(cmd.cdw11()) << 32) | u64::from(cmd.cdw10());
        let blocks = (cmd.cdw12() & 0xffff) as usize + 1;
        let start = slba as usize * SECTOR_SIZE;
        let len = blocks * SECTOR_SIZE;
        if start + len > self.namespace.len() {
            return Err(NvmeStatus::LBA_OUT_OF_RANGE);
        }
        Ok((start, len))
    }

    fn data_pieces(&self, cmd: Command, len: usize, memory: &Memory) -> Result<Vec<Piece>, NvmeStatus> {
        match cmd.psdt() {
            0 => prp_pieces(memory, cmd.prp1(), cmd.prp2(), len),
            _ => sgl_pieces(memory, cmd.sgl1(), len),
        }
    }

    fn cmd_read(&mut self, cmd: Command, memory: &mut Memory) -> MemResult<(NvmeStatus, u32)> {
        let (start, len) = match self.io_range(cmd) {
            Ok(range) => range,
            Err(status) => return Ok((status, 0)),
        };
        let pieces = match self.data_pieces(cmd, len, memory) {
            Ok(pieces) => pieces,
            Err(status) => return Ok((status, 0)),
        };
        let data = self.namespace[start..start + len].to_vec();
        if scatter(memory, &pieces, &data).is_err() {
            return Ok((NvmeStatus::DATA_TRANSFER_ERROR, 0));
        }
        Ok((NvmeStatus::SUCCESS, 0))
    }

    fn cmd_write(&mut self, cmd: Command, memory: &mut Memory) -> MemResult<(NvmeStatus, u32)> {
        let (start, len) = match self.io_range(cmd) {
            Ok(range) => range,
            Err(status) => return Ok((status, 0)),
        };
        let pieces = match self.data_pieces(cmd, len, memory) {
            Ok(pieces) => pieces,
            Err(status) => return Ok((status, 0)),
        };
        let mut data = vec![0u8; len];
        if gather(memory, &pieces, &mut data).is_err() {
            return Ok((NvmeStatus::DATA_TRANSFER_ERROR, 0));
        }
        self.namespace[start..start + len].copy_from_slice(&data);
        Ok((NvmeStatus::SUCCESS, 0))
    }

    pub(crate) fn namespace(&self) -> &[u8] {
        &self.namespace
    }

    pub(crate) fn namespace_mut(&mut self) -> &mut [u8] {
        &mut self.namespace
    }
}

fn write_ascii_padded(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let bytes = s.as_bytes();
    let len = bytes.len().min(dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
}

/// Copy `data` out through `pieces`, skipping bit buckets.
fn scatter(memory: &mut Memory, pieces: &[Piece], data: &[u8]) -> MemResult<()> {
    let mut offset = 0;
    for piece in pieces {
        if offset >= data.len() {
            break;
        }
        match *piece {
            Piece::Memory(addr, len) => {
                let n = len.min(data.len() - offset);
                memory.write(addr, &data[offset..offset + n])?;
                offset += n;
            }
            Piece::Discard(len) => offset += len,
        }
    }
    Ok(())
}

/// Fill `data` from `pieces`; bit-bucket ranges read as zeros.
fn gather(memory: &Memory, pieces: &[Piece], data: &mut [u8]) -> MemResult<()> {
    let mut offset = 0;
    for piece in pieces {
        if offset >= data.len() {
            break;
        }
        match *piece {
            Piece::Memory(addr, len) => {
                let n = len.min(data.len() - offset);
                memory.read(addr, &mut data[offset..offset + n])?;
                offset += n;
            }
            Piece::Discard(len) => offset += len,
        }
    }
    Ok(())
}

/// Read `count` page addresses from a PRP list starting at `list`, following
/// the chain pointer in the last slot of each full list page.
fn read_prp_list(memory: &Memory, list: u64, count: usize) -> Result<Vec<u64>, NvmeStatus> {
    let per_page = PAGE_SIZE / 8;
    let mut pages = Vec::with_capacity(count);
    let mut list_addr = list;
    while pages.len() < count {
        let remaining = count - pages.len();
        let here = if remaining > per_page { per_page - 1 } else { remaining };
        for index in 0..here {
            let page = memory
                .read_u64(list_addr + index as u64 * 8)
                .map_err(|_| NvmeStatus::DATA_TRANSFER_ERROR)?;
            if page == 0 || page & PAGE_MASK != 0 {
                return Err(NvmeStatus::INVALID_FIELD);
            }
            pages.push(page);
        }
        if pages.len() < count {
            list_addr = match memory.read_u64(list_addr + (per_page as u64 - 1) * 8) {
                Ok(next) if next != 0 && next & PAGE_MASK == 0 => next,
                _ => return Err(NvmeStatus::INVALID_FIELD),
            };
        }
    }
    Ok(pages)
}

fn prp_pieces(memory: &Memory, prp1: u64, prp2: u64, len: usize) -> Result<Vec<Piece>, NvmeStatus> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if prp1 == 0 || prp1 & 0x3 != 0 {
        return Err(NvmeStatus::INVALID_FIELD);
    }
    let first_len = (PAGE_SIZE - (prp1 & PAGE_MASK) as usize).min(len);
    let mut pieces = vec![Piece::Memory(prp1, first_len)];
    let mut remaining = len - first_len;
    if remaining == 0 {
        return Ok(pieces);
    }
    if prp2 == 0 || prp2 & 0x7 != 0 {
        return Err(NvmeStatus::INVALID_FIELD);
    }
    if remaining <= PAGE_SIZE {
        pieces.push(Piece::Memory(prp2, remaining));
        return Ok(pieces);
    }
    for page in read_prp_list(memory, prp2, remaining.div_ceil(PAGE_SIZE))? {
        let chunk = remaining.min(PAGE_SIZE);
        pieces.push(Piece::Memory(page, chunk));
        remaining -= chunk;
    }
    Ok(pieces)
}

fn decode_sgl(desc: &[u8]) -> (u64, usize, u8) {
    let mut addr = [0u8; 8];
    addr.copy_from_slice(&desc[0..8]);
    let len = u32::from_le_bytes([desc[8], desc[9], desc[10], desc[11]]);
    (u64::from_le_bytes(addr), len as usize, desc[15] >> 4)
}

/// Walk an SGL from the inline descriptor until `len` bytes are covered.
fn sgl_pieces(memory: &Memory, first: [u8; 16], len: usize) -> Result<Vec<Piece>, NvmeStatus> {
    let mut queue = VecDeque::from([first]);
    let mut pieces = Vec::new();
    let mut covered = 0;
    let mut segments = 0;
    while let Some(desc) = queue.pop_front() {
        let (addr, desc_len, ty) = decode_sgl(&desc);
        match ty {
            SGL_DATA => {
                pieces.push(Piece::Memory(addr, desc_len));
                covered += desc_len;
            }
            SGL_BIT_BUCKET => {
                pieces.push(Piece::Discard(desc_len));
                covered += desc_len;
            }
            SGL_SEGMENT | SGL_LAST_SEGMENT => {
                segments += 1;
                if segments > SGL_MAX_SEGMENTS || desc_len == 0 || desc_len % 16 != 0 {
                    return Err(NvmeStatus::SGL_LENGTH_INVALID);
                }
                let mut raw = vec![0u8; desc_len];
                memory
                    .read(addr, &mut raw)
                    .map_err(|_| NvmeStatus::DATA_TRANSFER_ERROR)?;
                for chunk in raw.chunks_exact(16) {
                    let mut next = [0u8; 16];
                    next.copy_from_slice(chunk);
                    queue.push_back(next);
                }
            }
            _ => return Err(NvmeStatus::SGL_TYPE_INVALID),
        }
    }
    if covered < len {
        return Err(NvmeStatus::SGL_LENGTH_INVALID);
    }
    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sgl(addr: u64, len: u32, ty: u8) -> [u8; 16] {
        let mut desc = [0u8; 16];
        desc[0..8].copy_from_slice(&addr.to_le_bytes());
        desc[8..12].copy_from_slice(&len.to_le_bytes());
        desc[15] = ty << 4;
        desc
    }

    #[test]
    fn status_encoding_matches_completion_layout() {
        assert_eq!(NvmeStatus::SUCCESS.encode_without_phase(), 0);
        let invalid_qid = NvmeStatus::INVALID_QID.encode_without_phase();
        assert_eq!((invalid_qid >> 1) & 0xff, 0x1);
        assert_eq!((invalid_qid >> 9) & 0x7, 1);
        assert_ne!(invalid_qid & (1 << 14), 0);
    }

    #[test]
    fn prp_list_chains_across_pages() {
        let mut memory = Memory::new();
        let lists = memory.alloc_coherent(2 * PAGE_SIZE).unwrap();
        let second = lists + PAGE_SIZE as u64;
        let per_page = PAGE_SIZE / 8;
        for i in 0..per_page - 1 {
            memory
                .write(lists + i as u64 * 8, &(((i as u64) + 1) << 12).to_le_bytes())
                .unwrap();
        }
        memory
            .write(lists + (per_page as u64 - 1) * 8, &second.to_le_bytes())
            .unwrap();
        memory.write(second, &(0x99u64 << 12).to_le_bytes()).unwrap();

        let pages = read_prp_list(&memory, lists, per_page).unwrap();
        assert_eq!(pages.len(), per_page);
        assert_eq!(pages[0], 1 << 12);
        assert_eq!(pages[per_page - 1], 0x99 << 12);
    }

    #[test]
    fn sgl_walk_follows_segments_and_buckets() {
        let mut memory = Memory::new();
        let seg = memory.alloc_coherent(PAGE_SIZE).unwrap();
        memory.write(seg, &sgl(0x1000, 512, SGL_DATA)).unwrap();
        memory.write(seg + 16, &sgl(0, 512, SGL_BIT_BUCKET)).unwrap();
        let pieces = sgl_pieces(&memory, sgl(seg, 32, SGL_LAST_SEGMENT), 1024).unwrap();
        assert_eq!(pieces.len(), 2);
        assert!(matches!(pieces[0], Piece::Memory(0x1000, 512)));
        assert!(matches!(pieces[1], Piece::Discard(512)));
    }

    #[test]
    fn short_sgl_is_rejected() {
        let memory = Memory::new();
        assert!(matches!(
            sgl_pieces(&memory, sgl(0x1000, 512, SGL_DATA), 1024),
            Err(NvmeStatus::SGL_LENGTH_INVALID)
        ));
    }
}
