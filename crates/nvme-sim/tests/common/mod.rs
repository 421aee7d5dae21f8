#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use nvme_harness::command::{
    admin, CommandBytes, CompletionEntry, DataDirection, DescriptorCaps, COMPLETION_SIZE,
};
use nvme_harness::{
    ControllerState, Device, HarnessConfig, PrepareCq, PrepareSq, QueueKind, SubmitRequest,
    UserBuffer,
};
use nvme_sim::{SimConfig, SimPlatform};

pub const OPC_FLUSH: u8 = 0x00;
pub const OPC_WRITE: u8 = 0x01;
pub const OPC_READ: u8 = 0x02;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A harness device wired to a fresh simulated controller.
pub struct Rig {
    pub sim: Arc<SimPlatform>,
    pub dev: Device,
}

impl Rig {
    pub fn new() -> Self {
        Self::with(SimConfig::default(), HarnessConfig::default())
    }

    pub fn with(sim_config: SimConfig, config: HarnessConfig) -> Self {
        init_tracing();
        let sim = SimPlatform::new(sim_config);
        let dev = Device::new(sim.clone(), config).expect("open device");
        Rig { sim, dev }
    }

    /// Admin queues plus CC.EN.
    pub fn enabled(admin_entries: u32) -> Self {
        let rig = Self::new();
        rig.bring_up(admin_entries);
        rig
    }

    pub fn admin_queues(&self, elements: u32) {
        self.dev
            .create_admin_queue(QueueKind::Submission, elements)
            .expect("admin sq");
        self.dev
            .create_admin_queue(QueueKind::Completion, elements)
            .expect("admin cq");
    }

    pub fn bring_up(&self, admin_entries: u32) {
        self.admin_queues(admin_entries);
        self.dev.set_state(ControllerState::Enable).expect("enable");
    }

    /// Submit on the admin queue, ring it and reap the completion.
    pub fn admin(&self, req: SubmitRequest) -> CompletionEntry {
        let cid = self.dev.submit(&req).expect("submit admin command");
        self.dev.ring_doorbell(0).expect("admin doorbell");
        let entry = self.reap_one(0);
        assert_eq!(entry.cid, cid);
        entry
    }

    pub fn reap_one(&self, cqid: u16) -> CompletionEntry {
        let mut buf = [0u8; COMPLETION_SIZE];
        let outcome = self
            .dev
            .reap_blocking(cqid, 1, &mut buf, Some(Duration::from_secs(2)))
            .expect("reap");
        assert_eq!(outcome.reaped, 1);
        CompletionEntry::parse(&buf)
    }

    pub fn create_cq(&self, id: u16, elements: u32, irq: Option<u16>) -> CompletionEntry {
        self.dev
            .prepare_cq(PrepareCq {
                id,
                elements,
                contiguous: true,
                irq,
            })
            .expect("prepare cq");
        self.admin(SubmitRequest::new(0, create_cq_cmd(id, elements, true, irq)))
    }

    pub fn create_sq(&self, id: u16, cq_id: u16, elements: u32) -> CompletionEntry {
        self.dev
            .prepare_sq(PrepareSq {
                id,
                cq_id,
                elements,
                contiguous: true,
            })
            .expect("prepare sq");
        self.admin(SubmitRequest::new(0, create_sq_cmd(id, cq_id, elements, true)))
    }

    /// I/O CQ and SQ sharing `id`, interrupts off.
    pub fn io_pair(&self, id: u16, elements: u32) {
        assert!(self.create_cq(id, elements, None).succeeded());
        assert!(self.create_sq(id, id, elements).succeeded());
    }

    /// Like [`Rig::io_pair`], with the CQ signalling `line`.
    pub fn io_pair_with_irq(&self, id: u16, elements: u32, line: u16) {
        assert!(self.create_cq(id, elements, Some(line)).succeeded());
        assert!(self.create_sq(id, id, elements).succeeded());
    }

    /// Fresh user memory holding `data`.
    pub fn user_buffer(&self, data: &[u8]) -> UserBuffer {
        let addr = self.sim.map_user(data.len());
        self.sim.write_user(addr, data).expect("fill user buffer");
        UserBuffer {
            addr,
            len: data.len(),
        }
    }

    pub fn write_blocks(&self, sqid: u16, lba: u64, data: &[u8]) -> u16 {
        let buffer = self.user_buffer(data);
        let blocks = (data.len() / nvme_sim::SECTOR_SIZE) as u32;
        self.dev
            .submit(
                &SubmitRequest::new(sqid, io_cmd(OPC_WRITE, lba, blocks))
                    .with_data(buffer, DataDirection::ToDevice)
                    .with_caps(data_caps()),
            )
            .expect("submit write")
    }
}

pub fn data_caps() -> DescriptorCaps {
    DescriptorCaps::PRP1_PAGE | DescriptorCaps::PRP2_PAGE | DescriptorCaps::PRP2_LIST
}

pub fn create_cq_cmd(id: u16, elements: u32, contiguous: bool, irq: Option<u16>) -> CommandBytes {
    let mut cmd = CommandBytes::new(admin::CREATE_CQ);
    cmd.set_cdw10(u32::from(id) | ((elements - 1) << 16));
    let ien = irq.map_or(0, |line| 0x2 | (u32::from(line) << 16));
    cmd.set_cdw11(u32::from(contiguous) | ien);
    cmd
}

pub fn create_sq_cmd(id: u16, cq_id: u16, elements: u32, contiguous: bool) -> CommandBytes {
    let mut cmd = CommandBytes::new(admin::CREATE_SQ);
    cmd.set_cdw10(u32::from(id) | ((elements - 1) << 16));
    cmd.set_cdw11(u32::from(contiguous) | (u32::from(cq_id) << 16));
    cmd
}

pub fn delete_cmd(opcode: u8, id: u16) -> CommandBytes {
    let mut cmd = CommandBytes::new(opcode);
    cmd.set_cdw10(u32::from(id));
    cmd
}

pub fn flush_cmd() -> CommandBytes {
    let mut cmd = CommandBytes::new(OPC_FLUSH);
    cmd.set_nsid(1);
    cmd
}

pub fn io_cmd(opcode: u8, lba: u64, blocks: u32) -> CommandBytes {
    let mut cmd = CommandBytes::new(opcode);
    cmd.set_nsid(1);
    cmd.set_cdw10(lba as u32);
    cmd.set_cdw11((lba >> 32) as u32);
    cmd.set_cdw12(blocks - 1);
    cmd
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
