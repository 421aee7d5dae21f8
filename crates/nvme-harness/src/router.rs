//! Control-request entry point for the test program.
//!
//! Each request is a fixed code plus a parameter block laid out as one of the
//! `#[repr(C)]` structs below. Blocks are read from the caller's bytes and,
//! for requests that report values, written back in place. Large payloads
//! (reap buffers, bit-bucket lists, data buffers) stay in the test program's
//! address space and are named by address.
//!
//! [`dispatch`] returns `0` or a non-negative count on success and a negative
//! errno on failure.

use std::mem::size_of;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, trace};

use crate::chain::{BitBucket, UserBuffer};
use crate::command::{CommandBytes, DataDirection, DescriptorCaps, COMMAND_SIZE};
use crate::device::{ControllerState, Device, PrepareCq, PrepareSq, SubmitRequest};
use crate::error::{Error, Result};
use crate::irq::InterruptScheme;
use crate::queue::{QueueKind, QueueState};
use crate::reap::ReapOutcome;

/// Request codes.
pub mod code {
    pub const READ_REGISTER: u32 = 0x01;
    pub const WRITE_REGISTER: u32 = 0x02;
    pub const SET_STATE: u32 = 0x03;
    pub const CREATE_ADMIN_QUEUE: u32 = 0x04;
    pub const PREPARE_SQ: u32 = 0x05;
    pub const PREPARE_CQ: u32 = 0x06;
    pub const SQ_INFO: u32 = 0x07;
    pub const CQ_INFO: u32 = 0x08;
    pub const SUBMIT: u32 = 0x09;
    pub const RING_DOORBELL: u32 = 0x0a;
    pub const INQUIRE: u32 = 0x0b;
    pub const REAP: u32 = 0x0c;
    pub const SET_INTERRUPTS: u32 = 0x0d;
    pub const MASK_LINE: u32 = 0x0e;
    pub const UNMASK_LINE: u32 = 0x0f;
    pub const LINE_INFO: u32 = 0x10;
    pub const CREATE_META_POOL: u32 = 0x11;
    pub const CREATE_META: u32 = 0x12;
    pub const DELETE_META: u32 = 0x13;
    pub const DROP_OUTSTANDING: u32 = 0x14;
    pub const RELEASE_SQ: u32 = 0x15;
    pub const RELEASE_CQ: u32 = 0x16;
    pub const FLUSH_INTERRUPTS: u32 = 0x17;
}

/// `READ_REGISTER` / `WRITE_REGISTER`. `value` is written back on read.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RegisterParams {
    pub offset: u64,
    pub value: u64,
    /// 4 or 8.
    pub width: u32,
    pub _pad: u32,
}

/// `SET_STATE`: `state` is the raw [`ControllerState`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StateParams {
    pub state: u32,
    pub _pad: u32,
}

/// `CREATE_ADMIN_QUEUE`: `kind` 0 is the submission queue, 1 the completion
/// queue.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AdminQueueParams {
    pub kind: u32,
    pub elements: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PrepareSqParams {
    pub elements: u32,
    pub id: u16,
    pub cq_id: u16,
    pub contiguous: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PrepareCqParams {
    pub elements: u32,
    pub id: u16,
    pub irq_line: u16,
    pub contiguous: u32,
    pub irq_enabled: u32,
}

/// `SUBMIT`. `data_len == 0` means no data buffer. The assigned command id is
/// the return value.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SubmitParams {
    pub command: [u8; COMMAND_SIZE],
    pub data_addr: u64,
    pub data_len: u64,
    /// Array of `bit_bucket_count` [`BitBucketParams`] in user memory.
    pub bit_buckets_addr: u64,
    pub sqid: u16,
    pub _pad: u16,
    pub direction: u32,
    /// Raw [`DescriptorCaps`] bits.
    pub caps: u32,
    pub meta_id: u32,
    pub bit_bucket_count: u32,
    pub _pad2: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BitBucketParams {
    pub offset: u32,
    pub length: u32,
}

/// Requests naming one queue. `value` carries the count back from
/// `INQUIRE` and `DROP_OUTSTANDING`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct QueueParams {
    pub id: u16,
    pub _pad: u16,
    pub value: u32,
}

/// `REAP`. Entries are copied to `buffer_addr`. With `blocking` set the call
/// waits for exactly `max_count` entries (0 reaps nothing); a negative
/// `timeout_ms` waits forever. Buffer space past one full ring is ignored.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ReapParams {
    pub buffer_addr: u64,
    pub buffer_len: u32,
    pub cqid: u16,
    pub _pad: u16,
    pub max_count: u32,
    pub timeout_ms: i32,
    pub blocking: u32,
    pub reaped: u32,
    pub remaining: u32,
    /// Bit 0: the line was fired; bit 1: the fired flag was cleared.
    pub line_flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct InterruptParams {
    /// Raw [`InterruptScheme`].
    pub scheme: u32,
    pub count: u16,
    pub _pad: u16,
}

/// `MASK_LINE`, `UNMASK_LINE`, `LINE_INFO`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LineParams {
    pub line: u16,
    pub _pad: u16,
    pub fired: u32,
    pub fire_count: u64,
    pub vector: u32,
    pub bound_count: u32,
}

/// Metadata requests. `size` is read by `CREATE_META_POOL`; `paddr` is
/// written by `CREATE_META`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MetaParams {
    pub id: u32,
    pub size: u32,
    pub paddr: u64,
}

pub const QUEUE_FLAG_CONTIGUOUS: u32 = 1 << 0;
pub const QUEUE_FLAG_CREATED: u32 = 1 << 1;
pub const SQ_FLAG_FULL: u32 = 1 << 2;
pub const CQ_FLAG_PHASE: u32 = 1 << 2;
pub const CQ_FLAG_IRQ: u32 = 1 << 3;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SqInfoParams {
    pub id: u16,
    pub cq_id: u16,
    pub elements: u32,
    pub head: u32,
    pub tail_virt: u32,
    pub tail_hw: u32,
    pub outstanding: u32,
    pub flags: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CqInfoParams {
    pub id: u16,
    pub irq_line: u16,
    pub elements: u32,
    pub head: u32,
    pub tail: u32,
    pub flags: u32,
}

fn read_params<T: Pod>(params: &[u8]) -> Result<T> {
    let bytes = params.get(..size_of::<T>()).ok_or_else(|| {
        Error::invalid(format!(
            "parameter block of {} bytes, expected {}",
            params.len(),
            size_of::<T>()
        ))
    })?;
    bytemuck::try_pod_read_unaligned(bytes)
        .map_err(|err| Error::invalid(format!("malformed parameter block: {err}")))
}

fn write_params<T: Pod>(params: &mut [u8], value: &T) {
    let bytes = bytemuck::bytes_of(value);
    params[..bytes.len()].copy_from_slice(bytes);
}

fn flag(set: bool, bit: u32) -> u32 {
    if set {
        bit
    } else {
        0
    }
}

/// Execute one control request against `device`.
pub fn dispatch(device: &Device, code: u32, params: &mut [u8]) -> i64 {
    trace!(code, len = params.len(), "control request");
    match route(device, code, params) {
        Ok(value) => value,
        Err(err) => {
            debug!(code, %err, "control request failed");
            i64::from(err.errno())
        }
    }
}

fn route(device: &Device, code: u32, params: &mut [u8]) -> Result<i64> {
    match code {
        code::READ_REGISTER => {
            let mut p: RegisterParams = read_params(params)?;
            p.value = device.read_register(p.offset, p.width)?;
            write_params(params, &p);
            Ok(0)
        }
        code::WRITE_REGISTER => {
            let p: RegisterParams = read_params(params)?;
            device.write_register(p.offset, p.width, p.value)?;
            Ok(0)
        }
        code::SET_STATE => {
            let p: StateParams = read_params(params)?;
            let state = ControllerState::from_raw(p.state)
                .ok_or_else(|| Error::invalid(format!("unknown controller state {}", p.state)))?;
            device.set_state(state)?;
            Ok(0)
        }
        code::CREATE_ADMIN_QUEUE => {
            let p: AdminQueueParams = read_params(params)?;
            let kind = match p.kind {
                0 => QueueKind::Submission,
                1 => QueueKind::Completion,
                other => return Err(Error::invalid(format!("unknown queue kind {other}"))),
            };
            device.create_admin_queue(kind, p.elements)?;
            Ok(0)
        }
        code::PREPARE_SQ => {
            let p: PrepareSqParams = read_params(params)?;
            device.prepare_sq(PrepareSq {
                id: p.id,
                cq_id: p.cq_id,
                elements: p.elements,
                contiguous: p.contiguous != 0,
            })?;
            Ok(0)
        }
        code::PREPARE_CQ => {
            let p: PrepareCqParams = read_params(params)?;
            device.prepare_cq(PrepareCq {
                id: p.id,
                elements: p.elements,
                contiguous: p.contiguous != 0,
                irq: (p.irq_enabled != 0).then_some(p.irq_line),
            })?;
            Ok(0)
        }
        code::SQ_INFO => {
            let mut p: SqInfoParams = read_params(params)?;
            let info = device.sq_info(p.id)?;
            p = SqInfoParams {
                id: info.id,
                cq_id: info.cq_id,
                elements: info.elements,
                head: info.head,
                tail_virt: info.tail_virt,
                tail_hw: info.tail_hw,
                outstanding: info.outstanding as u32,
                flags: flag(info.contiguous, QUEUE_FLAG_CONTIGUOUS)
                    | flag(info.state == QueueState::Created, QUEUE_FLAG_CREATED)
                    | flag(info.full, SQ_FLAG_FULL),
                _pad: 0,
            };
            write_params(params, &p);
            Ok(0)
        }
        code::CQ_INFO => {
            let mut p: CqInfoParams = read_params(params)?;
            let info = device.cq_info(p.id)?;
            p = CqInfoParams {
                id: info.id,
                irq_line: info.irq_line.unwrap_or_default(),
                elements: info.elements,
                head: info.head,
                tail: info.tail,
                flags: flag(info.contiguous, QUEUE_FLAG_CONTIGUOUS)
                    | flag(info.state == QueueState::Created, QUEUE_FLAG_CREATED)
                    | flag(info.phase, CQ_FLAG_PHASE)
                    | flag(info.irq_enabled, CQ_FLAG_IRQ),
            };
            write_params(params, &p);
            Ok(0)
        }
        code::SUBMIT => {
            let p: SubmitParams = read_params(params)?;
            let req = submit_request(device, &p)?;
            Ok(i64::from(device.submit(&req)?))
        }
        code::RING_DOORBELL => {
            let p: QueueParams = read_params(params)?;
            device.ring_doorbell(p.id)?;
            Ok(0)
        }
        code::INQUIRE => {
            let mut p: QueueParams = read_params(params)?;
            p.value = device.inquire(p.id)?;
            write_params(params, &p);
            Ok(i64::from(p.value))
        }
        code::REAP => reap(device, params),
        code::SET_INTERRUPTS => {
            let p: InterruptParams = read_params(params)?;
            let scheme = InterruptScheme::from_raw(p.scheme)
                .ok_or_else(|| Error::invalid(format!("unknown interrupt scheme {}", p.scheme)))?;
            device.set_interrupts(scheme, p.count)?;
            Ok(0)
        }
        code::MASK_LINE => {
            let p: LineParams = read_params(params)?;
            device.mask_line(p.line)?;
            Ok(0)
        }
        code::UNMASK_LINE => {
            let p: LineParams = read_params(params)?;
            device.unmask_line(p.line)?;
            Ok(0)
        }
        code::LINE_INFO => {
            let mut p: LineParams = read_params(params)?;
            let info = device.line_info(p.line)?;
            p.fired = u32::from(info.fired);
            p.fire_count = info.fire_count;
            p.vector = info.vector;
            p.bound_count = info.bound_cqs.len() as u32;
            write_params(params, &p);
            Ok(0)
        }
        code::FLUSH_INTERRUPTS => {
            device.flush_interrupt_work()?;
            Ok(0)
        }
        code::CREATE_META_POOL => {
            let p: MetaParams = read_params(params)?;
            device.create_meta_pool(p.size)?;
            Ok(0)
        }
        code::CREATE_META => {
            let mut p: MetaParams = read_params(params)?;
            p.paddr = device.create_meta(p.id)?;
            write_params(params, &p);
            Ok(0)
        }
        code::DELETE_META => {
            let p: MetaParams = read_params(params)?;
            device.delete_meta(p.id);
            Ok(0)
        }
        code::DROP_OUTSTANDING => {
            let mut p: QueueParams = read_params(params)?;
            p.value = device.drop_outstanding(p.id)? as u32;
            write_params(params, &p);
            Ok(i64::from(p.value))
        }
        code::RELEASE_SQ => {
            let p: QueueParams = read_params(params)?;
            device.release_sq(p.id);
            Ok(0)
        }
        code::RELEASE_CQ => {
            let p: QueueParams = read_params(params)?;
            device.release_cq(p.id);
            Ok(0)
        }
        other => Err(Error::invalid(format!("unknown control request {other:#x}"))),
    }
}

fn submit_request(device: &Device, p: &SubmitParams) -> Result<SubmitRequest> {
    let direction = DataDirection::from_raw(p.direction)
        .ok_or_else(|| Error::invalid(format!("unknown data direction {}", p.direction)))?;
    let caps = DescriptorCaps::from_bits(p.caps)
        .ok_or_else(|| Error::invalid(format!("unknown descriptor capability bits {:#x}", p.caps)))?;

    let mut req = SubmitRequest::new(p.sqid, CommandBytes(p.command)).with_caps(caps);
    if p.data_len != 0 {
        req = req.with_data(
            UserBuffer {
                addr: p.data_addr,
                len: p.data_len as usize,
            },
            direction,
        );
    }
    if caps.contains(DescriptorCaps::MPTR) {
        req = req.with_metadata(p.meta_id);
    }
    if p.bit_bucket_count != 0 {
        // Buckets are non-empty and disjoint, so each needs a byte of data.
        if u64::from(p.bit_bucket_count) > p.data_len {
            return Err(Error::invalid(format!(
                "{} bit buckets cannot fit a {}-byte buffer",
                p.bit_bucket_count, p.data_len
            )));
        }
        let raw = read_bit_buckets(device, p.bit_buckets_addr, p.bit_bucket_count as usize)?;
        req = req.with_bit_buckets(
            raw.iter()
                .map(|b| BitBucket {
                    offset: b.offset,
                    length: b.length,
                })
                .collect(),
        );
    }
    Ok(req)
}

/// Copy the bucket list in page-sized batches so a bogus count fails on
/// unmapped user memory before it is allocated in full.
fn read_bit_buckets(device: &Device, addr: u64, count: usize) -> Result<Vec<BitBucketParams>> {
    const BATCH: usize = 4096 / size_of::<BitBucketParams>();
    let mut raw = Vec::new();
    while raw.len() < count {
        let start = raw.len();
        raw.resize(start + BATCH.min(count - start), BitBucketParams::default());
        let offset = (start * size_of::<BitBucketParams>()) as u64;
        device
            .platform()
            .copy_from_user(addr + offset, bytemuck::cast_slice_mut(&mut raw[start..]))
            .map_err(|err| Error::invalid(format!("reading bit buckets: {err}")))?;
    }
    Ok(raw)
}

fn reap(device: &Device, params: &mut [u8]) -> Result<i64> {
    let mut p: ReapParams = read_params(params)?;
    let (entry_size, elements) = device.cq_geometry(p.cqid)?;
    let len = (p.buffer_len as usize).min(entry_size * elements as usize);
    let mut entries = vec![0u8; len];
    let result = if p.blocking != 0 {
        let timeout = u64::try_from(p.timeout_ms).ok().map(Duration::from_millis);
        device.reap_blocking(p.cqid, p.max_count, &mut entries, timeout)
    } else {
        device.reap(p.cqid, p.max_count, &mut entries)
    };

    let (reaped, outcome) = match &result {
        Ok(outcome) => (outcome.reaped, Some(*outcome)),
        Err(err) => (err.partial_count().unwrap_or(0), None),
    };
    if reaped != 0 {
        let len = reaped as usize * entry_size;
        device
            .platform()
            .copy_to_user(p.buffer_addr, &entries[..len])
            .map_err(|err| Error::invalid(format!("writing reaped entries: {err}")))?;
    }

    let ReapOutcome {
        remaining, line, ..
    } = outcome.unwrap_or(ReapOutcome {
        reaped,
        remaining: 0,
        line: None,
    });
    p.reaped = reaped;
    p.remaining = remaining;
    p.line_flags = line.map_or(0, |settle| {
        flag(settle.was_fired, 1) | flag(settle.cleared, 2)
    });
    write_params(params, &p);
    result.map(|_| i64::from(reaped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_blocks_have_fixed_sizes() {
        assert_eq!(size_of::<RegisterParams>(), 24);
        assert_eq!(size_of::<StateParams>(), 8);
        assert_eq!(size_of::<AdminQueueParams>(), 8);
        assert_eq!(size_of::<PrepareSqParams>(), 12);
        assert_eq!(size_of::<PrepareCqParams>(), 16);
        assert_eq!(size_of::<SubmitParams>(), 112);
        assert_eq!(size_of::<BitBucketParams>(), 8);
        assert_eq!(size_of::<QueueParams>(), 8);
        assert_eq!(size_of::<ReapParams>(), 40);
        assert_eq!(size_of::<InterruptParams>(), 8);
        assert_eq!(size_of::<LineParams>(), 24);
        assert_eq!(size_of::<MetaParams>(), 16);
        assert_eq!(size_of::<SqInfoParams>(), 32);
        assert_eq!(size_of::<CqInfoParams>(), 20);
    }

    #[test]
    fn short_block_is_rejected() {
        let err = read_params::<RegisterParams>(&[0u8; 8]).unwrap_err();
        assert_eq!(err.errno(), -22);
    }

    #[test]
    fn blocks_read_from_unaligned_bytes() {
        let p = QueueParams {
            id: 7,
            _pad: 0,
            value: 0x1234,
        };
        let mut bytes = vec![0u8; 1 + size_of::<QueueParams>()];
        bytes[1..].copy_from_slice(bytemuck::bytes_of(&p));
        let back: QueueParams = read_params(&bytes[1..]).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn write_back_leaves_trailing_bytes() {
        let mut bytes = [0xffu8; 12];
        write_params(
            &mut bytes,
            &StateParams {
                state: 2,
                _pad: 0,
            },
        );
        assert_eq!(&bytes[..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..], &[0xff; 4]);
    }
}
