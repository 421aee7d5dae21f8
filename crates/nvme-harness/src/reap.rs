//! Completion inquiry and reaping.
//!
//! An entry is new when its phase tag matches the phase the host expects at
//! that slot. The expected phase starts at 1 and flips each time the head
//! wraps.

use tracing::{debug, error, warn};

use crate::command::{admin, CompletionEntry, COMPLETION_SIZE};
use crate::device::DeviceState;
use crate::error::{Error, Result};
use crate::irq::{InterruptScheme, LineSettle};
use crate::platform::MemoryBus;
use crate::queue::{CompletionQueue, QueueState, ADMIN_QID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapOutcome {
    pub reaped: u32,
    /// Entries still ready after this reap.
    pub remaining: u32,
    /// Present when the queue drained and its interrupt line was settled.
    pub line: Option<LineSettle>,
}

/// Count the entries ready from `head` onward. Scans at most `elements`
/// slots; a result equal to `elements` means the controller overran the ring.
pub(crate) fn scan_ready(
    head: u32,
    phase: bool,
    elements: u32,
    mut phase_at: impl FnMut(u32) -> Result<bool>,
) -> Result<u32> {
    let mut index = head;
    let mut expected = phase;
    let mut count = 0;
    while count < elements {
        if phase_at(index)? != expected {
            break;
        }
        count += 1;
        index += 1;
        if index == elements {
            index = 0;
            expected = !expected;
        }
    }
    Ok(count)
}

/// Head and expected phase after consuming `count` entries.
pub(crate) fn advance(head: u32, phase: bool, count: u32, elements: u32) -> (u32, bool) {
    let next = head + count;
    if next >= elements {
        (next - elements, !phase)
    } else {
        (next, phase)
    }
}

fn count_ready(cq: &CompletionQueue, bus: &dyn MemoryBus) -> Result<u32> {
    scan_ready(cq.head, cq.phase, cq.elements, |index| {
        Ok(cq.read_status(bus, index)? & 1 != 0)
    })
}

impl DeviceState {
    /// Number of completions ready on `cqid`. Records the boundary as the
    /// queue's trial tail; nothing is committed to hardware.
    pub(crate) fn inquire(&mut self, cqid: u16) -> Result<u32> {
        let bus = self.platform.clone();
        let cq = self.queues.cq_mut(cqid)?;
        let ready = count_ready(cq, bus.as_ref())?;
        if ready >= cq.elements {
            error!(cqid, elements = cq.elements, "completion queue overrun");
            return Err(Error::ProtocolViolation(format!(
                "completion queue {cqid} reports every one of its {} slots ready",
                cq.elements
            )));
        }
        cq.tail = (cq.head + ready) % cq.elements;
        Ok(ready)
    }

    pub(crate) fn reap(&mut self, cqid: u16, max_count: u32, out: &mut [u8]) -> Result<ReapOutcome> {
        let bus = self.platform.clone();
        let (entry_size, head, elements) = {
            let cq = self.queues.cq(cqid)?;
            (cq.entry_size(), cq.head, cq.elements)
        };
        let capacity = (out.len() / entry_size) as u32;
        if capacity == 0 {
            return Err(Error::invalid(format!(
                "reap buffer of {} bytes holds no {entry_size}-byte entry",
                out.len()
            )));
        }
        let expect = match max_count {
            0 => capacity,
            n => n.min(capacity),
        };
        let ready = self.inquire(cqid)?;
        let wanted = expect.min(ready);

        let mut reaped = 0;
        let mut failure = None;
        for n in 0..wanted {
            let slot = &mut out[n as usize * entry_size..(n as usize + 1) * entry_size];
            let index = (head + n) % elements;
            if let Err(err) = self.queues.cq(cqid)?.read_entry(bus.as_ref(), index, slot) {
                warn!(cqid, index, reaped, %err, "completion entry unreadable");
                failure = Some(err);
                break;
            }
            reaped += 1;

            let mut raw = [0u8; COMPLETION_SIZE];
            raw.copy_from_slice(&slot[..COMPLETION_SIZE]);
            let entry = CompletionEntry::parse(&raw);
            if let Err(err) = self.complete(entry) {
                if err.is_protocol_violation() {
                    error!(cqid, sqid = entry.sq_id, cid = entry.cid, %err, "completion rejected");
                } else {
                    warn!(cqid, sqid = entry.sq_id, cid = entry.cid, %err, "completion rejected");
                }
                failure = Some(err);
                break;
            }
        }

        let (remaining, line) = {
            let cq = self.queues.cq_mut(cqid)?;
            let (new_head, new_phase) = advance(cq.head, cq.phase, reaped, cq.elements);
            cq.head = new_head;
            cq.phase = new_phase;
            bus.write32(cq.doorbell, new_head);
            (ready - reaped, cq.irq)
        };
        debug!(cqid, reaped, remaining, "completions reaped");

        let line = match line {
            Some(line) if remaining == 0 && self.irq.scheme() != InterruptScheme::None => {
                let queues = &self.queues;
                self.irq.settle(line, |bound| {
                    bound.iter().all(|id| {
                        queues
                            .cq(*id)
                            .and_then(|cq| count_ready(cq, bus.as_ref()))
                            .map_or(true, |ready| ready == 0)
                    })
                })
            }
            _ => None,
        };

        match failure {
            Some(source) => Err(Error::PartialReap {
                reaped,
                source: Box::new(source),
            }),
            None => Ok(ReapOutcome {
                reaped,
                remaining,
                line,
            }),
        }
    }

    /// Retire the command a completion names and apply its host-side
    /// effects.
    fn complete(&mut self, entry: CompletionEntry) -> Result<()> {
        let sq = self
            .queues
            .sqs
            .get_mut(&entry.sq_id)
            .ok_or(Error::BadSlot {
                sqid: entry.sq_id,
                cid: None,
            })?;
        if u32::from(entry.sq_head) >= sq.elements {
            return Err(Error::ProtocolViolation(format!(
                "completion reports SQ {} head {} past its {} entries",
                entry.sq_id, entry.sq_head, sq.elements
            )));
        }
        sq.head = u32::from(entry.sq_head);
        let cmd = sq.tracker.take(entry.cid).ok_or(Error::BadSlot {
            sqid: entry.sq_id,
            cid: Some(entry.cid),
        })?;

        match cmd.target {
            Some(target) if entry.sq_id == ADMIN_QID => {
                self.apply_queue_command(cmd.opcode, target, entry.succeeded())
            }
            _ => Ok(()),
        }
    }

    fn apply_queue_command(&mut self, opcode: u8, target: u16, succeeded: bool) -> Result<()> {
        match (opcode, succeeded) {
            (admin::CREATE_SQ, true) => match self.queues.sqs.get_mut(&target) {
                Some(sq) => sq.state = QueueState::Created,
                None => warn!(sqid = target, "created SQ has no host-side queue"),
            },
            (admin::CREATE_CQ, true) => match self.queues.cqs.get_mut(&target) {
                Some(cq) => cq.state = QueueState::Created,
                None => warn!(cqid = target, "created CQ has no host-side queue"),
            },
            (admin::CREATE_SQ, false) => {
                self.queues.release_sq(target);
            }
            (admin::CREATE_CQ, false) => {
                self.release_cq(target);
            }
            (admin::DELETE_SQ | admin::DELETE_CQ, true) if target == ADMIN_QID => {
                return Err(Error::invalid("controller acknowledged deleting the admin queue"));
            }
            (admin::DELETE_SQ, true) => {
                self.queues.release_sq(target);
            }
            (admin::DELETE_CQ, true) => {
                self.release_cq(target);
            }
            (_, false) => debug!(opcode, target, "queue deletion failed; queue kept"),
            _ => {}
        }
        Ok(())
    }
}
