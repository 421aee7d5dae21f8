//! Per-submission-queue bookkeeping of commands the controller has not yet
//! completed.

use std::collections::BTreeMap;

use crate::chain::DescriptorChain;

#[derive(Debug)]
pub struct TrackedCommand {
    pub cid: u16,
    pub opcode: u8,
    pub sqid: u16,
    /// Queue targeted by an admin create/delete-queue command.
    pub target: Option<u16>,
    pub chain: Option<DescriptorChain>,
}

#[derive(Debug, Default)]
pub struct CommandTracker {
    commands: BTreeMap<u16, TrackedCommand>,
    next_cid: u16,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id the next command will receive. Ids still outstanding are
    /// skipped; `None` only if all 65536 are in flight.
    pub fn peek_cid(&self) -> Option<u16> {
        let mut cid = self.next_cid;
        for _ in 0..=u16::MAX as u32 {
            if !self.commands.contains_key(&cid) {
                return Some(cid);
            }
            cid = cid.wrapping_add(1);
        }
        None
    }

    /// Record a command whose id came from [`CommandTracker::peek_cid`].
    pub fn insert(&mut self, cmd: TrackedCommand) {
        self.next_cid = cmd.cid.wrapping_add(1);
        self.commands.insert(cmd.cid, cmd);
    }

    pub fn take(&mut self, cid: u16) -> Option<TrackedCommand> {
        self.commands.remove(&cid)
    }

    pub fn get(&self, cid: u16) -> Option<&TrackedCommand> {
        self.commands.get(&cid)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop every outstanding command together with its descriptor chain.
    pub fn clear(&mut self) -> usize {
        let dropped = self.commands.len();
        self.commands.clear();
        dropped
    }

    /// `clear` plus restarting ids from zero.
    pub fn reset(&mut self) -> usize {
        self.next_cid = 0;
        self.clear()
    }

    pub fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.commands.keys().copied()
    }
}
