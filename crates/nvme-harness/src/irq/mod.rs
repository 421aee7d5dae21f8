//! Interrupt delivery: scheme configuration, line masking, the top half and
//! the deferred bottom half.
//!
//! Lock order is device state first, then the line table. The line table lock
//! is never held across a call into the platform's masking or vector
//! management, because a platform may deliver a pending interrupt (and so run
//! the top half on the calling thread) as soon as a line is unmasked.

mod worker;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use crate::config::HarnessConfig;
use crate::error::{Error, Object, Result};
use crate::platform::{IrqHandler, IrqReturn, SharedPlatform};
use crate::regs;

use worker::{Work, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptScheme {
    MsiSingle,
    MsiMulti,
    MsiX,
    Pin,
    None,
}

impl InterruptScheme {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => InterruptScheme::MsiSingle,
            1 => InterruptScheme::MsiMulti,
            2 => InterruptScheme::MsiX,
            3 => InterruptScheme::Pin,
            4 => InterruptScheme::None,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> u32 {
        match self {
            InterruptScheme::MsiSingle => 0,
            InterruptScheme::MsiMulti => 1,
            InterruptScheme::MsiX => 2,
            InterruptScheme::Pin => 3,
            InterruptScheme::None => 4,
        }
    }

    /// Lines share the INTMS/INTMC mask registers.
    fn uses_mask_registers(self) -> bool {
        matches!(
            self,
            InterruptScheme::Pin | InterruptScheme::MsiSingle | InterruptScheme::MsiMulti
        )
    }

    fn line_limit(self, config: &HarnessConfig) -> u16 {
        match self {
            InterruptScheme::Pin | InterruptScheme::MsiSingle => 1,
            InterruptScheme::MsiMulti => config.msi_multi_max_lines,
            InterruptScheme::MsiX => config.msix_max_lines,
            InterruptScheme::None => 0,
        }
    }
}

/// Snapshot of one interrupt line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub id: u16,
    pub vector: u32,
    pub fired: bool,
    pub fire_count: u64,
    pub bound_cqs: Vec<u16>,
}

#[derive(Debug)]
struct Line {
    vector: u32,
    fired: bool,
    fire_count: u64,
    bound: BTreeSet<u16>,
    /// A bottom half for this line is queued and has not run yet.
    work_pending: bool,
}

#[derive(Debug)]
struct LineTable {
    scheme: InterruptScheme,
    lines: BTreeMap<u16, Line>,
    by_vector: HashMap<u32, u16>,
    work: Option<SyncSender<Work>>,
}

/// State reachable from interrupt context.
pub(crate) struct IrqShared {
    table: Mutex<LineTable>,
    platform: SharedPlatform,
}

impl IrqShared {
    fn lock(&self) -> MutexGuard<'_, LineTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn top_half(&self, vector: u32) -> IrqReturn {
        let (line, scheme, work) = {
            let mut table = self.lock();
            let Some(&line) = table.by_vector.get(&vector) else {
                warn!(vector, "spurious interrupt");
                return IrqReturn::None;
            };
            let scheme = table.scheme;
            let sender = table.work.clone();
            let Some(state) = table.lines.get_mut(&line) else {
                return IrqReturn::None;
            };
            let enqueue = !state.work_pending;
            state.work_pending = true;
            (line, scheme, sender.filter(|_| enqueue))
        };

        set_line_mask(&self.platform, scheme, line, true);

        if let Some(tx) = work {
            if let Err(err) = tx.try_send(Work::Fired(line)) {
                warn!(line, %err, "dropping interrupt work");
                if let Some(state) = self.lock().lines.get_mut(&line) {
                    state.work_pending = false;
                }
            }
        }
        IrqReturn::Handled
    }

    fn bottom_half(&self, line: u16) {
        let mut table = self.lock();
        match table.lines.get_mut(&line) {
            Some(state) => {
                state.work_pending = false;
                state.fired = true;
                state.fire_count += 1;
                debug!(line, count = state.fire_count, "interrupt line fired");
            }
            None => debug!(line, "interrupt work for a line that is gone"),
        }
    }
}

/// Registered with the platform for every vector.
struct TopHalf {
    shared: Weak<IrqShared>,
}

impl IrqHandler for TopHalf {
    fn handle(&self, vector: u32) -> IrqReturn {
        match self.shared.upgrade() {
            Some(shared) => shared.top_half(vector),
            None => IrqReturn::None,
        }
    }
}

fn set_line_mask(platform: &SharedPlatform, scheme: InterruptScheme, line: u16, masked: bool) {
    match scheme {
        InterruptScheme::None => {}
        InterruptScheme::MsiX => platform.set_msix_mask(line, masked),
        _ => {
            let bit = 1u32.checked_shl(line as u32).unwrap_or(0);
            platform.write32(if masked { regs::INTMS } else { regs::INTMC }, bit);
        }
    }
}

/// What a reap learned about the line serving its completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettle {
    /// The fired flag was set when the queue drained.
    pub was_fired: bool,
    /// Every queue bound to the line was empty, so the flag was cleared.
    pub cleared: bool,
}

/// Owned by the device state; every method runs under the device lock.
pub(crate) struct InterruptEngine {
    shared: Arc<IrqShared>,
    worker: Option<Worker>,
}

impl InterruptEngine {
    pub fn new(platform: SharedPlatform) -> Self {
        Self {
            shared: Arc::new(IrqShared {
                table: Mutex::new(LineTable {
                    scheme: InterruptScheme::None,
                    lines: BTreeMap::new(),
                    by_vector: HashMap::new(),
                    work: None,
                }),
                platform,
            }),
            worker: None,
        }
    }

    pub fn scheme(&self) -> InterruptScheme {
        self.shared.lock().scheme
    }

    /// Replace the active scheme. All-or-nothing: on failure no scheme is
    /// active.
    pub fn configure(
        &mut self,
        scheme: InterruptScheme,
        count: u16,
        config: &HarnessConfig,
    ) -> Result<()> {
        self.teardown();
        if scheme == InterruptScheme::None {
            return Ok(());
        }

        let limit = scheme.line_limit(config);
        if count == 0 || count > limit {
            return Err(Error::invalid(format!(
                "{scheme:?} supports 1..={limit} lines, asked for {count}"
            )));
        }
        let platform = self.shared.platform.clone();
        let advertised = platform.max_lines(scheme);
        if advertised == 0 {
            return Err(Error::Unsupported(format!("{scheme:?} interrupts")));
        }
        if count > advertised {
            return Err(Error::invalid(format!(
                "device advertises {advertised} {scheme:?} lines, asked for {count}"
            )));
        }

        let vectors = platform.enable_interrupts(scheme, count)?;
        if vectors.len() != count as usize {
            platform.disable_interrupts(scheme);
            return Err(Error::ResourceExhausted(format!(
                "platform granted {} of {count} vectors",
                vectors.len()
            )));
        }

        if scheme == InterruptScheme::MsiX {
            if let Some(entry) = (0..count).find(|&entry| platform.msix_pending(entry)) {
                platform.disable_interrupts(scheme);
                return Err(Error::invalid(format!(
                    "MSI-X entry {entry} has its pending bit set"
                )));
            }
            for entry in 0..count {
                platform.set_msix_mask(entry, true);
            }
        } else {
            platform.write32(regs::INTMC, u32::MAX);
        }

        let depth = match config.irq_work_queue_depth {
            0 => count as usize,
            n => n,
        };
        let (worker, sender) = match Worker::spawn(self.shared.clone(), depth + 1) {
            Ok(spawned) => spawned,
            Err(err) => {
                platform.disable_interrupts(scheme);
                return Err(err);
            }
        };
        self.worker = Some(worker);

        {
            let mut table = self.shared.lock();
            table.scheme = scheme;
            table.work = Some(sender);
            for (id, &vector) in vectors.iter().enumerate() {
                let id = id as u16;
                let mut bound = BTreeSet::new();
                if id == 0 {
                    bound.insert(0);
                }
                table.lines.insert(
                    id,
                    Line {
                        vector,
                        fired: false,
                        fire_count: 0,
                        bound,
                        work_pending: false,
                    },
                );
                table.by_vector.insert(vector, id);
            }
        }

        let handler: Arc<dyn IrqHandler> = Arc::new(TopHalf {
            shared: Arc::downgrade(&self.shared),
        });
        let mut requested = Vec::with_capacity(vectors.len());
        for &vector in &vectors {
            if let Err(err) = platform.request_irq(vector, handler.clone()) {
                for &done in &requested {
                    platform.free_irq(done);
                }
                self.finish_teardown(scheme);
                return Err(err.into());
            }
            requested.push(vector);
        }

        debug!(?scheme, count, "interrupts configured");
        Ok(())
    }

    /// Tear down the active scheme, if any.
    pub fn teardown(&mut self) {
        let (scheme, vectors) = {
            let table = self.shared.lock();
            (table.scheme, table.lines.values().map(|l| l.vector).collect::<Vec<_>>())
        };
        if scheme == InterruptScheme::None && self.worker.is_none() {
            return;
        }
        let platform = self.shared.platform.clone();
        for &vector in &vectors {
            platform.free_irq(vector);
        }
        self.finish_teardown(scheme);
    }

    /// Forget every line, stop the worker and return the vectors to the
    /// platform. Handlers must already be freed.
    fn finish_teardown(&mut self, scheme: InterruptScheme) {
        let platform = self.shared.platform.clone();
        let sender = {
            let mut table = self.shared.lock();
            table.scheme = InterruptScheme::None;
            table.lines.clear();
            table.by_vector.clear();
            table.work.take()
        };
        drop(sender);
        if scheme != InterruptScheme::None {
            platform.disable_interrupts(scheme);
            if scheme.uses_mask_registers() {
                platform.write32(regs::INTMS, u32::MAX);
            }
        }
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
        debug!(?scheme, "interrupts torn down");
    }

    fn line_scheme(&self, line: u16) -> Result<InterruptScheme> {
        let table = self.shared.lock();
        if !table.lines.contains_key(&line) {
            return Err(Error::not_found(Object::InterruptLine, line));
        }
        Ok(table.scheme)
    }

    pub fn mask(&self, line: u16) -> Result<()> {
        let scheme = self.line_scheme(line)?;
        set_line_mask(&self.shared.platform, scheme, line, true);
        Ok(())
    }

    pub fn unmask(&self, line: u16) -> Result<()> {
        let scheme = self.line_scheme(line)?;
        set_line_mask(&self.shared.platform, scheme, line, false);
        Ok(())
    }

    /// Check that `cq` may be bound to `line` under the active scheme.
    pub fn check_bindable(&self, line: u16, cq: u16) -> Result<()> {
        let table = self.shared.lock();
        let Some(state) = table.lines.get(&line) else {
            return Err(Error::not_found(Object::InterruptLine, line));
        };
        if table.scheme == InterruptScheme::MsiX && state.bound.iter().any(|&other| other != cq) {
            return Err(Error::invalid(format!(
                "MSI-X line {line} already serves completion queue {}",
                state.bound.iter().next().copied().unwrap_or_default()
            )));
        }
        Ok(())
    }

    pub fn bind(&self, line: u16, cq: u16) {
        if let Some(state) = self.shared.lock().lines.get_mut(&line) {
            state.bound.insert(cq);
        }
    }

    pub fn unbind(&self, line: u16, cq: u16) {
        if let Some(state) = self.shared.lock().lines.get_mut(&line) {
            state.bound.remove(&cq);
        }
    }

    /// Called once a reap leaves an interrupt-driven queue empty: clear the
    /// line's fired flag if none of its queues hold entries, then unmask it.
    ///
    /// `bound_empty` runs under the line table lock.
    pub fn settle(
        &self,
        line: u16,
        bound_empty: impl Fn(&BTreeSet<u16>) -> bool,
    ) -> Option<LineSettle> {
        let (scheme, settle) = {
            let mut table = self.shared.lock();
            let scheme = table.scheme;
            let Some(state) = table.lines.get_mut(&line) else {
                warn!(line, "completion queue bound to a line that no longer exists");
                return None;
            };
            let was_fired = state.fired;
            let cleared = bound_empty(&state.bound);
            if cleared {
                state.fired = false;
            }
            (scheme, LineSettle { was_fired, cleared })
        };
        set_line_mask(&self.shared.platform, scheme, line, false);
        Some(settle)
    }

    pub fn line_info(&self, line: u16) -> Result<LineInfo> {
        let table = self.shared.lock();
        let state = table
            .lines
            .get(&line)
            .ok_or_else(|| Error::not_found(Object::InterruptLine, line))?;
        Ok(LineInfo {
            id: line,
            vector: state.vector,
            fired: state.fired,
            fire_count: state.fire_count,
            bound_cqs: state.bound.iter().copied().collect(),
        })
    }

    /// Wait until every bottom half queued so far has run.
    pub fn flush(&self) -> Result<()> {
        let sender = self.shared.lock().work.clone();
        match sender {
            Some(tx) => worker::flush(&tx),
            None => Ok(()),
        }
    }
}

impl Drop for InterruptEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_scheme_values_round_trip() {
        for raw in 0..5 {
            let scheme = InterruptScheme::from_raw(raw).unwrap();
            assert_eq!(scheme.as_raw(), raw);
        }
        assert_eq!(InterruptScheme::from_raw(5), None);
    }

    #[test]
    fn line_limits_follow_scheme() {
        let config = HarnessConfig::default();
        assert_eq!(InterruptScheme::Pin.line_limit(&config), 1);
        assert_eq!(InterruptScheme::MsiSingle.line_limit(&config), 1);
        assert_eq!(InterruptScheme::MsiMulti.line_limit(&config), 32);
        assert_eq!(InterruptScheme::MsiX.line_limit(&config), 2048);
    }
}
