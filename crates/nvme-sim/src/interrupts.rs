//! Interrupt side of the simulated PCI function: vector allocation, the
//! INTMS/INTMC mask register, the MSI-X table mask bits and pending bits.
//!
//! Nothing here calls a handler. Methods return the vectors that became
//! deliverable so the platform can invoke handlers after dropping its lock.

use std::collections::HashMap;
use std::sync::Arc;

use nvme_harness::platform::IrqHandler;
use nvme_harness::{InterruptScheme, PlatformError};

const VECTOR_BASE: u32 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptCaps {
    pub pin: bool,
    pub msi_single: bool,
    pub msi_multi_lines: u16,
    pub msix_lines: u16,
}

impl Default for InterruptCaps {
    fn default() -> Self {
        Self {
            pin: true,
            msi_single: true,
            msi_multi_lines: 8,
            msix_lines: 16,
        }
    }
}

#[derive(Default)]
pub(crate) struct Interrupts {
    pub(crate) caps: InterruptCaps,
    scheme: Option<InterruptScheme>,
    vectors: Vec<u32>,
    handlers: HashMap<u32, Arc<dyn IrqHandler>>,
    /// INTMS/INTMC state, one bit per line for pin and MSI.
    intms: u32,
    msix_masked: Vec<bool>,
    pending: Vec<bool>,
    /// Forced PBA bits, for exercising the configure-time check.
    pub(crate) stale_pending: Vec<u16>,
    delivered: HashMap<u32, u64>,
    next_vector: u32,
}

impl Interrupts {
    pub(crate) fn new(caps: InterruptCaps) -> Self {
        Self {
            caps,
            next_vector: VECTOR_BASE,
            ..Self::default()
        }
    }

    pub(crate) fn max_lines(&self, scheme: InterruptScheme) -> u16 {
        match scheme {
            InterruptScheme::Pin => u16::from(self.caps.pin),
            InterruptScheme::MsiSingle => u16::from(self.caps.msi_single),
            InterruptScheme::MsiMulti => self.caps.msi_multi_lines,
            InterruptScheme::MsiX => self.caps.msix_lines,
            InterruptScheme::None => 0,
        }
    }

    pub(crate) fn enable(
        &mut self,
        scheme: InterruptScheme,
        count: u16,
    ) -> Result<Vec<u32>, PlatformError> {
        if self.scheme.is_some() {
            return Err(PlatformError::Unsupported("interrupts already enabled"));
        }
        if count == 0 || count > self.max_lines(scheme) {
            return Err(PlatformError::Unsupported("line count not supported"));
        }
        // Fresh vectors each time so stale handlers can never match.
        self.vectors = (0..u32::from(count)).map(|n| self.next_vector + n).collect();
        self.next_vector += u32::from(count);
        self.scheme = Some(scheme);
        self.msix_masked = vec![false; count as usize];
        self.pending = vec![false; count as usize];
        for &entry in &self.stale_pending {
            if let Some(bit) = self.pending.get_mut(entry as usize) {
                *bit = true;
            }
        }
        Ok(self.vectors.clone())
    }

    pub(crate) fn disable(&mut self) {
        self.scheme = None;
        self.vectors.clear();
        self.msix_masked.clear();
        self.pending.clear();
    }

    pub(crate) fn request(&mut self, vector: u32, handler: Arc<dyn IrqHandler>) -> Result<(), PlatformError> {
        if !self.vectors.contains(&vector) {
            return Err(PlatformError::Unsupported("vector not allocated"));
        }
        self.handlers.insert(vector, handler);
        Ok(())
    }

    pub(crate) fn free(&mut self, vector: u32) {
        self.handlers.remove(&vector);
    }

    pub(crate) fn handler(&self, vector: u32) -> Option<Arc<dyn IrqHandler>> {
        self.handlers.get(&vector).cloned()
    }

    pub(crate) fn vector(&self, line: u16) -> Option<u32> {
        self.vectors.get(line as usize).copied()
    }

    pub(crate) fn record_delivery(&mut self, vector: u32) {
        *self.delivered.entry(vector).or_default() += 1;
    }

    pub(crate) fn deliveries(&self, vector: u32) -> u64 {
        self.delivered.get(&vector).copied().unwrap_or(0)
    }

    fn masked(&self, line: u16) -> bool {
        match self.scheme {
            Some(InterruptScheme::MsiX) => self.msix_masked.get(line as usize).copied().unwrap_or(true),
            Some(_) => self.intms & 1u32.checked_shl(u32::from(line)).unwrap_or(0) != 0,
            None => true,
        }
    }

    /// Map a completion queue's interrupt vector field onto a line.
    pub(crate) fn line_for(&self, iv: u16) -> u16 {
        match self.scheme {
            Some(InterruptScheme::MsiX | InterruptScheme::MsiMulti) if (iv as usize) < self.vectors.len() => iv,
            _ => 0,
        }
    }

    /// The device wants to signal `line`. Returns the vector to deliver, or
    /// latches the pending bit if the line is masked.
    pub(crate) fn raise(&mut self, line: u16) -> Option<u32> {
        let vector = self.vector(line)?;
        if self.masked(line) {
            if let Some(bit) = self.pending.get_mut(line as usize) {
                *bit = true;
            }
            return None;
        }
        Some(vector)
    }

    /// Vectors whose pending bit was set on lines that are now unmasked.
    fn drain_unmasked(&mut self) -> Vec<u32> {
        let mut ready = Vec::new();
        for line in 0..self.pending.len() as u16 {
            if self.pending[line as usize] && !self.masked(line) {
                self.pending[line as usize] = false;
                if let Some(vector) = self.vector(line) {
                    ready.push(vector);
                }
            }
        }
        ready
    }

    pub(crate) fn write_intms(&mut self, bits: u32) {
        self.intms |= bits;
    }

    pub(crate) fn write_intmc(&mut self, bits: u32) -> Vec<u32> {
        self.intms &= !bits;
        self.drain_unmasked()
    }

    pub(crate) fn intms(&self) -> u32 {
        self.intms
    }

    pub(crate) fn set_msix_mask(&mut self, entry: u16, masked: bool) -> Vec<u32> {
        if let Some(bit) = self.msix_masked.get_mut(entry as usize) {
            *bit = masked;
        }
        if masked {
            Vec::new()
        } else {
            self.drain_unmasked()
        }
    }

    pub(crate) fn msix_pending(&self, entry: u16) -> bool {
        self.scheme == Some(InterruptScheme::MsiX)
            && self.pending.get(entry as usize).copied().unwrap_or(false)
    }

    pub(crate) fn is_masked(&self, line: u16) -> bool {
        self.masked(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_line_latches_pending_until_unmask() {
        let mut irq = Interrupts::new(InterruptCaps::default());
        let vectors = irq.enable(InterruptScheme::MsiX, 4).unwrap();
        irq.set_msix_mask(2, true);
        assert_eq!(irq.raise(2), None);
        assert!(irq.msix_pending(2));
        assert_eq!(irq.set_msix_mask(2, false), vec![vectors[2]]);
        assert!(!irq.msix_pending(2));
        assert_eq!(irq.raise(2), Some(vectors[2]));
    }

    #[test]
    fn intms_masks_pin_line() {
        let mut irq = Interrupts::new(InterruptCaps::default());
        let vectors = irq.enable(InterruptScheme::Pin, 1).unwrap();
        irq.write_intms(1);
        assert_eq!(irq.raise(0), None);
        assert_eq!(irq.write_intmc(u32::MAX), vec![vectors[0]]);
    }

    #[test]
    fn unsupported_counts_are_refused() {
        let mut irq = Interrupts::new(InterruptCaps {
            msix_lines: 2,
            ..InterruptCaps::default()
        });
        assert!(irq.enable(InterruptScheme::MsiX, 3).is_err());
        assert!(irq.enable(InterruptScheme::MsiX, 2).is_ok());
        assert!(irq.enable(InterruptScheme::Pin, 1).is_err());
    }
}
