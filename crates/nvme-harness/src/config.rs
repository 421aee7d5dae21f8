use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest admin queue the controller register layout can describe (AQA is 12 bits, 0's based).
pub const ADMIN_QUEUE_LIMIT: u32 = 4096;
/// Largest I/O queue the create-queue commands can describe (QSIZE is 16 bits, 0's based).
pub const IO_QUEUE_LIMIT: u32 = 65536;
pub const MSI_MULTI_LIMIT: u16 = 32;
pub const MSIX_LIMIT: u16 = 2048;

/// Tunables for one harness device session.
///
/// Loaded from JSON (`HarnessConfig::from_json`) or from the process
/// environment (`HarnessConfig::from_env`). Every field has a default that
/// matches a plain 4 KiB-page host talking to a spec-conformant controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Host page size used for pinning and descriptor framing.
    ///
    /// Environment variable: `NVME_HARNESS_PAGE_SIZE`.
    pub page_size: u32,

    /// Upper bound on I/O queue depth.
    ///
    /// Environment variable: `NVME_HARNESS_MAX_QUEUE_ENTRIES`.
    pub max_queue_entries: u32,

    /// Upper bound on admin queue depth.
    ///
    /// Environment variable: `NVME_HARNESS_ADMIN_MAX_ENTRIES`.
    pub admin_max_entries: u32,

    /// log2 of the submission queue entry size programmed into CC.IOSQES.
    pub sq_entry_shift: u8,

    /// log2 of the completion queue entry size programmed into CC.IOCQES.
    pub cq_entry_shift: u8,

    /// Polling interval of the blocking reap.
    ///
    /// Environment variable: `NVME_HARNESS_REAP_POLL_MS`.
    pub reap_poll_interval_ms: u64,

    /// Polling interval while waiting on CSTS.RDY.
    pub ready_poll_interval_ms: u64,

    /// Bottom-half queue depth. `0` sizes the queue to one slot per line.
    pub irq_work_queue_depth: usize,

    pub msi_multi_max_lines: u16,
    pub msix_max_lines: u16,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_queue_entries: IO_QUEUE_LIMIT,
            admin_max_entries: ADMIN_QUEUE_LIMIT,
            sq_entry_shift: 6,
            cq_entry_shift: 4,
            reap_poll_interval_ms: 1,
            ready_poll_interval_ms: 1,
            irq_work_queue_depth: 0,
            msi_multi_max_lines: MSI_MULTI_LIMIT,
            msix_max_lines: MSIX_LIMIT,
        }
    }
}

impl HarnessConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: HarnessConfig = serde_json::from_str(text)
            .map_err(|err| Error::invalid(format!("config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by any `NVME_HARNESS_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = HarnessConfig::default();
        if let Some(v) = env_number("NVME_HARNESS_PAGE_SIZE")? {
            config.page_size = v;
        }
        if let Some(v) = env_number("NVME_HARNESS_MAX_QUEUE_ENTRIES")? {
            config.max_queue_entries = v;
        }
        if let Some(v) = env_number("NVME_HARNESS_ADMIN_MAX_ENTRIES")? {
            config.admin_max_entries = v;
        }
        if let Some(v) = env_number("NVME_HARNESS_REAP_POLL_MS")? {
            config.reap_poll_interval_ms = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < 4096 {
            return Err(Error::invalid(format!(
                "page_size {} must be a power of two >= 4096",
                self.page_size
            )));
        }
        if self.admin_max_entries == 0 || self.admin_max_entries > ADMIN_QUEUE_LIMIT {
            return Err(Error::invalid(format!(
                "admin_max_entries {} outside 1..={ADMIN_QUEUE_LIMIT}",
                self.admin_max_entries
            )));
        }
        if self.max_queue_entries < 2 || self.max_queue_entries > IO_QUEUE_LIMIT {
            return Err(Error::invalid(format!(
                "max_queue_entries {} outside 2..={IO_QUEUE_LIMIT}",
                self.max_queue_entries
            )));
        }
        for (name, shift, min) in [
            ("sq_entry_shift", self.sq_entry_shift, 6),
            ("cq_entry_shift", self.cq_entry_shift, 4),
        ] {
            if !(min..=12).contains(&shift) {
                return Err(Error::invalid(format!("{name} {shift} outside {min}..=12")));
            }
        }
        if self.msi_multi_max_lines > MSI_MULTI_LIMIT || self.msix_max_lines > MSIX_LIMIT {
            return Err(Error::invalid("interrupt line limits exceed protocol maxima"));
        }
        Ok(())
    }

    pub fn sq_entry_size(&self) -> usize {
        1 << self.sq_entry_shift
    }

    pub fn cq_entry_size(&self) -> usize {
        1 << self.cq_entry_shift
    }

    pub fn reap_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reap_poll_interval_ms.max(1))
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms.max(1))
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::invalid(format!("{key}={raw:?} is not a number"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sq_entry_size(), 64);
        assert_eq!(config.cq_entry_size(), 16);
    }

    #[test]
    fn json_overrides_only_named_fields() {
        let config = HarnessConfig::from_json(r#"{ "admin_max_entries": 64 }"#).unwrap();
        assert_eq!(config.admin_max_entries, 64);
        assert_eq!(config.page_size, 4096);
    }

    #[test]
    fn json_rejects_unknown_fields_and_bad_values() {
        assert!(HarnessConfig::from_json(r#"{ "page_sz": 4096 }"#).is_err());
        assert!(HarnessConfig::from_json(r#"{ "page_size": 5000 }"#).is_err());
        assert!(HarnessConfig::from_json(r#"{ "admin_max_entries": 8192 }"#).is_err());
        assert!(HarnessConfig::from_json(r#"{ "cq_entry_shift": 2 }"#).is_err());
    }
}
