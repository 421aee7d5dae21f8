//! Host-side core of an NVMe conformance-test harness.
//!
//! A test program drives a controller through raw commands; this crate does the
//! bookkeeping that sits between the two:
//!
//! - [`Device`]: one harness session with its queues, pools and interrupts
//! - [`DescriptorChain`]: pinned user buffers described as PRP lists or SGL
//!   segments (with bit buckets)
//! - Queue lifecycle: admin queues, prepared and created I/O queues, soft and
//!   full teardown
//! - Completion inquiry and reaping with phase-tag tracking
//! - Pin, MSI, multi-message MSI and MSI-X interrupts with a deferred bottom
//!   half
//! - [`router::dispatch`]: the fixed-code control request entry point
//!
//! Hardware is reached only through the traits in [`platform`], so the same
//! engine runs against a kernel shim or against an in-process simulator.

mod chain;
mod config;
mod device;
mod dma;
mod error;
mod irq;
mod meta;
mod queue;
mod reap;
mod tracker;

pub mod command;
pub mod platform;
pub mod regs;
pub mod router;

pub use chain::{
    BitBucket, ChainBuilder, ChainKind, ChainRequest, DataPointer, DescriptorChain, Framing,
    Release, Segment, UserBuffer,
};
pub use config::HarnessConfig;
pub use device::{ControllerState, Device, PrepareCq, PrepareSq, SubmitRequest};
pub use dma::{DmaBlock, DmaPool, DmaPools};
pub use error::{Error, Object, PlatformError, Result};
pub use irq::{InterruptScheme, LineInfo, LineSettle};
pub use meta::MetadataStore;
pub use queue::{
    CompletionQueue, CqInfo, QueueKind, QueueState, QueueTable, SqInfo, SubmissionQueue,
    TeardownMode, ADMIN_QID,
};
pub use reap::ReapOutcome;
pub use tracker::{CommandTracker, TrackedCommand};
