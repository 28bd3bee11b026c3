//! Accelerator queue capability.
//!
//! The pipeline depends on four queue primitives only: enqueue a kernel,
//! write a buffer, read a buffer, synchronize. Within one queue, operations
//! complete in submission order; every cross-stage hand-off in this crate
//! relies on that and on nothing else.
//!
//! `host::HostQueue` is the in-process reference backend. Real accelerator
//! backends live outside this crate and implement [`DeviceQueue`].

pub mod arena;
pub mod host;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::kernels::KernelName;
use crate::pipeline::block::BlockId;

/// Opaque handle to device memory owned by one queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub usize);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// A device allocation: handle, debug label and size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceBuffer {
    id: BufferId,
    label: String,
    bytes: usize,
}

impl DeviceBuffer {
    pub fn new(id: BufferId, label: &str, bytes: usize) -> Self {
        Self {
            id,
            label: label.to_string(),
            bytes,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

/// Immediate (by-value) kernel argument.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Immediate {
    U32(u32),
    F32(f32),
    F64(f64),
    Bool(bool),
}

impl Immediate {
    pub fn as_u32(self) -> Option<u32> {
        match self {
            Immediate::U32(v) => Some(v),
            _ => None,
        }
    }
}

/// One kernel invocation as handed to the queue.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelLaunch {
    pub kernel: KernelName,

    /// Block the launch works on; used for attribution only.
    pub block: BlockId,

    pub input: BufferId,
    pub output: BufferId,

    /// Private per-kernel tables (delays, weights, history).
    pub tables: Vec<BufferId>,

    pub immediates: Vec<(&'static str, Immediate)>,
}

impl KernelLaunch {
    /// Look up a named immediate.
    pub fn immediate(&self, name: &str) -> Option<Immediate> {
        self.immediates
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}

/// Transfer counter attached to host↔device copies.
#[derive(Debug, Default)]
pub struct PerformanceCounter {
    name: String,
    ops: AtomicU64,
    bytes: AtomicU64,
}

impl PerformanceCounter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ops: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn record(&self, bytes: usize) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Failures reported by a device queue.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of device memory allocating {bytes} bytes for '{label}'")]
    OutOfMemory { label: String, bytes: usize },

    #[error("unknown device buffer {0}")]
    UnknownBuffer(BufferId),

    #[error("transfer of {requested} bytes exceeds buffer '{label}' of {available} bytes")]
    TransferSize {
        label: String,
        requested: usize,
        available: usize,
    },

    #[error("kernel launch failed: {0}")]
    LaunchFailed(String),

    #[error("read-back #{0} has not completed; synchronize first")]
    ReadPending(u64),

    #[error("unknown read-back #{0}")]
    UnknownRead(u64),
}

/// A read-back queued on a device queue.
///
/// The data lands in host memory only through [`DeviceQueue::complete_read`],
/// after `synchronize` has returned. Each handle is redeemed or discarded
/// exactly once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a queued read-back lands nowhere until it is completed"]
pub struct PendingRead {
    ticket: u64,
    bytes: usize,
}

impl PendingRead {
    pub fn new(ticket: u64, bytes: usize) -> Self {
        Self { ticket, bytes }
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

/// An in-order accelerator command queue.
///
/// `write_buffer`, `read_buffer` and `enqueue` must not block on device
/// completion; `synchronize` is the only hard wait.
///
/// `write_buffer` is done with `src` when it returns: the backend copies it
/// into its own staging memory, and the device-side transfer may finish
/// later. `read_buffer` only queues the transfer and hands back a
/// [`PendingRead`]; the bytes are copied out with `complete_read` once
/// `synchronize` has returned, so host work can overlap the whole drain.
pub trait DeviceQueue: Send {
    fn allocate(&mut self, label: &str, bytes: usize) -> Result<DeviceBuffer, DeviceError>;

    fn write_buffer(
        &mut self,
        dst: &DeviceBuffer,
        src: &[u8],
        counter: Option<&PerformanceCounter>,
    ) -> Result<(), DeviceError>;

    /// Queue a read-back of the first `bytes` bytes of `src`.
    fn read_buffer(
        &mut self,
        src: &DeviceBuffer,
        bytes: usize,
        counter: Option<&PerformanceCounter>,
    ) -> Result<PendingRead, DeviceError>;

    /// Copy a finished read-back into `dst`, which must match its length.
    fn complete_read(&mut self, read: PendingRead, dst: &mut [u8]) -> Result<(), DeviceError>;

    /// Drop a read-back whose data is no longer wanted.
    fn discard_read(&mut self, read: PendingRead);

    fn enqueue(&mut self, launch: KernelLaunch) -> Result<(), DeviceError>;

    fn synchronize(&mut self) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performance_counter() {
        let counter = PerformanceCounter::new("samples");
        counter.record(128);
        counter.record(64);
        assert_eq!(counter.name(), "samples");
        assert_eq!(counter.ops(), 2);
        assert_eq!(counter.bytes(), 192);
    }

    #[test]
    fn test_launch_immediate_lookup() {
        let launch = KernelLaunch {
            kernel: KernelName::Fft,
            block: BlockId::default(),
            input: BufferId(0),
            output: BufferId(0),
            tables: Vec::new(),
            immediates: vec![("fftSize", Immediate::U32(64)), ("forward", Immediate::Bool(true))],
        };
        assert_eq!(launch.immediate("fftSize").and_then(Immediate::as_u32), Some(64));
        assert_eq!(launch.immediate("forward"), Some(Immediate::Bool(true)));
        assert_eq!(launch.immediate("missing"), None);
    }
}
