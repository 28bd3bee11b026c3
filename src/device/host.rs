//! Host-memory reference queue.
//!
//! Executes every operation immediately, in submission order, against plain
//! `Vec<u8>` allocations. That is one legal schedule of an in-order device
//! queue, which makes this backend a faithful stand-in for tests and for
//! dry runs of a configuration. Kernel bodies are optional: a launch with no
//! registered body is recorded and otherwise leaves memory untouched.
//!
//! Read-backs are staged at submission and only released by `synchronize`,
//! so a caller that consumes data too early fails here too.

use std::collections::HashMap;

use super::{
    BufferId, DeviceBuffer, DeviceError, DeviceQueue, KernelLaunch, PendingRead, PerformanceCounter,
};
use crate::kernels::KernelName;
use crate::pipeline::block::BlockId;

/// Host-side kernel body.
pub type KernelBody = Box<dyn FnMut(&KernelLaunch, &mut HostMemory) + Send>;

struct HostAllocation {
    label: String,
    data: Vec<u8>,
}

/// All allocations of one `HostQueue`.
#[derive(Default)]
pub struct HostMemory {
    buffers: Vec<HostAllocation>,
}

impl HostMemory {
    pub fn bytes(&self, id: BufferId) -> &[u8] {
        &self.buffers[id.0].data
    }

    pub fn bytes_mut(&mut self, id: BufferId) -> &mut [u8] {
        &mut self.buffers[id.0].data
    }

    pub fn label(&self, id: BufferId) -> &str {
        &self.buffers[id.0].label
    }

    fn get(&self, id: BufferId) -> Result<&HostAllocation, DeviceError> {
        self.buffers.get(id.0).ok_or(DeviceError::UnknownBuffer(id))
    }

    fn get_mut(&mut self, id: BufferId) -> Result<&mut HostAllocation, DeviceError> {
        self.buffers.get_mut(id.0).ok_or(DeviceError::UnknownBuffer(id))
    }
}

/// Record of one queue operation.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueOp {
    Write {
        buffer: BufferId,
        label: String,
        bytes: usize,
    },
    Read {
        buffer: BufferId,
        label: String,
        bytes: usize,
    },
    Launch {
        kernel: KernelName,
        block: BlockId,
        input: BufferId,
        output: BufferId,
    },
    Synchronize,
}

struct StagedRead {
    label: String,
    data: Vec<u8>,
    landed: bool,
}

/// In-order queue over host memory.
pub struct HostQueue {
    memory: HostMemory,
    kernels: HashMap<KernelName, KernelBody>,
    log: Vec<QueueOp>,
    allocated: usize,
    memory_limit: Option<usize>,
    staged: HashMap<u64, StagedRead>,
    next_ticket: u64,
    failing: Option<KernelName>,
}

impl Default for HostQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl HostQueue {
    pub fn new() -> Self {
        Self {
            memory: HostMemory::default(),
            kernels: HashMap::new(),
            log: Vec::new(),
            allocated: 0,
            memory_limit: None,
            staged: HashMap::new(),
            next_ticket: 0,
            failing: None,
        }
    }

    /// Cap the total bytes this queue will hand out.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Run `body` for every launch of `kernel`.
    pub fn register_kernel(&mut self, kernel: KernelName, body: KernelBody) {
        self.kernels.insert(kernel, body);
    }

    /// Make every launch of `kernel` fail until cleared with `None`.
    pub fn fail_launches_of(&mut self, kernel: Option<KernelName>) {
        self.failing = kernel;
    }

    /// Read-backs queued but not yet completed or discarded.
    pub fn pending_reads(&self) -> usize {
        self.staged.len()
    }

    pub fn log(&self) -> &[QueueOp] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    pub fn memory(&self) -> &HostMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut HostMemory {
        &mut self.memory
    }

    /// Number of writes to buffers whose label ends with `suffix`.
    pub fn writes_to(&self, suffix: &str) -> usize {
        self.log
            .iter()
            .filter(|op| matches!(op, QueueOp::Write { label, .. } if label.ends_with(suffix)))
            .count()
    }

    /// Kernels launched, in submission order.
    pub fn launched_kernels(&self) -> Vec<KernelName> {
        self.log
            .iter()
            .filter_map(|op| match op {
                QueueOp::Launch { kernel, .. } => Some(*kernel),
                _ => None,
            })
            .collect()
    }
}

impl DeviceQueue for HostQueue {
    fn allocate(&mut self, label: &str, bytes: usize) -> Result<DeviceBuffer, DeviceError> {
        if let Some(limit) = self.memory_limit {
            if self.allocated + bytes > limit {
                return Err(DeviceError::OutOfMemory {
                    label: label.to_string(),
                    bytes,
                });
            }
        }
        let id = BufferId(self.memory.buffers.len());
        self.memory.buffers.push(HostAllocation {
            label: label.to_string(),
            data: vec![0u8; bytes],
        });
        self.allocated += bytes;
        tracing::trace!("allocated {} ({} bytes) as {}", label, bytes, id);
        Ok(DeviceBuffer::new(id, label, bytes))
    }

    fn write_buffer(
        &mut self,
        dst: &DeviceBuffer,
        src: &[u8],
        counter: Option<&PerformanceCounter>,
    ) -> Result<(), DeviceError> {
        let alloc = self.memory.get_mut(dst.id())?;
        if src.len() > alloc.data.len() {
            return Err(DeviceError::TransferSize {
                label: alloc.label.clone(),
                requested: src.len(),
                available: alloc.data.len(),
            });
        }
        alloc.data[..src.len()].copy_from_slice(src);
        if let Some(counter) = counter {
            counter.record(src.len());
        }
        self.log.push(QueueOp::Write {
            buffer: dst.id(),
            label: alloc.label.clone(),
            bytes: src.len(),
        });
        Ok(())
    }

    fn read_buffer(
        &mut self,
        src: &DeviceBuffer,
        bytes: usize,
        counter: Option<&PerformanceCounter>,
    ) -> Result<PendingRead, DeviceError> {
        let alloc = self.memory.get(src.id())?;
        if bytes > alloc.data.len() {
            return Err(DeviceError::TransferSize {
                label: alloc.label.clone(),
                requested: bytes,
                available: alloc.data.len(),
            });
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.staged.insert(
            ticket,
            StagedRead {
                label: alloc.label.clone(),
                data: alloc.data[..bytes].to_vec(),
                landed: false,
            },
        );
        if let Some(counter) = counter {
            counter.record(bytes);
        }
        self.log.push(QueueOp::Read {
            buffer: src.id(),
            label: alloc.label.clone(),
            bytes,
        });
        Ok(PendingRead::new(ticket, bytes))
    }

    fn complete_read(&mut self, read: PendingRead, dst: &mut [u8]) -> Result<(), DeviceError> {
        let ticket = read.ticket();
        let staged = self
            .staged
            .get(&ticket)
            .ok_or(DeviceError::UnknownRead(ticket))?;
        if !staged.landed {
            return Err(DeviceError::ReadPending(ticket));
        }
        if dst.len() != staged.data.len() {
            return Err(DeviceError::TransferSize {
                label: staged.label.clone(),
                requested: dst.len(),
                available: staged.data.len(),
            });
        }
        if let Some(staged) = self.staged.remove(&ticket) {
            dst.copy_from_slice(&staged.data);
        }
        Ok(())
    }

    fn discard_read(&mut self, read: PendingRead) {
        self.staged.remove(&read.ticket());
    }

    fn enqueue(&mut self, launch: KernelLaunch) -> Result<(), DeviceError> {
        if self.failing == Some(launch.kernel) {
            return Err(DeviceError::LaunchFailed(format!("{:?} rejected", launch.kernel)));
        }
        for id in [launch.input, launch.output]
            .iter()
            .chain(launch.tables.iter())
        {
            self.memory.get(*id)?;
        }
        if let Some(body) = self.kernels.get_mut(&launch.kernel) {
            body(&launch, &mut self.memory);
        }
        self.log.push(QueueOp::Launch {
            kernel: launch.kernel,
            block: launch.block,
            input: launch.input,
            output: launch.output,
        });
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        for staged in self.staged.values_mut() {
            staged.landed = true;
        }
        self.log.push(QueueOp::Synchronize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Immediate;

    #[test]
    fn test_write_then_read() {
        let mut queue = HostQueue::new();
        let buf = queue.allocate("samples", 8).unwrap();
        queue.write_buffer(&buf, &[1, 2, 3, 4], None).unwrap();

        let read = queue.read_buffer(&buf, 6, None).unwrap();
        queue.synchronize().unwrap();
        let mut out = [0u8; 6];
        queue.complete_read(read, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 0, 0]);
        assert_eq!(queue.writes_to("samples"), 1);
        assert_eq!(queue.pending_reads(), 0);
    }

    #[test]
    fn test_read_lands_only_after_synchronize() {
        let mut queue = HostQueue::new();
        let buf = queue.allocate("visibilities", 4).unwrap();
        queue.write_buffer(&buf, &[9, 9, 9, 9], None).unwrap();

        let early = queue.read_buffer(&buf, 4, None).unwrap();
        let ticket = early.ticket();
        let mut out = [0u8; 4];
        let err = queue.complete_read(early, &mut out).unwrap_err();
        assert!(matches!(err, DeviceError::ReadPending(t) if t == ticket));
        assert_eq!(out, [0; 4]);

        // a rejected completion does not consume the staged data
        queue.synchronize().unwrap();
        queue
            .complete_read(PendingRead::new(ticket, 4), &mut out)
            .unwrap();
        assert_eq!(out, [9; 4]);
        let err = queue
            .complete_read(PendingRead::new(ticket, 4), &mut out)
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnknownRead(_)));
    }

    #[test]
    fn test_discarded_read_is_released() {
        let mut queue = HostQueue::new();
        let buf = queue.allocate("beams", 8).unwrap();
        let read = queue.read_buffer(&buf, 8, None).unwrap();
        assert_eq!(queue.pending_reads(), 1);
        queue.discard_read(read);
        assert_eq!(queue.pending_reads(), 0);
    }

    #[test]
    fn test_failing_kernel_rejects_launch() {
        let mut queue = HostQueue::new();
        let buf = queue.allocate("a", 4).unwrap();
        let launch = KernelLaunch {
            kernel: KernelName::Correlator,
            block: BlockId::default(),
            input: buf.id(),
            output: buf.id(),
            tables: Vec::new(),
            immediates: Vec::new(),
        };
        queue.fail_launches_of(Some(KernelName::Correlator));
        assert!(matches!(
            queue.enqueue(launch.clone()).unwrap_err(),
            DeviceError::LaunchFailed(_)
        ));
        queue.fail_launches_of(None);
        queue.enqueue(launch).unwrap();
        assert_eq!(queue.launched_kernels(), vec![KernelName::Correlator]);
    }

    #[test]
    fn test_oversized_transfer_rejected() {
        let mut queue = HostQueue::new();
        let buf = queue.allocate("small", 4).unwrap();
        let err = queue.write_buffer(&buf, &[0u8; 5], None).unwrap_err();
        assert!(matches!(err, DeviceError::TransferSize { .. }));
    }

    #[test]
    fn test_memory_limit() {
        let mut queue = HostQueue::new().with_memory_limit(100);
        queue.allocate("a", 60).unwrap();
        let err = queue.allocate("b", 60).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfMemory { .. }));
        assert_eq!(queue.allocated_bytes(), 60);
    }

    #[test]
    fn test_registered_kernel_runs_in_order() {
        let mut queue = HostQueue::new();
        let a = queue.allocate("a", 4).unwrap();
        let b = queue.allocate("b", 4).unwrap();
        queue.register_kernel(
            KernelName::Transpose,
            Box::new(|launch, mem| {
                let src = mem.bytes(launch.input).to_vec();
                let dst = mem.bytes_mut(launch.output);
                for (d, s) in dst.iter_mut().zip(src.iter().rev()) {
                    *d = *s;
                }
            }),
        );

        queue.write_buffer(&a, &[1, 2, 3, 4], None).unwrap();
        queue
            .enqueue(KernelLaunch {
                kernel: KernelName::Transpose,
                block: BlockId::default(),
                input: a.id(),
                output: b.id(),
                tables: Vec::new(),
                immediates: vec![("n", Immediate::U32(4))],
            })
            .unwrap();

        let read = queue.read_buffer(&b, 4, None).unwrap();
        queue.synchronize().unwrap();
        let mut out = [0u8; 4];
        queue.complete_read(read, &mut out).unwrap();
        assert_eq!(out, [4, 3, 2, 1]);
        assert_eq!(queue.launched_kernels(), vec![KernelName::Transpose]);
    }

    #[test]
    fn test_unknown_buffer_rejected() {
        let mut queue = HostQueue::new();
        let err = queue
            .enqueue(KernelLaunch {
                kernel: KernelName::Fft,
                block: BlockId::default(),
                input: BufferId(3),
                output: BufferId(3),
                tables: Vec::new(),
                immediates: Vec::new(),
            })
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnknownBuffer(BufferId(3))));
    }
}
