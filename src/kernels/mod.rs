//! Named kernel parameterisations and their memory requirements.
//!
//! Kernel bodies run on the device and are opaque to this crate. What the
//! pipeline needs from each kernel is:
//! - how many bytes it reads and writes, per buffer role
//! - whether it transforms its buffer in place
//! - which private tables it owns (delays, weights, filter history)
//! - the immediates it is launched with
//!
//! A parameter struct describes this through [`KernelSpec`]. [`Kernel::bind`]
//! turns a spec plus a routed pair of regions into a launchable kernel,
//! rejecting regions that are too small.

pub mod beamform;
pub mod correction;
pub mod correlate;
pub mod filter;
pub mod stokes;

use std::fmt;

use crate::device::arena::{BufferArena, Region};
use crate::device::{DeviceBuffer, DeviceQueue, Immediate, KernelLaunch, PerformanceCounter};
use crate::error::PipelineError;
use crate::pipeline::block::BlockId;

/// Every kernel the signal chains use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelName {
    IntToFloat,
    FftShift,
    Fft,
    DelayAndBandPass,
    BandPassCorrection,
    FirFilter,
    BeamFormer,
    Transpose,
    CoherentStokes,
    IncoherentStokes,
    Correlator,
}

impl fmt::Display for KernelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KernelName::IntToFloat => "IntToFloat",
            KernelName::FftShift => "FftShift",
            KernelName::Fft => "Fft",
            KernelName::DelayAndBandPass => "DelayAndBandPass",
            KernelName::BandPassCorrection => "BandPassCorrection",
            KernelName::FirFilter => "FirFilter",
            KernelName::BeamFormer => "BeamFormer",
            KernelName::Transpose => "Transpose",
            KernelName::CoherentStokes => "CoherentStokes",
            KernelName::IncoherentStokes => "IncoherentStokes",
            KernelName::Correlator => "Correlator",
        };
        write!(f, "{}", name)
    }
}

/// Role of a buffer a kernel touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferType {
    Input,
    Output,
    FilterWeights,
    HistoryData,
    DelaysAtBegin,
    DelaysAfterEnd,
    PhaseOffsets,
    BandPassWeights,
    BeamFormerDelays,
}

impl fmt::Display for BufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferType::Input => "input",
            BufferType::Output => "output",
            BufferType::FilterWeights => "FilterWeights",
            BufferType::HistoryData => "HistoryData",
            BufferType::DelaysAtBegin => "DelaysAtBegin",
            BufferType::DelaysAfterEnd => "DelaysAfterEnd",
            BufferType::PhaseOffsets => "PhaseOffsets",
            BufferType::BandPassWeights => "BandPassWeights",
            BufferType::BeamFormerDelays => "BeamFormerDelays",
        };
        write!(f, "{}", name)
    }
}

/// Whether a kernel writes back into the buffer it reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    InPlace,
    OutOfPlace,
}

/// Static description of one kernel configuration.
pub trait KernelSpec {
    fn name(&self) -> KernelName;

    fn placement(&self) -> Placement {
        Placement::OutOfPlace
    }

    /// Bytes needed for `buffer`; 0 for roles the kernel does not use.
    fn buffer_size(&self, buffer: BufferType) -> usize;

    /// Private tables allocated alongside the kernel.
    fn tables(&self) -> &'static [BufferType] {
        &[]
    }

    /// Launch arguments fixed for the lifetime of the kernel.
    fn immediates(&self) -> Vec<(&'static str, Immediate)> {
        Vec::new()
    }
}

/// A kernel bound to its regions and private tables.
#[derive(Debug)]
pub struct Kernel {
    name: KernelName,
    input_region: Region,
    output_region: Region,
    input: DeviceBuffer,
    output: DeviceBuffer,
    tables: Vec<(BufferType, DeviceBuffer)>,
    immediates: Vec<(&'static str, Immediate)>,
}

impl Kernel {
    /// Bind `spec` to read `input` and write `output`.
    ///
    /// Fails with `BufferTooSmall` when either region holds fewer bytes than
    /// the kernel needs. Private tables are allocated zero-filled on `queue`
    /// and labelled `<owner>/<kernel>.<table>`.
    pub fn bind<Q: DeviceQueue + ?Sized>(
        spec: &dyn KernelSpec,
        input: Region,
        output: Region,
        arena: &BufferArena,
        queue: &mut Q,
        owner: &str,
    ) -> Result<Self, PipelineError> {
        let name = spec.name();
        let input_buffer = checked_region(spec, BufferType::Input, input, arena)?;
        let output_buffer = checked_region(spec, BufferType::Output, output, arena)?;

        let mut tables = Vec::with_capacity(spec.tables().len());
        for &table in spec.tables() {
            let bytes = spec.buffer_size(table);
            let label = format!("{}/{}.{}", owner, name, table);
            tables.push((table, queue.allocate(&label, bytes)?));
        }

        tracing::trace!("bound {} {}->{} ({} tables)", name, input, output, tables.len());
        Ok(Self {
            name,
            input_region: input,
            output_region: output,
            input: input_buffer,
            output: output_buffer,
            tables,
            immediates: spec.immediates(),
        })
    }

    pub fn name(&self) -> KernelName {
        self.name
    }

    pub fn input_region(&self) -> Region {
        self.input_region
    }

    pub fn output_region(&self) -> Region {
        self.output_region
    }

    pub fn output_buffer(&self) -> &DeviceBuffer {
        &self.output
    }

    pub fn table(&self, table: BufferType) -> Option<&DeviceBuffer> {
        self.tables.iter().find(|(t, _)| *t == table).map(|(_, b)| b)
    }

    /// Upload host data into one of the kernel's private tables.
    pub fn write_table<Q: DeviceQueue + ?Sized>(
        &self,
        queue: &mut Q,
        table: BufferType,
        bytes: &[u8],
        counter: Option<&PerformanceCounter>,
    ) -> Result<(), PipelineError> {
        let buffer = self.table(table).ok_or_else(|| {
            PipelineError::InvalidConfig(format!("kernel {} has no {} table", self.name, table))
        })?;
        queue.write_buffer(buffer, bytes, counter)?;
        Ok(())
    }

    pub fn enqueue<Q: DeviceQueue + ?Sized>(
        &self,
        queue: &mut Q,
        block: BlockId,
    ) -> Result<(), PipelineError> {
        self.enqueue_with(queue, block, &[])
    }

    /// Enqueue with additional per-block immediates.
    pub fn enqueue_with<Q: DeviceQueue + ?Sized>(
        &self,
        queue: &mut Q,
        block: BlockId,
        extra: &[(&'static str, Immediate)],
    ) -> Result<(), PipelineError> {
        let mut immediates = self.immediates.clone();
        immediates.extend_from_slice(extra);
        tracing::trace!("{}: enqueue {}", block, self.name);
        queue.enqueue(KernelLaunch {
            kernel: self.name,
            block,
            input: self.input.id(),
            output: self.output.id(),
            tables: self.tables.iter().map(|(_, b)| b.id()).collect(),
            immediates,
        })?;
        Ok(())
    }
}

fn checked_region(
    spec: &dyn KernelSpec,
    buffer: BufferType,
    region: Region,
    arena: &BufferArena,
) -> Result<DeviceBuffer, PipelineError> {
    let required = spec.buffer_size(buffer);
    let available = arena.size(region);
    match arena.get(region) {
        Some(b) if available >= required => Ok(b.clone()),
        _ => Err(PipelineError::BufferTooSmall {
            kernel: spec.name(),
            buffer,
            region,
            required,
            available,
        }),
    }
}
