//! Typed errors for pipeline construction and per-block processing.
//!
//! Everything here is fatal for the owning `SubbandProc`: configuration
//! problems surface at construction, device failures surface on the block
//! that hit them. Data-quality conditions (flagged samples, zero valid
//! samples) are never errors; they travel through the output as weights.

use thiserror::Error;

use crate::device::arena::Region;
use crate::device::DeviceError;
use crate::kernels::{BufferType, KernelName};
use crate::pipeline::subband_proc::ProcState;
use crate::steps::StepKind;

/// Errors raised while building or driving a subband pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested combination of products cannot be served.
    #[error("unsupported combination: {0}")]
    UnsupportedCombination(String),

    /// A kernel needs more memory than its routed region provides.
    #[error(
        "kernel {kernel} needs {required} bytes for its {buffer} buffer, \
         but region {region} holds only {available}"
    )]
    BufferTooSmall {
        kernel: KernelName,
        buffer: BufferType,
        region: Region,
        required: usize,
        available: usize,
    },

    /// No assignment of device regions satisfies the step's stage sequence.
    #[error("cannot route the {step} step through the available device regions")]
    Unroutable { step: StepKind },

    /// The device queue rejected an allocation, transfer or launch.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// An input object does not match the shapes the configuration implies.
    #[error("input block does not match the configuration: {0}")]
    InputMismatch(String),

    /// A block failed mid-flight and the processor has not been reset.
    #[error("subband processor stalled in {0:?}; reset it before the next block")]
    Stalled(ProcState),
}
