//! Named device memory regions shared by every step of one pipeline.
//!
//! A pipeline owns at most six physical regions. `A` and `B` are the
//! ping-pong pair every chain runs through; `C`, `D` and `E` hold the final
//! products of the coherent, incoherent and correlator chains until they are
//! read back. `Input` receives the raw samples and is a separate region only
//! when the correlator and the beamformer both consume them; otherwise it is
//! the same memory as `A`.
//!
//! Sizes are negotiated once: every routed stage registers what it needs on
//! the regions it touches, and each physical region is allocated at the
//! maximum of those requirements.

use std::fmt;

use super::{DeviceBuffer, DeviceError, DeviceQueue};
use crate::kernels::KernelName;

/// One named region of the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    Input,
    A,
    B,
    C,
    D,
    E,
}

impl Region {
    pub const ALL: [Region; 6] = [
        Region::Input,
        Region::A,
        Region::B,
        Region::C,
        Region::D,
        Region::E,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Input => write!(f, "input"),
            Region::A => write!(f, "A"),
            Region::B => write!(f, "B"),
            Region::C => write!(f, "C"),
            Region::D => write!(f, "D"),
            Region::E => write!(f, "E"),
        }
    }
}

/// A single size requirement registered by a kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Requirement {
    /// Region as named by the route (before alias resolution).
    pub region: Region,
    pub kernel: Option<KernelName>,
    pub bytes: usize,
}

/// Per-region size negotiation, done once at construction.
#[derive(Clone, Debug)]
pub struct BufferBudget {
    input_aliases_a: bool,
    sizes: [usize; 6],
    requirements: Vec<Requirement>,
}

impl BufferBudget {
    /// `input_aliases_a`: raw input lands directly in `A`.
    pub fn new(input_aliases_a: bool) -> Self {
        Self {
            input_aliases_a,
            sizes: [0; 6],
            requirements: Vec::new(),
        }
    }

    pub fn input_aliases_a(&self) -> bool {
        self.input_aliases_a
    }

    /// Physical region backing `region`.
    pub fn resolve(&self, region: Region) -> Region {
        match region {
            Region::Input if self.input_aliases_a => Region::A,
            other => other,
        }
    }

    /// Whether two names refer to the same memory.
    pub fn same(&self, a: Region, b: Region) -> bool {
        self.resolve(a) == self.resolve(b)
    }

    /// Register that `kernel` needs `bytes` in `region`.
    pub fn require(&mut self, region: Region, kernel: Option<KernelName>, bytes: usize) {
        let idx = self.resolve(region).index();
        self.sizes[idx] = self.sizes[idx].max(bytes);
        self.requirements.push(Requirement {
            region,
            kernel,
            bytes,
        });
    }

    /// Negotiated size of `region` (0 when nothing routes through it).
    pub fn size(&self, region: Region) -> usize {
        self.sizes[self.resolve(region).index()]
    }

    /// Every requirement registered so far, in registration order.
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Physical regions with a non-zero size.
    pub fn regions(&self) -> impl Iterator<Item = (Region, usize)> + '_ {
        Region::ALL
            .iter()
            .filter(move |r| self.resolve(**r) == **r)
            .map(move |r| (*r, self.sizes[r.index()]))
            .filter(|(_, bytes)| *bytes > 0)
    }

    /// Total device bytes the budget asks for.
    pub fn total_bytes(&self) -> usize {
        self.regions().map(|(_, bytes)| bytes).sum()
    }
}

/// The allocated regions.
#[derive(Debug)]
pub struct BufferArena {
    input_aliases_a: bool,
    buffers: [Option<DeviceBuffer>; 6],
}

impl BufferArena {
    /// Allocate every non-empty physical region of `budget` on `queue`.
    pub fn allocate<Q: DeviceQueue + ?Sized>(
        queue: &mut Q,
        budget: &BufferBudget,
    ) -> Result<Self, DeviceError> {
        let mut buffers: [Option<DeviceBuffer>; 6] = Default::default();
        for (region, bytes) in budget.regions() {
            let buffer = queue.allocate(&format!("region.{}", region), bytes)?;
            tracing::debug!("region {} allocated: {} bytes", region, bytes);
            buffers[region.index()] = Some(buffer);
        }
        Ok(Self {
            input_aliases_a: budget.input_aliases_a(),
            buffers,
        })
    }

    fn resolve(&self, region: Region) -> Region {
        match region {
            Region::Input if self.input_aliases_a => Region::A,
            other => other,
        }
    }

    /// Buffer backing `region`, if the region was allocated.
    pub fn get(&self, region: Region) -> Option<&DeviceBuffer> {
        self.buffers[self.resolve(region).index()].as_ref()
    }

    /// Allocated size of `region` (0 when absent).
    pub fn size(&self, region: Region) -> usize {
        self.get(region).map_or(0, DeviceBuffer::len)
    }
}
