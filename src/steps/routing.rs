//! Assignment of arena regions to the stages of every step.
//!
//! Each step reads its source region and must leave its product in its
//! output region. In between, out-of-place stages ping-pong through scratch
//! regions; in-place stages stay where the data is. The planner searches,
//! depth first and in preference order, for the first assignment where no
//! out-of-place stage reads and writes the same memory and the last one
//! writes the output region.
//!
//! Scratch candidates exclude *protected* regions: anything a later step
//! still has to read, and anything holding an earlier step's product that
//! has yet to be read back.

use std::fmt;

use crate::device::arena::{BufferBudget, Region};
use crate::error::PipelineError;
use crate::kernels::{KernelName, Placement};

use super::StepKind;

/// One kernel with its routed regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage {
    pub kernel: KernelName,
    pub input: Region,
    pub output: Region,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}->{}", self.kernel, self.input, self.output)
    }
}

/// Every stage of one step, in launch order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub step: StepKind,
    pub source: Region,
    pub output: Region,
    pub stages: Vec<Stage>,
}

impl Route {
    /// `(input, output)` regions of every stage, for compact assertions.
    pub fn regions(&self) -> Vec<(Region, Region)> {
        self.stages.iter().map(|s| (s.input, s.output)).collect()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.step)?;
        for (i, stage) in self.stages.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{}{}", sep, stage)?;
        }
        Ok(())
    }
}

/// Fixed region roles of a step.
#[derive(Clone, Copy, Debug)]
pub struct StepLayout {
    pub source: Region,
    pub output: Region,

    /// Scratch regions, most preferred first.
    pub preference: &'static [Region],

    /// Whether the output is read back to the host.
    pub readback: bool,
}

pub fn layout(kind: StepKind) -> StepLayout {
    match kind {
        StepKind::Preprocessing => StepLayout {
            source: Region::Input,
            output: Region::B,
            preference: &[Region::B, Region::A],
            readback: false,
        },
        StepKind::Correlator => StepLayout {
            source: Region::Input,
            output: Region::E,
            preference: &[Region::B, Region::E, Region::A],
            readback: true,
        },
        StepKind::Coherent => StepLayout {
            source: Region::B,
            output: Region::C,
            preference: &[Region::A, Region::B, Region::D, Region::C],
            readback: true,
        },
        StepKind::Incoherent => StepLayout {
            source: Region::B,
            output: Region::D,
            preference: &[Region::A, Region::B, Region::D],
            readback: true,
        },
    }
}

/// Regions that exist for this combination of steps.
fn present(region: Region, kinds: &[StepKind]) -> bool {
    match region {
        Region::A | Region::B => true,
        Region::C => kinds.contains(&StepKind::Coherent),
        Region::D => kinds.contains(&StepKind::Incoherent),
        Region::E => kinds.contains(&StepKind::Correlator),
        Region::Input => false,
    }
}

/// Scratch candidates of step `index` within the ordered `kinds`.
pub fn scratch_candidates(budget: &BufferBudget, kinds: &[StepKind], index: usize) -> Vec<Region> {
    let own = layout(kinds[index]);
    let mut protected = Vec::new();
    for later in &kinds[index + 1..] {
        let source = layout(*later).source;
        if !budget.same(source, own.output) {
            protected.push(source);
        }
    }
    for earlier in &kinds[..index] {
        let l = layout(*earlier);
        if l.readback {
            protected.push(l.output);
        }
    }

    own.preference
        .iter()
        .copied()
        .filter(|r| present(*r, kinds))
        .filter(|r| !protected.iter().any(|p| budget.same(*p, *r)))
        .collect()
}

/// Route one stage sequence from `source` to `output`.
pub fn plan(
    budget: &BufferBudget,
    source: Region,
    output: Region,
    candidates: &[Region],
    stages: &[(KernelName, Placement)],
) -> Option<Vec<Stage>> {
    let last_out_of_place = stages
        .iter()
        .rposition(|(_, p)| *p == Placement::OutOfPlace)?;
    let mut routed = Vec::with_capacity(stages.len());
    let planner = Planner {
        budget,
        output,
        candidates,
        stages,
        last_out_of_place,
    };
    if planner.assign(0, source, &mut routed) {
        Some(routed)
    } else {
        None
    }
}

struct Planner<'a> {
    budget: &'a BufferBudget,
    output: Region,
    candidates: &'a [Region],
    stages: &'a [(KernelName, Placement)],
    last_out_of_place: usize,
}

impl Planner<'_> {
    fn assign(&self, idx: usize, current: Region, routed: &mut Vec<Stage>) -> bool {
        let Some(&(kernel, placement)) = self.stages.get(idx) else {
            return self.budget.same(current, self.output);
        };

        let destinations: Vec<Region> = match placement {
            Placement::InPlace => vec![current],
            Placement::OutOfPlace if idx == self.last_out_of_place => vec![self.output],
            Placement::OutOfPlace => self.candidates.to_vec(),
        };

        for dest in destinations {
            if placement == Placement::OutOfPlace && self.budget.same(dest, current) {
                continue;
            }
            routed.push(Stage {
                kernel,
                input: current,
                output: dest,
            });
            if self.assign(idx + 1, dest, routed) {
                return true;
            }
            routed.pop();
        }
        false
    }
}

/// Route every active step, in processing order.
pub fn plan_routes(
    budget: &BufferBudget,
    steps: &[(StepKind, Vec<(KernelName, Placement)>)],
) -> Result<Vec<Route>, PipelineError> {
    let kinds: Vec<StepKind> = steps.iter().map(|(k, _)| *k).collect();
    steps
        .iter()
        .enumerate()
        .map(|(i, (kind, stages))| {
            let l = layout(*kind);
            let candidates = scratch_candidates(budget, &kinds, i);
            let routed = plan(budget, l.source, l.output, &candidates, stages)
                .ok_or(PipelineError::Unroutable { step: *kind })?;
            Ok(Route {
                step: *kind,
                source: l.source,
                output: l.output,
                stages: routed,
            })
        })
        .collect()
}
