//! The signal chains a `SubbandProc` can run.
//!
//! A step is a fixed sequence of kernels over the shared arena regions. The
//! active steps are decided once from the observation settings and always
//! run in the order preprocessing, correlator, coherent, incoherent; later
//! steps rely on earlier ones having been enqueued first on the same queue.
//!
//! Construction happens in three passes:
//! 1. `StepFactories::for_settings` derives every kernel's parameters.
//! 2. `routing::plan_routes` assigns regions to every stage and the
//!    factories register their size requirements on the budget.
//! 3. Once the arena is allocated, each factory binds its kernels and
//!    becomes a `ProcessStep`.

pub mod coherent;
pub mod correlator;
pub mod incoherent;
pub mod preprocessing;
pub mod routing;

use std::fmt;
use std::vec;

use crate::device::arena::{BufferArena, BufferBudget};
use crate::device::{DeviceQueue, PerformanceCounter};
use crate::error::PipelineError;
use crate::kernels::{BufferType, Kernel, KernelName, KernelSpec, Placement};
use crate::parset::ObservationSettings;
use crate::pipeline::block::BlockId;
use crate::pipeline::input::{table_bytes, InputData};
use crate::pipeline::output::OutputData;

pub use coherent::{CoherentFactories, CoherentStep};
pub use correlator::{CorrelatorFactories, CorrelatorStep};
pub use incoherent::{IncoherentFactories, IncoherentStep};
pub use preprocessing::{PreprocessingFactories, PreprocessingStep};
pub use routing::{Route, Stage};

/// The four step kinds, in processing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    Preprocessing,
    Correlator,
    Coherent,
    Incoherent,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Preprocessing => write!(f, "preprocessing"),
            StepKind::Correlator => write!(f, "correlator"),
            StepKind::Coherent => write!(f, "coherent"),
            StepKind::Incoherent => write!(f, "incoherent"),
        }
    }
}

/// Outcome of the delay cache check for one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelayUpload {
    /// The (SAP, block) pair changed; tables must be uploaded.
    Upload,
    /// The device already holds this pair's tables.
    Cached,
}

/// Per-block facts every step needs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockContext {
    pub block: BlockId,
    pub sap: usize,
    pub nr_coherent_tabs: usize,
    pub nr_incoherent_tabs: usize,
    pub central_frequency: f64,
}

impl BlockContext {
    pub fn for_block(settings: &ObservationSettings, block: BlockId) -> Result<Self, PipelineError> {
        let subband = settings.subbands.get(block.global_subband).ok_or_else(|| {
            PipelineError::InputMismatch(format!(
                "subband {} is not part of the observation",
                block.global_subband
            ))
        })?;
        if block.local_subband >= settings.nr_subbands_per_subband_proc {
            return Err(PipelineError::InputMismatch(format!(
                "local subband {} exceeds the {} this processor handles",
                block.local_subband, settings.nr_subbands_per_subband_proc
            )));
        }
        let sap = settings.saps.get(subband.sap).ok_or_else(|| {
            PipelineError::InputMismatch(format!("unknown SAP {}", subband.sap))
        })?;
        Ok(Self {
            block,
            sap: subband.sap,
            nr_coherent_tabs: sap.nr_coherent_tabs,
            nr_incoherent_tabs: sap.nr_incoherent_tabs,
            central_frequency: subband.central_frequency,
        })
    }
}

/// Kernel parameters of one step, before routing.
#[derive(Clone, Debug)]
pub enum StepFactories {
    Preprocessing(PreprocessingFactories),
    Correlator(CorrelatorFactories),
    Coherent(CoherentFactories),
    Incoherent(IncoherentFactories),
}

impl StepFactories {
    /// Factories of every active step, in processing order.
    pub fn for_settings(settings: &ObservationSettings) -> Vec<StepFactories> {
        let mut steps = Vec::new();
        if settings.beam_former_enabled() {
            steps.push(StepFactories::Preprocessing(PreprocessingFactories::new(settings)));
        }
        if settings.correlator_enabled() {
            steps.push(StepFactories::Correlator(CorrelatorFactories::new(settings)));
        }
        if settings.coherent_enabled() {
            steps.push(StepFactories::Coherent(CoherentFactories::new(settings)));
        }
        if settings.incoherent_enabled() {
            steps.push(StepFactories::Incoherent(IncoherentFactories::new(settings)));
        }
        steps
    }

    pub fn kind(&self) -> StepKind {
        match self {
            StepFactories::Preprocessing(_) => StepKind::Preprocessing,
            StepFactories::Correlator(_) => StepKind::Correlator,
            StepFactories::Coherent(_) => StepKind::Coherent,
            StepFactories::Incoherent(_) => StepKind::Incoherent,
        }
    }

    /// Kernel parameters in launch order.
    pub fn specs(&self) -> Vec<&dyn KernelSpec> {
        match self {
            StepFactories::Preprocessing(f) => f.specs(),
            StepFactories::Correlator(f) => f.specs(),
            StepFactories::Coherent(f) => f.specs(),
            StepFactories::Incoherent(f) => f.specs(),
        }
    }

    /// Name and placement of every stage, for the route planner.
    pub fn stages(&self) -> Vec<(KernelName, Placement)> {
        self.specs()
            .iter()
            .map(|spec| (spec.name(), spec.placement()))
            .collect()
    }

    /// Register this step's needs on every region its route touches.
    pub fn require(&self, route: &Route, budget: &mut BufferBudget) {
        for (spec, stage) in self.specs().iter().zip(&route.stages) {
            budget.require(stage.input, Some(spec.name()), spec.buffer_size(BufferType::Input));
            budget.require(stage.output, Some(spec.name()), spec.buffer_size(BufferType::Output));
        }
    }

    /// Bind every kernel to its routed regions.
    pub fn bind<Q: DeviceQueue + ?Sized>(
        &self,
        route: Route,
        arena: &BufferArena,
        queue: &mut Q,
    ) -> Result<ProcessStep, PipelineError> {
        Ok(match self {
            StepFactories::Preprocessing(f) => ProcessStep::Preprocessing(f.bind(route, arena, queue)?),
            StepFactories::Correlator(f) => ProcessStep::Correlator(f.bind(route, arena, queue)?),
            StepFactories::Coherent(f) => ProcessStep::Coherent(f.bind(route, arena, queue)?),
            StepFactories::Incoherent(f) => ProcessStep::Incoherent(f.bind(route, arena, queue)?),
        })
    }
}

/// Walks a route, binding one kernel per stage.
pub(crate) struct Binder<'a, Q: ?Sized> {
    stages: vec::IntoIter<Stage>,
    arena: &'a BufferArena,
    queue: &'a mut Q,
    owner: StepKind,
}

impl<'a, Q: DeviceQueue + ?Sized> Binder<'a, Q> {
    pub(crate) fn new(route: &Route, arena: &'a BufferArena, queue: &'a mut Q) -> Self {
        Self {
            stages: route.stages.clone().into_iter(),
            arena,
            queue,
            owner: route.step,
        }
    }

    pub(crate) fn bind(&mut self, spec: &dyn KernelSpec) -> Result<Kernel, PipelineError> {
        let stage = self
            .stages
            .next()
            .filter(|s| s.kernel == spec.name())
            .ok_or(PipelineError::Unroutable { step: self.owner })?;
        Kernel::bind(
            spec,
            stage.input,
            stage.output,
            self.arena,
            &mut *self.queue,
            &self.owner.to_string(),
        )
    }

    pub(crate) fn bind_opt<S: KernelSpec>(
        &mut self,
        spec: &Option<S>,
    ) -> Result<Option<Kernel>, PipelineError> {
        spec.as_ref().map(|s| self.bind(s)).transpose()
    }

    pub(crate) fn queue(&mut self) -> &mut Q {
        &mut *self.queue
    }
}

/// Upload the three per-station delay tables of `kernel`.
pub(crate) fn upload_station_delays<Q: DeviceQueue + ?Sized>(
    kernel: &Kernel,
    queue: &mut Q,
    input: &InputData,
    counter: &PerformanceCounter,
) -> Result<(), PipelineError> {
    for (table, data) in [
        (BufferType::DelaysAtBegin, &input.delays_at_begin),
        (BufferType::DelaysAfterEnd, &input.delays_after_end),
        (BufferType::PhaseOffsets, &input.phase_offsets),
    ] {
        kernel.write_table(queue, table, table_bytes(data)?, Some(counter))?;
    }
    Ok(())
}

/// An active step with its bound kernels.
#[derive(Debug)]
pub enum ProcessStep {
    Preprocessing(PreprocessingStep),
    Correlator(CorrelatorStep),
    Coherent(CoherentStep),
    Incoherent(IncoherentStep),
}

impl ProcessStep {
    pub fn kind(&self) -> StepKind {
        match self {
            ProcessStep::Preprocessing(_) => StepKind::Preprocessing,
            ProcessStep::Correlator(_) => StepKind::Correlator,
            ProcessStep::Coherent(_) => StepKind::Coherent,
            ProcessStep::Incoherent(_) => StepKind::Incoherent,
        }
    }

    pub fn route(&self) -> &Route {
        match self {
            ProcessStep::Preprocessing(s) => s.route(),
            ProcessStep::Correlator(s) => s.route(),
            ProcessStep::Coherent(s) => s.route(),
            ProcessStep::Incoherent(s) => s.route(),
        }
    }

    /// Queue the per-block tables this step needs beyond the samples.
    pub fn write_input<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        input: &InputData,
        ctx: &BlockContext,
        upload: DelayUpload,
    ) -> Result<(), PipelineError> {
        match self {
            ProcessStep::Preprocessing(s) => s.write_input(queue, input, upload),
            ProcessStep::Correlator(s) => s.write_input(queue, input, upload),
            ProcessStep::Coherent(s) => s.write_input(queue, input, ctx, upload),
            ProcessStep::Incoherent(_) => Ok(()),
        }
    }

    /// Enqueue the kernel sequence for one block.
    pub fn process<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        ctx: &BlockContext,
    ) -> Result<(), PipelineError> {
        match self {
            ProcessStep::Preprocessing(s) => s.process(queue, ctx),
            ProcessStep::Correlator(s) => s.process(queue, ctx),
            ProcessStep::Coherent(s) => s.process(queue, ctx),
            ProcessStep::Incoherent(s) => s.process(queue, ctx),
        }
    }

    /// Queue the readback of this step's product into `output`.
    pub fn read_output<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        output: &mut OutputData,
        ctx: &BlockContext,
    ) -> Result<(), PipelineError> {
        match self {
            ProcessStep::Preprocessing(_) => Ok(()),
            ProcessStep::Correlator(s) => s.read_output(queue, output),
            ProcessStep::Coherent(s) => s.read_output(queue, output, ctx),
            ProcessStep::Incoherent(s) => s.read_output(queue, output, ctx),
        }
    }

    /// Copy this step's read-back into `output`; valid after `synchronize`.
    pub fn land_output<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        output: &mut OutputData,
    ) -> Result<(), PipelineError> {
        match self {
            ProcessStep::Preprocessing(_) => Ok(()),
            ProcessStep::Correlator(s) => s.land_output(queue, output),
            ProcessStep::Coherent(s) => s.land_output(queue, output),
            ProcessStep::Incoherent(s) => s.land_output(queue, output),
        }
    }

    /// Drop a read-back left behind by a failed block.
    pub fn discard_pending<Q: DeviceQueue + ?Sized>(&mut self, queue: &mut Q) {
        match self {
            ProcessStep::Preprocessing(_) => {}
            ProcessStep::Correlator(s) => s.discard_pending(queue),
            ProcessStep::Coherent(s) => s.discard_pending(queue),
            ProcessStep::Incoherent(s) => s.discard_pending(queue),
        }
    }

    /// Host work that may overlap with the device draining the queue.
    pub fn process_cpu(
        &mut self,
        input: &InputData,
        output: &mut OutputData,
        ctx: &BlockContext,
    ) -> Result<(), PipelineError> {
        match self {
            ProcessStep::Correlator(s) => s.process_cpu(input, output, ctx),
            _ => Ok(()),
        }
    }

    /// Finish a block on the host once its readback has landed.
    ///
    /// Sets the output's emit flag for this step's product.
    pub fn postprocess(&mut self, output: &mut OutputData, ctx: &BlockContext) {
        match self {
            ProcessStep::Preprocessing(_) => {}
            ProcessStep::Correlator(s) => {
                output.emit_correlated = s.postprocess(output, ctx);
            }
            ProcessStep::Coherent(_) => {
                output.emit_coherent = ctx.nr_coherent_tabs > 0;
            }
            ProcessStep::Incoherent(_) => {
                output.emit_incoherent = ctx.nr_incoherent_tabs > 0;
            }
        }
    }
}
