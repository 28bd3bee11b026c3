//! The per-queue orchestrator.
//!
//! A `SubbandProc` owns one device queue, one buffer arena sized for every
//! active step, and the steps themselves. Each block walks a fixed state
//! sequence:
//!
//! ```text
//! Idle -> Uploading -> DelayCacheCheck -> Enqueuing -> ReadingBack
//!      -> PostProcessing (host work while the queue drains)
//!      -> Synchronizing (read-backs land) -> Idle
//! ```
//!
//! `postprocess_subband` runs afterwards. An error leaves the state at the
//! phase that failed and further blocks are refused with
//! [`PipelineError::Stalled`] until [`SubbandProc::reset`] is called.

use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::device::arena::{BufferArena, BufferBudget, Region};
use crate::device::{DeviceQueue, PerformanceCounter};
use crate::error::PipelineError;
use crate::parset::ObservationSettings;
use crate::pipeline::input::InputData;
use crate::pipeline::output::OutputData;
use crate::pipeline::stats::ProcStats;
use crate::steps::{routing, BlockContext, DelayUpload, ProcessStep, Route, StepFactories, StepKind};

/// Phase of the block currently in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    Idle,
    Uploading,
    DelayCacheCheck,
    Enqueuing,
    ReadingBack,
    PostProcessing,
    Synchronizing,
}

/// Remembers which (SAP, block) pair the device's delay tables belong to.
#[derive(Clone, Debug, Default)]
pub struct DelayUploadCache {
    previous: Option<(usize, u64)>,
    uploads: u64,
}

impl DelayUploadCache {
    /// Decide whether the tables for (`sap`, `block`) must be uploaded.
    pub fn check(&mut self, sap: usize, block: u64) -> DelayUpload {
        if self.previous == Some((sap, block)) {
            return DelayUpload::Cached;
        }
        self.previous = Some((sap, block));
        self.uploads += 1;
        DelayUpload::Upload
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    /// Forget the cached pair; the next check uploads.
    pub fn invalidate(&mut self) {
        self.previous = None;
    }
}

pub struct SubbandProc<Q: DeviceQueue> {
    settings: ObservationSettings,
    queue: Q,
    budget: BufferBudget,
    arena: BufferArena,
    steps: Vec<ProcessStep>,
    delay_cache: DelayUploadCache,
    state: ProcState,
    stats: ProcStats,
    sample_counter: PerformanceCounter,
}

impl<Q: DeviceQueue> SubbandProc<Q> {
    /// Validate `settings`, size and allocate the arena, and bind every step.
    ///
    /// All configuration and sizing errors surface here; a returned
    /// `SubbandProc` never fails a block for sizing reasons.
    pub fn new(settings: ObservationSettings, mut queue: Q) -> Result<Self, PipelineError> {
        settings.validate()?;

        let factories = StepFactories::for_settings(&settings);
        let shared_input = settings.correlator_enabled() && settings.beam_former_enabled();
        let mut budget = BufferBudget::new(!shared_input);

        let stages: Vec<_> = factories.iter().map(|f| (f.kind(), f.stages())).collect();
        let routes = routing::plan_routes(&budget, &stages)?;

        budget.require(Region::Input, None, settings.input_block_bytes());
        for (factory, route) in factories.iter().zip(&routes) {
            factory.require(route, &mut budget);
        }

        let arena = BufferArena::allocate(&mut queue, &budget)?;
        let steps = factories
            .iter()
            .zip(routes)
            .map(|(factory, route)| factory.bind(route, &arena, &mut queue))
            .collect::<Result<Vec<_>, _>>()?;

        let kinds: Vec<String> = steps.iter().map(|s| s.kind().to_string()).collect();
        info!(
            "subband processor ready: {} stations, {} steps [{}]",
            settings.nr_stations,
            steps.len(),
            kinds.join(", ")
        );
        for step in &steps {
            info!("  route {}", step.route());
        }
        for (region, bytes) in budget.regions() {
            info!("  region {}: {} bytes", region, bytes);
        }

        Ok(Self {
            settings,
            queue,
            budget,
            arena,
            steps,
            delay_cache: DelayUploadCache::default(),
            state: ProcState::Idle,
            stats: ProcStats::default(),
            sample_counter: PerformanceCounter::new("input.samples"),
        })
    }

    fn transition(&mut self, next: ProcState) {
        trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run one block through the device.
    ///
    /// On return every read-back into `output` has completed and the host
    /// work of the block is done; `postprocess_subband` finishes it.
    pub fn process_subband(
        &mut self,
        input: &InputData,
        output: &mut OutputData,
    ) -> Result<(), PipelineError> {
        if self.state != ProcState::Idle {
            return Err(PipelineError::Stalled(self.state));
        }
        let started = Instant::now();
        input.check(&self.settings)?;
        let ctx = BlockContext::for_block(&self.settings, input.block)?;
        debug!(
            "{}: SAP {}, {} coherent / {} incoherent beams",
            ctx.block, ctx.sap, ctx.nr_coherent_tabs, ctx.nr_incoherent_tabs
        );

        self.transition(ProcState::Uploading);
        let samples = self
            .arena
            .get(Region::Input)
            .ok_or_else(|| PipelineError::InvalidConfig("no input region allocated".into()))?;
        self.queue
            .write_buffer(samples, input.samples.as_bytes()?, Some(&self.sample_counter))?;

        self.transition(ProcState::DelayCacheCheck);
        let upload = self.delay_cache.check(ctx.sap, ctx.block.block);
        debug!("{}: delay tables {:?}", ctx.block, upload);

        self.transition(ProcState::Enqueuing);
        for step in &mut self.steps {
            step.write_input(&mut self.queue, input, &ctx, upload)?;
        }
        for step in &mut self.steps {
            step.process(&mut self.queue, &ctx)?;
        }

        self.transition(ProcState::ReadingBack);
        for step in &mut self.steps {
            step.read_output(&mut self.queue, output, &ctx)?;
        }

        let submit_elapsed = started.elapsed();

        self.transition(ProcState::PostProcessing);
        let cpu_started = Instant::now();
        for step in &mut self.steps {
            step.process_cpu(input, output, &ctx)?;
        }
        let cpu_elapsed = cpu_started.elapsed();

        self.transition(ProcState::Synchronizing);
        let sync_started = Instant::now();
        self.queue.synchronize()?;
        for step in &mut self.steps {
            step.land_output(&mut self.queue, output)?;
        }
        let sync_elapsed = sync_started.elapsed();

        output.block = input.block;
        self.transition(ProcState::Idle);

        let block = ctx.block.block;
        self.stats.blocks += 1;
        self.stats.delay_uploads = self.delay_cache.uploads();
        self.stats.submit.record(block, submit_elapsed);
        self.stats.cpu_overlap.record(block, cpu_elapsed);
        self.stats.synchronize.record(block, sync_elapsed);
        self.stats.block_latency.record(block, started.elapsed());
        Ok(())
    }

    /// Recover from a failed block.
    ///
    /// Drains the queue, drops read-backs the failed block left queued and
    /// forgets the cached delay tables, whose upload may not have landed.
    /// Integration and flag history are kept.
    pub fn reset(&mut self) -> Result<(), PipelineError> {
        if self.state == ProcState::Idle {
            return Ok(());
        }
        warn!("resetting subband processor stalled in {:?}", self.state);
        self.queue.synchronize()?;
        for step in &mut self.steps {
            step.discard_pending(&mut self.queue);
        }
        self.delay_cache.invalidate();
        self.stats.resets += 1;
        self.transition(ProcState::Idle);
        Ok(())
    }

    /// Finish `output` on the host and decide what it delivers.
    ///
    /// Sets the `emit_*` flags and returns whether any is set. A correlator
    /// block that only advances an integration returns `false` for its
    /// visibilities; that is the normal case, not an error.
    pub fn postprocess_subband(&mut self, output: &mut OutputData) -> Result<bool, PipelineError> {
        let ctx = BlockContext::for_block(&self.settings, output.block)?;
        output.emit_coherent = false;
        output.emit_incoherent = false;
        output.emit_correlated = false;
        for step in &mut self.steps {
            step.postprocess(output, &ctx);
        }
        debug!(
            "{}: emit coherent={} incoherent={} correlated={}",
            ctx.block, output.emit_coherent, output.emit_incoherent, output.emit_correlated
        );
        Ok(output.any_emitted())
    }

    pub fn settings(&self) -> &ObservationSettings {
        &self.settings
    }

    pub fn steps(&self) -> &[ProcessStep] {
        &self.steps
    }

    pub fn step_kinds(&self) -> Vec<StepKind> {
        self.steps.iter().map(ProcessStep::kind).collect()
    }

    pub fn routes(&self) -> Vec<&Route> {
        self.steps.iter().map(ProcessStep::route).collect()
    }

    pub fn budget(&self) -> &BufferBudget {
        &self.budget
    }

    pub fn arena(&self) -> &BufferArena {
        &self.arena
    }

    pub fn delay_cache(&self) -> &DelayUploadCache {
        &self.delay_cache
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn stats(&self) -> &ProcStats {
        &self.stats
    }

    pub fn sample_counter(&self) -> &PerformanceCounter {
        &self.sample_counter
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::{HostMemory, HostQueue, QueueOp};
    use crate::device::KernelLaunch;
    use crate::kernels::KernelName;
    use crate::parset::{presets, SapSettings};
    use crate::pipeline::block::BlockId;
    use num_complex::Complex32;

    /// Correlator body writing 1+0i into every visibility.
    fn unit_correlator(queue: &mut HostQueue) {
        queue.register_kernel(
            KernelName::Correlator,
            Box::new(|launch: &KernelLaunch, mem: &mut HostMemory| {
                for c in mem.bytes_mut(launch.output).chunks_exact_mut(8) {
                    c[..4].copy_from_slice(&1.0f32.to_ne_bytes());
                    c[4..].copy_from_slice(&0.0f32.to_ne_bytes());
                }
            }),
        );
    }

    fn build(settings: ObservationSettings) -> SubbandProc<HostQueue> {
        let mut queue = HostQueue::new();
        unit_correlator(&mut queue);
        SubbandProc::new(settings, queue).unwrap()
    }

    fn run_block(
        proc: &mut SubbandProc<HostQueue>,
        input: &mut InputData,
        output: &mut OutputData,
        block: BlockId,
    ) -> bool {
        input.block = block;
        proc.process_subband(input, output).unwrap();
        proc.postprocess_subband(output).unwrap()
    }

    fn two_saps(first: (usize, usize), second: (usize, usize)) -> ObservationSettings {
        presets::beam_former(
            3,
            vec![
                SapSettings {
                    nr_coherent_tabs: first.0,
                    nr_incoherent_tabs: first.1,
                },
                SapSettings {
                    nr_coherent_tabs: second.0,
                    nr_incoherent_tabs: second.1,
                },
            ],
        )
    }

    #[test]
    fn test_region_size_is_max_requirement() {
        for settings in [
            presets::correlator(3, 1),
            presets::correlator(3, 64),
            presets::combined(4),
            two_saps((3, 0), (1, 1)),
        ] {
            let proc = build(settings);
            let budget = proc.budget();
            for (region, bytes) in budget.regions() {
                let max = budget
                    .requirements()
                    .iter()
                    .filter(|r| budget.same(r.region, region))
                    .map(|r| r.bytes)
                    .max()
                    .unwrap_or(0);
                assert_eq!(bytes, max, "region {}", region);
                assert_eq!(proc.arena().size(region), bytes);
            }
        }
    }

    #[test]
    fn test_combined_keeps_input_separate() {
        let proc = build(presets::combined(3));
        assert!(!proc.budget().input_aliases_a());
        assert_eq!(
            proc.step_kinds(),
            vec![
                StepKind::Preprocessing,
                StepKind::Correlator,
                StepKind::Coherent,
                StepKind::Incoherent
            ]
        );
        assert_eq!(
            proc.arena().size(Region::Input),
            proc.settings().input_block_bytes()
        );
    }

    #[test]
    fn test_delay_tables_upload_once_per_sap_block() {
        let settings = presets::correlator(3, 16);
        let mut proc = build(settings.clone());
        let mut input = InputData::new(&settings);
        let mut output = OutputData::new(&settings);

        for _ in 0..4 {
            run_block(&mut proc, &mut input, &mut output, BlockId::new(5, 0, 0));
        }
        assert_eq!(proc.queue().writes_to("DelaysAtBegin"), 1);
        assert_eq!(proc.delay_cache().uploads(), 1);

        run_block(&mut proc, &mut input, &mut output, BlockId::new(6, 0, 0));
        assert_eq!(proc.queue().writes_to("DelaysAtBegin"), 2);
        assert_eq!(proc.stats().delay_uploads, 2);
        assert_eq!(proc.stats().blocks, 5);
        let report = proc.stats().report();
        assert!(report.stages.iter().all(|s| s.blocks == 5));
    }

    #[test]
    fn test_beam_former_delays_upload_once_per_sap_block() {
        let settings = presets::combined(3);
        let mut proc = build(settings.clone());
        let mut input = InputData::new(&settings);
        let mut output = OutputData::new(&settings);

        for _ in 0..4 {
            run_block(&mut proc, &mut input, &mut output, BlockId::new(5, 0, 0));
        }
        // preprocessing and correlator each hold a DelaysAtBegin table
        assert_eq!(proc.queue().writes_to("BeamFormerDelays"), 1);
        assert_eq!(proc.queue().writes_to("DelaysAtBegin"), 2);

        run_block(&mut proc, &mut input, &mut output, BlockId::new(6, 0, 0));
        assert_eq!(proc.queue().writes_to("BeamFormerDelays"), 2);
        assert_eq!(proc.queue().writes_to("DelaysAtBegin"), 4);
        assert_eq!(proc.delay_cache().uploads(), 2);
    }

    #[test]
    fn test_failed_block_refuses_more_until_reset() {
        let settings = presets::correlator(3, 16);
        let mut proc = build(settings.clone());
        let mut input = InputData::new(&settings);
        let mut output = OutputData::new(&settings);
        assert!(run_block(&mut proc, &mut input, &mut output, BlockId::new(0, 0, 0)));

        proc.queue_mut().fail_launches_of(Some(KernelName::Correlator));
        input.block = BlockId::new(1, 0, 0);
        let err = proc.process_subband(&input, &mut output).unwrap_err();
        assert!(matches!(err, PipelineError::Device(_)));
        assert_eq!(proc.state(), ProcState::Enqueuing);

        proc.queue_mut().fail_launches_of(None);
        let err = proc.process_subband(&input, &mut output).unwrap_err();
        assert!(matches!(err, PipelineError::Stalled(ProcState::Enqueuing)));

        proc.reset().unwrap();
        assert_eq!(proc.state(), ProcState::Idle);
        assert_eq!(proc.queue().pending_reads(), 0);

        // the failed block's delay upload is not trusted after a reset
        let uploads = proc.queue().writes_to("DelaysAtBegin");
        assert!(run_block(&mut proc, &mut input, &mut output, BlockId::new(1, 0, 0)));
        assert_eq!(proc.queue().writes_to("DelaysAtBegin"), uploads + 1);
        assert_eq!(proc.state(), ProcState::Idle);
        assert_eq!(proc.stats().resets, 1);
        assert_eq!(proc.stats().blocks, 2);
    }

    #[test]
    fn test_read_backs_land_after_synchronize() {
        let settings = presets::combined(3);
        let mut proc = build(settings.clone());
        let mut input = InputData::new(&settings);
        let mut output = OutputData::new(&settings);
        proc.queue_mut().clear_log();

        run_block(&mut proc, &mut input, &mut output, BlockId::new(0, 0, 0));
        let log = proc.queue().log();
        let sync = log
            .iter()
            .position(|op| matches!(op, QueueOp::Synchronize))
            .unwrap();
        assert!(log[..sync].iter().any(|op| matches!(op, QueueOp::Read { .. })));
        assert_eq!(proc.queue().pending_reads(), 0);
        assert!(output.correlated.visibilities[[0, 0, 1, 0, 0]].re > 0.0);
    }

    #[test]
    fn test_delay_cache_distinguishes_saps() {
        let mut cache = DelayUploadCache::default();
        assert_eq!(cache.check(0, 1), DelayUpload::Upload);
        assert_eq!(cache.check(0, 1), DelayUpload::Cached);
        assert_eq!(cache.check(1, 1), DelayUpload::Upload);
        assert_eq!(cache.check(0, 1), DelayUpload::Upload);
        cache.invalidate();
        assert_eq!(cache.check(0, 1), DelayUpload::Upload);
        assert_eq!(cache.uploads(), 4);
    }

    #[test]
    fn test_output_narrowed_to_sap_beam_count() {
        let settings = two_saps((3, 1), (1, 0));
        let mut proc = build(settings.clone());
        let mut input = InputData::new(&settings);
        let mut output = OutputData::new(&settings);
        assert_eq!(output.coherent.max_nr_beams(), 3);

        // subband 1 belongs to SAP 1
        let emitted = run_block(&mut proc, &mut input, &mut output, BlockId::new(0, 1, 0));
        assert!(emitted);
        assert_eq!(output.coherent.nr_beams(), 1);
        assert_eq!(output.coherent.view().unwrap().dim().0, 1);
        assert_eq!(output.incoherent.nr_beams(), 0);
        assert!(output.emit_coherent);
        assert!(!output.emit_incoherent);
        assert!(!proc
            .queue()
            .launched_kernels()
            .contains(&KernelName::IncoherentStokes));

        run_block(&mut proc, &mut input, &mut output, BlockId::new(0, 0, 0));
        assert_eq!(output.coherent.nr_beams(), 3);
        assert_eq!(output.incoherent.nr_beams(), 1);
        assert!(output.emit_incoherent);
    }

    #[test]
    fn test_zero_incoherent_beams_is_not_an_error() {
        let settings = two_saps((2, 0), (0, 1));
        let mut proc = build(settings.clone());
        let mut input = InputData::new(&settings);
        let mut output = OutputData::new(&settings);

        run_block(&mut proc, &mut input, &mut output, BlockId::new(0, 0, 0));
        assert_eq!(output.incoherent.nr_beams(), 0);
        assert_eq!(output.incoherent.view().unwrap().len(), 0);
        assert_eq!(proc.state(), ProcState::Idle);

        // and the other way round
        run_block(&mut proc, &mut input, &mut output, BlockId::new(1, 1, 0));
        assert_eq!(output.coherent.nr_beams(), 0);
        assert_eq!(output.incoherent.nr_beams(), 1);
    }

    #[test]
    fn test_integration_flushes_on_depth() {
        let mut settings = presets::correlator(3, 16);
        settings.correlator.nr_blocks_per_integration = 3;
        let nspi = settings.correlator.nr_samples_per_integration(settings.block_size);
        let mut proc = build(settings.clone());
        let mut input = InputData::new(&settings);
        let mut output = OutputData::new(&settings);

        let ready: Vec<bool> = (0..6)
            .map(|b| run_block(&mut proc, &mut input, &mut output, BlockId::new(b, 0, 0)))
            .collect();
        assert_eq!(ready, vec![false, false, true, false, false, true]);

        let corr = &output.correlated;
        assert_eq!(corr.nr_valid_samples[[0, 0, 1]], 3 * nspi as u32);
        // three unit blocks over 3 * nspi samples
        let expected = 1.0 / nspi as f32;
        assert!((corr.visibilities[[0, 0, 1, 0, 0]].re - expected).abs() < 1e-6);
        assert_eq!(corr.visibilities[[0, 0, 0, 1, 1]], Complex32::new(0.0, 0.0));
    }

    #[test]
    fn test_single_channel_three_stations() {
        let settings = presets::correlator(3, 1);
        let nspi = settings.correlator.nr_samples_per_integration(settings.block_size);
        let mut proc = build(settings.clone());
        let mut input = InputData::new(&settings);
        let mut output = OutputData::new(&settings);

        assert!(run_block(&mut proc, &mut input, &mut output, BlockId::new(0, 0, 0)));
        assert!(output.emit_correlated);

        let corr = &output.correlated;
        assert_eq!(corr.nr_valid_samples.dim(), (1, 6, 1));
        assert!(corr.nr_valid_samples.iter().all(|&n| n as usize == nspi));
        let w = 1.0 / nspi as f32;
        assert!(corr
            .visibilities
            .iter()
            .all(|v| *v == Complex32::new(w, 0.0)));
    }

    #[test]
    fn test_polyphase_channel_zero_is_zero_weighted() {
        let settings = presets::correlator(3, 16);
        let mut proc = build(settings.clone());
        let mut input = InputData::new(&settings);
        let mut output = OutputData::new(&settings);

        run_block(&mut proc, &mut input, &mut output, BlockId::new(0, 0, 0));
        let corr = &output.correlated;
        for bl in 0..6 {
            assert_eq!(corr.nr_valid_samples[[0, bl, 0]], 0);
            assert!(corr.nr_valid_samples[[0, bl, 1]] > 0);
            for p in 0..4 {
                assert_eq!(
                    corr.visibilities[[0, bl, 0, p / 2, p % 2]],
                    Complex32::new(0.0, 0.0)
                );
            }
            assert!(corr.visibilities[[0, bl, 1, 0, 0]].re > 0.0);
        }
    }

    #[test]
    fn test_fully_flagged_station_gets_zero_weight() {
        let settings = presets::correlator(3, 1);
        let mut proc = build(settings.clone());
        let mut input = InputData::new(&settings);
        let mut output = OutputData::new(&settings);
        input.flags[1].include(0, settings.block_size);

        run_block(&mut proc, &mut input, &mut output, BlockId::new(0, 0, 0));
        let corr = &output.correlated;
        for s2 in 0..3 {
            for s1 in 0..=s2 {
                let bl = crate::config::baseline(s1, s2);
                let v = corr.visibilities[[0, bl, 0, 0, 0]];
                assert!(v.re.is_finite());
                if s1 == 1 || s2 == 1 {
                    assert_eq!(corr.nr_valid_samples[[0, bl, 0]], 0);
                    assert_eq!(v, Complex32::new(0.0, 0.0));
                } else {
                    assert!(v.re > 0.0);
                }
            }
        }
    }

    #[test]
    fn test_kernels_enqueued_in_step_order() {
        let settings = presets::combined(3);
        let mut proc = build(settings.clone());
        let mut input = InputData::new(&settings);
        let mut output = OutputData::new(&settings);
        proc.queue_mut().clear_log();

        run_block(&mut proc, &mut input, &mut output, BlockId::new(0, 0, 0));
        let launched = proc.queue().launched_kernels();
        let position = |k: KernelName| launched.iter().position(|&l| l == k).unwrap();
        assert_eq!(launched[0], KernelName::IntToFloat);
        assert!(position(KernelName::BandPassCorrection) < position(KernelName::Correlator));
        assert!(position(KernelName::Correlator) < position(KernelName::BeamFormer));
        assert!(position(KernelName::CoherentStokes) < position(KernelName::IncoherentStokes));
        assert_eq!(proc.state(), ProcState::Idle);
        assert_eq!(proc.sample_counter().bytes() as usize, settings.input_block_bytes());
    }

    #[test]
    fn test_mismatched_input_is_rejected() {
        let settings = presets::correlator(3, 16);
        let mut proc = build(settings.clone());
        let mut output = OutputData::new(&settings);
        let other = presets::correlator(4, 16);
        let input = InputData::new(&other);

        let err = proc.process_subband(&input, &mut output).unwrap_err();
        assert!(matches!(err, PipelineError::InputMismatch(_)));
    }

    #[test]
    fn test_device_memory_shortage_fails_construction() {
        let queue = HostQueue::new().with_memory_limit(1024);
        let err = SubbandProc::new(presets::combined(3), queue)
            .err()
            .expect("construction should fail");
        assert!(matches!(err, PipelineError::Device(_)));
    }

    #[test]
    fn test_invalid_settings_fail_construction() {
        let mut settings = presets::correlator(3, 16);
        settings.nr_bits_per_sample = 4;
        assert!(matches!(
            SubbandProc::new(settings, HostQueue::new()).err(),
            Some(PipelineError::InvalidConfig(_))
        ));
    }
}
