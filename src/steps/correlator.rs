//! Correlator chain and its host-side post-processing.
//!
//! Device side: optional polyphase filter bank (FIR + FFT), delay and
//! band-pass correction, correlation. Host side: flag propagation and
//! valid-sample counting while the device works, then integration and
//! weighting once the visibilities are back.

use crate::config::{NR_POLARIZATIONS, NR_TAPS, SIZEOF_FCOMPLEX};
use crate::device::arena::BufferArena;
use crate::device::{DeviceQueue, Immediate, PendingRead, PerformanceCounter};
use crate::error::PipelineError;
use crate::kernels::correction::{unity_bandpass, DelayAndBandPassParams};
use crate::kernels::correlate::CorrelatorParams;
use crate::kernels::filter::{filter_bank_weights, FftParams, FirFilterParams};
use crate::kernels::{BufferType, Kernel, KernelSpec, Placement};
use crate::parset::ObservationSettings;
use crate::pipeline::input::InputData;
use crate::pipeline::output::{CorrelatedData, OutputData};
use crate::postprocess::flags::count_valid_samples;
use crate::postprocess::{apply_weights, FlagPropagator, Integrator};

use super::{upload_station_delays, Binder, BlockContext, DelayUpload, Route};

#[derive(Clone, Debug)]
pub struct CorrelatorFactories {
    /// Filter bank front end; absent for a single channel.
    fir: Option<FirFilterParams>,
    fft: Option<FftParams>,

    delay_and_bandpass: DelayAndBandPassParams,
    correlator: CorrelatorParams,

    nr_subbands: usize,
    nr_blocks_per_integration: usize,
    nr_samples_per_integration: usize,
}

impl CorrelatorFactories {
    pub fn new(settings: &ObservationSettings) -> Self {
        let corr = &settings.correlator;
        let nr_stations = settings.nr_stations;
        let nr_channels = corr.nr_channels;
        let nspc = corr.nr_samples_per_channel(settings.block_size);
        let raw_bytes = settings.bytes_per_input_sample();

        let (fir, fft) = if corr.uses_ppf() {
            (
                Some(FirFilterParams {
                    nr_streams: nr_stations,
                    nr_channels,
                    nr_samples_per_channel: nspc,
                    nr_subbands: settings.nr_subbands_per_subband_proc,
                    input_sample_bytes: raw_bytes,
                }),
                Some(FftParams {
                    fft_size: nr_channels,
                    nr_samples: nr_stations * NR_POLARIZATIONS * settings.block_size,
                    forward: true,
                    placement: Placement::OutOfPlace,
                }),
            )
        } else {
            (None, None)
        };

        Self {
            delay_and_bandpass: DelayAndBandPassParams {
                nr_stations,
                nr_channels,
                nr_samples_per_channel: nspc,
                input_sample_bytes: if corr.uses_ppf() {
                    SIZEOF_FCOMPLEX
                } else {
                    raw_bytes
                },
                delay_compensation: settings.delay_compensation,
                bandpass_correction: settings.bandpass_correction,
                transpose: false,
            },
            correlator: CorrelatorParams {
                nr_stations,
                nr_channels,
                nr_samples_per_channel: nspc,
                nr_integrations_per_block: corr.nr_integrations_per_block,
            },
            fir,
            fft,
            nr_subbands: settings.nr_subbands_per_subband_proc,
            nr_blocks_per_integration: corr.nr_blocks_per_integration,
            nr_samples_per_integration: corr.nr_samples_per_integration(settings.block_size),
        }
    }

    pub fn specs(&self) -> Vec<&dyn KernelSpec> {
        let mut specs: Vec<&dyn KernelSpec> = Vec::with_capacity(4);
        if let Some(fir) = &self.fir {
            specs.push(fir);
        }
        if let Some(fft) = &self.fft {
            specs.push(fft);
        }
        specs.push(&self.delay_and_bandpass);
        specs.push(&self.correlator);
        specs
    }

    pub fn bind<Q: DeviceQueue + ?Sized>(
        &self,
        route: Route,
        arena: &BufferArena,
        queue: &mut Q,
    ) -> Result<CorrelatorStep, PipelineError> {
        let mut binder = Binder::new(&route, arena, queue);
        let fir = binder.bind_opt(&self.fir)?;
        let fft = binder.bind_opt(&self.fft)?;
        let delay_and_bandpass = binder.bind(&self.delay_and_bandpass)?;
        let correlator = binder.bind(&self.correlator)?;

        let queue = binder.queue();
        if let Some(fir) = &fir {
            let weights = filter_bank_weights(self.correlator.nr_channels, NR_TAPS);
            fir.write_table(
                queue,
                BufferType::FilterWeights,
                bytemuck::cast_slice(&weights),
                None,
            )?;
        }
        delay_and_bandpass.write_table(
            queue,
            BufferType::BandPassWeights,
            bytemuck::cast_slice(&unity_bandpass(self.correlator.nr_channels)),
            None,
        )?;

        let template = CorrelatedData::new(
            self.correlator.nr_integrations_per_block,
            self.correlator.nr_baselines(),
            self.correlator.nr_channels,
        );

        Ok(CorrelatorStep {
            route,
            fir,
            fft,
            delay_and_bandpass,
            correlator,
            delay_compensation: self.delay_and_bandpass.delay_compensation,
            flags: FlagPropagator::new(
                self.nr_subbands,
                self.correlator.nr_stations,
                self.correlator.nr_channels,
                self.correlator.nr_samples_per_channel,
            ),
            integrator: Integrator::new(self.nr_subbands, self.nr_blocks_per_integration, &template),
            nr_integrations: self.correlator.nr_integrations_per_block,
            nr_samples_per_integration: self.nr_samples_per_integration,
            uses_ppf: self.fir.is_some(),
            delay_counter: PerformanceCounter::new("correlator.delays"),
            visibility_counter: PerformanceCounter::new("correlator.visibilities"),
            pending: None,
        })
    }
}

#[derive(Debug)]
pub struct CorrelatorStep {
    route: Route,
    fir: Option<Kernel>,
    fft: Option<Kernel>,
    delay_and_bandpass: Kernel,
    correlator: Kernel,
    delay_compensation: bool,

    flags: FlagPropagator,
    integrator: Integrator,
    nr_integrations: usize,
    nr_samples_per_integration: usize,
    uses_ppf: bool,

    delay_counter: PerformanceCounter,
    visibility_counter: PerformanceCounter,
    pending: Option<PendingRead>,
}

impl CorrelatorStep {
    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn uses_ppf(&self) -> bool {
        self.uses_ppf
    }

    pub fn nr_samples_per_integration(&self) -> usize {
        self.nr_samples_per_integration
    }

    pub fn integrator(&self) -> &Integrator {
        &self.integrator
    }

    pub fn visibility_counter(&self) -> &PerformanceCounter {
        &self.visibility_counter
    }

    pub fn write_input<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        input: &InputData,
        upload: DelayUpload,
    ) -> Result<(), PipelineError> {
        if self.delay_compensation && upload == DelayUpload::Upload {
            upload_station_delays(&self.delay_and_bandpass, queue, input, &self.delay_counter)?;
        }
        Ok(())
    }

    pub fn process<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        ctx: &BlockContext,
    ) -> Result<(), PipelineError> {
        let block = ctx.block;
        if let Some(fir) = &self.fir {
            fir.enqueue_with(
                queue,
                block,
                &[("subbandIdx", Immediate::U32(block.local_subband as u32))],
            )?;
        }
        if let Some(fft) = &self.fft {
            fft.enqueue(queue, block)?;
        }
        self.delay_and_bandpass.enqueue_with(
            queue,
            block,
            &[
                ("subbandFrequency", Immediate::F64(ctx.central_frequency)),
                ("sap", Immediate::U32(ctx.sap as u32)),
            ],
        )?;
        self.correlator.enqueue(queue, block)?;
        Ok(())
    }

    pub fn read_output<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        output: &mut OutputData,
    ) -> Result<(), PipelineError> {
        if output.correlated.nr_integrations() != self.nr_integrations {
            return Err(PipelineError::InputMismatch(format!(
                "output holds {} integrations, block produces {}",
                output.correlated.nr_integrations(),
                self.nr_integrations
            )));
        }
        let bytes = output.correlated.bytes_mut()?.len();
        let read = queue.read_buffer(
            self.correlator.output_buffer(),
            bytes,
            Some(&self.visibility_counter),
        )?;
        if let Some(stale) = self.pending.replace(read) {
            queue.discard_read(stale);
        }
        Ok(())
    }

    /// Copy the synchronized visibilities into `output`.
    pub fn land_output<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        output: &mut OutputData,
    ) -> Result<(), PipelineError> {
        if let Some(read) = self.pending.take() {
            queue.complete_read(read, output.correlated.bytes_mut()?)?;
        }
        Ok(())
    }

    pub fn discard_pending<Q: DeviceQueue + ?Sized>(&mut self, queue: &mut Q) {
        if let Some(read) = self.pending.take() {
            queue.discard_read(read);
        }
    }

    /// Propagate flags and count valid samples for this block.
    pub fn process_cpu(
        &mut self,
        input: &InputData,
        output: &mut OutputData,
        ctx: &BlockContext,
    ) -> Result<(), PipelineError> {
        let channel_flags = self.flags.propagate(ctx.block.local_subband, &input.flags);
        count_valid_samples(
            &channel_flags,
            self.nr_samples_per_integration,
            self.uses_ppf,
            &mut output.correlated.nr_valid_samples,
        );
        Ok(())
    }

    /// Integrate the landed visibilities; weight and report them when the
    /// integration completes.
    pub fn postprocess(&mut self, output: &mut OutputData, ctx: &BlockContext) -> bool {
        let local = ctx.block.local_subband;
        if !self.integrator.fold(local, &mut output.correlated) {
            tracing::debug!(
                "{}: integration {}/{}",
                ctx.block,
                self.integrator.folds(local),
                self.integrator.depth()
            );
            return false;
        }
        apply_weights(&mut output.correlated, self.uses_ppf);
        true
    }
}
