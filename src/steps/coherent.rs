//! Coherent (tied-array) beam chain.
//!
//! Forms every beam of the block's SAP from the preprocessed stations,
//! inverts the high-resolution FFT, optionally re-channelises to the
//! requested output resolution and detects Stokes parameters. With XXYY the
//! detection stage is absent and complex voltages are read back as-is.

use crate::config::{NR_POLARIZATIONS, NR_TAPS, SIZEOF_FCOMPLEX};
use crate::device::arena::BufferArena;
use crate::device::{DeviceBuffer, DeviceQueue, Immediate, PendingRead, PerformanceCounter};
use crate::error::PipelineError;
use crate::kernels::beamform::{BeamFormerParams, TransposeParams};
use crate::kernels::filter::{filter_bank_weights, FftParams, FirFilterParams};
use crate::kernels::stokes::CoherentStokesParams;
use crate::kernels::{BufferType, Kernel, KernelSpec, Placement};
use crate::parset::ObservationSettings;
use crate::pipeline::input::{table_bytes, InputData};
use crate::pipeline::output::OutputData;

use super::{Binder, BlockContext, DelayUpload, Route};

#[derive(Clone, Debug)]
pub struct CoherentFactories {
    beam_former: BeamFormerParams,
    transpose: TransposeParams,
    inverse_fft: FftParams,

    /// Re-channelisation; absent for a single output channel.
    fir: Option<FirFilterParams>,
    fft: Option<FftParams>,

    /// Detection; absent for complex voltage output.
    stokes: Option<CoherentStokesParams>,
}

impl CoherentFactories {
    pub fn new(settings: &ObservationSettings) -> Self {
        let bf = &settings.beam_former;
        let out = &bf.coherent;
        let block_size = settings.block_size;
        let max_nr_tabs = settings.max_nr_coherent_tabs();
        let hr_channels = bf.nr_high_resolution_channels;
        let nr_beam_samples = max_nr_tabs * NR_POLARIZATIONS * block_size;

        let (fir, fft) = if out.nr_channels > 1 {
            (
                Some(FirFilterParams {
                    nr_streams: max_nr_tabs,
                    nr_channels: out.nr_channels,
                    nr_samples_per_channel: block_size / out.nr_channels,
                    nr_subbands: settings.nr_subbands_per_subband_proc,
                    input_sample_bytes: SIZEOF_FCOMPLEX,
                }),
                Some(FftParams {
                    fft_size: out.nr_channels,
                    nr_samples: nr_beam_samples,
                    forward: true,
                    placement: Placement::InPlace,
                }),
            )
        } else {
            (None, None)
        };

        let stokes = (!out.stokes_type.is_voltages()).then(|| CoherentStokesParams {
            max_nr_tabs,
            nr_stokes: out.nr_stokes(),
            nr_channels: out.nr_channels,
            nr_samples_per_channel: block_size / out.nr_channels,
            time_integration_factor: out.time_integration_factor,
        });

        Self {
            beam_former: BeamFormerParams {
                nr_stations: settings.nr_stations,
                max_nr_tabs,
                nr_channels: hr_channels,
                nr_samples_per_channel: block_size / hr_channels,
                subband_bandwidth: settings.subband_bandwidth,
            },
            transpose: TransposeParams {
                nr_streams: max_nr_tabs,
                nr_channels: hr_channels,
                nr_samples_per_channel: block_size / hr_channels,
            },
            inverse_fft: FftParams {
                fft_size: hr_channels,
                nr_samples: nr_beam_samples,
                forward: false,
                placement: Placement::InPlace,
            },
            fir,
            fft,
            stokes,
        }
    }

    pub fn specs(&self) -> Vec<&dyn KernelSpec> {
        let mut specs: Vec<&dyn KernelSpec> =
            vec![&self.beam_former, &self.transpose, &self.inverse_fft];
        if let Some(fir) = &self.fir {
            specs.push(fir);
        }
        if let Some(fft) = &self.fft {
            specs.push(fft);
        }
        if let Some(stokes) = &self.stokes {
            specs.push(stokes);
        }
        specs
    }

    pub fn bind<Q: DeviceQueue + ?Sized>(
        &self,
        route: Route,
        arena: &BufferArena,
        queue: &mut Q,
    ) -> Result<CoherentStep, PipelineError> {
        let output = arena
            .get(route.output)
            .cloned()
            .ok_or(PipelineError::Unroutable { step: route.step })?;

        let mut binder = Binder::new(&route, arena, queue);
        let beam_former = binder.bind(&self.beam_former)?;
        let transpose = binder.bind(&self.transpose)?;
        let inverse_fft = binder.bind(&self.inverse_fft)?;
        let fir = binder.bind_opt(&self.fir)?;
        let fft = binder.bind_opt(&self.fft)?;
        let stokes = binder.bind_opt(&self.stokes)?;

        if let (Some(kernel), Some(params)) = (&fir, &self.fir) {
            let weights = filter_bank_weights(params.nr_channels, NR_TAPS);
            kernel.write_table(
                binder.queue(),
                BufferType::FilterWeights,
                bytemuck::cast_slice(&weights),
                None,
            )?;
        }

        Ok(CoherentStep {
            route,
            beam_former,
            transpose,
            inverse_fft,
            fir,
            fft,
            stokes,
            output,
            delay_counter: PerformanceCounter::new("coherent.delays"),
            beam_counter: PerformanceCounter::new("coherent.beams"),
            pending: None,
        })
    }
}

#[derive(Debug)]
pub struct CoherentStep {
    route: Route,
    beam_former: Kernel,
    transpose: Kernel,
    inverse_fft: Kernel,
    fir: Option<Kernel>,
    fft: Option<Kernel>,
    stokes: Option<Kernel>,
    output: DeviceBuffer,

    delay_counter: PerformanceCounter,
    beam_counter: PerformanceCounter,
    pending: Option<PendingRead>,
}

impl CoherentStep {
    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn beam_counter(&self) -> &PerformanceCounter {
        &self.beam_counter
    }

    pub fn produces_voltages(&self) -> bool {
        self.stokes.is_none()
    }

    pub fn write_input<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        input: &InputData,
        ctx: &BlockContext,
        upload: DelayUpload,
    ) -> Result<(), PipelineError> {
        if upload == DelayUpload::Upload && ctx.nr_coherent_tabs > 0 {
            self.beam_former.write_table(
                queue,
                BufferType::BeamFormerDelays,
                table_bytes(&input.tab_delays)?,
                Some(&self.delay_counter),
            )?;
        }
        Ok(())
    }

    pub fn process<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        ctx: &BlockContext,
    ) -> Result<(), PipelineError> {
        if ctx.nr_coherent_tabs == 0 {
            return Ok(());
        }
        let block = ctx.block;
        self.beam_former.enqueue_with(
            queue,
            block,
            &[
                ("nrTabs", Immediate::U32(ctx.nr_coherent_tabs as u32)),
                ("subbandFrequency", Immediate::F64(ctx.central_frequency)),
            ],
        )?;
        self.transpose.enqueue(queue, block)?;
        self.inverse_fft.enqueue(queue, block)?;
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
        if let Some(stokes) = &self.stokes {
            stokes.enqueue(queue, block)?;
        }
        Ok(())
    }

    /// Narrow the output to this SAP's beams and queue their readback.
    pub fn read_output<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        output: &mut OutputData,
        ctx: &BlockContext,
    ) -> Result<(), PipelineError> {
        output.coherent.resize_beams(ctx.nr_coherent_tabs)?;
        if ctx.nr_coherent_tabs == 0 {
            return Ok(());
        }
        let bytes = output.coherent.bytes_mut().len();
        let read = queue.read_buffer(&self.output, bytes, Some(&self.beam_counter))?;
        if let Some(stale) = self.pending.replace(read) {
            queue.discard_read(stale);
        }
        Ok(())
    }

    /// Copy the synchronized beams into `output`.
    pub fn land_output<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        output: &mut OutputData,
    ) -> Result<(), PipelineError> {
        if let Some(read) = self.pending.take() {
            queue.complete_read(read, output.coherent.bytes_mut())?;
        }
        Ok(())
    }

    pub fn discard_pending<Q: DeviceQueue + ?Sized>(&mut self, queue: &mut Q) {
        if let Some(read) = self.pending.take() {
            queue.discard_read(read);
        }
    }
}
