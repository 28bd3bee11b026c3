//! Incoherent beam chain: per-station power, summed over stations.

use crate::config::{NR_POLARIZATIONS, NR_TAPS, SIZEOF_FCOMPLEX};
use crate::device::arena::BufferArena;
use crate::device::{DeviceBuffer, DeviceQueue, Immediate, PendingRead, PerformanceCounter};
use crate::error::PipelineError;
use crate::kernels::beamform::TransposeParams;
use crate::kernels::filter::{filter_bank_weights, FftParams, FirFilterParams};
use crate::kernels::stokes::IncoherentStokesParams;
use crate::kernels::{BufferType, Kernel, KernelSpec, Placement};
use crate::parset::ObservationSettings;
use crate::pipeline::output::OutputData;

use super::{Binder, BlockContext, Route};

#[derive(Clone, Debug)]
pub struct IncoherentFactories {
    transpose: TransposeParams,
    inverse_fft: FftParams,
    fir: Option<FirFilterParams>,
    fft: Option<FftParams>,
    stokes: IncoherentStokesParams,
}

impl IncoherentFactories {
    pub fn new(settings: &ObservationSettings) -> Self {
        let bf = &settings.beam_former;
        let out = &bf.incoherent;
        let nr_stations = settings.nr_stations;
        let block_size = settings.block_size;
        let hr_channels = bf.nr_high_resolution_channels;
        let nr_station_samples = nr_stations * NR_POLARIZATIONS * block_size;

        let (fir, fft) = if out.nr_channels > 1 {
            (
                Some(FirFilterParams {
                    nr_streams: nr_stations,
                    nr_channels: out.nr_channels,
                    nr_samples_per_channel: block_size / out.nr_channels,
                    nr_subbands: settings.nr_subbands_per_subband_proc,
                    input_sample_bytes: SIZEOF_FCOMPLEX,
                }),
                Some(FftParams {
                    fft_size: out.nr_channels,
                    nr_samples: nr_station_samples,
                    forward: true,
                    placement: Placement::InPlace,
                }),
            )
        } else {
            (None, None)
        };

        Self {
            transpose: TransposeParams {
                nr_streams: nr_stations,
                nr_channels: hr_channels,
                nr_samples_per_channel: block_size / hr_channels,
            },
            inverse_fft: FftParams {
                fft_size: hr_channels,
                nr_samples: nr_station_samples,
                forward: false,
                placement: Placement::InPlace,
            },
            fir,
            fft,
            stokes: IncoherentStokesParams {
                nr_stations,
                max_nr_tabs: settings.max_nr_incoherent_tabs(),
                nr_stokes: out.nr_stokes(),
                nr_channels: out.nr_channels,
                nr_samples_per_channel: block_size / out.nr_channels,
                time_integration_factor: out.time_integration_factor,
            },
        }
    }

    pub fn specs(&self) -> Vec<&dyn KernelSpec> {
        let mut specs: Vec<&dyn KernelSpec> = vec![&self.transpose, &self.inverse_fft];
        if let Some(fir) = &self.fir {
            specs.push(fir);
        }
        if let Some(fft) = &self.fft {
            specs.push(fft);
        }
        specs.push(&self.stokes);
        specs
    }

    pub fn bind<Q: DeviceQueue + ?Sized>(
        &self,
        route: Route,
        arena: &BufferArena,
        queue: &mut Q,
    ) -> Result<IncoherentStep, PipelineError> {
        let mut binder = Binder::new(&route, arena, queue);
        let transpose = binder.bind(&self.transpose)?;
        let inverse_fft = binder.bind(&self.inverse_fft)?;
        let fir = binder.bind_opt(&self.fir)?;
        let fft = binder.bind_opt(&self.fft)?;
        let stokes = binder.bind(&self.stokes)?;

        if let (Some(kernel), Some(params)) = (&fir, &self.fir) {
            let weights = filter_bank_weights(params.nr_channels, NR_TAPS);
            kernel.write_table(
                binder.queue(),
                BufferType::FilterWeights,
                bytemuck::cast_slice(&weights),
                None,
            )?;
        }

        let output: DeviceBuffer = stokes.output_buffer().clone();
        Ok(IncoherentStep {
            route,
            transpose,
            inverse_fft,
            fir,
            fft,
            stokes,
            output,
            beam_counter: PerformanceCounter::new("incoherent.beams"),
            pending: None,
        })
    }
}

#[derive(Debug)]
pub struct IncoherentStep {
    route: Route,
    transpose: Kernel,
    inverse_fft: Kernel,
    fir: Option<Kernel>,
    fft: Option<Kernel>,
    stokes: Kernel,
    output: DeviceBuffer,
    beam_counter: PerformanceCounter,
    pending: Option<PendingRead>,
}

impl IncoherentStep {
    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn beam_counter(&self) -> &PerformanceCounter {
        &self.beam_counter
    }

    pub fn process<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        ctx: &BlockContext,
    ) -> Result<(), PipelineError> {
        if ctx.nr_incoherent_tabs == 0 {
            return Ok(());
        }
        let block = ctx.block;
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
        self.stokes.enqueue_with(
            queue,
            block,
            &[("nrTabs", Immediate::U32(ctx.nr_incoherent_tabs as u32))],
        )?;
        Ok(())
    }

    pub fn read_output<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        output: &mut OutputData,
        ctx: &BlockContext,
    ) -> Result<(), PipelineError> {
        output.incoherent.resize_beams(ctx.nr_incoherent_tabs)?;
        if ctx.nr_incoherent_tabs == 0 {
            return Ok(());
        }
        let bytes = output.incoherent.bytes_mut().len();
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
            queue.complete_read(read, output.incoherent.bytes_mut())?;
        }
        Ok(())
    }

    pub fn discard_pending<Q: DeviceQueue + ?Sized>(&mut self, queue: &mut Q) {
        if let Some(read) = self.pending.take() {
            queue.discard_read(read);
        }
    }
}
