//! Shared front end of the beamformer chains.
//!
//! Converts raw samples to floats, channelises them at delay-compensation
//! resolution, corrects delays and band-pass, and (when the high-resolution
//! channel count asks for it) runs a second FFT. The product lands in the
//! step's output region for the coherent and incoherent steps to read.

use crate::config::{NR_POLARIZATIONS, SIZEOF_FCOMPLEX};
use crate::device::arena::BufferArena;
use crate::device::{DeviceQueue, Immediate, PerformanceCounter};
use crate::error::PipelineError;
use crate::kernels::correction::{
    unity_bandpass, BandPassCorrectionParams, DelayAndBandPassParams, IntToFloatParams,
};
use crate::kernels::filter::{FftParams, FftShiftParams};
use crate::kernels::{BufferType, Kernel, KernelSpec, Placement};
use crate::parset::ObservationSettings;
use crate::pipeline::input::InputData;

use super::{upload_station_delays, Binder, BlockContext, DelayUpload, Route};

#[derive(Clone, Debug)]
pub struct PreprocessingFactories {
    int_to_float: IntToFloatParams,
    fft_shift: FftShiftParams,
    fft: FftParams,
    delay_and_bandpass: DelayAndBandPassParams,

    /// Present when high-resolution channels exceed delay-compensation ones.
    second_fft: Option<(FftShiftParams, FftParams)>,

    bandpass_correction: BandPassCorrectionParams,
}

impl PreprocessingFactories {
    pub fn new(settings: &ObservationSettings) -> Self {
        let bf = &settings.beam_former;
        let nr_stations = settings.nr_stations;
        let nr_samples = nr_stations * NR_POLARIZATIONS * settings.block_size;
        let dc_channels = bf.nr_delay_compensation_channels;
        let hr_channels = bf.nr_high_resolution_channels;

        let second_fft = bf.needs_second_fft().then(|| {
            (
                FftShiftParams { nr_samples },
                FftParams {
                    fft_size: hr_channels / dc_channels,
                    nr_samples,
                    forward: true,
                    placement: Placement::InPlace,
                },
            )
        });

        Self {
            int_to_float: IntToFloatParams {
                nr_stations,
                nr_samples: settings.block_size,
                input_sample_bytes: settings.bytes_per_input_sample(),
            },
            fft_shift: FftShiftParams { nr_samples },
            fft: FftParams {
                fft_size: dc_channels,
                nr_samples,
                forward: true,
                placement: Placement::InPlace,
            },
            delay_and_bandpass: DelayAndBandPassParams {
                nr_stations,
                nr_channels: dc_channels,
                nr_samples_per_channel: settings.block_size / dc_channels,
                input_sample_bytes: SIZEOF_FCOMPLEX,
                delay_compensation: settings.delay_compensation,
                bandpass_correction: settings.bandpass_correction,
                transpose: true,
            },
            second_fft,
            bandpass_correction: BandPassCorrectionParams {
                nr_stations,
                nr_delay_compensation_channels: dc_channels,
                nr_high_resolution_channels: hr_channels,
                nr_samples_per_channel: settings.block_size / hr_channels,
                bandpass_correction: settings.bandpass_correction,
            },
        }
    }

    pub fn has_second_fft(&self) -> bool {
        self.second_fft.is_some()
    }

    pub fn specs(&self) -> Vec<&dyn KernelSpec> {
        let mut specs: Vec<&dyn KernelSpec> = vec![
            &self.int_to_float,
            &self.fft_shift,
            &self.fft,
            &self.delay_and_bandpass,
        ];
        if let Some((shift, fft)) = &self.second_fft {
            specs.push(shift);
            specs.push(fft);
        }
        specs.push(&self.bandpass_correction);
        specs
    }

    pub fn bind<Q: DeviceQueue + ?Sized>(
        &self,
        route: Route,
        arena: &BufferArena,
        queue: &mut Q,
    ) -> Result<PreprocessingStep, PipelineError> {
        let mut binder = Binder::new(&route, arena, queue);
        let int_to_float = binder.bind(&self.int_to_float)?;
        let fft_shift = binder.bind(&self.fft_shift)?;
        let fft = binder.bind(&self.fft)?;
        let delay_and_bandpass = binder.bind(&self.delay_and_bandpass)?;
        let second_fft = match &self.second_fft {
            Some((shift, fft)) => Some((binder.bind(shift)?, binder.bind(fft)?)),
            None => None,
        };
        let bandpass_correction = binder.bind(&self.bandpass_correction)?;

        let counter = PerformanceCounter::new("preprocessing.delays");
        let queue = binder.queue();
        delay_and_bandpass.write_table(
            queue,
            BufferType::BandPassWeights,
            bytemuck::cast_slice(&unity_bandpass(self.delay_and_bandpass.nr_channels)),
            None,
        )?;
        bandpass_correction.write_table(
            queue,
            BufferType::BandPassWeights,
            bytemuck::cast_slice(&unity_bandpass(
                self.bandpass_correction.nr_high_resolution_channels,
            )),
            None,
        )?;

        Ok(PreprocessingStep {
            route,
            int_to_float,
            fft_shift,
            fft,
            delay_and_bandpass,
            second_fft,
            bandpass_correction,
            delay_compensation: self.delay_and_bandpass.delay_compensation,
            counter,
        })
    }
}

#[derive(Debug)]
pub struct PreprocessingStep {
    route: Route,
    int_to_float: Kernel,
    fft_shift: Kernel,
    fft: Kernel,
    delay_and_bandpass: Kernel,
    second_fft: Option<(Kernel, Kernel)>,
    bandpass_correction: Kernel,
    delay_compensation: bool,
    counter: PerformanceCounter,
}

impl PreprocessingStep {
    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn counter(&self) -> &PerformanceCounter {
        &self.counter
    }

    pub fn write_input<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        input: &InputData,
        upload: DelayUpload,
    ) -> Result<(), PipelineError> {
        if self.delay_compensation && upload == DelayUpload::Upload {
            upload_station_delays(&self.delay_and_bandpass, queue, input, &self.counter)?;
        }
        Ok(())
    }

    pub fn process<Q: DeviceQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        ctx: &BlockContext,
    ) -> Result<(), PipelineError> {
        let block = ctx.block;
        self.int_to_float.enqueue(queue, block)?;
        self.fft_shift.enqueue(queue, block)?;
        self.fft.enqueue(queue, block)?;
        self.delay_and_bandpass.enqueue_with(
            queue,
            block,
            &[
                ("subbandFrequency", Immediate::F64(ctx.central_frequency)),
                ("sap", Immediate::U32(ctx.sap as u32)),
            ],
        )?;
        if let Some((shift, fft)) = &self.second_fft {
            shift.enqueue(queue, block)?;
            fft.enqueue(queue, block)?;
        }
        self.bandpass_correction.enqueue(queue, block)?;
        Ok(())
    }
}
