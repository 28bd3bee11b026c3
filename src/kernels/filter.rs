//! Channelisation kernels: polyphase FIR, FFT and FFT shift.
//!
//! The FIR prototype is a Kaiser-windowed sinc computed on the host and
//! uploaded once per filter.

use std::f64::consts::PI;

use crate::config::{NR_POLARIZATIONS, NR_TAPS, SIZEOF_FCOMPLEX, SIZEOF_FLOAT};
use crate::device::Immediate;

use super::{BufferType, KernelName, KernelSpec, Placement};

/// Kaiser shape parameter of the filter-bank prototype.
const KAISER_BETA: f64 = 9.0;

/// Batched complex FFT of `fft_size` points over `nr_samples` samples.
#[derive(Clone, Debug)]
pub struct FftParams {
    pub fft_size: usize,

    /// Total complex samples transformed per launch.
    pub nr_samples: usize,

    pub forward: bool,
    pub placement: Placement,
}

impl KernelSpec for FftParams {
    fn name(&self) -> KernelName {
        KernelName::Fft
    }

    fn placement(&self) -> Placement {
        self.placement
    }

    fn buffer_size(&self, buffer: BufferType) -> usize {
        match buffer {
            BufferType::Input | BufferType::Output => self.nr_samples * SIZEOF_FCOMPLEX,
            _ => 0,
        }
    }

    fn immediates(&self) -> Vec<(&'static str, Immediate)> {
        vec![
            ("fftSize", Immediate::U32(self.fft_size as u32)),
            ("forward", Immediate::Bool(self.forward)),
        ]
    }
}

/// Sign flip of every other sample, centring DC after the FFT.
#[derive(Clone, Debug)]
pub struct FftShiftParams {
    pub nr_samples: usize,
}

impl KernelSpec for FftShiftParams {
    fn name(&self) -> KernelName {
        KernelName::FftShift
    }

    fn placement(&self) -> Placement {
        Placement::InPlace
    }

    fn buffer_size(&self, buffer: BufferType) -> usize {
        match buffer {
            BufferType::Input | BufferType::Output => self.nr_samples * SIZEOF_FCOMPLEX,
            _ => 0,
        }
    }
}

/// Polyphase FIR front end of a filter bank.
#[derive(Clone, Debug)]
pub struct FirFilterParams {
    /// Stations or beams; each carries both polarisations.
    pub nr_streams: usize,
    pub nr_channels: usize,
    pub nr_samples_per_channel: usize,

    /// Subbands whose history is kept side by side on the device.
    pub nr_subbands: usize,

    /// Bytes per complex input sample (raw integers or floats).
    pub input_sample_bytes: usize,
}

impl FirFilterParams {
    fn nr_samples(&self) -> usize {
        self.nr_streams * NR_POLARIZATIONS * self.nr_channels * self.nr_samples_per_channel
    }
}

impl KernelSpec for FirFilterParams {
    fn name(&self) -> KernelName {
        KernelName::FirFilter
    }

    fn buffer_size(&self, buffer: BufferType) -> usize {
        match buffer {
            BufferType::Input => self.nr_samples() * self.input_sample_bytes,
            BufferType::Output => self.nr_samples() * SIZEOF_FCOMPLEX,
            BufferType::FilterWeights => self.nr_channels * NR_TAPS * SIZEOF_FLOAT,
            BufferType::HistoryData => {
                self.nr_subbands
                    * self.nr_streams
                    * NR_POLARIZATIONS
                    * (NR_TAPS - 1)
                    * self.nr_channels
                    * self.input_sample_bytes
            }
            _ => 0,
        }
    }

    fn tables(&self) -> &'static [BufferType] {
        &[BufferType::FilterWeights, BufferType::HistoryData]
    }

    fn immediates(&self) -> Vec<(&'static str, Immediate)> {
        vec![
            ("nrStreams", Immediate::U32(self.nr_streams as u32)),
            ("nrChannels", Immediate::U32(self.nr_channels as u32)),
            ("nrTaps", Immediate::U32(NR_TAPS as u32)),
            (
                "inputIsFloat",
                Immediate::Bool(self.input_sample_bytes == SIZEOF_FCOMPLEX),
            ),
        ]
    }
}

/// Modified Bessel function of the first kind, order 0.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let x_sq_over_4 = x * x / 4.0;
    for k in 1..=30 {
        term *= x_sq_over_4 / (k * k) as f64;
        sum += term;
        if term < sum * 1e-12 {
            break;
        }
    }
    sum
}

/// Kaiser window of length `n`.
pub fn kaiser(n: usize, beta: f64) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = bessel_i0(beta);
    (0..n)
        .map(|i| {
            let x = 2.0 * i as f64 / (n as f64 - 1.0) - 1.0;
            bessel_i0(beta * (1.0 - x * x).max(0.0).sqrt()) / denom
        })
        .collect()
}

/// Filter-bank coefficients laid out `[channel][tap]`.
///
/// The prototype low-pass has `nr_channels * nr_taps` points with cutoff at
/// one channel width and is scaled so each polyphase branch has unit DC gain.
pub fn filter_bank_weights(nr_channels: usize, nr_taps: usize) -> Vec<f32> {
    let len = nr_channels * nr_taps;
    let window = kaiser(len, KAISER_BETA);
    let centre = (len as f64 - 1.0) / 2.0;

    let prototype: Vec<f64> = window
        .iter()
        .enumerate()
        .map(|(n, w)| {
            let t = (n as f64 - centre) / nr_channels as f64;
            let sinc = if t.abs() < 1e-12 {
                1.0
            } else {
                (PI * t).sin() / (PI * t)
            };
            sinc * w
        })
        .collect();

    let sum: f64 = prototype.iter().sum();
    let scale = if sum.abs() > 0.0 {
        nr_channels as f64 / sum
    } else {
        1.0
    };

    let mut weights = vec![0.0f32; len];
    for channel in 0..nr_channels {
        for tap in 0..nr_taps {
            weights[channel * nr_taps + tap] = (prototype[tap * nr_channels + channel] * scale) as f32;
        }
    }
    weights
}
