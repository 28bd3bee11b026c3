//! Input conditioning: sample conversion, delay compensation, band-pass.

use crate::config::{NR_POLARIZATIONS, SIZEOF_DELAY, SIZEOF_FCOMPLEX, SIZEOF_FLOAT};
use crate::device::Immediate;

use super::{BufferType, KernelName, KernelSpec};

/// Fixed-point complex samples to single-precision complex.
#[derive(Clone, Debug)]
pub struct IntToFloatParams {
    pub nr_stations: usize,
    pub nr_samples: usize,

    /// Bytes per raw complex sample (2 for 8-bit, 4 for 16-bit).
    pub input_sample_bytes: usize,
}

impl KernelSpec for IntToFloatParams {
    fn name(&self) -> KernelName {
        KernelName::IntToFloat
    }

    fn buffer_size(&self, buffer: BufferType) -> usize {
        let samples = self.nr_stations * NR_POLARIZATIONS * self.nr_samples;
        match buffer {
            BufferType::Input => samples * self.input_sample_bytes,
            BufferType::Output => samples * SIZEOF_FCOMPLEX,
            _ => 0,
        }
    }

    fn immediates(&self) -> Vec<(&'static str, Immediate)> {
        vec![
            ("nrStations", Immediate::U32(self.nr_stations as u32)),
            ("nrBitsPerSample", Immediate::U32((self.input_sample_bytes * 4) as u32)),
        ]
    }
}

/// Per-station delay compensation and band-pass weighting.
///
/// Also reorders data from station-major to the layout the next consumer
/// expects. In a single-channel correlator it reads raw integer samples.
#[derive(Clone, Debug)]
pub struct DelayAndBandPassParams {
    pub nr_stations: usize,
    pub nr_channels: usize,
    pub nr_samples_per_channel: usize,

    /// Bytes per complex input sample.
    pub input_sample_bytes: usize,

    pub delay_compensation: bool,
    pub bandpass_correction: bool,

    /// Emit channel-major output for the beamformer chain.
    pub transpose: bool,
}

impl DelayAndBandPassParams {
    fn nr_samples(&self) -> usize {
        self.nr_stations * NR_POLARIZATIONS * self.nr_channels * self.nr_samples_per_channel
    }
}

impl KernelSpec for DelayAndBandPassParams {
    fn name(&self) -> KernelName {
        KernelName::DelayAndBandPass
    }

    fn buffer_size(&self, buffer: BufferType) -> usize {
        match buffer {
            BufferType::Input => self.nr_samples() * self.input_sample_bytes,
            BufferType::Output => self.nr_samples() * SIZEOF_FCOMPLEX,
            BufferType::DelaysAtBegin | BufferType::DelaysAfterEnd | BufferType::PhaseOffsets => {
                self.nr_stations * NR_POLARIZATIONS * SIZEOF_DELAY
            }
            BufferType::BandPassWeights => self.nr_channels * SIZEOF_FLOAT,
            _ => 0,
        }
    }

    fn tables(&self) -> &'static [BufferType] {
        &[
            BufferType::DelaysAtBegin,
            BufferType::DelaysAfterEnd,
            BufferType::PhaseOffsets,
            BufferType::BandPassWeights,
        ]
    }

    fn immediates(&self) -> Vec<(&'static str, Immediate)> {
        vec![
            ("nrChannels", Immediate::U32(self.nr_channels as u32)),
            ("nrSamplesPerChannel", Immediate::U32(self.nr_samples_per_channel as u32)),
            ("delayCompensation", Immediate::Bool(self.delay_compensation)),
            ("bandPassCorrection", Immediate::Bool(self.bandpass_correction)),
            ("transpose", Immediate::Bool(self.transpose)),
        ]
    }
}

/// Band-pass correction at high resolution, after the second FFT.
#[derive(Clone, Debug)]
pub struct BandPassCorrectionParams {
    pub nr_stations: usize,
    pub nr_delay_compensation_channels: usize,
    pub nr_high_resolution_channels: usize,
    pub nr_samples_per_channel: usize,
    pub bandpass_correction: bool,
}

impl KernelSpec for BandPassCorrectionParams {
    fn name(&self) -> KernelName {
        KernelName::BandPassCorrection
    }

    fn buffer_size(&self, buffer: BufferType) -> usize {
        let samples = self.nr_stations
            * NR_POLARIZATIONS
            * self.nr_high_resolution_channels
            * self.nr_samples_per_channel;
        match buffer {
            BufferType::Input | BufferType::Output => samples * SIZEOF_FCOMPLEX,
            BufferType::BandPassWeights => self.nr_high_resolution_channels * SIZEOF_FLOAT,
            _ => 0,
        }
    }

    fn tables(&self) -> &'static [BufferType] {
        &[BufferType::BandPassWeights]
    }

    fn immediates(&self) -> Vec<(&'static str, Immediate)> {
        vec![
            (
                "nrChannels1",
                Immediate::U32(self.nr_delay_compensation_channels as u32),
            ),
            (
                "nrChannels2",
                Immediate::U32(
                    (self.nr_high_resolution_channels / self.nr_delay_compensation_channels) as u32,
                ),
            ),
            ("bandPassCorrection", Immediate::Bool(self.bandpass_correction)),
        ]
    }
}

/// Flat band-pass response: one unit weight per channel.
pub fn unity_bandpass(nr_channels: usize) -> Vec<f32> {
    vec![1.0; nr_channels]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_to_float_sizes() {
        let p = IntToFloatParams {
            nr_stations: 3,
            nr_samples: 1024,
            input_sample_bytes: 4,
        };
        assert_eq!(p.buffer_size(BufferType::Input), 3 * 2 * 1024 * 4);
        assert_eq!(p.buffer_size(BufferType::Output), 3 * 2 * 1024 * 8);
        assert_eq!(p.buffer_size(BufferType::FilterWeights), 0);
    }

    #[test]
    fn test_delay_tables_sized_per_station_pol() {
        let p = DelayAndBandPassParams {
            nr_stations: 5,
            nr_channels: 64,
            nr_samples_per_channel: 16,
            input_sample_bytes: 4,
            delay_compensation: true,
            bandpass_correction: false,
            transpose: true,
        };
        assert_eq!(p.buffer_size(BufferType::DelaysAfterEnd), 5 * 2 * 8);
        assert_eq!(p.buffer_size(BufferType::BandPassWeights), 64 * 4);
        assert_eq!(p.buffer_size(BufferType::Input), 5 * 2 * 1024 * 4);
        assert_eq!(p.buffer_size(BufferType::Output), 5 * 2 * 1024 * 8);
        assert_eq!(p.tables().len(), 4);
    }

    #[test]
    fn test_bandpass_correction_weights() {
        let p = BandPassCorrectionParams {
            nr_stations: 2,
            nr_delay_compensation_channels: 64,
            nr_high_resolution_channels: 256,
            nr_samples_per_channel: 16,
            bandpass_correction: true,
        };
        assert_eq!(p.buffer_size(BufferType::BandPassWeights), 256 * 4);
        let ratio = p
            .immediates()
            .into_iter()
            .find(|(n, _)| *n == "nrChannels2")
            .and_then(|(_, v)| v.as_u32());
        assert_eq!(ratio, Some(4));
        assert!(unity_bandpass(8).iter().all(|&w| w == 1.0));
    }
}
