//! Tied-array beam synthesis and the transpose that follows it.

use crate::config::{NR_POLARIZATIONS, SIZEOF_DELAY, SIZEOF_FCOMPLEX};
use crate::device::Immediate;

use super::{BufferType, KernelName, KernelSpec};

/// Weighted sum of stations per tied-array beam.
#[derive(Clone, Debug)]
pub struct BeamFormerParams {
    pub nr_stations: usize,

    /// Beams the output is sized for; fewer may be formed per block.
    pub max_nr_tabs: usize,

    pub nr_channels: usize,
    pub nr_samples_per_channel: usize,
    pub subband_bandwidth: f64,
}

impl KernelSpec for BeamFormerParams {
    fn name(&self) -> KernelName {
        KernelName::BeamFormer
    }

    fn buffer_size(&self, buffer: BufferType) -> usize {
        let per_stream = NR_POLARIZATIONS * self.nr_channels * self.nr_samples_per_channel;
        match buffer {
            BufferType::Input => self.nr_stations * per_stream * SIZEOF_FCOMPLEX,
            BufferType::Output => self.max_nr_tabs * per_stream * SIZEOF_FCOMPLEX,
            BufferType::BeamFormerDelays => self.nr_stations * self.max_nr_tabs * SIZEOF_DELAY,
            _ => 0,
        }
    }

    fn tables(&self) -> &'static [BufferType] {
        &[BufferType::BeamFormerDelays]
    }

    fn immediates(&self) -> Vec<(&'static str, Immediate)> {
        vec![
            ("nrStations", Immediate::U32(self.nr_stations as u32)),
            ("nrChannels", Immediate::U32(self.nr_channels as u32)),
            ("subbandBandwidth", Immediate::F64(self.subband_bandwidth)),
        ]
    }
}

/// Channel-major to stream-major reorder ahead of the inverse FFT.
#[derive(Clone, Debug)]
pub struct TransposeParams {
    pub nr_streams: usize,
    pub nr_channels: usize,
    pub nr_samples_per_channel: usize,
}

impl KernelSpec for TransposeParams {
    fn name(&self) -> KernelName {
        KernelName::Transpose
    }

    fn buffer_size(&self, buffer: BufferType) -> usize {
        match buffer {
            BufferType::Input | BufferType::Output => {
                self.nr_streams
                    * NR_POLARIZATIONS
                    * self.nr_channels
                    * self.nr_samples_per_channel
                    * SIZEOF_FCOMPLEX
            }
            _ => 0,
        }
    }

    fn immediates(&self) -> Vec<(&'static str, Immediate)> {
        vec![
            ("nrStreams", Immediate::U32(self.nr_streams as u32)),
            ("nrChannels", Immediate::U32(self.nr_channels as u32)),
        ]
    }
}
