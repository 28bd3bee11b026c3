//! Stokes detection for coherent and incoherent beams.

use crate::config::{NR_POLARIZATIONS, SIZEOF_FCOMPLEX, SIZEOF_FLOAT};
use crate::device::Immediate;

use super::{BufferType, KernelName, KernelSpec};

/// Detected power per tied-array beam, integrated in time.
#[derive(Clone, Debug)]
pub struct CoherentStokesParams {
    pub max_nr_tabs: usize,
    pub nr_stokes: usize,
    pub nr_channels: usize,
    pub nr_samples_per_channel: usize,
    pub time_integration_factor: usize,
}

impl KernelSpec for CoherentStokesParams {
    fn name(&self) -> KernelName {
        KernelName::CoherentStokes
    }

    fn buffer_size(&self, buffer: BufferType) -> usize {
        let samples = self.nr_channels * self.nr_samples_per_channel;
        match buffer {
            BufferType::Input => self.max_nr_tabs * NR_POLARIZATIONS * samples * SIZEOF_FCOMPLEX,
            BufferType::Output => {
                self.max_nr_tabs * self.nr_stokes * (samples / self.time_integration_factor)
                    * SIZEOF_FLOAT
            }
            _ => 0,
        }
    }

    fn immediates(&self) -> Vec<(&'static str, Immediate)> {
        vec![
            ("nrStokes", Immediate::U32(self.nr_stokes as u32)),
            ("nrChannels", Immediate::U32(self.nr_channels as u32)),
            (
                "timeIntegrationFactor",
                Immediate::U32(self.time_integration_factor as u32),
            ),
        ]
    }
}

/// Power summed over stations, one copy per incoherent beam.
#[derive(Clone, Debug)]
pub struct IncoherentStokesParams {
    pub nr_stations: usize,
    pub max_nr_tabs: usize,
    pub nr_stokes: usize,
    pub nr_channels: usize,
    pub nr_samples_per_channel: usize,
    pub time_integration_factor: usize,
}

impl KernelSpec for IncoherentStokesParams {
    fn name(&self) -> KernelName {
        KernelName::IncoherentStokes
    }

    fn buffer_size(&self, buffer: BufferType) -> usize {
        let samples = self.nr_channels * self.nr_samples_per_channel;
        match buffer {
            BufferType::Input => self.nr_stations * NR_POLARIZATIONS * samples * SIZEOF_FCOMPLEX,
            BufferType::Output => {
                self.max_nr_tabs * self.nr_stokes * (samples / self.time_integration_factor)
                    * SIZEOF_FLOAT
            }
            _ => 0,
        }
    }

    fn immediates(&self) -> Vec<(&'static str, Immediate)> {
        vec![
            ("nrStations", Immediate::U32(self.nr_stations as u32)),
            ("nrStokes", Immediate::U32(self.nr_stokes as u32)),
            ("nrChannels", Immediate::U32(self.nr_channels as u32)),
            (
                "timeIntegrationFactor",
                Immediate::U32(self.time_integration_factor as u32),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coherent_output_shrinks_with_integration() {
        let mut p = CoherentStokesParams {
            max_nr_tabs: 2,
            nr_stokes: 4,
            nr_channels: 16,
            nr_samples_per_channel: 256,
            time_integration_factor: 1,
        };
        let full = p.buffer_size(BufferType::Output);
        assert_eq!(full, 2 * 4 * 4096 * 4);
        p.time_integration_factor = 4;
        assert_eq!(p.buffer_size(BufferType::Output), full / 4);
    }

    #[test]
    fn test_incoherent_reads_all_stations() {
        let p = IncoherentStokesParams {
            nr_stations: 5,
            max_nr_tabs: 1,
            nr_stokes: 1,
            nr_channels: 16,
            nr_samples_per_channel: 256,
            time_integration_factor: 4,
        };
        assert_eq!(p.buffer_size(BufferType::Input), 5 * 2 * 4096 * 8);
        assert_eq!(p.buffer_size(BufferType::Output), 1024 * 4);
    }
}
