//! Cross-correlation of every station pair.

use crate::config::{self, NR_POLARIZATIONS, SIZEOF_FCOMPLEX};
use crate::device::Immediate;

use super::{BufferType, KernelName, KernelSpec};

#[derive(Clone, Debug)]
pub struct CorrelatorParams {
    pub nr_stations: usize,
    pub nr_channels: usize,
    pub nr_samples_per_channel: usize,
    pub nr_integrations_per_block: usize,
}

impl CorrelatorParams {
    pub fn nr_baselines(&self) -> usize {
        config::nr_baselines(self.nr_stations)
    }

    /// Visibilities produced per block.
    pub fn nr_visibilities(&self) -> usize {
        self.nr_integrations_per_block
            * self.nr_baselines()
            * self.nr_channels
            * NR_POLARIZATIONS
            * NR_POLARIZATIONS
    }
}

impl KernelSpec for CorrelatorParams {
    fn name(&self) -> KernelName {
        KernelName::Correlator
    }

    fn buffer_size(&self, buffer: BufferType) -> usize {
        match buffer {
            BufferType::Input => {
                self.nr_stations
                    * NR_POLARIZATIONS
                    * self.nr_channels
                    * self.nr_samples_per_channel
                    * SIZEOF_FCOMPLEX
            }
            BufferType::Output => self.nr_visibilities() * SIZEOF_FCOMPLEX,
            _ => 0,
        }
    }

    fn immediates(&self) -> Vec<(&'static str, Immediate)> {
        vec![
            ("nrStations", Immediate::U32(self.nr_stations as u32)),
            ("nrChannels", Immediate::U32(self.nr_channels as u32)),
            (
                "nrSamplesPerIntegration",
                Immediate::U32((self.nr_samples_per_channel / self.nr_integrations_per_block) as u32),
            ),
            (
                "nrIntegrations",
                Immediate::U32(self.nr_integrations_per_block as u32),
            ),
        ]
    }
}
