//! Host-side input objects: one block of raw samples plus its metadata.

use ndarray::{Array2, Array3};
use num_complex::Complex;

use crate::config::NR_POLARIZATIONS;
use crate::error::PipelineError;
use crate::parset::ObservationSettings;
use crate::pipeline::block::BlockId;
use crate::postprocess::flags::SparseSet;

/// Raw complex samples, `[station][sample][polarisation]`.
#[derive(Clone, Debug)]
pub enum InputSamples {
    Bits8(Array3<Complex<i8>>),
    Bits16(Array3<Complex<i16>>),
}

impl InputSamples {
    pub fn zeros(nr_bits: u32, nr_stations: usize, nr_samples: usize) -> Self {
        let shape = (nr_stations, nr_samples, NR_POLARIZATIONS);
        if nr_bits == 8 {
            InputSamples::Bits8(Array3::from_elem(shape, Complex::new(0, 0)))
        } else {
            InputSamples::Bits16(Array3::from_elem(shape, Complex::new(0, 0)))
        }
    }

    pub fn nr_bits(&self) -> u32 {
        match self {
            InputSamples::Bits8(_) => 8,
            InputSamples::Bits16(_) => 16,
        }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        match self {
            InputSamples::Bits8(a) => a.dim(),
            InputSamples::Bits16(a) => a.dim(),
        }
    }

    /// Sample bytes in upload order.
    pub fn as_bytes(&self) -> Result<&[u8], PipelineError> {
        let not_contiguous = || PipelineError::InputMismatch("sample array is not contiguous".into());
        match self {
            InputSamples::Bits8(a) => a
                .as_slice_memory_order()
                .map(bytemuck::cast_slice)
                .ok_or_else(not_contiguous),
            InputSamples::Bits16(a) => a
                .as_slice_memory_order()
                .map(bytemuck::cast_slice)
                .ok_or_else(not_contiguous),
        }
    }
}

/// One block of one subband, as produced upstream.
#[derive(Clone, Debug)]
pub struct InputData {
    pub block: BlockId,

    pub samples: InputSamples,

    /// Geometric delay at the first sample, `[station][pol]`, seconds.
    pub delays_at_begin: Array2<f64>,

    /// Geometric delay just past the last sample, `[station][pol]`.
    pub delays_after_end: Array2<f64>,

    /// Per-station phase zero offsets, `[station][pol]`, radians.
    pub phase_offsets: Array2<f64>,

    /// Tied-array beam delays relative to the SAP centre, `[station][tab]`.
    pub tab_delays: Array2<f64>,

    /// Flagged sample ranges per station.
    pub flags: Vec<SparseSet>,
}

impl InputData {
    /// Allocate for the largest block `settings` can deliver.
    pub fn new(settings: &ObservationSettings) -> Self {
        let nr_stations = settings.nr_stations;
        let delays = Array2::zeros((nr_stations, NR_POLARIZATIONS));
        Self {
            block: BlockId::default(),
            samples: InputSamples::zeros(
                settings.nr_bits_per_sample,
                nr_stations,
                settings.block_size,
            ),
            delays_at_begin: delays.clone(),
            delays_after_end: delays.clone(),
            phase_offsets: delays,
            tab_delays: Array2::zeros((nr_stations, settings.max_nr_coherent_tabs())),
            flags: vec![SparseSet::new(); nr_stations],
        }
    }

    /// Check that this object has the shapes `settings` implies.
    pub fn check(&self, settings: &ObservationSettings) -> Result<(), PipelineError> {
        let nr_stations = settings.nr_stations;
        let expected = (nr_stations, settings.block_size, NR_POLARIZATIONS);
        if self.samples.dim() != expected {
            return Err(PipelineError::InputMismatch(format!(
                "samples have shape {:?}, expected {:?}",
                self.samples.dim(),
                expected
            )));
        }
        if self.samples.nr_bits() != settings.nr_bits_per_sample {
            return Err(PipelineError::InputMismatch(format!(
                "{}-bit samples in a {}-bit observation",
                self.samples.nr_bits(),
                settings.nr_bits_per_sample
            )));
        }
        for (name, table) in [
            ("delays_at_begin", &self.delays_at_begin),
            ("delays_after_end", &self.delays_after_end),
            ("phase_offsets", &self.phase_offsets),
        ] {
            if table.dim() != (nr_stations, NR_POLARIZATIONS) {
                return Err(PipelineError::InputMismatch(format!(
                    "{} has shape {:?}",
                    name,
                    table.dim()
                )));
            }
        }
        if settings.coherent_enabled()
            && self.tab_delays.dim() != (nr_stations, settings.max_nr_coherent_tabs())
        {
            return Err(PipelineError::InputMismatch(format!(
                "tab_delays has shape {:?}",
                self.tab_delays.dim()
            )));
        }
        if self.flags.len() != nr_stations {
            return Err(PipelineError::InputMismatch(format!(
                "{} flag sets for {} stations",
                self.flags.len(),
                nr_stations
            )));
        }
        Ok(())
    }
}

/// Contiguous bytes of a delay table.
pub(crate) fn table_bytes(table: &Array2<f64>) -> Result<&[u8], PipelineError> {
    table
        .as_slice_memory_order()
        .map(bytemuck::cast_slice)
        .ok_or_else(|| PipelineError::InputMismatch("delay table is not contiguous".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parset::presets;

    #[test]
    fn test_new_input_matches_settings() {
        let settings = presets::combined(3);
        let input = InputData::new(&settings);
        input.check(&settings).unwrap();
        assert_eq!(
            input.samples.as_bytes().unwrap().len(),
            settings.input_block_bytes()
        );
    }

    #[test]
    fn test_eight_bit_bytes() {
        let mut settings = presets::correlator(2, 16);
        settings.nr_bits_per_sample = 8;
        let input = InputData::new(&settings);
        assert_eq!(input.samples.nr_bits(), 8);
        assert_eq!(
            input.samples.as_bytes().unwrap().len(),
            settings.input_block_bytes()
        );
    }

    #[test]
    fn test_check_rejects_wrong_station_count() {
        let settings = presets::correlator(3, 16);
        let other = presets::correlator(4, 16);
        let input = InputData::new(&other);
        assert!(matches!(
            input.check(&settings),
            Err(PipelineError::InputMismatch(_))
        ));
    }

    #[test]
    fn test_check_rejects_bit_mode() {
        let settings = presets::correlator(3, 16);
        let mut input = InputData::new(&settings);
        input.samples = InputSamples::zeros(8, 3, settings.block_size);
        assert!(input.check(&settings).is_err());
    }

    #[test]
    fn test_table_bytes() {
        let table = Array2::<f64>::zeros((3, 2));
        assert_eq!(table_bytes(&table).unwrap().len(), 48);
    }
}
