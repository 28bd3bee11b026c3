//! Host-side output objects, reused from a pool block after block.

use ndarray::{Array3, Array5, ArrayView4, ArrayViewMut4};
use num_complex::Complex32;

use crate::config::NR_POLARIZATIONS;
use crate::error::PipelineError;
use crate::parset::{ObservationSettings, StokesSettings};
use crate::pipeline::block::BlockId;

/// Beamformed products of one kind, `[beam][stokes][sample][channel]`.
///
/// Storage is sized once for the largest beam count of any SAP; each block
/// narrows the beam dimension to the count its SAP needs.
#[derive(Clone, Debug)]
pub struct BeamFormedData {
    data: Vec<f32>,
    max_nr_beams: usize,
    nr_beams: usize,
    nr_stokes: usize,
    nr_samples: usize,
    nr_channels: usize,
}

impl BeamFormedData {
    pub fn new(max_nr_beams: usize, nr_stokes: usize, nr_samples: usize, nr_channels: usize) -> Self {
        Self {
            data: vec![0.0; max_nr_beams * nr_stokes * nr_samples * nr_channels],
            max_nr_beams,
            nr_beams: max_nr_beams,
            nr_stokes,
            nr_samples,
            nr_channels,
        }
    }

    /// Sized for `stokes` over blocks of `block_size` samples.
    pub fn for_stokes(max_nr_beams: usize, stokes: &StokesSettings, block_size: usize) -> Self {
        Self::new(
            max_nr_beams,
            stokes.nr_stokes(),
            stokes.nr_samples(block_size),
            stokes.nr_channels,
        )
    }

    fn beam_len(&self) -> usize {
        self.nr_stokes * self.nr_samples * self.nr_channels
    }

    /// Narrow the beam dimension to `nr_beams`. Never reallocates.
    pub fn resize_beams(&mut self, nr_beams: usize) -> Result<(), PipelineError> {
        if nr_beams > self.max_nr_beams {
            return Err(PipelineError::InputMismatch(format!(
                "{} beams requested, output holds at most {}",
                nr_beams, self.max_nr_beams
            )));
        }
        self.nr_beams = nr_beams;
        Ok(())
    }

    pub fn nr_beams(&self) -> usize {
        self.nr_beams
    }

    pub fn max_nr_beams(&self) -> usize {
        self.max_nr_beams
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (self.nr_beams, self.nr_stokes, self.nr_samples, self.nr_channels)
    }

    /// Bytes of the active beams, as a transfer destination.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.nr_beams * self.beam_len();
        bytemuck::cast_slice_mut(&mut self.data[..len])
    }

    pub fn view(&self) -> Result<ArrayView4<'_, f32>, PipelineError> {
        let len = self.nr_beams * self.beam_len();
        ArrayView4::from_shape(self.shape(), &self.data[..len])
            .map_err(|e| PipelineError::InputMismatch(format!("beam storage: {}", e)))
    }

    pub fn view_mut(&mut self) -> Result<ArrayViewMut4<'_, f32>, PipelineError> {
        let len = self.nr_beams * self.beam_len();
        let shape = self.shape();
        ArrayViewMut4::from_shape(shape, &mut self.data[..len])
            .map_err(|e| PipelineError::InputMismatch(format!("beam storage: {}", e)))
    }
}

/// Visibilities of one block, `[integration][baseline][channel][pol][pol]`,
/// with unflagged sample counts `[integration][baseline][channel]`.
#[derive(Clone, Debug)]
pub struct CorrelatedData {
    pub visibilities: Array5<Complex32>,
    pub nr_valid_samples: Array3<u32>,
}

impl CorrelatedData {
    pub fn new(nr_integrations: usize, nr_baselines: usize, nr_channels: usize) -> Self {
        Self {
            visibilities: Array5::zeros((
                nr_integrations,
                nr_baselines,
                nr_channels,
                NR_POLARIZATIONS,
                NR_POLARIZATIONS,
            )),
            nr_valid_samples: Array3::zeros((nr_integrations, nr_baselines, nr_channels)),
        }
    }

    pub fn nr_integrations(&self) -> usize {
        self.visibilities.dim().0
    }

    /// Visibility bytes, as a transfer destination.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8], PipelineError> {
        let slice = self.visibilities.as_slice_memory_order_mut().ok_or_else(|| {
            PipelineError::InputMismatch("visibility array is not contiguous".into())
        })?;
        Ok(bytemuck::cast_slice_mut(slice))
    }
}

/// Everything one block can produce.
#[derive(Clone, Debug)]
pub struct OutputData {
    pub block: BlockId,

    pub coherent: BeamFormedData,
    pub incoherent: BeamFormedData,
    pub correlated: CorrelatedData,

    /// Whether each product carries a deliverable for this block.
    pub emit_coherent: bool,
    pub emit_incoherent: bool,
    pub emit_correlated: bool,
}

impl OutputData {
    /// Allocate for the largest block `settings` can produce.
    pub fn new(settings: &ObservationSettings) -> Self {
        let bf = &settings.beam_former;
        let coherent = if settings.coherent_enabled() {
            BeamFormedData::for_stokes(settings.max_nr_coherent_tabs(), &bf.coherent, settings.block_size)
        } else {
            BeamFormedData::new(0, 0, 0, 0)
        };
        let incoherent = if settings.incoherent_enabled() {
            BeamFormedData::for_stokes(
                settings.max_nr_incoherent_tabs(),
                &bf.incoherent,
                settings.block_size,
            )
        } else {
            BeamFormedData::new(0, 0, 0, 0)
        };
        let correlated = if settings.correlator_enabled() {
            CorrelatedData::new(
                settings.correlator.nr_integrations_per_block,
                settings.nr_baselines(),
                settings.correlator.nr_channels,
            )
        } else {
            CorrelatedData::new(0, 0, 0)
        };

        Self {
            block: BlockId::default(),
            coherent,
            incoherent,
            correlated,
            emit_coherent: false,
            emit_incoherent: false,
            emit_correlated: false,
        }
    }

    /// Whether any product is deliverable.
    pub fn any_emitted(&self) -> bool {
        self.emit_coherent || self.emit_incoherent || self.emit_correlated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parset::presets;

    #[test]
    fn test_resize_keeps_allocation() {
        let mut data = BeamFormedData::new(4, 1, 8, 16);
        let capacity = data.capacity();
        for k in [3, 0, 4, 1] {
            data.resize_beams(k).unwrap();
            assert_eq!(data.view().unwrap().dim().0, k);
            assert_eq!(data.bytes_mut().len(), k * 8 * 16 * 4);
            assert_eq!(data.capacity(), capacity);
        }
    }

    #[test]
    fn test_resize_beyond_max_rejected() {
        let mut data = BeamFormedData::new(2, 4, 8, 16);
        assert!(matches!(
            data.resize_beams(3),
            Err(PipelineError::InputMismatch(_))
        ));
        assert_eq!(data.nr_beams(), 2);
    }

    #[test]
    fn test_views_follow_resize_down_to_zero_beams() {
        let mut data = BeamFormedData::new(3, 4, 2, 8);
        data.resize_beams(0).unwrap();
        assert_eq!(data.view().unwrap().dim(), (0, 4, 2, 8));
        assert_eq!(data.view_mut().unwrap().len(), 0);
        data.resize_beams(3).unwrap();
        assert_eq!(data.view_mut().unwrap().dim(), (3, 4, 2, 8));
    }

    #[test]
    fn test_view_mut_writes_through() {
        let mut data = BeamFormedData::new(2, 1, 2, 2);
        data.view_mut().unwrap()[[1, 0, 1, 1]] = 5.0;
        data.resize_beams(2).unwrap();
        assert_eq!(data.view().unwrap()[[1, 0, 1, 1]], 5.0);
    }

    #[test]
    fn test_output_sized_from_settings() {
        let settings = presets::combined(3);
        let out = OutputData::new(&settings);
        let stokes = &settings.beam_former.coherent;
        assert_eq!(
            out.coherent.shape(),
            (
                settings.max_nr_coherent_tabs(),
                stokes.nr_stokes(),
                stokes.nr_samples(settings.block_size),
                stokes.nr_channels
            )
        );
        assert_eq!(out.correlated.visibilities.dim(), (1, 6, 64, 2, 2));
        assert!(!out.any_emitted());
    }

    #[test]
    fn test_correlated_bytes_cover_array() {
        let mut data = CorrelatedData::new(2, 3, 4);
        let len = data.bytes_mut().unwrap().len();
        assert_eq!(len, 2 * 3 * 4 * 4 * 8);
    }
}
