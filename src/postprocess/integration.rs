//! Long-time integration and weighting of correlator output.

use ndarray::{s, Array3, Array5, Axis, Zip};
use num_complex::Complex32;

use crate::pipeline::output::CorrelatedData;

/// Per-local-subband visibility accumulator.
///
/// Every block folds into its subband's sum; at `depth` folds the sum is
/// handed out and the accumulator starts over from zero.
#[derive(Clone, Debug)]
pub struct Integrator {
    depth: usize,
    folds: Vec<usize>,
    visibilities: Vec<Array5<Complex32>>,
    nr_valid_samples: Vec<Array3<u32>>,
}

impl Integrator {
    pub fn new(nr_subbands: usize, depth: usize, template: &CorrelatedData) -> Self {
        // depth 1 hands every block straight through; no sums needed.
        let keep = if depth > 1 { nr_subbands } else { 0 };
        Self {
            depth: depth.max(1),
            folds: vec![0; nr_subbands],
            visibilities: vec![Array5::zeros(template.visibilities.raw_dim()); keep],
            nr_valid_samples: vec![Array3::zeros(template.nr_valid_samples.raw_dim()); keep],
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Blocks folded into `local_subband` since its last flush.
    pub fn folds(&self, local_subband: usize) -> usize {
        self.folds[local_subband]
    }

    /// Fold `data` into the sum of `local_subband`.
    ///
    /// Returns `true` when the integration is complete; `data` then holds the
    /// summed visibilities and valid-sample counts. Otherwise `data` is left
    /// untouched and `false` is returned.
    pub fn fold(&mut self, local_subband: usize, data: &mut CorrelatedData) -> bool {
        if self.depth == 1 {
            return true;
        }

        let vis = &mut self.visibilities[local_subband];
        let valid = &mut self.nr_valid_samples[local_subband];
        *vis += &data.visibilities;
        *valid += &data.nr_valid_samples;
        self.folds[local_subband] += 1;

        if self.folds[local_subband] < self.depth {
            return false;
        }

        std::mem::swap(vis, &mut data.visibilities);
        std::mem::swap(valid, &mut data.nr_valid_samples);
        vis.fill(Complex32::new(0.0, 0.0));
        valid.fill(0);
        self.folds[local_subband] = 0;
        true
    }
}

/// Weight for a baseline/channel with `nr_valid` unflagged samples.
pub fn weight(nr_valid: u32) -> f32 {
    if nr_valid == 0 {
        0.0
    } else {
        1.0 / nr_valid as f32
    }
}

/// Scale every polarisation pair by `1 / nr_valid_samples`.
///
/// Zero valid samples give weight 0. With a polyphase filter channel 0 is
/// always zero-weighted.
pub fn apply_weights(data: &mut CorrelatedData, uses_ppf: bool) {
    Zip::from(data.visibilities.axis_iter_mut(Axis(1)))
        .and(data.nr_valid_samples.axis_iter(Axis(1)))
        .par_for_each(|mut vis, valid| {
            for ((slot, ch), &n) in valid.indexed_iter() {
                let w = if uses_ppf && ch == 0 { 0.0 } else { weight(n) };
                vis.slice_mut(s![slot, ch, .., ..]).mapv_inplace(|v| v * w);
            }
        });
}
