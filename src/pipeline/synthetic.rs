//! Seeded synthetic observation input.
//!
//! Gaussian noise per station and polarisation, slowly drifting geometric
//! delays and an optional fraction of stations with a flagged stretch per
//! block. Used by the binary and by tests that need realistic input without
//! an upstream receiver.

use ndarray::Array3;
use num_complex::Complex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::PipelineError;
use crate::parset::ObservationSettings;
use crate::pipeline::block::BlockId;
use crate::pipeline::input::{InputData, InputSamples};
use crate::pipeline::runner::InputSource;

/// Delay added per station index, seconds.
const STATION_DELAY_STEP: f64 = 1e-9;

/// Delay drift per block, seconds.
const DELAY_DRIFT_PER_BLOCK: f64 = 1e-12;

pub struct SyntheticSource {
    rng: StdRng,
    noise: Normal<f64>,
    amplitude_limit: f64,
    flag_fraction: f64,
    block_size: usize,

    /// Global subband of each local slot.
    subbands: Vec<usize>,
    nr_blocks: u64,
    next: u64,
}

impl SyntheticSource {
    /// `nr_blocks` blocks of every subband in `subbands`, interleaved.
    pub fn new(
        settings: &ObservationSettings,
        subbands: Vec<usize>,
        nr_blocks: u64,
        seed: u64,
    ) -> Result<Self, PipelineError> {
        if subbands.is_empty() || subbands.len() > settings.nr_subbands_per_subband_proc {
            return Err(PipelineError::InvalidConfig(format!(
                "{} subbands requested, a subband processor handles 1 to {}",
                subbands.len(),
                settings.nr_subbands_per_subband_proc
            )));
        }
        if let Some(&bad) = subbands.iter().find(|&&sb| sb >= settings.subbands.len()) {
            return Err(PipelineError::InvalidConfig(format!(
                "subband {} is not part of the observation",
                bad
            )));
        }

        let (sigma, limit) = if settings.nr_bits_per_sample == 8 {
            (16.0, i8::MAX as f64)
        } else {
            (1024.0, i16::MAX as f64)
        };
        let noise = Normal::new(0.0, sigma)
            .map_err(|e| PipelineError::InvalidConfig(format!("noise distribution: {}", e)))?;

        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            noise,
            amplitude_limit: limit,
            flag_fraction: 0.0,
            block_size: settings.block_size,
            subbands,
            nr_blocks,
            next: 0,
        })
    }

    /// Probability that a station carries a flagged stretch in a block.
    pub fn with_flag_fraction(mut self, fraction: f64) -> Self {
        self.flag_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn total_blocks(&self) -> u64 {
        self.nr_blocks * self.subbands.len() as u64
    }

    /// Fill `input` with the next block; `false` once exhausted.
    pub fn fill_block(&mut self, input: &mut InputData) -> bool {
        if self.next >= self.total_blocks() {
            return false;
        }
        let nr_slots = self.subbands.len() as u64;
        let block = self.next / nr_slots;
        let local = (self.next % nr_slots) as usize;
        self.next += 1;

        input.block = BlockId::new(block, self.subbands[local], local);

        let (rng, noise, limit) = (&mut self.rng, &self.noise, self.amplitude_limit);
        match &mut input.samples {
            InputSamples::Bits8(a) => fill_noise(a, rng, noise, limit, |v| v as i8),
            InputSamples::Bits16(a) => fill_noise(a, rng, noise, limit, |v| v as i16),
        }

        let drift = block as f64 * DELAY_DRIFT_PER_BLOCK;
        for ((station, _), d) in input.delays_at_begin.indexed_iter_mut() {
            *d = station as f64 * STATION_DELAY_STEP + drift;
        }
        for ((station, _), d) in input.delays_after_end.indexed_iter_mut() {
            *d = station as f64 * STATION_DELAY_STEP + drift + DELAY_DRIFT_PER_BLOCK;
        }
        input.phase_offsets.fill(0.0);
        for ((station, tab), d) in input.tab_delays.indexed_iter_mut() {
            *d = (tab + 1) as f64 * station as f64 * 1e-10;
        }

        for flags in input.flags.iter_mut() {
            flags.clear();
            if self.flag_fraction > 0.0 && self.rng.gen_bool(self.flag_fraction) {
                let len = self.rng.gen_range(1..=(self.block_size / 8).max(1));
                let begin = self.rng.gen_range(0..self.block_size);
                flags.include(begin, (begin + len).min(self.block_size));
            }
        }
        true
    }
}

fn fill_noise<T>(
    samples: &mut Array3<Complex<T>>,
    rng: &mut StdRng,
    noise: &Normal<f64>,
    limit: f64,
    cast: impl Fn(f64) -> T,
) {
    let mut draw = || noise.sample(rng).round().clamp(-limit, limit);
    for s in samples.iter_mut() {
        *s = Complex::new(cast(draw()), cast(draw()));
    }
}

impl InputSource for SyntheticSource {
    fn fill(&mut self, input: &mut InputData) -> anyhow::Result<bool> {
        Ok(self.fill_block(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parset::presets;

    #[test]
    fn test_interleaves_subbands() {
        let mut settings = presets::correlator(3, 16);
        settings.nr_subbands_per_subband_proc = 2;
        let mut src = SyntheticSource::new(&settings, vec![2, 3], 2, 1).unwrap();
        let mut input = InputData::new(&settings);

        let mut seen = Vec::new();
        while src.fill_block(&mut input) {
            seen.push(input.block);
        }
        assert_eq!(
            seen,
            vec![
                BlockId::new(0, 2, 0),
                BlockId::new(0, 3, 1),
                BlockId::new(1, 2, 0),
                BlockId::new(1, 3, 1),
            ]
        );
        input.check(&settings).unwrap();
    }

    #[test]
    fn test_same_seed_same_samples() {
        let settings = presets::correlator(2, 16);
        let mut a = InputData::new(&settings);
        let mut b = InputData::new(&settings);
        SyntheticSource::new(&settings, vec![0], 1, 42)
            .unwrap()
            .fill_block(&mut a);
        SyntheticSource::new(&settings, vec![0], 1, 42)
            .unwrap()
            .fill_block(&mut b);
        assert_eq!(a.samples.as_bytes().unwrap(), b.samples.as_bytes().unwrap());
        assert!(a.samples.as_bytes().unwrap().iter().any(|&x| x != 0));
    }

    #[test]
    fn test_flag_fraction_one_flags_every_station() {
        let settings = presets::correlator(4, 16);
        let mut src = SyntheticSource::new(&settings, vec![0], 1, 7)
            .unwrap()
            .with_flag_fraction(1.0);
        let mut input = InputData::new(&settings);
        assert!(src.fill_block(&mut input));
        assert!(input.flags.iter().all(|f| !f.is_empty()));
        assert!(input.flags.iter().all(|f| f.count() <= settings.block_size / 8));
    }

    #[test]
    fn test_rejects_too_many_subbands() {
        let settings = presets::correlator(3, 16);
        assert!(SyntheticSource::new(&settings, vec![0, 1], 1, 0).is_err());
        assert!(SyntheticSource::new(&settings, vec![99], 1, 0).is_err());
    }
}
