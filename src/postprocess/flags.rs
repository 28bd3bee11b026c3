//! Flag ranges and their propagation through the correlator chain.
//!
//! Input flags mark sample ranges per station. After the polyphase filter a
//! flagged input sample spoils one channel sample, plus the `NR_TAPS - 1`
//! channel samples whose filter memory still holds it. Near the block end
//! that memory reaches into the next block; the overflow is carried over
//! per (local subband, station).

use rayon::prelude::*;

use ndarray::Array3;

use crate::config::NR_TAPS;

/// Sorted, disjoint, half-open index ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseSet {
    ranges: Vec<(usize, usize)>,
}

impl SparseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges<I: IntoIterator<Item = (usize, usize)>>(ranges: I) -> Self {
        let mut set = Self::new();
        for (begin, end) in ranges {
            set.include(begin, end);
        }
        set
    }

    /// Add `[begin, end)`, merging with overlapping or adjacent ranges.
    pub fn include(&mut self, begin: usize, end: usize) {
        if begin >= end {
            return;
        }
        let (mut begin, mut end) = (begin, end);
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for &(b, e) in &self.ranges {
            if e < begin {
                merged.push((b, e));
            } else if b > end {
                if !placed {
                    merged.push((begin, end));
                    placed = true;
                }
                merged.push((b, e));
            } else {
                begin = begin.min(b);
                end = end.max(e);
            }
        }
        if !placed {
            merged.push((begin, end));
        }
        self.ranges = merged;
    }

    /// Add every range of `other`.
    pub fn include_set(&mut self, other: &SparseSet) {
        for &(b, e) in &other.ranges {
            self.include(b, e);
        }
    }

    pub fn union(&self, other: &SparseSet) -> SparseSet {
        let mut out = self.clone();
        out.include_set(other);
        out
    }

    pub fn contains(&self, index: usize) -> bool {
        self.ranges.iter().any(|&(b, e)| b <= index && index < e)
    }

    /// Number of flagged indices.
    pub fn count(&self) -> usize {
        self.ranges.iter().map(|(b, e)| e - b).sum()
    }

    /// Number of flagged indices inside `[begin, end)`.
    pub fn count_in(&self, begin: usize, end: usize) -> usize {
        self.ranges
            .iter()
            .map(|&(b, e)| e.min(end).saturating_sub(b.max(begin)))
            .sum()
    }

    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

/// Map sample flags of one station onto channel samples.
///
/// `carry` holds flags spilled from the previous block and receives this
/// block's spill.
pub fn channel_flags(
    sample_flags: &SparseSet,
    nr_channels: usize,
    nr_samples_per_channel: usize,
    carry: &mut SparseSet,
) -> SparseSet {
    let nr_samples = nr_channels * nr_samples_per_channel;

    if nr_channels == 1 {
        let mut out = SparseSet::new();
        for &(b, e) in sample_flags.ranges() {
            out.include(b.min(nr_samples), e.min(nr_samples));
        }
        return out;
    }

    let log2 = nr_channels.trailing_zeros();
    let mut out = std::mem::take(carry);
    for &(b, e) in sample_flags.ranges() {
        let e = e.min(nr_samples);
        if b >= e {
            continue;
        }
        let begin = b >> log2;
        let end = ((e - 1) >> log2) + NR_TAPS;

        out.include(begin.min(nr_samples_per_channel), end.min(nr_samples_per_channel));
        if end > nr_samples_per_channel {
            carry.include(
                begin.max(nr_samples_per_channel) - nr_samples_per_channel,
                end - nr_samples_per_channel,
            );
        }
    }
    out
}

/// Per-local-subband flag state of a correlator.
#[derive(Clone, Debug)]
pub struct FlagPropagator {
    nr_channels: usize,
    nr_samples_per_channel: usize,

    /// `[local subband][station]`
    carry: Vec<Vec<SparseSet>>,
}

impl FlagPropagator {
    pub fn new(
        nr_subbands: usize,
        nr_stations: usize,
        nr_channels: usize,
        nr_samples_per_channel: usize,
    ) -> Self {
        Self {
            nr_channels,
            nr_samples_per_channel,
            carry: vec![vec![SparseSet::new(); nr_stations]; nr_subbands],
        }
    }

    /// Channel flags of every station for the next block of `local_subband`.
    pub fn propagate(&mut self, local_subband: usize, station_flags: &[SparseSet]) -> Vec<SparseSet> {
        let nr_channels = self.nr_channels;
        let nspc = self.nr_samples_per_channel;
        station_flags
            .iter()
            .zip(self.carry[local_subband].iter_mut())
            .map(|(flags, carry)| channel_flags(flags, nr_channels, nspc, carry))
            .collect()
    }

    pub fn carried(&self, local_subband: usize, station: usize) -> &SparseSet {
        &self.carry[local_subband][station]
    }
}

/// Station pair of every baseline, in baseline order.
pub fn baseline_stations(nr_stations: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::with_capacity(crate::config::nr_baselines(nr_stations));
    for s2 in 0..nr_stations {
        for s1 in 0..=s2 {
            pairs.push((s1, s2));
        }
    }
    pairs
}

/// Unflagged samples per `[integration, baseline, channel]`.
///
/// A baseline loses every sample flagged on either of its stations. With a
/// polyphase filter channel 0 carries no valid data and always counts 0.
pub fn count_valid_samples(
    channel_flags: &[SparseSet],
    nr_samples_per_integration: usize,
    uses_ppf: bool,
    out: &mut Array3<u32>,
) {
    let (nr_integrations, nr_baselines, nr_channels) = out.dim();
    let pairs = baseline_stations(channel_flags.len());
    debug_assert_eq!(pairs.len(), nr_baselines);

    let counts: Vec<Vec<u32>> = pairs
        .par_iter()
        .map(|&(s1, s2)| {
            let flags = channel_flags[s1].union(&channel_flags[s2]);
            (0..nr_integrations)
                .map(|slot| {
                    let begin = slot * nr_samples_per_integration;
                    let flagged = flags.count_in(begin, begin + nr_samples_per_integration);
                    (nr_samples_per_integration - flagged) as u32
                })
                .collect()
        })
        .collect();

    for (bl, per_slot) in counts.iter().enumerate() {
        for (slot, &valid) in per_slot.iter().enumerate() {
            for ch in 0..nr_channels {
                out[[slot, bl, ch]] = if uses_ppf && ch == 0 { 0 } else { valid };
            }
        }
    }
}
