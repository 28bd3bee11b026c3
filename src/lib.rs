//! # subband-proc
//!
//! The subband processing engine of a radio-telescope digital back end.
//!
//! One block of raw per-station voltages for one subband goes in; cross
//! correlations and/or beamformed Stokes products come out, at a fixed
//! cadence, for as long as the observation runs.
//!
//! ## Layout
//!
//! - `parset`: observation settings and their validation
//! - `device`: accelerator queue capability, host reference queue, buffer arena
//! - `kernels`: named kernel parameterisations and size requirements
//! - `steps`: Preprocessing / Correlator / Coherent / Incoherent signal chains
//! - `postprocess`: flag propagation, integration, weighting (CPU side)
//! - `pipeline`: the `SubbandProc` orchestrator, pools and the threaded runner
//!
//! Kernel bodies are opaque: the crate owns buffer lifecycle, stage ordering,
//! aliasing safety and the producer/consumer contract, not the maths inside
//! an FFT.

pub mod device;
pub mod error;
pub mod kernels;
pub mod parset;
pub mod pipeline;
pub mod postprocess;
pub mod steps;

pub use error::PipelineError;

/// Fixed constants of the signal chain.
pub mod config {
    /// Polarisations per station (X and Y).
    pub const NR_POLARIZATIONS: usize = 2;

    /// Taps per channel of every polyphase FIR filter.
    pub const NR_TAPS: usize = 16;

    /// Bytes in one single-precision complex sample.
    pub const SIZEOF_FCOMPLEX: usize = 8;

    /// Bytes in one single-precision float.
    pub const SIZEOF_FLOAT: usize = 4;

    /// Bytes in one double-precision delay entry.
    pub const SIZEOF_DELAY: usize = 8;

    /// Number of baselines for `nr_stations`, autocorrelations included.
    pub fn nr_baselines(nr_stations: usize) -> usize {
        nr_stations * (nr_stations + 1) / 2
    }

    /// Baseline index of the station pair (`stat1`, `stat2`), `stat1 <= stat2`.
    pub fn baseline(stat1: usize, stat2: usize) -> usize {
        debug_assert!(stat1 <= stat2);
        stat2 * (stat2 + 1) / 2 + stat1
    }

}
