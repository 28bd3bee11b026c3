//! Observation settings: everything the pipeline needs to size itself.
//!
//! A `SubbandProc` reads these once at construction and never again mutates
//! them. The structs are serde-friendly so a whole observation can be
//! described in one JSON document.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::{self, NR_POLARIZATIONS};
use crate::error::PipelineError;

/// Kind of power product produced by a beamforming path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StokesType {
    /// Total intensity only.
    I,
    /// Full polarisation state.
    #[serde(rename = "IQUV")]
    Iquv,
    /// Raw complex voltages (Xr, Xi, Yr, Yi); no detection.
    #[serde(rename = "XXYY")]
    Xxyy,
}

impl StokesType {
    /// Components written per sample.
    pub fn nr_components(self) -> usize {
        match self {
            StokesType::I => 1,
            StokesType::Iquv | StokesType::Xxyy => 4,
        }
    }

    /// Whether the product is complex voltages rather than detected power.
    pub fn is_voltages(self) -> bool {
        self == StokesType::Xxyy
    }
}

impl fmt::Display for StokesType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StokesType::I => write!(f, "I"),
            StokesType::Iquv => write!(f, "IQUV"),
            StokesType::Xxyy => write!(f, "XXYY"),
        }
    }
}

/// Settings of one beamformed product (coherent or incoherent).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StokesSettings {
    pub stokes_type: StokesType,

    /// Output channels per subband; a polyphase filter runs when > 1.
    pub nr_channels: usize,

    /// Samples summed on the device per output sample.
    pub time_integration_factor: usize,
}

impl Default for StokesSettings {
    fn default() -> Self {
        Self {
            stokes_type: StokesType::I,
            nr_channels: 16,
            time_integration_factor: 4,
        }
    }
}

impl StokesSettings {
    pub fn nr_stokes(&self) -> usize {
        self.stokes_type.nr_components()
    }

    /// Output samples per channel for one block of `block_size` samples.
    pub fn nr_samples(&self, block_size: usize) -> usize {
        block_size / self.nr_channels / self.time_integration_factor
    }
}

/// Correlator product settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorSettings {
    pub enabled: bool,

    /// Channels per subband; a polyphase filter runs when > 1.
    pub nr_channels: usize,

    /// Blocks folded into one emitted integration (integration depth).
    pub nr_blocks_per_integration: usize,

    /// Integrations emitted from a single block.
    pub nr_integrations_per_block: usize,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            nr_channels: 64,
            nr_blocks_per_integration: 1,
            nr_integrations_per_block: 1,
        }
    }
}

impl CorrelatorSettings {
    pub fn nr_samples_per_channel(&self, block_size: usize) -> usize {
        block_size / self.nr_channels
    }

    /// Channel samples in one integration slot of one block.
    pub fn nr_samples_per_integration(&self, block_size: usize) -> usize {
        self.nr_samples_per_channel(block_size) / self.nr_integrations_per_block
    }

    pub fn uses_ppf(&self) -> bool {
        self.nr_channels > 1
    }
}

/// Beamformer settings shared by the coherent and incoherent paths.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamFormerSettings {
    pub enabled: bool,

    /// Channels of the first FFT, at which delays are compensated.
    pub nr_delay_compensation_channels: usize,

    /// Channels after the (optional) second FFT.
    pub nr_high_resolution_channels: usize,

    pub coherent: StokesSettings,
    pub incoherent: StokesSettings,
}

impl Default for BeamFormerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            nr_delay_compensation_channels: 64,
            nr_high_resolution_channels: 256,
            coherent: StokesSettings::default(),
            incoherent: StokesSettings::default(),
        }
    }
}

impl BeamFormerSettings {
    /// Whether the high-resolution channelisation needs a second FFT pass.
    pub fn needs_second_fft(&self) -> bool {
        self.nr_high_resolution_channels / self.nr_delay_compensation_channels > 1
    }
}

/// One subband: its pointing group and sky frequency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubbandSettings {
    /// Index into `ObservationSettings::saps`.
    pub sap: usize,

    /// Centre frequency in Hz.
    pub central_frequency: f64,
}

/// One pointing group and the beams it asks for.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SapSettings {
    pub nr_coherent_tabs: usize,
    pub nr_incoherent_tabs: usize,
}

/// Complete, read-only description of an observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationSettings {
    pub nr_stations: usize,

    /// Bits per real sample component (8 or 16).
    pub nr_bits_per_sample: u32,

    /// Samples per subband per block.
    pub block_size: usize,

    /// Subband bandwidth in Hz.
    pub subband_bandwidth: f64,

    pub subbands: Vec<SubbandSettings>,
    pub saps: Vec<SapSettings>,

    /// Subbands handled concurrently by one `SubbandProc`.
    pub nr_subbands_per_subband_proc: usize,

    pub delay_compensation: bool,
    pub bandpass_correction: bool,

    pub correlator: CorrelatorSettings,
    pub beam_former: BeamFormerSettings,
}

impl Default for ObservationSettings {
    fn default() -> Self {
        Self {
            nr_stations: 4,
            nr_bits_per_sample: 16,
            block_size: 4096,
            subband_bandwidth: 195_312.5,
            subbands: (0..4)
                .map(|i| SubbandSettings {
                    sap: 0,
                    central_frequency: 150e6 + i as f64 * 195_312.5,
                })
                .collect(),
            saps: vec![SapSettings {
                nr_coherent_tabs: 2,
                nr_incoherent_tabs: 1,
            }],
            nr_subbands_per_subband_proc: 1,
            delay_compensation: true,
            bandpass_correction: true,
            correlator: CorrelatorSettings::default(),
            beam_former: BeamFormerSettings::default(),
        }
    }
}

impl ObservationSettings {
    /// Load settings from a JSON document.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let settings: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(settings)
    }

    pub fn nr_baselines(&self) -> usize {
        config::nr_baselines(self.nr_stations)
    }

    /// Bytes in one complex input sample.
    pub fn bytes_per_input_sample(&self) -> usize {
        2 * self.nr_bits_per_sample as usize / 8
    }

    /// Bytes in one block of raw input for all stations and polarisations.
    pub fn input_block_bytes(&self) -> usize {
        self.nr_stations * self.block_size * NR_POLARIZATIONS * self.bytes_per_input_sample()
    }

    pub fn sap_of_subband(&self, subband: usize) -> Option<usize> {
        self.subbands.get(subband).map(|sb| sb.sap)
    }

    pub fn max_nr_coherent_tabs(&self) -> usize {
        self.saps.iter().map(|s| s.nr_coherent_tabs).max().unwrap_or(0)
    }

    pub fn max_nr_incoherent_tabs(&self) -> usize {
        self.saps.iter().map(|s| s.nr_incoherent_tabs).max().unwrap_or(0)
    }

    pub fn correlator_enabled(&self) -> bool {
        self.correlator.enabled
    }

    pub fn coherent_enabled(&self) -> bool {
        self.beam_former.enabled && self.max_nr_coherent_tabs() > 0
    }

    pub fn incoherent_enabled(&self) -> bool {
        self.beam_former.enabled && self.max_nr_incoherent_tabs() > 0
    }

    /// Whether the shared beamformer preprocessing chain runs.
    pub fn beam_former_enabled(&self) -> bool {
        self.coherent_enabled() || self.incoherent_enabled()
    }

    /// Check every sizing rule the pipeline relies on.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));

        if self.nr_stations == 0 {
            return invalid("at least one station is required".into());
        }
        if self.block_size == 0 {
            return invalid("block size must be positive".into());
        }
        if self.nr_bits_per_sample != 8 && self.nr_bits_per_sample != 16 {
            return invalid(format!(
                "{} bits per sample is not supported (use 8 or 16)",
                self.nr_bits_per_sample
            ));
        }
        if self.nr_subbands_per_subband_proc == 0 {
            return invalid("a subband processor must handle at least one subband".into());
        }
        for (idx, sb) in self.subbands.iter().enumerate() {
            if sb.sap >= self.saps.len() {
                return invalid(format!(
                    "subband {} refers to SAP {}, but only {} SAPs exist",
                    idx,
                    sb.sap,
                    self.saps.len()
                ));
            }
        }

        if !self.correlator_enabled() && !self.beam_former_enabled() {
            return Err(PipelineError::UnsupportedCombination(
                "neither correlation nor beamforming is enabled".into(),
            ));
        }

        if self.correlator_enabled() {
            self.validate_correlator()?;
        }
        if self.beam_former_enabled() {
            self.validate_beam_former()?;
        }
        Ok(())
    }

    fn validate_correlator(&self) -> Result<(), PipelineError> {
        let corr = &self.correlator;
        check_channels("correlator", corr.nr_channels, self.block_size)?;
        if corr.nr_blocks_per_integration == 0 || corr.nr_integrations_per_block == 0 {
            return Err(PipelineError::InvalidConfig(
                "integration counts must be positive".into(),
            ));
        }
        if corr.nr_blocks_per_integration > 1 && corr.nr_integrations_per_block > 1 {
            return Err(PipelineError::InvalidConfig(format!(
                "cannot integrate over {} blocks and split a block into {} integrations at once",
                corr.nr_blocks_per_integration, corr.nr_integrations_per_block
            )));
        }
        let per_channel = corr.nr_samples_per_channel(self.block_size);
        if per_channel % corr.nr_integrations_per_block != 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "{} samples per channel do not split into {} integrations",
                per_channel, corr.nr_integrations_per_block
            )));
        }
        Ok(())
    }

    fn validate_beam_former(&self) -> Result<(), PipelineError> {
        let bf = &self.beam_former;
        check_channels(
            "delay compensation",
            bf.nr_delay_compensation_channels,
            self.block_size,
        )?;
        check_channels(
            "high resolution",
            bf.nr_high_resolution_channels,
            self.block_size,
        )?;
        if bf.nr_high_resolution_channels % bf.nr_delay_compensation_channels != 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "{} high-resolution channels are not a multiple of {} delay-compensation channels",
                bf.nr_high_resolution_channels, bf.nr_delay_compensation_channels
            )));
        }

        if self.coherent_enabled() {
            check_stokes("coherent", &bf.coherent, self.block_size)?;
        }
        if self.incoherent_enabled() {
            if bf.incoherent.stokes_type.is_voltages() {
                return Err(PipelineError::UnsupportedCombination(
                    "incoherent beams cannot produce complex voltages".into(),
                ));
            }
            check_stokes("incoherent", &bf.incoherent, self.block_size)?;
        }
        Ok(())
    }
}

fn check_channels(what: &str, nr_channels: usize, block_size: usize) -> Result<(), PipelineError> {
    if nr_channels == 0 || !nr_channels.is_power_of_two() {
        return Err(PipelineError::InvalidConfig(format!(
            "{} channel count {} is not a power of two",
            what, nr_channels
        )));
    }
    if block_size % nr_channels != 0 {
        return Err(PipelineError::InvalidConfig(format!(
            "block size {} is not a multiple of {} {} channels",
            block_size, nr_channels, what
        )));
    }
    Ok(())
}

fn check_stokes(what: &str, stokes: &StokesSettings, block_size: usize) -> Result<(), PipelineError> {
    check_channels(what, stokes.nr_channels, block_size)?;
    if stokes.time_integration_factor == 0 {
        return Err(PipelineError::InvalidConfig(format!(
            "{} time integration factor must be positive",
            what
        )));
    }
    if stokes.stokes_type.is_voltages() && stokes.time_integration_factor != 1 {
        return Err(PipelineError::InvalidConfig(format!(
            "{} complex voltages cannot be integrated in time (factor {})",
            what, stokes.time_integration_factor
        )));
    }
    if (block_size / stokes.nr_channels) % stokes.time_integration_factor != 0 {
        return Err(PipelineError::InvalidConfig(format!(
            "{} samples per channel do not divide by time integration factor {}",
            what, stokes.time_integration_factor
        )));
    }
    Ok(())
}

/// Canned configurations used by the CLI and tests.
pub mod presets {
    use super::*;

    /// Correlator only, polyphase filtered.
    pub fn correlator(nr_stations: usize, nr_channels: usize) -> ObservationSettings {
        ObservationSettings {
            nr_stations,
            correlator: CorrelatorSettings {
                enabled: true,
                nr_channels,
                ..Default::default()
            },
            beam_former: BeamFormerSettings {
                enabled: false,
                ..Default::default()
            },
            saps: vec![SapSettings::default()],
            ..Default::default()
        }
    }

    /// Beamformer only, with the given beam counts per SAP.
    pub fn beam_former(nr_stations: usize, saps: Vec<SapSettings>) -> ObservationSettings {
        let subbands = (0..saps.len() * 2)
            .map(|i| SubbandSettings {
                sap: i % saps.len(),
                central_frequency: 150e6 + i as f64 * 195_312.5,
            })
            .collect();
        ObservationSettings {
            nr_stations,
            subbands,
            saps,
            correlator: CorrelatorSettings {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Correlator plus coherent and incoherent beams.
    pub fn combined(nr_stations: usize) -> ObservationSettings {
        ObservationSettings {
            nr_stations,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let settings = ObservationSettings::default();
        settings.validate().expect("default settings should validate");
        assert!(settings.correlator_enabled());
        assert!(settings.coherent_enabled());
        assert!(settings.incoherent_enabled());
    }

    #[test]
    fn test_presets_validate() {
        presets::correlator(3, 1).validate().unwrap();
        presets::correlator(3, 64).validate().unwrap();
        presets::combined(5).validate().unwrap();
        presets::beam_former(
            4,
            vec![SapSettings {
                nr_coherent_tabs: 3,
                nr_incoherent_tabs: 0,
            }],
        )
        .validate()
        .unwrap();
    }

    #[test]
    fn test_nothing_enabled_is_unsupported() {
        let mut settings = presets::correlator(3, 16);
        settings.correlator.enabled = false;
        let err = settings.validate().expect_err("no products should be rejected");
        assert!(matches!(err, PipelineError::UnsupportedCombination(_)));
    }

    #[test]
    fn test_rejects_non_power_of_two_channels() {
        let settings = presets::correlator(3, 48);
        assert!(matches!(
            settings.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_double_integration() {
        let mut settings = presets::correlator(3, 16);
        settings.correlator.nr_blocks_per_integration = 2;
        settings.correlator.nr_integrations_per_block = 2;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_incoherent_voltages() {
        let mut settings = presets::combined(3);
        settings.beam_former.incoherent.stokes_type = StokesType::Xxyy;
        settings.beam_former.incoherent.time_integration_factor = 1;
        assert!(matches!(
            settings.validate(),
            Err(PipelineError::UnsupportedCombination(_))
        ));
    }

    #[test]
    fn test_rejects_integrated_voltages() {
        let mut settings = presets::combined(3);
        settings.beam_former.coherent.stokes_type = StokesType::Xxyy;
        settings.beam_former.coherent.time_integration_factor = 2;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_sap() {
        let mut settings = presets::combined(3);
        settings.subbands[0].sap = 7;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_second_fft_ratio() {
        let mut bf = BeamFormerSettings::default();
        assert!(bf.needs_second_fft());
        bf.nr_high_resolution_channels = bf.nr_delay_compensation_channels;
        assert!(!bf.needs_second_fft());
    }

    #[test]
    fn test_zero_beams_disable_paths() {
        let settings = presets::beam_former(
            3,
            vec![SapSettings {
                nr_coherent_tabs: 0,
                nr_incoherent_tabs: 2,
            }],
        );
        assert!(!settings.coherent_enabled());
        assert!(settings.incoherent_enabled());
    }

    #[test]
    fn test_json_roundtrip_defaults_missing_fields() {
        let json = r#"{ "nr_stations": 6, "correlator": { "nr_channels": 16 } }"#;
        let settings: ObservationSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.nr_stations, 6);
        assert_eq!(settings.correlator.nr_channels, 16);
        assert_eq!(settings.correlator.nr_blocks_per_integration, 1);
        assert_eq!(settings.block_size, ObservationSettings::default().block_size);
    }

    #[test]
    fn test_derived_sizes() {
        let settings = presets::correlator(3, 64);
        assert_eq!(settings.nr_baselines(), 6);
        assert_eq!(settings.bytes_per_input_sample(), 4);
        assert_eq!(settings.input_block_bytes(), 3 * 4096 * 2 * 4);
        assert_eq!(settings.correlator.nr_samples_per_channel(4096), 64);
    }
}
