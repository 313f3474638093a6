//! # Multiscale Core
//!
//! Shared types and utilities for mean-field / spiking-network co-simulation.
//!
//! ## The Two Scales
//!
//! | Side | Representation | Stepping |
//! |------|----------------|----------|
//! | Continuous | `state[variable, region, mode]` | fixed `dt`, delayed history |
//! | Spiking | neuron populations + stimulating/recording devices | kernel resolution |
//!
//! ## Design Philosophy
//!
//! 1. The continuous integrator and the spiking kernel are collaborators, not code we own
//! 2. Misconfiguration fails before the first step
//! 3. Every region index set is sorted, unique and range-checked

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::warn;

/// Common errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Simulation error: {0}")]
    SimulationError(String),

    #[error("Invalid region indices: {0}")]
    InvalidIndices(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Time point (ms)
pub type Time = f64;

/// Index of a brain region in the connectivity
pub type RegionIndex = usize;

/// Continuous-side tensor laid out as `[variable, region, mode]`
pub type StateTensor = Array3<f64>;

// ============================================================================
// CONTINUOUS SIMULATOR BOUNDARY
// ============================================================================

fn one() -> usize {
    1
}

/// What the interfaces need to know about the continuous model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    /// State variable names, in tensor order
    pub state_variables: Vec<String>,
    /// Coupling term names, in tensor order
    #[serde(default)]
    pub coupling_terms: Vec<String>,
    pub number_of_regions: usize,
    #[serde(default = "one")]
    pub number_of_modes: usize,
}

impl ModelShape {
    pub fn new(state_variables: &[&str], coupling_terms: &[&str], number_of_regions: usize) -> Self {
        Self {
            state_variables: state_variables.iter().map(|s| s.to_string()).collect(),
            coupling_terms: coupling_terms.iter().map(|s| s.to_string()).collect(),
            number_of_regions,
            number_of_modes: 1,
        }
    }

    pub fn number_of_state_variables(&self) -> usize {
        self.state_variables.len()
    }

    pub fn state_variable_index(&self, name: &str) -> Option<usize> {
        self.state_variables.iter().position(|sv| sv == name)
    }

    pub fn coupling_term_index(&self, name: &str) -> Option<usize> {
        self.coupling_terms.iter().position(|ct| ct == name)
    }

    /// Shape of the state tensor
    pub fn state_dim(&self) -> (usize, usize, usize) {
        (self.state_variables.len(), self.number_of_regions, self.number_of_modes)
    }
}

/// Continuous-time (mean-field) simulator driven one step at a time.
///
/// The integrator itself lives outside this workspace; implementors expose
/// their state and coupling tensors in place.
pub trait ContinuousSimulator {
    fn shape(&self) -> ModelShape;

    /// Integration step (ms)
    fn dt(&self) -> Time;

    /// Current simulation time (ms)
    fn time(&self) -> Time;

    /// `[state_variable, region, mode]`
    fn state(&self) -> &StateTensor;

    fn state_mut(&mut self) -> &mut StateTensor;

    /// `[coupling_term, region, mode]`, already delayed by the simulator's history
    fn coupling(&self) -> &StateTensor;

    /// Advance exactly one step t -> t + dt
    fn integrate_step(&mut self) -> Result<()>;
}

// ============================================================================
// REGION INDICES
// ============================================================================

/// Sorted, deduplicated copy of `values`
pub fn unique_sorted<T: Ord + Clone>(values: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut out: Vec<T> = values.into_iter().collect();
    out.sort();
    out.dedup();
    out
}

/// Indices must be strictly increasing and below `number_of_regions`.
pub fn validate_region_indices(indices: &[RegionIndex], number_of_regions: usize) -> Result<()> {
    if let Some(w) = indices.windows(2).find(|w| w[0] >= w[1]) {
        return Err(CoreError::InvalidIndices(format!(
            "indices {} are not strictly increasing ({} followed by {})",
            extract_integer_intervals(indices),
            w[0],
            w[1]
        )));
    }
    if let Some(&bad) = indices.iter().find(|&&i| i >= number_of_regions) {
        return Err(CoreError::InvalidIndices(format!(
            "index {} out of range for {} regions",
            bad, number_of_regions
        )));
    }
    Ok(())
}

/// Which regions are integrated by the continuous side only, and which are
/// represented by spiking proxies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionPartition {
    pub continuous_nodes: Vec<RegionIndex>,
    pub spiking_nodes: Vec<RegionIndex>,
}

impl RegionPartition {
    /// Every region not listed in `spiking_nodes` is continuous-only.
    pub fn exclusive(number_of_regions: usize, spiking_nodes: &[RegionIndex]) -> Result<Self> {
        let spiking_nodes = unique_sorted(spiking_nodes.iter().copied());
        validate_region_indices(&spiking_nodes, number_of_regions)?;
        let continuous_nodes = (0..number_of_regions)
            .filter(|i| spiking_nodes.binary_search(i).is_err())
            .collect();
        Ok(Self { continuous_nodes, spiking_nodes })
    }

    pub fn is_spiking(&self, region: RegionIndex) -> bool {
        self.spiking_nodes.binary_search(&region).is_ok()
    }

    /// Size of the union of both node sets
    pub fn number_of_nodes(&self) -> usize {
        unique_sorted(self.continuous_nodes.iter().chain(self.spiking_nodes.iter()).copied()).len()
    }

    pub fn validate(&self, number_of_regions: usize, exclusive: bool) -> Result<()> {
        validate_region_indices(&self.continuous_nodes, number_of_regions)?;
        validate_region_indices(&self.spiking_nodes, number_of_regions)?;
        if !exclusive {
            return Ok(());
        }
        if let Some(shared) = self.continuous_nodes.iter().find(|i| self.is_spiking(**i)) {
            return Err(CoreError::InvalidIndices(format!(
                "region {} is modeled by both the continuous and the spiking side",
                shared
            )));
        }
        if self.number_of_nodes() != number_of_regions {
            return Err(CoreError::InvalidIndices(format!(
                "{} continuous + {} spiking nodes do not cover all {} regions",
                self.continuous_nodes.len(),
                self.spiking_nodes.len(),
                number_of_regions
            )));
        }
        Ok(())
    }
}

/// Compact label for an index set: `[0, 1, 2, 5, 7, 8]` -> `"0-2, 5, 7-8"`
pub fn extract_integer_intervals(indices: &[usize]) -> String {
    let sorted = unique_sorted(indices.iter().copied());
    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut end) = (first, first);
    for i in iter {
        if i == end + 1 {
            end = i;
        } else {
            parts.push(interval_label(start, end));
            start = i;
            end = i;
        }
    }
    parts.push(interval_label(start, end));
    parts.join(", ")
}

fn interval_label(start: usize, end: usize) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}-{}", start, end)
    }
}

// ============================================================================
// SUMMARIES
// ============================================================================

/// Compact description of a numeric attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Summary {
    /// All values equal
    Single(f64),
    /// At most three distinct values
    Values(Vec<f64>),
    /// Distinct values after rounding to `digits` significant places
    Rounded(Vec<f64>),
    Stats {
        n: usize,
        mean: f64,
        min: f64,
        max: f64,
        var: f64,
    },
    /// Degenerate input, returned untouched
    Raw(Vec<f64>),
}

/// Summarize a set of values for display.
///
/// Degenerate inputs (empty, all-NaN, all-Inf, or statistics that come out
/// non-finite) are logged and returned raw instead of failing.
pub fn summarize(values: &[f64], digits: Option<i32>) -> Summary {
    if values.iter().all(|v| !v.is_finite()) {
        warn!(n = values.len(), "summarize: no finite values, returning raw values");
        return Summary::Raw(values.to_vec());
    }

    let mut unique = values.to_vec();
    unique.sort_by(|a, b| a.total_cmp(b));
    unique.dedup();

    match unique.len() {
        1 => Summary::Single(unique[0]),
        2 | 3 => Summary::Values(unique),
        _ => {
            let summary = match digits {
                Some(d) => rounded_unique(&unique, d),
                None => stats(values),
            };
            match summary {
                Some(s) => s,
                None => {
                    warn!(n = values.len(), "summarize: degenerate statistics, returning raw values");
                    Summary::Raw(values.to_vec())
                }
            }
        }
    }
}

fn rounded_unique(unique: &[f64], digits: i32) -> Option<Summary> {
    let mut abs: Vec<f64> = unique.iter().map(|v| v.abs()).collect();
    abs.sort_by(|a, b| a.total_cmp(b));
    let scale = 10f64.powf(percentile(&abs, 95.0).log10().floor());
    if !scale.is_finite() || scale == 0.0 {
        return None;
    }
    let factor = 10f64.powi(digits);
    let mut rounded: Vec<f64> = unique
        .iter()
        .map(|v| scale * ((v / scale) * factor).round() / factor)
        .collect();
    rounded.sort_by(|a, b| a.total_cmp(b));
    rounded.dedup();
    Some(Summary::Rounded(rounded))
}

fn stats(values: &[f64]) -> Option<Summary> {
    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let var = if n > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };
    if [mean, min, max, var].iter().all(|x| x.is_finite()) {
        Some(Summary::Stats { n, mean, min, max, var })
    } else {
        None
    }
}

/// Linear-interpolated percentile of sorted values
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

// ============================================================================
// FILE UTILITIES
// ============================================================================

/// Drop every line after the leading header lines (those starting with
/// `header_chars`). The file itself is kept.
pub fn truncate_ascii_file_after_header(path: &Path, header_chars: &str) -> Result<()> {
    let content = fs::read_to_string(path)?;
    let mut header = String::new();
    for line in content.lines().take_while(|l| l.starts_with(header_chars)) {
        header.push_str(line);
        header.push('\n');
    }
    fs::write(path, header)?;
    Ok(())
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Where recording devices keep their events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    #[default]
    Memory,
    Ascii,
}

/// Co-simulation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CosimConfig {
    /// Coupling step (ms); interfaces and their transformers are built for it
    pub dt: Time,
    /// Target directory for file-backed recorders
    pub recordings_dir: PathBuf,
    /// Device used for `"RATE"` outputs and outputs without a model
    pub default_output_device: String,
    /// Device used for inputs without a model
    pub default_input_device: String,
    pub record_to: RecordingMode,
    /// Continuous and spiking nodes must partition the regions
    pub exclusive_nodes: bool,
    pub log_filter: String,
}

impl Default for CosimConfig {
    fn default() -> Self {
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            dt: 0.1,
            recordings_dir: working_dir.join("nest_recordings"),
            default_output_device: "inhomogeneous_poisson_generator".into(),
            default_input_device: "spike_recorder".into(),
            record_to: RecordingMode::Memory,
            exclusive_nodes: true,
            log_filter: "info".into(),
        }
    }
}

impl CosimConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply `MULTISCALE_RECORDINGS_DIR` and `MULTISCALE_DT` if set.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("MULTISCALE_RECORDINGS_DIR") {
            if !dir.trim().is_empty() {
                self.recordings_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dt) = std::env::var("MULTISCALE_DT") {
            self.dt = dt
                .trim()
                .parse()
                .map_err(|_| CoreError::ParseError(format!("MULTISCALE_DT={:?} is not a number", dt)))?;
        }
        Ok(self)
    }
}

// ============================================================================
// LOGGING
// ============================================================================

static TRACING_INIT: OnceLock<bool> = OnceLock::new();

/// Install the fmt subscriber once per process. `MULTISCALE_LOG` overrides
/// `default_filter`. Returns whether this process owns the subscriber.
pub fn init_tracing(default_filter: &str) -> bool {
    *TRACING_INIT.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("MULTISCALE_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_intervals() {
        assert_eq!(extract_integer_intervals(&[0, 1, 2, 5, 7, 8]), "0-2, 5, 7-8");
        assert_eq!(extract_integer_intervals(&[3]), "3");
        assert_eq!(extract_integer_intervals(&[]), "");
        assert_eq!(extract_integer_intervals(&[2, 0, 1, 1]), "0-2");
    }

    #[test]
    fn test_region_indices() {
        assert!(validate_region_indices(&[0, 1, 4], 5).is_ok());
        assert!(validate_region_indices(&[1, 1], 5).is_err());
        assert!(validate_region_indices(&[2, 1], 5).is_err());
        assert!(validate_region_indices(&[0, 5], 5).is_err());
    }

    #[test]
    fn test_exclusive_partition() {
        let partition = RegionPartition::exclusive(4, &[2, 0]).unwrap();
        assert_eq!(partition.spiking_nodes, vec![0, 2]);
        assert_eq!(partition.continuous_nodes, vec![1, 3]);
        assert_eq!(partition.number_of_nodes(), 4);
        assert!(partition.validate(4, true).is_ok());
        assert!(partition.is_spiking(2));
        assert!(!partition.is_spiking(1));
    }

    #[test]
    fn test_overlapping_partition() {
        let partition = RegionPartition {
            continuous_nodes: vec![0, 1, 2],
            spiking_nodes: vec![2, 3],
        };
        assert!(partition.validate(4, false).is_ok());
        assert!(partition.validate(4, true).is_err());

        let gap = RegionPartition {
            continuous_nodes: vec![0],
            spiking_nodes: vec![2],
        };
        assert!(gap.validate(3, true).is_err());
    }

    #[test]
    fn test_summarize() {
        assert_eq!(summarize(&[2.0, 2.0, 2.0], None), Summary::Single(2.0));
        assert_eq!(summarize(&[1.0, 2.0, 1.0], None), Summary::Values(vec![1.0, 2.0]));

        match summarize(&[1.0, 2.0, 3.0, 4.0], None) {
            Summary::Stats { n, mean, min, max, .. } => {
                assert_eq!(n, 4);
                assert!((mean - 2.5).abs() < 1e-12);
                assert_eq!(min, 1.0);
                assert_eq!(max, 4.0);
            }
            other => panic!("unexpected summary {:?}", other),
        }

        match summarize(&[1.01, 1.02, 2.04, 3.0], Some(0)) {
            Summary::Rounded(vals) => assert_eq!(vals, vec![1.0, 2.0, 3.0]),
            other => panic!("unexpected summary {:?}", other),
        }
    }

    #[test]
    fn test_summarize_degenerate() {
        let nans = [f64::NAN, f64::NAN];
        match summarize(&nans, None) {
            Summary::Raw(vals) => assert_eq!(vals.len(), 2),
            other => panic!("unexpected summary {:?}", other),
        }
        let infs = [f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY];
        assert!(matches!(summarize(&infs, None), Summary::Raw(_)));
        assert!(matches!(summarize(&[], None), Summary::Raw(_)));
        // A single infinity among finite values poisons the statistics
        let mixed = [1.0, 2.0, 3.0, f64::INFINITY];
        assert!(matches!(summarize(&mixed, None), Summary::Raw(_)));
    }

    #[test]
    fn test_truncate_after_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spikes.dat");
        fs::write(&path, "# a\n# b\n# sender\ttime_ms\n1\t0.1\n2\t0.2\n").unwrap();

        truncate_ascii_file_after_header(&path, "#").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# a\n# b\n# sender\ttime_ms\n");

        truncate_ascii_file_after_header(&path, "#").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# a\n# b\n# sender\ttime_ms\n");
    }

    #[test]
    fn test_config_defaults() {
        let config: CosimConfig = serde_json::from_str(r#"{"dt": 0.05, "record_to": "ascii"}"#).unwrap();
        assert_eq!(config.dt, 0.05);
        assert_eq!(config.record_to, RecordingMode::Ascii);
        assert_eq!(config.default_input_device, "spike_recorder");
        assert!(config.exclusive_nodes);
    }

    #[test]
    fn test_model_shape() {
        let shape = ModelShape::new(&["E", "I"], &["E"], 68);
        assert_eq!(shape.state_variable_index("I"), Some(1));
        assert_eq!(shape.coupling_term_index("I"), None);
        assert_eq!(shape.state_dim(), (2, 68, 1));
    }
}
