//! # Transformers
//!
//! Stateful numeric stages between the two representations.
//!
//! | Model | Input | Output variables |
//! |-------|-------|------------------|
//! | `linear` | values `[node, time]` | `value` |
//! | `spikes_histogram_rate` | spike trains | `rate` |
//! | `spikes_kernel_rate` | spike trains | `rate` |
//! | `red_wong_wang_exc` | spike trains or rates | `S`, `R` |
//!
//! Every transformer exposes its result in `output_buffer` as
//! `[node, variable, time]`.

use multiscale_core::Time;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TransformerError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("{model} transformer runs at dt {configured}, asked for {requested}")]
    StepMismatch {
        model: &'static str,
        configured: Time,
        requested: Time,
    },

    #[error("{0} transformer used before configure()")]
    NotConfigured(&'static str),

    #[error("{model} transformer cannot run {direction}")]
    NotApplicable {
        model: &'static str,
        direction: Direction,
    },

    #[error("{model} transformer expects {expected}")]
    WrongInput {
        model: &'static str,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, TransformerError>;

/// Which way data flows through a transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Mean-field values towards spiking devices
    ToSpiking,
    /// Recorded spiking activity towards mean-field state
    FromSpiking,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToSpiking => f.write_str("continuous -> spiking"),
            Direction::FromSpiking => f.write_str("spiking -> continuous"),
        }
    }
}

// ============================================================================
// MODELS
// ============================================================================

/// `scale_factor * x + translation_factor`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearParams {
    pub scale_factor: f64,
    pub translation_factor: f64,
}

impl Default for LinearParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            translation_factor: 0.0,
        }
    }
}

/// Binned population rate: spikes per neuron per ms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistogramRateParams {
    pub bin_size: Time,         // ms
    pub number_of_neurons: f64, // population size
    pub scale_factor: f64,
}

impl Default for HistogramRateParams {
    fn default() -> Self {
        Self {
            bin_size: 0.1,
            number_of_neurons: 1.0,
            scale_factor: 1.0,
        }
    }
}

/// Gaussian-kernel population rate evaluated at bin centres
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelRateParams {
    pub sigma: Time,    // kernel width (ms)
    pub bin_size: Time, // ms
    pub number_of_neurons: f64,
    pub scale_factor: f64,
}

impl Default for KernelRateParams {
    fn default() -> Self {
        Self {
            sigma: 3.0,
            bin_size: 0.1,
            number_of_neurons: 1.0,
            scale_factor: 1.0,
        }
    }
}

/// Rate estimate feeding the gating dynamics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateSource {
    #[default]
    Histogram,
    Kernel {
        sigma: Time,
    },
}

/// Excitatory synaptic gating of the reduced Wong-Wang model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedWongWangParams {
    pub tau_s: f64, // NMDA decay (ms)
    pub tau_r: f64, // input rate decay (ms)
    pub gamma: f64, // kinetic parameter
    /// Expected integration step (ms). The step actually used is the one
    /// given to [`Transformer::configure`]; a different value here is rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dt: Option<Time>,
    pub number_of_neurons: f64,
    pub rate: RateSource,
    /// `[S, R]` at configure time
    pub initial_state: [f64; 2],
}

impl Default for RedWongWangParams {
    fn default() -> Self {
        Self {
            tau_s: 100.0,
            tau_r: 10.0,
            gamma: 0.641 / 1000.0,
            dt: None,
            number_of_neurons: 1.0,
            rate: RateSource::Histogram,
            initial_state: [0.0, 0.0],
        }
    }
}

impl RedWongWangParams {
    fn dfun(&self, s: f64, r: f64, r_in: f64) -> (f64, f64) {
        (
            -(s / self.tau_s) + (1.0 - s) * r * self.gamma,
            -(r - r_in) / self.tau_r,
        )
    }
}

/// S in [0, 1], R >= 0
fn gating_bounds(s: f64, r: f64) -> (f64, f64) {
    (s.max(0.0).min(1.0), r.max(0.0))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum TransformerModel {
    Linear(LinearParams),
    SpikesHistogramRate(HistogramRateParams),
    SpikesKernelRate(KernelRateParams),
    RedWongWangExc(RedWongWangParams),
}

impl TransformerModel {
    pub fn name(&self) -> &'static str {
        match self {
            TransformerModel::Linear(_) => "linear",
            TransformerModel::SpikesHistogramRate(_) => "spikes_histogram_rate",
            TransformerModel::SpikesKernelRate(_) => "spikes_kernel_rate",
            TransformerModel::RedWongWangExc(_) => "red_wong_wang_exc",
        }
    }

    /// Identity linear transform
    pub fn identity() -> Self {
        TransformerModel::Linear(LinearParams::default())
    }

    pub fn output_variables(&self) -> &'static [&'static str] {
        match self {
            TransformerModel::Linear(_) => &["value"],
            TransformerModel::SpikesHistogramRate(_) | TransformerModel::SpikesKernelRate(_) => &["rate"],
            TransformerModel::RedWongWangExc(_) => &["S", "R"],
        }
    }

    pub fn is_applicable(&self, direction: Direction) -> bool {
        match self {
            TransformerModel::Linear(_) => true,
            _ => direction == Direction::FromSpiking,
        }
    }

    fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(TransformerError::InvalidParameter(format!(
                    "{}.{} must be positive, got {}",
                    self.name(),
                    name,
                    v
                )))
            }
        };
        match self {
            TransformerModel::Linear(p) => {
                if !(p.scale_factor.is_finite() && p.translation_factor.is_finite()) {
                    return Err(TransformerError::InvalidParameter(format!(
                        "linear factors must be finite, got {} and {}",
                        p.scale_factor, p.translation_factor
                    )));
                }
                Ok(())
            }
            TransformerModel::SpikesHistogramRate(p) => {
                positive("bin_size", p.bin_size)?;
                positive("number_of_neurons", p.number_of_neurons)
            }
            TransformerModel::SpikesKernelRate(p) => {
                positive("sigma", p.sigma)?;
                positive("bin_size", p.bin_size)?;
                positive("number_of_neurons", p.number_of_neurons)
            }
            TransformerModel::RedWongWangExc(p) => {
                positive("tau_s", p.tau_s)?;
                positive("tau_r", p.tau_r)?;
                if let Some(dt) = p.dt {
                    positive("dt", dt)?;
                }
                positive("number_of_neurons", p.number_of_neurons)?;
                if let RateSource::Kernel { sigma } = p.rate {
                    positive("rate.sigma", sigma)?;
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// RATE ESTIMATES
// ============================================================================

/// Spike trains of every proxy node over one window
#[derive(Debug, Clone, PartialEq)]
pub enum TransformerInput {
    /// `[node, time]`
    Values(Array2<f64>),
    /// Spike times per node within `[t_start, t_start + duration]`
    SpikeTrains {
        trains: Vec<Vec<Time>>,
        t_start: Time,
        duration: Time,
    },
}

fn same_step(a: Time, b: Time) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

fn number_of_bins(duration: Time, bin_size: Time) -> usize {
    ((duration / bin_size).round() as usize).max(1)
}

/// Spike counts `[node, bin]`; a spike exactly on the window end falls in the
/// last bin.
pub fn spike_counts(trains: &[Vec<Time>], t_start: Time, duration: Time, bin_size: Time) -> Array2<f64> {
    let n_bins = number_of_bins(duration, bin_size);
    let t_end = t_start + duration;
    let mut counts = Array2::zeros((trains.len(), n_bins));
    for (node, train) in trains.iter().enumerate() {
        for &t in train {
            if t < t_start || t > t_end {
                continue;
            }
            let bin = (((t - t_start) / bin_size).floor() as usize).min(n_bins - 1);
            counts[[node, bin]] += 1.0;
        }
    }
    counts
}

/// Population rate per neuron (spikes/ms) from binned counts
pub fn histogram_rate(
    trains: &[Vec<Time>],
    t_start: Time,
    duration: Time,
    bin_size: Time,
    number_of_neurons: f64,
) -> Array2<f64> {
    spike_counts(trains, t_start, duration, bin_size) / (number_of_neurons * bin_size)
}

/// Population rate per neuron (spikes/ms) from a Gaussian kernel at bin centres
pub fn kernel_rate(
    trains: &[Vec<Time>],
    t_start: Time,
    duration: Time,
    bin_size: Time,
    sigma: Time,
    number_of_neurons: f64,
) -> Array2<f64> {
    let n_bins = number_of_bins(duration, bin_size);
    let norm = 1.0 / (sigma * (2.0 * PI).sqrt() * number_of_neurons);
    Array2::from_shape_fn((trains.len(), n_bins), |(node, bin)| {
        let centre = t_start + (bin as f64 + 0.5) * bin_size;
        trains[node]
            .iter()
            .map(|t| (-(centre - t).powi(2) / (2.0 * sigma * sigma)).exp())
            .sum::<f64>()
            * norm
    })
}

// ============================================================================
// TRANSFORMER
// ============================================================================

/// A transformer with its buffers.
///
/// `state` is `[variable, node]`, sized once by [`Transformer::configure`],
/// which also fixes the step `dt` shared with the outer loop.
#[derive(Debug, Clone)]
pub struct Transformer {
    pub model: TransformerModel,
    /// `[node, time]` as fed to the dynamics
    pub input_buffer: Array2<f64>,
    /// `[node, variable, time]`
    pub output_buffer: Array3<f64>,
    state: Array2<f64>,
    n_proxies: Option<usize>,
    dt: Option<Time>,
}

impl Transformer {
    pub fn new(model: TransformerModel) -> Self {
        Self {
            model,
            input_buffer: Array2::zeros((0, 0)),
            output_buffer: Array3::zeros((0, 0, 0)),
            state: Array2::zeros((0, 0)),
            n_proxies: None,
            dt: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.model.name()
    }

    pub fn state(&self) -> &Array2<f64> {
        &self.state
    }

    pub fn number_of_proxies(&self) -> Option<usize> {
        self.n_proxies
    }

    pub fn dt(&self) -> Option<Time> {
        self.dt
    }

    /// Size buffers for `n_proxies` nodes stepping by `dt`. Repeating with
    /// the same size and step is a no-op; anything else is rejected.
    pub fn configure(&mut self, n_proxies: usize, direction: Direction, dt: Time) -> Result<()> {
        if !self.model.is_applicable(direction) {
            return Err(TransformerError::NotApplicable {
                model: self.name(),
                direction,
            });
        }
        self.model.validate()?;
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(TransformerError::InvalidParameter(format!(
                "{} step must be positive, got {}",
                self.name(),
                dt
            )));
        }
        let declared = match &self.model {
            TransformerModel::RedWongWangExc(p) => p.dt,
            _ => None,
        };
        if let Some(configured) = self.dt.or(declared) {
            if !same_step(configured, dt) {
                return Err(TransformerError::StepMismatch {
                    model: self.name(),
                    configured,
                    requested: dt,
                });
            }
        }
        match self.n_proxies {
            Some(n) if n == n_proxies => return Ok(()),
            Some(n) => {
                return Err(TransformerError::ShapeMismatch(format!(
                    "{} transformer configured for {} proxies, asked for {}",
                    self.name(),
                    n,
                    n_proxies
                )))
            }
            None => {}
        }
        self.state = match &self.model {
            TransformerModel::RedWongWangExc(p) => {
                Array2::from_shape_fn((2, n_proxies), |(var, _)| p.initial_state[var])
            }
            _ => Array2::zeros((0, n_proxies)),
        };
        self.apply_boundaries();
        self.n_proxies = Some(n_proxies);
        self.dt = Some(dt);
        debug!(model = self.name(), n_proxies, dt, "transformer configured");
        Ok(())
    }

    /// Clamp the gating state into its domain. Idempotent.
    pub fn apply_boundaries(&mut self) {
        if let TransformerModel::RedWongWangExc(_) = self.model {
            for node in 0..self.state.ncols() {
                let (s, r) = gating_bounds(self.state[[0, node]], self.state[[1, node]]);
                self.state[[0, node]] = s;
                self.state[[1, node]] = r;
            }
        }
    }

    /// Run the transformer over one window; the result lands in
    /// `output_buffer`.
    pub fn compute(&mut self, input: TransformerInput) -> Result<&Array3<f64>> {
        let (n, dt) = match (self.n_proxies, self.dt) {
            (Some(n), Some(dt)) => (n, dt),
            _ => return Err(TransformerError::NotConfigured(self.model.name())),
        };
        let rows = match &input {
            TransformerInput::Values(values) => values.nrows(),
            TransformerInput::SpikeTrains { trains, .. } => trains.len(),
        };
        if rows != n {
            return Err(TransformerError::ShapeMismatch(format!(
                "{} transformer configured for {} proxies, got {}",
                self.name(),
                n,
                rows
            )));
        }

        let output = match (self.model.clone(), input) {
            (TransformerModel::Linear(p), TransformerInput::Values(values)) => {
                self.input_buffer = values;
                let out = self.input_buffer.mapv(|x| p.scale_factor * x + p.translation_factor);
                single_variable(out)
            }
            (TransformerModel::Linear(_), TransformerInput::SpikeTrains { .. }) => {
                return Err(TransformerError::WrongInput {
                    model: self.name(),
                    expected: "values",
                })
            }
            (TransformerModel::SpikesHistogramRate(p), TransformerInput::SpikeTrains { trains, t_start, duration }) => {
                self.input_buffer =
                    histogram_rate(&trains, t_start, duration, p.bin_size, p.number_of_neurons);
                single_variable(&self.input_buffer * p.scale_factor)
            }
            (TransformerModel::SpikesKernelRate(p), TransformerInput::SpikeTrains { trains, t_start, duration }) => {
                self.input_buffer =
                    kernel_rate(&trains, t_start, duration, p.bin_size, p.sigma, p.number_of_neurons);
                single_variable(&self.input_buffer * p.scale_factor)
            }
            (TransformerModel::SpikesHistogramRate(_), TransformerInput::Values(_))
            | (TransformerModel::SpikesKernelRate(_), TransformerInput::Values(_)) => {
                return Err(TransformerError::WrongInput {
                    model: self.name(),
                    expected: "spike trains",
                })
            }
            (TransformerModel::RedWongWangExc(p), input) => {
                self.input_buffer = match input {
                    TransformerInput::Values(rates) => rates,
                    TransformerInput::SpikeTrains { trains, t_start, duration } => match p.rate {
                        RateSource::Histogram => {
                            histogram_rate(&trains, t_start, duration, dt, p.number_of_neurons)
                        }
                        RateSource::Kernel { sigma } => {
                            kernel_rate(&trains, t_start, duration, dt, sigma, p.number_of_neurons)
                        }
                    },
                };
                self.integrate_gating(&p, dt)
            }
        };
        self.output_buffer = output;
        Ok(&self.output_buffer)
    }

    /// Heun steps of size `h` over the gating dynamics, one per input column.
    /// Records `(time, variable, node)` internally and returns it transposed.
    fn integrate_gating(&mut self, p: &RedWongWangParams, h: Time) -> Array3<f64> {
        let (n_nodes, n_steps) = self.input_buffer.dim();
        let mut out = Array3::zeros((n_steps, 2, n_nodes));
        for k in 0..n_steps {
            for node in 0..n_nodes {
                let (s, r) = (self.state[[0, node]], self.state[[1, node]]);
                let r_in = self.input_buffer[[node, k]];
                let (ds1, dr1) = p.dfun(s, r, r_in);
                let (sp, rp) = gating_bounds(s + h * ds1, r + h * dr1);
                let (ds2, dr2) = p.dfun(sp, rp, r_in);
                self.state[[0, node]] = s + 0.5 * h * (ds1 + ds2);
                self.state[[1, node]] = r + 0.5 * h * (dr1 + dr2);
            }
            self.apply_boundaries();
            for node in 0..n_nodes {
                out[[k, 0, node]] = self.state[[0, node]];
                out[[k, 1, node]] = self.state[[1, node]];
            }
        }
        transpose(out)
    }

    /// `[node, variable]` at the last time point of the output buffer
    pub fn latest(&self) -> Option<Array2<f64>> {
        let (n_nodes, n_vars, n_times) = self.output_buffer.dim();
        if n_times == 0 {
            return None;
        }
        Some(Array2::from_shape_fn((n_nodes, n_vars), |(node, var)| {
            self.output_buffer[[node, var, n_times - 1]]
        }))
    }
}

/// `[node, time]` -> `[node, 1, time]`
fn single_variable(values: Array2<f64>) -> Array3<f64> {
    let (n_nodes, n_times) = values.dim();
    Array3::from_shape_fn((n_nodes, 1, n_times), |(node, _, t)| values[[node, t]])
}

/// `(time, variable, node)` -> `(node, variable, time)`
pub fn transpose(buffer: Array3<f64>) -> Array3<f64> {
    buffer.permuted_axes([2, 1, 0]).as_standard_layout().into_owned()
}
