//! # Spikenet: Spiking Backend Adapters
//!
//! Device and population plumbing on the spiking side of a co-simulation.
//!
//! Key pieces:
//! - A closed catalogue of stimulating and recording devices ([`DeviceModel`])
//! - The [`SpikingBackend`] trait every simulator adapter implements
//! - A reference in-process [`Kernel`] with memory and ASCII recording
//! - [`ProxyDevice`]: one created device, read and reset the same way
//!   regardless of where its events are stored
//! - [`SpikingNetwork`]: populations per brain region node
//!
//! Connection direction is normalised here: spike recorders are the *target*
//! of connections from neurons, every other device is the *source*.

use multiscale_core::{truncate_ascii_file_after_header, CoreError, RecordingMode, Time};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SpikeNetError {
    #[error("Unknown device model: {0}")]
    UnknownModel(String),
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("No live spiking backend bound")]
    NoBackend,
    #[error("Malformed recording {path}: {message}")]
    Recording { path: PathBuf, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("{model} device (global id {gid}): {source}")]
    Device {
        model: String,
        gid: NodeId,
        source: Box<SpikeNetError>,
    },
}

pub type Result<T> = std::result::Result<T, SpikeNetError>;

// ============================================================================
// NODE IDS
// ============================================================================

/// Global node identifier
pub type NodeId = usize;

/// Collection of node IDs (like NEST's NodeCollection)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCollection {
    pub ids: Vec<NodeId>,
}

impl NodeCollection {
    pub fn new(ids: Vec<NodeId>) -> Self {
        Self { ids }
    }

    pub fn single(id: NodeId) -> Self {
        Self { ids: vec![id] }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn first(&self) -> Option<NodeId> {
        self.ids.first().copied()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.ids.contains(&id)
    }
}

impl IntoIterator for NodeCollection {
    type Item = NodeId;
    type IntoIter = std::vec::IntoIter<NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.into_iter()
    }
}

// ============================================================================
// STATUS VALUES
// ============================================================================

/// A device or neuron attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Numbers(Vec<f64>),
    Text(String),
    Texts(Vec<String>),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_numbers(&self) -> Option<&[f64]> {
        match self {
            Value::Numbers(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_texts(&self) -> Option<&[String]> {
        match self {
            Value::Texts(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Numbers(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::Texts(v)
    }
}

/// Attribute dictionary passed to `set` / returned by `get`
pub type Status = BTreeMap<String, Value>;

// ============================================================================
// NEURON MODELS
// ============================================================================

/// Neuron models a proxy population can be built from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum NeuronModel {
    /// Integrate-and-fire with alpha-function PSCs
    IafPscAlpha(IafParams),

    /// Conductance-based IAF
    IafCondAlpha(IafParams),

    /// Parrot neuron (repeats input spikes)
    ParrotNeuron,
}

/// Membrane parameters shared by the IAF variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IafParams {
    pub c_m: f64,     // Membrane capacitance (pF)
    pub e_l: f64,     // Resting potential (mV)
    pub v_reset: f64, // Reset potential (mV)
    pub v_th: f64,    // Spike threshold (mV)
    pub i_e: f64,     // External DC current (pA)
}

impl Default for IafParams {
    fn default() -> Self {
        Self {
            c_m: 250.0,
            e_l: -70.0,
            v_reset: -70.0,
            v_th: -55.0,
            i_e: 0.0,
        }
    }
}

impl NeuronModel {
    pub fn name(&self) -> &'static str {
        match self {
            NeuronModel::IafPscAlpha(_) => "iaf_psc_alpha",
            NeuronModel::IafCondAlpha(_) => "iaf_cond_alpha",
            NeuronModel::ParrotNeuron => "parrot_neuron",
        }
    }

    fn initial_status(&self) -> Status {
        let mut status = Status::new();
        match self {
            NeuronModel::IafPscAlpha(p) | NeuronModel::IafCondAlpha(p) => {
                status.insert("V_m".into(), p.e_l.into());
                status.insert("I_e".into(), p.i_e.into());
                status.insert("V_th".into(), p.v_th.into());
            }
            NeuronModel::ParrotNeuron => {
                status.insert("V_m".into(), 0.0.into());
            }
        }
        status.insert("spikes".into(), 0.0.into());
        status
    }
}

// ============================================================================
// DEVICE MODELS
// ============================================================================

/// How a stimulating device drives its target neurons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveKind {
    /// Mean-field current applied uniformly to every target neuron
    Current,
    /// Mean-field spike rate, the same for every target neuron
    Rate,
    /// Explicit spike times
    SpikeTimes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceRole {
    Stimulating(DriveKind),
    Recording,
}

/// Device kinds, used only where models arrive as strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    PoissonGenerator,
    InhomogeneousPoissonGenerator,
    SinusoidalPoissonGenerator,
    StepRateGenerator,
    MipGenerator,
    DcGenerator,
    StepCurrentGenerator,
    AcGenerator,
    NoiseGenerator,
    SpikeGenerator,
    SpikeRecorder,
    Multimeter,
    Voltmeter,
    SpikeMultimeter,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 14] = [
        DeviceKind::PoissonGenerator,
        DeviceKind::InhomogeneousPoissonGenerator,
        DeviceKind::SinusoidalPoissonGenerator,
        DeviceKind::StepRateGenerator,
        DeviceKind::MipGenerator,
        DeviceKind::DcGenerator,
        DeviceKind::StepCurrentGenerator,
        DeviceKind::AcGenerator,
        DeviceKind::NoiseGenerator,
        DeviceKind::SpikeGenerator,
        DeviceKind::SpikeRecorder,
        DeviceKind::Multimeter,
        DeviceKind::Voltmeter,
        DeviceKind::SpikeMultimeter,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::PoissonGenerator => "poisson_generator",
            DeviceKind::InhomogeneousPoissonGenerator => "inhomogeneous_poisson_generator",
            DeviceKind::SinusoidalPoissonGenerator => "sinusoidal_poisson_generator",
            DeviceKind::StepRateGenerator => "step_rate_generator",
            DeviceKind::MipGenerator => "mip_generator",
            DeviceKind::DcGenerator => "dc_generator",
            DeviceKind::StepCurrentGenerator => "step_current_generator",
            DeviceKind::AcGenerator => "ac_generator",
            DeviceKind::NoiseGenerator => "noise_generator",
            DeviceKind::SpikeGenerator => "spike_generator",
            DeviceKind::SpikeRecorder => "spike_recorder",
            DeviceKind::Multimeter => "multimeter",
            DeviceKind::Voltmeter => "voltmeter",
            DeviceKind::SpikeMultimeter => "spike_multimeter",
        }
    }

    pub fn role(&self) -> DeviceRole {
        use DeviceKind::*;
        match self {
            PoissonGenerator | InhomogeneousPoissonGenerator | SinusoidalPoissonGenerator
            | StepRateGenerator | MipGenerator => DeviceRole::Stimulating(DriveKind::Rate),
            DcGenerator | StepCurrentGenerator | AcGenerator | NoiseGenerator => {
                DeviceRole::Stimulating(DriveKind::Current)
            }
            SpikeGenerator => DeviceRole::Stimulating(DriveKind::SpikeTimes),
            SpikeRecorder | Multimeter | Voltmeter | SpikeMultimeter => DeviceRole::Recording,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.role() == DeviceRole::Recording
    }

    /// Model with default parameters; recorders store events per `record_to`.
    pub fn default_model(&self, record_to: RecordingMode) -> DeviceModel {
        let recorder = RecorderParams { record_to };
        match self {
            DeviceKind::PoissonGenerator => DeviceModel::PoissonGenerator(Default::default()),
            DeviceKind::InhomogeneousPoissonGenerator => {
                DeviceModel::InhomogeneousPoissonGenerator(Default::default())
            }
            DeviceKind::SinusoidalPoissonGenerator => {
                DeviceModel::SinusoidalPoissonGenerator(Default::default())
            }
            DeviceKind::StepRateGenerator => DeviceModel::StepRateGenerator(Default::default()),
            DeviceKind::MipGenerator => DeviceModel::MipGenerator(Default::default()),
            DeviceKind::DcGenerator => DeviceModel::DcGenerator(Default::default()),
            DeviceKind::StepCurrentGenerator => DeviceModel::StepCurrentGenerator(Default::default()),
            DeviceKind::AcGenerator => DeviceModel::AcGenerator(Default::default()),
            DeviceKind::NoiseGenerator => DeviceModel::NoiseGenerator(Default::default()),
            DeviceKind::SpikeGenerator => DeviceModel::SpikeGenerator(Default::default()),
            DeviceKind::SpikeRecorder => DeviceModel::SpikeRecorder(recorder),
            DeviceKind::Multimeter => DeviceModel::Multimeter(MultimeterParams {
                record_to,
                ..Default::default()
            }),
            DeviceKind::Voltmeter => DeviceModel::Voltmeter(recorder),
            DeviceKind::SpikeMultimeter => DeviceModel::SpikeMultimeter(MultimeterParams {
                record_from: vec!["spikes".into()],
                record_to,
                ..Default::default()
            }),
        }
    }

    /// Status that imposes a mean-field `value` at `time` on a stimulating device.
    ///
    /// Rates are clipped at zero. Spike-time generators and recorders cannot
    /// be driven by a scalar and return `None`.
    pub fn drive_status(&self, value: f64, time: Time) -> Option<Status> {
        let rate = value.max(0.0);
        let pair = |times: &str, values: &str, v: f64| {
            Status::from([
                (times.to_string(), Value::Numbers(vec![time])),
                (values.to_string(), Value::Numbers(vec![v])),
            ])
        };
        match self {
            DeviceKind::PoissonGenerator | DeviceKind::MipGenerator | DeviceKind::SinusoidalPoissonGenerator => {
                Some(Status::from([("rate".to_string(), Value::Number(rate))]))
            }
            DeviceKind::InhomogeneousPoissonGenerator | DeviceKind::StepRateGenerator => {
                Some(pair("rate_times", "rate_values", rate))
            }
            DeviceKind::DcGenerator => Some(Status::from([("amplitude".to_string(), Value::Number(value))])),
            DeviceKind::StepCurrentGenerator => Some(pair("amplitude_times", "amplitude_values", value)),
            DeviceKind::AcGenerator => Some(Status::from([("offset".to_string(), Value::Number(value))])),
            DeviceKind::NoiseGenerator => Some(Status::from([("mean".to_string(), Value::Number(value))])),
            DeviceKind::SpikeGenerator
            | DeviceKind::SpikeRecorder
            | DeviceKind::Multimeter
            | DeviceKind::Voltmeter
            | DeviceKind::SpikeMultimeter => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceKind {
    type Err = SpikeNetError;

    fn from_str(s: &str) -> Result<Self> {
        DeviceKind::ALL
            .iter()
            .find(|k| k.name() == s)
            .copied()
            .ok_or_else(|| SpikeNetError::UnknownModel(s.to_string()))
    }
}

/// Device models with their creation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum DeviceModel {
    PoissonGenerator(RateGeneratorParams),
    InhomogeneousPoissonGenerator(RateGeneratorParams),
    SinusoidalPoissonGenerator(SinusoidalParams),
    StepRateGenerator(RateGeneratorParams),
    MipGenerator(MipGeneratorParams),
    DcGenerator(CurrentGeneratorParams),
    StepCurrentGenerator(CurrentGeneratorParams),
    AcGenerator(AcGeneratorParams),
    NoiseGenerator(NoiseGeneratorParams),
    SpikeGenerator(SpikeGeneratorParams),
    SpikeRecorder(RecorderParams),
    Multimeter(MultimeterParams),
    Voltmeter(RecorderParams),
    SpikeMultimeter(MultimeterParams),
}

/// Poisson-like rate generator parameters
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateGeneratorParams {
    pub rate: f64, // Firing rate (Hz)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinusoidalParams {
    pub rate: f64,      // Mean rate (Hz)
    pub amplitude: f64, // Rate modulation (Hz)
    pub frequency: f64, // Hz
    pub phase: f64,     // degrees
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MipGeneratorParams {
    pub rate: f64,
    pub p_copy: f64,
    pub mother_seed: u64,
}

impl Default for MipGeneratorParams {
    fn default() -> Self {
        Self {
            rate: 0.0,
            p_copy: 0.5,
            mother_seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentGeneratorParams {
    pub amplitude: f64, // Current amplitude (pA)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AcGeneratorParams {
    pub amplitude: f64,
    pub offset: f64,
    pub frequency: f64,
    pub phase: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseGeneratorParams {
    pub mean: f64, // Mean current (pA)
    pub std: f64,  // Standard deviation (pA)
    pub dt: f64,   // Update interval (ms)
}

impl Default for NoiseGeneratorParams {
    fn default() -> Self {
        Self {
            mean: 0.0,
            std: 0.0,
            dt: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeGeneratorParams {
    pub spike_times: Vec<f64>, // Spike times (ms)
    pub spike_weights: Vec<f64>,
    pub allow_offgrid_times: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderParams {
    pub record_to: RecordingMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultimeterParams {
    pub record_from: Vec<String>, // Variables to record
    pub interval: f64,            // Recording interval (ms)
    pub record_to: RecordingMode,
}

impl Default for MultimeterParams {
    fn default() -> Self {
        Self {
            record_from: vec!["V_m".into()],
            interval: 0.1,
            record_to: RecordingMode::Memory,
        }
    }
}

impl DeviceModel {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceModel::PoissonGenerator(_) => DeviceKind::PoissonGenerator,
            DeviceModel::InhomogeneousPoissonGenerator(_) => DeviceKind::InhomogeneousPoissonGenerator,
            DeviceModel::SinusoidalPoissonGenerator(_) => DeviceKind::SinusoidalPoissonGenerator,
            DeviceModel::StepRateGenerator(_) => DeviceKind::StepRateGenerator,
            DeviceModel::MipGenerator(_) => DeviceKind::MipGenerator,
            DeviceModel::DcGenerator(_) => DeviceKind::DcGenerator,
            DeviceModel::StepCurrentGenerator(_) => DeviceKind::StepCurrentGenerator,
            DeviceModel::AcGenerator(_) => DeviceKind::AcGenerator,
            DeviceModel::NoiseGenerator(_) => DeviceKind::NoiseGenerator,
            DeviceModel::SpikeGenerator(_) => DeviceKind::SpikeGenerator,
            DeviceModel::SpikeRecorder(_) => DeviceKind::SpikeRecorder,
            DeviceModel::Multimeter(_) => DeviceKind::Multimeter,
            DeviceModel::Voltmeter(_) => DeviceKind::Voltmeter,
            DeviceModel::SpikeMultimeter(_) => DeviceKind::SpikeMultimeter,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn role(&self) -> DeviceRole {
        self.kind().role()
    }

    /// Storage of a recorder's events; `None` for stimulating devices
    pub fn record_to(&self) -> Option<RecordingMode> {
        match self {
            DeviceModel::SpikeRecorder(p) | DeviceModel::Voltmeter(p) => Some(p.record_to),
            DeviceModel::Multimeter(p) | DeviceModel::SpikeMultimeter(p) => Some(p.record_to),
            _ => None,
        }
    }

    /// Continuous variables sampled by the device
    pub fn record_from(&self) -> Vec<String> {
        match self {
            DeviceModel::Multimeter(p) | DeviceModel::SpikeMultimeter(p) => p.record_from.clone(),
            DeviceModel::Voltmeter(_) => vec!["V_m".into()],
            _ => vec![],
        }
    }

    fn initial_status(&self) -> Status {
        let mut status = Status::new();
        status.insert("model".into(), self.name().into());
        match self {
            DeviceModel::PoissonGenerator(p) | DeviceModel::StepRateGenerator(p) => {
                status.insert("rate".into(), p.rate.into());
            }
            DeviceModel::InhomogeneousPoissonGenerator(p) => {
                status.insert("rate".into(), p.rate.into());
                status.insert("rate_times".into(), Value::Numbers(vec![]));
                status.insert("rate_values".into(), Value::Numbers(vec![]));
            }
            DeviceModel::SinusoidalPoissonGenerator(p) => {
                status.insert("rate".into(), p.rate.into());
                status.insert("amplitude".into(), p.amplitude.into());
                status.insert("frequency".into(), p.frequency.into());
                status.insert("phase".into(), p.phase.into());
            }
            DeviceModel::MipGenerator(p) => {
                status.insert("rate".into(), p.rate.into());
                status.insert("p_copy".into(), p.p_copy.into());
            }
            DeviceModel::DcGenerator(p) => {
                status.insert("amplitude".into(), p.amplitude.into());
            }
            DeviceModel::StepCurrentGenerator(p) => {
                status.insert("amplitude".into(), p.amplitude.into());
                status.insert("amplitude_times".into(), Value::Numbers(vec![]));
                status.insert("amplitude_values".into(), Value::Numbers(vec![]));
            }
            DeviceModel::AcGenerator(p) => {
                status.insert("amplitude".into(), p.amplitude.into());
                status.insert("offset".into(), p.offset.into());
                status.insert("frequency".into(), p.frequency.into());
                status.insert("phase".into(), p.phase.into());
            }
            DeviceModel::NoiseGenerator(p) => {
                status.insert("mean".into(), p.mean.into());
                status.insert("std".into(), p.std.into());
                status.insert("dt".into(), p.dt.into());
            }
            DeviceModel::SpikeGenerator(p) => {
                status.insert("spike_times".into(), p.spike_times.clone().into());
                status.insert("spike_weights".into(), p.spike_weights.clone().into());
            }
            DeviceModel::SpikeRecorder(_) | DeviceModel::Voltmeter(_) => {}
            DeviceModel::Multimeter(p) | DeviceModel::SpikeMultimeter(p) => {
                status.insert("interval".into(), p.interval.into());
            }
        }
        if let Some(record_to) = self.record_to() {
            let mode = match record_to {
                RecordingMode::Memory => "memory",
                RecordingMode::Ascii => "ascii",
            };
            status.insert("record_to".into(), mode.into());
            status.insert("record_from".into(), self.record_from().into());
            status.insert("n_events".into(), 0.0.into());
        }
        status
    }
}

// ============================================================================
// CONNECTION SPECIFICATION
// ============================================================================

/// Connection rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityRule {
    /// All-to-all connection
    AllToAll,

    /// One-to-one mapping (same indices)
    OneToOne,
}

/// Where a connection lands on the target: a numbered receptor port or a
/// named synaptic target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynapticTarget {
    Receptor(usize),
    Target(String),
}

impl Default for SynapticTarget {
    fn default() -> Self {
        SynapticTarget::Receptor(0)
    }
}

/// Connection specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSpec {
    pub rule: ConnectivityRule,
    pub weight: f64,
    pub delay: f64,
    pub synapse_model: String,
    pub receptor: SynapticTarget,
    pub params: Status,
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self {
            rule: ConnectivityRule::AllToAll,
            weight: 1.0,
            delay: 1.0,
            synapse_model: "static_synapse".into(),
            receptor: SynapticTarget::default(),
            params: Status::new(),
        }
    }
}

/// Connection (edge)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub source: NodeId,
    pub target: NodeId,
    pub weight: f64,
    pub delay: f64,
    pub synapse_model: String,
    pub receptor: SynapticTarget,
}

// ============================================================================
// RECORDING
// ============================================================================

/// Events recorded by a device: spike (`times`, `senders`) plus any sampled
/// variables, all aligned by event index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Events {
    pub times: Vec<f64>,
    pub senders: Vec<NodeId>,
    pub values: BTreeMap<String, Vec<f64>>,
}

impl Events {
    /// Empty events with one column per recorded variable
    pub fn with_variables(record_from: &[String]) -> Self {
        Self {
            times: vec![],
            senders: vec![],
            values: record_from.iter().map(|v| (v.clone(), vec![])).collect(),
        }
    }

    pub fn record(&mut self, time: f64, sender: NodeId) {
        self.times.push(time);
        self.senders.push(sender);
    }

    pub fn record_sample(&mut self, time: f64, sender: NodeId, sample: &[(String, f64)]) {
        self.record(time, sender);
        for (name, v) in sample {
            self.values.entry(name.clone()).or_default().push(*v);
        }
    }

    pub fn n_events(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.senders.clear();
        for column in self.values.values_mut() {
            column.clear();
        }
    }

    pub fn extend(&mut self, other: Events) {
        self.times.extend(other.times);
        self.senders.extend(other.senders);
        for (name, column) in other.values {
            self.values.entry(name).or_default().extend(column);
        }
    }

    /// Get spike trains organized by sender
    pub fn spike_trains(&self) -> HashMap<NodeId, Vec<f64>> {
        let mut trains: HashMap<NodeId, Vec<f64>> = HashMap::new();
        for (&time, &sender) in self.times.iter().zip(self.senders.iter()) {
            trains.entry(sender).or_default().push(time);
        }
        trains
    }

    /// Keep events with `start <= time < stop`, minus those inside `exclude`
    /// (inclusive bounds). Either bound may be open.
    pub fn filter(
        &self,
        start: Option<f64>,
        stop: Option<f64>,
        exclude: Option<(f64, f64)>,
    ) -> Events {
        let keep: Vec<usize> = (0..self.n_events())
            .filter(|&i| {
                let t = self.times[i];
                start.map_or(true, |s| t >= s)
                    && stop.map_or(true, |s| t < s)
                    && exclude.map_or(true, |(a, b)| t < a || t > b)
            })
            .collect();
        Events {
            times: keep.iter().map(|&i| self.times[i]).collect(),
            senders: keep.iter().map(|&i| self.senders[i]).collect(),
            values: self
                .values
                .iter()
                .map(|(name, column)| {
                    let picked = keep.iter().filter_map(|&i| column.get(i).copied()).collect();
                    (name.clone(), picked)
                })
                .collect(),
        }
    }

    /// Mean of `variable` over the samples taken at the latest time
    pub fn latest_mean(&self, variable: &str) -> Option<f64> {
        let column = self.values.get(variable)?;
        let latest = self.times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let picked: Vec<f64> = self
            .times
            .iter()
            .zip(column.iter())
            .filter(|(t, _)| **t == latest)
            .map(|(_, v)| *v)
            .collect();
        if picked.is_empty() {
            None
        } else {
            Some(picked.iter().sum::<f64>() / picked.len() as f64)
        }
    }

    /// Sum of `variable` over all samples
    pub fn total(&self, variable: &str) -> f64 {
        self.values.get(variable).map_or(0.0, |c| c.iter().sum())
    }
}

/// File name used by file-backed recorders
pub fn recording_file_name(label: &str, gid: NodeId) -> String {
    format!("{}-{}.dat", label, gid)
}

/// Read an ASCII recording into events.
///
/// The last `#` header line carries the tab-separated column names;
/// `sender` and `time_ms` map onto `senders` and `times`.
pub fn read_ascii_events(path: &Path) -> Result<Events> {
    let malformed = |message: String| SpikeNetError::Recording {
        path: path.to_path_buf(),
        message,
    };
    let content = fs::read_to_string(path)?;
    let mut columns: Vec<String> = vec![];
    let mut events = Events::default();
    for line in content.lines() {
        if let Some(header) = line.strip_prefix('#') {
            columns = header.split_whitespace().map(str::to_string).collect();
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        if columns.is_empty() {
            return Err(malformed("data row before column header".into()));
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != columns.len() {
            return Err(malformed(format!(
                "expected {} columns, found {} in {:?}",
                columns.len(),
                fields.len(),
                line
            )));
        }
        for (name, field) in columns.iter().zip(fields) {
            let value: f64 = field
                .parse()
                .map_err(|_| malformed(format!("{:?} is not a number", field)))?;
            match name.as_str() {
                "sender" => events.senders.push(value as NodeId),
                "time_ms" => events.times.push(value),
                other => events.values.entry(other.to_string()).or_default().push(value),
            }
        }
    }
    for name in columns.iter().filter(|c| *c != "sender" && *c != "time_ms") {
        events.values.entry(name.clone()).or_default();
    }
    Ok(events)
}

// ============================================================================
// BACKEND CONTRACT
// ============================================================================

/// Operations the interfaces need from a spiking simulator.
///
/// Recording devices in memory mode expose their events through
/// `get_events`; file-backed ones write under `data_path` and are read by
/// [`ProxyDevice`].
pub trait SpikingBackend {
    fn name(&self) -> &str;

    /// False once the backend was shut down
    fn is_live(&self) -> bool;

    /// Kernel time step (ms)
    fn resolution(&self) -> Time;

    fn min_delay(&self) -> Time;

    fn time(&self) -> Time;

    fn data_path(&self) -> Option<&Path>;

    fn create_neurons(&mut self, model: &NeuronModel, n: usize) -> Result<NodeCollection>;

    fn create_device(&mut self, model: &DeviceModel, label: &str) -> Result<NodeId>;

    fn connect(
        &mut self,
        sources: &NodeCollection,
        targets: &NodeCollection,
        spec: &ConnectionSpec,
    ) -> Result<()>;

    /// Connections filtered by source and/or target
    fn get_connections(
        &self,
        source: Option<&NodeCollection>,
        target: Option<&NodeCollection>,
    ) -> Result<Vec<Connection>>;

    fn set(&mut self, nodes: &NodeCollection, values: &Status) -> Result<()>;

    /// One status per node; empty `attrs` returns every attribute
    fn get(&self, nodes: &NodeCollection, attrs: &[&str]) -> Result<Vec<Status>>;

    fn get_events(&self, device: NodeId) -> Result<Events>;

    /// Drop in-memory events of a recorder
    fn clear_events(&mut self, device: NodeId) -> Result<()>;

    fn simulate(&mut self, time: Time) -> Result<()>;

    fn shutdown(&mut self);
}

// ============================================================================
// KERNEL (REFERENCE BACKEND)
// ============================================================================

/// Kernel parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelParams {
    pub resolution: f64,            // Time step (ms)
    pub min_delay: f64,             // Minimum synaptic delay (ms)
    pub max_delay: f64,             // Maximum synaptic delay (ms)
    pub data_path: Option<PathBuf>, // Directory of file-backed recorders
    pub overwrite_files: bool,
}

impl Default for KernelParams {
    fn default() -> Self {
        Self {
            resolution: 0.1,
            min_delay: 0.1,
            max_delay: 100.0,
            data_path: None,
            overwrite_files: true,
        }
    }
}

#[derive(Debug, Clone)]
struct NeuronState {
    model: String,
    status: Status,
}

#[derive(Debug, Clone)]
struct DeviceState {
    model: DeviceModel,
    status: Status,
    events: Events,
    file: Option<PathBuf>,
}

/// In-process spiking kernel.
///
/// Holds populations, devices and connections and records what happens to
/// them; it does not integrate neuron dynamics. Spikes enter through
/// [`Kernel::inject_spikes`], recorders pick them up along their connections.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub params: KernelParams,
    time: f64,
    live: bool,
    next_node_id: NodeId,
    neurons: HashMap<NodeId, NeuronState>,
    devices: HashMap<NodeId, DeviceState>,
    connections: Vec<Connection>,
}

impl Kernel {
    /// Bring up a kernel; creates `data_path` when given.
    pub fn init(params: KernelParams) -> Result<Self> {
        if params.resolution <= 0.0 {
            return Err(SpikeNetError::InvalidParameter(format!(
                "resolution must be positive, got {}",
                params.resolution
            )));
        }
        if let Some(dir) = &params.data_path {
            fs::create_dir_all(dir)?;
        }
        info!(resolution = params.resolution, data_path = ?params.data_path, "spiking kernel initialised");
        Ok(Self {
            params,
            time: 0.0,
            live: true,
            next_node_id: 1, // NEST node IDs start at 1
            neurons: HashMap::new(),
            devices: HashMap::new(),
            connections: vec![],
        })
    }

    /// Reset the kernel
    pub fn reset(&mut self) {
        self.time = 0.0;
        self.neurons.clear();
        self.devices.clear();
        self.connections.clear();
        self.next_node_id = 1;
    }

    fn ensure_live(&self) -> Result<()> {
        if self.live {
            Ok(())
        } else {
            Err(SpikeNetError::NoBackend)
        }
    }

    fn next_id(&mut self) -> NodeId {
        let id = self.next_node_id;
        self.next_node_id += 1;
        id
    }

    /// Neurons `senders[i]` fire at `times[i]`; every spike recorder
    /// connected from a sender records the spike.
    pub fn inject_spikes(&mut self, senders: &[NodeId], times: &[f64]) -> Result<()> {
        self.ensure_live()?;
        if senders.len() != times.len() {
            return Err(SpikeNetError::InvalidParameter(format!(
                "{} senders but {} spike times",
                senders.len(),
                times.len()
            )));
        }
        for (&sender, &time) in senders.iter().zip(times) {
            let neuron = self
                .neurons
                .get_mut(&sender)
                .ok_or(SpikeNetError::NodeNotFound(sender))?;
            let count = neuron.status.get("spikes").and_then(Value::as_number).unwrap_or(0.0);
            neuron.status.insert("spikes".into(), (count + 1.0).into());

            let recorders: Vec<NodeId> = self
                .connections
                .iter()
                .filter(|c| c.source == sender)
                .map(|c| c.target)
                .filter(|t| {
                    self.devices
                        .get(t)
                        .map_or(false, |d| d.model.kind() == DeviceKind::SpikeRecorder)
                })
                .collect();
            for gid in recorders {
                self.record(gid, time, sender, &[])?;
            }
        }
        Ok(())
    }

    fn record(&mut self, gid: NodeId, time: f64, sender: NodeId, sample: &[(String, f64)]) -> Result<()> {
        let device = self.devices.get_mut(&gid).ok_or(SpikeNetError::NodeNotFound(gid))?;
        match &device.file {
            Some(path) => {
                let mut line = format!("{}\t{}", sender, time);
                for (_, v) in sample {
                    line.push_str(&format!("\t{}", v));
                }
                let mut file = OpenOptions::new().append(true).open(path)?;
                writeln!(file, "{}", line)?;
            }
            None => device.events.record_sample(time, sender, sample),
        }
        let n = device.status.get("n_events").and_then(Value::as_number).unwrap_or(0.0);
        device.status.insert("n_events".into(), (n + 1.0).into());
        Ok(())
    }

    /// Multimeter-like devices sample their connected neurons.
    fn sample_meters(&mut self) -> Result<()> {
        let time = self.time;
        let resolution = self.params.resolution;
        let mut samples: Vec<(NodeId, NodeId, Vec<(String, f64)>)> = vec![];
        let mut sampled_neurons: Vec<NodeId> = vec![];
        for (&gid, device) in &self.devices {
            let record_from = device.model.record_from();
            if record_from.is_empty() {
                continue;
            }
            let interval = device.status.get("interval").and_then(Value::as_number).unwrap_or(resolution);
            if interval > resolution {
                let k = (time / interval).round();
                if (k * interval - time).abs() > resolution / 2.0 {
                    continue;
                }
            }
            for conn in self.connections.iter().filter(|c| c.source == gid) {
                if let Some(neuron) = self.neurons.get(&conn.target) {
                    let sample = record_from
                        .iter()
                        .map(|var| {
                            let v = neuron.status.get(var).and_then(Value::as_number).unwrap_or(f64::NAN);
                            (var.clone(), v)
                        })
                        .collect();
                    samples.push((gid, conn.target, sample));
                    sampled_neurons.push(conn.target);
                }
            }
        }
        for (gid, neuron, sample) in samples {
            self.record(gid, time, neuron, &sample)?;
        }
        // spike counts are per sampling interval
        for id in sampled_neurons {
            if let Some(neuron) = self.neurons.get_mut(&id) {
                neuron.status.insert("spikes".into(), 0.0.into());
            }
        }
        Ok(())
    }

    fn validate_device_status(model: &DeviceModel, values: &Status) -> Result<()> {
        for (key, value) in values {
            let negative = match value {
                Value::Number(v) => *v < 0.0,
                Value::Numbers(vs) => vs.iter().any(|v| *v < 0.0),
                _ => false,
            };
            if (key == "rate" || key == "rate_values") && negative {
                return Err(SpikeNetError::InvalidParameter(format!(
                    "{} of {} must be non-negative",
                    key,
                    model.name()
                )));
            }
            if matches!(key.as_str(), "model" | "record_to" | "record_from" | "n_events") {
                return Err(SpikeNetError::InvalidParameter(format!(
                    "{} of {} is read-only",
                    key,
                    model.name()
                )));
            }
        }
        Ok(())
    }
}

impl SpikingBackend for Kernel {
    fn name(&self) -> &str {
        "kernel"
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn resolution(&self) -> Time {
        self.params.resolution
    }

    fn min_delay(&self) -> Time {
        self.params.min_delay
    }

    fn time(&self) -> Time {
        self.time
    }

    fn data_path(&self) -> Option<&Path> {
        self.params.data_path.as_deref()
    }

    /// Create neurons
    fn create_neurons(&mut self, model: &NeuronModel, n: usize) -> Result<NodeCollection> {
        self.ensure_live()?;
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let id = self.next_id();
            self.neurons.insert(
                id,
                NeuronState {
                    model: model.name().to_string(),
                    status: model.initial_status(),
                },
            );
            ids.push(id);
        }
        Ok(NodeCollection::new(ids))
    }

    fn create_device(&mut self, model: &DeviceModel, label: &str) -> Result<NodeId> {
        self.ensure_live()?;
        let id = self.next_id();
        let file = match model.record_to() {
            Some(RecordingMode::Ascii) => {
                let dir = self.params.data_path.clone().ok_or_else(|| {
                    SpikeNetError::InvalidParameter(format!(
                        "{} records to ascii but the kernel has no data_path",
                        model.name()
                    ))
                })?;
                let path = dir.join(recording_file_name(label, id));
                if path.exists() && !self.params.overwrite_files {
                    return Err(SpikeNetError::InvalidParameter(format!(
                        "{} exists and overwrite_files is off",
                        path.display()
                    )));
                }
                let mut columns = vec!["sender".to_string(), "time_ms".to_string()];
                columns.extend(model.record_from());
                let header = format!(
                    "# multiscale kernel recording backend: ascii\n# device: {} {}\n# {}\n",
                    model.name(),
                    label,
                    columns.join("\t")
                );
                fs::write(&path, header)?;
                Some(path)
            }
            _ => None,
        };
        let mut status = model.initial_status();
        status.insert("label".into(), label.into());
        status.insert("global_id".into(), (id as f64).into());
        self.devices.insert(
            id,
            DeviceState {
                model: model.clone(),
                status,
                events: Events::with_variables(&model.record_from()),
                file,
            },
        );
        debug!(gid = id, model = model.name(), label, "device created");
        Ok(id)
    }

    /// Connect nodes
    fn connect(
        &mut self,
        sources: &NodeCollection,
        targets: &NodeCollection,
        spec: &ConnectionSpec,
    ) -> Result<()> {
        self.ensure_live()?;
        if spec.delay < self.params.min_delay || spec.delay > self.params.max_delay {
            return Err(SpikeNetError::ConnectionError(format!(
                "delay {} outside [{}, {}]",
                spec.delay, self.params.min_delay, self.params.max_delay
            )));
        }
        for id in sources.ids.iter().chain(targets.ids.iter()) {
            if !self.neurons.contains_key(id) && !self.devices.contains_key(id) {
                return Err(SpikeNetError::NodeNotFound(*id));
            }
        }
        let edge = |source: NodeId, target: NodeId| Connection {
            source,
            target,
            weight: spec.weight,
            delay: spec.delay,
            synapse_model: spec.synapse_model.clone(),
            receptor: spec.receptor.clone(),
        };
        match spec.rule {
            ConnectivityRule::AllToAll => {
                for &src in &sources.ids {
                    for &tgt in &targets.ids {
                        self.connections.push(edge(src, tgt));
                    }
                }
            }
            ConnectivityRule::OneToOne => {
                if sources.len() != targets.len() {
                    return Err(SpikeNetError::ConnectionError(
                        "OneToOne requires equal population sizes".into(),
                    ));
                }
                for (&src, &tgt) in sources.ids.iter().zip(targets.ids.iter()) {
                    self.connections.push(edge(src, tgt));
                }
            }
        }
        Ok(())
    }

    fn get_connections(
        &self,
        source: Option<&NodeCollection>,
        target: Option<&NodeCollection>,
    ) -> Result<Vec<Connection>> {
        self.ensure_live()?;
        Ok(self
            .connections
            .iter()
            .filter(|c| source.map_or(true, |s| s.contains(c.source)))
            .filter(|c| target.map_or(true, |t| t.contains(c.target)))
            .cloned()
            .collect())
    }

    /// Set node status
    fn set(&mut self, nodes: &NodeCollection, values: &Status) -> Result<()> {
        self.ensure_live()?;
        for &id in &nodes.ids {
            if let Some(device) = self.devices.get_mut(&id) {
                Self::validate_device_status(&device.model, values)?;
                for (key, value) in values {
                    device.status.insert(key.clone(), value.clone());
                }
            } else if let Some(neuron) = self.neurons.get_mut(&id) {
                for (key, value) in values {
                    neuron.status.insert(key.clone(), value.clone());
                }
            } else {
                return Err(SpikeNetError::NodeNotFound(id));
            }
        }
        Ok(())
    }

    /// Get node status
    fn get(&self, nodes: &NodeCollection, attrs: &[&str]) -> Result<Vec<Status>> {
        self.ensure_live()?;
        let mut results = vec![];
        for &id in &nodes.ids {
            let status = if let Some(device) = self.devices.get(&id) {
                &device.status
            } else if let Some(neuron) = self.neurons.get(&id) {
                &neuron.status
            } else {
                return Err(SpikeNetError::NodeNotFound(id));
            };
            let mut out: Status = if attrs.is_empty() {
                status.clone()
            } else {
                let mut picked = Status::new();
                for attr in attrs {
                    let value = status.get(*attr).ok_or_else(|| {
                        SpikeNetError::InvalidParameter(format!("node {} has no attribute {}", id, attr))
                    })?;
                    picked.insert(attr.to_string(), value.clone());
                }
                picked
            };
            if attrs.is_empty() {
                if let Some(neuron) = self.neurons.get(&id) {
                    out.insert("model".into(), neuron.model.as_str().into());
                }
            }
            results.push(out);
        }
        Ok(results)
    }

    fn get_events(&self, device: NodeId) -> Result<Events> {
        self.ensure_live()?;
        let state = self.devices.get(&device).ok_or(SpikeNetError::NodeNotFound(device))?;
        if !state.model.kind().is_recording() {
            return Err(SpikeNetError::InvalidParameter(format!(
                "{} does not record events",
                state.model.name()
            )));
        }
        Ok(state.events.clone())
    }

    fn clear_events(&mut self, device: NodeId) -> Result<()> {
        self.ensure_live()?;
        let state = self.devices.get_mut(&device).ok_or(SpikeNetError::NodeNotFound(device))?;
        state.events.clear();
        state.status.insert("n_events".into(), 0.0.into());
        Ok(())
    }

    /// Run simulation
    fn simulate(&mut self, time: Time) -> Result<()> {
        self.ensure_live()?;
        let dt = self.params.resolution;
        let n_steps = (time / dt).round() as usize;
        for _ in 0..n_steps {
            self.time += dt;
            self.sample_meters()?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.live {
            info!(time = self.time, "spiking kernel shut down");
        }
        self.live = false;
    }
}

// ============================================================================
// PROXY DEVICES
// ============================================================================

/// Where a recorder's events are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStore {
    /// Backend memory, via `get_events` / `clear_events`
    Memory,
    /// Files under the backend's data path
    Ascii { data_path: PathBuf },
}

/// Handle to one created device.
///
/// The backend owns the device; the proxy only remembers its global id and
/// how to reach its events.
#[derive(Debug, Clone)]
pub struct ProxyDevice {
    pub gid: NodeId,
    pub model: DeviceModel,
    pub label: String,
    pub store: EventStore,
}

impl ProxyDevice {
    pub fn create(backend: &mut dyn SpikingBackend, model: DeviceModel, label: &str) -> Result<Self> {
        let store = match model.record_to() {
            Some(RecordingMode::Ascii) => {
                let data_path = backend.data_path().map(Path::to_path_buf).ok_or_else(|| {
                    SpikeNetError::InvalidParameter(format!(
                        "{} records to ascii but {} has no data path",
                        model.name(),
                        backend.name()
                    ))
                })?;
                EventStore::Ascii { data_path }
            }
            _ => EventStore::Memory,
        };
        let gid = backend.create_device(&model, label)?;
        Ok(Self {
            gid,
            model,
            label: label.to_string(),
            store,
        })
    }

    pub fn kind(&self) -> DeviceKind {
        self.model.kind()
    }

    pub fn node(&self) -> NodeCollection {
        NodeCollection::single(self.gid)
    }

    fn wrap(&self, err: SpikeNetError) -> SpikeNetError {
        SpikeNetError::Device {
            model: self.model.name().to_string(),
            gid: self.gid,
            source: Box::new(err),
        }
    }

    pub fn set(&self, backend: &mut dyn SpikingBackend, values: &Status) -> Result<()> {
        backend.set(&self.node(), values).map_err(|e| self.wrap(e))
    }

    pub fn get(&self, backend: &dyn SpikingBackend, attrs: &[&str]) -> Result<Status> {
        let mut statuses = backend.get(&self.node(), attrs).map_err(|e| self.wrap(e))?;
        statuses
            .pop()
            .ok_or_else(|| self.wrap(SpikeNetError::NodeNotFound(self.gid)))
    }

    /// Files written by this device
    pub fn filenames(&self) -> Result<Vec<PathBuf>> {
        let EventStore::Ascii { data_path } = &self.store else {
            return Ok(vec![]);
        };
        let prefix = recording_file_name(&self.label, self.gid);
        let mut files = vec![];
        for entry in fs::read_dir(data_path).map_err(|e| self.wrap(e.into()))? {
            let path = entry.map_err(|e| self.wrap(e.into()))?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(&prefix));
            if matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Events recorded since the last reset
    pub fn read_events(&self, backend: &dyn SpikingBackend) -> Result<Events> {
        match &self.store {
            EventStore::Memory => backend.get_events(self.gid).map_err(|e| self.wrap(e)),
            EventStore::Ascii { .. } => {
                if !backend.is_live() {
                    return Err(self.wrap(SpikeNetError::NoBackend));
                }
                let mut events = Events::with_variables(&self.model.record_from());
                for path in self.filenames()? {
                    events.extend(read_ascii_events(&path).map_err(|e| self.wrap(e))?);
                }
                Ok(events)
            }
        }
    }

    pub fn number_of_events(&self, backend: &dyn SpikingBackend) -> Result<usize> {
        Ok(self.read_events(backend)?.n_events())
    }

    /// Forget the events already read. File-backed recorders keep their header.
    pub fn reset(&self, backend: &mut dyn SpikingBackend) -> Result<()> {
        match &self.store {
            EventStore::Memory => backend.clear_events(self.gid).map_err(|e| self.wrap(e)),
            EventStore::Ascii { .. } => {
                for path in self.filenames()? {
                    truncate_ascii_file_after_header(&path, "#").map_err(|e| self.wrap(e.into()))?;
                }
                Ok(())
            }
        }
    }

    /// Connections of the device, whichever side it sits on
    pub fn connections(&self, backend: &dyn SpikingBackend) -> Result<Vec<Connection>> {
        let node = self.node();
        let result = if self.kind() == DeviceKind::SpikeRecorder {
            backend.get_connections(None, Some(&node))
        } else {
            backend.get_connections(Some(&node), None)
        };
        result.map_err(|e| self.wrap(e))
    }

    /// Neurons the device stimulates or records from
    pub fn neurons(&self, backend: &dyn SpikingBackend) -> Result<Vec<NodeId>> {
        let spike_recorder = self.kind() == DeviceKind::SpikeRecorder;
        let mut ids: Vec<NodeId> = self
            .connections(backend)?
            .iter()
            .map(|c| if spike_recorder { c.source } else { c.target })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    pub fn number_of_neurons(&self, backend: &dyn SpikingBackend) -> Result<usize> {
        Ok(self.neurons(backend)?.len())
    }
}

/// Connect a device with `neurons`, oriented by device role: spike recorders
/// receive from the neurons, every other device projects onto them.
pub fn connect_device(
    backend: &mut dyn SpikingBackend,
    device: &ProxyDevice,
    neurons: &NodeCollection,
    spec: &ConnectionSpec,
) -> Result<()> {
    let node = device.node();
    let result = if device.kind() == DeviceKind::SpikeRecorder {
        backend.connect(neurons, &node, spec)
    } else {
        backend.connect(&node, neurons, spec)
    };
    result.map_err(|e| device.wrap(e))
}

// ============================================================================
// SPIKING NETWORK
// ============================================================================

/// One population built at every spiking region node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationSpec {
    pub label: String,
    pub model: NeuronModel,
    pub size: usize,
}

/// Populations per region node
#[derive(Debug, Clone, Default)]
pub struct SpikingNetwork {
    pub region_nodes: BTreeMap<usize, BTreeMap<String, NodeCollection>>,
}

impl SpikingNetwork {
    /// Create every population at every node.
    pub fn build(
        backend: &mut dyn SpikingBackend,
        nodes: &[usize],
        populations: &[PopulationSpec],
    ) -> Result<Self> {
        let mut region_nodes = BTreeMap::new();
        for &node in nodes {
            let mut pops = BTreeMap::new();
            for spec in populations {
                if spec.size == 0 {
                    return Err(SpikeNetError::InvalidParameter(format!(
                        "population {} has no neurons",
                        spec.label
                    )));
                }
                pops.insert(spec.label.clone(), backend.create_neurons(&spec.model, spec.size)?);
            }
            region_nodes.insert(node, pops);
        }
        info!(
            nodes = nodes.len(),
            populations = populations.len(),
            "spiking network built"
        );
        Ok(Self { region_nodes })
    }

    pub fn population(&self, node: usize, label: &str) -> Option<&NodeCollection> {
        self.region_nodes.get(&node).and_then(|pops| pops.get(label))
    }

    pub fn spiking_node_indices(&self) -> Vec<usize> {
        self.region_nodes.keys().copied().collect()
    }

    pub fn population_labels(&self) -> Vec<String> {
        multiscale_core::unique_sorted(self.region_nodes.values().flat_map(|pops| pops.keys().cloned()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
