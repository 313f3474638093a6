//! # Interfaces
//!
//! Per-step coupling between a continuous simulator and a spiking backend.
//!
//! ## Pipeline of one co-simulation step
//!
//! 1. [`OutputInterfaces::send`]: continuous state / coupling -> device settings
//! 2. one continuous integration step
//! 3. the spiking backend advances by the same `dt`
//! 4. [`InputInterfaces::receive`]: recorded activity -> continuous state
//!
//! Interfaces are built once by [`InterfaceBuilder`], which also creates and
//! connects every device, and then configured against the continuous model.
//! Misconfiguration is reported before the first step, naming the interface
//! as `"<model>: [<populations>] (<proxy nodes>)"`.

use multiscale_core::{
    extract_integer_intervals, unique_sorted, validate_region_indices, ContinuousSimulator, CoreError,
    CosimConfig, ModelShape, RegionIndex, RegionPartition, StateTensor, Time,
};
use multiscale_spikenet::{
    connect_device, ConnectionSpec, DeviceKind, DeviceModel, DeviceRole, DriveKind, NodeCollection,
    ProxyDevice, SpikeNetError, SpikingBackend, SpikingNetwork, Status, Value,
};
use multiscale_transformers::{Direction, Transformer, TransformerError, TransformerInput, TransformerModel};
use ndarray::Array2;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Configuration error in {interface}: {message}")]
    Configuration { interface: String, message: String },

    #[error("Backend error in {interface}: {source}")]
    Backend {
        interface: String,
        source: SpikeNetError,
    },

    #[error("Transformer error in {interface}: {source}")]
    Transformer {
        interface: String,
        source: TransformerError,
    },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    SpikeNet(#[from] SpikeNetError),
}

pub type Result<T> = std::result::Result<T, InterfaceError>;

fn configuration(interface: &str, message: impl Into<String>) -> InterfaceError {
    InterfaceError::Configuration {
        interface: interface.to_string(),
        message: message.into(),
    }
}

fn backend_err(interface: &str) -> impl FnOnce(SpikeNetError) -> InterfaceError + '_ {
    move |source| InterfaceError::Backend {
        interface: interface.to_string(),
        source,
    }
}

// ============================================================================
// COUPLING SPECIFICATION
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match OneOrMany::<T>::deserialize(deserializer)? {
        OneOrMany::One(v) => vec![v],
        OneOrMany::Many(v) => v,
    })
}

fn unit_scale() -> Vec<f64> {
    vec![1.0]
}

/// One logical channel between the continuous model and spiking populations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingSpec {
    /// State variable(s) or coupling term on the continuous side
    #[serde(deserialize_with = "one_or_many")]
    pub voi: Vec<String>,
    /// Population labels on the spiking side
    #[serde(deserialize_with = "one_or_many")]
    pub populations: Vec<String>,
    /// Strictly increasing region indices
    pub proxy_node_indices: Vec<RegionIndex>,
    /// Device kind or alias; the configured default device when absent
    #[serde(default)]
    pub model: Option<String>,
    /// One factor, or one per voi
    #[serde(default = "unit_scale", deserialize_with = "one_or_many")]
    pub scale: Vec<f64>,
    #[serde(default)]
    pub transformer: Option<TransformerModel>,
    /// Overrides of the device's creation parameters
    #[serde(default)]
    pub proxy_params: Status,
    #[serde(default)]
    pub connection: ConnectionSpec,
}

impl CouplingSpec {
    pub fn new(voi: &str, populations: &[&str], proxy_node_indices: &[RegionIndex]) -> Self {
        Self {
            voi: vec![voi.to_string()],
            populations: populations.iter().map(|p| p.to_string()).collect(),
            proxy_node_indices: proxy_node_indices.to_vec(),
            model: None,
            scale: unit_scale(),
            transformer: None,
            proxy_params: Status::new(),
            connection: ConnectionSpec::default(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = vec![scale];
        self
    }

    pub fn with_vois(mut self, vois: &[&str]) -> Self {
        self.voi = vois.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_transformer(mut self, transformer: TransformerModel) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn with_proxy_param(mut self, key: &str, value: Value) -> Self {
        self.proxy_params.insert(key.to_string(), value);
        self
    }

    /// `"<model>: [<populations>] (<proxy nodes>)"`
    pub fn label(&self, model: &str) -> String {
        format!(
            "{}: [{}] ({})",
            model,
            self.populations.join(", "),
            extract_integer_intervals(&self.proxy_node_indices)
        )
    }

    fn declared_label(&self) -> String {
        self.label(self.model.as_deref().unwrap_or("default"))
    }

    fn scale_for(&self, voi_position: usize) -> f64 {
        if self.scale.len() == 1 {
            self.scale[0]
        } else {
            self.scale[voi_position]
        }
    }
}

// ============================================================================
// MODEL RESOLUTION
// ============================================================================

/// Neuron parameter written directly from a coupling term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouplingParameter {
    Current,
    Potential,
}

impl CouplingParameter {
    pub fn attribute(&self) -> &'static str {
        match self {
            CouplingParameter::Current => "I_e",
            CouplingParameter::Potential => "V_m",
        }
    }
}

/// What an output interface drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget {
    /// A stimulating device per population and node, fed from `state`
    Device(DeviceKind),
    /// A neuron parameter, fed from `coupling`
    Parameter(CouplingParameter),
}

impl OutputTarget {
    pub fn name(&self) -> &'static str {
        match self {
            OutputTarget::Device(kind) => kind.name(),
            OutputTarget::Parameter(CouplingParameter::Current) => "current",
            OutputTarget::Parameter(CouplingParameter::Potential) => "potential",
        }
    }
}

fn parse_device(name: &str) -> std::result::Result<DeviceKind, String> {
    name.parse::<DeviceKind>()
        .map_err(|_| format!("unknown device model {:?}", name))
}

/// Resolve an output model string or alias.
pub fn resolve_output_model(model: Option<&str>, config: &CosimConfig) -> std::result::Result<OutputTarget, String> {
    let kind = match model {
        None | Some("RATE") | Some("spike_rate") => parse_device(&config.default_output_device)?,
        Some("CURRENT") => DeviceKind::DcGenerator,
        Some("current") => return Ok(OutputTarget::Parameter(CouplingParameter::Current)),
        Some("potential") => return Ok(OutputTarget::Parameter(CouplingParameter::Potential)),
        Some(other) => parse_device(other)?,
    };
    match kind.role() {
        DeviceRole::Stimulating(DriveKind::Current) | DeviceRole::Stimulating(DriveKind::Rate) => {
            Ok(OutputTarget::Device(kind))
        }
        DeviceRole::Stimulating(DriveKind::SpikeTimes) => {
            Err(format!("{} cannot be driven by a mean-field value", kind))
        }
        DeviceRole::Recording => Err(format!("{} is a recording device, it cannot stimulate", kind)),
    }
}

/// Resolve an input model string or alias to a recording device.
pub fn resolve_input_model(model: Option<&str>, config: &CosimConfig) -> std::result::Result<DeviceKind, String> {
    let kind = match model {
        None => parse_device(&config.default_input_device)?,
        Some("RATE") | Some("spike_rate") | Some("SPIKES") => DeviceKind::SpikeRecorder,
        Some("POTENTIAL") => DeviceKind::Voltmeter,
        Some(other) => parse_device(other)?,
    };
    if kind.is_recording() {
        Ok(kind)
    } else {
        Err(format!("{} is a stimulating device, it cannot record", kind))
    }
}

/// Device model with `proxy_params` merged over the kind's defaults
pub fn device_model(kind: DeviceKind, config: &CosimConfig, proxy_params: &Status) -> std::result::Result<DeviceModel, String> {
    let defaults = kind.default_model(config.record_to);
    if proxy_params.is_empty() {
        return Ok(defaults);
    }
    let mut merged = serde_json::to_value(&defaults).map_err(|e| e.to_string())?;
    if let serde_json::Value::Object(fields) = &mut merged {
        for (key, value) in proxy_params {
            fields.insert(key.clone(), serde_json::to_value(value).map_err(|e| e.to_string())?);
        }
    }
    serde_json::from_value(merged).map_err(|e| format!("invalid proxy_params for {}: {}", kind, e))
}

// ============================================================================
// INTERFACES
// ============================================================================

/// Whether values pass through a transformer
#[derive(Debug, Clone)]
pub enum Role {
    Raw,
    Transformed(Transformer),
}

impl Role {
    fn from_model(model: Option<TransformerModel>) -> Self {
        match model {
            Some(m) => Role::Transformed(Transformer::new(m)),
            None => Role::Raw,
        }
    }

    pub fn transformer(&self) -> Option<&Transformer> {
        match self {
            Role::Raw => None,
            Role::Transformed(t) => Some(t),
        }
    }
}

/// Spiking-side handle an interface reads from or writes to
#[derive(Debug, Clone)]
pub enum ProxyHandle {
    Device(ProxyDevice),
    Neurons(NodeCollection),
}

/// One (proxy node, population) slot of an interface
#[derive(Debug, Clone)]
pub struct ProxyBinding {
    pub node: RegionIndex,
    pub population: String,
    pub handle: ProxyHandle,
}

/// Behaviour shared by both directions
pub trait Interface {
    fn spec(&self) -> &CouplingSpec;

    /// Resolved model name
    fn model_name(&self) -> &'static str;

    /// Validate against the continuous model stepping by `dt`
    fn configure(&mut self, shape: &ModelShape, dt: Time) -> Result<()>;

    fn label(&self) -> String {
        self.spec().label(self.model_name())
    }
}

fn check_bindings(label: &str, spec: &CouplingSpec, proxies: &[ProxyBinding]) -> Result<()> {
    let expected = spec.populations.len() * spec.proxy_node_indices.len();
    if proxies.len() != expected {
        return Err(configuration(
            label,
            format!(
                "{} proxies bound, expected {} populations x {} nodes",
                proxies.len(),
                spec.populations.len(),
                spec.proxy_node_indices.len()
            ),
        ));
    }
    for binding in proxies {
        if spec.proxy_node_indices.binary_search(&binding.node).is_err()
            || !spec.populations.contains(&binding.population)
        {
            return Err(configuration(
                label,
                format!("proxy for {} at node {} is not declared", binding.population, binding.node),
            ));
        }
    }
    Ok(())
}

fn check_common(label: &str, spec: &CouplingSpec, shape: &ModelShape) -> Result<()> {
    validate_region_indices(&spec.proxy_node_indices, shape.number_of_regions)
        .map_err(|e| configuration(label, e.to_string()))?;
    if spec.proxy_node_indices.is_empty() {
        return Err(configuration(label, "no proxy nodes"));
    }
    if spec.populations.is_empty() {
        return Err(configuration(label, "no populations"));
    }
    if spec.scale.len() != 1 && spec.scale.len() != spec.voi.len() {
        return Err(configuration(
            label,
            format!("{} scale factors for {} vois", spec.scale.len(), spec.voi.len()),
        ));
    }
    Ok(())
}

/// `dt` must be a positive integer multiple of the spiking resolution.
pub fn check_step(dt: Time, resolution: Time) -> Result<()> {
    let ratio = dt / resolution;
    if !(dt > 0.0 && dt.is_finite()) || (ratio - ratio.round()).abs() > 1e-9 || ratio.round() < 1.0 {
        return Err(configuration(
            "co-simulator",
            format!("dt {} is not a multiple of the spiking resolution {}", dt, resolution),
        ));
    }
    Ok(())
}

/// An interface keeps the step it was first configured with.
fn fix_step(label: &str, slot: &mut Option<Time>, dt: Time) -> Result<()> {
    if !(dt > 0.0 && dt.is_finite()) {
        return Err(configuration(label, format!("dt must be positive, got {}", dt)));
    }
    match *slot {
        Some(fixed) if (fixed - dt).abs() > 1e-9 * fixed.max(dt) => Err(configuration(
            label,
            format!("configured for dt {}, asked for dt {}", fixed, dt),
        )),
        _ => {
            *slot = Some(dt);
            Ok(())
        }
    }
}

fn configure_role(label: &str, role: &mut Role, n_proxies: usize, direction: Direction, dt: Time) -> Result<()> {
    if let Role::Transformed(t) = role {
        t.configure(n_proxies, direction, dt)
            .map_err(|e| configuration(label, e.to_string()))?;
    }
    Ok(())
}

/// Continuous -> spiking
#[derive(Debug, Clone)]
pub struct OutputInterface {
    pub spec: CouplingSpec,
    pub target: OutputTarget,
    pub role: Role,
    pub proxies: Vec<ProxyBinding>,
    voi_index: Option<usize>,
    dt: Option<Time>,
}

impl OutputInterface {
    pub fn new(spec: CouplingSpec, config: &CosimConfig) -> Result<Self> {
        let target = resolve_output_model(spec.model.as_deref(), config)
            .map_err(|message| configuration(&spec.declared_label(), message))?;
        let role = Role::from_model(spec.transformer.clone());
        Ok(Self {
            spec,
            target,
            role,
            proxies: vec![],
            voi_index: None,
            dt: None,
        })
    }

    fn resolve_voi(&self, shape: &ModelShape) -> Result<usize> {
        let label = self.label();
        if self.spec.voi.len() != 1 {
            return Err(configuration(
                &label,
                format!("expected exactly one voi, got {:?}", self.spec.voi),
            ));
        }
        let voi = &self.spec.voi[0];
        match self.target {
            OutputTarget::Device(_) => shape
                .state_variable_index(voi)
                .ok_or_else(|| configuration(&label, format!("{} is not a state variable of the model", voi))),
            OutputTarget::Parameter(_) => shape
                .coupling_term_index(voi)
                .ok_or_else(|| configuration(&label, format!("{} is not a coupling term of the model", voi))),
        }
    }

    /// Push `scale * transform(values)` into every proxy.
    ///
    /// Devices receive values at the next kernel step; parameters are set on
    /// the neurons immediately.
    pub fn send(
        &mut self,
        state: &StateTensor,
        coupling: &StateTensor,
        backend: &mut dyn SpikingBackend,
    ) -> Result<()> {
        let label = self.label();
        let index = self
            .voi_index
            .ok_or_else(|| configuration(&label, "send() before configure()"))?;
        let source = match self.target {
            OutputTarget::Device(_) => state,
            OutputTarget::Parameter(_) => coupling,
        };
        let nodes = &self.spec.proxy_node_indices;
        let raw = Array2::from_shape_fn((nodes.len(), 1), |(row, _)| source[[index, nodes[row], 0]]);
        let values: Vec<f64> = match &mut self.role {
            Role::Raw => raw.column(0).to_vec(),
            Role::Transformed(t) => {
                t.compute(TransformerInput::Values(raw))
                    .map_err(|source| InterfaceError::Transformer {
                        interface: label.clone(),
                        source,
                    })?;
                t.latest()
                    .map(|latest| latest.column(0).to_vec())
                    .ok_or_else(|| configuration(&label, "transformer produced no output"))?
            }
        };
        let scale = self.spec.scale_for(0);
        let rows: BTreeMap<RegionIndex, usize> = nodes.iter().enumerate().map(|(row, &n)| (n, row)).collect();
        let t_set = backend.time() + backend.resolution();

        for binding in &self.proxies {
            let row = rows
                .get(&binding.node)
                .copied()
                .ok_or_else(|| configuration(&label, format!("node {} is not a proxy node", binding.node)))?;
            let value = scale * values[row];
            match (&binding.handle, self.target) {
                (ProxyHandle::Device(device), OutputTarget::Device(kind)) => {
                    let status = kind
                        .drive_status(value, t_set)
                        .ok_or_else(|| configuration(&label, format!("{} cannot be driven", kind)))?;
                    device.set(backend, &status).map_err(backend_err(&label))?;
                }
                (ProxyHandle::Neurons(neurons), OutputTarget::Parameter(parameter)) => {
                    let status = Status::from([(parameter.attribute().to_string(), Value::Number(value))]);
                    backend.set(neurons, &status).map_err(backend_err(&label))?;
                }
                _ => {
                    return Err(configuration(
                        &label,
                        format!("proxy of {} at node {} does not match the target", binding.population, binding.node),
                    ))
                }
            }
        }
        debug!(interface = %label, n_values = values.len(), "sent to spiking network");
        Ok(())
    }
}

impl Interface for OutputInterface {
    fn spec(&self) -> &CouplingSpec {
        &self.spec
    }

    fn model_name(&self) -> &'static str {
        self.target.name()
    }

    /// Idempotent for the same model and step.
    fn configure(&mut self, shape: &ModelShape, dt: Time) -> Result<()> {
        let label = self.label();
        check_common(&label, &self.spec, shape)?;
        fix_step(&label, &mut self.dt, dt)?;
        self.voi_index = Some(self.resolve_voi(shape)?);
        configure_role(&label, &mut self.role, self.spec.proxy_node_indices.len(), Direction::ToSpiking, dt)?;
        check_bindings(&label, &self.spec, &self.proxies)
    }
}

/// Spiking -> continuous
#[derive(Debug, Clone)]
pub struct InputInterface {
    pub spec: CouplingSpec,
    pub source: DeviceKind,
    pub role: Role,
    pub proxies: Vec<ProxyBinding>,
    sv_indices: Vec<usize>,
    dt: Option<Time>,
}

impl InputInterface {
    pub fn new(spec: CouplingSpec, config: &CosimConfig) -> Result<Self> {
        let source = resolve_input_model(spec.model.as_deref(), config)
            .map_err(|message| configuration(&spec.declared_label(), message))?;
        let role = Role::from_model(spec.transformer.clone());
        Ok(Self {
            spec,
            source,
            role,
            proxies: vec![],
            sv_indices: vec![],
            dt: None,
        })
    }

    /// Spike-train transformers read spike times, which only spike recorders
    /// provide.
    fn check_source(&self, label: &str) -> Result<()> {
        let Role::Transformed(t) = &self.role else {
            return Ok(());
        };
        if matches!(t.model, TransformerModel::Linear(_)) || self.source == DeviceKind::SpikeRecorder {
            return Ok(());
        }
        Err(configuration(
            label,
            format!(
                "{} transformer needs spike times from a spike_recorder, not {}",
                t.name(),
                self.source
            ),
        ))
    }

    fn resolve_vois(&self, shape: &ModelShape) -> Result<Vec<usize>> {
        let label = self.label();
        self.check_source(&label)?;
        let expected = match &self.role {
            Role::Raw => 1,
            Role::Transformed(t) => t.model.output_variables().len(),
        };
        if self.spec.voi.len() != expected {
            return Err(configuration(
                &label,
                format!("{} vois declared, the proxy provides {}", self.spec.voi.len(), expected),
            ));
        }
        self.spec
            .voi
            .iter()
            .map(|voi| {
                shape.state_variable_index(voi).ok_or_else(|| {
                    configuration(&label, format!("{} is not a state variable slot of the model", voi))
                })
            })
            .collect()
    }

    fn row_of(&self, node: RegionIndex) -> Option<usize> {
        self.spec.proxy_node_indices.binary_search(&node).ok()
    }

    /// Raw device output per proxy node; `None` where nothing was sampled
    fn read_raw(&self, backend: &dyn SpikingBackend, label: &str) -> Result<Vec<Option<f64>>> {
        let n = self.spec.proxy_node_indices.len();
        let mut totals: Vec<Option<f64>> = vec![None; n];
        let mut samples: Vec<Vec<f64>> = vec![vec![]; n];
        for binding in &self.proxies {
            let ProxyHandle::Device(device) = &binding.handle else {
                continue;
            };
            let row = self
                .row_of(binding.node)
                .ok_or_else(|| configuration(label, format!("node {} is not a proxy node", binding.node)))?;
            let events = device.read_events(backend).map_err(backend_err(label))?;
            match self.source {
                DeviceKind::SpikeRecorder => {
                    *totals[row].get_or_insert(0.0) += events.n_events() as f64;
                }
                DeviceKind::SpikeMultimeter => {
                    *totals[row].get_or_insert(0.0) += events.total("spikes");
                }
                _ => {
                    let variable = device.model.record_from().into_iter().next();
                    if let Some(mean) = variable.and_then(|v| events.latest_mean(&v)) {
                        samples[row].push(mean);
                    }
                }
            }
        }
        if matches!(self.source, DeviceKind::Multimeter | DeviceKind::Voltmeter) {
            for (row, values) in samples.into_iter().enumerate() {
                if !values.is_empty() {
                    totals[row] = Some(values.iter().sum::<f64>() / values.len() as f64);
                }
            }
        } else {
            // counters read zero when no event arrived
            for total in totals.iter_mut() {
                total.get_or_insert(0.0);
            }
        }
        Ok(totals)
    }

    /// Spike trains per proxy node, merged over populations
    fn read_trains(&self, backend: &dyn SpikingBackend, label: &str) -> Result<Vec<Vec<Time>>> {
        let mut trains = vec![vec![]; self.spec.proxy_node_indices.len()];
        for binding in &self.proxies {
            let ProxyHandle::Device(device) = &binding.handle else {
                continue;
            };
            let row = self
                .row_of(binding.node)
                .ok_or_else(|| configuration(label, format!("node {} is not a proxy node", binding.node)))?;
            let events = device.read_events(backend).map_err(backend_err(label))?;
            trains[row].extend(events.times);
        }
        for train in trains.iter_mut() {
            train.sort_by(|a, b| a.total_cmp(b));
        }
        Ok(trains)
    }

    /// `[voi, node]` values to write, and which nodes carry data
    fn transform(
        &mut self,
        label: &str,
        input: TransformerInput,
        present: &[bool],
    ) -> Result<(Array2<f64>, Vec<bool>)> {
        let n_vois = self.spec.voi.len();
        let n_nodes = present.len();
        match &mut self.role {
            Role::Raw => {
                let TransformerInput::Values(values) = input else {
                    return Err(configuration(label, "raw interfaces read values, not spike trains"));
                };
                if values.dim() != (n_vois, n_nodes) {
                    return Err(configuration(
                        label,
                        format!("payload of shape {:?}, expected ({}, {})", values.dim(), n_vois, n_nodes),
                    ));
                }
                Ok((values, present.to_vec()))
            }
            Role::Transformed(t) => {
                t.compute(input).map_err(|source| InterfaceError::Transformer {
                    interface: label.to_string(),
                    source,
                })?;
                let latest = t
                    .latest()
                    .ok_or_else(|| configuration(label, "transformer produced no output"))?;
                Ok((latest.reversed_axes().as_standard_layout().into_owned(), present.to_vec()))
            }
        }
    }

    /// Write `scale * values` into `state[sv, node, 0]` for present nodes and
    /// return the updated `[voi, node]` slice.
    fn write_state(&self, state: &mut StateTensor, values: &Array2<f64>, present: &[bool]) -> Array2<f64> {
        let nodes = &self.spec.proxy_node_indices;
        for (k, &sv) in self.sv_indices.iter().enumerate() {
            let scale = self.spec.scale_for(k);
            for (row, &node) in nodes.iter().enumerate() {
                if present[row] {
                    state[[sv, node, 0]] = scale * values[[k, row]];
                }
            }
        }
        Array2::from_shape_fn((self.sv_indices.len(), nodes.len()), |(k, row)| {
            state[[self.sv_indices[k], nodes[row], 0]]
        })
    }

    fn ensure_configured(&self, label: &str) -> Result<()> {
        if self.sv_indices.is_empty() {
            Err(configuration(label, "used before configure()"))
        } else {
            Ok(())
        }
    }

    /// Read the activity recorded in `[t_start, t_start + duration]`, write it
    /// into the continuous state and reset the devices.
    pub fn receive(
        &mut self,
        state: &mut StateTensor,
        backend: &mut dyn SpikingBackend,
        t_start: Time,
        duration: Time,
    ) -> Result<Array2<f64>> {
        let label = self.label();
        self.ensure_configured(&label)?;
        let n_nodes = self.spec.proxy_node_indices.len();

        let spike_driven = matches!(self.role, Role::Transformed(ref t) if !matches!(t.model, TransformerModel::Linear(_)));
        let (input, present) = if spike_driven {
            let trains = self.read_trains(backend, &label)?;
            (TransformerInput::SpikeTrains { trains, t_start, duration }, vec![true; n_nodes])
        } else {
            let raw = self.read_raw(backend, &label)?;
            let present: Vec<bool> = raw.iter().map(Option::is_some).collect();
            let rows = match self.role {
                Role::Raw => self.spec.voi.len(),
                Role::Transformed(_) => 1,
            };
            let values = Array2::from_shape_fn((rows, n_nodes), |(_, row)| raw[row].unwrap_or(0.0));
            let input = match self.role {
                Role::Raw => values,
                // transformers take [node, time]
                Role::Transformed(_) => values.reversed_axes().as_standard_layout().into_owned(),
            };
            (TransformerInput::Values(input), present)
        };

        let (values, present) = self.transform(&label, input, &present)?;
        let written = self.write_state(state, &values, &present);

        for binding in &self.proxies {
            if let ProxyHandle::Device(device) = &binding.handle {
                device.reset(backend).map_err(backend_err(&label))?;
            }
        }
        debug!(interface = %label, t_start, duration, "received from spiking network");
        Ok(written)
    }

    /// Write an externally supplied payload through the same
    /// `scale * transform` path. Raw interfaces take `[voi, node]`,
    /// transformed ones a single `[1, node]` row.
    pub fn write(&mut self, state: &mut StateTensor, payload: &Array2<f64>) -> Result<Array2<f64>> {
        let label = self.label();
        self.ensure_configured(&label)?;
        let n_nodes = self.spec.proxy_node_indices.len();
        let input = match self.role {
            Role::Raw => payload.clone(),
            Role::Transformed(_) => {
                if payload.nrows() != 1 {
                    return Err(configuration(
                        &label,
                        format!("transformed payload must be one row, got {}", payload.nrows()),
                    ));
                }
                payload.t().as_standard_layout().into_owned()
            }
        };
        let (values, present) = self.transform(&label, TransformerInput::Values(input), &vec![true; n_nodes])?;
        Ok(self.write_state(state, &values, &present))
    }
}

impl Interface for InputInterface {
    fn spec(&self) -> &CouplingSpec {
        &self.spec
    }

    fn model_name(&self) -> &'static str {
        self.source.name()
    }

    /// Idempotent for the same model and step.
    fn configure(&mut self, shape: &ModelShape, dt: Time) -> Result<()> {
        let label = self.label();
        check_common(&label, &self.spec, shape)?;
        fix_step(&label, &mut self.dt, dt)?;
        self.sv_indices = self.resolve_vois(shape)?;
        configure_role(&label, &mut self.role, self.spec.proxy_node_indices.len(), Direction::FromSpiking, dt)?;
        check_bindings(&label, &self.spec, &self.proxies)
    }
}

// ============================================================================
// INTERFACE SETS
// ============================================================================

/// Ordered interfaces sharing one spiking network. Aggregate views are
/// recomputed on every call.
#[derive(Debug, Clone)]
pub struct InterfaceSet<I> {
    pub interfaces: Vec<I>,
}

pub type OutputInterfaces = InterfaceSet<OutputInterface>;
pub type InputInterfaces = InterfaceSet<InputInterface>;

impl<I> Default for InterfaceSet<I> {
    fn default() -> Self {
        Self { interfaces: vec![] }
    }
}

impl<I: Interface> InterfaceSet<I> {
    pub fn new(interfaces: Vec<I>) -> Self {
        Self { interfaces }
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    pub fn configure(&mut self, shape: &ModelShape, dt: Time) -> Result<()> {
        for interface in &mut self.interfaces {
            interface.configure(shape, dt)?;
        }
        Ok(())
    }

    pub fn labels(&self) -> Vec<String> {
        self.interfaces.iter().map(|i| i.label()).collect()
    }

    pub fn vois(&self) -> Vec<String> {
        self.interfaces.iter().flat_map(|i| i.spec().voi.iter().cloned()).collect()
    }

    pub fn vois_unique(&self) -> Vec<String> {
        unique_sorted(self.vois())
    }

    /// Populations of every interface, concatenated
    pub fn populations(&self) -> Vec<String> {
        self.interfaces
            .iter()
            .flat_map(|i| i.spec().populations.iter().cloned())
            .collect()
    }

    pub fn populations_unique(&self) -> Vec<String> {
        unique_sorted(self.populations())
    }

    pub fn number_of_populations(&self) -> usize {
        self.populations_unique().len()
    }

    /// Proxy nodes of every interface, concatenated
    pub fn spiking_proxy_inds(&self) -> Vec<RegionIndex> {
        self.interfaces
            .iter()
            .flat_map(|i| i.spec().proxy_node_indices.iter().copied())
            .collect()
    }

    pub fn spiking_proxy_inds_unique(&self) -> Vec<RegionIndex> {
        unique_sorted(self.spiking_proxy_inds())
    }

    pub fn number_of_spiking_proxy_nodes(&self) -> usize {
        self.spiking_proxy_inds_unique().len()
    }
}

impl OutputInterfaces {
    pub fn send(
        &mut self,
        state: &StateTensor,
        coupling: &StateTensor,
        backend: &mut dyn SpikingBackend,
    ) -> Result<()> {
        for interface in &mut self.interfaces {
            interface.send(state, coupling, backend)?;
        }
        Ok(())
    }
}

impl InputInterfaces {
    /// One `[voi, node]` slice per interface
    pub fn receive(
        &mut self,
        state: &mut StateTensor,
        backend: &mut dyn SpikingBackend,
        t_start: Time,
        duration: Time,
    ) -> Result<Vec<Array2<f64>>> {
        self.interfaces
            .iter_mut()
            .map(|interface| interface.receive(state, backend, t_start, duration))
            .collect()
    }

    /// One payload per interface, in order
    pub fn write(&mut self, state: &mut StateTensor, payloads: &[Array2<f64>]) -> Result<Vec<Array2<f64>>> {
        if payloads.len() != self.interfaces.len() {
            return Err(configuration(
                "input interfaces",
                format!("{} payloads for {} interfaces", payloads.len(), self.interfaces.len()),
            ));
        }
        self.interfaces
            .iter_mut()
            .zip(payloads)
            .map(|(interface, payload)| interface.write(state, payload))
            .collect()
    }

    /// State variable name -> sorted proxy nodes written into it
    pub fn spikenet_to_tvb_params(&self) -> BTreeMap<String, Vec<RegionIndex>> {
        let mut params: BTreeMap<String, Vec<RegionIndex>> = BTreeMap::new();
        for interface in &self.interfaces {
            for voi in &interface.spec.voi {
                params
                    .entry(voi.clone())
                    .or_default()
                    .extend(interface.spec.proxy_node_indices.iter().copied());
            }
        }
        params
            .into_iter()
            .map(|(voi, nodes)| (voi, unique_sorted(nodes)))
            .collect()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builds both interface sets and their devices.
pub struct InterfaceBuilder<'a> {
    pub config: &'a CosimConfig,
    pub shape: &'a ModelShape,
    pub network: &'a SpikingNetwork,
    pub partition: &'a RegionPartition,
}

impl<'a> InterfaceBuilder<'a> {
    pub fn new(
        config: &'a CosimConfig,
        shape: &'a ModelShape,
        network: &'a SpikingNetwork,
        partition: &'a RegionPartition,
    ) -> Self {
        Self {
            config,
            shape,
            network,
            partition,
        }
    }

    fn check_placement(&self, label: &str, spec: &CouplingSpec) -> Result<()> {
        for &node in &spec.proxy_node_indices {
            if !self.partition.is_spiking(node) {
                return Err(configuration(label, format!("node {} is not a spiking node", node)));
            }
            for population in &spec.populations {
                if self.network.population(node, population).is_none() {
                    return Err(configuration(
                        label,
                        format!("population {} does not exist at node {}", population, node),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validate every spec, then create and connect all devices.
    ///
    /// No device is created unless every interface is valid. Interfaces and
    /// their transformers are fixed to the configured `dt`.
    pub fn build(
        &self,
        outputs: &[CouplingSpec],
        inputs: &[CouplingSpec],
        backend: &mut dyn SpikingBackend,
    ) -> Result<(OutputInterfaces, InputInterfaces)> {
        self.partition
            .validate(self.shape.number_of_regions, self.config.exclusive_nodes)
            .map_err(|e| configuration("region partition", e.to_string()))?;
        let dt = self.config.dt;
        check_step(dt, backend.resolution())?;

        let mut planned_outputs = vec![];
        for spec in outputs {
            let mut interface = OutputInterface::new(spec.clone(), self.config)?;
            let label = interface.label();
            check_common(&label, spec, self.shape)?;
            self.check_placement(&label, spec)?;
            fix_step(&label, &mut interface.dt, dt)?;
            interface.voi_index = Some(interface.resolve_voi(self.shape)?);
            configure_role(&label, &mut interface.role, spec.proxy_node_indices.len(), Direction::ToSpiking, dt)?;
            let model = match interface.target {
                OutputTarget::Device(kind) => Some(
                    device_model(kind, self.config, &spec.proxy_params).map_err(|m| configuration(&label, m))?,
                ),
                OutputTarget::Parameter(_) => None,
            };
            planned_outputs.push((interface, model));
        }

        let mut planned_inputs = vec![];
        for spec in inputs {
            let mut interface = InputInterface::new(spec.clone(), self.config)?;
            let label = interface.label();
            check_common(&label, spec, self.shape)?;
            self.check_placement(&label, spec)?;
            fix_step(&label, &mut interface.dt, dt)?;
            interface.sv_indices = interface.resolve_vois(self.shape)?;
            configure_role(&label, &mut interface.role, spec.proxy_node_indices.len(), Direction::FromSpiking, dt)?;
            let model =
                device_model(interface.source, self.config, &spec.proxy_params).map_err(|m| configuration(&label, m))?;
            planned_inputs.push((interface, model));
        }

        let mut output_set = Vec::with_capacity(planned_outputs.len());
        for (mut interface, model) in planned_outputs {
            interface.proxies = self.bind(&interface.label(), &interface.spec, model.as_ref(), backend)?;
            output_set.push(interface);
        }
        let mut input_set = Vec::with_capacity(planned_inputs.len());
        for (mut interface, model) in planned_inputs {
            interface.proxies = self.bind(&interface.label(), &interface.spec, Some(&model), backend)?;
            input_set.push(interface);
        }

        info!(
            outputs = output_set.len(),
            inputs = input_set.len(),
            "co-simulation interfaces built"
        );
        Ok((InterfaceSet::new(output_set), InterfaceSet::new(input_set)))
    }

    /// One device (or the population itself) per node and population
    fn bind(
        &self,
        label: &str,
        spec: &CouplingSpec,
        model: Option<&DeviceModel>,
        backend: &mut dyn SpikingBackend,
    ) -> Result<Vec<ProxyBinding>> {
        let mut proxies = vec![];
        for &node in &spec.proxy_node_indices {
            for population in &spec.populations {
                let neurons = self
                    .network
                    .population(node, population)
                    .ok_or_else(|| configuration(label, format!("population {} missing at node {}", population, node)))?;
                let handle = match model {
                    Some(model) => {
                        let device_label = format!("{}_{}_{}", model.name(), population, node);
                        let device =
                            ProxyDevice::create(backend, model.clone(), &device_label).map_err(backend_err(label))?;
                        connect_device(backend, &device, neurons, &spec.connection).map_err(backend_err(label))?;
                        ProxyHandle::Device(device)
                    }
                    None => ProxyHandle::Neurons(neurons.clone()),
                };
                proxies.push(ProxyBinding {
                    node,
                    population: population.clone(),
                    handle,
                });
            }
        }
        Ok(proxies)
    }
}

// ============================================================================
// ORCHESTRATION
// ============================================================================

/// Step-synchronous co-simulation of one continuous simulator and one
/// spiking backend.
pub struct CoSimulator<S: ContinuousSimulator, B: SpikingBackend> {
    pub simulator: S,
    pub backend: B,
    pub outputs: OutputInterfaces,
    pub inputs: InputInterfaces,
    configured: bool,
    steps: usize,
}

impl<S: ContinuousSimulator, B: SpikingBackend> CoSimulator<S, B> {
    pub fn new(simulator: S, backend: B, outputs: OutputInterfaces, inputs: InputInterfaces) -> Self {
        Self {
            simulator,
            backend,
            outputs,
            inputs,
            configured: false,
            steps: 0,
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Configure every interface against the continuous model and its step.
    /// Interfaces built for another `dt` are rejected.
    pub fn configure(&mut self) -> Result<()> {
        let shape = self.simulator.shape();
        let dt = self.simulator.dt();
        check_step(dt, self.backend.resolution())?;
        self.outputs.configure(&shape, dt)?;
        self.inputs.configure(&shape, dt)?;
        self.configured = true;
        info!(
            dt,
            outputs = self.outputs.len(),
            inputs = self.inputs.len(),
            proxy_nodes = ?self.outputs.spiking_proxy_inds_unique(),
            "co-simulator configured"
        );
        Ok(())
    }

    /// Outputs, one continuous step, the spiking backend over the same `dt`,
    /// then inputs.
    pub fn step(&mut self) -> Result<()> {
        if !self.configured {
            return Err(configuration("co-simulator", "step() before configure()"));
        }
        let t_start = self.simulator.time();
        let dt = self.simulator.dt();

        self.outputs
            .send(self.simulator.state(), self.simulator.coupling(), &mut self.backend)?;
        self.simulator.integrate_step()?;
        self.backend.simulate(dt).map_err(backend_err("spiking backend"))?;
        self.inputs
            .receive(self.simulator.state_mut(), &mut self.backend, t_start, dt)?;

        self.steps += 1;
        debug!(step = self.steps, time = t_start + dt, "co-simulation step");
        Ok(())
    }

    pub fn run(&mut self, n_steps: usize) -> Result<()> {
        for _ in 0..n_steps {
            self.step()?;
        }
        Ok(())
    }

    /// Shut the backend down and hand both simulators back.
    pub fn shutdown(mut self) -> (S, B) {
        self.backend.shutdown();
        info!(steps = self.steps, "co-simulation finished");
        (self.simulator, self.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiscale_core::RecordingMode;

    #[test]
    fn test_label() {
        let spec = CouplingSpec::new("E", &["E", "I"], &[0, 1, 2, 5]);
        assert_eq!(spec.label("spike_recorder"), "spike_recorder: [E, I] (0-2, 5)");
    }

    #[test]
    fn test_output_aliases() {
        let config = CosimConfig::default();
        assert_eq!(
            resolve_output_model(Some("RATE"), &config),
            Ok(OutputTarget::Device(DeviceKind::InhomogeneousPoissonGenerator))
        );
        assert_eq!(resolve_output_model(None, &config), resolve_output_model(Some("spike_rate"), &config));
        assert_eq!(
            resolve_output_model(Some("CURRENT"), &config),
            Ok(OutputTarget::Device(DeviceKind::DcGenerator))
        );
        assert_eq!(
            resolve_output_model(Some("current"), &config),
            Ok(OutputTarget::Parameter(CouplingParameter::Current))
        );
        assert!(resolve_output_model(Some("spike_recorder"), &config).is_err());
        assert!(resolve_output_model(Some("spike_generator"), &config).is_err());
        assert!(resolve_output_model(Some("nonexistent_device"), &config).is_err());
    }

    #[test]
    fn test_input_aliases() {
        let config = CosimConfig::default();
        assert_eq!(resolve_input_model(None, &config), Ok(DeviceKind::SpikeRecorder));
        assert_eq!(resolve_input_model(Some("SPIKES"), &config), Ok(DeviceKind::SpikeRecorder));
        assert_eq!(resolve_input_model(Some("POTENTIAL"), &config), Ok(DeviceKind::Voltmeter));
        assert!(resolve_input_model(Some("dc_generator"), &config).is_err());
    }

    #[test]
    fn test_device_model_overrides() {
        let config = CosimConfig {
            record_to: RecordingMode::Ascii,
            ..Default::default()
        };
        let params = Status::from([("record_from".to_string(), Value::Texts(vec!["g_ex".into()]))]);
        let model = device_model(DeviceKind::Multimeter, &config, &params).unwrap();
        assert_eq!(model.record_from(), vec!["g_ex".to_string()]);
        assert_eq!(model.record_to(), Some(RecordingMode::Ascii));
    }

    #[test]
    fn test_spec_deserialization() {
        let spec: CouplingSpec = serde_json::from_str(
            r#"{"voi": "E", "populations": ["E", "I"], "proxy_node_indices": [0, 1], "model": "RATE", "scale": 0.5}"#,
        )
        .unwrap();
        assert_eq!(spec.voi, vec!["E".to_string()]);
        assert_eq!(spec.scale, vec![0.5]);
        assert!(spec.transformer.is_none());
        assert_eq!(spec.connection.weight, 1.0);
    }

    #[test]
    fn test_step_must_fit_the_resolution() {
        assert!(check_step(0.1, 0.1).is_ok());
        assert!(check_step(0.3, 0.1).is_ok());
        assert!(check_step(0.15, 0.1).is_err());
        assert!(check_step(0.05, 0.1).is_err());
        assert!(check_step(0.0, 0.1).is_err());
    }

    #[test]
    fn test_unconfigured_interface_refuses_to_run() {
        let config = CosimConfig::default();
        let mut input = InputInterface::new(CouplingSpec::new("E", &["E"], &[0]), &config).unwrap();
        let mut state = StateTensor::zeros((1, 1, 1));
        let err = input.write(&mut state, &Array2::zeros((1, 1))).unwrap_err();
        assert!(err.to_string().contains("spike_recorder: [E] (0)"));
    }
}
