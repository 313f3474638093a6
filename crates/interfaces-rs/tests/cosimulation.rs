//! End-to-end co-simulation scenarios against the reference kernel and a
//! loopback backend that echoes every stimulus into the recorders.

use multiscale_core::{
    ContinuousSimulator, CosimConfig, ModelShape, RecordingMode, RegionPartition, StateTensor, Time,
};
use multiscale_interfaces::{
    CoSimulator, CouplingSpec, InputInterfaces, InterfaceBuilder, InterfaceError, OutputInterfaces, ProxyHandle,
};
use multiscale_spikenet::{
    Connection, ConnectionSpec, DeviceKind, DeviceModel, Events, IafParams, Kernel, KernelParams, NeuronModel,
    NodeCollection, NodeId, PopulationSpec, ProxyDevice, Result as SpikeNetResult, SpikeNetError, SpikingBackend,
    SpikingNetwork, Status, Value,
};
use multiscale_transformers::{RedWongWangParams, TransformerModel};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

// ============================================================================
// FIXTURES
// ============================================================================

/// `E`, `I` relaxing towards zero; coupling mirrors `E`.
struct Decay {
    shape: ModelShape,
    state: StateTensor,
    coupling: StateTensor,
    time: Time,
    dt: Time,
}

impl Decay {
    fn new(n_regions: usize, e0: f64) -> Self {
        let shape = ModelShape::new(&["E", "I"], &["E"], n_regions);
        let mut state = StateTensor::zeros(shape.state_dim());
        let mut coupling = StateTensor::zeros((1, n_regions, 1));
        for r in 0..n_regions {
            state[[0, r, 0]] = e0;
            coupling[[0, r, 0]] = e0;
        }
        Self {
            shape,
            state,
            coupling,
            time: 0.0,
            dt: 0.1,
        }
    }
}

impl ContinuousSimulator for Decay {
    fn shape(&self) -> ModelShape {
        self.shape.clone()
    }

    fn dt(&self) -> Time {
        self.dt
    }

    fn time(&self) -> Time {
        self.time
    }

    fn state(&self) -> &StateTensor {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StateTensor {
        &mut self.state
    }

    fn coupling(&self) -> &StateTensor {
        &self.coupling
    }

    fn integrate_step(&mut self) -> multiscale_core::Result<()> {
        let factor = 1.0 - 0.1 * self.dt;
        self.state.mapv_inplace(|x| x * factor);
        for r in 0..self.shape.number_of_regions {
            self.coupling[[0, r, 0]] = self.state[[0, r, 0]];
        }
        self.time += self.dt;
        Ok(())
    }
}

/// Backend whose meters sample, per neuron, the sum of the values driven
/// into that neuron by stimulating devices.
struct Loopback {
    time: Time,
    live: bool,
    next_id: NodeId,
    neurons: BTreeSet<NodeId>,
    devices: BTreeMap<NodeId, (DeviceModel, Status, Events)>,
    connections: Vec<Connection>,
}

impl Loopback {
    fn new() -> Self {
        Self {
            time: 0.0,
            live: true,
            next_id: 1,
            neurons: BTreeSet::new(),
            devices: BTreeMap::new(),
            connections: vec![],
        }
    }

    fn check(&self) -> SpikeNetResult<()> {
        if self.live {
            Ok(())
        } else {
            Err(SpikeNetError::NoBackend)
        }
    }

    fn drive_of(status: &Status) -> f64 {
        for key in ["rate_values", "amplitude_values"] {
            if let Some(last) = status.get(key).and_then(Value::as_numbers).and_then(|v| v.last()) {
                return *last;
            }
        }
        ["rate", "amplitude"]
            .iter()
            .find_map(|key| status.get(*key).and_then(Value::as_number))
            .unwrap_or(0.0)
    }
}

impl SpikingBackend for Loopback {
    fn name(&self) -> &str {
        "loopback"
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn resolution(&self) -> Time {
        0.1
    }

    fn min_delay(&self) -> Time {
        0.1
    }

    fn time(&self) -> Time {
        self.time
    }

    fn data_path(&self) -> Option<&Path> {
        None
    }

    fn create_neurons(&mut self, _model: &NeuronModel, n: usize) -> SpikeNetResult<NodeCollection> {
        self.check()?;
        let ids: Vec<NodeId> = (self.next_id..self.next_id + n).collect();
        self.next_id += n;
        self.neurons.extend(ids.iter().copied());
        Ok(NodeCollection::new(ids))
    }

    fn create_device(&mut self, model: &DeviceModel, _label: &str) -> SpikeNetResult<NodeId> {
        self.check()?;
        let id = self.next_id;
        self.next_id += 1;
        let events = Events::with_variables(&model.record_from());
        self.devices.insert(id, (model.clone(), Status::new(), events));
        Ok(id)
    }

    fn connect(
        &mut self,
        sources: &NodeCollection,
        targets: &NodeCollection,
        spec: &ConnectionSpec,
    ) -> SpikeNetResult<()> {
        self.check()?;
        for &source in &sources.ids {
            for &target in &targets.ids {
                self.connections.push(Connection {
                    source,
                    target,
                    weight: spec.weight,
                    delay: spec.delay,
                    synapse_model: spec.synapse_model.clone(),
                    receptor: spec.receptor.clone(),
                });
            }
        }
        Ok(())
    }

    fn get_connections(
        &self,
        source: Option<&NodeCollection>,
        target: Option<&NodeCollection>,
    ) -> SpikeNetResult<Vec<Connection>> {
        self.check()?;
        Ok(self
            .connections
            .iter()
            .filter(|c| source.map_or(true, |s| s.contains(c.source)))
            .filter(|c| target.map_or(true, |t| t.contains(c.target)))
            .cloned()
            .collect())
    }

    fn set(&mut self, nodes: &NodeCollection, values: &Status) -> SpikeNetResult<()> {
        self.check()?;
        for id in &nodes.ids {
            if let Some((_, status, _)) = self.devices.get_mut(id) {
                status.extend(values.clone());
            } else if !self.neurons.contains(id) {
                return Err(SpikeNetError::NodeNotFound(*id));
            }
        }
        Ok(())
    }

    fn get(&self, nodes: &NodeCollection, _attrs: &[&str]) -> SpikeNetResult<Vec<Status>> {
        self.check()?;
        nodes
            .ids
            .iter()
            .map(|id| {
                self.devices
                    .get(id)
                    .map(|(_, status, _)| status.clone())
                    .ok_or(SpikeNetError::NodeNotFound(*id))
            })
            .collect()
    }

    fn get_events(&self, device: NodeId) -> SpikeNetResult<Events> {
        self.check()?;
        self.devices
            .get(&device)
            .map(|(_, _, events)| events.clone())
            .ok_or(SpikeNetError::NodeNotFound(device))
    }

    fn clear_events(&mut self, device: NodeId) -> SpikeNetResult<()> {
        self.check()?;
        let (_, _, events) = self
            .devices
            .get_mut(&device)
            .ok_or(SpikeNetError::NodeNotFound(device))?;
        events.clear();
        Ok(())
    }

    fn simulate(&mut self, time: Time) -> SpikeNetResult<()> {
        self.check()?;
        self.time += time;
        let mut drive: BTreeMap<NodeId, f64> = BTreeMap::new();
        for c in &self.connections {
            if let Some((model, status, _)) = self.devices.get(&c.source) {
                if !model.kind().is_recording() {
                    *drive.entry(c.target).or_default() += Self::drive_of(status);
                }
            }
        }
        let mut samples = vec![];
        for c in &self.connections {
            if let Some((model, _, _)) = self.devices.get(&c.source) {
                let record_from = model.record_from();
                if !record_from.is_empty() {
                    let value = drive.get(&c.target).copied().unwrap_or(0.0);
                    let sample: Vec<(String, f64)> = record_from.into_iter().map(|v| (v, value)).collect();
                    samples.push((c.source, c.target, sample));
                }
            }
        }
        for (gid, neuron, sample) in samples {
            if let Some((_, _, events)) = self.devices.get_mut(&gid) {
                events.record_sample(self.time, neuron, &sample);
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.live = false;
    }
}

fn excitatory(size: usize) -> Vec<PopulationSpec> {
    vec![PopulationSpec {
        label: "E".into(),
        model: NeuronModel::IafCondAlpha(IafParams::default()),
        size,
    }]
}

fn kernel(config: &CosimConfig) -> Kernel {
    Kernel::init(KernelParams {
        data_path: Some(config.recordings_dir.clone()),
        ..Default::default()
    })
    .unwrap()
}

struct Setup<B: SpikingBackend> {
    backend: B,
    network: SpikingNetwork,
    outputs: OutputInterfaces,
    inputs: InputInterfaces,
}

fn build<B: SpikingBackend>(
    mut backend: B,
    config: &CosimConfig,
    n_regions: usize,
    spiking: &[usize],
    population_size: usize,
    outputs: &[CouplingSpec],
    inputs: &[CouplingSpec],
) -> Result<Setup<B>, InterfaceError> {
    let shape = Decay::new(n_regions, 0.0).shape();
    let partition = RegionPartition::exclusive(n_regions, spiking)?;
    let network = SpikingNetwork::build(&mut backend, &partition.spiking_nodes, &excitatory(population_size))?;
    let (outputs, inputs) =
        InterfaceBuilder::new(config, &shape, &network, &partition).build(outputs, inputs, &mut backend)?;
    Ok(Setup {
        backend,
        network,
        outputs,
        inputs,
    })
}

fn first_device(handle: &ProxyHandle) -> &ProxyDevice {
    match handle {
        ProxyHandle::Device(device) => device,
        ProxyHandle::Neurons(_) => panic!("expected a device proxy"),
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn zero_spikes_write_back_zero() {
    let dir = tempfile::tempdir().unwrap();
    let config = CosimConfig {
        recordings_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let n = 100;
    let outputs = [CouplingSpec::new("E", &["E"], &[0, 1]).with_model("RATE").with_scale(1.0)];
    let inputs = [CouplingSpec::new("E", &["E"], &[0, 1])
        .with_model("spike_recorder")
        .with_scale(1e-4 / n as f64)];
    let setup = build(kernel(&config), &config, 4, &[0, 1], n, &outputs, &inputs).unwrap();

    let mut cosim = CoSimulator::new(Decay::new(4, 0.5), setup.backend, setup.outputs, setup.inputs);
    cosim.configure().unwrap();
    cosim.step().unwrap();

    let state = cosim.simulator.state();
    assert_eq!(state[[0, 0, 0]], 0.0);
    assert_eq!(state[[0, 1, 0]], 0.0);
    assert!(state[[0, 2, 0]] > 0.0);
    assert!(state[[0, 3, 0]] > 0.0);

    // the rate device saw the state before integration, scale 1
    let device = first_device(&cosim.outputs.interfaces[0].proxies[0].handle);
    let status = device.get(&cosim.backend, &["rate_values"]).unwrap();
    assert_eq!(status["rate_values"], Value::Numbers(vec![0.5]));
}

fn spikes_are_counted_once(record_to: RecordingMode) {
    let dir = tempfile::tempdir().unwrap();
    let config = CosimConfig {
        recordings_dir: dir.path().to_path_buf(),
        record_to,
        ..Default::default()
    };
    let inputs = [CouplingSpec::new("E", &["E"], &[0, 1])
        .with_model("spike_recorder")
        .with_scale(1e-4 / 100.0)];
    let setup = build(kernel(&config), &config, 2, &[0, 1], 100, &[], &inputs).unwrap();
    let node1 = setup.network.population(1, "E").unwrap().clone();

    let mut cosim = CoSimulator::new(Decay::new(2, 0.5), setup.backend, setup.outputs, setup.inputs);
    cosim.configure().unwrap();

    cosim.backend.inject_spikes(&node1.ids[..3], &[0.05, 0.05, 0.05]).unwrap();
    cosim.step().unwrap();
    let state = cosim.simulator.state();
    assert_eq!(state[[0, 0, 0]], 0.0);
    assert!((state[[0, 1, 0]] - 3.0 * 1e-6).abs() < 1e-12);

    cosim.step().unwrap();
    assert_eq!(cosim.simulator.state()[[0, 1, 0]], 0.0);
}

#[test]
fn spikes_are_counted_once_in_memory() {
    spikes_are_counted_once(RecordingMode::Memory);
}

#[test]
fn spikes_are_counted_once_in_ascii_files() {
    spikes_are_counted_once(RecordingMode::Ascii);
}

#[test]
fn loopback_round_trip_is_identity() {
    let config = CosimConfig::default();
    let outputs = [CouplingSpec::new("E", &["E"], &[0, 1])
        .with_model("dc_generator")
        .with_transformer(TransformerModel::identity())];
    let inputs = [CouplingSpec::new("I", &["E"], &[0, 1])
        .with_model("multimeter")
        .with_proxy_param("record_from", Value::Texts(vec!["drive".into()]))];
    let setup = build(Loopback::new(), &config, 3, &[0, 1], 10, &outputs, &inputs).unwrap();

    let mut decay = Decay::new(3, 0.0);
    decay.state[[0, 0, 0]] = 0.3;
    decay.state[[0, 1, 0]] = 0.7;
    let mut cosim = CoSimulator::new(decay, setup.backend, setup.outputs, setup.inputs);
    cosim.configure().unwrap();
    cosim.step().unwrap();

    let state = cosim.simulator.state();
    assert!((state[[1, 0, 0]] - 0.3).abs() < 1e-12);
    assert!((state[[1, 1, 0]] - 0.7).abs() < 1e-12);
    assert_eq!(state[[1, 2, 0]], 0.0);
}

#[test]
fn configure_is_idempotent() {
    let config = CosimConfig::default();
    let outputs = [
        CouplingSpec::new("E", &["E"], &[0, 1]),
        CouplingSpec::new("E", &["E"], &[1, 2]).with_model("CURRENT"),
    ];
    let inputs = [CouplingSpec::new("E", &["E"], &[0, 2])];
    let setup = build(Loopback::new(), &config, 4, &[0, 1, 2], 5, &outputs, &inputs).unwrap();
    let mut cosim = CoSimulator::new(Decay::new(4, 0.1), setup.backend, setup.outputs, setup.inputs);

    cosim.configure().unwrap();
    let views = (
        cosim.outputs.populations_unique(),
        cosim.outputs.spiking_proxy_inds_unique(),
        cosim.inputs.spikenet_to_tvb_params(),
        cosim.outputs.labels(),
    );
    let devices = cosim.backend.devices.len();
    cosim.configure().unwrap();
    assert_eq!(
        views,
        (
            cosim.outputs.populations_unique(),
            cosim.outputs.spiking_proxy_inds_unique(),
            cosim.inputs.spikenet_to_tvb_params(),
            cosim.outputs.labels(),
        )
    );
    assert_eq!(cosim.backend.devices.len(), devices);
}

#[test]
fn aggregate_views_are_set_unions() {
    let config = CosimConfig::default();
    let outputs = [
        CouplingSpec::new("E", &["E"], &[0, 1, 2]),
        CouplingSpec::new("E", &["E"], &[2, 3]),
    ];
    let inputs = [
        CouplingSpec::new("E", &["E"], &[3]),
        CouplingSpec::new("I", &["E"], &[1, 0]),
    ];
    let setup = build(Loopback::new(), &config, 5, &[0, 1, 2, 3], 5, &outputs, &inputs);
    // unsorted proxy nodes are rejected
    assert!(matches!(setup, Err(InterfaceError::Configuration { .. })));

    let inputs = [CouplingSpec::new("E", &["E"], &[3]), CouplingSpec::new("I", &["E"], &[0, 1])];
    let setup = build(Loopback::new(), &config, 5, &[0, 1, 2, 3], 5, &outputs, &inputs).unwrap();
    assert_eq!(setup.outputs.spiking_proxy_inds(), vec![0, 1, 2, 2, 3]);
    assert_eq!(setup.outputs.spiking_proxy_inds_unique(), vec![0, 1, 2, 3]);
    assert_eq!(setup.outputs.number_of_spiking_proxy_nodes(), 4);
    assert_eq!(setup.outputs.populations_unique(), vec!["E".to_string()]);
    assert_eq!(setup.outputs.number_of_populations(), 1);

    let params = setup.inputs.spikenet_to_tvb_params();
    assert_eq!(params["E"], vec![3]);
    assert_eq!(params["I"], vec![0, 1]);
}

#[test]
fn unknown_model_fails_before_any_device_exists() {
    let config = CosimConfig::default();
    let outputs = [CouplingSpec::new("E", &["E"], &[0, 1])];
    let inputs = [CouplingSpec::new("E", &["E"], &[0, 1]).with_model("nonexistent_device")];

    let mut backend = Loopback::new();
    let shape = Decay::new(2, 0.0).shape();
    let partition = RegionPartition::exclusive(2, &[0, 1]).unwrap();
    let network = SpikingNetwork::build(&mut backend, &[0, 1], &excitatory(10)).unwrap();
    let err = InterfaceBuilder::new(&config, &shape, &network, &partition)
        .build(&outputs, &inputs, &mut backend)
        .unwrap_err();

    match &err {
        InterfaceError::Configuration { interface, message } => {
            assert_eq!(interface, "nonexistent_device: [E] (0-1)");
            assert!(message.contains("nonexistent_device"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(backend.devices.is_empty());
}

#[test]
fn input_target_must_be_a_state_variable() {
    let config = CosimConfig::default();
    let inputs = [CouplingSpec::new("X", &["E"], &[0])];
    let err = build(Loopback::new(), &config, 2, &[0], 5, &[], &inputs)
        .err()
        .unwrap();
    assert!(err.to_string().contains("X is not a state variable slot"));
    assert!(err.to_string().contains("spike_recorder: [E] (0)"));
}

#[test]
fn population_must_exist_at_every_proxy_node() {
    let config = CosimConfig::default();
    let outputs = [CouplingSpec::new("E", &["I"], &[0])];
    let err = build(Loopback::new(), &config, 2, &[0], 5, &outputs, &[]).err().unwrap();
    assert!(err.to_string().contains("population I does not exist at node 0"));
}

#[test]
fn proxy_nodes_must_be_spiking_nodes() {
    let config = CosimConfig::default();
    let outputs = [CouplingSpec::new("E", &["E"], &[0, 1])];
    let err = build(Loopback::new(), &config, 3, &[0], 5, &outputs, &[]).err().unwrap();
    assert!(err.to_string().contains("node 1 is not a spiking node"));
}

#[test]
fn gating_transformer_respects_its_domain() {
    let config = CosimConfig::default();
    let inputs = [CouplingSpec::new("E", &["E"], &[0, 1])
        .with_vois(&["E", "I"])
        .with_model("spike_recorder")
        .with_transformer(TransformerModel::RedWongWangExc(RedWongWangParams {
            number_of_neurons: 100.0,
            ..Default::default()
        }))];
    let setup = build(kernel(&config), &config, 2, &[0, 1], 100, &[], &inputs).unwrap();
    let node0 = setup.network.population(0, "E").unwrap().clone();
    let mut cosim = CoSimulator::new(Decay::new(2, 0.5), setup.backend, setup.outputs, setup.inputs);
    cosim.configure().unwrap();

    for step in 0..20 {
        let t = step as f64 * 0.1 + 0.05;
        cosim.backend.inject_spikes(&node0.ids, &vec![t; node0.len()]).unwrap();
        cosim.step().unwrap();
        let state = cosim.simulator.state();
        for node in 0..2 {
            let (s, r) = (state[[0, node, 0]], state[[1, node, 0]]);
            assert!((0.0..=1.0).contains(&s));
            assert!(r >= 0.0);
        }
    }
    let state = cosim.simulator.state();
    assert!(state[[1, 0, 0]] > 0.0);
    assert_eq!(state[[1, 1, 0]], 0.0);
}

#[test]
fn gating_steps_with_the_outer_loop() {
    let config = CosimConfig {
        dt: 0.5,
        ..Default::default()
    };
    let inputs = [CouplingSpec::new("E", &["E"], &[0])
        .with_vois(&["E", "I"])
        .with_transformer(TransformerModel::RedWongWangExc(RedWongWangParams {
            number_of_neurons: 100.0,
            ..Default::default()
        }))];
    let setup = build(kernel(&config), &config, 1, &[0], 100, &[], &inputs).unwrap();
    let node0 = setup.network.population(0, "E").unwrap().clone();
    let mut decay = Decay::new(1, 0.0);
    decay.dt = 0.5;
    let mut cosim = CoSimulator::new(decay, setup.backend, setup.outputs, setup.inputs);
    cosim.configure().unwrap();

    cosim.backend.inject_spikes(&node0.ids, &vec![0.2; node0.len()]).unwrap();
    cosim.step().unwrap();

    // 100 spikes of 100 neurons over 0.5 ms, one Heun step of 0.5 ms from rest
    let state = cosim.simulator.state();
    let gamma = 0.641 / 1000.0;
    assert!((state[[1, 0, 0]] - 0.25 * (0.2 + 0.19)).abs() < 1e-12);
    assert!((state[[0, 0, 0]] - 0.25 * 0.1 * gamma).abs() < 1e-12);
}

#[test]
fn interfaces_keep_the_step_they_were_built_for() {
    let config = CosimConfig::default();
    let outputs = [CouplingSpec::new("E", &["E"], &[0])];
    let setup = build(Loopback::new(), &config, 1, &[0], 5, &outputs, &[]).unwrap();
    let mut decay = Decay::new(1, 0.0);
    decay.dt = 0.2;
    let mut cosim = CoSimulator::new(decay, setup.backend, setup.outputs, setup.inputs);

    let err = cosim.configure().unwrap_err();
    assert!(err.to_string().contains("configured for dt 0.1, asked for dt 0.2"));
    assert!(cosim.step().is_err());

    let off_grid = CosimConfig {
        dt: 0.15,
        ..Default::default()
    };
    let err = build(Loopback::new(), &off_grid, 1, &[0], 5, &outputs, &[]).err().unwrap();
    assert!(err.to_string().contains("not a multiple of the spiking resolution"));
}

#[test]
fn spike_train_transformers_need_spike_recorders() {
    let config = CosimConfig::default();
    let cases = [
        ("POTENTIAL", TransformerModel::SpikesHistogramRate(Default::default()), &["E"][..]),
        ("multimeter", TransformerModel::SpikesKernelRate(Default::default()), &["E"][..]),
        ("spike_multimeter", TransformerModel::RedWongWangExc(Default::default()), &["E", "I"][..]),
    ];
    for (model, transformer, vois) in cases {
        let inputs = [CouplingSpec::new("E", &["E"], &[0])
            .with_vois(vois)
            .with_model(model)
            .with_transformer(transformer)];
        let err = build(Loopback::new(), &config, 1, &[0], 5, &[], &inputs).err().unwrap();
        assert!(matches!(err, InterfaceError::Configuration { .. }), "{}: {:?}", model, err);
        assert!(err.to_string().contains("needs spike times from a spike_recorder"));
    }

    // a linear stage reads any recorder
    let inputs = [CouplingSpec::new("E", &["E"], &[0])
        .with_model("POTENTIAL")
        .with_transformer(TransformerModel::identity())];
    assert!(build(Loopback::new(), &config, 1, &[0], 5, &[], &inputs).is_ok());
}

#[test]
fn current_parameter_comes_from_coupling() {
    let config = CosimConfig::default();
    let outputs = [CouplingSpec::new("E", &["E"], &[0]).with_model("current").with_scale(2.0)];
    let setup = build(kernel(&config), &config, 2, &[0], 3, &outputs, &[]).unwrap();
    let neurons = setup.network.population(0, "E").unwrap().clone();
    let mut cosim = CoSimulator::new(Decay::new(2, 1.25), setup.backend, setup.outputs, setup.inputs);
    cosim.configure().unwrap();
    cosim.step().unwrap();

    for status in cosim.backend.get(&neurons, &["I_e"]).unwrap() {
        assert_eq!(status["I_e"], Value::Number(2.5));
    }
}

#[test]
fn write_payload_follows_scale() {
    let config = CosimConfig::default();
    let inputs = [CouplingSpec::new("I", &["E"], &[0, 1]).with_scale(0.5)];
    let mut setup = build(Loopback::new(), &config, 2, &[0, 1], 5, &[], &inputs).unwrap();
    let mut decay = Decay::new(2, 0.0);
    setup.inputs.configure(&decay.shape(), decay.dt()).unwrap();

    let payload = ndarray::array![[4.0, 8.0]];
    let written = setup.inputs.write(decay.state_mut(), &[payload]).unwrap();
    assert_eq!(written[0], ndarray::array![[2.0, 4.0]]);
    assert_eq!(decay.state()[[1, 1, 0]], 4.0);
}

#[test]
fn reset_is_idempotent_on_empty_devices() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = Kernel::init(KernelParams {
        data_path: Some(dir.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap();
    for record_to in [RecordingMode::Memory, RecordingMode::Ascii] {
        let device =
            ProxyDevice::create(&mut backend, DeviceKind::SpikeRecorder.default_model(record_to), "empty").unwrap();
        for _ in 0..2 {
            device.reset(&mut backend).unwrap();
            assert!(device.read_events(&backend).unwrap().is_empty());
        }
    }
}

#[test]
fn backend_errors_name_the_device() {
    let config = CosimConfig::default();
    let outputs = [CouplingSpec::new("E", &["E"], &[0, 1])];
    let setup = build(kernel(&config), &config, 2, &[0, 1], 5, &outputs, &[]).unwrap();
    let mut cosim = CoSimulator::new(Decay::new(2, 0.5), setup.backend, setup.outputs, setup.inputs);
    cosim.configure().unwrap();
    cosim.backend.shutdown();

    let err = cosim.step().unwrap_err();
    assert!(matches!(err, InterfaceError::Backend { .. }));
    assert!(err.to_string().contains("inhomogeneous_poisson_generator"));
}

#[test]
fn step_requires_configure() {
    let config = CosimConfig::default();
    let setup = build(Loopback::new(), &config, 1, &[0], 5, &[], &[]).unwrap();
    let mut cosim = CoSimulator::new(Decay::new(1, 0.0), setup.backend, setup.outputs, setup.inputs);
    assert!(cosim.step().is_err());
    cosim.configure().unwrap();
    cosim.run(3).unwrap();
    assert_eq!(cosim.steps(), 3);
    let (_, backend) = cosim.shutdown();
    assert!(!backend.is_live());
}
