//! # Multiscale CLI
//!
//! Command-line checks for co-simulation descriptions.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use multiscale_core::{
    extract_integer_intervals, init_tracing, summarize, unique_sorted, CosimConfig, ModelShape, RecordingMode,
    RegionIndex, RegionPartition, Summary,
};
use multiscale_interfaces::{CouplingSpec, InputInterfaces, Interface, InterfaceBuilder, OutputInterfaces};
use multiscale_spikenet::{DeviceKind, DeviceRole, DriveKind, Kernel, KernelParams, PopulationSpec, SpikingNetwork};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "multiscale")]
#[command(version = "0.1.0")]
#[command(about = "Mean-field / spiking co-simulation interfaces", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and configure every interface of a description
    Validate {
        /// JSON description
        file: PathBuf,
    },

    /// Validate, then print interfaces and aggregate views
    Describe {
        /// JSON description
        file: PathBuf,
    },

    /// List known device models
    List,
}

/// A co-simulation as read from JSON
#[derive(Debug, Deserialize)]
struct Description {
    model: ModelShape,
    spiking_nodes: Vec<RegionIndex>,
    /// Continuous-only nodes; every non-spiking region when absent
    #[serde(default)]
    continuous_nodes: Option<Vec<RegionIndex>>,
    populations: Vec<PopulationSpec>,
    #[serde(default)]
    output_interfaces: Vec<CouplingSpec>,
    #[serde(default)]
    input_interfaces: Vec<CouplingSpec>,
    #[serde(default)]
    config: CosimConfig,
    #[serde(default)]
    kernel: KernelParams,
}

struct Built {
    description: Description,
    partition: RegionPartition,
    outputs: OutputInterfaces,
    inputs: InputInterfaces,
    devices: usize,
}

fn load(path: &Path) -> anyhow::Result<Description> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut description: Description =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    description.config = description.config.with_env_overrides()?;
    Ok(description)
}

fn build(path: &Path) -> anyhow::Result<Built> {
    let mut description = load(path)?;
    init_tracing(&description.config.log_filter);

    if description.config.record_to == RecordingMode::Ascii && description.kernel.data_path.is_none() {
        description.kernel.data_path = Some(description.config.recordings_dir.clone());
    }
    let mut kernel = Kernel::init(description.kernel.clone())?;
    let shape = &description.model;
    // the builder checks the partition against `exclusive_nodes`
    let partition = match &description.continuous_nodes {
        Some(continuous) => RegionPartition {
            continuous_nodes: unique_sorted(continuous.iter().copied()),
            spiking_nodes: unique_sorted(description.spiking_nodes.iter().copied()),
        },
        None => RegionPartition::exclusive(shape.number_of_regions, &description.spiking_nodes)?,
    };
    let network = SpikingNetwork::build(&mut kernel, &partition.spiking_nodes, &description.populations)?;
    let neurons: usize = network.region_nodes.values().flat_map(|p| p.values()).map(|c| c.len()).sum();

    let (mut outputs, mut inputs) = InterfaceBuilder::new(&description.config, shape, &network, &partition).build(
        &description.output_interfaces,
        &description.input_interfaces,
        &mut kernel,
    )?;
    outputs.configure(shape, description.config.dt)?;
    inputs.configure(shape, description.config.dt)?;

    let devices = outputs
        .interfaces
        .iter()
        .map(|i| i.proxies.len())
        .chain(inputs.interfaces.iter().map(|i| i.proxies.len()))
        .sum();
    info!(neurons, devices, dt = description.config.dt, "description validated");
    Ok(Built {
        description,
        partition,
        outputs,
        inputs,
        devices,
    })
}

fn print_summary(built: &Built) {
    let shape = &built.description.model;
    println!(
        "  {} regions, {} state variables, {} coupling terms",
        shape.number_of_regions,
        shape.number_of_state_variables(),
        shape.coupling_terms.len()
    );
    println!(
        "  spiking nodes: {}",
        extract_integer_intervals(&built.partition.spiking_nodes).cyan()
    );
    println!(
        "  {} output / {} input interfaces, {} proxies",
        built.outputs.len(),
        built.inputs.len(),
        built.devices
    );
}

fn format_summary(summary: &Summary) -> String {
    match summary {
        Summary::Single(v) => format!("{}", v),
        Summary::Values(vs) | Summary::Rounded(vs) | Summary::Raw(vs) => format!("{:?}", vs),
        Summary::Stats { n, mean, min, max, var } => {
            format!("n={} mean={:.4} min={} max={} var={:.4}", n, mean, min, max, var)
        }
    }
}

fn describe(built: &Built) {
    print_summary(built);

    println!();
    println!("{}", "Continuous -> spiking:".green().bold());
    for interface in &built.outputs.interfaces {
        println!("  {} <- {}", interface.label().cyan(), interface.spec.voi.join(", "));
    }
    println!(
        "  populations {:?}, proxy nodes {:?}",
        built.outputs.populations_unique(),
        built.outputs.spiking_proxy_inds_unique()
    );

    println!();
    println!("{}", "Spiking -> continuous:".green().bold());
    for interface in &built.inputs.interfaces {
        let transformer = interface
            .role
            .transformer()
            .map(|t| format!(" via {}", t.name()))
            .unwrap_or_default();
        println!(
            "  {} -> {}{}",
            interface.label().cyan(),
            interface.spec.voi.join(", "),
            transformer
        );
    }
    for (voi, nodes) in built.inputs.spikenet_to_tvb_params() {
        println!("  {} <- nodes {}", voi, extract_integer_intervals(&nodes));
    }

    let scales: Vec<f64> = built
        .outputs
        .interfaces
        .iter()
        .map(|i| &i.spec.scale)
        .chain(built.inputs.interfaces.iter().map(|i| &i.spec.scale))
        .flatten()
        .copied()
        .collect();
    println!();
    println!("  scales: {}", format_summary(&summarize(&scales, Some(3))));
}

fn list() {
    println!("{}", "Stimulating devices:".green().bold());
    for kind in DeviceKind::ALL {
        let class = match kind.role() {
            DeviceRole::Stimulating(DriveKind::Current) => "current",
            DeviceRole::Stimulating(DriveKind::Rate) => "rate",
            DeviceRole::Stimulating(DriveKind::SpikeTimes) => "spike times",
            DeviceRole::Recording => continue,
        };
        println!("  {} - {}", kind.name().cyan(), class);
    }
    println!();
    println!("{}", "Recording devices:".green().bold());
    for kind in DeviceKind::ALL.iter().filter(|k| k.is_recording()) {
        println!("  {}", kind.name().cyan());
    }
    println!();
    println!("{}", "Aliases:".green().bold());
    println!("  {} / {} - default output device, or spike_recorder for inputs", "RATE".cyan(), "spike_rate".cyan());
    println!("  {} - dc_generator", "CURRENT".cyan());
    println!("  {} - spike_recorder", "SPIKES".cyan());
    println!("  {} - voltmeter", "POTENTIAL".cyan());
    println!("  {} / {} - I_e / V_m set on neurons from coupling", "current".cyan(), "potential".cyan());
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            println!("{} {}", "Validating:".green().bold(), file.display());
            let built = build(&file)?;
            print_summary(&built);
            println!("{}", "OK".green().bold());
        }

        Commands::Describe { file } => {
            println!("{} {}", "Describing:".green().bold(), file.display());
            let built = build(&file)?;
            describe(&built);
        }

        Commands::List => list(),
    }

    Ok(())
}
