// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! devsplit command-line driver: place a `dfg@1` graph on devices and split it
//! into per-device functions.

use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use devsplit::config::{load_config, PartitionConfig};
use devsplit::device::{parse_device_name, DeviceKind, ALL_DEVICES};
use devsplit::diagnostics::{ColorChoice, DiagnosticEmitter, DiagnosticFormat};
use devsplit::ir::emit_graph;
use devsplit::pipeline::{check_source, partition_source, PartitionOptions, PartitionProducts};

#[derive(Parser, Debug)]
#[command(author, version, about = None, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the device catalog.
    Devices,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// The input graph with every op annotated with its device.
    Placed,
    /// One function per used device.
    Partitions,
    /// Per-device instruction counts and the transfer table.
    Summary,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Input .dfg file.
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,
    /// TOML configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Primary device (cpu|gpu|tpu or a full identifier); overrides the config.
    #[arg(long, value_name = "DEV")]
    primary: Option<String>,
    /// Device placement may add when no used device runs an op. Repeatable.
    #[arg(long, value_name = "DEV")]
    fallback: Vec<String>,
    /// Feed host values to a TPU primary through its infeed queue.
    #[arg(long)]
    infeed: bool,
    /// What to print on success.
    #[arg(long, value_enum, default_value = "partitions")]
    emit: Emit,
    /// Only parse and verify the input graph.
    #[arg(long)]
    verify_only: bool,
    /// Diagnostic output format (human|short|json).
    #[arg(long, value_name = "FORMAT", default_value = "human")]
    diagnostic_format: String,
    /// ANSI color handling (auto|always|never).
    #[arg(long, value_name = "WHEN")]
    color: Option<String>,
    /// Log placement and transfer decisions. Repeat for more detail.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.run.verbose);

    if let Some(Command::Devices) = &cli.command {
        print_devices();
        return;
    }

    let input = match &cli.run.input {
        Some(path) => path.clone(),
        None => {
            eprintln!("error[cli]: expected an input file or subcommand");
            process::exit(1);
        }
    };
    let display_name = input.display().to_string();

    let diagnostic_format =
        DiagnosticFormat::parse(&cli.run.diagnostic_format).unwrap_or(DiagnosticFormat::Human);
    let emitter = DiagnosticEmitter::new(diagnostic_format, resolve_color_choice(&cli.run.color));

    let (opts, config) = match resolve_options(&cli.run) {
        Ok(resolved) => resolved,
        Err(err) => {
            eprintln!("error[config]: {err:#}");
            process::exit(1);
        }
    };

    let source = match fs::read_to_string(&input) {
        Ok(src) => src,
        Err(err) => {
            eprintln!("failed to read {display_name}: {err}");
            process::exit(1);
        }
    };

    if cli.run.verify_only {
        if let Err(err) = check_source(&source) {
            emitter.emit_all(&err.into_diagnostics(Some(&display_name)), Some(&source));
            process::exit(1);
        }
        return;
    }

    let mut transfer_ids = config.transfer_ids();
    let products = match partition_source(&source, &opts, &mut transfer_ids) {
        Ok(products) => products,
        Err(err) => {
            emitter.emit_all(&err.into_diagnostics(Some(&display_name)), Some(&source));
            process::exit(1);
        }
    };

    match cli.run.emit {
        Emit::Placed => print!("{}", emit_graph(&products.placed)),
        Emit::Partitions => print_partitions(&products),
        Emit::Summary => print_summary(&products),
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

/// Config file first, then command-line overrides.
fn resolve_options(args: &RunArgs) -> anyhow::Result<(PartitionOptions, PartitionConfig)> {
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => PartitionConfig::default(),
    };
    let mut opts = PartitionOptions::from_config(&config).context("invalid device in config")?;

    if let Some(raw) = &args.primary {
        opts.primary =
            parse_device_name(raw).with_context(|| format!("invalid --primary '{raw}'"))?;
    }
    if args.infeed {
        opts.infeed_enabled = true;
    }
    if !args.fallback.is_empty() {
        opts.fallbacks = args
            .fallback
            .iter()
            .map(|raw| {
                parse_device_name(raw).with_context(|| format!("invalid --fallback '{raw}'"))
            })
            .collect::<anyhow::Result<_>>()?;
    }
    Ok((opts, config))
}

fn print_devices() {
    for kind in DeviceKind::ALL {
        println!("{:<4} {}", kind.short_name(), kind.identifier());
    }
    println!("{:<4} {}", "ALL", ALL_DEVICES);
}

fn print_partitions(products: &PartitionProducts) {
    let mut first = true;
    for function in &products.partition.functions {
        if !first {
            println!();
        }
        first = false;
        print!("{}", emit_graph(&function.graph));
    }
}

fn print_summary(products: &PartitionProducts) {
    println!("graph {}", products.placed.name);
    println!("primary {}", products.devices.primary().short_name());
    let infeed = if products.devices.is_infeed_enabled() { "on" } else { "off" };
    println!("infeed {infeed}");
    for function in &products.partition.functions {
        println!(
            "function {} ops={} transfers={}",
            function.name(),
            function.op_count(),
            function.transfer_count()
        );
    }
    for record in &products.partition.transfers {
        println!(
            "transfer {} {} {} -> {} as {}",
            record.id,
            record.value,
            record.from.short_name(),
            record.to.short_name(),
            record.received_as
        );
    }
}

fn resolve_color_choice(flag: &Option<String>) -> ColorChoice {
    if let Some(value) = flag.as_deref() {
        return ColorChoice::parse(value).unwrap_or(ColorChoice::Auto);
    }
    if let Ok(env) = std::env::var("DEVSPLIT_COLOR") {
        return ColorChoice::parse(&env).unwrap_or(ColorChoice::Auto);
    }
    ColorChoice::Auto
}
