//! wsim: synthetic GPU workload simulator
//!
//! Replays workload descriptors from one or more concurrent clients against
//! a device backend and reports throughput.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use clap::{ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser};
use wsim::config::Config;
use wsim::device::{open_device, DeviceCaps};
use wsim::parser::{load_descriptor, parse_steps, Step};
use wsim::scheduler::{self, RunOptions};
use wsim::workload::Workload;

/// Synthetic GPU workload simulator
///
/// Descriptors are given inline or as a file with one step per line.
///
/// Examples:
///   wsim -w '1.RCS.1000-2000.0.0,1.BCS.500.-1.1' -r 10
///   wsim -c 4 -w workload.wsim -v
///   wsim -W master.wsim -p -512 -w background.wsim
#[derive(Parser, Debug)]
#[command(name = "wsim")]
#[command(version, about, verbatim_doc_comment)]
struct Cli {
    /// Workload descriptor (repeatable)
    #[arg(short = 'w', value_name = "DESC", action = ArgAction::Append)]
    workloads: Vec<String>,

    /// Master workload; every other client runs until it finishes
    #[arg(short = 'W', value_name = "DESC", action = ArgAction::Append)]
    master: Vec<String>,

    /// Workload appended to every other workload
    #[arg(short = 'a', value_name = "DESC", action = ArgAction::Append)]
    append: Vec<String>,

    /// Context priority for the workloads that follow
    #[arg(short = 'p', value_name = "PRIO", action = ArgAction::Append, allow_negative_numbers = true)]
    priorities: Vec<i32>,

    /// Toggle a single-slice partition for the workloads that follow
    #[arg(
        short = 's',
        action = ArgAction::Append,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    reduced_partition: Vec<bool>,

    /// Iterations per client
    #[arg(short = 'r', value_name = "N", default_value_t = 1)]
    repeat: u32,

    /// Cloned clients of a single workload
    #[arg(short = 'c', value_name = "N", default_value_t = 1)]
    clients: usize,

    /// Scale factor for work durations
    #[arg(short = 'f', value_name = "SCALE", default_value_t = 1.0)]
    duration_scale: f64,

    /// Scale factor for delays and periods
    #[arg(short = 'F', value_name = "SCALE", default_value_t = 1.0)]
    delay_scale: f64,

    /// Give every client the same random streams
    #[arg(short = 'S')]
    sync_rng: bool,

    /// Wait for data dependencies before submitting
    #[arg(short = 'd')]
    dep_sync: bool,

    /// Initial random seed
    #[arg(short = 'I', value_name = "SEED")]
    seed: Option<u64>,

    /// Print nothing but errors
    #[arg(short = 'q')]
    quiet: bool,

    /// More output (repeatable)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Device backend
    #[arg(long, default_value = "sim")]
    device: String,

    /// Print the engine topology and exit
    #[arg(long)]
    list_engines: bool,

    /// Print a sample configuration file and exit
    #[arg(long)]
    print_config: bool,
}

/// One `-w`/`-W` argument with the options in effect where it appeared.
#[derive(Debug, Clone, PartialEq)]
struct WorkloadArg {
    desc: String,
    priority: i32,
    reduced_partition: bool,
    master: bool,
}

enum ArgEvent<'a> {
    Workload { desc: &'a str, master: bool },
    Priority(i32),
    TogglePartition,
}

/// Resolve `-p` and `-s` against the workload arguments they precede.
fn workload_args(cli: &Cli, matches: &ArgMatches) -> Vec<WorkloadArg> {
    let indices = |id: &str| -> Vec<usize> { matches.indices_of(id).map(|i| i.collect()).unwrap_or_default() };

    let mut events: Vec<(usize, ArgEvent<'_>)> = Vec::new();
    for (index, desc) in indices("workloads").into_iter().zip(&cli.workloads) {
        events.push((index, ArgEvent::Workload { desc, master: false }));
    }
    for (index, desc) in indices("master").into_iter().zip(&cli.master) {
        events.push((index, ArgEvent::Workload { desc, master: true }));
    }
    for (index, &prio) in indices("priorities").into_iter().zip(&cli.priorities) {
        events.push((index, ArgEvent::Priority(prio)));
    }
    for (index, _) in indices("reduced_partition")
        .into_iter()
        .zip(&cli.reduced_partition)
        .filter(|(_, toggle)| **toggle)
    {
        events.push((index, ArgEvent::TogglePartition));
    }
    events.sort_by_key(|(index, _)| *index);

    let mut priority = 0;
    let mut reduced_partition = false;
    let mut args = Vec::new();
    for (_, event) in events {
        match event {
            ArgEvent::Priority(p) => priority = p,
            ArgEvent::TogglePartition => reduced_partition = !reduced_partition,
            ArgEvent::Workload { desc, master } => args.push(WorkloadArg {
                desc: desc.to_string(),
                priority,
                reduced_partition,
                master,
            }),
        }
    }
    args
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    if cli.print_config {
        print!("{}", Config::sample_config());
        return Ok(());
    }

    let config = Config::get();
    let verbose = if cli.quiet { 0 } else { 1 + u32::from(cli.verbose) };

    let device = open_device(&cli.device).with_context(|| format!("Failed to open device '{}'", cli.device))?;
    let caps = DeviceCaps::new(device);

    if cli.list_engines {
        for (index, engine) in caps.engines().context("Failed to query engines")?.iter().enumerate() {
            println!("{}: {} (class {}, instance {})", index, engine.name, engine.class, engine.instance);
        }
        return Ok(());
    }

    if cli.master.len() > 1 {
        bail!("Only one master workload can be given!");
    }
    if cli.append.len() > 1 {
        bail!("Only one append workload can be given!");
    }

    let args = workload_args(&cli, &matches);
    if args.is_empty() {
        bail!("No workload descriptor(s)!");
    }

    let append: Vec<Step> = match cli.append.first() {
        Some(arg) => {
            let text = load_descriptor(arg).context("Failed to load append workload descriptor")?;
            parse_steps(&text).context("Failed to parse append workload")?
        }
        None => Vec::new(),
    };

    let mut workloads = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let text = load_descriptor(&arg.desc).with_context(|| format!("Failed to load workload descriptor {}", i))?;
        let workload = Workload::parse_with_append(&text, &append)
            .with_context(|| format!("Failed to parse workload {}", i))?
            .with_priority(arg.priority)
            .with_reduced_partition(arg.reduced_partition);
        workloads.push(workload);
    }

    let seed = cli.seed.or(config.seed).unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    });

    let options = RunOptions {
        repeat: cli.repeat,
        clients: cli.clients,
        master: args.iter().position(|a| a.master),
        dep_sync: cli.dep_sync,
        sync_rng: cli.sync_rng,
        seed,
        duration_scale: cli.duration_scale,
        delay_scale: cli.delay_scale,
        preempt_us: config.default_preempt_us(),
    };
    let (clients, _) = options.layout(workloads.len())?;

    if verbose > 1 {
        println!("Random seed is {}.", seed);
        println!("{} client{}.", clients, if clients > 1 { "s" } else { "" });
    }

    let summary = scheduler::run(&caps, &mut workloads, &options).context("Workload run failed")?;

    for stats in &summary.clients {
        if verbose > 1 || (verbose > 0 && summary.master == Some(stats.id)) {
            println!("{}", stats);
        }
    }
    if verbose > 0 {
        println!("{}", summary);
    }

    Ok(())
}
