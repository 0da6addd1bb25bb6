//! `ace`: runs a built-in analytic through the execution core.
//!
//! ```text
//! ace <ANALYTIC> [serial|concurrent|distributed] [UNITS] [RANKS] [--fail-at INDEX]
//! ```
//!
//! `RANKS` is the number of virtual devices (and pistons) in concurrent mode
//! and the group size in distributed mode, where every rank runs as a thread
//! of this process over an in-process communicator.
//!
//! Exit status: 0 on success, 2 on an argument or configuration error, 1 on
//! any other fault. Failures print a diagnostic with title, detail and origin.

mod analytics;

use ace_engine::comm::{Communicator, LocalGroup};
use ace_engine::device::VirtualPlatform;
use ace_engine::{AceError, Analytic, Manager, Mode, RunConfig, RunReport, VecCommitter};
use clap::{CommandFactory, Parser, ValueEnum};
use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

/// Run a built-in analytic on the serial, concurrent or distributed engine
#[derive(Parser, Debug)]
#[command(name = "ace")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Analytic to run (square, collatz)
    #[arg(value_name = "ANALYTIC")]
    analytic: String,

    /// Execution engine
    #[arg(value_enum, default_value_t = ModeArg::Serial)]
    mode: ModeArg,

    /// Number of work units
    #[arg(value_name = "UNITS", default_value_t = 16)]
    units: usize,

    /// Virtual devices in concurrent mode, group size in distributed mode
    #[arg(
        value_name = "RANKS",
        default_value_t = 4,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    ranks: usize,

    /// Raise an execution fault on the unit with this index
    #[arg(long, value_name = "INDEX")]
    fail_at: Option<usize>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum ModeArg {
    /// One unit at a time
    Serial,
    /// Piston pool, one thread per virtual device
    #[value(alias = "pool")]
    Concurrent,
    /// Master and worker ranks over an in-process group
    #[value(alias = "mpi")]
    Distributed,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Serial => Mode::Serial,
            ModeArg::Concurrent => Mode::Concurrent,
            ModeArg::Distributed => Mode::Distributed,
        }
    }
}

/// Prints the diagnostic for `e` and picks the exit status.
fn fail(e: &AceError) -> ExitCode {
    eprintln!("{}", e.diagnostic());
    if e.is_configuration() {
        eprintln!("{}", Cli::command().render_usage());
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

/// Runs the analytic into `committed`. A failure is reported while the
/// engine that raised it is still alive.
fn run(cli: &Cli, committed: &VecCommitter) -> Result<RunReport, ExitCode> {
    let mut analytic = analytics::select(&cli.analytic, cli.units).map_err(|e| fail(&e))?;
    if let Some(index) = cli.fail_at {
        analytic = analytics::failing_at(analytic, index);
    }
    let platform = VirtualPlatform::with_devices(cli.ranks);
    let mode = Mode::from(cli.mode);
    let config = RunConfig::builder().mode(mode).build();

    match mode {
        Mode::Serial | Mode::Concurrent => {
            let mut manager =
                Manager::new(analytic, Box::new(committed.clone()), config, &platform, None)
                    .map_err(|e| fail(&e))?;
            manager.run().map_err(|e| fail(&e))
        }
        Mode::Distributed => run_group(analytic, &platform, config, cli.ranks, committed.clone()),
    }
}

/// Rank 0 runs on the calling thread, every other rank on its own thread.
fn run_group(
    analytic: Arc<dyn Analytic>,
    platform: &VirtualPlatform,
    config: RunConfig,
    ranks: usize,
    committed: VecCommitter,
) -> Result<RunReport, ExitCode> {
    let mut group = LocalGroup::spawn(ranks).into_iter();
    let master_comm = group
        .next()
        .ok_or_else(|| fail(&AceError::config("Distributed mode needs at least one rank")))?;

    thread::scope(|scope| {
        for comm in group {
            let analytic = analytic.clone();
            let config = config.clone();
            scope.spawn(move || {
                let rank = comm.rank();
                let comm: &dyn Communicator = &comm;
                let outcome = Manager::new(
                    analytic,
                    Box::new(VecCommitter::new()),
                    config,
                    platform,
                    Some(comm),
                )
                .and_then(|mut manager| manager.run());
                if let Err(e) = outcome {
                    error!("rank {} failed: {}", rank, e);
                }
            });
        }

        let comm: &dyn Communicator = &master_comm;
        match Manager::new(
            analytic.clone(),
            Box::new(committed),
            config.clone(),
            platform,
            Some(comm),
        ) {
            Ok(mut manager) => manager.run().map_err(|e| fail(&e)),
            Err(e) => Err(fail(&e)),
        }
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let committed = VecCommitter::new();
    let report = match run(&cli, &committed) {
        Ok(report) => report,
        Err(code) => return code,
    };
    info!(
        "{} ({:?}) committed {} unit(s)",
        cli.analytic, report.role, report.units
    );

    match committed.decode_all::<serde_json::Value>() {
        Ok(values) => {
            for (index, value) in committed.indices().into_iter().zip(values) {
                println!("{}\t{}", index, value);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to decode committed results: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
