use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use portfolio_runner::supervisor;
use portfolio_runner::{
    CommandPredictor, ConfigSampler, LaunchSpec, Launcher, Orchestrator, Outcome, PoolError,
    PoolOptions, PoolReport, PruningPolicy, SearchSpace, SupervisorArgs,
};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_BAD_ARGS: i32 = 1;
const EXIT_SETUP: i32 = 2;
const EXIT_FLAGS: i32 = 3;

const LOG_FILE_ENV: &str = "PORTFOLIO_LOG_FILE";

#[derive(Parser)]
#[command(
    name = "portfolio",
    version,
    about = "Run a pool of randomly configured solvers until one succeeds",
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[arg(short = 'c', long = "count", required = true)]
    count: Option<u32>,
    #[arg(short = 'e', long = "epoch", default_value_t = 1.0)]
    epoch: f64,
    #[arg(short = 'f', long = "filetype", default_value = "smt2")]
    filetype: String,
    #[arg(short = 'i', long = "input", required = true)]
    input: Option<PathBuf>,
    #[arg(short = 'm', long = "model")]
    model: Option<PathBuf>,
    #[arg(short = 'p', long = "paramFile")]
    param_file: Option<PathBuf>,
    #[arg(short = 't', long = "trainFile", default_value = "train.csv")]
    train_file: PathBuf,
    #[arg(short = 'l', long = "replay")]
    replay: bool,
    #[arg(long, default_value = "z3")]
    solver: String,
    #[arg(long)]
    pin: bool,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    space: Option<PathBuf>,
    #[arg(long)]
    predictor: Option<PathBuf>,
    #[arg(long = "min-pool", default_value_t = 5)]
    min_pool: usize,
    #[arg(long = "handshake-timeout", default_value_t = 10.0)]
    handshake_timeout: f64,
    #[arg(long = "kill-grace", default_value_t = 2.0)]
    kill_grace: f64,
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(name = "__supervise", hide = true)]
    Supervise {
        #[arg(long)]
        slot: u32,
        #[arg(long)]
        generation: u32,
        #[arg(long = "start-fd")]
        start_fd: i32,
        #[arg(long = "done-fd")]
        done_fd: i32,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

enum Failure {
    BadArgs(anyhow::Error),
    Setup(anyhow::Error),
}

impl Failure {
    fn code(&self) -> i32 {
        match self {
            Failure::BadArgs(_) => EXIT_BAD_ARGS,
            Failure::Setup(_) => EXIT_SETUP,
        }
    }

    fn error(&self) -> &anyhow::Error {
        match self {
            Failure::BadArgs(e) | Failure::Setup(e) => e,
        }
    }
}

impl From<PoolError> for Failure {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Options(_) => Failure::BadArgs(err.into()),
            other => Failure::Setup(other.into()),
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_FLAGS,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Some(Commands::Supervise {
        slot,
        generation,
        start_fd,
        done_fd,
        command,
    }) = cli.command
    {
        let log_file = std::env::var_os(LOG_FILE_ENV).map(PathBuf::from);
        if let Err(err) = init_logging(log_file.as_deref()) {
            eprintln!("error: {err:#}");
        }
        std::process::exit(supervisor::run(SupervisorArgs {
            slot,
            generation,
            start_fd,
            done_fd,
            command,
        }));
    }

    if let Err(err) = init_logging(cli.log_file.as_deref()) {
        eprintln!("error: {err:#}");
        std::process::exit(EXIT_SETUP);
    }
    if let Some(path) = &cli.log_file {
        // Supervisors log to the same file.
        std::env::set_var(LOG_FILE_ENV, path);
    }

    let json_mode = cli.json;
    match run_pool(cli) {
        Ok(report) => {
            if json_mode {
                emit_json(&json!({
                    "ok": true,
                    "command": "run",
                    "report": report,
                }));
            } else {
                print_report(&report);
            }
        }
        Err(failure) => {
            error!("{:#}", failure.error());
            if json_mode {
                emit_json(&json!({
                    "ok": false,
                    "error": {
                        "code": failure.code(),
                        "message": format!("{:#}", failure.error()),
                    }
                }));
            } else {
                eprintln!("error: {:#}", failure.error());
            }
            std::process::exit(failure.code());
        }
    }
}

fn run_pool(cli: Cli) -> Result<PoolReport, Failure> {
    let count = cli
        .count
        .filter(|c| *c > 0)
        .ok_or_else(|| Failure::BadArgs(anyhow!("--count must be at least 1")))?;
    let input = cli
        .input
        .clone()
        .ok_or_else(|| Failure::BadArgs(anyhow!("--input is required")))?;
    if !input.is_file() {
        return Err(Failure::BadArgs(anyhow!(
            "input file {} does not exist",
            input.display()
        )));
    }
    let epoch = seconds("--epoch", cli.epoch).map_err(Failure::BadArgs)?;
    let handshake_timeout =
        seconds("--handshake-timeout", cli.handshake_timeout).map_err(Failure::BadArgs)?;
    let kill_grace = seconds("--kill-grace", cli.kill_grace).map_err(Failure::BadArgs)?;

    let sampler = build_sampler(&cli)?;
    let record = !sampler.is_replay();

    let pin_cpus = if cli.pin {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Some(cpus)
    } else {
        None
    };
    let supervisor_exe = std::env::current_exe()
        .context("locating own executable for supervisors")
        .map_err(Failure::Setup)?;

    let policy = match &cli.predictor {
        Some(program) => Some(PruningPolicy::new(
            cli.min_pool,
            cli.train_file.clone(),
            Box::new(CommandPredictor {
                program: program.clone(),
                model: cli.model.clone(),
            }),
        )),
        None => {
            if let Some(model) = &cli.model {
                warn!(model = %model.display(), "--model given without --predictor, pruning disabled");
            }
            None
        }
    };

    let launcher = Launcher::new(LaunchSpec {
        supervisor_exe,
        solver: cli.solver.clone(),
        filetype: cli.filetype.clone(),
        input,
        train_file: cli.train_file.clone(),
        record,
        pin_cpus,
        handshake_timeout,
        kill_grace,
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&shutdown))
            .context("installing signal handlers")
            .map_err(Failure::Setup)?;
    }

    let orchestrator = Orchestrator::new(
        PoolOptions { size: count, epoch },
        launcher,
        sampler,
        policy,
        shutdown,
    )?;
    info!(
        count,
        epoch_secs = epoch.as_secs_f64(),
        replay = !record,
        pruning = cli.predictor.is_some(),
        "starting portfolio"
    );
    Ok(orchestrator.run())
}

fn build_sampler(cli: &Cli) -> Result<ConfigSampler, Failure> {
    if cli.replay {
        let path = cli
            .param_file
            .as_deref()
            .ok_or_else(|| Failure::BadArgs(anyhow!("-l needs --paramFile to replay from")))?;
        return ConfigSampler::replaying(path).map_err(Failure::BadArgs);
    }
    let space = match &cli.space {
        Some(path) => SearchSpace::load(path).map_err(Failure::BadArgs)?,
        None => SearchSpace::z3_sat(),
    };
    ConfigSampler::generating(space, cli.seed, cli.param_file.as_deref())
        .map_err(|e| Failure::Setup(e.into()))
}

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(anyhow!("{} must be a positive number of seconds", flag));
    }
    Ok(Duration::from_secs_f64(value))
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow!("{e}"))?;
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow!("{e}"))?;
        }
    }
    Ok(())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{{\"ok\":false,\"error\":{{\"code\":1,\"message\":\"json encoding failed\"}}}}"),
    }
}

fn print_report(report: &PoolReport) {
    match &report.outcome {
        Outcome::Solved {
            slot,
            generation,
            configuration,
            exit_code,
            solver_secs,
        } => {
            println!("outcome: solved");
            println!("slot: {}", slot);
            println!("generation: {}", generation);
            println!("exit_code: {}", exit_code);
            println!("solver_secs: {:.3}", solver_secs);
            println!("configuration: {}", configuration);
        }
        Outcome::Interrupted => println!("outcome: interrupted"),
        Outcome::Exhausted => println!("outcome: exhausted"),
    }
    println!("total_time_secs: {:.3}", report.elapsed_secs);
    println!("ticks: {}", report.ticks);
    println!("launches: {}", report.total_launches);
    println!("kills: {}", report.kills);
}
