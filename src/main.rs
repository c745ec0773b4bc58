use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use swarm::backend::BackendConfig;
use swarm::dag::Executor;
use swarm::proc;
use swarm::runner::{Runner, RunnerOptions};
use swarm::store::{Scope, StateStore};
use swarm_core::{AgentRecord, ComposeFile, ExitReason, TerminateMode};

#[derive(Parser)]
#[command(
    name = "swarm",
    about = "Supervise fleets of long-running AI coding agents",
    version
)]
struct Cli {
    /// Operate on every agent on this host, not just the current project's
    #[arg(long, global = true)]
    global: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start one agent in the foreground
    Run(RunArgs),
    /// Run a pipeline from a compose file
    Up(UpArgs),
    /// List agents
    Ps {
        /// Include terminated agents
        #[arg(short, long)]
        all: bool,
    },
    /// Print an agent's full record as JSON
    Inspect {
        /// Agent id or name; omit for the most recent agent
        target: Option<String>,
    },
    /// Print an agent's log file
    Logs {
        target: Option<String>,
        /// Keep printing as the agent writes
        #[arg(short, long)]
        follow: bool,
    },
    /// Terminate an agent immediately
    Kill { target: String },
    /// Let the current iteration finish, then terminate
    Stop { target: String },
    /// Suspend at the next iteration boundary
    Pause { target: String },
    /// Resume a paused agent
    Resume { target: String },
    /// Retarget a running agent
    Set {
        target: String,
        /// New iteration goal (0 = unlimited)
        #[arg(long)]
        iterations: Option<u32>,
        /// New model, applied from the next iteration
        #[arg(long)]
        model: Option<String>,
    },
    /// Delete an agent record
    Rm { target: String },
    /// Delete every terminated record in scope
    Clean,
}

#[derive(Args)]
struct BackendArgs {
    /// Backend executable (default: claude)
    #[arg(long)]
    backend: Option<String>,

    /// Backend argv template; {model} and {prompt} are substituted
    #[arg(long, allow_hyphen_values = true)]
    backend_args: Option<String>,

    /// Pass backend stdout through instead of parsing JSONL
    #[arg(long)]
    raw_output: bool,
}

impl BackendArgs {
    fn build(&self) -> BackendConfig {
        let mut backend = BackendConfig::default();
        if let Some(exe) = &self.backend {
            backend.executable = exe.clone();
        }
        if let Some(args) = &self.backend_args {
            backend.args = args.split_whitespace().map(str::to_string).collect();
        }
        if self.raw_output {
            backend.raw_output = true;
        }
        backend
    }
}

#[derive(Args)]
struct RunArgs {
    /// Named prompt identifier
    #[arg(long, group = "prompt_source")]
    prompt: Option<String>,

    /// Prompt file path
    #[arg(long, group = "prompt_source")]
    prompt_file: Option<String>,

    /// Inline prompt text
    #[arg(long, group = "prompt_source")]
    prompt_string: Option<String>,

    #[arg(long, default_value = "")]
    model: String,

    /// Iteration goal; 0 runs until stopped
    #[arg(short = 'n', long, default_value_t = 1)]
    iterations: u32,

    #[arg(long)]
    name: Option<String>,

    /// key=value labels, repeatable
    #[arg(long)]
    label: Vec<String>,

    /// Environment variable names forwarded to the backend, repeatable
    #[arg(long)]
    env: Vec<String>,

    /// Total runtime limit in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Per-iteration limit in seconds
    #[arg(long)]
    iteration_timeout: Option<u64>,

    /// Shell command executed when the agent terminates
    #[arg(long)]
    on_complete: Option<String>,

    /// Working directory for the backend
    #[arg(long)]
    cwd: Option<PathBuf>,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Args)]
struct UpArgs {
    /// Compose file
    file: PathBuf,

    /// Pipeline to run; defaults to the only/first one
    #[arg(short, long)]
    pipeline: Option<String>,

    #[command(flatten)]
    backend: BackendArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let scope = if cli.global {
        Scope::Global
    } else {
        Scope::project(cwd.to_string_lossy())
    };
    let store = Arc::new(StateStore::open(scope)?);

    match cli.command {
        Commands::Run(args) => cmd_run(store, cwd, args).await,
        Commands::Up(args) => cmd_up(store, cwd, args).await,
        Commands::Ps { all } => cmd_ps(&store, all),
        Commands::Inspect { target } => cmd_inspect(&store, target.as_deref()),
        Commands::Logs { target, follow } => cmd_logs(&store, target.as_deref(), follow).await,
        Commands::Kill { target } => cmd_kill(&store, &target),
        Commands::Stop { target } => {
            let rec = store.get_by_name_or_id(&target)?;
            store.set_terminate_mode(&rec.id, Some(TerminateMode::AfterIteration))?;
            println!("{}: stopping after current iteration", rec.id);
            Ok(())
        }
        Commands::Pause { target } => {
            let rec = store.get_by_name_or_id(&target)?;
            store.set_paused(&rec.id, true)?;
            println!("{}: paused", rec.id);
            Ok(())
        }
        Commands::Resume { target } => {
            let rec = store.get_by_name_or_id(&target)?;
            store.set_paused(&rec.id, false)?;
            println!("{}: resumed", rec.id);
            Ok(())
        }
        Commands::Set {
            target,
            iterations,
            model,
        } => {
            let rec = store.get_by_name_or_id(&target)?;
            if let Some(n) = iterations {
                store.set_iterations(&rec.id, n)?;
            }
            if let Some(m) = &model {
                store.set_model(&rec.id, m)?;
            }
            println!("{}: updated", rec.id);
            Ok(())
        }
        Commands::Rm { target } => {
            let rec = store.get_by_name_or_id(&target)?;
            store.remove(&rec.id)?;
            println!("{}: removed", rec.id);
            Ok(())
        }
        Commands::Clean => {
            let removed = store.prune_terminated()?;
            println!("removed {removed} terminated agent(s)");
            Ok(())
        }
    }
}

async fn cmd_run(store: Arc<StateStore>, cwd: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    let prompt = args
        .prompt
        .or(args.prompt_file)
        .or(args.prompt_string)
        .context("one of --prompt, --prompt-file, --prompt-string is required")?;

    let mut labels = HashMap::new();
    for pair in &args.label {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("label '{pair}' is not key=value"))?;
        labels.insert(key.to_string(), value.to_string());
    }

    let opts = RunnerOptions {
        name: args.name.unwrap_or_default(),
        labels,
        prompt,
        model: args.model,
        iterations: args.iterations,
        working_dir: args.cwd.unwrap_or(cwd),
        env_names: args.env,
        timeout: args.timeout.map(Duration::from_secs),
        iteration_timeout: args.iteration_timeout.map(Duration::from_secs),
        on_complete: args.on_complete.unwrap_or_default(),
        backend: args.backend.build(),
        echo_output: true,
        ..RunnerOptions::default()
    };

    let runner = Runner::register(store, opts)?;
    println!(
        "started agent {} ({})",
        runner.id().bold(),
        runner.record().name
    );
    spawn_signal_handler(runner.cancel_token());

    let record = runner.run().await?;
    let reason = record
        .exit_reason
        .map(|r| r.to_string())
        .unwrap_or_default();
    println!(
        "agent {} {}: {} succeeded, {} failed",
        record.id,
        colorize_reason(&reason),
        record.successful_iterations,
        record.failed_iterations
    );
    if matches!(
        record.exit_reason,
        Some(ExitReason::Crashed) | Some(ExitReason::Error)
    ) {
        bail!("agent ended with {reason}");
    }
    Ok(())
}

async fn cmd_up(store: Arc<StateStore>, cwd: PathBuf, args: UpArgs) -> anyhow::Result<()> {
    let compose = ComposeFile::load(&args.file)
        .with_context(|| format!("loading {}", args.file.display()))?;

    let (name, pipeline) = match &args.pipeline {
        Some(name) => {
            let p = compose
                .pipelines
                .get(name)
                .with_context(|| format!("no pipeline named '{name}'"))?;
            (name.clone(), p.clone())
        }
        None => match compose.pipelines.iter().next() {
            Some((name, p)) if compose.pipelines.len() == 1 => (name.clone(), p.clone()),
            Some(_) => bail!("several pipelines defined; pick one with --pipeline"),
            // No pipeline section: run every task once.
            None => ("default".to_string(), Default::default()),
        },
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let executor = Executor::new(store, args.backend.build(), cwd, false, cancel);
    let runs = executor.run(&compose, &name, &pipeline).await?;

    for run in &runs {
        for iteration in &run.iterations {
            let (succeeded, failed, skipped) = iteration.counts();
            let header = if run.instance > 0 {
                format!("[{}#{}] ", name, run.instance)
            } else {
                String::new()
            };
            println!(
                "{header}Iteration {}/{}: {} succeeded, {} failed, {} skipped",
                iteration.index, iteration.total, succeeded, failed, skipped
            );
            for state in iteration.states.values() {
                let status = state.status.to_string();
                let status = match state.status {
                    swarm_core::TaskStatus::Succeeded => status.green(),
                    swarm_core::TaskStatus::Failed => status.red(),
                    swarm_core::TaskStatus::Skipped => status.yellow(),
                    _ => status.normal(),
                };
                println!("  {:20} {}", state.name, status);
            }
        }
    }
    Ok(())
}

fn cmd_ps(store: &StateStore, all: bool) -> anyhow::Result<()> {
    let records = store.list(!all)?;
    if records.is_empty() {
        println!("no agents");
        return Ok(());
    }
    println!(
        "{:<10} {:<16} {:<11} {:<9} {:<10} {}",
        "ID", "NAME", "STATUS", "ITER", "MODEL", "TASK"
    );
    for rec in records {
        let status = match rec.exit_reason {
            None => "running".green(),
            Some(reason) => colorize_reason(&reason.to_string()),
        };
        let iter = if rec.iterations > 0 {
            format!("{}/{}", rec.current_iteration, rec.iterations)
        } else {
            format!("{}/∞", rec.current_iteration)
        };
        println!(
            "{:<10} {:<16} {:<11} {:<9} {:<10} {}",
            rec.id,
            rec.name,
            status,
            iter,
            rec.model,
            swarm::format::trim_snippet(&rec.current_task)
        );
    }
    Ok(())
}

fn cmd_inspect(store: &StateStore, target: Option<&str>) -> anyhow::Result<()> {
    let rec = resolve(store, target)?;
    println!("{}", serde_json::to_string_pretty(&rec)?);
    Ok(())
}

async fn cmd_logs(store: &StateStore, target: Option<&str>, follow: bool) -> anyhow::Result<()> {
    let rec = resolve(store, target)?;
    let path = PathBuf::from(&rec.log_file);
    let mut offset = 0u64;
    loop {
        if let Ok(data) = std::fs::read(&path) {
            if (data.len() as u64) > offset {
                print!("{}", String::from_utf8_lossy(&data[offset as usize..]));
                offset = data.len() as u64;
            }
        }
        if !follow {
            break;
        }
        // Stop following once the agent is gone and the file is drained.
        match store.get(&rec.id) {
            Ok(current) if current.is_running() => {}
            _ => break,
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Ok(())
}

fn cmd_kill(store: &StateStore, target: &str) -> anyhow::Result<()> {
    let rec = store.get_by_name_or_id(target)?;
    store.set_terminate_mode(&rec.id, Some(TerminateMode::Immediate))?;
    // Out-of-band: take the backend down now rather than at the next
    // boundary; the runner classifies and exits when it observes the mode.
    if rec.pid != 0 {
        proc::term_group(rec.pid);
        proc::kill_group(rec.pid);
    }
    println!("{}: killed", rec.id);
    Ok(())
}

fn resolve(store: &StateStore, target: Option<&str>) -> anyhow::Result<AgentRecord> {
    match target {
        Some(t) => Ok(store.get_by_name_or_id(t)?),
        None => Ok(store.get_last()?),
    }
}

fn colorize_reason(reason: &str) -> colored::ColoredString {
    match reason {
        "completed" => reason.green(),
        "crashed" | "timeout" | "error" => reason.red(),
        "killed" => reason.yellow(),
        _ => reason.normal(),
    }
}

/// First signal: cooperative cancel. Second: hard exit without state write.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            wait_for_signal().await;
            received += 1;
            if received == 1 {
                eprintln!("interrupt: stopping agents (again to force quit)");
                cancel.cancel();
            } else {
                std::process::exit(130);
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
