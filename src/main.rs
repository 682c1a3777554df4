use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use ralph_orchestrator::agent::CommandAgent;
use ralph_orchestrator::backlog::{select_next_story, BacklogStore, Selection};
use ralph_orchestrator::checkpoint::{RecoveryDecision, RecoveryManager};
use ralph_orchestrator::config::{config_path, state_dir, RalphConfig};
use ralph_orchestrator::daemon::{CancelOutcome, TaskPriority, TaskQueueDaemon};
use ralph_orchestrator::engine::{Collaborators, IterationEngine, RunReport};
use ralph_orchestrator::exit_codes;
use ralph_orchestrator::parallel::WorkerCoordinator;
use ralph_orchestrator::persist::absolute_path;
use ralph_orchestrator::quality::{CommandGateRunner, GateLevel};
use ralph_orchestrator::split::{
    AutoApprove, DeferApprover, ProposalEdit, SplitApprover, SplitProposal, Splitter,
};
use ralph_orchestrator::vcs::{CopyVcs, GitVcs, VersionControl};
use ralph_orchestrator::{logging, RalphError};

/// Ralph - autonomous story orchestrator
#[derive(Parser, Debug)]
#[command(name = "ralph")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RUST_LOG           Override the log filter\n    RALPH__<SECTION>__<KEY>  Override a config value, e.g. RALPH__ENGINE__MAX_ITERATIONS=20")]
struct Cli {
    /// Project root holding the backlog and the .ralph state directory
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Backlog file (defaults to engine.backlog_file under the root)
    #[arg(long, global = true)]
    backlog: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive the backlog until it completes or the budget runs out
    Run(RunArgs),

    /// Continue from the latest checkpoint without prompting
    Resume(RunArgs),

    /// Show backlog progress, session state and open split proposals
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run several backlogs side by side in isolated workspaces
    Parallel {
        /// Backlog files, one worker each
        #[arg(required = true)]
        backlogs: Vec<PathBuf>,

        /// Maximum workers alive at once
        #[arg(long)]
        max_workers: Option<usize>,
    },

    /// Review split proposals
    Split {
        #[command(subcommand)]
        command: SplitCommand,
    },

    /// Task queue daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Write the default configuration to .ralph/config.toml
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// Cycles this invocation may spend
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Gate thoroughness: minimal, standard or strict
    #[arg(long)]
    gate_level: Option<GateLevel>,

    /// Apply split proposals without operator review
    #[arg(long)]
    auto_split: bool,

    /// Never prompt after a crash; resume automatically
    #[arg(long)]
    non_interactive: bool,
}

#[derive(Subcommand, Debug)]
enum SplitCommand {
    /// List proposals awaiting a decision
    List,
    /// Replace the parent story with the proposed sub-stories
    Approve { id: String },
    /// Drop the proposal
    Reject {
        id: String,
        #[arg(long, default_value = "rejected by operator")]
        reason: String,
    },
    /// Revise the proposal from a JSON edit file
    Edit {
        id: String,
        /// JSON file with `changes`, `remove` and `add`
        #[arg(long)]
        file: PathBuf,
    },
    /// Keep the proposal open for later
    Defer { id: String },
}

#[derive(Subcommand, Debug)]
enum DaemonCommand {
    /// Run the daemon in the foreground until stopped
    Start {
        /// Worker pool size
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Ask the running daemon to stop after cancelling its workers
    Stop,
    /// Queue a backlog
    Submit {
        backlog: PathBuf,
        /// high, normal or low
        #[arg(long, default_value = "normal")]
        priority: TaskPriority,
    },
    /// Cancel a queued or running task
    Cancel { task_id: String },
    /// Stop launching new tasks
    Pause,
    /// Resume launching tasks
    Resume,
    /// Daemon and queue summary
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List every task
    Queue,
}

/// Resolved paths and configuration for one invocation.
struct Context {
    root: PathBuf,
    backlog: PathBuf,
    config: RalphConfig,
}

impl Context {
    fn load(root: &Path, backlog: Option<PathBuf>) -> Result<Self> {
        // Agents run inside workspaces, so every path handed on is absolute
        let root =
            absolute_path(root).with_context(|| format!("resolving {}", root.display()))?;
        let config = RalphConfig::load(&root)
            .with_context(|| format!("loading {}", config_path(&root).display()))?;
        let backlog = match backlog {
            Some(path) => absolute_path(&path)?,
            None => root.join(&config.engine.backlog_file),
        };
        Ok(Self {
            root,
            backlog,
            config,
        })
    }

    fn store(&self) -> BacklogStore {
        BacklogStore::new(&self.backlog, self.config.lock.clone())
    }

    fn collaborators(&self) -> Collaborators {
        let workspaces = state_dir(&self.root).join("workspaces");
        let vcs: Arc<dyn VersionControl> = if GitVcs::is_repo(&self.root) {
            Arc::new(GitVcs::new(
                &self.root,
                workspaces,
                self.config.timeout.git_timeout,
            ))
        } else {
            Arc::new(CopyVcs::new(&self.root, workspaces))
        };
        let approver: Arc<dyn SplitApprover> = if self.config.engine.auto_split {
            Arc::new(AutoApprove)
        } else {
            Arc::new(DeferApprover)
        };
        Collaborators::new(
            Arc::new(CommandAgent::new(self.config.agent.clone())),
            Arc::new(CommandGateRunner::new(
                self.config.gates.clone(),
                self.config.timeout.gate_timeout,
            )),
            vcs,
            approver,
        )
    }

    fn splitter(&self) -> Result<Splitter> {
        let store = self.store();
        let backlog = store.load_validated()?;
        Ok(Splitter::new(
            &self.root,
            &backlog.lineage(),
            store,
            self.config.complexity.clone(),
            self.config.lock.clone(),
        ))
    }

    fn daemon(&self) -> TaskQueueDaemon {
        TaskQueueDaemon::new(&self.root, &self.config, self.collaborators())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            exit_codes::FAILURE
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let load = || Context::load(&cli.root, cli.backlog.clone());
    match cli.command {
        Command::InitConfig { force } => init_config(&cli.root, force),
        Command::Run(args) => run(&mut load()?, args, false).await,
        Command::Resume(args) => run(&mut load()?, args, true).await,
        Command::Status { json } => status(&load()?, json),
        Command::Parallel {
            backlogs,
            max_workers,
        } => parallel(&mut load()?, backlogs, max_workers).await,
        Command::Split { command } => split(&load()?, command),
        Command::Daemon { command } => daemon(&mut load()?, command).await,
    }
}

fn init_config(root: &Path, force: bool) -> Result<i32> {
    let path = config_path(root);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, RalphConfig::default().to_toml()?)?;
    println!("Wrote {}", path.display());
    Ok(exit_codes::SUCCESS)
}

/// Watch channel flipped by Ctrl-C.
fn cancellation() -> Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        eprintln!("Interrupted, stopping after the current iteration...");
        tx.send_replace(true);
    })
    .context("installing Ctrl-C handler")?;
    Ok(rx)
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    // The sender lives in the signal handler for the rest of the process
    let _ = cancel.wait_for(|stop| *stop).await;
}

async fn run(ctx: &mut Context, args: RunArgs, resume: bool) -> Result<i32> {
    let engine_config = &mut ctx.config.engine;
    if let Some(max) = args.max_iterations {
        engine_config.max_iterations = max;
    }
    if let Some(level) = args.gate_level {
        engine_config.gate_level = level;
    }
    if args.auto_split {
        engine_config.auto_split = true;
    }
    if args.non_interactive || !std::io::stdin().is_terminal() {
        ctx.config.checkpoint.interactive = false;
    }
    ctx.config.validate()?;

    let store = ctx.store();
    let backlog = store
        .load_validated()
        .with_context(|| format!("loading backlog {}", ctx.backlog.display()))?;
    let recovery = RecoveryManager::new(&ctx.root, &backlog, ctx.config.checkpoint.clone());

    if let Some(report) = recovery.crash_report()? {
        eprintln!("{}", report.summary());
        let decision = if resume {
            RecoveryDecision::Resume
        } else {
            recovery.resolve_decision(ask_operator()).await
        };
        match decision {
            RecoveryDecision::Resume => {
                let point = recovery.resume()?;
                println!("Resuming after iteration {}", point.iteration);
            }
            RecoveryDecision::FreshStart => {
                recovery.fresh_start()?;
                println!("Starting fresh");
            }
            RecoveryDecision::Decline => {
                println!("Recovery declined; state left untouched");
                return Ok(exit_codes::RECOVERY_DECLINED);
            }
        }
    }

    let cancel = cancellation()?;
    let mut engine = IterationEngine::new(
        &ctx.root,
        &ctx.root,
        store,
        &ctx.config,
        ctx.collaborators(),
    )?
    .with_cancellation(cancel);
    let report = engine.run().await?;
    print_run_report(&report);
    Ok(report.exit_code())
}

async fn ask_operator() -> Option<RecoveryDecision> {
    eprint!("Resume [r], start fresh [f] or quit [q]? ");
    let mut line = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    reader.read_line(&mut line).await.ok()?;
    match line.trim().to_ascii_lowercase().as_str() {
        "f" | "fresh" => Some(RecoveryDecision::FreshStart),
        "q" | "quit" | "n" | "no" => Some(RecoveryDecision::Decline),
        _ => Some(RecoveryDecision::Resume),
    }
}

fn print_run_report(report: &RunReport) {
    println!("{}: {}", report.project, report.outcome);
    println!(
        "  iterations: {} this run, last checkpoint {}",
        report.iterations_run, report.last_iteration
    );
    if !report.completed.is_empty() {
        println!("  completed: {}", report.completed.join(", "));
    }
    for (story_id, reason) in &report.blocked {
        println!("  blocked {}: {}", story_id, reason);
    }
    if !report.proposals.is_empty() {
        println!(
            "  split proposals: {} (see `ralph split list`)",
            report.proposals.join(", ")
        );
    }
    if !report.remaining.is_empty() {
        println!("  remaining: {}", report.remaining.join(", "));
    }
}

fn status(ctx: &Context, json: bool) -> Result<i32> {
    let store = ctx.store();
    let backlog = store.load_validated()?;
    let recovery = RecoveryManager::new(&ctx.root, &backlog, ctx.config.checkpoint.clone());
    let crash = recovery.crash_report()?;
    let live = recovery.live_session()?;
    let latest = recovery.latest()?;
    let proposals = ctx.splitter()?.list_open()?;
    let (passed, total) = backlog.progress();
    let next = match select_next_story(&backlog) {
        Ok(Selection::Next(story)) => Some(story.id.clone()),
        Ok(Selection::AllComplete) => None,
        Err(RalphError::Deadlock { .. }) => None,
        Err(err) => return Err(err.into()),
    };

    if json {
        let value = serde_json::json!({
            "project": backlog.project,
            "lineage": backlog.lineage(),
            "passed": passed,
            "total": total,
            "next_story": next,
            "incomplete": backlog.incomplete_ids(),
            "crash": crash,
            "running_pid": live.as_ref().map(|s| s.pid),
            "last_iteration": latest.as_ref().map(|c| c.iteration),
            "open_proposals": proposals.iter().map(|p| &p.id).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(exit_codes::SUCCESS);
    }

    println!("{} ({})", backlog.project, backlog.branch_name);
    println!("  progress: {}/{} stories pass", passed, total);
    match next {
        Some(id) => println!("  next: {}", id),
        None if passed == total => println!("  next: none, all stories complete"),
        None => println!("  next: none eligible (dependency deadlock)"),
    }
    match latest {
        Some(checkpoint) => println!("  last checkpoint: iteration {}", checkpoint.iteration),
        None => println!("  last checkpoint: none"),
    }
    if let Some(session) = live {
        println!(
            "  running: pid {}, last heartbeat {}s ago",
            session.pid,
            session.heartbeat_age().as_secs()
        );
    }
    if let Some(report) = crash {
        println!("  crash: {}", report.summary());
    }
    for proposal in &proposals {
        print_proposal(proposal);
    }
    Ok(exit_codes::SUCCESS)
}

async fn parallel(
    ctx: &mut Context,
    backlogs: Vec<PathBuf>,
    max_workers: Option<usize>,
) -> Result<i32> {
    if let Some(max) = max_workers {
        ctx.config.coordinator.max_concurrency = max;
    }
    ctx.config.checkpoint.interactive = false;
    ctx.config.validate()?;

    let coordinator = WorkerCoordinator::new(&ctx.root, &ctx.config, ctx.collaborators());
    let mut cancel = cancellation()?;
    let summary = tokio::select! {
        summary = coordinator.run_all(&backlogs) => summary?,
        _ = cancelled(&mut cancel) => {
            coordinator.cancel_all().await;
            while coordinator.active_count().await > 0 {
                tokio::time::sleep(coordinator.config().poll_interval).await;
                coordinator.poll_liveness().await;
            }
            println!("Cancelled");
            return Ok(exit_codes::PARTIAL);
        }
    };

    for worker in &summary.workers {
        let detail = match &worker.run {
            Some(run) => run.outcome.to_string(),
            None => worker.outcome.label().to_string(),
        };
        println!(
            "{} [{}] {}: {}",
            worker.worker_id(),
            worker.registration.project,
            worker.outcome.label(),
            detail
        );
    }
    for (path, reason) in &summary.launch_failures {
        println!("{} not started: {}", path.display(), reason);
    }
    println!("peak workers alive: {}", summary.peak_alive);
    Ok(summary.exit_code())
}

fn print_proposal(proposal: &SplitProposal) {
    println!(
        "  proposal {} for {} [{}] score {:.1}/{:.1} ({})",
        proposal.id,
        proposal.story_id,
        proposal.status.as_str(),
        proposal.score,
        proposal.threshold,
        proposal.dominant_signal
    );
    for (index, sub) in proposal.sub_stories.iter().enumerate() {
        println!("    {}. {}", index + 1, sub.title);
    }
}

fn split(ctx: &Context, command: SplitCommand) -> Result<i32> {
    let splitter = ctx.splitter()?;
    match command {
        SplitCommand::List => {
            let proposals = splitter.list_open()?;
            if proposals.is_empty() {
                println!("No open split proposals");
            }
            for proposal in &proposals {
                print_proposal(proposal);
            }
        }
        SplitCommand::Approve { id } => {
            let ids = splitter.approve(&id)?;
            println!("Applied {}: {}", id, ids.join(", "));
        }
        SplitCommand::Reject { id, reason } => {
            splitter.reject(&id, &reason)?;
            println!("Rejected {}", id);
        }
        SplitCommand::Edit { id, file } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let edit: ProposalEdit = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", file.display()))?;
            let revised = splitter.edit(&id, &edit)?;
            print_proposal(&revised);
        }
        SplitCommand::Defer { id } => {
            splitter.defer(&id)?;
            println!("Deferred {}", id);
        }
    }
    Ok(exit_codes::SUCCESS)
}

async fn daemon(ctx: &mut Context, command: DaemonCommand) -> Result<i32> {
    if let DaemonCommand::Start {
        workers: Some(workers),
    } = &command
    {
        ctx.config.daemon.workers = *workers;
    }
    ctx.config.checkpoint.interactive = false;
    ctx.config.validate()?;
    let mut daemon = ctx.daemon();

    match command {
        DaemonCommand::Start { .. } => {
            let cancel = cancellation()?;
            println!(
                "Daemon {} started with {} workers",
                daemon.instance_id(),
                ctx.config.daemon.workers
            );
            daemon.run(cancel).await?;
            println!("Daemon stopped");
        }
        DaemonCommand::Stop => {
            daemon.task_queue().request_stop()?;
            println!("Stop requested");
        }
        DaemonCommand::Submit { backlog, priority } => {
            let task = daemon.submit(&backlog, priority)?;
            println!("{} queued ({})", task.id, task.priority);
        }
        DaemonCommand::Cancel { task_id } => {
            let message = match daemon.cancel(&task_id).await? {
                CancelOutcome::Removed => "removed from the queue",
                CancelOutcome::Requested => "cancellation requested",
                CancelOutcome::AlreadyFinished => "already finished",
            };
            println!("{}: {}", task_id, message);
        }
        DaemonCommand::Pause => {
            daemon.pause()?;
            println!("Queue paused");
        }
        DaemonCommand::Resume => {
            daemon.resume()?;
            println!("Queue resumed");
        }
        DaemonCommand::Status { json } => {
            let status = daemon.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", status.summary());
            }
        }
        DaemonCommand::Queue => {
            for task in daemon.queue()? {
                let result = task.result.as_deref().unwrap_or("");
                println!(
                    "{} {:<9} {:<6} {} {}",
                    task.id,
                    task.status.to_string(),
                    task.priority.to_string(),
                    task.backlog_path.display(),
                    result
                );
            }
        }
    }
    Ok(exit_codes::SUCCESS)
}
