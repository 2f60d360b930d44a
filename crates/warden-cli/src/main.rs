//! Warden CLI
//!
//! Usage:
//!   warden hook                                   Guard one hook call read from stdin
//!   warden guard --action edit --path src/a.rs    Guard one action
//!   warden claim agent-1                          Claim an identity
//!   warden role reviewer --task T1                Take a role on a task
//!
//! Exit codes: 0 allowed, 2 blocked (or an error on a mutating request),
//! 1 error.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use warden::bash::analyze;
use warden::policy::GuardDecision;
use warden::state::{FsStateStore, Role, SessionOwner};
use warden::{
    AgentPool, Guard, GuardAction, GuardRequest, HookInput, InitOptions, MustReadGate, ProcIdentitySource,
    ProjectLayout, SessionHint, is_mutating_tool,
};

/// Exit code for a blocked action.
const BLOCKED: u8 = 2;

/// Warden - identity, role and path guard for agents sharing a repository
#[derive(Parser, Debug)]
#[command(name = "warden", version)]
#[command(about = "Identity, role and path guard for agents sharing a repository")]
struct Cli {
    /// Project root (default: nearest directory with .warden/config.toml)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scaffold a project with a pool of agents
    Init {
        /// Number of pool agents
        #[arg(long, default_value_t = 3)]
        agents: usize,
        /// Human responsible for the agents
        #[arg(long, default_value = "")]
        human: String,
        /// Project name (default: directory name)
        #[arg(long)]
        name: Option<String>,
        /// Overwrite existing configuration and templates
        #[arg(long)]
        force: bool,
    },
    /// Add an agent to the pool
    NewAgent {
        /// Agent name
        name: String,
        /// Human responsible for the agent
        #[arg(long, default_value = "")]
        human: String,
    },
    /// Remove an unclaimed agent from the pool
    RemoveAgent {
        /// Agent name
        name: String,
    },
    /// Claim an agent identity for the calling session
    Claim {
        /// Agent name
        name: String,
        /// Host session id
        #[arg(long)]
        session: Option<String>,
        /// Process that owns the claim (default: parent process)
        #[arg(long)]
        owner_pid: Option<u32>,
    },
    /// Release a claimed identity
    Release {
        /// Agent name (default: the caller's agent)
        name: Option<String>,
        /// Host session id
        #[arg(long)]
        session: Option<String>,
    },
    /// Take a role on a task
    Role {
        /// Role name
        role: Role,
        /// Task id
        #[arg(long)]
        task: String,
        /// Agent name (default: the caller's agent)
        #[arg(long)]
        agent: Option<String>,
        /// Host session id
        #[arg(long)]
        session: Option<String>,
    },
    /// Drop the current role
    ClearRole {
        /// Agent name (default: the caller's agent)
        #[arg(long)]
        agent: Option<String>,
        /// Host session id
        #[arg(long)]
        session: Option<String>,
    },
    /// Show the caller's identity and role
    Whoami {
        /// Host session id
        #[arg(long)]
        session: Option<String>,
    },
    /// Show every agent in the pool
    Status,
    /// Report configuration and state problems
    Check,
    /// List files the agent must read before writing
    MustRead {
        /// Agent name (default: the caller's agent)
        #[arg(long)]
        agent: Option<String>,
        /// Host session id
        #[arg(long)]
        session: Option<String>,
    },
    /// Show the file operations a command line would perform
    Analyze {
        /// Command line
        command: String,
    },
    /// Decide whether one action may proceed
    Guard {
        /// Action kind
        #[arg(long)]
        action: GuardAction,
        /// Target path
        #[arg(long, conflicts_with = "command")]
        path: Option<String>,
        /// Command line
        #[arg(long)]
        command: Option<String>,
        /// Host session id
        #[arg(long)]
        session: Option<String>,
    },
    /// Guard one pre-tool-use hook call read from stdin
    Hook,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_env("WARDEN_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    match run_command(cli.project.as_deref(), cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("warden: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Report a tool error. Errors on mutating requests block.
fn tool_error(err: &anyhow::Error, mutating: bool) -> ExitCode {
    eprintln!("error: {:#}", err);
    if mutating {
        ExitCode::from(BLOCKED)
    } else {
        ExitCode::FAILURE
    }
}

fn report(decision: &GuardDecision) -> ExitCode {
    match decision.block_reason() {
        None => ExitCode::SUCCESS,
        Some(reason) => {
            eprintln!("blocked: {}", reason);
            ExitCode::from(BLOCKED)
        }
    }
}

fn layout(project: Option<&Path>, start: Option<&Path>) -> anyhow::Result<ProjectLayout> {
    if let Some(root) = project {
        return Ok(ProjectLayout::new(root));
    }
    let start = match start {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    Ok(ProjectLayout::discover(&start)?)
}

fn open_guard(layout: ProjectLayout) -> anyhow::Result<Guard<FsStateStore, ProcIdentitySource>> {
    let config = layout.load_config()?;
    let store = FsStateStore::new(layout.state_dir());
    Guard::open(layout, &config, store, ProcIdentitySource::new()).context("failed to load off-limits document")
}

fn open_pool(project: Option<&Path>) -> anyhow::Result<AgentPool<FsStateStore, ProcIdentitySource>> {
    Ok(AgentPool::open(layout(project, None)?, ProcIdentitySource::new())?)
}

fn run_hook(project: Option<&Path>) -> ExitCode {
    let mut raw = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut raw) {
        return tool_error(&anyhow::Error::new(e).context("failed to read hook input"), true);
    }

    let input = match HookInput::parse(&raw) {
        Ok(input) => input,
        Err(e) => return tool_error(&e.into(), true),
    };
    let mutating = is_mutating_tool(&input.tool_name);

    let request = match input.to_request() {
        Ok(request) => request,
        Err(e) => return tool_error(&e.into(), mutating),
    };
    let guard = match layout(project, input.working_dir().as_deref()).and_then(open_guard) {
        Ok(guard) => guard,
        Err(e) => return tool_error(&e, mutating),
    };

    tracing::debug!(tool = %input.tool_name, target = %request.target(), "hook call");
    report(&guard.check(&request, &input.session_hint()))
}

fn run_guard(
    project: Option<&Path>,
    action: GuardAction,
    path: Option<String>,
    command: Option<String>,
    session: Option<String>,
) -> ExitCode {
    let mutating = action.is_mutating();
    let request = match (path, command) {
        (_, Some(command)) => match std::env::current_dir() {
            Ok(cwd) => GuardRequest::command_in(command, cwd.to_string_lossy()),
            Err(_) => GuardRequest::command(command),
        },
        (Some(path), None) => GuardRequest::File {
            action,
            path: absolute(&path),
        },
        (None, None) => return tool_error(&anyhow::anyhow!("either --path or --command is required"), mutating),
    };
    let guard = match layout(project, None).and_then(open_guard) {
        Ok(guard) => guard,
        Err(e) => return tool_error(&e, mutating),
    };
    report(&guard.check(&request, &SessionHint::from_session_id(session.as_deref())))
}

/// Relative paths on the command line are relative to the current directory.
fn absolute(path: &str) -> String {
    match std::env::current_dir() {
        Ok(cwd) if Path::new(path).is_relative() => cwd.join(path).to_string_lossy().into_owned(),
        _ => path.to_string(),
    }
}

fn caller(
    pool: &AgentPool<FsStateStore, ProcIdentitySource>,
    agent: Option<String>,
    session: Option<&str>,
) -> anyhow::Result<String> {
    if let Some(agent) = agent {
        return Ok(agent);
    }
    match pool.current_agent(&SessionHint::from_session_id(session)) {
        Some(agent) => Ok(agent),
        None => bail!("no agent claimed by this session; run `warden claim <agent>` first"),
    }
}

fn run_command(project: Option<&Path>, command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Init {
            agents,
            human,
            name,
            force,
        } => {
            let root = match project {
                Some(root) => root.to_path_buf(),
                None => std::env::current_dir().context("cannot determine current directory")?,
            };
            let options = InitOptions {
                agents,
                human,
                name: name.unwrap_or_default(),
                force,
            };
            let layout = warden::init(&root, &options)?;
            println!(
                "Initialized warden project at {} with {} agents",
                layout.root().display(),
                agents
            );
        }
        Command::NewAgent { name, human } => {
            let mut pool = open_pool(project)?;
            pool.new_agent(&name, &human)?;
            println!("Added agent {}", name);
        }
        Command::RemoveAgent { name } => {
            let mut pool = open_pool(project)?;
            pool.remove_agent(&name)?;
            println!("Removed agent {}", name);
        }
        Command::Claim {
            name,
            session,
            owner_pid,
        } => {
            let pool = open_pool(project)?;
            let owner = match owner_pid {
                Some(pid) => SessionOwner {
                    session_id: session,
                    pid: Some(pid),
                },
                None => pool.current_owner(&SessionHint::from_session_id(session.as_deref())),
            };
            let claimed = pool.claim(&name, &owner)?;
            println!("Claimed {} for {}", claimed.agent, claimed.owner());
        }
        Command::Release { name, session } => {
            let pool = open_pool(project)?;
            let name = caller(&pool, name, session.as_deref())?;
            if pool.release(&name)? {
                println!("Released {}", name);
            } else {
                println!("{} was not claimed", name);
            }
        }
        Command::Role {
            role,
            task,
            agent,
            session,
        } => {
            let pool = open_pool(project)?;
            let agent = caller(&pool, agent, session.as_deref())?;
            let state = pool.assign_role(&agent, role, &task)?;
            println!("{} is now {} on {}", agent, role, task);
            if !state.unread_must_reads.is_empty() {
                println!("Read these before your first write:");
                for file in &state.unread_must_reads {
                    println!("  {}", file);
                }
            }
        }
        Command::ClearRole { agent, session } => {
            let pool = open_pool(project)?;
            let agent = caller(&pool, agent, session.as_deref())?;
            pool.clear_role(&agent)?;
            println!("Cleared role of {}", agent);
        }
        Command::Whoami { session } => {
            let pool = open_pool(project)?;
            match pool.whoami(&SessionHint::from_session_id(session.as_deref()))? {
                None => {
                    println!("No agent claimed");
                    return Ok(ExitCode::FAILURE);
                }
                Some(state) => {
                    println!("Agent:  {}", state.name);
                    println!("Status: {}", state.status());
                    if let Some(role) = state.role {
                        println!("Role:   {}", role);
                    }
                    if let Some(task) = &state.task {
                        println!("Task:   {}", task);
                    }
                    if !state.unread_must_reads.is_empty() {
                        println!("Unread: {}", state.unread_must_reads.join(", "));
                    }
                }
            }
        }
        Command::Status => {
            let pool = open_pool(project)?;
            for report in pool.status()? {
                let state = &report.state;
                let role = state.role.map_or("-", |r| r.as_str());
                let task = state.task.as_deref().unwrap_or("-");
                let claim = match (&report.session, report.stale) {
                    (None, _) => "free".to_string(),
                    (Some(session), false) => format!("claimed by {}", session.owner()),
                    (Some(session), true) => format!("stale claim by {}", session.owner()),
                };
                let unlisted = if report.configured { "" } else { " (not in config)" };
                println!(
                    "{:<16} {:<12} {:<12} {} [{} unread]{}",
                    state.name,
                    role,
                    task,
                    claim,
                    state.unread_must_reads.len(),
                    unlisted
                );
            }
        }
        Command::Check => {
            let pool = open_pool(project)?;
            let issues = pool.check()?;
            if issues.is_empty() {
                println!("No problems found");
            } else {
                for issue in &issues {
                    println!("- {}", issue);
                }
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::MustRead { agent, session } => {
            let pool = open_pool(project)?;
            let agent = caller(&pool, agent, session.as_deref())?;
            let unread = MustReadGate::new(pool.store(), pool.layout().root()).unread(&agent)?;
            for file in unread {
                println!("{}", file);
            }
        }
        Command::Analyze { command } => {
            let analysis = analyze(&command);
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Command::Guard {
            action,
            path,
            command,
            session,
        } => return Ok(run_guard(project, action, path, command, session)),
        Command::Hook => return Ok(run_hook(project)),
    }
    Ok(ExitCode::SUCCESS)
}
