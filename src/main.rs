//! Flowgate CLI Entry Point
//!
//! Drives the engine against a JSON state file so workflows can be
//! registered, started, approved and supervised across invocations.
//!
//! # Usage
//!
//! ```bash
//! # Register definitions from YAML
//! flowgate register workflows.yaml
//!
//! # Start an instance
//! flowgate --roles alice=CLINIC_ADMIN start staff-onboarding --entity-type Staff --entity-id 42
//!
//! # Decide an approval
//! flowgate --roles alice=CLINIC_ADMIN approve <EXECUTION_ID> --approver alice
//!
//! # Run the supervisor until Ctrl-C
//! flowgate supervise
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use log::{info, warn};
use tokio::sync::watch;
use uuid::Uuid;

use flowgate::clock::SystemClock;
use flowgate::execution::{
    Engine, ExecutionStatus, InMemoryInstanceStore, InstanceStatus, InstanceView, Snapshot,
    StartRequest, StepDispatcher, Supervisor, WorkflowExecution,
};
use flowgate::services::{
    HandlerRegistry, HandlerServiceInvoker, LogNotificationService, StaticIdentityService,
};
use flowgate::workflow::{load_definitions, DataMap, DefinitionStore, InMemoryDefinitionStore};
use flowgate::{EngineConfig, EngineError, APP_NAME, VERSION};

/// Default location of the state file.
const DEFAULT_STATE: &str = ".flowgate/state.json";

#[derive(Parser, Debug)]
#[command(name = "flowgate", version, about = "Workflow orchestration engine for approval processes")]
struct Cli {
    /// JSON state file holding definitions, instances and executions
    #[arg(long, global = true, env = "FLOWGATE_STATE", default_value = DEFAULT_STATE)]
    state: PathBuf,

    /// YAML engine configuration
    #[arg(long, global = true, env = "FLOWGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Role assignments, e.g. alice=CLINIC_ADMIN,HR (repeatable)
    #[arg(long = "roles", global = true, value_name = "USER=ROLES")]
    roles: Vec<String>,

    /// Maximum concurrent step dispatches
    #[arg(long, global = true)]
    parallel: Option<usize>,

    /// Seconds between supervisor cycles
    #[arg(long, global = true)]
    interval: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register workflow definitions from a YAML file
    Register { file: PathBuf },

    /// List active definitions
    Definitions {
        #[arg(long)]
        category: Option<String>,
    },

    /// Start a workflow instance
    Start {
        workflow: String,
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        entity_id: String,
        #[arg(long)]
        version: Option<u32>,
        #[arg(long)]
        business_key: Option<String>,
        /// Input data as a JSON object
        #[arg(long)]
        input: Option<String>,
        /// Initial context data as a JSON object
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        started_by: Option<String>,
        #[arg(long)]
        priority: Option<i32>,
        /// Create the instance without running it
        #[arg(long)]
        no_auto_start: bool,
    },

    /// Show an instance with its executions and timeline
    Show { instance: Uuid },

    /// Re-drive a created or waiting instance
    Resume { instance: Uuid },

    /// Cancel an instance
    Cancel {
        instance: Uuid,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Approve a waiting approval step
    Approve {
        execution: Uuid,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Reject a waiting approval step
    Reject {
        execution: Uuid,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        notes: Option<String>,
    },

    /// List approvals waiting on a user or role
    Pending {
        #[arg(long, conflicts_with = "role", required_unless_present = "role")]
        user: Option<String>,
        #[arg(long)]
        role: Option<String>,
    },

    /// Run the timeout and retry supervisor
    Supervise {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Parses `user=ROLE1,ROLE2` assignments into an identity service.
fn build_identity(assignments: &[String]) -> Result<StaticIdentityService, String> {
    let identity = StaticIdentityService::new();
    for assignment in assignments {
        let (user, roles) = assignment
            .split_once('=')
            .ok_or_else(|| format!("Invalid role assignment '{}', expected USER=ROLES", assignment))?;
        for role in roles.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            identity.grant(user.trim(), role);
        }
    }
    Ok(identity)
}

fn parse_data(raw: Option<&str>, what: &str) -> Result<DataMap, String> {
    match raw {
        None => Ok(DataMap::new()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| format!("--{} must be a JSON object: {}", what, e)),
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig, EngineError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(parallel) = cli.parallel {
        config.max_parallel_dispatch = parallel;
    }
    if let Some(interval) = cli.interval {
        config.supervisor_interval_secs = interval;
    }
    config.validate()?;
    Ok(config)
}

/// Builds an engine over the stores restored from `snapshot`.
fn build_engine(
    config: EngineConfig,
    snapshot: Snapshot,
    identity: StaticIdentityService,
) -> Result<Engine, EngineError> {
    let definitions = InMemoryDefinitionStore::new();
    for definition in snapshot.definitions {
        definitions.register(definition)?;
    }
    let store = InMemoryInstanceStore::from_records(snapshot.instances, snapshot.executions);

    let clock = Arc::new(SystemClock);
    let identity = Arc::new(identity);
    let handlers = HandlerRegistry::with_builtins(identity.clone());
    let dispatcher = StepDispatcher::new(
        identity,
        Arc::new(LogNotificationService::new()),
        Arc::new(HandlerServiceInvoker::new(handlers.clone())),
        handlers,
        clock.clone(),
    );

    Ok(Engine::new(
        config,
        Arc::new(definitions),
        Arc::new(store),
        dispatcher,
        clock,
    ))
}

fn paint_instance(status: InstanceStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        InstanceStatus::Completed => text.green(),
        InstanceStatus::Failed | InstanceStatus::Timeout => text.red(),
        InstanceStatus::Cancelled => text.dimmed(),
        InstanceStatus::Waiting => text.yellow(),
        InstanceStatus::Created | InstanceStatus::Running => text.cyan(),
    }
}

fn paint_execution(status: ExecutionStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        ExecutionStatus::Completed => text.green(),
        ExecutionStatus::Failed => text.red(),
        ExecutionStatus::Skipped => text.dimmed(),
        ExecutionStatus::WaitingApproval => text.yellow(),
        ExecutionStatus::Pending | ExecutionStatus::Running => text.cyan(),
    }
}

fn print_execution(execution: &WorkflowExecution) {
    print!(
        "  [{}] {:24} {:16} {}",
        execution.step_order,
        execution.step_name,
        execution.step_type.to_string(),
        paint_execution(execution.status)
    );
    if execution.retry_count > 0 {
        print!(" (retries: {})", execution.retry_count);
    }
    println!();
    println!("      id: {}", execution.id);
    if !execution.assigned_to.is_empty() {
        println!("      assigned to: {}", execution.assigned_to.join(", "));
    }
    if let Some(message) = &execution.error_message {
        println!("      {}", message.red());
    }
}

fn print_view(view: &InstanceView) {
    let instance = &view.instance;
    println!();
    println!("{}", instance.instance_name.bold());
    println!("  id:       {}", instance.id);
    println!(
        "  workflow: {} v{}",
        instance.workflow_name, instance.workflow_version
    );
    println!("  status:   {}", paint_instance(instance.status));
    if let Some(key) = &instance.business_key {
        println!("  key:      {}", key);
    }
    if let Some(step) = &instance.current_step_name {
        println!("  current:  {}", step);
    }
    if let Some(message) = &instance.error_message {
        println!("  error:    {}", message.red());
    }
    if !instance.output_data.is_empty() {
        println!(
            "  output:   {}",
            serde_json::to_string(&instance.output_data).unwrap_or_default()
        );
    }
    println!();
    for execution in &view.executions {
        print_execution(execution);
    }
    println!();
}

async fn wait_for_ctrl_c(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        return;
    }
    info!("Received Ctrl-C, stopping");
    let _ = shutdown.send(true);
}

/// Main application entry point.
async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    let identity = build_identity(&cli.roles)?;
    let snapshot = Snapshot::load(&cli.state)?;
    let engine = build_engine(config, snapshot, identity)?;

    match cli.command {
        Command::Register { file } => {
            for definition in load_definitions(&file)? {
                let stored = engine.register_definition(definition)?;
                println!("{} {}", "registered".green(), stored.label());
            }
        }
        Command::Definitions { category } => {
            for definition in engine.list_definitions(category.as_deref()) {
                println!(
                    "{:32} v{:<4} {:12} {} steps",
                    definition.name,
                    definition.version,
                    definition.category,
                    definition.len()
                );
            }
        }
        Command::Start {
            workflow,
            entity_type,
            entity_id,
            version,
            business_key,
            input,
            context,
            started_by,
            priority,
            no_auto_start,
        } => {
            let mut request = StartRequest::new(workflow, entity_type, entity_id)
                .with_input(parse_data(input.as_deref(), "input")?)
                .with_context(parse_data(context.as_deref(), "context")?)
                .with_auto_start(!no_auto_start);
            if let Some(version) = version {
                request = request.with_version(version);
            }
            if let Some(key) = business_key {
                request = request.with_business_key(key);
            }
            if let Some(user) = started_by {
                request = request.started_by(user);
            }
            if let Some(priority) = priority {
                request = request.with_priority(priority);
            }
            print_view(&engine.start(request).await?);
        }
        Command::Show { instance } => {
            print_view(&engine.get_instance(instance)?);
            println!("{}", engine.timeline(instance)?.summary());
        }
        Command::Resume { instance } => {
            print_view(&engine.resume(instance).await?);
        }
        Command::Cancel { instance, reason } => {
            let cancelled = engine.cancel(instance, &reason)?;
            println!("{} {}", cancelled.instance_name, paint_instance(cancelled.status));
        }
        Command::Approve {
            execution,
            approver,
            notes,
        } => {
            let decided = engine
                .resolve_approval(execution, &approver, true, notes.as_deref())
                .await?;
            print_view(&engine.get_instance(decided.instance_id)?);
        }
        Command::Reject {
            execution,
            approver,
            notes,
        } => {
            let decided = engine
                .resolve_approval(execution, &approver, false, notes.as_deref())
                .await?;
            print_view(&engine.get_instance(decided.instance_id)?);
        }
        Command::Pending { user, role } => {
            let pending = match (user, role) {
                (Some(user), _) => engine.pending_approvals_for_user(&user).await?,
                (None, Some(role)) => engine.pending_approvals_for_role(&role),
                (None, None) => Vec::new(),
            };
            if pending.is_empty() {
                println!("No pending approvals");
            }
            for execution in &pending {
                print_execution(execution);
                println!("      instance: {}", execution.instance_id);
            }
        }
        Command::Supervise { once } => {
            let supervisor = Supervisor::new(engine.clone());
            if once {
                let report = supervisor.run_cycle().await?;
                let wait = engine.config().supervisor_interval();
                if tokio::time::timeout(wait, supervisor.settle()).await.is_err() {
                    warn!("Re-drives still running after {:?}; saving state as is", wait);
                }
                println!("{:?}", report);
            } else {
                let (tx, rx) = watch::channel(false);
                tokio::spawn(wait_for_ctrl_c(tx));
                supervisor.run(rx).await;
            }
        }
    }

    engine.snapshot().save(&cli.state)?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    info!("{} v{}", APP_NAME, VERSION);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
