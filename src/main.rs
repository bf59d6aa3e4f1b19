use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tfstack::engine::apply::{ApplyError, CancelToken};
use tfstack::engine::plan::Plan;
use tfstack::formatters::OutputFormatter;
use tfstack::shared::logging::{self, LogLevel};
use tfstack::{ApplyOutcome, StackError, TfStack, VarRequest};
use tracing::{debug, error, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "tfstack",
    about = "Workspace-scoped state and module composition for infrastructure stacks.",
    version = APP_VERSION,
    disable_version_flag(true)
)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        long,
        short = 'c',
        value_name = "PATH",
        help = "Path to the configuration file"
    )]
    pub config: Option<String>,

    #[arg(long, short = 'd', value_name = "PATH", help = "Stack project directory")]
    pub dir: Option<String>,

    #[arg(
        long,
        short = 'w',
        value_name = "NAME",
        help = "Workspace to operate on instead of the selected one"
    )]
    pub workspace: Option<String>,

    #[arg(long, short = 'V', help = "Print version")]
    pub version: bool,
}

#[derive(clap::Args)]
struct VarArgs {
    #[arg(long = "var-file", value_name = "PATH", help = "Variable override file, may repeat")]
    var_files: Vec<PathBuf>,

    #[arg(long = "var", value_name = "NAME=VALUE", help = "Set a variable, may repeat")]
    vars: Vec<String>,
}

impl From<VarArgs> for VarRequest {
    fn from(args: VarArgs) -> Self {
        VarRequest {
            var_files: args.var_files,
            vars: args.vars,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Prepare the data directory and the default workspace")]
    Init,

    #[command(subcommand, about = "Manage workspaces")]
    Workspace(WorkspaceCommand),

    #[command(about = "Show the changes an apply would make")]
    Plan {
        #[command(flatten)]
        vars: VarArgs,

        #[arg(long, help = "Print the plan as JSON")]
        json: bool,
    },

    #[command(about = "Apply the configuration to the workspace")]
    Apply {
        #[command(flatten)]
        vars: VarArgs,

        #[arg(long, help = "Skip interactive approval")]
        auto_approve: bool,
    },

    #[command(about = "Destroy every resource the workspace records")]
    Destroy {
        #[arg(long, help = "Skip interactive approval")]
        auto_approve: bool,
    },

    #[command(about = "Show root outputs of the last apply")]
    Output {
        #[arg(long, help = "Print outputs as JSON")]
        json: bool,
    },

    #[command(subcommand, about = "Inspect workspace state")]
    State(StateCommand),

    #[command(about = "Print the module dependency graph in DOT format")]
    Graph,

    #[command(name = "force-unlock", about = "Release a lock left behind by a crashed run")]
    ForceUnlock { lock_id: String },
}

#[derive(Subcommand)]
enum WorkspaceCommand {
    New { name: String },
    Select { name: String },
    List,
    Show,
    Delete {
        name: String,
        #[arg(long, help = "Delete even if the workspace still records resources")]
        force: bool,
    },
}

#[derive(Subcommand)]
enum StateCommand {
    List,
    Show { address: String },
}

#[tokio::main]
async fn main() {
    logging::init(logging::level_from_env(LogLevel::Warning));

    let cli = Cli::parse();

    if cli.version {
        println!("{}", APP_VERSION);
        std::process::exit(0);
    }

    let Some(command) = cli.command else {
        println!("No command specified. Use --help for usage information.");
        return;
    };

    let tfstack = match TfStack::new(cli.config, cli.dir) {
        Ok(tfstack) => tfstack,
        Err(e) => {
            error!("Failed to initialize tfstack: {:#}", e);
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    let workspace = cli
        .workspace
        .unwrap_or_else(|| tfstack.current_workspace());
    debug!("Operating on workspace '{}'", workspace);

    if let Err(err) = run(&tfstack, &workspace, command).await {
        match &err {
            StackError::Apply(ApplyError::Partial(partial)) => {
                eprint!("{}", OutputFormatter::format_partial_failure(partial))
            }
            other => eprintln!("Error: {}", other),
        }
        std::process::exit(1);
    }
}

async fn run(tfstack: &TfStack, workspace: &str, command: Commands) -> Result<(), StackError> {
    match command {
        Commands::Init => {
            tfstack.init()?;
            println!("tfstack initialized in {}", tfstack.project_directory().display());
        }
        Commands::Workspace(cmd) => match cmd {
            WorkspaceCommand::New { name } => {
                tfstack.workspace_new(&name)?;
                println!("Created workspace '{}'", name);
            }
            WorkspaceCommand::Select { name } => {
                tfstack.workspace_select(&name)?;
                println!("Switched to workspace '{}'", name);
            }
            WorkspaceCommand::List => {
                let names = tfstack.workspace_list()?;
                print!("{}", OutputFormatter::format_workspaces(&names, workspace));
            }
            WorkspaceCommand::Show => println!("{}", workspace),
            WorkspaceCommand::Delete { name, force } => {
                tfstack.workspace_delete(&name, force)?;
                println!("Deleted workspace '{}'", name);
            }
        },
        Commands::Plan { vars, json } => {
            let plan = tfstack.plan(workspace, &vars.into()).await?;
            if json {
                println!("{}", render_json(&OutputFormatter::format_plan_json(&plan))?);
            } else {
                print!("{}", OutputFormatter::format_plan(&plan));
            }
        }
        Commands::Apply { vars, auto_approve } => {
            let outcome = tfstack
                .apply(
                    workspace,
                    &vars.into(),
                    |plan| approve(plan, auto_approve, "apply"),
                    interruptible(),
                )
                .await?;
            print_outcome(outcome);
        }
        Commands::Destroy { auto_approve } => {
            let outcome = tfstack
                .destroy(
                    workspace,
                    |plan| approve(plan, auto_approve, "destroy"),
                    interruptible(),
                )
                .await?;
            print_outcome(outcome);
        }
        Commands::Output { json } => {
            let outputs = tfstack.outputs(workspace)?;
            if json {
                println!("{}", render_json(&serde_json::json!(outputs))?);
            } else {
                print!("{}", OutputFormatter::format_outputs(&outputs));
            }
        }
        Commands::State(cmd) => match cmd {
            StateCommand::List => {
                for address in tfstack.state_list(workspace)? {
                    println!("{}", address);
                }
            }
            StateCommand::Show { address } => {
                let (address, record) = tfstack.state_show(workspace, &address)?;
                print!("{}", OutputFormatter::format_record(&address, &record));
            }
        },
        Commands::Graph => print!("{}", tfstack.graph_dot()?),
        Commands::ForceUnlock { lock_id } => {
            let holder = tfstack.force_unlock(workspace, &lock_id)?;
            println!("Workspace '{}' unlocked (was {})", workspace, holder);
        }
    }
    Ok(())
}

fn render_json(value: &serde_json::Value) -> Result<String, StackError> {
    Ok(serde_json::to_string_pretty(value).map_err(anyhow::Error::from)?)
}

/// Cancel token flipped by Ctrl-C
fn interruptible() -> CancelToken {
    let cancel = CancelToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current instance");
            eprintln!("\nInterrupt received. Finishing the current instance, then stopping.");
            handle.cancel();
        }
    });
    cancel
}

/// Show the plan and ask for confirmation unless auto-approved
fn approve(plan: &Plan, auto_approve: bool, verb: &str) -> bool {
    print!("{}", OutputFormatter::format_plan(plan));
    if auto_approve {
        return true;
    }

    print!("\nDo you want to {} these changes? Only 'yes' will be accepted: ", verb);
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => answer.trim() == "yes",
        Err(e) => {
            warn!("Failed to read confirmation: {}", e);
            false
        }
    }
}

fn print_outcome(outcome: ApplyOutcome) {
    match outcome {
        ApplyOutcome::Declined(_) => println!("Cancelled; no changes were made."),
        ApplyOutcome::Applied { plan, report } => {
            if !plan.has_changes() {
                print!("{}", OutputFormatter::format_plan(&plan));
            }
            print!("{}", OutputFormatter::format_apply_report(&report));
        }
    }
}
