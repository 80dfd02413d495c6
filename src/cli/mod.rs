//! CLI subcommands — deploy, undeploy, backup, status, validate.

use crate::core::executor::{self, Request};
use crate::core::params::looks_like_secret;
use crate::core::{parser, state};
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Flags shared by all lifecycle verbs.
#[derive(Args, Debug)]
pub struct OperationArgs {
    /// Stack manifest file(s); the first that exists is used
    #[arg(short, long = "manifest", default_value = "hub.yaml", value_delimiter = ',')]
    pub manifest: Vec<PathBuf>,

    /// State file(s); the first readable is loaded, all are written
    #[arg(short, long = "state", default_value = "state.yaml", value_delimiter = ',')]
    pub state: Vec<PathBuf>,

    /// Restrict the operation to specific component(s)
    #[arg(short, long = "component", value_delimiter = ',')]
    pub components: Vec<String>,

    /// Start the traversal at this component
    #[arg(short, long)]
    pub offset: Option<String>,

    /// Stop the traversal after this component
    #[arg(short, long)]
    pub limit: Option<String>,

    /// Parameter override(s), NAME=VALUE
    #[arg(short, long = "environment")]
    pub environment: Vec<String>,

    /// Directory containing component sources
    #[arg(long)]
    pub components_base_dir: Option<PathBuf>,

    /// Pass each component only its own declared parameters
    #[arg(long)]
    pub strict_parameters: bool,

    /// Invoke `<verb>-test` implementations
    #[arg(long = "dry")]
    pub dry_run: bool,

    /// Capture implicit Git outputs per component
    #[arg(long)]
    pub git_outputs: bool,

    /// Also capture Git worktree cleanliness
    #[arg(long)]
    pub git_outputs_status: bool,

    /// Continue past mandatory component failures
    #[arg(long)]
    pub force: bool,

    /// Cap ready-condition wait budgets, in seconds
    #[arg(long = "wait")]
    pub wait: Option<u64>,

    /// Stream component output while it runs
    #[arg(long)]
    pub pipe: bool,

    /// Publish final outputs to the control plane (needs HUB_API)
    #[arg(long)]
    pub save_outputs: bool,

    /// Control-plane stack instance id for --save-outputs
    #[arg(long)]
    pub stack_instance: Option<String>,

    /// With -c, still recompute final stack outputs
    #[arg(long)]
    pub load_final_state: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Deploy the stack's components in lifecycle order
    Deploy {
        #[command(flatten)]
        args: OperationArgs,
    },

    /// Undeploy the stack's components in reverse order
    Undeploy {
        #[command(flatten)]
        args: OperationArgs,

        /// Guess the offset from the first component with a state entry
        #[arg(long)]
        guess: bool,
    },

    /// Run the stack's backup verb (must be listed in lifecycle.verbs)
    Backup {
        #[command(flatten)]
        args: OperationArgs,
    },

    /// Show the stack status recorded in a state file
    Status {
        /// State file(s); the first readable is shown
        #[arg(short, long = "state", default_value = "state.yaml", value_delimiter = ',')]
        state: Vec<PathBuf>,
    },

    /// Validate a stack manifest without running anything
    Validate {
        /// Stack manifest file(s)
        #[arg(short, long = "manifest", default_value = "hub.yaml", value_delimiter = ',')]
        manifest: Vec<PathBuf>,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Deploy { args } => run_operation("deploy", args, false),
        Commands::Undeploy { args, guess } => run_operation("undeploy", args, guess),
        Commands::Backup { args } => run_operation("backup", args, false),
        Commands::Status { state } => cmd_status(&state),
        Commands::Validate { manifest } => cmd_validate(&manifest),
    }
}

fn run_operation(verb: &str, args: OperationArgs, guess: bool) -> Result<(), String> {
    let request = Request {
        verb: verb.to_string(),
        manifest_filenames: args.manifest,
        state_filenames: args.state,
        components: args.components,
        offset_component: args.offset.unwrap_or_default(),
        limit_component: args.limit.unwrap_or_default(),
        environment_overrides: args.environment,
        components_base_dir: args.components_base_dir,
        strict_parameters: args.strict_parameters,
        dry_run: args.dry_run,
        git_outputs: args.git_outputs,
        git_outputs_status: args.git_outputs_status,
        guess_component: guess,
        force: args.force,
        save_stack_instance_outputs: args.save_outputs,
        stack_instance: args.stack_instance.unwrap_or_default(),
        load_final_state: args.load_final_state,
        pipe_output_in_realtime: args.pipe,
        wait_override: args.wait,
        interactive: true,
        verbose: args.verbose,
    };

    let report = executor::execute(&request)?;

    if !report.stack_outputs.is_empty() {
        println!();
        println!("Stack outputs:");
        for output in &report.stack_outputs {
            let value = if looks_like_secret(&output.name) {
                "(masked)"
            } else {
                output.value.as_str()
            };
            println!("  {} = {}", output.name, value);
        }
    }
    println!();
    println!("Stack status: {}", report.stack_status);

    if report.success() {
        Ok(())
    } else {
        Err(format!(
            "{} finished with status `{}`; failed component(s): {}",
            verb,
            report.operation_status,
            if report.failed_components.is_empty() {
                "(none)".to_string()
            } else {
                report.failed_components.join(", ")
            }
        ))
    }
}

fn cmd_status(state_files: &[PathBuf]) -> Result<(), String> {
    let manifest = match state::load_state(state_files)? {
        Some(m) => m,
        None => {
            println!("No state found. Run `stacksmith deploy` first.");
            return Ok(());
        }
    };

    println!("Stack: {} ({})", manifest.meta.name, manifest.meta.kind);
    println!("  Status: {}", display_or_dash(&manifest.status));
    if !manifest.message.is_empty() {
        println!("  Message: {}", manifest.message);
    }
    println!("  Updated: {}", display_or_dash(&manifest.timestamp));

    if !manifest.components.is_empty() {
        println!("  Components:");
        for name in &manifest.lifecycle.order {
            match manifest.components.get(name) {
                Some(cs) => println!("    {}: {}", name, cs.status),
                None => println!("    {}: (no state)", name),
            }
        }
        for (name, cs) in &manifest.components {
            if !manifest.lifecycle.order.contains(name) {
                println!("    {}: {}", name, cs.status);
            }
        }
    }

    if !manifest.stack_outputs.is_empty() {
        println!("  Outputs:");
        for output in &manifest.stack_outputs {
            let value = if looks_like_secret(&output.name) {
                "(masked)"
            } else {
                output.value.as_str()
            };
            println!("    {} = {}", output.name, value);
        }
    }

    if let Some(op) = manifest.operations.last() {
        println!(
            "  Last operation: {} {} ({}, started {})",
            op.operation, op.id, op.status, op.started
        );
    }
    Ok(())
}

fn display_or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

fn cmd_validate(manifest_files: &[PathBuf]) -> Result<(), String> {
    let cwd = PathBuf::from(".");
    let base = manifest_files
        .iter()
        .find(|f| f.exists())
        .and_then(|f| f.parent().map(|p| p.to_path_buf()))
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(cwd);
    let parsed = parser::parse_manifests(manifest_files, &base, &base)?;
    let errors = parser::validate_stack(&parsed.stack, &parsed.components);

    if errors.is_empty() {
        println!(
            "OK: {} ({} components)",
            parsed.stack.meta.name,
            parsed.stack.components.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}
