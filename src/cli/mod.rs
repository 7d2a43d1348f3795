//! CLI subcommands: init, validate, graph, plan, apply, destroy, status, output, unlock.

use crate::core::executor::{self, ApplyConfig, CancelToken};
use crate::core::resolver::{self, DependencyGraph};
use crate::core::{parser, planner, state, types};
use crate::error::{Result, StrataError};
use crate::provider::command::CommandProvider;
use crate::provider::local::LocalProvider;
use crate::provider::ResourceProvider;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new strata project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate strata.yaml without touching any state
    Validate {
        #[command(flatten)]
        project: ProjectArgs,
    },

    /// Show stack and node evaluation order
    Graph {
        #[command(flatten)]
        project: ProjectArgs,
    },

    /// Show execution plan (diff declared vs recorded)
    Plan {
        #[command(flatten)]
        project: ProjectArgs,

        /// Plan a teardown instead
        #[arg(long)]
        destroy: bool,
    },

    /// Provision stacks to match the declaration
    Apply {
        #[command(flatten)]
        project: ProjectArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Tear down recorded resources, consumers first
    Destroy {
        #[command(flatten)]
        project: ProjectArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Show recorded state per stack
    Status {
        #[command(flatten)]
        project: ProjectArgs,
    },

    /// Print stack outputs
    Output {
        #[command(flatten)]
        project: ProjectArgs,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Remove a stale state lock
    Unlock {
        #[command(flatten)]
        project: ProjectArgs,
    },
}

/// Project selection shared by every command that reads strata.yaml.
#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    /// Path to strata.yaml
    #[arg(short, long, default_value = "strata.yaml")]
    pub file: PathBuf,

    /// Restrict to these stacks (repeatable)
    #[arg(short, long = "stack", value_name = "STACK")]
    pub stacks: Vec<String>,

    /// Override a param (repeatable)
    #[arg(short, long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,
}

/// Execution knobs for apply and destroy.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Maximum in-flight provider calls per stack
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// External provider plugin command line
    #[arg(long, value_name = "COMMAND")]
    pub provider_cmd: Option<String>,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { project } => cmd_validate(&project),
        Commands::Graph { project } => cmd_graph(&project),
        Commands::Plan { project, destroy } => cmd_plan(&project, destroy),
        Commands::Apply { project, run } => cmd_run(&project, &run, false),
        Commands::Destroy { project, run } => cmd_run(&project, &run, true),
        Commands::Status { project } => cmd_status(&project),
        Commands::Output { project, json } => cmd_output(&project, json),
        Commands::Unlock { project } => cmd_unlock(&project),
    }
}

fn cmd_init(path: &Path) -> Result<()> {
    let config_path = path.join("strata.yaml");
    if config_path.exists() {
        return Err(StrataError::Config(format!(
            "{} already exists",
            config_path.display()
        )));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| StrataError::io(&state_dir, e))?;

    let template = r#"version: "1.0"
name: my-infrastructure
description: "Managed by strata"

params:
  env: dev
  region: us-east-1

backend:
  location: state
  key_prefix: "{{params.env}}/my-infrastructure"

policy:
  failure: continue_independent
  concurrency: 4
  provenance: true

stacks:
  network:
    resources:
      vpc:
        kind: vpc
        inputs:
          name: "{{params.env}}-vpc"
          cidr_block: 10.0.0.0/16
    outputs:
      vpc_id: "${vpc.id}"
"#;
    std::fs::write(&config_path, template).map_err(|e| StrataError::io(&config_path, e))?;

    println!("Initialized strata project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn overrides(args: &ProjectArgs) -> Result<Vec<(String, serde_json::Value)>> {
    args.params
        .iter()
        .map(|p| parser::parse_param_override(p))
        .collect()
}

/// Parse, validate and declare the project, then build its graph.
fn load(args: &ProjectArgs) -> Result<(types::Project, DependencyGraph)> {
    let project = parser::load_project(&args.file, &overrides(args)?)?;
    let graph = resolver::build_graph(&project)?;
    Ok((project, graph))
}

fn cmd_validate(args: &ProjectArgs) -> Result<()> {
    let mut config = parser::parse_config_file(&args.file)?;
    parser::apply_param_overrides(&mut config, &overrides(args)?);

    let mut errors = parser::validate_config(&config);
    let project = if errors.is_empty() {
        match parser::declare(&config) {
            Ok(p) => Some(p),
            Err(e) => {
                errors.push(e);
                None
            }
        }
    } else {
        None
    };
    if let Some(p) = &project {
        errors.extend(parser::validate_project(p));
        if errors.is_empty() {
            if let Err(e) = resolver::build_graph(p) {
                errors.push(e);
            }
        }
    }

    match project {
        Some(p) if errors.is_empty() => {
            let resources: usize = p.stacks.values().map(|s| s.nodes.len()).sum();
            println!(
                "OK: {} ({} stacks, {} resources)",
                p.name,
                p.stacks.len(),
                resources
            );
            Ok(())
        }
        _ => {
            for e in &errors {
                eprintln!("  ERROR: {}", e);
            }
            Err(StrataError::Config(format!(
                "{} validation error(s)",
                errors.len()
            )))
        }
    }
}

fn cmd_graph(args: &ProjectArgs) -> Result<()> {
    let (_, graph) = load(args)?;
    let selected = planner::select_stacks(&graph, &args.stacks)?;
    for name in &selected {
        let Some(stack) = graph.stacks.get(name) else {
            continue;
        };
        if stack.upstream.is_empty() {
            println!("{}:", name);
        } else {
            println!("{} (after {}):", name, stack.upstream.join(", "));
        }
        for node in &stack.order {
            let deps = stack.deps.get(node).map(Vec::as_slice).unwrap_or_default();
            if deps.is_empty() {
                println!("  {}", node);
            } else {
                println!("  {} <- {}", node, deps.join(", "));
            }
        }
        let mut consumed: Vec<String> = stack
            .cross_refs
            .iter()
            .map(|(token, output)| format!("{}.{}", token.stack, output))
            .collect();
        consumed.sort();
        consumed.dedup();
        if !consumed.is_empty() {
            println!("  consumes: {}", consumed.join(", "));
        }
    }
    Ok(())
}

fn cmd_plan(args: &ProjectArgs, destroy: bool) -> Result<()> {
    let (project, graph) = load(args)?;
    let selected = planner::select_stacks(&graph, &args.stacks)?;
    let plan = if destroy {
        planner::plan_destroy(&project, &graph, &selected)?
    } else {
        planner::plan(&project, &graph, &selected)?
    };
    print_plan(&plan);
    Ok(())
}

/// Display a plan to stdout.
fn print_plan(plan: &types::ExecutionPlan) {
    println!("Planning: {} ({} resources)", plan.name, plan.changes.len());
    println!();

    let mut current_stack = String::new();
    for change in &plan.changes {
        if change.stack != current_stack {
            current_stack.clone_from(&change.stack);
            println!("{}:", current_stack);
        }
        println!("  {} {}", symbol(change.action), change.description);
    }

    println!();
    println!(
        "Plan: {} to add, {} to change, {} to destroy, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_destroy, plan.unchanged
    );
}

fn symbol(action: types::PlanAction) -> &'static str {
    match action {
        types::PlanAction::Create => "+",
        types::PlanAction::Update => "~",
        types::PlanAction::Destroy => "-",
        types::PlanAction::NoOp => " ",
    }
}

fn provider(run: &RunArgs) -> Result<Arc<dyn ResourceProvider>> {
    Ok(match &run.provider_cmd {
        Some(line) => Arc::new(CommandProvider::from_command_line(line)?),
        None => Arc::new(LocalProvider::new()),
    })
}

fn cmd_run(args: &ProjectArgs, run: &RunArgs, destroy: bool) -> Result<()> {
    let (mut project, graph) = load(args)?;
    if let Some(concurrency) = run.concurrency {
        if concurrency == 0 {
            return Err(StrataError::Config(
                "--concurrency must be at least 1".to_string(),
            ));
        }
        project.policy.concurrency = concurrency;
    }
    let selected = planner::select_stacks(&graph, &args.stacks)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| StrataError::Config(format!("cannot start async runtime: {}", e)))?;

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight provider calls");
            on_interrupt.cancel();
        }
    });

    let cfg = ApplyConfig {
        project: &project,
        graph: &graph,
        stacks: &selected,
        provider: provider(run)?,
        cancel,
    };
    let report = if destroy {
        runtime.block_on(executor::destroy(&cfg))?
    } else {
        runtime.block_on(executor::apply(&cfg))?
    };

    print_report(&report, destroy);
    if report.success() {
        Ok(())
    } else {
        Err(StrataError::RunFailed {
            failed: report.failed(),
            skipped: report.skipped(),
        })
    }
}

/// Per-stack summary plus one line for every node that did not reach its goal.
fn print_report(report: &types::RunReport, destroy: bool) {
    let verb = if destroy { "destroyed" } else { "changed" };
    let mut changed = 0;
    let mut unchanged = 0;

    for stack in &report.stacks {
        if let Some(reason) = &stack.blocked {
            println!("{}: BLOCKED ({})", stack.stack, reason);
            continue;
        }
        println!(
            "{}: {} {}, {} unchanged, {} failed, {} skipped ({:.1}s)",
            stack.stack,
            stack.changed(),
            verb,
            stack.unchanged(),
            stack.count(types::NodeStatus::Failed),
            stack.count(types::NodeStatus::Skipped),
            stack.total_duration.as_secs_f64()
        );
        for node in &stack.nodes {
            if matches!(
                node.status,
                types::NodeStatus::Failed | types::NodeStatus::Skipped
            ) {
                println!(
                    "  {} {}: {}",
                    node.status,
                    node.address,
                    node.error.as_deref().unwrap_or("")
                );
            }
        }
        changed += stack.changed();
        unchanged += stack.unchanged();
    }

    println!();
    if report.success() {
        let action = if destroy { "Destroy" } else { "Apply" };
        println!(
            "{} complete: {} {}, {} unchanged.",
            action, changed, verb, unchanged
        );
    } else {
        println!(
            "Run completed with errors: {} {}, {} FAILED, {} SKIPPED",
            changed,
            verb,
            report.failed(),
            report.skipped()
        );
    }
}

fn cmd_status(args: &ProjectArgs) -> Result<()> {
    let (project, graph) = load(args)?;
    let selected = planner::select_stacks(&graph, &args.stacks)?;
    let mut found = false;

    for name in &selected {
        let Some(stack) = project.stacks.get(name) else {
            continue;
        };
        if let Some(holder) = state::lock_holder(&stack.backend)? {
            println!(
                "Stack: {} LOCKED by pid {} since {}",
                name, holder.pid, holder.acquired_at
            );
        }
        let Some(record) = state::load_for(stack)? else {
            continue;
        };
        found = true;
        println!("Stack: {} ({}, serial {})", record.stack, record.region, record.serial);
        println!("  Backend:   {}", stack.backend);
        println!("  Generated: {}", record.generated_at);
        println!("  Generator: {}", record.generator);
        println!("  Resources: {}", record.resources.len());
        for (address, entry) in &record.resources {
            let duration = entry
                .duration_seconds
                .map(|d| format!(" ({:.2}s)", d))
                .unwrap_or_default();
            println!("    {}: {} [{}]{}", address, entry.status, entry.kind, duration);
        }
        println!();
    }

    if !found {
        println!("No state found. Run `strata apply` first.");
    }
    Ok(())
}

fn cmd_output(args: &ProjectArgs, json: bool) -> Result<()> {
    let (project, graph) = load(args)?;
    let selected = planner::select_stacks(&graph, &args.stacks)?;
    let outputs = collect_outputs(&project, &selected)?;

    if json {
        let body = serde_json::to_string_pretty(&outputs)
            .map_err(|e| StrataError::Serialize(e.to_string()))?;
        println!("{}", body);
        return Ok(());
    }

    for (stack, values) in &outputs {
        for (name, value) in values {
            match value {
                serde_json::Value::Null => println!("{}.{} = <unavailable>", stack, name),
                v => println!("{}.{} = {}", stack, name, v),
            }
        }
    }
    Ok(())
}

/// Recorded outputs per stack; unavailable outputs become `null`.
fn collect_outputs(
    project: &types::Project,
    stacks: &[String],
) -> Result<indexmap::IndexMap<String, indexmap::IndexMap<String, serde_json::Value>>> {
    let mut all = indexmap::IndexMap::new();
    for name in stacks {
        let Some(stack) = project.stacks.get(name) else {
            continue;
        };
        let Some(record) = state::load_for(stack)? else {
            continue;
        };
        let values = record
            .outputs
            .iter()
            .map(|(k, v)| {
                let value = v.as_available().cloned().unwrap_or(serde_json::Value::Null);
                (k.clone(), value)
            })
            .collect();
        all.insert(name.clone(), values);
    }
    Ok(all)
}

fn cmd_unlock(args: &ProjectArgs) -> Result<()> {
    let (project, graph) = load(args)?;
    let selected = planner::select_stacks(&graph, &args.stacks)?;
    for name in &selected {
        let Some(stack) = project.stacks.get(name) else {
            continue;
        };
        if state::force_unlock(&stack.backend)? {
            println!("{}: lock removed", name);
        } else {
            println!("{}: not locked", name);
        }
    }
    Ok(())
}
