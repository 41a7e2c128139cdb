use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use hbplan::agent::{self, AgentCompletion};
use hbplan::cli::{Cli, Commands, CreateArgs, PromptArgs, RunArgs};
use hbplan::config::PlannerConfig;
use hbplan::registry::CommandRegistry;
use hbplan::report::InvocationReport;
use hbplan::template::Bindings;
use hbplan::{CancellationToken, Plan, Planner, PlannerOptions};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = PlannerConfig::load(cli.command.common())?;
    hbplan::logging::init(config.log_level.as_deref(), config.log_file.as_deref())?;

    info!(
        agent_cmd = %config.agent_cmd,
        model = config.model.as_deref().unwrap_or("default"),
        work_dir = %config.work_dir.display(),
        allow_loops = config.allow_loops,
        "config loaded"
    );

    match cli.command {
        Commands::Prompt(args) => prompt(&config, args),
        Commands::Create(args) => create(&config, args),
        Commands::Run(args) => run_plan(&config, args),
    }
}

fn prompt(config: &PlannerConfig, args: PromptArgs) -> anyhow::Result<()> {
    let registry = load_registry(config)?;
    let planner = Planner::new(planner_options(config, None, None)?);
    let text = planner.build_prompt(&args.goal, &registry)?;
    emit(args.output.as_deref(), &text)
}

fn create(config: &PlannerConfig, args: CreateArgs) -> anyhow::Result<()> {
    let registry = load_registry(config)?;
    let agent_path = agent::resolve_agent_cmd(&config.agent_cmd)?;
    let completion = AgentCompletion::new(agent_path, config.work_dir.clone())
        .with_model(config.model.clone())
        .with_timeout_sec(config.completion_timeout_sec)
        .with_retry_count(config.completion_retry_count);

    let last_plan = args
        .last_plan
        .as_deref()
        .map(|p| fs::read_to_string(p).with_context(|| format!("failed to read {}", p.display())))
        .transpose()?;
    let planner = Planner::new(planner_options(config, last_plan, args.last_error)?);

    let plan = planner.create_plan(&args.goal, &completion, &registry)?;
    emit(args.output.as_deref(), &format!("{plan}\n"))
}

fn run_plan(config: &PlannerConfig, args: RunArgs) -> anyhow::Result<()> {
    let registry = load_registry(config)?;
    let source = fs::read_to_string(&args.plan)
        .with_context(|| format!("failed to read plan file {}", args.plan.display()))?;
    let plan = Plan::new(source, "");

    let bindings: Bindings = args.vars.into_iter().collect();
    let result = plan.invoke_with_cancel(&registry, bindings, &CancellationToken::new())?;
    info!(steps = result.invocations.len(), "plan finished");
    println!("{}", result.output);

    if let Some(path) = args.report.as_ref().or(config.report_path.as_ref()) {
        InvocationReport::new(&args.plan, result).write(path)?;
        info!(path = %path.display(), "report written");
    }
    Ok(())
}

fn load_registry(config: &PlannerConfig) -> anyhow::Result<CommandRegistry> {
    let path = config.require_functions_path()?;
    let timeout =
        (config.function_timeout_sec > 0).then(|| Duration::from_secs(config.function_timeout_sec));
    Ok(CommandRegistry::load(path, &config.work_dir, timeout)?)
}

fn planner_options(
    config: &PlannerConfig,
    last_plan: Option<String>,
    last_error: Option<String>,
) -> anyhow::Result<PlannerOptions> {
    let prompt_template = config
        .prompt_path
        .as_deref()
        .map(|p| {
            fs::read_to_string(p)
                .with_context(|| format!("failed to read prompt file {}", p.display()))
        })
        .transpose()?;

    Ok(PlannerOptions {
        allow_loops: config.allow_loops,
        excluded_namespaces: config.excluded_namespaces.clone(),
        excluded_functions: config.excluded_functions.clone(),
        last_plan,
        last_error,
        fallback_to_raw: config.fallback_to_raw,
        prompt_template,
        ..PlannerOptions::default()
    })
}

/// Write `text` to `output`, or to stdout when no path is given.
fn emit(output: Option<&Path>, text: &str) -> anyhow::Result<()> {
    match output {
        Some(path) => fs::write(path, text)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            print!("{text}");
            Ok(())
        }
    }
}
