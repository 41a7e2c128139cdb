use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

/// hbplan: turn a goal into a Handlebars plan and run it against a set of
/// functions.
#[derive(Debug, Parser)]
#[command(name = "hbplan", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the synthesis prompt for a goal without calling a model.
    Prompt(PromptArgs),

    /// Ask the agent for a plan that achieves a goal.
    Create(CreateArgs),

    /// Execute a plan file against the configured functions.
    Run(RunArgs),
}

/// Flags shared by every subcommand. Each can also come from the config
/// file or an `HBPLAN_*` env var. Precedence: CLI > env > file.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct CommonArgs {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the TOML functions manifest.
    #[arg(long)]
    pub functions: Option<PathBuf>,

    /// Working directory for function commands and the agent (default: ".").
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Agent CLI binary name or path (default: "agent").
    #[arg(long)]
    pub agent_cmd: Option<String>,

    /// Model override (omit for the agent's default).
    #[arg(long)]
    pub model: Option<String>,

    /// Custom prompt file with {{GOAL}} and {{FUNCTIONS}} placeholders.
    #[arg(long)]
    pub prompt_file: Option<PathBuf>,

    /// Tell the model not to use loops and reject plans that do.
    #[arg(long)]
    pub no_loops: bool,

    /// Log level (trace, debug, info, warn, error). HBPLAN_LOG wins when set.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Also write JSON logs to this file (appended).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct PromptArgs {
    /// The goal the plan should achieve.
    #[arg(long)]
    pub goal: String,

    /// Write the prompt to this file instead of stdout.
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Clone, clap::Args)]
pub struct CreateArgs {
    /// The goal the plan should achieve.
    #[arg(long)]
    pub goal: String,

    /// Write the plan to this file instead of stdout.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// A previous plan that failed; shown to the model for correction.
    #[arg(long)]
    pub last_plan: Option<PathBuf>,

    /// The error the previous plan produced.
    #[arg(long, requires = "last_plan")]
    pub last_error: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
    /// Path to the plan template file.
    #[arg(long)]
    pub plan: PathBuf,

    /// Initial variable binding; the value is parsed as JSON when possible.
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, Value)>,

    /// Write an invocation report (JSON) to this file.
    #[arg(long)]
    pub report: Option<PathBuf>,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl Commands {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Commands::Prompt(args) => &args.common,
            Commands::Create(args) => &args.common,
            Commands::Run(args) => &args.common,
        }
    }
}

fn parse_var(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("variable name is empty in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()));
    Ok((key.to_owned(), value))
}
