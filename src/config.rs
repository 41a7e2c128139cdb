use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::CommonArgs;
use crate::error::PlannerError;

// Precedence: CLI > env > file > defaults.

const DEFAULT_AGENT_CMD: &str = "agent";
const DEFAULT_WORK_DIR: &str = ".";
const DEFAULT_COMPLETION_TIMEOUT_SEC: u64 = 600;
const DEFAULT_COMPLETION_RETRY_COUNT: u32 = 0;
const DEFAULT_FUNCTION_TIMEOUT_SEC: u64 = 300;

const ENV_PREFIX: &str = "HBPLAN_";

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerConfig {
    pub agent_cmd: String,
    pub model: Option<String>,
    /// TOML manifest declaring the callable functions.
    pub functions_path: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub completion_timeout_sec: u64,
    pub completion_retry_count: u32,
    /// Per function call; 0 disables the limit.
    pub function_timeout_sec: u64,
    pub allow_loops: bool,
    pub excluded_namespaces: Vec<String>,
    pub excluded_functions: Vec<String>,
    pub fallback_to_raw: bool,
    /// Custom prompt template with `{{GOAL}}` / `{{FUNCTIONS}}` placeholders.
    pub prompt_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

/// Raw TOML shape. Every field is optional; unknown keys are rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    agent_cmd: Option<String>,
    model: Option<String>,
    functions_path: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    completion_timeout_sec: Option<u64>,
    completion_retry_count: Option<u32>,
    function_timeout_sec: Option<u64>,
    allow_loops: Option<bool>,
    excluded_namespaces: Option<Vec<String>>,
    excluded_functions: Option<Vec<String>>,
    fallback_to_raw: Option<bool>,
    prompt_path: Option<PathBuf>,
    report_path: Option<PathBuf>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
}

/// One precedence layer; `None` means "not set here".
#[derive(Debug, Default)]
struct ConfigLayer {
    agent_cmd: Option<String>,
    model: Option<String>,
    functions_path: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    completion_timeout_sec: Option<u64>,
    completion_retry_count: Option<u32>,
    function_timeout_sec: Option<u64>,
    allow_loops: Option<bool>,
    excluded_namespaces: Option<Vec<String>>,
    excluded_functions: Option<Vec<String>>,
    fallback_to_raw: Option<bool>,
    prompt_path: Option<PathBuf>,
    report_path: Option<PathBuf>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
}

impl PlannerConfig {
    /// Load configuration with precedence: CLI > env > file > defaults.
    ///
    /// The config file comes from `--config` when given.
    pub fn load(cli_args: &CommonArgs) -> anyhow::Result<Self> {
        Self::load_with_env(cli_args, real_env_var)
    }

    /// The functions manifest path, or an error naming every way to set it.
    pub fn require_functions_path(&self) -> anyhow::Result<&Path> {
        self.functions_path.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "functions_path is required (via --functions, {ENV_PREFIX}FUNCTIONS_PATH, or config file)"
            )
        })
    }

    /// Accepts the env lookup as a parameter so tests never touch the
    /// process environment.
    fn load_with_env(
        cli_args: &CommonArgs,
        env_fn: fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let file_layer = match &cli_args.config {
            Some(path) => load_file_layer(path)?,
            None => ConfigLayer::default(),
        };
        let env_layer = load_env_layer(env_fn)?;
        let cli_layer = cli_layer_from(cli_args);

        let merged = merge_layers(file_layer, env_layer, cli_layer);

        Ok(PlannerConfig {
            agent_cmd: merged
                .agent_cmd
                .unwrap_or_else(|| DEFAULT_AGENT_CMD.to_owned()),
            model: merged.model,
            functions_path: merged.functions_path,
            work_dir: merged
                .work_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR)),
            completion_timeout_sec: merged
                .completion_timeout_sec
                .unwrap_or(DEFAULT_COMPLETION_TIMEOUT_SEC),
            completion_retry_count: merged
                .completion_retry_count
                .unwrap_or(DEFAULT_COMPLETION_RETRY_COUNT),
            function_timeout_sec: merged
                .function_timeout_sec
                .unwrap_or(DEFAULT_FUNCTION_TIMEOUT_SEC),
            allow_loops: merged.allow_loops.unwrap_or(true),
            excluded_namespaces: merged.excluded_namespaces.unwrap_or_default(),
            excluded_functions: merged.excluded_functions.unwrap_or_default(),
            fallback_to_raw: merged.fallback_to_raw.unwrap_or(true),
            prompt_path: merged.prompt_path,
            report_path: merged.report_path,
            log_level: merged.log_level,
            log_file: merged.log_file,
        })
    }
}

fn load_file_layer(path: &Path) -> anyhow::Result<ConfigLayer> {
    let contents = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
    let fc: FileConfig = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
    Ok(ConfigLayer {
        agent_cmd: fc.agent_cmd,
        model: fc.model,
        functions_path: fc.functions_path,
        work_dir: fc.work_dir,
        completion_timeout_sec: fc.completion_timeout_sec,
        completion_retry_count: fc.completion_retry_count,
        function_timeout_sec: fc.function_timeout_sec,
        allow_loops: fc.allow_loops,
        excluded_namespaces: fc.excluded_namespaces,
        excluded_functions: fc.excluded_functions,
        fallback_to_raw: fc.fallback_to_raw,
        prompt_path: fc.prompt_path,
        report_path: fc.report_path,
        log_level: fc.log_level,
        log_file: fc.log_file,
    })
}

fn real_env_var(suffix: &str) -> Option<String> {
    let key = format!("{ENV_PREFIX}{suffix}");
    env::var(&key).ok().filter(|v| !v.is_empty())
}

fn load_env_layer(env_fn: fn(&str) -> Option<String>) -> Result<ConfigLayer, PlannerError> {
    Ok(ConfigLayer {
        agent_cmd: env_fn("AGENT_CMD"),
        model: env_fn("MODEL"),
        functions_path: env_fn("FUNCTIONS_PATH").map(PathBuf::from),
        work_dir: env_fn("WORK_DIR").map(PathBuf::from),
        completion_timeout_sec: parse_env(env_fn, "COMPLETION_TIMEOUT_SEC")?,
        completion_retry_count: parse_env(env_fn, "COMPLETION_RETRY_COUNT")?,
        function_timeout_sec: parse_env(env_fn, "FUNCTION_TIMEOUT_SEC")?,
        allow_loops: parse_env(env_fn, "ALLOW_LOOPS")?,
        excluded_namespaces: env_fn("EXCLUDED_NAMESPACES").as_deref().map(split_list),
        excluded_functions: env_fn("EXCLUDED_FUNCTIONS").as_deref().map(split_list),
        fallback_to_raw: parse_env(env_fn, "FALLBACK_TO_RAW")?,
        prompt_path: env_fn("PROMPT_PATH").map(PathBuf::from),
        report_path: env_fn("REPORT_PATH").map(PathBuf::from),
        log_level: env_fn("LOG_LEVEL"),
        log_file: env_fn("LOG_FILE").map(PathBuf::from),
    })
}

/// Comma-separated list; blank entries are dropped.
fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_env<T>(env_fn: fn(&str) -> Option<String>, suffix: &str) -> Result<Option<T>, PlannerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_fn(suffix) {
        Some(s) => s
            .parse::<T>()
            .map(Some)
            .map_err(|e| PlannerError::ConfigEnvParseError {
                var: format!("{ENV_PREFIX}{suffix}"),
                detail: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn cli_layer_from(args: &CommonArgs) -> ConfigLayer {
    ConfigLayer {
        agent_cmd: args.agent_cmd.clone(),
        model: args.model.clone(),
        functions_path: args.functions.clone(),
        work_dir: args.work_dir.clone(),
        allow_loops: if args.no_loops { Some(false) } else { None },
        prompt_path: args.prompt_file.clone(),
        log_level: args.log_level.clone(),
        log_file: args.log_file.clone(),
        ..ConfigLayer::default()
    }
}

/// Merge three layers. For each field, pick CLI first, then env, then file.
fn merge_layers(file: ConfigLayer, env: ConfigLayer, cli: ConfigLayer) -> ConfigLayer {
    ConfigLayer {
        agent_cmd: cli.agent_cmd.or(env.agent_cmd).or(file.agent_cmd),
        model: cli.model.or(env.model).or(file.model),
        functions_path: cli
            .functions_path
            .or(env.functions_path)
            .or(file.functions_path),
        work_dir: cli.work_dir.or(env.work_dir).or(file.work_dir),
        completion_timeout_sec: cli
            .completion_timeout_sec
            .or(env.completion_timeout_sec)
            .or(file.completion_timeout_sec),
        completion_retry_count: cli
            .completion_retry_count
            .or(env.completion_retry_count)
            .or(file.completion_retry_count),
        function_timeout_sec: cli
            .function_timeout_sec
            .or(env.function_timeout_sec)
            .or(file.function_timeout_sec),
        allow_loops: cli.allow_loops.or(env.allow_loops).or(file.allow_loops),
        excluded_namespaces: cli
            .excluded_namespaces
            .or(env.excluded_namespaces)
            .or(file.excluded_namespaces),
        excluded_functions: cli
            .excluded_functions
            .or(env.excluded_functions)
            .or(file.excluded_functions),
        fallback_to_raw: cli
            .fallback_to_raw
            .or(env.fallback_to_raw)
            .or(file.fallback_to_raw),
        prompt_path: cli.prompt_path.or(env.prompt_path).or(file.prompt_path),
        report_path: cli.report_path.or(env.report_path).or(file.report_path),
        log_level: cli.log_level.or(env.log_level).or(file.log_level),
        log_file: cli.log_file.or(env.log_file).or(file.log_file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_suffix: &str) -> Option<String> {
        None
    }

    fn with_config(path: &Path) -> CommonArgs {
        CommonArgs {
            config: Some(path.to_path_buf()),
            ..CommonArgs::default()
        }
    }

    #[test]
    fn defaults_applied_when_nothing_is_set() {
        let cfg = PlannerConfig::load_with_env(&CommonArgs::default(), no_env).unwrap();

        assert_eq!(cfg.agent_cmd, "agent");
        assert_eq!(cfg.model, None);
        assert_eq!(cfg.functions_path, None);
        assert_eq!(cfg.work_dir, PathBuf::from("."));
        assert_eq!(cfg.completion_timeout_sec, 600);
        assert_eq!(cfg.completion_retry_count, 0);
        assert_eq!(cfg.function_timeout_sec, 300);
        assert!(cfg.allow_loops);
        assert!(cfg.excluded_namespaces.is_empty());
        assert!(cfg.fallback_to_raw);
        assert_eq!(cfg.report_path, None);
    }

    #[test]
    fn documented_example_toml_parses_successfully() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hbplan.toml");
        fs::write(
            &path,
            r#"
agent_cmd = "agent"
model = "gpt-5"
functions_path = "functions.toml"
work_dir = "/srv/work"
completion_timeout_sec = 120
completion_retry_count = 2
function_timeout_sec = 30
allow_loops = false
excluded_namespaces = ["admin"]
excluded_functions = ["email-DeleteAll"]
fallback_to_raw = false
prompt_path = "prompt.txt"
report_path = "report.json"
log_level = "debug"
log_file = "hbplan.log"
"#,
        )
        .unwrap();

        let cfg = PlannerConfig::load_with_env(&with_config(&path), no_env).unwrap();
        assert_eq!(cfg.model.as_deref(), Some("gpt-5"));
        assert_eq!(cfg.functions_path, Some(PathBuf::from("functions.toml")));
        assert_eq!(cfg.work_dir, PathBuf::from("/srv/work"));
        assert_eq!(cfg.completion_timeout_sec, 120);
        assert_eq!(cfg.completion_retry_count, 2);
        assert_eq!(cfg.function_timeout_sec, 30);
        assert!(!cfg.allow_loops);
        assert_eq!(cfg.excluded_namespaces, vec!["admin"]);
        assert_eq!(cfg.excluded_functions, vec!["email-DeleteAll"]);
        assert!(!cfg.fallback_to_raw);
        assert_eq!(cfg.prompt_path, Some(PathBuf::from("prompt.txt")));
        assert_eq!(cfg.report_path, Some(PathBuf::from("report.json")));
        assert_eq!(cfg.log_level.as_deref(), Some("debug"));
        assert_eq!(cfg.log_file, Some(PathBuf::from("hbplan.log")));
    }

    #[test]
    fn full_precedence_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hbplan.toml");
        fs::write(
            &path,
            "agent_cmd = \"file-agent\"\nmodel = \"file-model\"\nfunction_timeout_sec = 1\n",
        )
        .unwrap();

        fn fake_env(suffix: &str) -> Option<String> {
            match suffix {
                "AGENT_CMD" => Some("env-agent".into()),
                "MODEL" => Some("env-model".into()),
                _ => None,
            }
        }

        let args = CommonArgs {
            config: Some(path),
            agent_cmd: Some("cli-agent".into()),
            ..CommonArgs::default()
        };
        let cfg = PlannerConfig::load_with_env(&args, fake_env).unwrap();

        assert_eq!(cfg.agent_cmd, "cli-agent");
        assert_eq!(cfg.model.as_deref(), Some("env-model"));
        assert_eq!(cfg.function_timeout_sec, 1);
    }

    #[test]
    fn env_lists_are_comma_separated() {
        fn fake_env(suffix: &str) -> Option<String> {
            match suffix {
                "EXCLUDED_NAMESPACES" => Some("admin, ,billing".into()),
                "ALLOW_LOOPS" => Some("false".into()),
                _ => None,
            }
        }

        let cfg = PlannerConfig::load_with_env(&CommonArgs::default(), fake_env).unwrap();
        assert_eq!(cfg.excluded_namespaces, vec!["admin", "billing"]);
        assert!(!cfg.allow_loops);
    }

    #[test]
    fn no_loops_flag_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hbplan.toml");
        fs::write(&path, "allow_loops = true\n").unwrap();

        let args = CommonArgs {
            no_loops: true,
            ..with_config(&path)
        };
        let cfg = PlannerConfig::load_with_env(&args, no_env).unwrap();
        assert!(!cfg.allow_loops);
    }

    #[test]
    fn invalid_env_var_returns_error() {
        fn fake_env(suffix: &str) -> Option<String> {
            match suffix {
                "COMPLETION_TIMEOUT_SEC" => Some("soon".into()),
                _ => None,
            }
        }

        let err = PlannerConfig::load_with_env(&CommonArgs::default(), fake_env).unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains("HBPLAN_COMPLETION_TIMEOUT_SEC"),
            "expected var name in error, got: {msg}"
        );
    }

    #[test]
    fn unknown_toml_key_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hbplan.toml");
        fs::write(&path, "agent_command = \"typo\"\n").unwrap();

        let err = PlannerConfig::load_with_env(&with_config(&path), no_env).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config file"));
    }

    #[test]
    fn missing_config_file_returns_error() {
        let args = with_config(Path::new("/nonexistent/hbplan.toml"));
        let err = PlannerConfig::load_with_env(&args, no_env).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config file"));
    }

    #[test]
    fn require_functions_path_names_sources() {
        let cfg = PlannerConfig::load_with_env(&CommonArgs::default(), no_env).unwrap();
        let msg = cfg.require_functions_path().unwrap_err().to_string();
        assert!(msg.contains("--functions"));
        assert!(msg.contains("HBPLAN_FUNCTIONS_PATH"));
    }
}
