//! Completion service backed by an agent CLI.
//!
//! The agent is run exec-style with the prompt as its final positional
//! argument:
//!
//! ```text
//! --print --output-format text [--model <m>] <prompt>
//! ```
//!
//! Debug logs never include the prompt text; it is logged as
//! `<prompt len=N>`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::bail;
use tracing::{debug, info, warn};

use crate::error::PlannerError;
use crate::planner::{CompletionService, ExecutionSettings};
use crate::subprocess::{self, CommandResult, RunOptions};

/// Replace the trailing prompt argument with its length for logging.
fn args_for_log(args: &[String]) -> Vec<String> {
    let mut out = args.to_vec();
    if let Some(last) = out.last_mut() {
        *last = format!("<prompt len={}>", last.len());
    }
    out
}

/// Resolve `cmd` to an executable path, searching `PATH` for bare names.
pub fn resolve_agent_cmd(cmd: &str) -> Result<PathBuf, PlannerError> {
    resolve_agent_cmd_with(cmd, std::env::var_os("PATH"))
}

fn resolve_agent_cmd_with(cmd: &str, path_var: Option<OsString>) -> Result<PathBuf, PlannerError> {
    let not_found = || PlannerError::AgentCmdNotFound {
        cmd: cmd.to_owned(),
    };

    if cmd.contains(std::path::MAIN_SEPARATOR) || cmd.contains('/') {
        let p = PathBuf::from(cmd);
        return if is_executable(&p) { Ok(p) } else { Err(not_found()) };
    }

    let paths = path_var.ok_or_else(not_found)?;
    std::env::split_paths(&paths)
        .flat_map(|dir| candidates(&dir, cmd))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(not_found)
}

#[cfg(unix)]
fn candidates(dir: &Path, cmd: &str) -> Vec<PathBuf> {
    vec![dir.join(cmd)]
}

#[cfg(windows)]
fn candidates(dir: &Path, cmd: &str) -> Vec<PathBuf> {
    if Path::new(cmd).extension().is_some() {
        vec![dir.join(cmd)]
    } else {
        vec![dir.join(cmd), dir.join(format!("{cmd}.exe"))]
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

#[derive(Debug, Clone)]
pub struct AgentCompletion {
    agent_path: PathBuf,
    work_dir: PathBuf,
    /// Used when the request settings carry no `model_id`.
    model: Option<String>,
    timeout_sec: u64,
    retry_count: u32,
}

impl AgentCompletion {
    pub fn new(agent_path: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            agent_path,
            work_dir,
            model: None,
            timeout_sec: 600,
            retry_count: 0,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_timeout_sec(mut self, timeout_sec: u64) -> Self {
        self.timeout_sec = timeout_sec;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    fn argv(&self, prompt: &str, settings: &ExecutionSettings) -> Vec<String> {
        let mut args = vec![
            "--print".to_owned(),
            "--output-format".to_owned(),
            "text".to_owned(),
        ];
        if let Some(model) = settings.model_id.as_ref().or(self.model.as_ref()) {
            args.push("--model".to_owned());
            args.push(model.clone());
        }
        args.push(prompt.to_owned());
        args
    }
}

impl CompletionService for AgentCompletion {
    /// Runs the agent, retrying up to `retry_count` times on timeout or
    /// non-zero exit. Spawn failures are not retried.
    fn complete(&self, prompt: &str, settings: &ExecutionSettings) -> anyhow::Result<String> {
        let args = self.argv(prompt, settings);
        let agent = self.agent_path.to_string_lossy();
        let max_attempts = 1 + self.retry_count;
        let options = RunOptions {
            timeout: Some(Duration::from_secs(self.timeout_sec)),
            ..RunOptions::default()
        };

        let mut last_failure = String::new();
        for attempt in 1..=max_attempts {
            info!(
                agent = %agent,
                service_id = %settings.service_id,
                timeout_sec = self.timeout_sec,
                attempt,
                max_attempts,
                "invoking agent"
            );
            debug!(argv = ?args_for_log(&args), "agent argv");

            let result = subprocess::run_command(&agent, &args, &self.work_dir, options)
                .map_err(|e| anyhow::anyhow!("failed to spawn '{agent}': {e}"))?;

            match check_result(&result, self.timeout_sec) {
                Ok(()) => return Ok(result.stdout),
                Err(detail) => {
                    warn!(attempt, max_attempts, err = %detail, "agent call failed");
                    last_failure = detail;
                }
            }
        }

        bail!("{last_failure} (after {max_attempts} attempt(s))")
    }
}

fn check_result(result: &CommandResult, timeout_sec: u64) -> Result<(), String> {
    if result.timed_out {
        return Err(format!("agent timed out after {timeout_sec}s"));
    }
    if !result.success() {
        return Err(format!(
            "agent exited with code {:?}: {}",
            result.exit_code,
            result.stderr.trim()
        ));
    }
    Ok(())
}
