//! Function registries: in-process closures and manifest-declared commands.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::catalog::{
    Arguments, FunctionDescriptor, FunctionKey, FunctionRegistry, NAMESPACE_SEPARATOR,
    ParameterDescriptor,
};
use crate::error::PlannerError;
use crate::subprocess::{self, RunOptions};

type Handler = Box<dyn Fn(&Arguments) -> anyhow::Result<Value> + Send + Sync>;

/// Registry backed by Rust closures.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: BTreeMap<FunctionKey, (FunctionDescriptor, Handler)>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a function.
    pub fn register<F>(&mut self, descriptor: FunctionDescriptor, handler: F)
    where
        F: Fn(&Arguments) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.entries
            .insert(descriptor.key(), (descriptor, Box::new(handler)));
    }

    pub fn unregister(&mut self, key: &FunctionKey) -> bool {
        self.entries.remove(key).is_some()
    }
}

impl FunctionRegistry for InMemoryRegistry {
    fn functions(&self) -> Vec<FunctionDescriptor> {
        self.entries.values().map(|(d, _)| d.clone()).collect()
    }

    fn invoke(
        &self,
        key: &FunctionKey,
        arguments: &Arguments,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Value> {
        match self.entries.get(key) {
            Some((_, handler)) => handler(arguments),
            None => bail!("function {key} is not registered"),
        }
    }
}

/// One `[[functions]]` entry of a functions manifest.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFunction {
    namespace: String,
    name: String,
    #[serde(default)]
    description: String,
    /// Program followed by its fixed arguments.
    command: Vec<String>,
    #[serde(default)]
    parameters: Vec<ParameterDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    #[serde(default)]
    functions: Vec<ManifestFunction>,
}

/// Registry whose functions are external commands declared in a TOML
/// manifest.
///
/// A call runs the command exec-style in `work_dir` with the bound
/// arguments as a JSON object on stdin. Trimmed stdout is the result,
/// parsed as JSON when it is valid JSON and kept as a string otherwise.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    functions: BTreeMap<FunctionKey, (FunctionDescriptor, Vec<String>)>,
    work_dir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandRegistry {
    pub fn load(path: &Path, work_dir: &Path, timeout: Option<Duration>) -> Result<Self, PlannerError> {
        let invalid = |detail: String| PlannerError::FunctionsManifestInvalid {
            path: path.to_path_buf(),
            detail,
        };
        let contents = fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        Self::from_toml(&contents, work_dir, timeout).map_err(|e| invalid(format!("{e:#}")))
    }

    fn from_toml(contents: &str, work_dir: &Path, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let manifest: Manifest = toml::from_str(contents).context("malformed TOML")?;
        let mut functions = BTreeMap::new();

        for f in manifest.functions {
            if f.namespace.is_empty() || f.name.is_empty() {
                bail!("functions need a non-empty namespace and name");
            }
            if f.namespace.contains(NAMESPACE_SEPARATOR) {
                bail!(
                    "namespace '{}' must not contain '{NAMESPACE_SEPARATOR}'",
                    f.namespace
                );
            }
            if f.command.first().is_none_or(|p| p.trim().is_empty()) {
                bail!("function {}{NAMESPACE_SEPARATOR}{} has an empty command", f.namespace, f.name);
            }
            let descriptor = FunctionDescriptor {
                namespace: f.namespace,
                name: f.name,
                description: f.description,
                parameters: f.parameters,
            };
            let key = descriptor.key();
            if functions.contains_key(&key) {
                bail!("function {key} is declared more than once");
            }
            functions.insert(key, (descriptor, f.command));
        }

        Ok(Self {
            functions,
            work_dir: work_dir.to_path_buf(),
            timeout,
        })
    }
}

impl FunctionRegistry for CommandRegistry {
    fn functions(&self) -> Vec<FunctionDescriptor> {
        self.functions.values().map(|(d, _)| d.clone()).collect()
    }

    fn invoke(
        &self,
        key: &FunctionKey,
        arguments: &Arguments,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Value> {
        let Some((_, command)) = self.functions.get(key) else {
            bail!("function {key} is not declared in the manifest");
        };
        let (program, args) = command
            .split_first()
            .context("manifest command is empty")?;
        let payload = serde_json::to_vec(arguments)?;

        debug!(function = %key, program = %program, "running function command");
        let result = subprocess::run_command(
            program,
            args,
            &self.work_dir,
            RunOptions {
                stdin: Some(&payload),
                timeout: self.timeout,
                cancel: Some(cancel),
            },
        )
        .with_context(|| format!("failed to start '{program}'"))?;

        if result.cancelled {
            bail!("'{program}' was cancelled");
        }
        if result.timed_out {
            bail!("'{program}' timed out");
        }
        if !result.success() {
            bail!(
                "'{program}' exited with code {:?}: {}",
                result.exit_code,
                result.stderr.trim()
            );
        }

        let stdout = result.stdout.trim();
        Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_owned())))
    }
}
