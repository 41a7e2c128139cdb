//! Plan synthesis: goal to prompt, prompt to completion, completion to a
//! validated [`Plan`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog::{FunctionCatalog, FunctionRegistry};
use crate::error::{PlannerError, TemplateParseError};
use crate::extract::extract_template;
use crate::plan::Plan;
use crate::prompt::{self, PromptOptions};
use crate::template;

/// Service id used when none is configured.
pub const DEFAULT_SERVICE_ID: &str = "default";

/// Settings forwarded untouched to the completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default = "default_service_id")]
    pub service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(flatten)]
    pub extension_data: BTreeMap<String, Value>,
}

fn default_service_id() -> String {
    DEFAULT_SERVICE_ID.to_owned()
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            model_id: None,
            extension_data: BTreeMap::new(),
        }
    }
}

/// Turns a prompt into model text. One call per synthesis attempt; any
/// retry policy belongs to the implementation.
pub trait CompletionService: Send + Sync {
    fn complete(&self, prompt: &str, settings: &ExecutionSettings) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannerOptions {
    pub allow_loops: bool,
    pub excluded_namespaces: Vec<String>,
    pub excluded_functions: Vec<String>,
    /// A previous plan and the error it produced, shown to the model so it
    /// can correct itself.
    pub last_plan: Option<String>,
    pub last_error: Option<String>,
    /// Accept an unfenced response that parses as a template.
    pub fallback_to_raw: bool,
    /// Replaces the built-in instructions; see [`prompt::build_prompt_from_template`].
    pub prompt_template: Option<String>,
    pub execution_settings: ExecutionSettings,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            allow_loops: true,
            excluded_namespaces: Vec::new(),
            excluded_functions: Vec::new(),
            last_plan: None,
            last_error: None,
            fallback_to_raw: true,
            prompt_template: None,
            execution_settings: ExecutionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Planner {
    options: PlannerOptions,
}

impl Planner {
    pub fn new(options: PlannerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &PlannerOptions {
        &self.options
    }

    /// The catalog the model gets to see: a fresh snapshot of `registry`
    /// minus excluded namespaces and functions.
    pub fn catalog(&self, registry: &dyn FunctionRegistry) -> FunctionCatalog {
        FunctionCatalog::from_registry(registry).without(
            &self.options.excluded_namespaces,
            &self.options.excluded_functions,
        )
    }

    /// Render the synthesis prompt for `goal` without calling a model.
    pub fn build_prompt(
        &self,
        goal: &str,
        registry: &dyn FunctionRegistry,
    ) -> Result<String, PlannerError> {
        let catalog = self.catalog(registry);
        match &self.options.prompt_template {
            Some(template) => prompt::build_prompt_from_template(template, goal, &catalog),
            None => prompt::build_prompt(
                goal,
                &catalog,
                PromptOptions {
                    allow_loops: self.options.allow_loops,
                    last_plan: self.options.last_plan.as_deref(),
                    last_error: self.options.last_error.as_deref(),
                },
            ),
        }
    }

    /// Synthesize a plan for `goal`.
    ///
    /// The returned plan has already been parsed, so template errors
    /// surface here rather than on first invocation.
    pub fn create_plan(
        &self,
        goal: &str,
        completion: &dyn CompletionService,
        registry: &dyn FunctionRegistry,
    ) -> Result<Plan, PlannerError> {
        let prompt = self.build_prompt(goal, registry)?;
        info!(prompt_len = prompt.len(), "requesting plan");

        let response = completion
            .complete(&prompt, &self.options.execution_settings)
            .map_err(|e| PlannerError::CompletionFailed {
                detail: format!("{e:#}"),
            })?;
        debug!(response_len = response.len(), "completion received");

        let source = extract_template(&response, self.options.fallback_to_raw)?;
        let ast = template::parse(&source)?;

        if !self.options.allow_loops && ast.contains_loop() {
            warn!("plan uses a loop while loops are disabled");
            let offset = source.find("{{#each").unwrap_or(0);
            return Err(TemplateParseError::at(
                &source,
                offset,
                "loops are not allowed in this plan",
                "{{#each",
            )
            .into());
        }

        info!(source_len = source.len(), "plan created");
        Ok(Plan::with_ast(source, prompt, ast))
    }
}
