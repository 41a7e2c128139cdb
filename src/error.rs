use std::path::PathBuf;

const AGENT_CLI_INSTALL_URL: &str = "https://docs.cursor.com/cli";

/// Malformed template syntax, with the offending fragment and its position
/// (1-based line and column) in the template source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Template parse error at line {line}, column {column}: {message} (near `{fragment}`)")]
pub struct TemplateParseError {
    pub message: String,
    pub fragment: String,
    pub line: usize,
    pub column: usize,
}

impl TemplateParseError {
    /// Build an error positioned at byte `offset` of `source`.
    pub fn at(source: &str, offset: usize, message: impl Into<String>, fragment: &str) -> Self {
        let (line, column) = line_col(source, offset);
        Self {
            message: message.into(),
            fragment: fragment.to_owned(),
            line,
            column,
        }
    }
}

fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = source.get(..offset).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let column = match before.rfind('\n') {
        Some(nl) => before[nl + 1..].chars().count() + 1,
        None => before.chars().count() + 1,
    };
    (line, column)
}

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("Goal must not be empty.")]
    InvalidGoal,

    /// The model response held no fenced template. Carries a bounded
    /// excerpt of the response for diagnostics.
    #[error("Could not find the plan in the results. Response excerpt:\n{excerpt}")]
    PlanNotFound { excerpt: String },

    #[error(transparent)]
    TemplateParse(#[from] TemplateParseError),

    #[error("Variable '{name}' is not defined")]
    UndefinedVariable { name: String },

    #[error("Function '{function}' not found in the function catalog")]
    UnresolvedFunction { function: String },

    #[error("Function name '{name}' is ambiguous; qualify it with a namespace (candidates: {candidates:?})")]
    AmbiguousFunction { name: String, candidates: Vec<String> },

    #[error("Function '{function}' is missing required argument '{parameter}'")]
    MissingRequiredArgument { function: String, parameter: String },

    #[error("Invalid arguments for '{function}': {detail}")]
    InvalidArguments { function: String, detail: String },

    #[error("Type mismatch in {context}: {detail}")]
    TypeMismatch { context: String, detail: String },

    #[error("Function '{function}' failed with arguments {arguments}: {detail}")]
    FunctionInvocationFailure {
        function: String,
        arguments: String,
        detail: String,
    },

    #[error("Plan execution was cancelled")]
    Cancelled,

    #[error("Completion request failed: {detail}")]
    CompletionFailed { detail: String },

    #[error(
        "Agent command '{cmd}' not found on PATH. \
         Install it from {AGENT_CLI_INSTALL_URL}"
    )]
    AgentCmdNotFound { cmd: String },

    #[error("Failed to parse environment variable '{var}': {detail}")]
    ConfigEnvParseError { var: String, detail: String },

    #[error("Invalid functions manifest {path}: {detail}")]
    FunctionsManifestInvalid { path: PathBuf, detail: String },
}

impl PlannerError {
    /// True for errors raised before any function was invoked. These are
    /// safe to retry once the input (goal, model output, template) is fixed.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            PlannerError::InvalidGoal
                | PlannerError::PlanNotFound { .. }
                | PlannerError::TemplateParse(_)
        )
    }
}
