//! Synthesis prompt construction.
//!
//! Every prompt sent to the completion service is built here so there is
//! exactly one place to review the strings that reach the model.
//!
//! The goal, the function listing and any previous plan are user or
//! registry supplied text. Each is fenced with a `---TAG---` pair so the
//! model can tell payload from instructions. The delimiters are static, so
//! a payload containing the exact delimiter line may still confuse it.

use std::fmt::Write as _;

use crate::catalog::{FunctionCatalog, FunctionDescriptor, NAMESPACE_SEPARATOR};
use crate::error::PlannerError;
use crate::extract::TEMPLATE_LANGUAGE;

const GOAL_DELIMITER: &str = "---GOAL---";
const FUNCTIONS_DELIMITER: &str = "---FUNCTIONS---";
const LAST_PLAN_DELIMITER: &str = "---PREVIOUS PLAN---";
const LAST_ERROR_DELIMITER: &str = "---PREVIOUS ERROR---";

/// Placeholder in custom prompt files replaced by the goal text.
pub const GOAL_PLACEHOLDER: &str = "{{GOAL}}";

/// Placeholder in custom prompt files replaced by the rendered function list.
pub const FUNCTIONS_PLACEHOLDER: &str = "{{FUNCTIONS}}";

/// Inputs for one synthesis prompt beyond goal and catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptOptions<'a> {
    pub allow_loops: bool,
    pub last_plan: Option<&'a str>,
    pub last_error: Option<&'a str>,
}

/// Build the synthesis prompt for `goal` against `catalog`.
///
/// Fails with `InvalidGoal` when the goal is empty or whitespace-only.
pub fn build_prompt(
    goal: &str,
    catalog: &FunctionCatalog,
    options: PromptOptions<'_>,
) -> Result<String, PlannerError> {
    validate_goal(goal)?;

    let mut prompt = instructions(options.allow_loops);
    let _ = write!(
        prompt,
        "\nAvailable functions:\n\n\
         {FUNCTIONS_DELIMITER}\n\
         {}\
         {FUNCTIONS_DELIMITER}\n",
        render_functions(catalog)
    );

    if let Some(plan) = options.last_plan {
        let _ = write!(
            prompt,
            "\nA previous attempt produced this plan:\n\n\
             {LAST_PLAN_DELIMITER}\n\
             {}\n\
             {LAST_PLAN_DELIMITER}\n",
            plan.trim_end()
        );
        if let Some(error) = options.last_error {
            let _ = write!(
                prompt,
                "\nIt failed with this error. Produce a corrected plan.\n\n\
                 {LAST_ERROR_DELIMITER}\n\
                 {}\n\
                 {LAST_ERROR_DELIMITER}\n",
                error.trim_end()
            );
        }
    }

    let _ = write!(
        prompt,
        "\nGoal:\n\n\
         {GOAL_DELIMITER}\n\
         {goal}\n\
         {GOAL_DELIMITER}"
    );
    Ok(prompt)
}

/// Build the prompt from a custom template, substituting
/// [`GOAL_PLACEHOLDER`] and [`FUNCTIONS_PLACEHOLDER`] in a single pass so
/// substituted text is never expanded again. A template lacking either
/// placeholder gets that section appended, fenced as in [`build_prompt`].
pub fn build_prompt_from_template(
    template: &str,
    goal: &str,
    catalog: &FunctionCatalog,
) -> Result<String, PlannerError> {
    validate_goal(goal)?;
    let functions = render_functions(catalog);

    let mut prompt = String::with_capacity(template.len() + goal.len() + functions.len());
    let (mut saw_goal, mut saw_functions) = (false, false);
    let mut rest = template;
    loop {
        let next_goal = rest.find(GOAL_PLACEHOLDER);
        let next_functions = rest.find(FUNCTIONS_PLACEHOLDER);
        let (at, placeholder, value) = match (next_goal, next_functions) {
            (None, None) => break,
            (Some(g), Some(f)) if f < g => (f, FUNCTIONS_PLACEHOLDER, functions.as_str()),
            (Some(g), _) => (g, GOAL_PLACEHOLDER, goal),
            (None, Some(f)) => (f, FUNCTIONS_PLACEHOLDER, functions.as_str()),
        };
        if placeholder == GOAL_PLACEHOLDER {
            saw_goal = true;
        } else {
            saw_functions = true;
        }
        prompt.push_str(&rest[..at]);
        prompt.push_str(value);
        rest = &rest[at + placeholder.len()..];
    }
    prompt.push_str(rest);

    if !saw_functions {
        let _ = write!(
            prompt,
            "\n\n{FUNCTIONS_DELIMITER}\n\
             {functions}\
             {FUNCTIONS_DELIMITER}"
        );
    }
    if !saw_goal {
        let _ = write!(
            prompt,
            "\n\n{GOAL_DELIMITER}\n\
             {goal}\n\
             {GOAL_DELIMITER}"
        );
    }
    Ok(prompt)
}

fn validate_goal(goal: &str) -> Result<(), PlannerError> {
    if goal.trim().is_empty() {
        return Err(PlannerError::InvalidGoal);
    }
    Ok(())
}

fn instructions(allow_loops: bool) -> String {
    let sep = NAMESPACE_SEPARATOR;
    let loops = if allow_loops {
        "- Loops: {{#each collection}}...{{this}}...{{/each}}; inside a loop a field of the current item can be read as {{this.field}} or {{field}}, and @index, @first and @last describe the position.\n"
    } else {
        "- Do not use loops ({{#each}}); write each step out explicitly.\n"
    };
    format!(
        "Create a plan that achieves the goal below using only the available functions.\n\
         Write the plan as a Handlebars template.\n\n\
         Syntax:\n\
         - Literal text is copied to the output.\n\
         - Call a function as {{{{namespace{sep}Function arg1 name=value}}}}; nest calls in parentheses: (namespace{sep}Function input).\n\
         - Store a value: {{{{set \"name\" (namespace{sep}Function ...)}}}}; read it back with (get \"name\") or {{{{name}}}}.\n\
         - Conditionals: {{{{#if condition}}}}...{{{{else}}}}...{{{{/if}}}} and {{{{#unless condition}}}}...{{{{/unless}}}}.\n\
         {loops}\
         - Helpers: equals, notEquals, lessThan, greaterThan, and, or, not, concat, array, object, range, json, add, subtract, multiply, divide, length.\n\
         - Comments: {{{{!-- comment --}}}}.\n\n\
         Rules:\n\
         - Only call functions listed below, always as namespace{sep}Function.\n\
         - Pass every required parameter.\n\
         - Output exactly one fenced block that starts with ```{TEMPLATE_LANGUAGE} and ends with ```.\n"
    )
}

/// Render every function in `catalog`, one block per function.
pub fn render_functions(catalog: &FunctionCatalog) -> String {
    let mut out = String::new();
    for f in catalog.iter() {
        render_function(&mut out, f);
    }
    out
}

fn render_function(out: &mut String, f: &FunctionDescriptor) {
    let _ = writeln!(out, "{}", f.key());
    if !f.description.is_empty() {
        let _ = writeln!(out, "  description: {}", f.description);
    }
    if f.parameters.is_empty() {
        let _ = writeln!(out, "  parameters: none");
        return;
    }
    let _ = writeln!(out, "  parameters:");
    for p in &f.parameters {
        let _ = write!(
            out,
            "  - {} ({}, {})",
            p.name,
            p.parameter_type.as_deref().unwrap_or("string"),
            if p.is_required { "required" } else { "optional" }
        );
        if let Some(default) = &p.default_value {
            let _ = write!(out, " default={default}");
        }
        if !p.description.is_empty() {
            let _ = write!(out, ": {}", p.description);
        }
        out.push('\n');
    }
}
