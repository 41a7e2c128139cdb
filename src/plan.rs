//! The executable plan artifact.

use std::fmt;
use std::sync::OnceLock;

use tracing::info;

use crate::cancel::CancellationToken;
use crate::catalog::{FunctionCatalog, FunctionRegistry};
use crate::error::PlannerError;
use crate::template::{self, Bindings, Engine, InvocationResult, Template};

/// A synthesized plan: template source plus the prompt that produced it.
///
/// The source never changes after construction. The parsed tree is cached
/// on first use, so repeated invocations parse once but re-run every
/// function call.
#[derive(Debug)]
pub struct Plan {
    source: String,
    prompt: String,
    ast: OnceLock<Template>,
}

impl Plan {
    /// Wrap `source` without parsing it; parse errors surface on first
    /// [`Plan::ast`] or invocation.
    pub fn new(source: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            prompt: prompt.into(),
            ast: OnceLock::new(),
        }
    }

    /// Wrap `source` together with its already parsed tree.
    pub fn with_ast(source: impl Into<String>, prompt: impl Into<String>, ast: Template) -> Self {
        Self {
            source: source.into(),
            prompt: prompt.into(),
            ast: OnceLock::from(ast),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The synthesis prompt this plan was created from. Empty for plans
    /// loaded from disk.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn ast(&self) -> Result<&Template, PlannerError> {
        if let Some(ast) = self.ast.get() {
            return Ok(ast);
        }
        let parsed = template::parse(&self.source)?;
        Ok(self.ast.get_or_init(|| parsed))
    }

    pub fn invoke(
        &self,
        registry: &dyn FunctionRegistry,
        bindings: Bindings,
    ) -> Result<InvocationResult, PlannerError> {
        self.invoke_with_cancel(registry, bindings, &CancellationToken::new())
    }

    /// Execute the plan against a fresh snapshot of `registry`.
    pub fn invoke_with_cancel(
        &self,
        registry: &dyn FunctionRegistry,
        bindings: Bindings,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, PlannerError> {
        let ast = self.ast()?;
        let catalog = FunctionCatalog::from_registry(registry);
        info!(functions = catalog.len(), "invoking plan");

        let result = Engine::new(&catalog, registry, cancel).execute(ast, bindings)?;
        info!(steps = result.invocations.len(), "plan completed");
        Ok(result)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FunctionDescriptor, ParameterDescriptor};
    use crate::registry::InMemoryRegistry;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    type CallLog = Arc<Mutex<Vec<(String, Value)>>>;

    fn record(log: &CallLog, name: &str, args: &crate::catalog::Arguments) {
        log.lock()
            .unwrap()
            .push((name.to_owned(), serde_json::to_value(args).unwrap()));
    }

    /// Summarize, translate, look up an address, send the email.
    fn email_registry(log: &CallLog) -> InMemoryRegistry {
        let mut r = InMemoryRegistry::new();

        let l = Arc::clone(log);
        r.register(
            FunctionDescriptor::new("SummarizePlugin", "Summarize", "Summarize the conversation"),
            move |args| {
                record(&l, "Summarize", args);
                Ok(json!("a short summary"))
            },
        );
        let l = Arc::clone(log);
        r.register(
            FunctionDescriptor::new("WriterPlugin", "Translate", "Translate text")
                .with_parameter(ParameterDescriptor::required("input", "Text"))
                .with_parameter(ParameterDescriptor::required("language", "Target language")),
            move |args| {
                record(&l, "Translate", args);
                Ok(json!(format!("[{}] {}", args["language"].as_str().unwrap_or(""), args["input"].as_str().unwrap_or(""))))
            },
        );
        let l = Arc::clone(log);
        r.register(
            FunctionDescriptor::new("email", "GetEmailAddress", "Look up an address")
                .with_parameter(ParameterDescriptor::required("input", "Person")),
            move |args| {
                record(&l, "GetEmailAddress", args);
                Ok(json!("johndoe@example.com"))
            },
        );
        let l = Arc::clone(log);
        r.register(
            FunctionDescriptor::new("email", "SendEmail", "Send an email")
                .with_parameter(ParameterDescriptor::required("input", "Body"))
                .with_parameter(ParameterDescriptor::required("email_address", "Recipient")),
            move |args| {
                record(&l, "SendEmail", args);
                Ok(json!(format!("sent to {}", args["email_address"].as_str().unwrap_or(""))))
            },
        );
        r
    }

    const EMAIL_PLAN: &str = r#"{{!-- Step 1: summarize --}}
{{set "summary" (SummarizePlugin-Summarize)}}
{{!-- Step 2: translate --}}
{{set "translatedSummary" (WriterPlugin-Translate input=(get "summary") language="French")}}
{{!-- Step 3: look up the address --}}
{{set "emailAddress" (email-GetEmailAddress input="John Doe")}}
{{!-- Step 4: send --}}
{{email-SendEmail input=(get "translatedSummary") email_address=(get "emailAddress")}}"#;

    #[test]
    fn email_plan_calls_functions_in_order_with_bound_arguments() {
        let log = CallLog::default();
        let registry = email_registry(&log);
        let plan = Plan::new(EMAIL_PLAN, "prompt text");

        let result = plan.invoke(&registry, Bindings::new()).unwrap();

        let calls = log.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("Summarize".to_owned(), json!({})),
                (
                    "Translate".to_owned(),
                    json!({"input": "a short summary", "language": "French"})
                ),
                ("GetEmailAddress".to_owned(), json!({"input": "John Doe"})),
                (
                    "SendEmail".to_owned(),
                    json!({
                        "input": "[French] a short summary",
                        "email_address": "johndoe@example.com"
                    })
                ),
            ]
        );
        assert_eq!(result.output.trim(), "sent to johndoe@example.com");
        assert_eq!(result.invocations.len(), 4);
    }

    #[test]
    fn sequential_call_feeds_stored_result() {
        let mut r = InMemoryRegistry::new();
        r.register(FunctionDescriptor::new("m", "One", ""), |_| Ok(json!("one")));
        r.register(
            FunctionDescriptor::new("m", "Two", "")
                .with_parameter(ParameterDescriptor::required("input", "")),
            |args| Ok(json!(format!("two({})", args["input"].as_str().unwrap_or("")))),
        );
        let plan = Plan::new(r#"{{set "a" (m-One)}}{{m-Two input=(get "a")}}"#, "");

        let result = plan.invoke(&r, Bindings::new()).unwrap();
        assert_eq!(result.output, "two(one)");
    }

    #[test]
    fn invoking_twice_reruns_functions() {
        let log = CallLog::default();
        let registry = email_registry(&log);
        let plan = Plan::new(EMAIL_PLAN, "");

        plan.invoke(&registry, Bindings::new()).unwrap();
        plan.invoke(&registry, Bindings::new()).unwrap();
        assert_eq!(log.lock().unwrap().len(), 8);
    }

    #[test]
    fn parse_error_surfaces_before_any_call() {
        let log = CallLog::default();
        let registry = email_registry(&log);
        let plan = Plan::new("{{#if x}}{{SummarizePlugin-Summarize}}", "");

        let err = plan.invoke(&registry, Bindings::new()).unwrap_err();
        assert!(matches!(err, PlannerError::TemplateParse(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn catalog_is_resnapshotted_per_invocation() {
        let mut r = InMemoryRegistry::new();
        let plan = Plan::new("{{ops-Later}}", "");

        let err = plan.invoke(&r, Bindings::new()).unwrap_err();
        assert!(matches!(err, PlannerError::UnresolvedFunction { .. }));

        r.register(FunctionDescriptor::new("ops", "Later", ""), |_| Ok(json!("now")));
        assert_eq!(plan.invoke(&r, Bindings::new()).unwrap().output, "now");
    }

    #[test]
    fn initial_bindings_are_visible() {
        let plan = Plan::new("Hello {{name}}", "");
        let mut bindings = Bindings::new();
        bindings.insert("name".into(), json!("Ada"));

        let result = plan.invoke(&InMemoryRegistry::new(), bindings).unwrap();
        assert_eq!(result.output, "Hello Ada");
    }

    #[test]
    fn cancelled_token_stops_invocation() {
        let log = CallLog::default();
        let registry = email_registry(&log);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Plan::new(EMAIL_PLAN, "")
            .invoke_with_cancel(&registry, Bindings::new(), &cancel)
            .unwrap_err();
        assert!(matches!(err, PlannerError::Cancelled));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn display_and_accessors_expose_source_and_prompt() {
        let plan = Plan::new("{{x}}", "the prompt");
        assert_eq!(plan.to_string(), "{{x}}");
        assert_eq!(plan.source(), "{{x}}");
        assert_eq!(plan.prompt(), "the prompt");
    }

    #[test]
    fn ast_is_parsed_once() {
        let plan = Plan::new("{{x}}", "");
        let first = plan.ast().unwrap() as *const Template;
        let second = plan.ast().unwrap() as *const Template;
        assert_eq!(first, second);
    }

    #[test]
    fn concurrent_invocations_keep_bindings_separate() {
        let mut registry = InMemoryRegistry::new();
        registry.register(
            FunctionDescriptor::new("text", "Greet", "Greet someone")
                .with_parameter(ParameterDescriptor::required("input", "name")),
            |args| {
                std::thread::yield_now();
                Ok(json!(format!("hi {}", args["input"].as_str().unwrap_or_default())))
            },
        );
        let plan = Plan::new(
            "{{set \"greeting\" (text-Greet input=name)}}{{#each items}}{{greeting}}:{{this}};{{/each}}",
            "",
        );
        let barrier = std::sync::Barrier::new(2);

        let run = |name: &str, items: Value| {
            let mut bindings = Bindings::new();
            bindings.insert("name".into(), json!(name));
            bindings.insert("items".into(), items);
            barrier.wait();
            (0..50)
                .map(|_| plan.invoke(&registry, bindings.clone()).unwrap().output)
                .collect::<Vec<_>>()
        };

        let (ada, alan) = std::thread::scope(|s| {
            let ada = s.spawn(|| run("Ada", json!([1, 2])));
            let alan = s.spawn(|| run("Alan", json!(["x"])));
            (ada.join().unwrap(), alan.join().unwrap())
        });

        assert!(ada.iter().all(|out| out == "hi Ada:1;hi Ada:2;"));
        assert!(alan.iter().all(|out| out == "hi Alan:x;"));
    }
}
