//! Tree-walking executor for parsed templates.
//!
//! Execution is single-pass, depth-first and left-to-right. Every function
//! call goes through the catalog snapshot for resolution and argument
//! binding, then through the registry for the actual invocation. Any error
//! aborts the run; partially rendered output is dropped with it.

use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::cancel::CancellationToken;
use crate::catalog::{Arguments, FunctionCatalog, FunctionDescriptor, FunctionKey, FunctionRegistry};
use crate::error::PlannerError;

use super::ast::{Call, Callee, Expr, Node, SetValue, Template};
use super::helpers;
use super::value::{Bindings, CURRENT_ITEM, Scopes, is_truthy, render};

/// One function invocation made during an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationRecord {
    pub function: FunctionKey,
    pub arguments: Arguments,
    pub result: Value,
}

/// Everything one successful execution produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationResult {
    pub output: String,
    pub invocations: Vec<InvocationRecord>,
}

pub struct Engine<'a> {
    catalog: &'a FunctionCatalog,
    registry: &'a dyn FunctionRegistry,
    cancel: &'a CancellationToken,
}

/// Mutable state of one execution; never outlives it.
struct Execution {
    scopes: Scopes,
    invocations: Vec<InvocationRecord>,
}

impl<'a> Engine<'a> {
    pub fn new(
        catalog: &'a FunctionCatalog,
        registry: &'a dyn FunctionRegistry,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            catalog,
            registry,
            cancel,
        }
    }

    pub fn execute(
        &self,
        template: &Template,
        bindings: Bindings,
    ) -> Result<InvocationResult, PlannerError> {
        if self.cancel.is_cancelled() {
            return Err(PlannerError::Cancelled);
        }

        let mut exec = Execution {
            scopes: Scopes::new(bindings),
            invocations: Vec::new(),
        };
        let mut output = String::new();
        self.render_nodes(&template.nodes, &mut exec, &mut output)?;

        Ok(InvocationResult {
            output,
            invocations: exec.invocations,
        })
    }

    fn render_nodes(
        &self,
        nodes: &[Node],
        exec: &mut Execution,
        out: &mut String,
    ) -> Result<(), PlannerError> {
        for node in nodes {
            self.render_node(node, exec, out)?;
        }
        Ok(())
    }

    fn render_node(
        &self,
        node: &Node,
        exec: &mut Execution,
        out: &mut String,
    ) -> Result<(), PlannerError> {
        match node {
            Node::Literal(text) => out.push_str(text),
            Node::Output(expr) => {
                let value = self.eval(expr, exec)?;
                out.push_str(&render(&value));
            }
            Node::Set { name, value } => {
                let value = match value {
                    SetValue::Expr(expr) => self.eval(expr, exec)?,
                    SetValue::Block(body) => {
                        let mut captured = String::new();
                        self.render_nodes(body, exec, &mut captured)?;
                        Value::String(captured)
                    }
                };
                debug!(variable = %name, "set");
                exec.scopes.set(name, value);
            }
            Node::If {
                condition,
                then_block,
                else_block,
            } => {
                if is_truthy(&self.eval(condition, exec)?) {
                    self.render_nodes(then_block, exec, out)?;
                } else if let Some(else_block) = else_block {
                    self.render_nodes(else_block, exec, out)?;
                }
            }
            Node::Each {
                collection,
                body,
                else_block,
            } => {
                let items = match self.eval(collection, exec)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(PlannerError::TypeMismatch {
                            context: "each".to_owned(),
                            detail: format!("expected a sequence, got {other}"),
                        });
                    }
                };
                if items.is_empty() {
                    if let Some(else_block) = else_block {
                        self.render_nodes(else_block, exec, out)?;
                    }
                    return Ok(());
                }
                let last = items.len() - 1;
                for (index, item) in items.into_iter().enumerate() {
                    let mut frame = Map::new();
                    frame.insert(CURRENT_ITEM.to_owned(), item);
                    frame.insert("@index".to_owned(), Value::from(index));
                    frame.insert("@first".to_owned(), Value::Bool(index == 0));
                    frame.insert("@last".to_owned(), Value::Bool(index == last));
                    exec.scopes.push(frame);
                    let rendered = self.render_nodes(body, exec, out);
                    exec.scopes.pop();
                    rendered?;
                }
            }
        }
        Ok(())
    }

    fn eval(&self, expr: &Expr, exec: &mut Execution) -> Result<Value, PlannerError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Get { path, .. } => {
                exec.scopes
                    .lookup(path)
                    .ok_or_else(|| PlannerError::UndefinedVariable { name: path.clone() })
            }
            Expr::Call(call) => match &call.callee {
                Callee::Helper(helper) => {
                    let (positional, named) = self.eval_args(call, exec)?;
                    helpers::apply(*helper, positional, named)
                }
                Callee::Function { namespace, name } => {
                    let descriptor = self.catalog.resolve(namespace.as_deref(), name)?;
                    self.call_function(descriptor, call, exec)
                }
            },
        }
    }

    #[allow(clippy::type_complexity)]
    fn eval_args(
        &self,
        call: &Call,
        exec: &mut Execution,
    ) -> Result<(Vec<Value>, Vec<(String, Value)>), PlannerError> {
        let mut positional = Vec::with_capacity(call.positional.len());
        for expr in &call.positional {
            positional.push(self.eval(expr, exec)?);
        }
        let mut named = Vec::with_capacity(call.named.len());
        for (key, expr) in &call.named {
            named.push((key.clone(), self.eval(expr, exec)?));
        }
        Ok((positional, named))
    }

    fn call_function(
        &self,
        descriptor: &FunctionDescriptor,
        call: &Call,
        exec: &mut Execution,
    ) -> Result<Value, PlannerError> {
        let key = descriptor.key();
        let (positional, named) = self.eval_args(call, exec)?;
        let arguments = bind_arguments(descriptor, positional, named)?;

        if self.cancel.is_cancelled() {
            info!(function = %key, "cancelled before invocation");
            return Err(PlannerError::Cancelled);
        }

        let step = exec.invocations.len() + 1;
        info!(step, namespace = %key.namespace, function = %key.name, "invoking function");
        debug!(step, function = %key, arguments = ?arguments, "bound arguments");

        let start = Instant::now();
        let result = self.registry.invoke(&key, &arguments, self.cancel);
        let duration_ms = start.elapsed().as_millis() as u64;

        if self.cancel.is_cancelled() {
            info!(step, function = %key, duration_ms, "cancelled during invocation");
            return Err(PlannerError::Cancelled);
        }

        let value = result.map_err(|e| {
            error!(step, function = %key, duration_ms, err = %format!("{e:#}"), "function failed");
            PlannerError::FunctionInvocationFailure {
                function: key.to_string(),
                arguments: serde_json::to_string(&arguments).unwrap_or_default(),
                detail: format!("{e:#}"),
            }
        })?;

        info!(step, function = %key, duration_ms, "function complete");
        exec.invocations.push(InvocationRecord {
            function: key,
            arguments,
            result: value.clone(),
        });
        Ok(value)
    }
}

/// Bind evaluated call arguments to the declared parameter list.
///
/// Positional values fill parameters in declaration order; named values
/// bind by name. Missing optional parameters take their default when one
/// is declared. Named arguments the function does not declare are passed
/// through untouched.
pub fn bind_arguments(
    descriptor: &FunctionDescriptor,
    positional: Vec<Value>,
    named: Vec<(String, Value)>,
) -> Result<Arguments, PlannerError> {
    let function = descriptor.key().to_string();
    let params = &descriptor.parameters;

    if positional.len() > params.len() {
        return Err(PlannerError::InvalidArguments {
            function,
            detail: format!(
                "expected at most {} positional argument(s), got {}",
                params.len(),
                positional.len()
            ),
        });
    }

    let mut bound = Arguments::new();
    for (param, value) in params.iter().zip(positional) {
        bound.insert(param.name.clone(), value);
    }

    for (key, value) in named {
        if bound.contains_key(&key) {
            return Err(PlannerError::InvalidArguments {
                function,
                detail: format!("argument '{key}' supplied both positionally and by name"),
            });
        }
        if !params.iter().any(|p| p.name == key) {
            debug!(function = %function, argument = %key, "passing through undeclared argument");
        }
        bound.insert(key, value);
    }

    for param in params {
        if bound.contains_key(&param.name) {
            continue;
        }
        if let Some(default) = &param.default_value {
            bound.insert(param.name.clone(), default.clone());
        } else if param.is_required {
            return Err(PlannerError::MissingRequiredArgument {
                function,
                parameter: param.name.clone(),
            });
        }
    }

    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ParameterDescriptor;
    use crate::registry::InMemoryRegistry;
    use crate::template::parser::parse;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run(registry: &InMemoryRegistry, source: &str, bindings: Bindings) -> Result<InvocationResult, PlannerError> {
        let template = parse(source).expect("template should parse");
        let catalog = FunctionCatalog::from_registry(registry);
        let cancel = CancellationToken::new();
        Engine::new(&catalog, registry, &cancel).execute(&template, bindings)
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn echo_registry() -> InMemoryRegistry {
        let mut registry = InMemoryRegistry::new();
        registry.register(
            FunctionDescriptor::new("text", "Upper", "Uppercase the input")
                .with_parameter(ParameterDescriptor::required("input", "text to transform")),
            |args| Ok(json!(args["input"].as_str().unwrap_or_default().to_uppercase())),
        );
        registry.register(
            FunctionDescriptor::new("text", "Repeat", "Repeat the input")
                .with_parameter(ParameterDescriptor::required("input", "text"))
                .with_parameter(ParameterDescriptor::optional("times", "count", Some(json!(2)))),
            |args| {
                let n = args["times"].as_u64().unwrap_or(1) as usize;
                Ok(json!(args["input"].as_str().unwrap_or_default().repeat(n)))
            },
        );
        registry
    }

    #[test]
    fn literal_template_renders_verbatim() {
        let src = "No tags here.\n  Indented line.\n";
        let result = run(&InMemoryRegistry::new(), src, Bindings::new()).unwrap();
        assert_eq!(result.output, src);
        assert!(result.invocations.is_empty());
    }

    #[test]
    fn set_then_get_renders_value_without_set_output() {
        let result = run(
            &InMemoryRegistry::new(),
            "{{set \"x\" 41}}[{{x}}] {{get \"x\"}}",
            Bindings::new(),
        )
        .unwrap();
        assert_eq!(result.output, "[41] 41");
    }

    #[test]
    fn initial_bindings_are_visible() {
        let mut bindings = Bindings::new();
        bindings.insert("name".into(), json!("Ada"));
        let result = run(&InMemoryRegistry::new(), "Hi {{name}}", bindings).unwrap();
        assert_eq!(result.output, "Hi Ada");
    }

    #[test]
    fn undefined_variable_is_error() {
        match run(&InMemoryRegistry::new(), "{{missing}}", Bindings::new()) {
            Err(PlannerError::UndefinedVariable { name }) => assert_eq!(name, "missing"),
            other => panic!("expected UndefinedVariable, got {other:?}"),
        }
    }

    #[test]
    fn calls_bind_positional_named_and_default_arguments() {
        let registry = echo_registry();
        let result = run(
            &registry,
            "{{set \"u\" (text-Upper \"abc\")}}{{text-Repeat input=(get \"u\")}}",
            Bindings::new(),
        )
        .unwrap();
        assert_eq!(result.output, "ABCABC");
        assert_eq!(result.invocations.len(), 2);
        assert_eq!(result.invocations[0].arguments["input"], json!("abc"));
        assert_eq!(result.invocations[1].arguments["times"], json!(2));
        assert_eq!(result.invocations[1].function, FunctionKey::new("text", "Repeat"));
    }

    #[test]
    fn namespace_may_be_omitted_when_unambiguous() {
        let result = run(&echo_registry(), "{{Upper input=\"q\"}}", Bindings::new()).unwrap();
        assert_eq!(result.output, "Q");
    }

    #[test]
    fn missing_required_argument_is_error() {
        match run(&echo_registry(), "{{text-Upper}}", Bindings::new()) {
            Err(PlannerError::MissingRequiredArgument { function, parameter }) => {
                assert_eq!(function, "text-Upper");
                assert_eq!(parameter, "input");
            }
            other => panic!("expected MissingRequiredArgument, got {other:?}"),
        }
    }

    #[test]
    fn too_many_positional_arguments_is_error() {
        assert!(matches!(
            run(&echo_registry(), "{{text-Upper \"a\" \"b\"}}", Bindings::new()),
            Err(PlannerError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn unresolved_function_is_runtime_error() {
        match run(&echo_registry(), "before {{text-Lower input=\"a\"}}", Bindings::new()) {
            Err(PlannerError::UnresolvedFunction { function }) => assert_eq!(function, "text-Lower"),
            other => panic!("expected UnresolvedFunction, got {other:?}"),
        }
    }

    #[test]
    fn undeclared_named_arguments_pass_through() {
        let mut registry = InMemoryRegistry::new();
        registry.register(FunctionDescriptor::new("email", "SendEmail", "Send"), |args| {
            Ok(json!(args.len()))
        });
        let result = run(&registry, "{{email-SendEmail input=\"x\" to=\"y\"}}", Bindings::new()).unwrap();
        assert_eq!(result.output, "2");
    }

    #[test]
    fn if_picks_exactly_one_branch() {
        let src = "{{#if flag}}yes{{else}}no{{/if}}";
        let mut on = Bindings::new();
        on.insert("flag".into(), json!([1]));
        let mut off = Bindings::new();
        off.insert("flag".into(), json!(""));
        assert_eq!(run(&InMemoryRegistry::new(), src, on).unwrap().output, "yes");
        assert_eq!(run(&InMemoryRegistry::new(), src, off).unwrap().output, "no");
    }

    #[test]
    fn each_iterates_in_order_with_metadata() {
        let mut bindings = Bindings::new();
        bindings.insert("items".into(), json!(["a", "b", "c"]));
        let result = run(
            &InMemoryRegistry::new(),
            "{{#each items}}{{@index}}={{this}}{{#unless @last}},{{/unless}}{{/each}}",
            bindings,
        )
        .unwrap();
        assert_eq!(result.output, "0=a,1=b,2=c");
    }

    #[test]
    fn fields_of_current_item_resolve_by_name() {
        let mut bindings = Bindings::new();
        bindings.insert("people".into(), json!([{"name": "Ada"}, {"name": "Alan"}]));
        let result = run(
            &InMemoryRegistry::new(),
            "{{#each people}}{{this.name}}/{{name}};{{/each}}",
            bindings,
        )
        .unwrap();
        assert_eq!(result.output, "Ada/Ada;Alan/Alan;");
    }

    #[test]
    fn each_over_empty_sequence_runs_else_only() {
        let mut bindings = Bindings::new();
        bindings.insert("items".into(), json!([]));
        let result = run(
            &InMemoryRegistry::new(),
            "{{#each items}}x{{else}}empty{{/each}}",
            bindings,
        )
        .unwrap();
        assert_eq!(result.output, "empty");
    }

    #[test]
    fn each_over_non_sequence_is_type_mismatch() {
        let mut bindings = Bindings::new();
        bindings.insert("items".into(), json!("abc"));
        assert!(matches!(
            run(&InMemoryRegistry::new(), "{{#each items}}x{{/each}}", bindings),
            Err(PlannerError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn set_inside_each_does_not_leak() {
        let mut bindings = Bindings::new();
        bindings.insert("items".into(), json!([1, 2]));
        let err = run(
            &InMemoryRegistry::new(),
            "{{#each items}}{{set \"inner\" this}}{{/each}}{{inner}}",
            bindings,
        )
        .unwrap_err();
        assert!(matches!(err, PlannerError::UndefinedVariable { name } if name == "inner"));
    }

    #[test]
    fn set_inside_each_shadows_without_mutating_parent() {
        let mut bindings = Bindings::new();
        bindings.insert("items".into(), json!([1, 2]));
        let result = run(
            &InMemoryRegistry::new(),
            "{{set \"x\" \"outer\"}}{{#each items}}{{set \"x\" this}}{{x}};{{/each}}{{x}}",
            bindings,
        )
        .unwrap();
        assert_eq!(result.output, "1;2;outer");
    }

    #[test]
    fn this_is_undefined_outside_each() {
        assert!(matches!(
            run(&InMemoryRegistry::new(), "{{this}}", Bindings::new()),
            Err(PlannerError::UndefinedVariable { .. })
        ));
    }

    #[test]
    fn block_set_binds_rendered_text() {
        let result = run(
            &InMemoryRegistry::new(),
            "{{set \"n\" \"Ada\"}}{{#set \"greeting\"}}Hello {{n}}{{/set}}<{{greeting}}>",
            Bindings::new(),
        )
        .unwrap();
        assert_eq!(result.output, "<Hello Ada>");
    }

    #[test]
    fn loop_calls_function_per_item() {
        let mut bindings = Bindings::new();
        bindings.insert("words".into(), json!(["a", "b"]));
        let result = run(
            &echo_registry(),
            "{{#each words}}{{text-Upper input=this}}{{/each}}",
            bindings,
        )
        .unwrap();
        assert_eq!(result.output, "AB");
        assert_eq!(result.invocations.len(), 2);
    }

    #[test]
    fn failure_aborts_and_skips_later_calls() {
        let later = counter();
        let later_c = Arc::clone(&later);
        let mut registry = InMemoryRegistry::new();
        registry.register(FunctionDescriptor::new("ops", "Fail", "Always fails"), |_| {
            anyhow::bail!("backend unavailable")
        });
        registry.register(FunctionDescriptor::new("ops", "Later", "Counts calls"), move |_| {
            later_c.fetch_add(1, Ordering::SeqCst);
            Ok(json!("later"))
        });

        let err = run(
            &registry,
            "partial {{ops-Fail input=\"x\"}} {{ops-Later}}",
            Bindings::new(),
        )
        .unwrap_err();

        match err {
            PlannerError::FunctionInvocationFailure {
                function,
                arguments,
                detail,
            } => {
                assert_eq!(function, "ops-Fail");
                assert_eq!(arguments, r#"{"input":"x"}"#);
                assert!(detail.contains("backend unavailable"));
            }
            other => panic!("expected FunctionInvocationFailure, got {other:?}"),
        }
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancellation_during_call_is_distinct_from_failure() {
        let later = counter();
        let later_c = Arc::clone(&later);
        let cancel = CancellationToken::new();
        let cancel_inside = cancel.clone();

        let mut registry = InMemoryRegistry::new();
        registry.register(FunctionDescriptor::new("ops", "First", "Cancels the run"), move |_| {
            cancel_inside.cancel();
            Ok(json!("done"))
        });
        registry.register(FunctionDescriptor::new("ops", "Second", "Counts calls"), move |_| {
            later_c.fetch_add(1, Ordering::SeqCst);
            Ok(json!("second"))
        });

        let template = parse("{{ops-First}}{{ops-Second}}").unwrap();
        let catalog = FunctionCatalog::from_registry(&registry);
        let err = Engine::new(&catalog, &registry, &cancel)
            .execute(&template, Bindings::new())
            .unwrap_err();

        assert!(matches!(err, PlannerError::Cancelled));
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn already_cancelled_token_runs_nothing() {
        let calls = counter();
        let calls_c = Arc::clone(&calls);
        let mut registry = InMemoryRegistry::new();
        registry.register(FunctionDescriptor::new("ops", "Any", "Counts calls"), move |_| {
            calls_c.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
        let template = parse("{{ops-Any}}").unwrap();
        let catalog = FunctionCatalog::from_registry(&registry);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Engine::new(&catalog, &registry, &cancel)
            .execute(&template, Bindings::new())
            .unwrap_err();
        assert!(matches!(err, PlannerError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn helpers_compose_with_variables() {
        let mut bindings = Bindings::new();
        bindings.insert("n".into(), json!(3));
        let result = run(
            &InMemoryRegistry::new(),
            "{{#if (greaterThan n 2)}}{{concat \"n=\" (add n 1)}}{{/if}}",
            bindings,
        )
        .unwrap();
        assert_eq!(result.output, "n=4");
    }

    #[test]
    fn bind_arguments_rejects_duplicate_binding() {
        let d = FunctionDescriptor::new("a", "b", "")
            .with_parameter(ParameterDescriptor::required("input", ""));
        let err = bind_arguments(&d, vec![json!(1)], vec![("input".into(), json!(2))]).unwrap_err();
        assert!(matches!(err, PlannerError::InvalidArguments { .. }));
    }

    #[test]
    fn bind_arguments_skips_optional_without_default() {
        let d = FunctionDescriptor::new("a", "b", "")
            .with_parameter(ParameterDescriptor::optional("style", "", None));
        let bound = bind_arguments(&d, vec![], vec![]).unwrap();
        assert!(bound.is_empty());
    }
}
