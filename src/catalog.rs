//! Function catalog: a normalized, read-only snapshot of the functions a
//! registry exposes, used for prompt rendering and call-time resolution.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::error::PlannerError;

/// Separator between namespace and function name in template call
/// expressions (`email-SendEmail`).
pub const NAMESPACE_SEPARATOR: char = '-';

/// Arguments bound to a function call, keyed by parameter name.
pub type Arguments = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionKey {
    pub namespace: String,
    pub name: String,
}

impl FunctionKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{NAMESPACE_SEPARATOR}{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free-form type hint shown to the model (e.g. "string", "number").
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub parameter_type: Option<String>,
    #[serde(default, rename = "required")]
    pub is_required: bool,
    #[serde(default, rename = "default", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl ParameterDescriptor {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_type: None,
            is_required: true,
            default_value: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        description: impl Into<String>,
        default_value: Option<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_type: None,
            is_required: false,
            default_value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDescriptor>,
}

impl FunctionDescriptor {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ParameterDescriptor) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn key(&self) -> FunctionKey {
        FunctionKey::new(&self.namespace, &self.name)
    }
}

/// Source of callable functions. Implementations must be safe to share
/// between concurrent plan invocations.
pub trait FunctionRegistry: Send + Sync {
    /// Enumerate the functions currently available.
    fn functions(&self) -> Vec<FunctionDescriptor>;

    /// Invoke one function with already-bound arguments. Long-running
    /// implementations should observe `cancel`.
    fn invoke(
        &self,
        key: &FunctionKey,
        arguments: &Arguments,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Value>;
}

/// Read-only view of a registry taken at one point in time.
///
/// Built fresh for every synthesis and every execution; the registry may
/// change between the two.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionCatalog {
    functions: BTreeMap<FunctionKey, FunctionDescriptor>,
}

impl FunctionCatalog {
    pub fn from_registry(registry: &dyn FunctionRegistry) -> Self {
        Self::from_descriptors(registry.functions())
    }

    /// Later descriptors with the same `(namespace, name)` replace earlier ones.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = FunctionDescriptor>) -> Self {
        let functions = descriptors.into_iter().map(|d| (d.key(), d)).collect();
        Self { functions }
    }

    /// Drop every function in an excluded namespace, and every function
    /// whose bare name or qualified `namespace-name` is excluded.
    pub fn without(self, excluded_namespaces: &[String], excluded_functions: &[String]) -> Self {
        let functions = self
            .functions
            .into_iter()
            .filter(|(key, _)| {
                !excluded_namespaces.iter().any(|ns| ns == &key.namespace)
                    && !excluded_functions
                        .iter()
                        .any(|f| f == &key.name || f == &key.to_string())
            })
            .collect();
        Self { functions }
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Descriptors ordered by `(namespace, name)`.
    pub fn iter(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        self.functions.values()
    }

    pub fn get(&self, key: &FunctionKey) -> Option<&FunctionDescriptor> {
        self.functions.get(key)
    }

    /// Resolve a call target. With a namespace the lookup is exact, falling
    /// back to a unique ASCII case-insensitive match. Without one, the name
    /// must match exactly one function across all namespaces.
    pub fn resolve(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<&FunctionDescriptor, PlannerError> {
        match namespace {
            Some(ns) => {
                if let Some(d) = self.functions.get(&FunctionKey::new(ns, name)) {
                    return Ok(d);
                }
                let folded: Vec<&FunctionDescriptor> = self
                    .functions
                    .values()
                    .filter(|d| {
                        d.namespace.eq_ignore_ascii_case(ns) && d.name.eq_ignore_ascii_case(name)
                    })
                    .collect();
                match folded.as_slice() {
                    [only] => Ok(only),
                    _ => Err(PlannerError::UnresolvedFunction {
                        function: format!("{ns}{NAMESPACE_SEPARATOR}{name}"),
                    }),
                }
            }
            None => {
                let matches: Vec<&FunctionDescriptor> =
                    self.functions.values().filter(|d| d.name == name).collect();
                match matches.as_slice() {
                    [only] => Ok(only),
                    [] => Err(PlannerError::UnresolvedFunction {
                        function: name.to_owned(),
                    }),
                    many => Err(PlannerError::AmbiguousFunction {
                        name: name.to_owned(),
                        candidates: many.iter().map(|d| d.key().to_string()).collect(),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> FunctionCatalog {
        FunctionCatalog::from_descriptors(vec![
            FunctionDescriptor::new("email", "SendEmail", "Send an e-mail"),
            FunctionDescriptor::new("email", "GetEmailAddress", "Get an e-mail address"),
            FunctionDescriptor::new("WriterPlugin", "Translate", "Translate something"),
            FunctionDescriptor::new("OtherWriter", "Translate", "Translate differently"),
        ])
    }

    #[test]
    fn key_displays_with_separator() {
        assert_eq!(FunctionKey::new("email", "SendEmail").to_string(), "email-SendEmail");
    }

    #[test]
    fn resolves_qualified_name() {
        let c = catalog();
        let d = c.resolve(Some("email"), "SendEmail").unwrap();
        assert_eq!(d.description, "Send an e-mail");
    }

    #[test]
    fn qualified_lookup_tolerates_case_differences() {
        let c = catalog();
        let d = c.resolve(Some("Email"), "sendemail").unwrap();
        assert_eq!(d.name, "SendEmail");
    }

    #[test]
    fn unqualified_unique_name_resolves() {
        let c = catalog();
        let d = c.resolve(None, "GetEmailAddress").unwrap();
        assert_eq!(d.namespace, "email");
    }

    #[test]
    fn unqualified_shared_name_is_ambiguous() {
        let c = catalog();
        match c.resolve(None, "Translate") {
            Err(PlannerError::AmbiguousFunction { name, candidates }) => {
                assert_eq!(name, "Translate");
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected AmbiguousFunction, got {other:?}"),
        }
    }

    #[test]
    fn unknown_function_is_unresolved() {
        let c = catalog();
        match c.resolve(Some("email"), "Delete") {
            Err(PlannerError::UnresolvedFunction { function }) => {
                assert_eq!(function, "email-Delete");
            }
            other => panic!("expected UnresolvedFunction, got {other:?}"),
        }
    }

    #[test]
    fn exclusions_filter_by_namespace_and_name() {
        let c = catalog().without(
            &["OtherWriter".to_owned()],
            &["email-GetEmailAddress".to_owned()],
        );
        assert_eq!(c.len(), 2);
        assert!(c.resolve(None, "Translate").is_ok());
        assert!(c.resolve(None, "GetEmailAddress").is_err());

        let by_bare_name = catalog().without(&[], &["SendEmail".to_owned()]);
        assert_eq!(by_bare_name.len(), 3);
    }

    #[test]
    fn parameter_descriptor_deserializes_manifest_names() {
        let p: ParameterDescriptor = toml::from_str(
            "name = \"language\"\ndescription = \"Target language\"\nrequired = true\ntype = \"string\"\n",
        )
        .unwrap();
        assert!(p.is_required);
        assert_eq!(p.parameter_type.as_deref(), Some("string"));
        assert_eq!(p.default_value, None);
    }
}
