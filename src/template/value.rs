//! Runtime values: rendering, truthiness and variable scopes.

use serde_json::{Map, Value};

/// Name bound to the current element inside `each`.
pub const CURRENT_ITEM: &str = "this";

/// Initial variable bindings supplied by the caller.
pub type Bindings = Map<String, Value>;

/// Text form of a value in rendered output. Strings render bare, `null`
/// renders empty, collections render as compact JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Empty string, zero, `false`, `null` and empty collections are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Numeric view used by comparison and arithmetic helpers. Numeric strings
/// count, since function results frequently arrive as text.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Chain of variable scopes, innermost last.
///
/// Lookups walk from the innermost scope outward; `set` always binds in the
/// innermost scope, so bindings made inside a child scope vanish with it.
#[derive(Debug, Clone)]
pub struct Scopes {
    frames: Vec<Map<String, Value>>,
}

impl Scopes {
    pub fn new(root: Bindings) -> Self {
        Self { frames: vec![root] }
    }

    pub fn push(&mut self, frame: Map<String, Value>) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_owned(), value);
        }
    }

    /// Resolve a dotted path: the first segment is a binding, the rest index
    /// into objects (by key) or arrays (by position). When the first segment
    /// is unbound and the current loop item is an object, the whole path is
    /// resolved against that item, so `x` reads `this.x` inside `each`.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let found = match self.binding(head) {
            Some(bound) => walk(bound, segments),
            None => match self.binding(CURRENT_ITEM) {
                Some(item) if item.is_object() => walk(item, path.split('.')),
                _ => None,
            },
        };
        found.cloned()
    }

    fn binding(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }
}

fn walk<'v, 's>(
    mut current: &'v Value,
    segments: impl Iterator<Item = &'s str>,
) -> Option<&'v Value> {
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
