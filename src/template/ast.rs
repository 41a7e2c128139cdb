use serde_json::Value;

/// Root of a parsed template: top-level nodes in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Text copied to the output verbatim, whitespace included.
    Literal(String),
    /// An inline `{{...}}` expression whose value is rendered as text.
    Output(Expr),
    Set { name: String, value: SetValue },
    If {
        condition: Expr,
        then_block: Vec<Node>,
        else_block: Option<Vec<Node>>,
    },
    Each {
        collection: Expr,
        body: Vec<Node>,
        /// Rendered instead of `body` when the collection is empty.
        else_block: Option<Vec<Node>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetValue {
    Expr(Expr),
    /// `{{#set "name"}}...{{/set}}`: the rendered body, as a string.
    Block(Vec<Node>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Variable lookup; `path` may be dotted (`this.name`, `items.0`).
    Get { path: String, offset: usize },
    Call(Call),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub callee: Callee,
    pub positional: Vec<Expr>,
    pub named: Vec<(String, Expr)>,
    /// Byte offset of the call in the template source.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    Helper(Helper),
    Function {
        namespace: Option<String>,
        name: String,
    },
}

/// Built-in value helpers usable in call position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    Equals,
    NotEquals,
    LessThan,
    GreaterThan,
    LessThanOrEqual,
    GreaterThanOrEqual,
    And,
    Or,
    Not,
    Concat,
    Array,
    Object,
    Range,
    Json,
    Add,
    Subtract,
    Multiply,
    Divide,
    Length,
}

impl Helper {
    pub fn from_name(name: &str) -> Option<Helper> {
        let helper = match name {
            "equals" | "equal" => Helper::Equals,
            "notEquals" => Helper::NotEquals,
            "lessThan" => Helper::LessThan,
            "greaterThan" => Helper::GreaterThan,
            "lessThanOrEqual" => Helper::LessThanOrEqual,
            "greaterThanOrEqual" => Helper::GreaterThanOrEqual,
            "and" => Helper::And,
            "or" => Helper::Or,
            "not" => Helper::Not,
            "concat" => Helper::Concat,
            "array" => Helper::Array,
            "object" => Helper::Object,
            "range" => Helper::Range,
            "json" => Helper::Json,
            "add" => Helper::Add,
            "subtract" => Helper::Subtract,
            "multiply" => Helper::Multiply,
            "divide" => Helper::Divide,
            "length" => Helper::Length,
            _ => return None,
        };
        Some(helper)
    }

    pub fn name(self) -> &'static str {
        match self {
            Helper::Equals => "equals",
            Helper::NotEquals => "notEquals",
            Helper::LessThan => "lessThan",
            Helper::GreaterThan => "greaterThan",
            Helper::LessThanOrEqual => "lessThanOrEqual",
            Helper::GreaterThanOrEqual => "greaterThanOrEqual",
            Helper::And => "and",
            Helper::Or => "or",
            Helper::Not => "not",
            Helper::Concat => "concat",
            Helper::Array => "array",
            Helper::Object => "object",
            Helper::Range => "range",
            Helper::Json => "json",
            Helper::Add => "add",
            Helper::Subtract => "subtract",
            Helper::Multiply => "multiply",
            Helper::Divide => "divide",
            Helper::Length => "length",
        }
    }
}

impl Template {
    /// True when any `each` block appears anywhere in the tree.
    pub fn contains_loop(&self) -> bool {
        fn any_loop(nodes: &[Node]) -> bool {
            nodes.iter().any(|n| match n {
                Node::Each { .. } => true,
                Node::If {
                    then_block,
                    else_block,
                    ..
                } => any_loop(then_block) || else_block.as_deref().is_some_and(any_loop),
                Node::Set {
                    value: SetValue::Block(body),
                    ..
                } => any_loop(body),
                _ => false,
            })
        }
        any_loop(&self.nodes)
    }
}
