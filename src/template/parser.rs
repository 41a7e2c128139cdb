//! Recursive-descent parser from scanned segments to a [`Template`] tree.

use serde_json::Value;

use crate::catalog::NAMESPACE_SEPARATOR;
use crate::error::TemplateParseError;

use super::ast::{Call, Callee, Expr, Helper, Node, SetValue, Template};
use super::lexer::{self, Segment, Token};

/// Deepest allowed nesting of blocks (including `else if` chains) and,
/// separately, of parenthesized sub-expressions within one tag.
pub const MAX_NESTING: usize = 64;

/// Parse template source into a tree. Block tags must nest correctly and
/// block helper names must be known; function names are not checked here.
pub fn parse(source: &str) -> Result<Template, TemplateParseError> {
    let segments = lexer::scan(source)?;
    let mut parser = Parser {
        source,
        segments,
        pos: 0,
        depth: 0,
    };
    let (nodes, stop) = parser.parse_nodes()?;
    match stop {
        Stop::Eof => Ok(Template { nodes }),
        Stop::Else { offset, raw, .. } => Err(TemplateParseError::at(
            source,
            offset,
            "`else` outside of an if/unless/each block",
            &lexer::fragment(raw),
        )),
        Stop::Close { name, offset, raw } => Err(TemplateParseError::at(
            source,
            offset,
            format!("closing tag `{{{{/{name}}}}}` has no matching open block"),
            &lexer::fragment(raw),
        )),
    }
}

struct Parser<'a> {
    source: &'a str,
    segments: Vec<Segment<'a>>,
    pos: usize,
    depth: usize,
}

/// Why a run of sibling nodes ended.
enum Stop<'a> {
    Eof,
    Else {
        tokens: Vec<(Token, usize)>,
        offset: usize,
        raw: &'a str,
    },
    Close {
        name: String,
        offset: usize,
        raw: &'a str,
    },
}

/// An opened block, remembered for error reporting.
struct Opened<'a> {
    name: &'static str,
    offset: usize,
    raw: &'a str,
}

impl<'a> Parser<'a> {
    fn parse_nodes(&mut self) -> Result<(Vec<Node>, Stop<'a>), TemplateParseError> {
        let mut nodes = Vec::new();

        while self.pos < self.segments.len() {
            let segment = self.segments[self.pos].clone();
            self.pos += 1;

            let (body, body_offset, raw, offset) = match segment {
                Segment::Text(text) => {
                    nodes.push(Node::Literal(text));
                    continue;
                }
                Segment::Tag {
                    body,
                    body_offset,
                    raw,
                    offset,
                } => (body, body_offset, raw, offset),
            };

            let trimmed = body.trim_start();
            let lead = body.len() - trimmed.len();

            if let Some(rest) = trimmed.strip_prefix('#') {
                let rest_offset = body_offset + lead + 1;
                let node = self.parse_block(rest, rest_offset, raw, offset)?;
                nodes.push(node);
            } else if let Some(rest) = trimmed.strip_prefix('/') {
                return Ok((
                    nodes,
                    Stop::Close {
                        name: rest.trim().to_owned(),
                        offset,
                        raw,
                    },
                ));
            } else if trimmed == "else" || trimmed.starts_with("else ") {
                let rest = &trimmed[4..];
                let tokens = lexer::tokenize(self.source, rest, body_offset + lead + 4, raw)?;
                return Ok((nodes, Stop::Else { tokens, offset, raw }));
            } else {
                let tokens = lexer::tokenize(self.source, body, body_offset, raw)?;
                nodes.push(self.parse_inline(tokens, raw, offset)?);
            }
        }

        Ok((nodes, Stop::Eof))
    }

    fn parse_block(
        &mut self,
        rest: &str,
        rest_offset: usize,
        raw: &'a str,
        offset: usize,
    ) -> Result<Node, TemplateParseError> {
        self.enter(offset, raw)?;
        let node = self.parse_block_body(rest, rest_offset, raw, offset);
        self.depth -= 1;
        node
    }

    fn parse_block_body(
        &mut self,
        rest: &str,
        rest_offset: usize,
        raw: &'a str,
        offset: usize,
    ) -> Result<Node, TemplateParseError> {
        let tokens = lexer::tokenize(self.source, rest, rest_offset, raw)?;
        let Some((Token::Ident(name), _)) = tokens.first() else {
            return Err(self.error(offset, "block tag is missing its helper name", raw));
        };
        let args = tokens[1..].to_vec();

        match name.as_str() {
            "if" => {
                let opened = Opened { name: "if", offset, raw };
                let condition = self.single_expr(&args, "if", raw, offset)?;
                self.parse_conditional(condition, &opened)
            }
            "unless" => {
                let opened = Opened { name: "unless", offset, raw };
                let condition = self.single_expr(&args, "unless", raw, offset)?;
                self.parse_conditional(negate(condition, offset), &opened)
            }
            "each" => {
                let opened = Opened { name: "each", offset, raw };
                let collection = self.single_expr(&args, "each", raw, offset)?;
                let (body, stop) = self.parse_nodes()?;
                let else_block = match stop {
                    Stop::Else { tokens, offset: else_offset, raw: else_raw } => {
                        if !tokens.is_empty() {
                            return Err(self.error(else_offset, "`else` in an each block takes no arguments", else_raw));
                        }
                        let (else_nodes, stop) = self.parse_nodes()?;
                        self.expect_close(stop, &opened)?;
                        Some(else_nodes)
                    }
                    other => {
                        self.expect_close(other, &opened)?;
                        None
                    }
                };
                Ok(Node::Each {
                    collection,
                    body,
                    else_block,
                })
            }
            "set" => {
                let opened = Opened { name: "set", offset, raw };
                let mut exprs = ExprParser::new(self.source, &args, raw);
                let (positional, named) = exprs.parse_args(false)?;
                let name = set_name(&positional, &named)
                    .ok_or_else(|| self.error(offset, "block `set` requires a variable name", raw))?;
                let (body, stop) = self.parse_nodes()?;
                self.expect_close(stop, &opened)?;
                Ok(Node::Set {
                    name,
                    value: SetValue::Block(body),
                })
            }
            other => Err(self.error(offset, &format!("unknown block helper `{other}`"), raw)),
        }
    }

    /// Parse the branches of an `if`/`unless` after its condition, handling
    /// `{{else}}` and chained `{{else if ...}}` up to the single close tag.
    fn parse_conditional(
        &mut self,
        condition: Expr,
        opened: &Opened<'a>,
    ) -> Result<Node, TemplateParseError> {
        let (then_block, stop) = self.parse_nodes()?;
        let else_block = match stop {
            Stop::Else { tokens, offset, raw } => {
                if tokens.is_empty() {
                    let (else_nodes, stop) = self.parse_nodes()?;
                    self.expect_close(stop, opened)?;
                    Some(else_nodes)
                } else {
                    match tokens.first() {
                        Some((Token::Ident(kw), _)) if kw == "if" || kw == "unless" => {
                            let chained = self.single_expr(&tokens[1..], kw, raw, offset)?;
                            let chained = if kw == "unless" {
                                negate(chained, offset)
                            } else {
                                chained
                            };
                            self.enter(offset, raw)?;
                            let nested = self.parse_conditional(chained, opened);
                            self.depth -= 1;
                            Some(vec![nested?])
                        }
                        _ => {
                            return Err(self.error(
                                offset,
                                "`else` accepts only `if` or `unless` chaining",
                                raw,
                            ));
                        }
                    }
                }
            }
            other => {
                self.expect_close(other, opened)?;
                None
            }
        };
        Ok(Node::If {
            condition,
            then_block,
            else_block,
        })
    }

    fn expect_close(&self, stop: Stop<'a>, opened: &Opened<'a>) -> Result<(), TemplateParseError> {
        match stop {
            Stop::Close { name, .. } if name == opened.name => Ok(()),
            Stop::Close { name, offset, raw } => Err(self.error(
                offset,
                &format!(
                    "closing tag `{{{{/{name}}}}}` does not match open block `{}`",
                    opened.name
                ),
                raw,
            )),
            Stop::Else { offset, raw, .. } => Err(self.error(
                offset,
                &format!("unexpected `else` in `{}` block", opened.name),
                raw,
            )),
            Stop::Eof => Err(self.error(
                opened.offset,
                &format!("unterminated `{}` block", opened.name),
                opened.raw,
            )),
        }
    }

    fn single_expr(
        &self,
        tokens: &[(Token, usize)],
        helper: &str,
        raw: &str,
        offset: usize,
    ) -> Result<Expr, TemplateParseError> {
        let mut exprs = ExprParser::new(self.source, tokens, raw);
        let (mut positional, named) = exprs.parse_args(false)?;
        if positional.len() != 1 || !named.is_empty() {
            return Err(self.error(
                offset,
                &format!("`{helper}` expects exactly one argument"),
                raw,
            ));
        }
        Ok(positional.remove(0))
    }

    fn parse_inline(
        &self,
        tokens: Vec<(Token, usize)>,
        raw: &str,
        offset: usize,
    ) -> Result<Node, TemplateParseError> {
        let Some((first, _)) = tokens.first() else {
            return Err(self.error(offset, "empty expression", raw));
        };

        if matches!(first, Token::Ident(name) if name == "set") {
            let mut exprs = ExprParser::new(self.source, &tokens[1..], raw);
            let (mut positional, mut named) = exprs.parse_args(false)?;
            let name = set_name(&positional, &named)
                .ok_or_else(|| self.error(offset, "`set` requires a variable name", raw))?;
            let value = if let Some(i) = named.iter().position(|(k, _)| k == "value") {
                named.remove(i).1
            } else if positional.len() == 2 {
                positional.remove(1)
            } else {
                return Err(self.error(offset, "`set` requires exactly one value", raw));
            };
            return Ok(Node::Set {
                name,
                value: SetValue::Expr(value),
            });
        }

        // `{{email-GetAddress}}`: a qualified name alone is a zero-argument call.
        if let [(Token::Ident(name), name_offset)] = tokens.as_slice() {
            if let callee @ Callee::Function {
                namespace: Some(_), ..
            } = function_callee(name)
            {
                return Ok(Node::Output(Expr::Call(Call {
                    callee,
                    positional: Vec::new(),
                    named: Vec::new(),
                    offset: *name_offset,
                })));
            }
        }

        let mut exprs = ExprParser::new(self.source, &tokens, raw);
        let expr = if tokens.len() == 1 {
            exprs.parse_value()?
        } else {
            exprs.parse_call(offset)?
        };
        exprs.expect_end()?;
        Ok(Node::Output(expr))
    }

    fn enter(&mut self, offset: usize, raw: &str) -> Result<(), TemplateParseError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(offset, "blocks nested too deeply", raw));
        }
        self.depth += 1;
        Ok(())
    }

    fn error(&self, offset: usize, message: &str, raw: &str) -> TemplateParseError {
        TemplateParseError::at(self.source, offset, message, &lexer::fragment(raw))
    }
}

fn negate(condition: Expr, offset: usize) -> Expr {
    Expr::Call(Call {
        callee: Callee::Helper(Helper::Not),
        positional: vec![condition],
        named: Vec::new(),
        offset,
    })
}

/// Variable name for `set`: first positional (string or bare word), or `name=`.
fn set_name(positional: &[Expr], named: &[(String, Expr)]) -> Option<String> {
    let candidate = named
        .iter()
        .find(|(k, _)| k == "name")
        .map(|(_, e)| e)
        .or_else(|| positional.first())?;
    match candidate {
        Expr::Literal(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Expr::Get { path, .. } => Some(path.clone()),
        _ => None,
    }
}

/// Parses argument tokens of a single tag into expressions.
struct ExprParser<'s, 't> {
    source: &'s str,
    tokens: &'t [(Token, usize)],
    raw: &'t str,
    pos: usize,
    depth: usize,
}

impl<'s, 't> ExprParser<'s, 't> {
    fn new(source: &'s str, tokens: &'t [(Token, usize)], raw: &'t str) -> Self {
        Self {
            source,
            tokens,
            raw,
            pos: 0,
            depth: 0,
        }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> TemplateParseError {
        TemplateParseError::at(self.source, offset, message, &lexer::fragment(self.raw))
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map_or(0, |(_, o)| *o)
    }

    fn expect_end(&self) -> Result<(), TemplateParseError> {
        match self.tokens.get(self.pos) {
            None => Ok(()),
            Some((_, offset)) => Err(self.error(*offset, "unexpected trailing tokens")),
        }
    }

    /// One argument value: literal, variable path, or parenthesized call.
    fn parse_value(&mut self) -> Result<Expr, TemplateParseError> {
        let Some((token, offset)) = self.tokens.get(self.pos).cloned() else {
            return Err(self.error(self.end_offset(), "expected a value"));
        };
        self.pos += 1;
        match token {
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Bool(b) => Ok(Expr::Literal(Value::Bool(b))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(path) => Ok(Expr::Get { path, offset }),
            Token::LParen => {
                if self.depth >= MAX_NESTING {
                    return Err(self.error(offset, "expression nested too deeply"));
                }
                self.depth += 1;
                let expr = self.parse_call(offset);
                self.depth -= 1;
                let expr = expr?;
                match self.tokens.get(self.pos) {
                    Some((Token::RParen, _)) => {
                        self.pos += 1;
                        Ok(expr)
                    }
                    _ => Err(self.error(offset, "unclosed `(` in sub-expression")),
                }
            }
            Token::RParen => Err(self.error(offset, "unexpected `)`")),
            Token::Key(key) => Err(self.error(
                offset,
                format!("named argument `{key}=` where a value was expected"),
            )),
        }
    }

    /// A callee followed by its arguments, up to `)` or the end of the tag.
    fn parse_call(&mut self, offset: usize) -> Result<Expr, TemplateParseError> {
        let Some((Token::Ident(name), name_offset)) = self.tokens.get(self.pos).cloned() else {
            return Err(self.error(offset, "expected a helper or function name"));
        };
        self.pos += 1;
        let (positional, named) = self.parse_args(true)?;

        match name.as_str() {
            "get" => {
                if !named.is_empty() || positional.len() != 1 {
                    return Err(self.error(name_offset, "`get` expects exactly one variable name"));
                }
                match &positional[0] {
                    Expr::Literal(Value::String(path)) => Ok(Expr::Get {
                        path: path.clone(),
                        offset: name_offset,
                    }),
                    Expr::Get { .. } => Ok(positional[0].clone()),
                    _ => Err(self.error(name_offset, "`get` expects a variable name")),
                }
            }
            "set" | "if" | "unless" | "each" | "else" => Err(self.error(
                name_offset,
                format!("`{name}` cannot be used as an expression"),
            )),
            _ => {
                let callee = match Helper::from_name(&name) {
                    Some(helper) => Callee::Helper(helper),
                    None => function_callee(&name),
                };
                Ok(Expr::Call(Call {
                    callee,
                    positional,
                    named,
                    offset: name_offset,
                }))
            }
        }
    }

    /// Positional and `key=value` arguments. Stops at `)` when `in_call`.
    #[allow(clippy::type_complexity)]
    fn parse_args(
        &mut self,
        in_call: bool,
    ) -> Result<(Vec<Expr>, Vec<(String, Expr)>), TemplateParseError> {
        let mut positional = Vec::new();
        let mut named: Vec<(String, Expr)> = Vec::new();

        while let Some((token, offset)) = self.tokens.get(self.pos).cloned() {
            match token {
                Token::RParen if in_call => break,
                Token::Key(key) => {
                    self.pos += 1;
                    if named.iter().any(|(k, _)| *k == key) {
                        return Err(self.error(offset, format!("duplicate named argument `{key}`")));
                    }
                    let value = self.parse_value()?;
                    named.push((key, value));
                }
                _ => positional.push(self.parse_value()?),
            }
        }

        Ok((positional, named))
    }
}

fn function_callee(name: &str) -> Callee {
    match name.split_once(NAMESPACE_SEPARATOR) {
        Some((namespace, function)) if !namespace.is_empty() && !function.is_empty() => {
            Callee::Function {
                namespace: Some(namespace.to_owned()),
                name: function.to_owned(),
            }
        }
        _ => Callee::Function {
            namespace: None,
            name: name.to_owned(),
        },
    }
}
