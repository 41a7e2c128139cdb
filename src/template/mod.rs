//! The plan template language: a Handlebars subset with `set`/`get`,
//! `if`/`unless`/`each` blocks, value helpers and namespaced function calls.

pub mod ast;
pub mod engine;
pub mod helpers;
pub mod lexer;
pub mod parser;
pub mod value;

pub use ast::Template;
pub use engine::{Engine, InvocationRecord, InvocationResult};
pub use parser::parse;
pub use value::Bindings;
