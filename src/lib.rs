//! Goal-to-plan synthesis and execution for Handlebars-style plans.
//!
//! A [`planner::Planner`] prompts a [`planner::CompletionService`] with a
//! goal and the functions a [`catalog::FunctionRegistry`] exposes, then
//! extracts and parses the fenced template it answers with into a
//! [`plan::Plan`]. Invoking the plan runs the template against the
//! registry.

pub mod agent;
pub mod cancel;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod logging;
pub mod plan;
pub mod planner;
pub mod prompt;
pub mod registry;
pub mod report;
pub mod subprocess;
pub mod template;

pub use cancel::CancellationToken;
pub use catalog::{FunctionDescriptor, FunctionKey, FunctionRegistry, ParameterDescriptor};
pub use error::{PlannerError, TemplateParseError};
pub use plan::Plan;
pub use planner::{CompletionService, ExecutionSettings, Planner, PlannerOptions};
