//! Runtime for the contradiction-resolution engine
//!
//! - [`rules`]: keyword/constraint evaluator and composer
//! - [`arbiter`]: local policy arbiter and HTTP arbiter
//! - [`config`]: TOML + environment configuration
//! - [`runtime`]: builds a [`resolution::CoordinationOrchestrator`] from config

#![allow(clippy::uninlined_format_args)]

pub mod arbiter;
pub mod config;
pub mod rules;
pub mod runtime;

pub use arbiter::{HttpArbiter, PolicyArbiter};
pub use config::{AgentSpec, RuntimeConfig};
pub use rules::{Rule, RuleComposer, RuleEvaluator};
pub use runtime::{build_orchestrator, build_orchestrator_with, open_ledger};
