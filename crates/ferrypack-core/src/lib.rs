//! Core of the ferrypack bundler.
//!
//! A build resolves the entry module, runs every reachable module through
//! the loader chain of the first rule matching its path, composes the stage
//! source maps and emits one bundle. [`build::BuildSession`] keeps the module
//! graph between passes so a change only rebuilds what depends on it.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

pub mod build;
pub mod compiler;
pub mod config;
pub mod emit;
pub mod error;
pub mod graph;
pub mod imports;
pub mod loader;
pub mod resolver;
pub mod rules;
pub mod sourcemap;
pub mod version;

pub use build::{BuildOptions, BuildOutput, BuildSession, PassReport};
pub use compiler::{CompileOutput, CompileRequest, CompilerError, CompilerInvoker};
pub use config::{Config, ProjectConfig, CONFIG_FILE_NAME};
pub use emit::{Bundle, BundleEmitter};
pub use error::Error;
pub use graph::{BuildGraph, ModuleState};
pub use resolver::Resolver;
pub use rules::{PathPattern, Rule, Selection};
pub use version::VERSION;
