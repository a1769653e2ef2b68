//! External compiler invocation.
//!
//! A loader stage that needs the foreign-language compiler hands a
//! [`CompileRequest`] to a [`CompilerInvoker`]. Two strategies exist:
//!
//! - [`DirectInvoker`] starts one compiler process per request.
//! - [`CompanionInvoker`] talks to a long-lived companion process over the
//!   `ferrypack-proto` frame protocol, and falls back to a direct invocation
//!   whenever the companion cannot be reached.
//!
//! Both build the compiler command line with [`args::build_command`], so the
//! arguments for a given request are identical whichever strategy runs it.

pub mod args;
pub mod companion;
pub mod diagnostics;
pub mod direct;

pub use companion::{CompanionConnection, CompanionConnector, CompanionInvoker, CompanionPolicy, ProcessConnector};
pub use direct::DirectInvoker;

use crate::rules::LoaderOptions;
use crate::Error;
use ferrypack_proto::{CompileOptions, Diagnostic};
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

/// Compiler program used when a loader does not name one.
pub const DEFAULT_COMPILER: &str = "purs";

/// Output directory used when a loader does not name one.
pub const DEFAULT_OUTPUT_DIR: &str = "output";

/// One module to compile.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileRequest {
    pub path: PathBuf,
    /// Module text when it differs from the file on disk (the compiler
    /// stage is not the first in its chain).
    pub source: Option<String>,
    pub options: CompileOptions,
}

impl CompileRequest {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, options: CompileOptions) -> Self {
        Self {
            path: path.into(),
            source: None,
            options,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Result of a successful compilation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileOutput {
    pub code: String,
    /// V3 source map JSON, when the compiler wrote one.
    pub source_map: Option<String>,
    /// File the compiler wrote the module to; `None` for stdout output.
    /// Relative `require`s in `code` resolve from here.
    pub output_path: Option<PathBuf>,
    /// Non-fatal diagnostics (warnings).
    pub diagnostics: Vec<Diagnostic>,
    pub from_cache: bool,
}

/// Compiler error with optional diagnostics.
#[derive(Debug, Clone)]
pub struct CompilerError {
    /// Error code.
    pub code: &'static str,
    /// Human-readable error message.
    pub message: String,
    /// Compiler diagnostics (if available).
    pub diagnostics: Vec<Diagnostic>,
}

impl CompilerError {
    /// Create a new compiler error.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            diagnostics: Vec::new(),
        }
    }

    /// Attach diagnostics.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// The compiler ran and rejected the module.
    #[must_use]
    pub fn compilation(message: impl Into<String>) -> Self {
        Self::new("COMPILATION_FAILED", message)
    }

    /// The compiler process could not be started.
    #[must_use]
    pub fn spawn(program: &str, err: &std::io::Error) -> Self {
        Self::new("COMPILER_SPAWN_FAILED", format!("failed to start {program}: {err}"))
    }

    /// The compiler succeeded but the expected output is absent.
    #[must_use]
    pub fn output_missing(path: &Path) -> Self {
        Self::new(
            "COMPILER_OUTPUT_MISSING",
            format!("expected compiler output at {}", path.display()),
        )
    }

    /// The compiler output could not be read as module code.
    #[must_use]
    pub fn malformed_output(message: impl Into<String>) -> Self {
        Self::new("COMPILER_OUTPUT_MALFORMED", message)
    }

    /// The loader options cannot be turned into a command line.
    #[must_use]
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::new("COMPILER_INVALID_OPTIONS", message)
    }

    /// The companion could not serve the request.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("COMPANION_UNAVAILABLE", message)
    }
}

impl fmt::Display for CompilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        for diag in &self.diagnostics {
            write!(f, "\n  - {}: {}", diag.severity.as_str(), diag.message)?;
            if let (Some(file), Some(line), Some(col)) = (&diag.file, diag.line, diag.column) {
                write!(f, " at {}:{}:{}", file.display(), line, col)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CompilerError {}

/// Strategy for running the compiler.
///
/// The trait is `Send + Sync` so one invoker can be shared by every
/// concurrently running loader stage.
pub trait CompilerInvoker: Send + Sync {
    /// Strategy name, used in logs.
    fn name(&self) -> &'static str;

    /// Compile one module.
    fn invoke(&self, request: CompileRequest) -> BoxFuture<'_, Result<CompileOutput, CompilerError>>;
}

/// Compiler settings extracted from a `compiler` loader's options.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerSettings {
    pub options: CompileOptions,
    /// Route requests through the companion process.
    pub companion: bool,
}

impl CompilerSettings {
    /// Parse loader options. `root` becomes the compiler's working directory
    /// unless the options name one.
    pub fn from_options(options: &LoaderOptions, root: &Path) -> Result<Self, Error> {
        let mut map = options.clone();
        let companion = ["companion", "pscIde"]
            .iter()
            .filter_map(|key| map.remove(*key))
            .any(|v| v.as_bool().unwrap_or(false));
        map.remove("bundle");
        if !map.contains_key("compiler") && !map.contains_key("psc") {
            map.insert("compiler".into(), Value::String(DEFAULT_COMPILER.into()));
        }

        let mut options: CompileOptions = serde_json::from_value(Value::Object(map))
            .map_err(|e| Error::ConfigInvalid(format!("invalid compiler options: {e}")))?;
        options.cwd = Some(match options.cwd.take() {
            Some(cwd) if cwd.is_relative() => root.join(cwd),
            Some(cwd) => cwd,
            None => root.to_path_buf(),
        });
        if options.output.is_none() {
            options.output = Some(DEFAULT_OUTPUT_DIR.to_string());
        }
        args::validate(&options)?;

        Ok(Self { options, companion })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrypack_proto::ExecutionMode;

    fn options(json: &str) -> LoaderOptions {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_settings_defaults() {
        let settings = CompilerSettings::from_options(&options("{}"), Path::new("/proj")).unwrap();
        assert_eq!(settings.options.compiler, "purs");
        assert_eq!(settings.options.output.as_deref(), Some("output"));
        assert_eq!(settings.options.cwd.as_deref(), Some(Path::new("/proj")));
        assert!(!settings.companion);
    }

    #[test]
    fn test_settings_from_purescript_loader_query() {
        let query = options(
            r#"{"src": ["src/**/*.purs"], "bundle": false, "psc": "psa",
                "pscArgs": {"sourceMaps": true}, "pscIde": true}"#,
        );
        let settings = CompilerSettings::from_options(&query, Path::new("/proj")).unwrap();
        assert_eq!(settings.options.compiler, "psa");
        assert!(settings.companion);
        assert_eq!(settings.options.src, vec!["src/**/*.purs"]);
        assert_eq!(
            settings.options.compiler_args.get("sourceMaps"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_settings_relative_cwd_and_mode() {
        let query = options(r#"{"cwd": "frontend", "mode": "wrapped", "wrapper": "psa"}"#);
        let settings = CompilerSettings::from_options(&query, Path::new("/proj")).unwrap();
        assert_eq!(settings.options.cwd.as_deref(), Some(Path::new("/proj/frontend")));
        assert_eq!(settings.options.mode, ExecutionMode::Wrapped);
    }

    #[test]
    fn test_settings_reject_bad_options() {
        let err = CompilerSettings::from_options(&options(r#"{"src": "not-a-list"}"#), Path::new("/p"))
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID");

        let err = CompilerSettings::from_options(&options(r#"{"mode": "wrapped"}"#), Path::new("/p"))
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID");
    }

    #[test]
    fn test_compiler_error_display_lists_diagnostics() {
        let err = CompilerError::compilation("purs exited with status 1").with_diagnostics(vec![
            Diagnostic::error("Unknown value foo").with_location("src/Main.purs", 3, 7),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("COMPILATION_FAILED: purs exited"));
        assert!(text.contains("error: Unknown value foo at src/Main.purs:3:7"));
    }
}
