//! Compiler command-line construction.
//!
//! The argument list is a pure function of the options, the module path and
//! the files matched by the `src` globs:
//!
//! ```text
//! [wrapper [wrapper args…]] compiler
//!     --output <dir>
//!     <compilerArgs, sorted by key>
//!     [--source-maps]
//!     <extraFlags, in order>
//!     <src matches, sorted and de-duplicated>
//!     [module path, unless already matched]
//! ```

use super::CompilerError;
use crate::Error;
use ferrypack_proto::{CompileOptions, ExecutionMode};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Flag added when a loader asks for source maps.
pub const SOURCE_MAPS_FLAG: &str = "--source-maps";

/// A fully built compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Check options that would make [`build_command`] fail.
pub fn validate(options: &CompileOptions) -> Result<(), Error> {
    if options.mode == ExecutionMode::Wrapped && options.wrapper.is_none() {
        return Err(Error::ConfigInvalid(
            "compiler mode `wrapped` requires a `wrapper` program".into(),
        ));
    }
    for (key, value) in &options.compiler_args {
        flag_values(value).map_err(|_| {
            Error::ConfigInvalid(format!("compiler argument `{key}` has an object value"))
        })?;
    }
    for pattern in &options.src {
        glob::Pattern::new(pattern)
            .map_err(|e| Error::ConfigInvalid(format!("invalid src glob {pattern:?}: {e}")))?;
    }
    Ok(())
}

/// Build the invocation for `module_path`.
///
/// `replaces` names a file that `module_path` stands in for; it is dropped
/// from the `src` matches so the compiler never sees both.
pub fn build_command(
    options: &CompileOptions,
    module_path: &Path,
    replaces: Option<&Path>,
) -> Result<CommandLine, CompilerError> {
    let cwd = options
        .cwd
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut args = Vec::new();
    let program = match options.mode {
        ExecutionMode::Direct => options.compiler.clone(),
        ExecutionMode::Wrapped => {
            let wrapper = options.wrapper.clone().ok_or_else(|| {
                CompilerError::invalid_options("wrapped mode without a wrapper program")
            })?;
            args.extend(options.wrapper_args.iter().cloned());
            args.push(options.compiler.clone());
            wrapper
        }
    };

    args.push("--output".to_string());
    args.push(
        options
            .output
            .clone()
            .unwrap_or_else(|| super::DEFAULT_OUTPUT_DIR.to_string()),
    );

    // BTreeMap iteration is key-sorted.
    for (key, value) in &options.compiler_args {
        let flag = format!("--{}", kebab_case(key));
        let values = flag_values(value).map_err(|()| {
            CompilerError::invalid_options(format!("compiler argument `{key}` has an object value"))
        })?;
        for v in values {
            match v {
                Some(v) => args.push(format!("{flag}={v}")),
                None => args.push(flag.clone()),
            }
        }
    }

    if options.emit_source_maps && !args.iter().any(|a| a == SOURCE_MAPS_FLAG) {
        args.push(SOURCE_MAPS_FLAG.to_string());
    }

    args.extend(options.extra_flags.iter().cloned());

    let mut inputs = expand_src(&options.src, &cwd)?;
    if let Some(original) = replaces {
        inputs.retain(|p| p != original);
    }
    let module_path = module_path.to_path_buf();
    if !inputs.contains(&module_path) {
        inputs.push(module_path);
    }
    args.extend(inputs.iter().map(|p| p.to_string_lossy().into_owned()));

    Ok(CommandLine { program, args, cwd })
}

/// `sourceMaps` -> `source-maps`.
#[must_use]
pub fn kebab_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, ch) in key.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Values a flag is emitted with: `None` is a bare flag. Empty for
/// `false`/`null`. Objects are rejected.
fn flag_values(value: &Value) -> Result<Vec<Option<String>>, ()> {
    match value {
        Value::Null | Value::Bool(false) => Ok(Vec::new()),
        Value::Bool(true) => Ok(vec![None]),
        Value::String(s) => Ok(vec![Some(s.clone())]),
        Value::Number(n) => Ok(vec![Some(n.to_string())]),
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(flag_values(item)?);
            }
            Ok(out)
        }
        Value::Object(_) => Err(()),
    }
}

/// Expand `src` globs relative to `cwd` into a sorted, de-duplicated list of
/// canonical paths.
pub fn expand_src(patterns: &[String], cwd: &Path) -> Result<Vec<PathBuf>, CompilerError> {
    let mut files = Vec::new();
    for pattern in patterns {
        let full = if Path::new(pattern).is_absolute() {
            pattern.clone()
        } else {
            cwd.join(pattern).to_string_lossy().into_owned()
        };
        let entries = glob::glob(&full).map_err(|e| {
            CompilerError::invalid_options(format!("invalid src glob {pattern:?}: {e}"))
        })?;
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => {
                    files.push(dunce::canonicalize(&path).unwrap_or(path));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "skipping unreadable src match"),
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}
