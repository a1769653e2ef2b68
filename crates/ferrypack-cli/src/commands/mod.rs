pub mod build;
pub mod companion;
pub mod dev;
pub mod version;

use ferrypack_core::{Error, ProjectConfig, CONFIG_FILE_NAME};
use ferrypack_proto::Diagnostic;
use miette::{IntoDiagnostic, Result, WrapErr};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Where to find the project, shared by `build` and `dev`.
#[derive(Debug, Clone)]
pub struct ProjectArgs {
    pub cwd: PathBuf,
    /// `--config`, relative to `cwd`.
    pub config: Option<PathBuf>,
    /// `--entry` override.
    pub entry: Option<String>,
}

impl ProjectArgs {
    /// Absolute path of the config file to load.
    pub fn config_path(&self) -> PathBuf {
        match &self.config {
            Some(path) => self.cwd.join(path),
            None => self.cwd.join(CONFIG_FILE_NAME),
        }
    }

    /// Load and validate the project config, applying CLI overrides.
    pub fn load(&self) -> Result<ProjectConfig> {
        let path = self.config_path();
        let path = dunce::canonicalize(&path)
            .into_diagnostic()
            .wrap_err_with(|| format!("config file not found: {}", path.display()))?;
        let mut config = ProjectConfig::load(&path).into_diagnostic()?;
        if let Some(entry) = &self.entry {
            config = config.with_entry(entry.clone());
            config.validate().into_diagnostic()?;
        }
        tracing::debug!(config = %path.display(), entry = %config.entry, "loaded project config");
        Ok(config)
    }
}

/// Human-readable rendering of a build error and its compiler diagnostics.
pub fn describe_error(error: &Error) -> String {
    let mut out = format!("error[{}]: {error}", error.code());
    for d in error.diagnostics() {
        let _ = write!(out, "\n  {}", describe_diagnostic(d));
    }
    out
}

fn describe_diagnostic(d: &Diagnostic) -> String {
    let location = match (&d.file, d.line, d.column) {
        (Some(file), Some(line), Some(col)) => format!("{}:{line}:{col}: ", file.display()),
        (Some(file), Some(line), None) => format!("{}:{line}: ", file.display()),
        (Some(file), None, _) => format!("{}: ", file.display()),
        (None, ..) => String::new(),
    };
    match &d.code {
        Some(code) => format!("{location}{}[{code}]: {}", d.severity, d.message),
        None => format!("{location}{}: {}", d.severity, d.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrypack_core::compiler::CompilerError;
    use std::fs;

    #[test]
    fn test_load_applies_entry_override() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"entry": "./src/index"}"#,
        )
        .unwrap();
        let args = ProjectArgs {
            cwd: dir.path().to_path_buf(),
            config: None,
            entry: Some("./src/other".into()),
        };
        let config = args.load().unwrap();
        assert_eq!(config.entry, "./src/other");
        assert_eq!(config.root, dunce::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_config_path_is_relative_to_cwd() {
        let args = ProjectArgs {
            cwd: PathBuf::from("/work"),
            config: Some(PathBuf::from("site/pack.json")),
            entry: None,
        };
        assert_eq!(args.config_path(), PathBuf::from("/work/site/pack.json"));
    }

    #[test]
    fn test_missing_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let args = ProjectArgs {
            cwd: dir.path().to_path_buf(),
            config: None,
            entry: None,
        };
        let err = args.load().unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn test_describe_error_lists_diagnostics() {
        let diagnostic = Diagnostic::error("Unknown value foo")
            .with_code("UnknownName")
            .with_location("src/Main.purs", 3, 7);
        let err: Error = CompilerError::compilation("purs exited with status 1")
            .with_diagnostics(vec![diagnostic])
            .into();

        let text = describe_error(&err);
        assert!(text.starts_with("error[COMPILATION_ERROR]: "));
        assert!(text.contains("src/Main.purs:3:7: error[UnknownName]: Unknown value foo"));
    }
}
