//! `ferrypack build` command implementation.

use super::{describe_error, ProjectArgs};
use ferrypack_core::{BuildOptions, BuildOutput, BuildSession, Config, Error};
use ferrypack_proto::Diagnostic;
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::path::Path;

/// Schema version of the `--json` build result.
pub const BUILD_RESULT_SCHEMA_VERSION: u32 = 1;

/// Build command action.
#[derive(Debug, Clone)]
pub struct BuildAction {
    pub project: ProjectArgs,
    pub strict_loaders: bool,
}

/// Build result for JSON output.
#[derive(Serialize)]
struct BuildResultJson {
    schema_version: u32,
    ok: bool,
    output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_map: Option<String>,
    modules: Vec<String>,
    transformed: usize,
    duration_ms: u64,
    warnings: Vec<Diagnostic>,
}

#[derive(Serialize)]
struct BuildErrorJson {
    code: String,
    message: String,
    diagnostics: Vec<Diagnostic>,
}

/// Build error result for JSON output.
#[derive(Serialize)]
struct BuildErrorResult {
    schema_version: u32,
    ok: bool,
    error: BuildErrorJson,
}

pub fn run(config: &Config, action: BuildAction) -> Result<()> {
    let project = action.project.load()?;
    let root = project.root.clone();
    let options = BuildOptions {
        require_transform: action.strict_loaders,
    };

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    let result = runtime.block_on(async move {
        let session = BuildSession::new(project, options)?;
        session.build_and_write().await
    });

    match result {
        Ok(output) => {
            if config.json_logs {
                let json = success_json(&output, &root);
                println!("{}", serde_json::to_string(&json).into_diagnostic()?);
            } else {
                print_summary(&output, &root);
            }
            Ok(())
        }
        Err(e) => {
            if config.json_logs {
                let json = error_json(&e);
                println!("{}", serde_json::to_string(&json).into_diagnostic()?);
            } else {
                eprintln!("{}", describe_error(&e));
            }
            std::process::exit(1);
        }
    }
}

fn success_json(output: &BuildOutput, root: &Path) -> BuildResultJson {
    BuildResultJson {
        schema_version: BUILD_RESULT_SCHEMA_VERSION,
        ok: true,
        output: display_relative(&output.bundle.output_path, root),
        source_map: output
            .bundle
            .source_map_path
            .as_deref()
            .map(|p| display_relative(p, root)),
        modules: output
            .bundle
            .modules
            .iter()
            .map(|p| display_relative(p, root))
            .collect(),
        transformed: output.report.transformed.len(),
        duration_ms: output.report.duration_ms,
        warnings: output.report.warnings.clone(),
    }
}

fn error_json(e: &Error) -> BuildErrorResult {
    BuildErrorResult {
        schema_version: BUILD_RESULT_SCHEMA_VERSION,
        ok: false,
        error: BuildErrorJson {
            code: e.code().to_string(),
            message: e.to_string(),
            diagnostics: e.diagnostics().to_vec(),
        },
    }
}

fn print_summary(output: &BuildOutput, root: &Path) {
    for w in &output.report.warnings {
        eprintln!("warning: {}", w.message);
    }
    println!(
        "Built {} ({} modules, {} transformed) in {}ms",
        display_relative(&output.bundle.output_path, root),
        output.bundle.modules.len(),
        output.report.transformed.len(),
        output.report.duration_ms
    );
    if let Some(map) = &output.bundle.source_map_path {
        println!("  source map: {}", display_relative(map, root));
    }
}

fn display_relative(path: &Path, root: &Path) -> String {
    ferrypack_core::emit::relative_path(path, root)
}
