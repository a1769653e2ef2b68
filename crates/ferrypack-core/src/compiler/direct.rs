//! Cold-start compiler invocation: one process per request.

use super::args::{build_command, CommandLine};
use super::diagnostics;
use super::{CompileOutput, CompileRequest, CompilerError, CompilerInvoker};
use ferrypack_proto::{CompileOptions, ExecutionMode, OutputLayout};
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs the compiler as a fresh child process for every request.
#[derive(Debug, Clone, Default)]
pub struct DirectInvoker;

impl DirectInvoker {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, request: CompileRequest) -> Result<CompileOutput, CompilerError> {
        let options = &request.options;

        // A compiler stage fed by an earlier loader compiles a staged copy.
        let staging = match &request.source {
            Some(source) => Some(stage_source(&request.path, source)?),
            None => None,
        };
        let (module_path, replaces) = match &staging {
            Some((_, staged)) => (staged.as_path(), Some(request.path.as_path())),
            None => (request.path.as_path(), None),
        };

        let cmd = build_command(options, module_path, replaces)?;
        let started = Instant::now();
        let output = spawn(&cmd).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            program = %cmd.program,
            path = %request.path.display(),
            status = %output.status,
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "compiler finished"
        );

        if !output.status.success() {
            let diags = diagnostics::parse_failure(&stdout, &stderr);
            return Err(CompilerError::compilation(format!(
                "{} exited with {} compiling {}",
                cmd.program,
                output.status,
                request.path.display()
            ))
            .with_diagnostics(diags));
        }

        let warnings = match options.mode {
            ExecutionMode::Wrapped => diagnostics::parse_success(&stderr),
            ExecutionMode::Direct => Vec::new(),
        };

        // Only the module-directory layout needs the header from the source.
        let source_text = match (&request.source, options.output_layout) {
            (Some(source), _) => source.clone(),
            (None, OutputLayout::ModuleDir) => tokio::fs::read_to_string(&request.path)
                .await
                .map_err(|e| {
                    CompilerError::new(
                        "COMPILER_IO_ERROR",
                        format!("failed to read {}: {e}", request.path.display()),
                    )
                })?,
            (None, _) => String::new(),
        };

        let emitted = output_path(options, module_path, &source_text, &cmd.cwd)?;
        let (code, source_map) = match &emitted {
            None => {
                let code = String::from_utf8(output.stdout).map_err(|_| {
                    CompilerError::malformed_output(format!(
                        "{} wrote non-UTF-8 output for {}",
                        cmd.program,
                        request.path.display()
                    ))
                })?;
                (code, None)
            }
            Some(path) => read_output(path).await?,
        };

        Ok(CompileOutput {
            code,
            source_map,
            output_path: emitted,
            diagnostics: warnings,
            from_cache: false,
        })
    }
}

impl CompilerInvoker for DirectInvoker {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn invoke(&self, request: CompileRequest) -> BoxFuture<'_, Result<CompileOutput, CompilerError>> {
        Box::pin(self.run(request))
    }
}

async fn spawn(cmd: &CommandLine) -> Result<std::process::Output, CompilerError> {
    Command::new(&cmd.program)
        .args(&cmd.args)
        .current_dir(&cmd.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CompilerError::spawn(&cmd.program, &e))
}

/// Write `source` under a fresh temporary directory, keeping the file name.
fn stage_source(
    original: &Path,
    source: &str,
) -> Result<(tempfile::TempDir, PathBuf), CompilerError> {
    let io_err = |e: std::io::Error| {
        CompilerError::new("COMPILER_IO_ERROR", format!("failed to stage {}: {e}", original.display()))
    };
    let dir = tempfile::Builder::new()
        .prefix("ferrypack-stage")
        .tempdir()
        .map_err(io_err)?;
    let name = original
        .file_name()
        .map_or_else(|| "module".into(), std::ffi::OsStr::to_os_string);
    let path = dir.path().join(name);
    std::fs::write(&path, source).map_err(io_err)?;
    Ok((dir, path))
}

/// Where the compiled module is expected, or `None` when it is on stdout.
pub fn output_path(
    options: &CompileOptions,
    module_path: &Path,
    source: &str,
    cwd: &Path,
) -> Result<Option<PathBuf>, CompilerError> {
    let out_dir = cwd.join(options.output.as_deref().unwrap_or(super::DEFAULT_OUTPUT_DIR));
    match options.output_layout {
        OutputLayout::Stdout => Ok(None),
        OutputLayout::FileStem => {
            let stem = module_path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| {
                    CompilerError::malformed_output(format!(
                        "cannot derive an output name from {}",
                        module_path.display()
                    ))
                })?;
            Ok(Some(out_dir.join(format!("{stem}.js"))))
        }
        OutputLayout::ModuleDir => {
            let name = module_name(source).ok_or_else(|| {
                CompilerError::malformed_output(format!(
                    "no `module ... where` header in {}",
                    module_path.display()
                ))
            })?;
            Ok(Some(out_dir.join(name).join("index.js")))
        }
    }
}

async fn read_output(path: &Path) -> Result<(String, Option<String>), CompilerError> {
    let code = match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8(bytes).map_err(|_| {
            CompilerError::malformed_output(format!("{} is not UTF-8", path.display()))
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CompilerError::output_missing(path));
        }
        Err(e) => {
            return Err(CompilerError::new(
                "COMPILER_IO_ERROR",
                format!("failed to read {}: {e}", path.display()),
            ));
        }
    };

    let mut map_path = path.as_os_str().to_os_string();
    map_path.push(".map");
    let source_map = match tokio::fs::read_to_string(&map_path).await {
        Ok(map) => Some(map),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable source map");
            None
        }
    };
    Ok((code, source_map))
}

/// Module name from a `module Data.Foo where` / `module Data.Foo (..) where`
/// header, skipping leading comments.
#[must_use]
pub fn module_name(source: &str) -> Option<String> {
    let mut in_block = false;
    for line in source.lines() {
        let mut line = line.trim();
        if in_block {
            match line.find("-}") {
                Some(end) => {
                    in_block = false;
                    line = line[end + 2..].trim();
                }
                None => continue,
            }
        }
        if line.starts_with("{-") {
            match line.find("-}") {
                Some(end) => line = line[end + 2..].trim(),
                None => {
                    in_block = true;
                    continue;
                }
            }
        }
        if line.is_empty() || line.starts_with("--") {
            continue;
        }
        let rest = line.strip_prefix("module")?;
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        let name: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '.' || *c == '_' || *c == '\'')
            .collect();
        return (!name.is_empty()).then_some(name);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name() {
        assert_eq!(module_name("module Main where\n"), Some("Main".into()));
        assert_eq!(
            module_name("-- | Docs\n{- block\n comment -}\n\nmodule Data.Foo (bar) where"),
            Some("Data.Foo".into())
        );
        assert_eq!(module_name("import Prelude"), None);
        assert_eq!(module_name("modules"), None);
    }

    #[test]
    fn test_output_path_layouts() {
        let mut options = CompileOptions::new("purs");
        options.output = Some("out".into());
        let cwd = Path::new("/proj");
        let module = Path::new("/proj/src/Main.purs");

        assert_eq!(output_path(&options, module, "", cwd).unwrap(), None);

        options.output_layout = OutputLayout::FileStem;
        assert_eq!(
            output_path(&options, module, "", cwd).unwrap(),
            Some(PathBuf::from("/proj/out/Main.js"))
        );

        options.output_layout = OutputLayout::ModuleDir;
        assert_eq!(
            output_path(&options, module, "module App.Main where", cwd).unwrap(),
            Some(PathBuf::from("/proj/out/App.Main/index.js"))
        );
        assert!(output_path(&options, module, "x = 1", cwd).is_err());
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Script that ignores flags and handles the last argument.
        fn script(dir: &Path, name: &str, body: &str) -> String {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        fn options(compiler: String, cwd: &Path) -> CompileOptions {
            let mut options = CompileOptions::new(compiler);
            options.cwd = Some(cwd.to_path_buf());
            options
        }

        #[tokio::test]
        async fn test_stdout_layout() {
            let dir = tempfile::tempdir().unwrap();
            let compiler = script(dir.path(), "cc.sh", r#"for last; do :; done; cat "$last""#);
            let module = dir.path().join("Main.purs");
            std::fs::write(&module, "module Main where").unwrap();

            let out = DirectInvoker::new()
                .invoke(CompileRequest::new(&module, options(compiler, dir.path())))
                .await
                .unwrap();
            assert_eq!(out.code, "module Main where");
            assert!(out.source_map.is_none());
        }

        #[tokio::test]
        async fn test_staged_source_is_compiled() {
            let dir = tempfile::tempdir().unwrap();
            let compiler = script(dir.path(), "cc.sh", r#"for last; do :; done; cat "$last""#);
            let module = dir.path().join("Main.purs");
            std::fs::write(&module, "on disk").unwrap();

            let request = CompileRequest::new(&module, options(compiler, dir.path()))
                .with_source("from previous stage");
            let out = DirectInvoker::new().invoke(request).await.unwrap();
            assert_eq!(out.code, "from previous stage");
        }

        #[tokio::test]
        async fn test_file_stem_layout_reads_map() {
            let dir = tempfile::tempdir().unwrap();
            let compiler = script(
                dir.path(),
                "cc.sh",
                r#"mkdir -p output && echo 'exports.x = 1;' > output/Main.js && echo '{"version":3,"sources":[],"names":[],"mappings":""}' > output/Main.js.map"#,
            );
            let module = dir.path().join("Main.purs");
            std::fs::write(&module, "module Main where").unwrap();

            let mut opts = options(compiler, dir.path());
            opts.output_layout = OutputLayout::FileStem;
            let out = DirectInvoker::new()
                .invoke(CompileRequest::new(&module, opts))
                .await
                .unwrap();
            assert_eq!(out.code.trim(), "exports.x = 1;");
            assert_eq!(out.output_path, Some(dir.path().join("output/Main.js")));
            assert!(out.source_map.unwrap().contains("\"version\":3"));
        }

        #[tokio::test]
        async fn test_unreadable_module_is_an_io_error() {
            let dir = tempfile::tempdir().unwrap();
            // Removes the module it was asked to compile.
            let compiler = script(dir.path(), "cc.sh", r#"for last; do :; done; rm "$last""#);
            let module = dir.path().join("Main.purs");
            std::fs::write(&module, "module Main where").unwrap();

            let mut opts = options(compiler, dir.path());
            opts.output_layout = OutputLayout::ModuleDir;
            let err = DirectInvoker::new()
                .invoke(CompileRequest::new(&module, opts))
                .await
                .unwrap_err();
            assert_eq!(err.code, "COMPILER_IO_ERROR");
            assert!(err.message.contains("Main.purs"));
        }

        #[tokio::test]
        async fn test_failure_carries_diagnostics() {
            let dir = tempfile::tempdir().unwrap();
            let compiler = script(
                dir.path(),
                "cc.sh",
                "echo 'src/Main.purs:2:5: error: Unknown value foo' >&2; exit 1",
            );
            let module = dir.path().join("Main.purs");
            std::fs::write(&module, "module Main where").unwrap();

            let err = DirectInvoker::new()
                .invoke(CompileRequest::new(&module, options(compiler, dir.path())))
                .await
                .unwrap_err();
            assert_eq!(err.code, "COMPILATION_FAILED");
            assert_eq!(err.diagnostics.len(), 1);
            assert_eq!(err.diagnostics[0].line, Some(2));
        }

        #[tokio::test]
        async fn test_missing_output_and_missing_program() {
            let dir = tempfile::tempdir().unwrap();
            let compiler = script(dir.path(), "cc.sh", "exit 0");
            let module = dir.path().join("Main.purs");
            std::fs::write(&module, "module Main where").unwrap();

            let mut opts = options(compiler, dir.path());
            opts.output_layout = OutputLayout::ModuleDir;
            let err = DirectInvoker::new()
                .invoke(CompileRequest::new(&module, opts))
                .await
                .unwrap_err();
            assert_eq!(err.code, "COMPILER_OUTPUT_MISSING");

            let opts = options("/nonexistent/ferrypack-compiler".into(), dir.path());
            let err = DirectInvoker::new()
                .invoke(CompileRequest::new(&module, opts))
                .await
                .unwrap_err();
            assert_eq!(err.code, "COMPILER_SPAWN_FAILED");
        }
    }
}
