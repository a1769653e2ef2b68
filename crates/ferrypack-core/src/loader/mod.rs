//! Loader chains.
//!
//! A chain is the ordered list of [`LoaderSpec`]s of the rule selected for a
//! module. Stage `i`'s output text is stage `i + 1`'s input, verbatim. Every
//! stage may also return a source map for its own step; the maps are kept in
//! stage order for composition. A stage that writes its output to disk (the
//! compiler does) reports the file, since relative `require`s and map sources
//! in its output are relative to that file rather than to the module.

pub mod builtin;

pub use builtin::{CompilerLoader, JsonLoader, RawLoader};

use crate::compiler::{CompilerInvoker, DirectInvoker};
use crate::rules::{LoaderOptions, LoaderSpec};
use crate::Error;
use ferrypack_proto::Diagnostic;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Identifiers of the loaders every registry provides.
pub const BUILTIN_LOADERS: &[&str] = &["compiler", "purs-loader", "json", "raw"];

#[must_use]
pub fn is_builtin_loader(name: &str) -> bool {
    BUILTIN_LOADERS.contains(&name)
}

/// Whether `name` is handled by [`CompilerLoader`].
#[must_use]
pub fn is_compiler_loader(name: &str) -> bool {
    matches!(name, "compiler" | "purs-loader")
}

/// What a loader stage sees.
#[derive(Debug, Clone)]
pub struct LoaderContext {
    /// Module being transformed.
    pub path: PathBuf,
    /// Project root.
    pub root: PathBuf,
    /// The module's bytes on disk, before any stage ran.
    pub raw_content: Arc<str>,
    pub options: LoaderOptions,
    /// 0-based position of this stage in the chain.
    pub stage_index: usize,
}

/// What a loader stage produces.
#[derive(Debug, Clone, Default)]
pub struct LoaderOutput {
    pub code: String,
    /// Map from `code` back to this stage's input.
    pub source_map: Option<String>,
    /// File `code` was written to, when the stage wrote one.
    pub emitted_path: Option<PathBuf>,
    pub warnings: Vec<Diagnostic>,
}

impl LoaderOutput {
    #[must_use]
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }
}

/// A source transform.
pub trait Loader: Send + Sync {
    fn run<'a>(
        &'a self,
        ctx: &'a LoaderContext,
        input: String,
    ) -> BoxFuture<'a, Result<LoaderOutput, Error>>;
}

/// Loaders by identifier.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: HashMap<String, Arc<dyn Loader>>,
}

impl LoaderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in loaders, compiling through `direct` and,
    /// for loaders that ask for it, `companion`.
    #[must_use]
    pub fn builtin(
        direct: Arc<dyn CompilerInvoker>,
        companion: Option<Arc<dyn CompilerInvoker>>,
    ) -> Self {
        let compiler: Arc<dyn Loader> = Arc::new(CompilerLoader::new(direct, companion));
        let mut registry = Self::new();
        registry.register("compiler", compiler.clone());
        registry.register("purs-loader", compiler);
        registry.register("json", Arc::new(JsonLoader));
        registry.register("raw", Arc::new(RawLoader));
        registry
    }

    /// Built-ins with a direct compiler only.
    #[must_use]
    pub fn with_direct_compiler() -> Self {
        Self::builtin(Arc::new(DirectInvoker::new()), None)
    }

    pub fn register(&mut self, name: impl Into<String>, loader: Arc<dyn Loader>) {
        self.loaders.insert(name.into(), loader);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Loader>, Error> {
        self.loaders
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownLoader(name.to_string()))
    }
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.loaders.keys().collect();
        names.sort();
        f.debug_struct("LoaderRegistry").field("loaders", &names).finish()
    }
}

/// Result of running a whole chain.
#[derive(Debug, Clone, Default)]
pub struct ChainOutput {
    pub code: String,
    /// One entry per stage, in stage order.
    pub stage_maps: Vec<Option<String>>,
    /// Parallel to `stage_maps`: the file each stage wrote, if any.
    pub stage_files: Vec<Option<PathBuf>>,
    /// Most recent file any stage wrote. `require`s in `code` resolve from
    /// here when set.
    pub emitted_path: Option<PathBuf>,
    pub warnings: Vec<Diagnostic>,
}

/// Run `chain` over `raw_content`. The first failing stage aborts the chain.
pub async fn run_chain(
    registry: &LoaderRegistry,
    chain: &[LoaderSpec],
    path: &Path,
    root: &Path,
    raw_content: Arc<str>,
) -> Result<ChainOutput, Error> {
    let mut input = raw_content.to_string();
    let mut out = ChainOutput::default();

    for (stage_index, spec) in chain.iter().enumerate() {
        let wrap = |source: Error| Error::LoaderStageFailed {
            stage_index,
            loader: spec.loader.clone(),
            path: path.to_path_buf(),
            source: Box::new(source),
        };

        let loader = registry.get(&spec.loader).map_err(wrap)?;
        let ctx = LoaderContext {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
            raw_content: raw_content.clone(),
            options: spec.options.clone(),
            stage_index,
        };

        let started = Instant::now();
        let output = loader.run(&ctx, input).await.map_err(wrap)?;
        debug!(
            path = %path.display(),
            stage = stage_index,
            loader = %spec.loader,
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "loader stage done"
        );

        input = output.code;
        out.stage_maps.push(output.source_map);
        if output.emitted_path.is_some() {
            out.emitted_path.clone_from(&output.emitted_path);
        }
        out.stage_files.push(output.emitted_path);
        out.warnings.extend(output.warnings);
    }

    out.code = input;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Appends a marker so stage order is visible in the output.
    struct Mark(&'static str);

    impl Loader for Mark {
        fn run<'a>(
            &'a self,
            _ctx: &'a LoaderContext,
            input: String,
        ) -> BoxFuture<'a, Result<LoaderOutput, Error>> {
            Box::pin(async move { Ok(LoaderOutput::code(format!("{input}|{}", self.0))) })
        }
    }

    struct Fail;

    impl Loader for Fail {
        fn run<'a>(
            &'a self,
            _ctx: &'a LoaderContext,
            _input: String,
        ) -> BoxFuture<'a, Result<LoaderOutput, Error>> {
            Box::pin(async { Err(Error::other("boom")) })
        }
    }

    fn registry() -> LoaderRegistry {
        let mut registry = LoaderRegistry::new();
        registry.register("a", Arc::new(Mark("a")));
        registry.register("b", Arc::new(Mark("b")));
        registry.register("fail", Arc::new(Fail));
        registry
    }

    fn chain(names: &[&str]) -> Vec<LoaderSpec> {
        names.iter().map(|n| LoaderSpec::new(*n)).collect()
    }

    #[tokio::test]
    async fn test_stages_run_in_declared_order() {
        let out = run_chain(
            &registry(),
            &chain(&["a", "b", "a"]),
            Path::new("/p/x.txt"),
            Path::new("/p"),
            Arc::from("src"),
        )
        .await
        .unwrap();
        assert_eq!(out.code, "src|a|b|a");
        assert_eq!(out.stage_maps.len(), 3);
    }

    /// Pretends to have written its output next to a build directory.
    struct Emit;

    impl Loader for Emit {
        fn run<'a>(
            &'a self,
            _ctx: &'a LoaderContext,
            input: String,
        ) -> BoxFuture<'a, Result<LoaderOutput, Error>> {
            Box::pin(async move {
                Ok(LoaderOutput {
                    emitted_path: Some(PathBuf::from("/p/output/X/index.js")),
                    ..LoaderOutput::code(input)
                })
            })
        }
    }

    #[tokio::test]
    async fn test_emitted_file_outlives_later_stages() {
        let mut registry = registry();
        registry.register("emit", Arc::new(Emit));
        let out = run_chain(
            &registry,
            &chain(&["a", "emit", "b"]),
            Path::new("/p/x.txt"),
            Path::new("/p"),
            Arc::from("src"),
        )
        .await
        .unwrap();
        assert_eq!(
            out.stage_files,
            vec![None, Some(PathBuf::from("/p/output/X/index.js")), None]
        );
        assert_eq!(out.emitted_path, Some(PathBuf::from("/p/output/X/index.js")));
    }

    #[tokio::test]
    async fn test_failure_reports_stage_and_stops() {
        let err = run_chain(
            &registry(),
            &chain(&["a", "fail", "b"]),
            Path::new("/p/x.txt"),
            Path::new("/p"),
            Arc::from("src"),
        )
        .await
        .unwrap_err();
        match err {
            Error::LoaderStageFailed {
                stage_index,
                loader,
                source,
                ..
            } => {
                assert_eq!(stage_index, 1);
                assert_eq!(loader, "fail");
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_loader_is_stage_failure() {
        let err = run_chain(
            &registry(),
            &chain(&["nope"]),
            Path::new("/p/x.txt"),
            Path::new("/p"),
            Arc::from(""),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "LOADER_STAGE_FAILED");
        assert_eq!(err.root().code(), "UNKNOWN_LOADER");
    }

    #[test]
    fn test_builtin_names() {
        let registry = LoaderRegistry::with_direct_compiler();
        for name in BUILTIN_LOADERS {
            assert!(registry.get(name).is_ok(), "{name}");
        }
        assert!(is_compiler_loader("purs-loader"));
        assert!(!is_builtin_loader("babel"));
    }
}
