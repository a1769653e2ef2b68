//! Build passes over the module graph.
//!
//! A pass resolves the entry, transforms every reachable module that is not
//! `Transformed` and returns the modules in emission order. Ready modules
//! transform concurrently on a `JoinSet`, bounded by a semaphore; new
//! dependencies are scheduled as soon as the module that found them
//! completes.
//!
//! [`BuildSession::invalidate`] may be called while a pass runs. Affected
//! in-flight transforms are aborted and their generation bumped, so the pass
//! picks them up again and nothing stale reaches the graph.

use crate::compiler::companion::{CompanionInvoker, CompanionPolicy, ProcessConnector};
use crate::compiler::{CompilerInvoker, CompilerSettings, DirectInvoker};
use crate::config::ProjectConfig;
use crate::emit::{relative_path, Bundle, BundleEmitter};
use crate::graph::{BuildGraph, ModuleOutput, ResolvedDependency};
use crate::imports::scan_requires;
use crate::loader::{is_compiler_loader, run_chain, ChainOutput, LoaderRegistry};
use crate::resolver::Resolver;
use crate::rules::{select, Rule, Selection};
use crate::sourcemap::compose_relocated;
use crate::Error;
use ferrypack_proto::Diagnostic;
use ferrypack_util::fs::read_to_string_lossy;
use ferrypack_util::hash::{blake3_bytes, blake3_file};
use futures::future::{abortable, AbortHandle, Aborted};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Diagnostic code of a source map that could not be composed.
pub const SOURCE_MAP_COMPOSE_FAILURE: &str = "SOURCE_MAP_COMPOSE_FAILURE";

/// Build session options.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Fail on modules no rule applies to instead of passing them through.
    pub require_transform: bool,
}

/// What a pass did.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    /// Reachable modules, dependencies first, entry last.
    pub order: Vec<PathBuf>,
    /// Modules transformed in this pass.
    pub transformed: Vec<PathBuf>,
    /// Modules dropped because nothing reaches them any more.
    pub pruned: Vec<PathBuf>,
    pub warnings: Vec<Diagnostic>,
    pub duration_ms: u64,
}

/// A finished build: the rendered bundle plus the pass that produced it.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub bundle: Bundle,
    pub report: PassReport,
}

struct Shared {
    config: ProjectConfig,
    rules: Vec<Rule>,
    registry: LoaderRegistry,
    resolver: Resolver,
    graph: Mutex<BuildGraph>,
    permits: Semaphore,
    options: BuildOptions,
    in_flight: Mutex<HashMap<PathBuf, (u64, AbortHandle)>>,
}

type TaskResult = (PathBuf, u64, Result<Result<ModuleOutput, Error>, Aborted>);

/// Incremental build state for one project.
pub struct BuildSession {
    shared: Arc<Shared>,
    emitter: BundleEmitter,
    pass: tokio::sync::Mutex<()>,
}

impl BuildSession {
    /// Session with the built-in loaders. A companion compiler is started
    /// when a compiler rule asks for one; this needs a tokio runtime.
    pub fn new(config: ProjectConfig, options: BuildOptions) -> Result<Self, Error> {
        let direct: Arc<dyn CompilerInvoker> = Arc::new(DirectInvoker::new());
        let companion = if wants_companion(&config)? {
            let connector = ProcessConnector::current_exe()?;
            let invoker: Arc<dyn CompilerInvoker> = Arc::new(CompanionInvoker::spawn(
                connector,
                CompanionPolicy::default(),
                direct.clone(),
            ));
            debug!("companion compiler enabled");
            Some(invoker)
        } else {
            None
        };
        Self::with_registry(config, LoaderRegistry::builtin(direct, companion), options)
    }

    /// Session with a caller-provided loader registry.
    pub fn with_registry(
        config: ProjectConfig,
        registry: LoaderRegistry,
        options: BuildOptions,
    ) -> Result<Self, Error> {
        let rules = config.compile_rules()?;
        let resolver = Resolver::new(&config.resolve);
        let emitter = BundleEmitter::from_config(&config);
        let permits = Semaphore::new(config.effective_concurrency());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                rules,
                registry,
                resolver,
                graph: Mutex::new(BuildGraph::new()),
                permits,
                options,
                in_flight: Mutex::new(HashMap::new()),
            }),
            emitter,
            pass: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ProjectConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn emitter(&self) -> &BundleEmitter {
        &self.emitter
    }

    /// Run a pass and render the bundle without writing it.
    pub async fn build(&self) -> Result<BuildOutput, Error> {
        let report = self.run_pass().await?;
        let modules = {
            let graph = self.shared.graph();
            report
                .order
                .iter()
                .map(|path| {
                    graph
                        .get(path)
                        .and_then(|m| m.output.clone())
                        .map(|output| (path.clone(), output))
                        .ok_or(Error::Cancelled)
                })
                .collect::<Result<Vec<_>, Error>>()?
        };
        let bundle = self.emitter.render(&modules)?;
        Ok(BuildOutput { bundle, report })
    }

    /// Run a pass, then write the bundle and its map.
    pub async fn build_and_write(&self) -> Result<BuildOutput, Error> {
        let output = self.build().await?;
        self.emitter.write(&output.bundle)?;
        info!(
            path = %output.bundle.output_path.display(),
            modules = output.bundle.modules.len(),
            bytes = output.bundle.content.len(),
            "bundle written"
        );
        Ok(output)
    }

    /// Transform everything reachable that is not up to date.
    pub async fn run_pass(&self) -> Result<PassReport, Error> {
        let _pass = self.pass.lock().await;
        let shared = &self.shared;
        let started = Instant::now();

        let entry = shared
            .resolver
            .resolve(&shared.config.entry, &shared.config.root)?;
        {
            let mut graph = shared.graph();
            if graph.entry() != Some(entry.as_path()) {
                graph.set_entry(entry.clone());
            }
        }

        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut report = PassReport::default();

        loop {
            self.schedule(&mut tasks);
            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (path, generation, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    self.cancel_all(&mut tasks).await;
                    return Err(Error::other(format!("transform task failed: {e}")));
                }
            };
            shared.finish_in_flight(&path, generation);

            match result {
                Ok(Ok(output)) => {
                    let warnings = output.warnings.clone();
                    if shared.graph().complete(&path, generation, output) {
                        report.warnings.extend(warnings);
                        report.transformed.push(path);
                    } else {
                        debug!(path = %path.display(), "discarding stale transform");
                    }
                }
                Ok(Err(e)) => {
                    let current = shared.graph().get(&path).map(|m| m.generation);
                    if current != Some(generation) || e.is_cancelled() {
                        shared.graph().abandon(&path, generation);
                        continue;
                    }
                    shared.graph().abandon(&path, generation);
                    self.cancel_all(&mut tasks).await;
                    return Err(e);
                }
                // Aborted by an invalidation; rescheduled by the next `schedule`.
                Err(Aborted) => shared.graph().abandon(&path, generation),
            }
        }

        let mut graph = shared.graph();
        report.pruned = graph.prune();
        for path in &report.pruned {
            debug!(path = %path.display(), "pruned unreachable module");
        }
        report.order = graph.order();
        drop(graph);

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            modules = report.order.len(),
            transformed = report.transformed.len(),
            duration_ms = report.duration_ms,
            "build pass complete"
        );
        Ok(report)
    }

    /// Spawn a transform for every pending module not already running.
    fn schedule(&self, tasks: &mut JoinSet<TaskResult>) {
        let shared = &self.shared;
        let mut graph = shared.graph();
        let mut in_flight = shared.in_flight();
        for path in graph.pending() {
            if in_flight.contains_key(&path) {
                continue;
            }
            let generation = graph.begin(&path);
            let (task, handle) = abortable(transform(shared.clone(), path.clone()));
            in_flight.insert(path.clone(), (generation, handle));
            tasks.spawn(async move { (path, generation, task.await) });
        }
    }

    async fn cancel_all(&self, tasks: &mut JoinSet<TaskResult>) {
        tasks.shutdown().await;
        let drained: Vec<(PathBuf, u64)> = self
            .shared
            .in_flight()
            .drain()
            .map(|(path, (generation, _))| (path, generation))
            .collect();
        let mut graph = self.shared.graph();
        for (path, generation) in drained {
            graph.abandon(&path, generation);
        }
    }

    /// Mark changed files and their dependents stale.
    ///
    /// Files whose content hash is unchanged are skipped. Returns the modules
    /// that will be transformed again.
    pub fn invalidate(&self, changed: &[PathBuf]) -> Vec<PathBuf> {
        let shared = &self.shared;
        shared.resolver.clear_cache();

        let mut graph = shared.graph();
        let mut affected = Vec::new();
        for path in changed {
            let key = dunce::canonicalize(path).unwrap_or_else(|_| path.clone());
            let Some(module) = graph.get(&key) else {
                continue;
            };
            if let Some(output) = &module.output {
                if blake3_file(&key).is_ok_and(|hash| hash == output.content_hash) {
                    debug!(path = %key.display(), "content unchanged");
                    continue;
                }
            }
            affected.extend(graph.invalidate(&key));
        }
        drop(graph);

        affected.sort();
        affected.dedup();
        let mut in_flight = shared.in_flight();
        for path in &affected {
            if let Some((_, handle)) = in_flight.remove(path) {
                debug!(path = %path.display(), "aborting in-flight transform");
                handle.abort();
            }
        }
        affected
    }

    /// Paths of every module in the graph.
    #[must_use]
    pub fn module_paths(&self) -> Vec<PathBuf> {
        self.shared.graph().order()
    }
}

impl Shared {
    fn graph(&self) -> MutexGuard<'_, BuildGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<PathBuf, (u64, AbortHandle)>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_in_flight(&self, path: &Path, generation: u64) {
        let mut in_flight = self.in_flight();
        if in_flight.get(path).is_some_and(|(g, _)| *g == generation) {
            in_flight.remove(path);
        }
    }
}

/// Whether any compiler rule routes through the companion.
fn wants_companion(config: &ProjectConfig) -> Result<bool, Error> {
    for rule in config.compile_rules()? {
        for spec in rule.loaders.iter().filter(|s| is_compiler_loader(&s.loader)) {
            if CompilerSettings::from_options(&spec.options, &config.root)?.companion {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Read, transform and scan one module.
async fn transform(shared: Arc<Shared>, path: PathBuf) -> Result<ModuleOutput, Error> {
    let _permit = shared.permits.acquire().await.map_err(|_| Error::Cancelled)?;
    let started = Instant::now();

    let raw = read_to_string_lossy(&path).map_err(|source| Error::Read {
        path: path.clone(),
        source,
    })?;
    let content_hash = blake3_bytes(raw.as_bytes());
    let raw: Arc<str> = Arc::from(raw);
    let root = &shared.config.root;

    let chain = match select(&shared.rules, &path) {
        Selection::Matched(index, rule) => {
            debug!(path = %path.display(), rule = index, "rule selected");
            run_chain(&shared.registry, &rule.loaders, &path, root, raw.clone()).await?
        }
        Selection::Passthrough if shared.options.require_transform => {
            return Err(Error::NoLoaderMatched { path });
        }
        Selection::Passthrough => ChainOutput {
            code: raw.to_string(),
            ..ChainOutput::default()
        },
    };

    let output_dir = root.join(&shared.config.output.path);
    let source_name = relative_path(&path, &output_dir);
    let stage_maps: Vec<Option<&str>> = chain.stage_maps.iter().map(Option::as_deref).collect();
    let composed = compose_relocated(
        &stage_maps,
        &source_name,
        &raw,
        &chain.code,
        |stage, source| {
            let written = chain.stage_files.get(stage).and_then(Option::as_deref);
            rebase_source(source, written.unwrap_or(&path), &output_dir)
        },
    );

    let mut warnings = chain.warnings;
    for w in &composed.warnings {
        warn!(path = %path.display(), stage = w.stage, "{w}");
        warnings.push(
            Diagnostic::warning(w.to_string())
                .with_code(SOURCE_MAP_COMPOSE_FAILURE)
                .with_location(&path, 0, 0),
        );
    }

    // Compiled output requires its siblings relative to where it was written.
    let importer = chain.emitted_path.as_deref().unwrap_or(&path);
    let mut dependencies = Vec::new();
    for dep in scan_requires(&chain.code) {
        let resolved = shared.resolver.resolve_import(&dep.specifier, importer)?;
        dependencies.push(ResolvedDependency {
            specifier: dep.specifier,
            path: resolved,
        });
    }

    debug!(
        path = %path.display(),
        dependencies = dependencies.len(),
        duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "module transformed"
    );

    Ok(ModuleOutput {
        raw_content: raw,
        content_hash,
        transformed_content: chain.code,
        source_map: composed.map,
        dependencies,
        warnings,
    })
}

/// A map source relative to the file its map belongs to, rewritten relative
/// to the bundle's directory. URLs are left alone.
fn rebase_source(source: &str, map_owner: &Path, output_dir: &Path) -> String {
    if source.contains("://") {
        return source.to_string();
    }
    let dir = map_owner.parent().unwrap_or(map_owner);
    relative_path(&dir.join(source), output_dir)
}
