#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]

//! Development server for ferrypack.
//!
//! The server provides:
//! - The most recent successful bundle over HTTP, swapped atomically after
//!   every good rebuild
//! - File watching with a debounce window; a burst of changes is one rebuild
//! - Static files from the content base
//!
//! A failed rebuild is logged and the previous bundle keeps being served.
//! Changes that land while a rebuild runs invalidate immediately, aborting
//! the affected in-flight transforms; the running pass picks them up and a
//! follow-up pass covers anything it missed.
//! The companion compiler server lives here too (see [`companion`]).

pub mod companion;
pub mod http;
pub mod watch;

pub use watch::{FileWatcher, IgnoreList, WatchError, WatchEvent, WatchEventKind};

use ferrypack_core::compiler::CompilerSettings;
use ferrypack_core::config::Stats;
use ferrypack_core::loader::is_compiler_loader;
use ferrypack_core::{BuildOutput, BuildSession, Bundle, Error, ProjectConfig};
use serde::Serialize;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Dev server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// Build state reported at `/__ferrypack/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildStatus {
    /// Whether the last rebuild succeeded.
    pub ok: bool,
    /// Number of bundles published so far.
    pub generation: u64,
    /// Modules in the published bundle.
    pub modules: usize,
    /// Message of the last failed rebuild; cleared by the next good one.
    pub last_error: Option<String>,
}

/// What the HTTP handlers read.
#[derive(Debug)]
pub struct ServerState {
    filename: String,
    map_filename: String,
    content_base: PathBuf,
    bundle: RwLock<Option<Arc<Bundle>>>,
    status: RwLock<BuildStatus>,
}

impl ServerState {
    pub fn new(filename: impl Into<String>, content_base: PathBuf) -> Self {
        let filename = filename.into();
        Self {
            map_filename: format!("{filename}.map"),
            filename,
            content_base,
            bundle: RwLock::new(None),
            status: RwLock::new(BuildStatus::default()),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn map_filename(&self) -> &str {
        &self.map_filename
    }

    pub fn content_base(&self) -> &Path {
        &self.content_base
    }

    /// The bundle currently served.
    pub fn bundle(&self) -> Option<Arc<Bundle>> {
        self.bundle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> BuildStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the served bundle. Returns the new generation.
    pub fn publish(&self, bundle: Bundle, modules: usize) -> u64 {
        let bundle = Arc::new(bundle);
        *self.bundle.write().unwrap_or_else(PoisonError::into_inner) = Some(bundle);
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.ok = true;
        status.generation += 1;
        status.modules = modules;
        status.last_error = None;
        status.generation
    }

    /// Record a failed rebuild; the served bundle is left alone.
    pub fn record_failure(&self, error: &Error) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.ok = false;
        status.last_error = Some(error.to_string());
    }
}

/// The dev server: a build session plus the state it publishes.
#[derive(Clone)]
pub struct DevServer {
    session: Arc<BuildSession>,
    state: Arc<ServerState>,
    stats: Stats,
    debounce: Duration,
    generated: IgnoreList,
}

impl DevServer {
    pub fn new(session: BuildSession) -> Self {
        let config = session.config();
        let state = ServerState::new(config.output.filename.clone(), config.content_base());
        let stats = config.dev_server.stats;
        let debounce = Duration::from_millis(config.dev_server.debounce_ms);
        let generated = generated_dirs(config);
        Self {
            session: Arc::new(session),
            state: Arc::new(state),
            stats,
            debounce,
            generated,
        }
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub fn session(&self) -> &BuildSession {
        &self.session
    }

    /// Run a build pass and publish the bundle if it succeeds.
    pub async fn rebuild(&self) -> Result<u64, Error> {
        match self.session.build().await {
            Ok(output) => {
                let modules = output.bundle.modules.len();
                self.report_success(&output);
                Ok(self.state.publish(output.bundle, modules))
            }
            Err(e) => {
                self.report_failure(&e);
                self.state.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Rebuild after each debounced batch of changes until `rx` closes.
    ///
    /// Batches keep being read while a rebuild runs. Each one invalidates at
    /// once; if it affected anything, one more pass follows the running one.
    pub async fn watch_loop(&self, rx: mpsc::UnboundedReceiver<WatchEvent>) {
        let (batch_tx, mut batches) = mpsc::unbounded_channel();
        let debounce = self.debounce;
        let batching = tokio::spawn(async move {
            let mut rx = rx;
            while let Some(batch) = watch::next_batch(&mut rx, debounce).await {
                if batch_tx.send(batch).is_err() {
                    break;
                }
            }
        });

        let mut running: Option<JoinHandle<()>> = None;
        let mut again = false;
        loop {
            tokio::select! {
                batch = batches.recv() => {
                    let Some(batch) = batch else { break };
                    if !self.wants_rebuild(&batch) {
                        continue;
                    }
                    if running.is_some() {
                        again = true;
                    } else {
                        running = Some(self.spawn_rebuild());
                    }
                }
                () = finished(&mut running), if running.is_some() => {
                    running = None;
                    if std::mem::take(&mut again) {
                        debug!("changes landed mid-rebuild, rebuilding again");
                        running = Some(self.spawn_rebuild());
                    }
                }
            }
        }

        while running.is_some() {
            finished(&mut running).await;
            running = std::mem::take(&mut again).then(|| self.spawn_rebuild());
        }
        batching.abort();
        debug!("watch loop stopped");
    }

    /// Invalidate `batch` and decide whether it warrants a pass.
    ///
    /// Paths under generated directories refresh the modules read from there
    /// but never retry a failed build by themselves, since the compiler
    /// rewrites them while building.
    fn wants_rebuild(&self, batch: &[PathBuf]) -> bool {
        let affected = self.session.invalidate(batch);
        if !affected.is_empty() {
            debug!(
                changed = batch.len(),
                affected = affected.len(),
                "rebuilding"
            );
            return true;
        }
        let sources = batch.iter().filter(|p| !self.generated.matches(p)).count();
        if sources > 0 && !self.state.status().ok {
            debug!(changed = sources, "retrying failed build");
            return true;
        }
        debug!(changed = batch.len(), "no module affected");
        false
    }

    fn spawn_rebuild(&self) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            // Failures are reported and recorded by `rebuild`.
            let _ = server.rebuild().await;
        })
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let config = self.session.config();
        let (tx, rx) = mpsc::unbounded_channel();
        let ignore = IgnoreList::new([config.output_file(), config.map_file()]);
        let watcher = FileWatcher::start(&[config.root.clone()], ignore, tx)?;

        if self.rebuild().await.is_err() {
            warn!("initial build failed, waiting for changes");
        }

        let addr = listener.local_addr()?;
        info!(
            url = %format!("http://{addr}/{}", self.state.filename()),
            content_base = %self.state.content_base().display(),
            "dev server listening"
        );

        let router = http::router(self.state.clone());
        let server = Arc::new(self);
        let rebuilds = tokio::spawn({
            let server = server.clone();
            async move { server.watch_loop(rx).await }
        });

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;
        rebuilds.abort();
        drop(watcher);
        info!("dev server stopped");
        served.map_err(ServerError::from)
    }

    fn report_success(&self, output: &BuildOutput) {
        let report = &output.report;
        match self.stats {
            Stats::ErrorsOnly => debug!(modules = report.order.len(), "bundle ready"),
            Stats::Minimal => info!(duration_ms = report.duration_ms, "bundle ready"),
            Stats::Normal | Stats::Verbose => info!(
                modules = report.order.len(),
                transformed = report.transformed.len(),
                duration_ms = report.duration_ms,
                "bundle ready"
            ),
        }
        if self.stats >= Stats::Normal {
            for w in &report.warnings {
                warn!(code = w.code.as_deref().unwrap_or(""), "{}", w.message);
            }
        }
        if self.stats == Stats::Verbose {
            for path in &report.transformed {
                info!(path = %path.display(), "transformed");
            }
        }
    }

    fn report_failure(&self, e: &Error) {
        error!(code = e.code(), "rebuild failed: {e}");
        for d in e.diagnostics() {
            match (&d.file, d.line) {
                (Some(file), Some(line)) => {
                    error!(file = %file.display(), line, "{}", d.message);
                }
                _ => error!("{}", d.message),
            }
        }
    }
}

/// Wait for the running rebuild, if any, to end.
async fn finished(running: &mut Option<JoinHandle<()>>) {
    match running {
        Some(handle) => {
            if let Err(e) = handle.await {
                error!(error = %e, "rebuild task failed");
            }
        }
        None => std::future::pending().await,
    }
}

/// Directories tools write into during a build: every compiler rule's
/// output directory and the package directories under the root.
pub fn generated_dirs(config: &ProjectConfig) -> IgnoreList {
    let mut dirs: Vec<PathBuf> = config
        .resolve
        .modules_directories
        .iter()
        .map(|dir| config.root.join(dir))
        .collect();
    for rule in config.compile_rules().unwrap_or_default() {
        for spec in rule.loaders.iter().filter(|s| is_compiler_loader(&s.loader)) {
            let Ok(settings) = CompilerSettings::from_options(&spec.options, &config.root) else {
                continue;
            };
            let options = settings.options;
            if let (Some(cwd), Some(output)) = (options.cwd, options.output) {
                dirs.push(config.root.join(cwd).join(output));
            }
        }
    }
    IgnoreList::new(dirs)
}
