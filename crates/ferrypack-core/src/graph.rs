//! Module dependency graph with incremental rebuild state.
//!
//! Every module moves through
//!
//! ```text
//! Unresolved -> Resolving -> Transformed -> Stale -> Resolving -> ...
//! ```
//!
//! A change to a file marks that module and every module that transitively
//! depends on it `Stale`; everything else keeps its transform. Each
//! invalidation bumps the module's generation so a transform started before
//! the change cannot overwrite the state that follows it.

use crate::sourcemap::SourceMap;
use ferrypack_proto::Diagnostic;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Build state of one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Known by path, never transformed.
    Unresolved,
    /// A transform is in flight.
    Resolving,
    /// Output is current.
    Transformed,
    /// Output is out of date and will be redone next pass.
    Stale,
}

/// A dependency as written and as resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub specifier: String,
    pub path: PathBuf,
}

/// Result of running a module through its loader chain.
#[derive(Debug, Clone)]
pub struct ModuleOutput {
    /// Text of the module on disk.
    pub raw_content: Arc<str>,
    /// BLAKE3 of `raw_content`.
    pub content_hash: String,
    pub transformed_content: String,
    /// Composed map from `transformed_content` to the original file.
    pub source_map: SourceMap,
    /// In declaration order.
    pub dependencies: Vec<ResolvedDependency>,
    pub warnings: Vec<Diagnostic>,
}

/// A module in the graph.
#[derive(Debug, Clone)]
pub struct Module {
    pub path: PathBuf,
    pub state: ModuleState,
    pub generation: u64,
    /// Last successful transform, kept while stale.
    pub output: Option<Arc<ModuleOutput>>,
}

impl Module {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: ModuleState::Unresolved,
            generation: 0,
            output: None,
        }
    }

    #[must_use]
    pub fn dependencies(&self) -> &[ResolvedDependency] {
        self.output.as_ref().map_or(&[], |o| &o.dependencies)
    }
}

/// The module dependency graph, keyed by resolved path.
#[derive(Debug, Default)]
pub struct BuildGraph {
    entry: Option<PathBuf>,
    modules: HashMap<PathBuf, Module>,
}

impl BuildGraph {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_entry(&mut self, entry: PathBuf) {
        self.ensure(&entry);
        self.entry = Some(entry);
    }

    #[must_use]
    pub fn entry(&self) -> Option<&Path> {
        self.entry.as_deref()
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&Module> {
        self.modules.get(path)
    }

    #[must_use]
    pub fn state(&self, path: &Path) -> Option<ModuleState> {
        self.modules.get(path).map(|m| m.state)
    }

    /// Number of modules in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Check if graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Insert `path` as `Unresolved` unless known.
    pub fn ensure(&mut self, path: &Path) -> &mut Module {
        self.modules
            .entry(path.to_path_buf())
            .or_insert_with(|| Module::new(path.to_path_buf()))
    }

    #[must_use]
    pub fn needs_transform(&self, path: &Path) -> bool {
        self.modules
            .get(path)
            .map_or(true, |m| m.state != ModuleState::Transformed)
    }

    /// Mark a transform as started; returns the generation it belongs to.
    pub fn begin(&mut self, path: &Path) -> u64 {
        let module = self.ensure(path);
        module.state = ModuleState::Resolving;
        module.generation
    }

    /// Store a finished transform. Returns `false`, leaving the module
    /// untouched, when it was invalidated after the transform began.
    pub fn complete(&mut self, path: &Path, generation: u64, output: ModuleOutput) -> bool {
        let module = self.ensure(path);
        if module.generation != generation {
            return false;
        }
        for dep in &output.dependencies {
            if !self.modules.contains_key(&dep.path) {
                self.modules
                    .insert(dep.path.clone(), Module::new(dep.path.clone()));
            }
        }
        if let Some(module) = self.modules.get_mut(path) {
            module.output = Some(Arc::new(output));
            module.state = ModuleState::Transformed;
        }
        true
    }

    /// A transform failed or was abandoned; retry next pass.
    pub fn abandon(&mut self, path: &Path, generation: u64) {
        if let Some(module) = self.modules.get_mut(path) {
            if module.generation == generation && module.state == ModuleState::Resolving {
                module.state = ModuleState::Stale;
            }
        }
    }

    /// Modules that depend on `path`, directly or transitively, plus `path`.
    #[must_use]
    pub fn dependents_closure(&self, path: &Path) -> HashSet<PathBuf> {
        let mut reverse: HashMap<&Path, Vec<&Path>> = HashMap::new();
        for module in self.modules.values() {
            for dep in module.dependencies() {
                reverse
                    .entry(dep.path.as_path())
                    .or_default()
                    .push(module.path.as_path());
            }
        }

        let mut closure = HashSet::new();
        let mut stack = vec![path];
        while let Some(current) = stack.pop() {
            if !closure.insert(current.to_path_buf()) {
                continue;
            }
            if let Some(parents) = reverse.get(current) {
                stack.extend(parents.iter().copied());
            }
        }
        closure
    }

    /// Mark `path` and its dependents stale and bump their generations.
    /// Returns the affected modules present in the graph, sorted.
    pub fn invalidate(&mut self, path: &Path) -> Vec<PathBuf> {
        if !self.modules.contains_key(path) {
            return Vec::new();
        }
        let mut affected: Vec<PathBuf> = self.dependents_closure(path).into_iter().collect();
        affected.sort();
        for p in &affected {
            if let Some(module) = self.modules.get_mut(p) {
                module.generation += 1;
                if module.state != ModuleState::Unresolved {
                    module.state = ModuleState::Stale;
                }
            }
        }
        affected
    }

    /// Modules reachable from the entry, in dependency-first order.
    ///
    /// Depth-first post-order: a module is listed after all of its
    /// dependencies, siblings in declaration order. A dependency cycle is cut
    /// where the walk first revisits a module.
    #[must_use]
    pub fn order(&self) -> Vec<PathBuf> {
        let Some(entry) = &self.entry else {
            return Vec::new();
        };

        let mut order = Vec::new();
        let mut visited = HashSet::new();
        // (module, index of next dependency to visit)
        let mut stack: Vec<(&Path, usize)> = vec![(entry.as_path(), 0)];
        visited.insert(entry.as_path());

        while let Some((path, next)) = stack.pop() {
            let deps = self.modules.get(path).map_or(&[][..], Module::dependencies);
            if let Some(dep) = deps.get(next) {
                stack.push((path, next + 1));
                if visited.insert(dep.path.as_path()) {
                    stack.push((dep.path.as_path(), 0));
                }
            } else {
                order.push(path.to_path_buf());
            }
        }
        order
    }

    /// Drop modules no longer reachable from the entry. Returns them, sorted.
    pub fn prune(&mut self) -> Vec<PathBuf> {
        let reachable: HashSet<PathBuf> = self.order().into_iter().collect();
        let mut removed: Vec<PathBuf> = self
            .modules
            .keys()
            .filter(|p| !reachable.contains(*p))
            .cloned()
            .collect();
        removed.sort();
        for p in &removed {
            self.modules.remove(p);
        }
        removed
    }

    /// Reachable modules that still need a transform, in walk order,
    /// without descending below them.
    #[must_use]
    pub fn pending(&self) -> Vec<PathBuf> {
        let Some(entry) = &self.entry else {
            return Vec::new();
        };
        let mut pending = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![entry.as_path()];
        while let Some(path) = stack.pop() {
            if !visited.insert(path) {
                continue;
            }
            match self.modules.get(path) {
                Some(m) if m.state == ModuleState::Transformed => {
                    stack.extend(m.dependencies().iter().rev().map(|d| d.path.as_path()));
                }
                _ => pending.push(path.to_path_buf()),
            }
        }
        pending
    }

    /// Whether every module reachable from the entry is `Transformed`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.entry.is_some() && self.pending().is_empty()
    }
}
