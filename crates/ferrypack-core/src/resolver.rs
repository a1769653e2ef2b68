//! Module specifier resolution.
//!
//! Resolves specifiers to canonical file paths with plain filesystem
//! lookups. The outcome depends only on the configured search directories
//! and extensions, in their configured order; directory listings are never
//! consulted.
//!
//! ## Specifier Types
//!
//! - Relative: `./Main`, `../lib/util`
//! - Absolute: `/abs/path/to/module`
//! - Bare: `purescript-prelude/src/Prelude`, looked up in the search
//!   directories

use crate::config::ResolveConfig;
use crate::Error;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Package manifests consulted for a directory's entry file, in order.
const MANIFESTS: &[&str] = &["package.json", "bower.json"];

/// Specifier resolver.
#[derive(Debug)]
pub struct Resolver {
    /// Relative names (`node_modules`) searched in every ancestor.
    relative_dirs: Vec<String>,
    /// Absolute directories searched after the ancestor walk.
    absolute_dirs: Vec<PathBuf>,
    extensions: Vec<String>,
    cache: RwLock<HashMap<(PathBuf, String), PathBuf>>,
}

impl Resolver {
    #[must_use]
    pub fn new(config: &ResolveConfig) -> Self {
        let (absolute, relative): (Vec<&String>, Vec<&String>) = config
            .modules_directories
            .iter()
            .partition(|d| Path::new(d.as_str()).is_absolute());
        Self {
            relative_dirs: relative.into_iter().cloned().collect(),
            absolute_dirs: absolute.into_iter().map(PathBuf::from).collect(),
            extensions: config.extensions.clone(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve `specifier` as written in a module located in `requesting_dir`.
    pub fn resolve(&self, specifier: &str, requesting_dir: &Path) -> Result<PathBuf, Error> {
        let key = (requesting_dir.to_path_buf(), specifier.to_string());
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(hit.clone());
        }

        let mut tried = Vec::new();
        match self.resolve_uncached(specifier, requesting_dir, &mut tried) {
            Some(found) => {
                self.cache
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, found.clone());
                Ok(found)
            }
            None => Err(Error::ModuleNotFound {
                specifier: specifier.to_string(),
                from: requesting_dir.to_path_buf(),
                tried,
            }),
        }
    }

    /// Resolve a dependency of `importer`; failures name the importer.
    pub fn resolve_import(&self, specifier: &str, importer: &Path) -> Result<PathBuf, Error> {
        let dir = importer.parent().unwrap_or(Path::new("."));
        self.resolve(specifier, dir).map_err(|e| match e {
            Error::ModuleNotFound {
                specifier, tried, ..
            } => Error::ModuleNotFound {
                specifier,
                from: importer.to_path_buf(),
                tried,
            },
            other => other,
        })
    }

    /// Forget every cached resolution.
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn resolve_uncached(
        &self,
        specifier: &str,
        requesting_dir: &Path,
        tried: &mut Vec<PathBuf>,
    ) -> Option<PathBuf> {
        if is_path_like(specifier) {
            return self.resolve_target(&requesting_dir.join(specifier), tried);
        }

        for dir in requesting_dir.ancestors() {
            for name in &self.relative_dirs {
                let search_dir = dir.join(name);
                if !search_dir.is_dir() {
                    continue;
                }
                if let Some(found) = self.resolve_target(&search_dir.join(specifier), tried) {
                    return Some(found);
                }
            }
        }

        for search_dir in &self.absolute_dirs {
            if let Some(found) = self.resolve_target(&search_dir.join(specifier), tried) {
                return Some(found);
            }
        }
        None
    }

    /// Try `target` + each extension as a file, then `target` as a directory.
    fn resolve_target(&self, target: &Path, tried: &mut Vec<PathBuf>) -> Option<PathBuf> {
        if let Some(found) = self.resolve_file(target, tried) {
            return Some(found);
        }
        if target.is_dir() {
            return self.resolve_directory(target, tried);
        }
        None
    }

    fn resolve_file(&self, target: &Path, tried: &mut Vec<PathBuf>) -> Option<PathBuf> {
        for ext in &self.extensions {
            let mut candidate = target.as_os_str().to_os_string();
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);
            let is_file = candidate.is_file();
            tried.push(candidate);
            if is_file {
                let candidate = tried.last()?;
                return Some(dunce::canonicalize(candidate).unwrap_or_else(|_| candidate.clone()));
            }
        }
        None
    }

    fn resolve_directory(&self, dir: &Path, tried: &mut Vec<PathBuf>) -> Option<PathBuf> {
        for manifest in MANIFESTS {
            let Some(main) = manifest_main(&dir.join(manifest)) else {
                continue;
            };
            let target = dir.join(main);
            if let Some(found) = self.resolve_file(&target, tried) {
                return Some(found);
            }
            if target.is_dir() {
                if let Some(found) = self.resolve_file(&target.join("index"), tried) {
                    return Some(found);
                }
            }
        }
        self.resolve_file(&dir.join("index"), tried)
    }
}

fn is_path_like(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
        || Path::new(specifier).is_absolute()
}

/// `main` of a manifest. Bower allows a list; its first entry is used.
fn manifest_main(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&text).ok()?;
    match value.get("main")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(Value::as_str).map(str::to_string),
        _ => None,
    }
}
