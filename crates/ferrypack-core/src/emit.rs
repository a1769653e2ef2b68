//! Bundle output emission.
//!
//! Modules are concatenated dependencies-first, each wrapped in a CommonJS
//! function registered with a small runtime. Per-module maps are shifted by
//! the line their code starts on and merged into one bundle map.

use crate::config::ProjectConfig;
use crate::graph::ModuleOutput;
use crate::sourcemap::SourceMapBuilder;
use crate::Error;
use ferrypack_util::fs::atomic_write_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

const RUNTIME_HEAD: &str = "\
(function (modules, entry) {
  var cache = {};
  function load(id) {
    if (cache[id]) return cache[id].exports;
    var module = cache[id] = { exports: {} };
    var deps = modules[id][1];
    modules[id][0].call(module.exports, module, module.exports, function (spec) {
      if (!Object.prototype.hasOwnProperty.call(deps, spec)) {
        throw new Error(\"Cannot find module '\" + spec + \"'\");
      }
      return load(deps[spec]);
    });
    return module.exports;
  }
  load(entry);
})([
";

/// The emitted artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub output_path: PathBuf,
    pub content: String,
    pub source_map_path: Option<PathBuf>,
    /// Bundle map as V3 JSON.
    pub source_map: Option<String>,
    /// Module paths in emission order.
    pub modules: Vec<PathBuf>,
}

/// Renders and writes bundles.
#[derive(Debug, Clone)]
pub struct BundleEmitter {
    root: PathBuf,
    output_path: PathBuf,
    map_path: PathBuf,
    source_maps: bool,
    pathinfo: bool,
}

impl BundleEmitter {
    #[must_use]
    pub fn from_config(config: &ProjectConfig) -> Self {
        Self {
            root: config.root.clone(),
            output_path: config.output_file(),
            map_path: config.map_file(),
            source_maps: config.source_maps_enabled(),
            pathinfo: config.output.pathinfo,
        }
    }

    /// Render `modules`, given dependencies-first with the entry last.
    pub fn render(&self, modules: &[(PathBuf, Arc<ModuleOutput>)]) -> Result<Bundle, Error> {
        let ids: HashMap<&Path, usize> = modules
            .iter()
            .enumerate()
            .map(|(id, (path, _))| (path.as_path(), id))
            .collect();

        let mut content = String::from(RUNTIME_HEAD);
        let mut line = line_count(&content);
        let mut maps = SourceMapBuilder::new();

        for (id, (path, output)) in modules.iter().enumerate() {
            let mut deps = Map::new();
            for dep in &output.dependencies {
                let target = ids.get(dep.path.as_path()).ok_or_else(|| {
                    Error::other(format!(
                        "dependency {} of {} was not built",
                        dep.path.display(),
                        path.display()
                    ))
                })?;
                deps.insert(dep.specifier.clone(), Value::from(*target));
            }

            if self.pathinfo {
                let shown = relative_path(path, &self.root).replace("*/", "*\\/");
                let _ = writeln!(content, "/*! {shown} */");
                line += 1;
            }
            let _ = writeln!(content, "/* {id} */ [function (module, exports, require) {{");
            line += 1;

            if self.source_maps {
                maps.add_map(&output.source_map, line);
            }
            let code = &output.transformed_content;
            content.push_str(code);
            if !code.ends_with('\n') {
                content.push('\n');
            }
            line += line_count(code);

            let separator = if id + 1 == modules.len() { "" } else { "," };
            let _ = writeln!(content, "}}, {}]{separator}", Value::Object(deps));
            line += 1;
        }

        let _ = writeln!(content, "], {});", modules.len().saturating_sub(1));

        let (source_map_path, source_map) = if self.source_maps {
            let file = file_name(&self.output_path);
            let _ = writeln!(content, "//# sourceMappingURL={}", file_name(&self.map_path));
            let map = maps.finish(Some(file));
            (Some(self.map_path.clone()), Some(map.to_json()))
        } else {
            (None, None)
        };

        Ok(Bundle {
            output_path: self.output_path.clone(),
            content,
            source_map_path,
            source_map,
            modules: modules.iter().map(|(p, _)| p.clone()).collect(),
        })
    }

    /// Write the bundle and its map. Each file is replaced atomically.
    pub fn write(&self, bundle: &Bundle) -> Result<(), Error> {
        let mut files: Vec<(&Path, &[u8])> = Vec::with_capacity(2);
        if let (Some(path), Some(map)) = (&bundle.source_map_path, &bundle.source_map) {
            files.push((path.as_path(), map.as_bytes()));
        }
        files.push((bundle.output_path.as_path(), bundle.content.as_bytes()));
        atomic_write_all(&files).map_err(|source| Error::Emit {
            path: bundle.output_path.clone(),
            source,
        })
    }
}

/// Number of lines `text` advances the output by.
fn line_count(text: &str) -> u32 {
    let newlines = text.bytes().filter(|&b| b == b'\n').count();
    let partial = usize::from(!text.is_empty() && !text.ends_with('\n'));
    u32::try_from(newlines + partial).unwrap_or(u32::MAX)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `path` relative to `base`, `/`-separated. Both should be absolute.
/// `.` and `..` are resolved lexically.
#[must_use]
pub fn relative_path(path: &Path, base: &Path) -> String {
    fn normalize(p: &Path) -> Vec<Component<'_>> {
        let mut parts = Vec::new();
        for c in p.components() {
            match c {
                Component::CurDir => {}
                Component::ParentDir if matches!(parts.last(), Some(Component::Normal(_))) => {
                    parts.pop();
                }
                c => parts.push(c),
            }
        }
        parts
    }
    let path_parts = normalize(path);
    let base_parts = normalize(base);
    let common = path_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = Vec::new();
    for _ in common..base_parts.len() {
        parts.push("..".to_string());
    }
    for part in &path_parts[common..] {
        parts.push(part.as_os_str().to_string_lossy().into_owned());
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
