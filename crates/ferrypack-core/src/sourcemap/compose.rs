//! Composition of per-stage loader maps into one map back to the original.
//!
//! Stage `i` maps its output onto the output of stage `i - 1`; stage 1 maps
//! onto the original file. A stage that produced no map is an exact identity
//! step. Malformed input never fails composition.

use super::{OriginalPosition, Segment, SourceMap};
use std::collections::HashMap;

/// Non-fatal problem encountered while composing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeWarning {
    /// 1-based loader stage whose map was rejected.
    pub stage: usize,
    pub message: String,
}

impl std::fmt::Display for ComposeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "source map of stage {} ignored: {}",
            self.stage, self.message
        )
    }
}

/// Result of [`compose`].
#[derive(Debug, Clone)]
pub struct Composed {
    pub map: SourceMap,
    pub warnings: Vec<ComposeWarning>,
}

/// Compose stage maps (in stage order) into a map from the final output to
/// `original_path`.
///
/// `final_code` is the last stage's output and is only used to build an
/// identity map when no stage contributed mappings, or when a stage map is
/// malformed.
#[must_use]
pub fn compose(
    stage_maps: &[Option<&str>],
    original_path: &str,
    original_content: &str,
    final_code: &str,
) -> Composed {
    compose_relocated(stage_maps, original_path, original_content, final_code, |_, s| {
        s.to_string()
    })
}

/// [`compose`], rewriting every source of stage `i`'s map through
/// `relocate(i, source)` first. Stage sources are relative to wherever that
/// stage's map lived; `relocate` puts them in the same space as
/// `original_path`.
#[must_use]
pub fn compose_relocated(
    stage_maps: &[Option<&str>],
    original_path: &str,
    original_content: &str,
    final_code: &str,
    relocate: impl Fn(usize, &str) -> String,
) -> Composed {
    let mut warnings = Vec::new();
    let mut maps = Vec::new();

    for (i, raw) in stage_maps.iter().enumerate() {
        let Some(raw) = raw else { continue };
        match SourceMap::from_json(raw) {
            Ok(mut map) => {
                map.sources = map.sources.iter().map(|s| relocate(i, s)).collect();
                if map.is_identity() {
                    continue;
                }
                if !map.has_column_info() {
                    tracing::debug!(stage = i + 1, "stage map is line-level");
                }
                maps.push(map);
            }
            Err(e) => {
                warnings.push(ComposeWarning {
                    stage: i + 1,
                    message: e.to_string(),
                });
            }
        }
    }

    if !warnings.is_empty() {
        let mut map = SourceMap::identity(original_path, final_code);
        map.sources_content = vec![Some(original_content.to_string())];
        return Composed { map, warnings };
    }

    let Some((top, lower)) = maps.split_last() else {
        let mut map = SourceMap::identity(original_path, final_code);
        map.sources_content = vec![Some(original_content.to_string())];
        return Composed { map, warnings };
    };

    let map = trace(top, lower, original_path, original_content);
    Composed { map, warnings }
}

/// Attribution of a traced position: a source of some stage map, or the
/// module's own original file.
enum Origin<'a> {
    Stage { map: &'a SourceMap, source: u32 },
    Module,
}

fn trace(
    top: &SourceMap,
    lower: &[SourceMap],
    original_path: &str,
    original_content: &str,
) -> SourceMap {
    let mut out = Interner::default();
    let mut segments = Vec::with_capacity(top.segments().len());

    for seg in top.segments() {
        let Some(orig) = seg.original else {
            segments.push(*seg);
            continue;
        };

        let mut line = orig.line;
        let mut column = orig.column;
        let mut origin = Origin::Stage {
            map: top,
            source: orig.source,
        };
        let mut name = orig.name.and_then(|n| top.name(n));

        for map in lower.iter().rev() {
            match map.lookup(line, column).and_then(|s| s.original) {
                Some(found) => {
                    line = found.line;
                    column = found.column;
                    origin = Origin::Stage {
                        map,
                        source: found.source,
                    };
                    if let Some(n) = found.name.and_then(|n| map.name(n)) {
                        name = Some(n);
                    }
                }
                // Unmapped here: the position passes through this stage as is.
                None => origin = Origin::Module,
            }
        }

        let source = match origin {
            Origin::Stage { map, source } => {
                let path = map.source(source).unwrap_or(original_path);
                let content = map
                    .source_content(source)
                    .or_else(|| (path == original_path).then_some(original_content));
                out.source(path, content)
            }
            Origin::Module => out.source(original_path, Some(original_content)),
        };
        let name = name.map(|n| out.name(n));

        segments.push(Segment {
            gen_line: seg.gen_line,
            gen_column: seg.gen_column,
            original: Some(OriginalPosition {
                source,
                line,
                column,
                name,
            }),
        });
    }

    let mut map = SourceMap::new(out.sources, out.contents, out.names, segments);
    map.file.clone_from(&top.file);
    map
}

#[derive(Default)]
struct Interner {
    sources: Vec<String>,
    contents: Vec<Option<String>>,
    source_ids: HashMap<String, u32>,
    names: Vec<String>,
    name_ids: HashMap<String, u32>,
}

impl Interner {
    fn source(&mut self, path: &str, content: Option<&str>) -> u32 {
        if let Some(&id) = self.source_ids.get(path) {
            return id;
        }
        let id = u32::try_from(self.sources.len()).unwrap_or(u32::MAX);
        self.sources.push(path.to_string());
        self.contents.push(content.map(str::to_string));
        self.source_ids.insert(path.to_string(), id);
        id
    }

    fn name(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.name_ids.get(name) {
            return id;
        }
        let id = u32::try_from(self.names.len()).unwrap_or(u32::MAX);
        self.names.push(name.to_string());
        self.name_ids.insert(name.to_string(), id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGINAL: &str = "module Main where\nmain = log \"hi\"\n";

    /// Two segments per line with a named segment on line 1.
    fn shifted(source: &str) -> String {
        format!(
            r#"{{"version":3,"sources":["{source}"],"names":["log"],"mappings":"AAAA,EAAI;AAAA,EACAA"}}"#
        )
    }

    fn identity_json(source: &str, content: &str) -> String {
        SourceMap::identity(source, content).to_json()
    }

    #[test]
    fn test_compose_identities_is_identity() {
        let code = "a\nb\nc";
        let id = identity_json("Main.purs", code);
        let result = compose(&[Some(id.as_str()), Some(id.as_str()), None], "Main.purs", ORIGINAL, code);
        assert!(result.warnings.is_empty());
        assert!(result.map.is_identity());
        assert_eq!(result.map.sources, vec!["Main.purs"]);
        assert_eq!(result.map.segments().len(), 3);
    }

    #[test]
    fn test_compose_with_identity_keeps_map() {
        let m = shifted("Main.purs");
        let id = identity_json("Main.purs", "x\ny");
        let expected = SourceMap::from_json(&m).unwrap();

        let before = compose(&[Some(id.as_str()), Some(m.as_str())], "Main.purs", ORIGINAL, "x\ny");
        let after = compose(&[Some(m.as_str()), Some(id.as_str())], "Main.purs", ORIGINAL, "x\ny");

        assert_eq!(before.map.segments(), expected.segments());
        assert_eq!(after.map.segments(), expected.segments());
        assert_eq!(after.map.sources, vec!["Main.purs"]);
        assert_eq!(after.map.names, vec!["log"]);
    }

    #[test]
    fn test_compose_traces_through_two_stages() {
        // Stage 1: line 0 col 0 comes from line 7 col 1, col 4 from line 7 col 3.
        let stage1 = r#"{"version":3,"sources":["Main.purs"],"names":[],"mappings":"AAOC,IAAE"}"#;
        // Stage 2: its line 0 col 10 comes from stage-1 output line 0 col 6.
        let stage2 = r#"{"version":3,"sources":["Main.js"],"names":[],"mappings":"UAAM"}"#;
        let result = compose(&[Some(stage1), Some(stage2)], "Main.purs", ORIGINAL, "");

        let seg = result.map.segments()[0];
        assert_eq!((seg.gen_line, seg.gen_column), (0, 10));
        let orig = seg.original.unwrap();
        // Nearest preceding segment of stage 1 at col 6 is the one at col 4.
        assert_eq!((orig.line, orig.column), (7, 3));
        assert_eq!(result.map.sources, vec!["Main.purs"]);
        assert_eq!(result.map.source_content(orig.source), Some(ORIGINAL));
    }

    #[test]
    fn test_unmapped_position_carries_through() {
        // Stage 1 maps only line 0; stage 2 points into line 3.
        let stage1 = r#"{"version":3,"sources":["Main.purs"],"names":[],"mappings":"AAAA"}"#;
        let stage2 = r#"{"version":3,"sources":["Main.js"],"names":[],"mappings":"AAGE"}"#;
        let result = compose(&[Some(stage1), Some(stage2)], "Main.purs", ORIGINAL, "");

        let orig = result.map.segments()[0].original.unwrap();
        assert_eq!((orig.line, orig.column), (3, 2));
        assert_eq!(result.map.source(orig.source), Some("Main.purs"));
        assert_eq!(result.map.source_content(orig.source), Some(ORIGINAL));
    }

    #[test]
    fn test_line_level_stage_degrades_columns() {
        // Stage 1 is line-level: one column-0 segment per line.
        let stage1 = identity_json("Main.purs", "a\nb");
        let stage1 = stage1.replace("\"AAAA;AACA\"", "\"AAAA;AAEA\"");
        let stage2 = r#"{"version":3,"sources":["Main.js"],"names":[],"mappings":"IACM"}"#;
        let result = compose(&[Some(stage1.as_str()), Some(stage2)], "Main.purs", ORIGINAL, "");

        // Stage 2 points at stage-1 line 1 col 6; only the line survives.
        let orig = result.map.segments()[0].original.unwrap();
        assert_eq!((orig.line, orig.column), (2, 0));
    }

    #[test]
    fn test_stage_sources_are_relocated() {
        // The compiler's map lives in output/Main/ and points back up to src/.
        let stage1 = shifted("../../src/Main.purs");
        let stage2 = r#"{"version":3,"sources":["index.js"],"names":[],"mappings":"AAAA"}"#;
        let result = compose_relocated(
            &[Some(stage1.as_str()), Some(stage2)],
            "src/Main.purs",
            ORIGINAL,
            "",
            |stage, source| match stage {
                0 => source.trim_start_matches("../../").to_string(),
                _ => format!("output/Main/{source}"),
            },
        );
        assert_eq!(result.map.sources, vec!["src/Main.purs"]);
        // Relocated onto the module itself, so its content is attached.
        assert_eq!(result.map.source_content(0), Some(ORIGINAL));
    }

    #[test]
    fn test_malformed_map_falls_back_to_identity() {
        let result = compose(
            &[Some("{not json"), Some(shifted("Main.js").as_str())],
            "Main.purs",
            ORIGINAL,
            "one\ntwo",
        );
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].stage, 1);
        assert!(result.map.is_identity());
        assert_eq!(result.map.segments().len(), 2);
        assert_eq!(result.map.source_content(0), Some(ORIGINAL));
    }
}
