//! V3 source maps: decoding, encoding, composition and concatenation.
//!
//! A [`SourceMap`] is kept in decoded form (absolute segment positions,
//! 0-based) so that composing loader stages and offsetting modules into a
//! bundle are plain arithmetic. The JSON form is produced only at the edges.

pub mod compose;
pub mod vlq;

pub use compose::{compose, compose_relocated, ComposeWarning, Composed};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Error decoding a source map.
#[derive(Debug, thiserror::Error)]
pub enum SourceMapError {
    #[error("invalid source map JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported source map version {0}")]
    Version(u32),
    #[error("invalid VLQ data in segment {segment:?} on line {line}")]
    Vlq { line: u32, segment: String },
    #[error("segment on line {line} has {fields} fields")]
    FieldCount { line: u32, fields: usize },
    #[error("segment on line {line} refers to a negative position or index")]
    Negative { line: u32 },
    #[error("segment on line {line} refers to missing source {index}")]
    SourceIndex { line: u32, index: u32 },
    #[error("segment on line {line} refers to missing name {index}")]
    NameIndex { line: u32, index: u32 },
}

/// Original-side position of a mapped segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalPosition {
    pub source: u32,
    pub line: u32,
    pub column: u32,
    pub name: Option<u32>,
}

/// One mapping segment. Positions are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub gen_line: u32,
    pub gen_column: u32,
    /// `None` marks a generated range with no original counterpart.
    pub original: Option<OriginalPosition>,
}

/// JSON shape of a V3 map.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceMap {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_root: Option<String>,
    #[serde(default)]
    sources: Vec<Option<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sources_content: Vec<Option<String>>,
    #[serde(default)]
    names: Vec<String>,
    mappings: String,
}

/// A decoded source map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceMap {
    pub file: Option<String>,
    pub sources: Vec<String>,
    /// Parallel to `sources`; may be shorter when contents are absent.
    pub sources_content: Vec<Option<String>>,
    pub names: Vec<String>,
    /// Sorted by generated position.
    segments: Vec<Segment>,
}

impl SourceMap {
    /// Build a map from segments, sorting them by generated position.
    #[must_use]
    pub fn new(
        sources: Vec<String>,
        sources_content: Vec<Option<String>>,
        names: Vec<String>,
        mut segments: Vec<Segment>,
    ) -> Self {
        segments.sort_by_key(|s| (s.gen_line, s.gen_column));
        Self {
            file: None,
            sources,
            sources_content,
            names,
            segments,
        }
    }

    /// Line-level identity map of `content` onto `source`.
    #[must_use]
    pub fn identity(source: &str, content: &str) -> Self {
        let segments = (0..line_count(content))
            .map(|line| Segment {
                gen_line: line,
                gen_column: 0,
                original: Some(OriginalPosition {
                    source: 0,
                    line,
                    column: 0,
                    name: None,
                }),
            })
            .collect();
        Self {
            file: None,
            sources: vec![source.to_string()],
            sources_content: vec![Some(content.to_string())],
            names: Vec::new(),
            segments,
        }
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True when every segment maps a position onto itself in a single source.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.sources.len() == 1
            && self.segments.iter().all(|s| {
                s.original.is_some_and(|o| {
                    o.source == 0 && o.line == s.gen_line && o.column == s.gen_column
                })
            })
    }

    /// True when some line carries more than one segment or a segment starts
    /// past column 0.
    #[must_use]
    pub fn has_column_info(&self) -> bool {
        self.segments
            .windows(2)
            .any(|w| w[0].gen_line == w[1].gen_line)
            || self.segments.iter().any(|s| s.gen_column != 0)
    }

    /// Nearest segment at or before `(line, column)` on the same line.
    #[must_use]
    pub fn lookup(&self, line: u32, column: u32) -> Option<&Segment> {
        let idx = self
            .segments
            .partition_point(|s| (s.gen_line, s.gen_column) <= (line, column));
        let seg = self.segments[..idx].last()?;
        (seg.gen_line == line).then_some(seg)
    }

    #[must_use]
    pub fn source(&self, index: u32) -> Option<&str> {
        self.sources.get(index as usize).map(String::as_str)
    }

    #[must_use]
    pub fn name(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    #[must_use]
    pub fn source_content(&self, index: u32) -> Option<&str> {
        self.sources_content
            .get(index as usize)
            .and_then(|c| c.as_deref())
    }

    /// Decode a V3 source map.
    ///
    /// # Errors
    /// Returns an error for invalid JSON, a version other than 3, undecodable
    /// mappings, or out-of-range source/name indices.
    pub fn from_json(json: &str) -> Result<Self, SourceMapError> {
        let raw: RawSourceMap = serde_json::from_str(json)?;
        if raw.version != 3 {
            return Err(SourceMapError::Version(raw.version));
        }

        let root = raw.source_root.filter(|r| !r.is_empty());
        let sources: Vec<String> = raw
            .sources
            .into_iter()
            .map(|s| {
                let s = s.unwrap_or_default();
                match &root {
                    Some(root) => format!("{}/{s}", root.trim_end_matches('/')),
                    None => s,
                }
            })
            .collect();

        let segments = decode_mappings(&raw.mappings, sources.len(), raw.names.len())?;
        Ok(Self {
            file: raw.file,
            sources,
            sources_content: raw.sources_content,
            names: raw.names,
            segments,
        })
    }

    /// Encode as V3 JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        let raw = RawSourceMap {
            version: 3,
            file: self.file.clone(),
            source_root: None,
            sources: self.sources.iter().cloned().map(Some).collect(),
            sources_content: self.sources_content.clone(),
            names: self.names.clone(),
            mappings: self.encode_mappings(),
        };
        // A struct of strings and vectors always serializes.
        serde_json::to_string(&raw).unwrap_or_default()
    }

    fn encode_mappings(&self) -> String {
        let mut out = String::new();
        let mut line = 0u32;
        let mut prev_col = 0i64;
        let mut prev_src = 0i64;
        let mut prev_orig_line = 0i64;
        let mut prev_orig_col = 0i64;
        let mut prev_name = 0i64;
        let mut first_on_line = true;

        for seg in &self.segments {
            while line < seg.gen_line {
                out.push(';');
                line += 1;
                prev_col = 0;
                first_on_line = true;
            }
            if !first_on_line {
                out.push(',');
            }
            first_on_line = false;

            let col = i64::from(seg.gen_column);
            vlq::encode(col - prev_col, &mut out);
            prev_col = col;

            if let Some(orig) = seg.original {
                let src = i64::from(orig.source);
                let ol = i64::from(orig.line);
                let oc = i64::from(orig.column);
                vlq::encode(src - prev_src, &mut out);
                vlq::encode(ol - prev_orig_line, &mut out);
                vlq::encode(oc - prev_orig_col, &mut out);
                prev_src = src;
                prev_orig_line = ol;
                prev_orig_col = oc;
                if let Some(name) = orig.name {
                    let name = i64::from(name);
                    vlq::encode(name - prev_name, &mut out);
                    prev_name = name;
                }
            }
        }
        out
    }
}

fn line_count(content: &str) -> u32 {
    let lines = content.lines().count().max(1);
    u32::try_from(lines).unwrap_or(u32::MAX)
}

fn to_u32(value: i64, line: u32) -> Result<u32, SourceMapError> {
    u32::try_from(value).map_err(|_| SourceMapError::Negative { line })
}

fn decode_mappings(
    mappings: &str,
    source_count: usize,
    name_count: usize,
) -> Result<Vec<Segment>, SourceMapError> {
    let mut segments = Vec::new();
    let mut src = 0i64;
    let mut orig_line = 0i64;
    let mut orig_col = 0i64;
    let mut name = 0i64;

    for (line_idx, line) in mappings.split(';').enumerate() {
        let gen_line = u32::try_from(line_idx).unwrap_or(u32::MAX);
        let mut col = 0i64;
        for text in line.split(',').filter(|s| !s.is_empty()) {
            let fields = vlq::decode_segment(text).ok_or_else(|| SourceMapError::Vlq {
                line: gen_line,
                segment: text.to_string(),
            })?;
            if !matches!(fields.len(), 1 | 4 | 5) {
                return Err(SourceMapError::FieldCount {
                    line: gen_line,
                    fields: fields.len(),
                });
            }

            col += fields[0];
            let gen_column = to_u32(col, gen_line)?;
            let original = if fields.len() >= 4 {
                src += fields[1];
                orig_line += fields[2];
                orig_col += fields[3];
                let source = to_u32(src, gen_line)?;
                if source as usize >= source_count {
                    return Err(SourceMapError::SourceIndex {
                        line: gen_line,
                        index: source,
                    });
                }
                let name_idx = if fields.len() == 5 {
                    name += fields[4];
                    let idx = to_u32(name, gen_line)?;
                    if idx as usize >= name_count {
                        return Err(SourceMapError::NameIndex {
                            line: gen_line,
                            index: idx,
                        });
                    }
                    Some(idx)
                } else {
                    None
                };
                Some(OriginalPosition {
                    source,
                    line: to_u32(orig_line, gen_line)?,
                    column: to_u32(orig_col, gen_line)?,
                    name: name_idx,
                })
            } else {
                None
            };

            segments.push(Segment {
                gen_line,
                gen_column,
                original,
            });
        }
    }

    segments.sort_by_key(|s| (s.gen_line, s.gen_column));
    Ok(segments)
}

/// Concatenates per-module maps into one bundle map.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    sources: Vec<String>,
    sources_content: Vec<Option<String>>,
    source_index: HashMap<String, u32>,
    names: Vec<String>,
    name_index: HashMap<String, u32>,
    segments: Vec<Segment>,
}

impl SourceMapBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn intern_source(&mut self, source: &str, content: Option<&str>) -> u32 {
        if let Some(&idx) = self.source_index.get(source) {
            if let (Some(slot), Some(content)) = (self.sources_content.get_mut(idx as usize), content)
            {
                if slot.is_none() {
                    *slot = Some(content.to_string());
                }
            }
            return idx;
        }
        let idx = u32::try_from(self.sources.len()).unwrap_or(u32::MAX);
        self.sources.push(source.to_string());
        self.sources_content.push(content.map(str::to_string));
        self.source_index.insert(source.to_string(), idx);
        idx
    }

    fn intern_name(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.name_index.get(name) {
            return idx;
        }
        let idx = u32::try_from(self.names.len()).unwrap_or(u32::MAX);
        self.names.push(name.to_string());
        self.name_index.insert(name.to_string(), idx);
        idx
    }

    /// Append `map` with its generated lines shifted down by `line_offset`.
    pub fn add_map(&mut self, map: &SourceMap, line_offset: u32) {
        let mut source_remap = Vec::with_capacity(map.sources.len());
        for (i, source) in map.sources.iter().enumerate() {
            let content = map.sources_content.get(i).and_then(|c| c.as_deref());
            source_remap.push(self.intern_source(source, content));
        }
        let name_remap: Vec<u32> = map.names.iter().map(|n| self.intern_name(n)).collect();

        for seg in &map.segments {
            let original = seg.original.map(|o| OriginalPosition {
                source: source_remap[o.source as usize],
                line: o.line,
                column: o.column,
                name: o.name.map(|n| name_remap[n as usize]),
            });
            self.segments.push(Segment {
                gen_line: seg.gen_line + line_offset,
                gen_column: seg.gen_column,
                original,
            });
        }
    }

    #[must_use]
    pub fn finish(self, file: Option<String>) -> SourceMap {
        let mut map = SourceMap::new(self.sources, self.sources_content, self.names, self.segments);
        map.file = file;
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"version":3,"sources":["a.purs"],"names":["main"],"mappings":"AAAA,IAAIA;AACA"}"#;

    #[test]
    fn test_decode_sample() {
        let map = SourceMap::from_json(SAMPLE).unwrap();
        assert_eq!(map.sources, vec!["a.purs"]);
        let segs = map.segments();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[1].gen_column, 4);
        assert_eq!(segs[1].original.unwrap().column, 4);
        assert_eq!(segs[1].original.unwrap().name, Some(0));
        assert_eq!(segs[2].gen_line, 1);
        assert_eq!(segs[2].original.unwrap().line, 1);
    }

    #[test]
    fn test_encode_decode_preserves_segments() {
        let map = SourceMap::from_json(SAMPLE).unwrap();
        let again = SourceMap::from_json(&map.to_json()).unwrap();
        assert_eq!(map.segments(), again.segments());
        assert_eq!(map.names, again.names);
    }

    #[test]
    fn test_rejects_bad_source_index() {
        let json = r#"{"version":3,"sources":["a"],"names":[],"mappings":"ACAA"}"#;
        assert!(matches!(
            SourceMap::from_json(json),
            Err(SourceMapError::SourceIndex { .. })
        ));
    }

    #[test]
    fn test_rejects_wrong_version_and_field_count() {
        let v2 = r#"{"version":2,"sources":[],"names":[],"mappings":""}"#;
        assert!(matches!(
            SourceMap::from_json(v2),
            Err(SourceMapError::Version(2))
        ));
        let two_fields = r#"{"version":3,"sources":["a"],"names":[],"mappings":"AA"}"#;
        assert!(matches!(
            SourceMap::from_json(two_fields),
            Err(SourceMapError::FieldCount { fields: 2, .. })
        ));
    }

    #[test]
    fn test_lookup_nearest_preceding_same_line() {
        let map = SourceMap::from_json(SAMPLE).unwrap();
        assert_eq!(map.lookup(0, 2).unwrap().gen_column, 0);
        assert_eq!(map.lookup(0, 99).unwrap().gen_column, 4);
        assert_eq!(map.lookup(1, 0).unwrap().gen_line, 1);
        assert!(map.lookup(5, 0).is_none());
    }

    #[test]
    fn test_identity_detection() {
        let id = SourceMap::identity("a.js", "x\ny\nz");
        assert!(id.is_identity());
        assert!(!id.has_column_info());
        assert_eq!(id.segments().len(), 3);

        let map = SourceMap::from_json(SAMPLE).unwrap();
        assert!(!map.is_identity());
        assert!(map.has_column_info());
    }

    #[test]
    fn test_builder_offsets_and_interns() {
        let a = SourceMap::identity("a.js", "1\n2");
        let b = SourceMap::identity("b.js", "3");
        let mut builder = SourceMapBuilder::new();
        builder.add_map(&a, 1);
        builder.add_map(&b, 4);
        builder.add_map(&a, 6);
        let out = builder.finish(Some("bundle.js".into()));

        assert_eq!(out.sources, vec!["a.js", "b.js"]);
        let lines: Vec<u32> = out.segments().iter().map(|s| s.gen_line).collect();
        assert_eq!(lines, vec![1, 2, 4, 6, 7]);
        assert_eq!(out.segments()[2].original.unwrap().source, 1);
        assert!(out.to_json().contains("\"file\":\"bundle.js\""));
    }
}
