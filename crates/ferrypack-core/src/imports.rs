//! Dependency scanner for transformed module code.
//!
//! Bundled modules are CommonJS: their dependencies are the string literal
//! arguments of `require(...)` calls. The scanner skips comments and string
//! literals without parsing the code.

use std::collections::HashSet;

/// A `require` found in module code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Specifier exactly as written.
    pub specifier: String,
    /// 1-based line of the call.
    pub line: u32,
}

/// Scan code for `require("...")` specifiers.
///
/// Returns dependencies in first-appearance order, deduplicated by specifier.
#[must_use]
pub fn scan_requires(source: &str) -> Vec<Dependency> {
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut results = Vec::new();
    let mut seen = HashSet::new();
    let mut line: u32 = 1;
    let mut i = 0;

    while i < len {
        match chars[i] {
            '\n' => {
                line += 1;
                i += 1;
            }
            '/' if i + 1 < len && chars[i + 1] == '/' => {
                while i < len && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if i + 1 < len && chars[i + 1] == '*' => {
                i += 2;
                while i + 1 < len && !(chars[i] == '*' && chars[i + 1] == '/') {
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 2;
            }
            '"' | '\'' | '`' => {
                let (_, end, newlines) = read_string(&chars, i);
                line += newlines;
                i = end;
            }
            _ if matches_keyword(&chars, i, "require") => {
                match scan_require_call(&chars, i + 7) {
                    Some((spec, end)) => {
                        if !spec.is_empty() && seen.insert(spec.clone()) {
                            results.push(Dependency {
                                specifier: spec,
                                line,
                            });
                        }
                        i = end;
                    }
                    None => i += 7,
                }
            }
            _ => i += 1,
        }
    }

    results
}

/// Check if chars at position match a keyword (with word boundary).
fn matches_keyword(chars: &[char], pos: usize, keyword: &str) -> bool {
    let kw: Vec<char> = keyword.chars().collect();
    let len = kw.len();
    if pos + len > chars.len() {
        return false;
    }

    let is_ident = |c: char| c.is_alphanumeric() || c == '_' || c == '$';
    // `obj.require(...)` is a method call, not a module reference.
    if pos > 0 && (is_ident(chars[pos - 1]) || chars[pos - 1] == '.') {
        return false;
    }
    if chars[pos..pos + len] != kw[..] {
        return false;
    }
    !(pos + len < chars.len() && is_ident(chars[pos + len]))
}

/// Read a quoted literal starting at `start`. Returns the contents, the
/// position after the closing quote and the number of newlines crossed.
fn read_string(chars: &[char], start: usize) -> (String, usize, u32) {
    let quote = chars[start];
    let mut i = start + 1;
    let mut out = String::new();
    let mut newlines = 0;
    while i < chars.len() && chars[i] != quote {
        if chars[i] == '\\' && i + 1 < chars.len() {
            out.push(chars[i + 1]);
            i += 2;
            continue;
        }
        if chars[i] == '\n' {
            newlines += 1;
        }
        out.push(chars[i]);
        i += 1;
    }
    (out, i + 1, newlines)
}

/// Scan a `require("...")` call whose keyword ends at `start`.
fn scan_require_call(chars: &[char], start: usize) -> Option<(String, usize)> {
    let len = chars.len();
    let mut i = start;
    while i < len && chars[i].is_whitespace() && chars[i] != '\n' {
        i += 1;
    }
    if i >= len || chars[i] != '(' {
        return None;
    }
    i += 1;
    while i < len && chars[i].is_whitespace() && chars[i] != '\n' {
        i += 1;
    }
    if i >= len || !matches!(chars[i], '"' | '\'') {
        return None;
    }
    let (spec, end, newlines) = read_string(chars, i);
    if newlines > 0 {
        return None;
    }
    let mut i = end;
    while i < len && chars[i].is_whitespace() && chars[i] != '\n' {
        i += 1;
    }
    // Computed arguments such as `require("a" + b)` are not static.
    if i >= len || chars[i] != ')' {
        return None;
    }
    Some((spec, i + 1))
}
