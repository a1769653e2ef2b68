//! Parsing of compiler diagnostics.
//!
//! Three formats are understood, tried in order:
//!
//! 1. A JSON report `{"warnings": [...], "errors": [...]}` as printed by the
//!    compiler and its checking wrapper with `--json-errors`.
//! 2. `path:line:col: severity: message` lines.
//! 3. Anything else: one error per non-empty line.

use ferrypack_proto::{Diagnostic, Severity};
use regex_lite::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Parse a JSON report found anywhere in `text`.
///
/// Returns `None` when no line of `text` is a JSON report.
#[must_use]
pub fn parse_json_report(text: &str) -> Option<Vec<Diagnostic>> {
    let report = text.lines().rev().find_map(|line| {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(line).ok()?;
        (value.get("errors").is_some() || value.get("warnings").is_some()).then_some(value)
    })?;

    let mut out = Vec::new();
    for (key, severity) in [("errors", Severity::Error), ("warnings", Severity::Warning)] {
        if let Some(items) = report.get(key).and_then(Value::as_array) {
            out.extend(items.iter().map(|item| json_diagnostic(item, severity)));
        }
    }
    Some(out)
}

fn json_diagnostic(item: &Value, severity: Severity) -> Diagnostic {
    let str_field = |names: &[&str]| {
        names
            .iter()
            .find_map(|n| item.get(*n).and_then(Value::as_str))
            .map(str::to_string)
    };
    let num = |v: Option<&Value>| v.and_then(Value::as_u64).and_then(|n| u32::try_from(n).ok());

    let message = str_field(&["message"]).unwrap_or_else(|| item.to_string());
    let mut diag = Diagnostic::new(severity, message.trim_end());
    diag.code = str_field(&["errorCode", "code"]);
    diag.file = str_field(&["filename", "file"]).map(Into::into);
    match item.get("position") {
        Some(pos) if !pos.is_null() => {
            diag.line = num(pos.get("startLine"));
            diag.column = num(pos.get("startColumn"));
        }
        _ => {
            diag.line = num(item.get("line"));
            diag.column = num(item.get("column"));
        }
    }
    diag
}

fn location_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+?):(\d+):(\d+):\s*(?:(error|warning|info|note):)?\s*(.*)$")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

/// Parse `path:line:col: severity: message` lines. Lines that do not have
/// that shape are appended to the previous diagnostic's message.
#[must_use]
pub fn parse_located(text: &str) -> Vec<Diagnostic> {
    let mut out: Vec<Diagnostic> = Vec::new();
    for line in text.lines() {
        if let Some(caps) = location_line().captures(line) {
            let severity = match caps.get(4).map(|m| m.as_str()) {
                Some("warning") => Severity::Warning,
                Some("info" | "note") => Severity::Info,
                _ => Severity::Error,
            };
            let line_no = caps[2].parse().unwrap_or(0);
            let col = caps[3].parse().unwrap_or(0);
            out.push(
                Diagnostic::new(severity, caps[5].trim()).with_location(&caps[1], line_no, col),
            );
        } else if let Some(last) = out.last_mut() {
            let extra = line.trim();
            if !extra.is_empty() {
                last.message.push('\n');
                last.message.push_str(extra);
            }
        }
    }
    out
}

/// Diagnostics for a failed compiler run.
///
/// Never returns an empty list for non-empty output, so a failure always
/// carries something to show.
#[must_use]
pub fn parse_failure(stdout: &str, stderr: &str) -> Vec<Diagnostic> {
    for text in [stderr, stdout] {
        if let Some(diags) = parse_json_report(text) {
            if diags.iter().any(Diagnostic::is_error) {
                return diags;
            }
        }
    }
    for text in [stderr, stdout] {
        let located = parse_located(text);
        if !located.is_empty() {
            return located;
        }
    }
    stderr
        .lines()
        .chain(stdout.lines())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(Diagnostic::error)
        .collect()
}

/// Warnings reported by a successful compiler run.
#[must_use]
pub fn parse_success(stderr: &str) -> Vec<Diagnostic> {
    parse_json_report(stderr)
        .unwrap_or_default()
        .into_iter()
        .filter(|d| !d.is_error())
        .collect()
}
