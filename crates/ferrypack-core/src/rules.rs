//! Loader rules and path matching.
//!
//! Rules are scanned in declaration order. A rule whose `exclude` pattern
//! matches is skipped; the first rule whose `test` matches wins and later
//! rules are never consulted.

use crate::Error;
use serde_json::{Map, Value};
use std::path::Path;

/// Pattern matched against a module path.
///
/// Paths are compared in `/`-separated form so rules behave the same on
/// every platform.
#[derive(Debug, Clone)]
pub enum PathPattern {
    /// Exact file-name suffix, e.g. `.purs`.
    Extension(String),
    /// `regex-lite` expression searched anywhere in the path.
    Regex(regex_lite::Regex),
    /// Plain substring, e.g. `/bower_components/`.
    Contains(String),
}

impl PathPattern {
    /// Compile a regular expression pattern.
    pub fn regex(expr: &str) -> Result<Self, Error> {
        regex_lite::Regex::new(expr)
            .map(Self::Regex)
            .map_err(|e| Error::ConfigInvalid(format!("invalid rule pattern /{expr}/: {e}")))
    }

    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        let normalized = normalize(path);
        match self {
            Self::Extension(ext) => normalized.ends_with(ext.as_str()),
            Self::Regex(re) => re.is_match(&normalized),
            Self::Contains(needle) => normalized.contains(needle.as_str()),
        }
    }
}

fn normalize(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Options map handed to a loader stage, as written in the config.
pub type LoaderOptions = Map<String, Value>;

/// One stage of a loader chain.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderSpec {
    pub loader: String,
    pub options: LoaderOptions,
}

impl LoaderSpec {
    #[must_use]
    pub fn new(loader: impl Into<String>) -> Self {
        Self {
            loader: loader.into(),
            options: Map::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: LoaderOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn emit_source_maps(&self) -> bool {
        self.options
            .get("emitSourceMaps")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn extra_flags(&self) -> Vec<String> {
        self.options
            .get("extraFlags")
            .and_then(Value::as_array)
            .map(|flags| {
                flags
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A compiled loader rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub test: PathPattern,
    pub exclude: Option<PathPattern>,
    pub loaders: Vec<LoaderSpec>,
}

impl Rule {
    #[must_use]
    pub fn new(test: PathPattern, loaders: Vec<LoaderSpec>) -> Self {
        Self {
            test,
            exclude: None,
            loaders,
        }
    }

    #[must_use]
    pub fn with_exclude(mut self, exclude: PathPattern) -> Self {
        self.exclude = Some(exclude);
        self
    }

    #[must_use]
    pub fn applies_to(&self, path: &Path) -> bool {
        if self.exclude.as_ref().is_some_and(|ex| ex.matches(path)) {
            return false;
        }
        self.test.matches(path)
    }
}

/// Outcome of matching a path against the rule list.
#[derive(Debug, Clone, Copy)]
pub enum Selection<'a> {
    /// Index of the winning rule and the rule itself.
    Matched(usize, &'a Rule),
    /// No rule applies; the file is taken as is.
    Passthrough,
}

/// Select the first applicable rule for `path`.
#[must_use]
pub fn select<'a>(rules: &'a [Rule], path: &Path) -> Selection<'a> {
    for (index, rule) in rules.iter().enumerate() {
        if rule.applies_to(path) {
            return Selection::Matched(index, rule);
        }
    }
    Selection::Passthrough
}

/// Like [`select`], but a path no rule applies to is an error.
pub fn select_required<'a>(rules: &'a [Rule], path: &Path) -> Result<(usize, &'a Rule), Error> {
    match select(rules, path) {
        Selection::Matched(index, rule) => Ok((index, rule)),
        Selection::Passthrough => Err(Error::NoLoaderMatched {
            path: path.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(test: PathPattern, loader: &str) -> Rule {
        Rule::new(test, vec![LoaderSpec::new(loader)])
    }

    fn chosen(rules: &[Rule], path: &str) -> Option<usize> {
        match select(rules, Path::new(path)) {
            Selection::Matched(i, _) => Some(i),
            Selection::Passthrough => None,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            rule(PathPattern::Extension(".purs".into()), "compiler"),
            rule(PathPattern::regex(r"\.purs$").unwrap(), "raw"),
            rule(PathPattern::Extension(".json".into()), "json"),
        ];
        assert_eq!(chosen(&rules, "/p/src/Main.purs"), Some(0));
        assert_eq!(chosen(&rules, "/p/package.json"), Some(2));
        assert_eq!(chosen(&rules, "/p/src/index.js"), None);
    }

    #[test]
    fn test_exclude_skips_rule_and_falls_through() {
        let rules = vec![
            rule(PathPattern::Extension(".js".into()), "compiler")
                .with_exclude(PathPattern::Contains("/node_modules/".into())),
            rule(PathPattern::Extension(".js".into()), "raw"),
        ];
        assert_eq!(chosen(&rules, "/p/src/a.js"), Some(0));
        assert_eq!(chosen(&rules, "/p/node_modules/x/index.js"), Some(1));
    }

    #[test]
    fn test_reordering_rules_changes_selection() {
        let a = rule(PathPattern::Extension(".purs".into()), "compiler");
        let b = rule(PathPattern::Contains("src/".into()), "raw");
        let forward = vec![a.clone(), b.clone()];
        let reverse = vec![b, a];

        let Selection::Matched(_, r) = select(&forward, Path::new("src/Main.purs")) else {
            panic!("expected match");
        };
        assert_eq!(r.loaders[0].loader, "compiler");
        let Selection::Matched(_, r) = select(&reverse, Path::new("src/Main.purs")) else {
            panic!("expected match");
        };
        assert_eq!(r.loaders[0].loader, "raw");
    }

    #[test]
    fn test_select_required_errors_on_passthrough() {
        let rules = vec![rule(PathPattern::Extension(".purs".into()), "compiler")];
        let err = select_required(&rules, Path::new("/p/a.css")).unwrap_err();
        assert_eq!(err.code(), "NO_LOADER_MATCHED");
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        let err = PathPattern::regex("(unclosed").unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID");
    }

    #[test]
    fn test_loader_spec_option_helpers() {
        let options: LoaderOptions = serde_json::from_str(
            r#"{"emitSourceMaps": true, "extraFlags": ["--censor-lib", "--strict"]}"#,
        )
        .unwrap();
        let spec = LoaderSpec::new("compiler").with_options(options);
        assert!(spec.emit_source_maps());
        assert_eq!(spec.extra_flags(), vec!["--censor-lib", "--strict"]);
        assert!(!LoaderSpec::new("raw").emit_source_maps());
    }
}
