use crate::compiler::CompilerSettings;
use crate::loader::is_builtin_loader;
use crate::rules::{LoaderOptions, LoaderSpec, PathPattern, Rule};
use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the project configuration file.
pub const CONFIG_FILE_NAME: &str = "ferrypack.json";

/// Runtime configuration for the ferrypack CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Current working directory.
    pub cwd: PathBuf,

    /// Whether to emit JSON logs.
    pub json_logs: bool,

    /// Verbosity level (0 = INFO, 1 = DEBUG, 2+ = TRACE).
    pub verbosity: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            json_logs: false,
            verbosity: 0,
        }
    }
}

impl Config {
    /// Create a new config with the given working directory.
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            ..Default::default()
        }
    }

    /// Set verbosity level.
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set JSON log output.
    #[must_use]
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }
}

/// Source map generation for the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Devtool {
    /// Write `<bundle>.map` and reference it from the bundle.
    SourceMap,
    #[default]
    None,
}

/// How much the dev server reports about each build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Stats {
    ErrorsOnly,
    Minimal,
    #[default]
    Normal,
    Verbose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    #[serde(default = "default_dot")]
    pub path: PathBuf,
    #[serde(default = "default_filename")]
    pub filename: String,
    /// Prefix each bundled module with a `/*! path */` comment.
    #[serde(default)]
    pub pathinfo: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_dot(),
            filename: default_filename(),
            pathinfo: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConfig {
    /// Directory names searched for bare specifiers.
    #[serde(default = "default_modules_directories")]
    pub modules_directories: Vec<String>,
    /// Candidate suffixes, tried in order.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            modules_directories: default_modules_directories(),
            extensions: default_extensions(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevServerConfig {
    #[serde(default = "default_dot")]
    pub content_base: PathBuf,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub stats: Stats,
    /// Quiet period after the last file change before rebuilding.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            content_base: default_dot(),
            host: default_host(),
            port: default_port(),
            stats: Stats::default(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Path pattern as written in the config file: a bare string is a regular
/// expression, an object names the pattern kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternConfig {
    Regex(String),
    Tagged(TaggedPattern),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaggedPattern {
    Extension(String),
    Regex(String),
    Contains(String),
}

impl PatternConfig {
    fn compile(&self) -> Result<PathPattern, Error> {
        match self {
            Self::Regex(expr) | Self::Tagged(TaggedPattern::Regex(expr)) => PathPattern::regex(expr),
            Self::Tagged(TaggedPattern::Extension(ext)) => Ok(PathPattern::Extension(ext.clone())),
            Self::Tagged(TaggedPattern::Contains(s)) => Ok(PathPattern::Contains(s.clone())),
        }
    }
}

/// Loader entry in a rule: a bare identifier or an identifier with options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoaderEntry {
    Name(String),
    Full {
        loader: String,
        #[serde(default, alias = "query")]
        options: LoaderOptions,
    },
}

impl LoaderEntry {
    fn to_spec(&self) -> LoaderSpec {
        match self {
            Self::Name(name) => LoaderSpec::new(name.clone()),
            Self::Full { loader, options } => LoaderSpec::new(loader.clone()).with_options(options.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    pub test: PatternConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<PatternConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loaders: Vec<LoaderEntry>,
    /// Single-stage shorthand: `{"test": ..., "loader": "...", "query": {...}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader: Option<String>,
    #[serde(default, alias = "query", skip_serializing_if = "Option::is_none")]
    pub options: Option<LoaderOptions>,
}

impl RuleConfig {
    fn chain(&self) -> Result<Vec<LoaderSpec>, Error> {
        match (&self.loader, self.loaders.is_empty()) {
            (Some(_), false) => Err(Error::ConfigInvalid(
                "a rule sets both `loader` and `loaders`".into(),
            )),
            (Some(name), true) => {
                let spec = LoaderSpec::new(name.clone())
                    .with_options(self.options.clone().unwrap_or_default());
                Ok(vec![spec])
            }
            (None, false) => Ok(self.loaders.iter().map(LoaderEntry::to_spec).collect()),
            (None, true) => Err(Error::ConfigInvalid("a rule has no loaders".into())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    /// Ordered rule list; the first applicable rule wins.
    #[serde(default, alias = "loaders")]
    pub rules: Vec<RuleConfig>,
}

/// Contents of `ferrypack.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Entry specifier, resolved from the project root.
    pub entry: String,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub devtool: Devtool,
    /// Upper bound on concurrently running transforms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub module: ModuleConfig,
    #[serde(default)]
    pub resolve: ResolveConfig,
    #[serde(default)]
    pub dev_server: DevServerConfig,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub root: PathBuf,
}

impl ProjectConfig {
    /// Minimal config for an entry with no rules.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            output: OutputConfig::default(),
            devtool: Devtool::default(),
            concurrency: None,
            module: ModuleConfig::default(),
            resolve: ResolveConfig::default(),
            dev_server: DevServerConfig::default(),
            root: root.into(),
        }
    }

    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let root = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_json_str(&text, root).map_err(|e| match e {
            Error::ConfigParse { source, .. } => Error::ConfigParse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Load `ferrypack.json` from `dir`.
    pub fn discover(dir: &Path) -> Result<Self, Error> {
        Self::load(&dir.join(CONFIG_FILE_NAME))
    }

    /// Parse and validate config text rooted at `root`.
    pub fn from_json_str(text: &str, root: impl Into<PathBuf>) -> Result<Self, Error> {
        let mut config: Self = serde_json::from_str(text).map_err(|source| Error::ConfigParse {
            path: PathBuf::from(CONFIG_FILE_NAME),
            source,
        })?;
        config.root = root.into();
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked before a build starts.
    pub fn validate(&self) -> Result<(), Error> {
        if self.entry.trim().is_empty() {
            return Err(Error::ConfigInvalid("`entry` is empty".into()));
        }
        if self.output.filename.is_empty() || self.output.filename.contains(['/', '\\']) {
            return Err(Error::ConfigInvalid(format!(
                "`output.filename` must be a plain file name, got {:?}",
                self.output.filename
            )));
        }
        if self.concurrency == Some(0) {
            return Err(Error::ConfigInvalid("`concurrency` must be at least 1".into()));
        }
        for rule in self.compile_rules()? {
            for spec in &rule.loaders {
                if !is_builtin_loader(&spec.loader) {
                    return Err(Error::UnknownLoader(spec.loader.clone()));
                }
                if spec.options.get("bundle").and_then(serde_json::Value::as_bool) == Some(true) {
                    return Err(Error::ConfigInvalid(format!(
                        "loader '{}': `bundle: true` is not supported, modules are always bundled by ferrypack",
                        spec.loader
                    )));
                }
                if crate::loader::is_compiler_loader(&spec.loader) {
                    CompilerSettings::from_options(&spec.options, &self.root)?;
                }
            }
        }
        Ok(())
    }

    /// Compile the configured rules, preserving their order.
    pub fn compile_rules(&self) -> Result<Vec<Rule>, Error> {
        self.module
            .rules
            .iter()
            .map(|rc| {
                let mut rule = Rule::new(rc.test.compile()?, rc.chain()?);
                if let Some(exclude) = &rc.exclude {
                    rule = rule.with_exclude(exclude.compile()?);
                }
                Ok(rule)
            })
            .collect()
    }

    #[must_use]
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.dev_server.port = port;
        self
    }

    #[must_use]
    pub fn source_maps_enabled(&self) -> bool {
        self.devtool == Devtool::SourceMap
    }

    /// Absolute path of the bundle file.
    #[must_use]
    pub fn output_file(&self) -> PathBuf {
        self.root.join(&self.output.path).join(&self.output.filename)
    }

    /// Absolute path of the bundle's source map.
    #[must_use]
    pub fn map_file(&self) -> PathBuf {
        self.root
            .join(&self.output.path)
            .join(format!("{}.map", self.output.filename))
    }

    #[must_use]
    pub fn content_base(&self) -> PathBuf {
        self.root.join(&self.dev_server.content_base)
    }

    /// Transform concurrency: configured value or available parallelism,
    /// clamped to `1..=64`.
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(4, usize::from))
            .clamp(1, 64)
    }
}

fn default_dot() -> PathBuf {
    PathBuf::from(".")
}

fn default_filename() -> String {
    "bundle.js".to_string()
}

fn default_modules_directories() -> Vec<String> {
    vec!["node_modules".to_string()]
}

fn default_extensions() -> Vec<String> {
    vec![String::new(), ".js".to_string()]
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_debounce_ms() -> u64 {
    100
}
