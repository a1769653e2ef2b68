use crate::compiler::CompilerError;
use ferrypack_proto::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Core error type for ferrypack operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    ConfigInvalid(String),

    #[error("Unknown loader '{0}'")]
    UnknownLoader(String),

    #[error("Cannot resolve '{specifier}' from {}", from.display())]
    ModuleNotFound {
        specifier: String,
        /// Module (or directory, for the entry) that asked for it.
        from: PathBuf,
        tried: Vec<PathBuf>,
    },

    #[error("No loader rule matches {}", path.display())]
    NoLoaderMatched { path: PathBuf },

    #[error("Loader stage {stage_index} ({loader}) failed for {}: {source}", path.display())]
    LoaderStageFailed {
        /// 0-based position in the chain.
        stage_index: usize,
        loader: String,
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Compilation(#[from] CompilerError),

    #[error("Failed to write {path}: {source}")]
    Emit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Build cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) | Self::Read { .. } => "IO_ERROR",
            Self::ConfigRead { .. } => "CONFIG_READ_ERROR",
            Self::ConfigParse { .. } => "CONFIG_PARSE_ERROR",
            Self::ConfigInvalid(_) => "CONFIG_INVALID",
            Self::UnknownLoader(_) => "UNKNOWN_LOADER",
            Self::ModuleNotFound { .. } => "MODULE_NOT_FOUND",
            Self::NoLoaderMatched { .. } => "NO_LOADER_MATCHED",
            Self::LoaderStageFailed { .. } => "LOADER_STAGE_FAILED",
            Self::Compilation(_) => "COMPILATION_ERROR",
            Self::Emit { .. } => "EMIT_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Other(_) => "ERROR",
        }
    }

    /// Innermost error, looking through loader stage wrappers.
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Self::LoaderStageFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Compiler diagnostics carried by this error, if it stems from a
    /// compilation failure.
    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self.root() {
            Self::Compilation(e) => &e.diagnostics,
            _ => &[],
        }
    }

    /// Whether this is a cancellation rather than a real failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }
}
