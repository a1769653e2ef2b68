#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Wire types for the ferrypack compiler companion.
//!
//! The companion is a long-lived compiler session that services successive
//! compile requests faster than cold-starting the compiler for each module.
//! This crate defines the request/response types exchanged with it and the
//! frame codec.
//!
//! ## Wire format
//! Messages use length-prefixed JSON:
//! - 4-byte little-endian u32 length prefix
//! - JSON payload bytes

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;

/// Protocol schema version. Bump when changing message format.
pub const PROTO_SCHEMA_VERSION: u32 = 1;

/// Maximum frame size for sanity checking (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Error codes carried in [`Response::Error`].
pub mod codes {
    pub const PROTO_VERSION_MISMATCH: &str = "PROTO_VERSION_MISMATCH";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const SOURCE_NOT_FOUND: &str = "SOURCE_NOT_FOUND";
}

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Compiler-specific error code (if available).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// 1-based line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// 1-based column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: None,
            message: message.into(),
            file: None,
            line: None,
            column: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_location(mut self, file: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.severity)?;
        if let Some(code) = &self.code {
            write!(f, "[{code}]")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(file) = &self.file {
            write!(f, " at {}", file.display())?;
            if let (Some(line), Some(col)) = (self.line, self.column) {
                write!(f, ":{line}:{col}")?;
            }
        }
        Ok(())
    }
}

/// How the compiler process is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Run the compiler program itself.
    #[default]
    Direct,
    /// Run a checking wrapper with the compiler as its first argument.
    /// The wrapper reports diagnostics as JSON on stderr.
    Wrapped,
}

/// Where the compiled output of a module is found after a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLayout {
    /// Compiled code is written to stdout.
    #[default]
    Stdout,
    /// `<output>/<file stem>.js`
    FileStem,
    /// `<output>/<Module.Name>/index.js`, module name from the source header.
    ModuleDir,
}

/// Compiler settings for one loader stage.
///
/// Field names accept the camelCase keys of a loader `options` map, including
/// the aliases used by PureScript loader configurations (`psc`, `pscArgs`,
/// `pscIde`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileOptions {
    /// Compiler program.
    #[serde(alias = "psc")]
    pub compiler: String,
    /// Checking wrapper program (used in `wrapped` mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapper: Option<String>,
    /// Arguments passed to the wrapper before the compiler program.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wrapper_args: Vec<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Compiler input scope: glob patterns relative to `cwd`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src: Vec<String>,
    /// Flag map converted to `--kebab-case` arguments.
    #[serde(default, alias = "pscArgs", skip_serializing_if = "BTreeMap::is_empty")]
    pub compiler_args: BTreeMap<String, serde_json::Value>,
    /// Flags appended verbatim, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_flags: Vec<String>,
    #[serde(default)]
    pub emit_source_maps: bool,
    /// Output directory passed as `--output`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub output_layout: OutputLayout,
    /// Working directory for the compiler process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl CompileOptions {
    #[must_use]
    pub fn new(compiler: impl Into<String>) -> Self {
        Self {
            compiler: compiler.into(),
            wrapper: None,
            wrapper_args: Vec::new(),
            mode: ExecutionMode::Direct,
            src: Vec::new(),
            compiler_args: BTreeMap::new(),
            extra_flags: Vec::new(),
            emit_source_maps: false,
            output: None,
            output_layout: OutputLayout::Stdout,
            cwd: None,
        }
    }
}

/// Client hello message sent with every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub proto_schema_version: u32,
    pub client_version: String,
}

impl ClientHello {
    #[must_use]
    pub fn new(client_version: impl Into<String>) -> Self {
        Self {
            proto_schema_version: PROTO_SCHEMA_VERSION,
            client_version: client_version.into(),
        }
    }
}

/// Server hello message sent with every response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    pub proto_schema_version: u32,
    pub server_version: String,
}

impl ServerHello {
    #[must_use]
    pub fn new(server_version: impl Into<String>) -> Self {
        Self {
            proto_schema_version: PROTO_SCHEMA_VERSION,
            server_version: server_version.into(),
        }
    }
}

/// Request sent to the companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Health check.
    Ping { nonce: u64 },
    /// Compile one module.
    Compile {
        /// Correlates the response with the request.
        id: u64,
        path: PathBuf,
        /// Module text when it differs from the file on disk.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        options: CompileOptions,
    },
    /// Ask the companion to exit.
    Shutdown,
}

/// Response sent by the companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong {
        nonce: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_time_unix_ms: Option<u64>,
    },
    Compiled {
        id: u64,
        compiled_output: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        diagnostics: Vec<Diagnostic>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_map: Option<String>,
        /// File the compiler wrote the module to, when it did not use stdout.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_path: Option<PathBuf>,
        /// The companion served this result without running the compiler.
        #[serde(default)]
        from_cache: bool,
    },
    /// The compiler ran and rejected the module.
    Failed {
        id: u64,
        message: String,
        diagnostics: Vec<Diagnostic>,
    },
    ShutdownAck,
    /// The request itself could not be handled.
    Error { code: String, message: String },
}

impl Response {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn pong(nonce: u64) -> Self {
        let server_time_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as u64);
        Self::Pong {
            nonce,
            server_time_unix_ms,
        }
    }

    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Request frame (hello + request).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub hello: ClientHello,
    pub request: Request,
}

impl Frame {
    #[must_use]
    pub fn new(client_version: impl Into<String>, request: Request) -> Self {
        Self {
            hello: ClientHello::new(client_version),
            request,
        }
    }
}

/// Response frame (hello + response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameResponse {
    pub hello: ServerHello,
    pub response: Response,
}

impl FrameResponse {
    #[must_use]
    pub fn new(server_version: impl Into<String>, response: Response) -> Self {
        Self {
            hello: ServerHello::new(server_version),
            response,
        }
    }
}

/// Encode a frame to bytes with length prefix.
///
/// # Errors
/// Returns an error if serialization fails or the payload exceeds `u32`.
pub fn encode_frame<T: Serialize>(frame: &T) -> io::Result<Vec<u8>> {
    let json =
        serde_json::to_vec(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let len = u32::try_from(json.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;

    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode a frame payload (without length prefix).
///
/// # Errors
/// Returns an error if deserialization fails.
pub fn decode_frame<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> io::Result<T> {
    serde_json::from_slice(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn check_len(len_buf: [u8; 4]) -> io::Result<usize> {
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }
    Ok(len)
}

/// Write a length-prefixed frame to a writer.
///
/// # Errors
/// Returns an error if encoding or writing fails.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> io::Result<()> {
    let encoded = encode_frame(frame)?;
    writer.write_all(&encoded)?;
    writer.flush()
}

/// Read a length-prefixed frame from a reader.
///
/// # Errors
/// Returns an error if reading or decoding fails.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> io::Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = check_len(len_buf)?;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;

    decode_frame(&buf)
}

/// Write a length-prefixed frame to an async writer.
///
/// # Errors
/// Returns an error if encoding or writing fails.
#[cfg(feature = "tokio")]
pub async fn write_frame_async<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    use tokio::io::AsyncWriteExt;

    let encoded = encode_frame(frame)?;
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `Ok(None)` on a clean end of stream before the length prefix.
///
/// # Errors
/// Returns an error if reading or decoding fails.
#[cfg(feature = "tokio")]
pub async fn read_frame_async<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: tokio::io::AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    use tokio::io::AsyncReadExt;

    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = check_len(len_buf)?;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    decode_frame(&buf).map(Some)
}
