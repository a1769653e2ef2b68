//! Companion compiler server.
//!
//! Serves the `ferrypack-proto` frame protocol on a byte stream (stdio when
//! started as `ferrypack companion`). Each `Compile` request is run through a
//! compiler invoker. The newest successful result for each module path is
//! kept under the BLAKE3 of the module text, the compile options and every
//! file the `src` globs match, so an unchanged module is answered without
//! starting the compiler. An edit anywhere in the source set misses.

use ferrypack_core::compiler::args::expand_src;
use ferrypack_core::compiler::{CompileOutput, CompileRequest, CompilerInvoker};
use ferrypack_core::VERSION;
use ferrypack_proto::{
    codes, read_frame_async, write_frame_async, CompileOptions, Frame, FrameResponse, Request,
    Response, PROTO_SCHEMA_VERSION,
};
use ferrypack_util::hash::{blake3_file, blake3_parts};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Request handler state for one companion session.
pub struct CompanionServer {
    invoker: Arc<dyn CompilerInvoker>,
    /// Latest result per module path, with the key it was computed under.
    cache: HashMap<PathBuf, (String, CompileOutput)>,
}

impl CompanionServer {
    #[must_use]
    pub fn new(invoker: Arc<dyn CompilerInvoker>) -> Self {
        Self {
            invoker,
            cache: HashMap::new(),
        }
    }

    /// Number of cached compile results.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Serve frames until the peer sends `Shutdown` or closes the stream.
    pub async fn serve<R, W>(mut self, mut reader: R, mut writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(compiler = self.invoker.name(), "companion ready");
        while let Some(frame) = read_frame_async::<_, Frame>(&mut reader).await? {
            let shutdown = matches!(frame.request, Request::Shutdown);
            let response = if frame.hello.proto_schema_version == PROTO_SCHEMA_VERSION {
                self.handle(frame.request).await
            } else {
                Response::error(
                    codes::PROTO_VERSION_MISMATCH,
                    format!(
                        "client speaks protocol {}, companion speaks {PROTO_SCHEMA_VERSION}",
                        frame.hello.proto_schema_version
                    ),
                )
            };
            write_frame_async(&mut writer, &FrameResponse::new(VERSION, response)).await?;
            if shutdown {
                break;
            }
        }
        info!(cached = self.cache.len(), "companion stopped");
        Ok(())
    }

    /// Answer one request.
    pub async fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::Ping { nonce } => Response::pong(nonce),
            Request::Shutdown => Response::ShutdownAck,
            Request::Compile {
                id,
                path,
                source,
                options,
            } => self.compile(id, &path, source, options).await,
        }
    }

    async fn compile(
        &mut self,
        id: u64,
        path: &Path,
        source: Option<String>,
        options: CompileOptions,
    ) -> Response {
        let text = match &source {
            Some(text) => text.clone(),
            None => match tokio::fs::read_to_string(path).await {
                Ok(text) => text,
                Err(e) => {
                    return Response::error(
                        codes::SOURCE_NOT_FOUND,
                        format!("cannot read {}: {e}", path.display()),
                    )
                }
            },
        };
        let options_json = match serde_json::to_vec(&options) {
            Ok(json) => json,
            Err(e) => return Response::error(codes::INVALID_REQUEST, e.to_string()),
        };
        let fingerprint = match src_fingerprint(&options).await {
            Ok(fingerprint) => fingerprint,
            Err(e) => return Response::error(codes::INVALID_REQUEST, e),
        };
        let key = blake3_parts(&[text.as_bytes(), &options_json, fingerprint.as_bytes()]);

        if let Some((cached_key, hit)) = self.cache.get(path) {
            if *cached_key == key {
                debug!(path = %path.display(), "companion cache hit");
                return compiled(id, hit.clone(), true);
            }
        }

        let mut request = CompileRequest::new(path, options);
        if let Some(source) = source {
            request = request.with_source(source);
        }
        match self.invoker.invoke(request).await {
            Ok(output) => {
                self.cache.insert(path.to_path_buf(), (key, output.clone()));
                compiled(id, output, false)
            }
            Err(e) => {
                warn!(path = %path.display(), code = e.code, "compile failed");
                Response::Failed {
                    id,
                    message: e.message,
                    diagnostics: e.diagnostics,
                }
            }
        }
    }
}

fn compiled(id: u64, output: CompileOutput, from_cache: bool) -> Response {
    Response::Compiled {
        id,
        compiled_output: output.code,
        diagnostics: output.diagnostics,
        source_map: output.source_map,
        output_path: output.output_path,
        from_cache,
    }
}

/// BLAKE3 over the path and content of every file the `src` globs match.
async fn src_fingerprint(options: &CompileOptions) -> Result<String, String> {
    if options.src.is_empty() {
        return Ok(String::new());
    }
    let patterns = options.src.clone();
    let cwd = match &options.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir().map_err(|e| e.to_string())?,
    };
    tokio::task::spawn_blocking(move || {
        let files = expand_src(&patterns, &cwd).map_err(|e| e.message)?;
        let mut parts = Vec::with_capacity(files.len() * 2);
        for file in &files {
            let digest = blake3_file(file)
                .map_err(|e| format!("cannot read {}: {e}", file.display()))?;
            parts.push(file.to_string_lossy().into_owned());
            parts.push(digest);
        }
        let parts: Vec<&[u8]> = parts.iter().map(String::as_bytes).collect();
        Ok(blake3_parts(&parts))
    })
    .await
    .map_err(|e| e.to_string())?
}

/// Serve the companion protocol on this process's stdin and stdout.
pub async fn serve_stdio(invoker: Arc<dyn CompilerInvoker>) -> io::Result<()> {
    CompanionServer::new(invoker)
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrypack_core::compiler::CompilerError;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    impl CompilerInvoker for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn invoke(
            &self,
            request: CompileRequest,
        ) -> BoxFuture<'_, Result<CompileOutput, CompilerError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let text = request.source.unwrap_or_default();
                if text.contains("error") {
                    return Err(CompilerError::compilation("Compilation failed"));
                }
                Ok(CompileOutput {
                    code: format!("// compiled\n{text}"),
                    ..CompileOutput::default()
                })
            })
        }
    }

    fn compile(id: u64, source: &str) -> Request {
        Request::Compile {
            id,
            path: "/p/src/Main.purs".into(),
            source: Some(source.to_string()),
            options: CompileOptions::new("purs"),
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_compiler() {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let mut server = CompanionServer::new(echo.clone());

        let first = server.handle(compile(1, "module Main where")).await;
        let second = server.handle(compile(2, "module Main where")).await;
        let changed = server.handle(compile(3, "module Main where\nx = 1")).await;

        assert!(matches!(first, Response::Compiled { id: 1, from_cache: false, .. }));
        assert!(matches!(second, Response::Compiled { id: 2, from_cache: true, .. }));
        assert!(matches!(changed, Response::Compiled { from_cache: false, .. }));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
        // Only the newest result for a path is kept.
        assert_eq!(server.cached(), 1);

        let back = server.handle(compile(4, "module Main where")).await;
        assert!(matches!(back, Response::Compiled { from_cache: false, .. }));
    }

    #[tokio::test]
    async fn test_edit_elsewhere_in_src_set_misses() {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/Main.purs"), "module Main where\nimport Dep").unwrap();
        std::fs::write(root.join("src/Dep.purs"), "module Dep where\nx = 1").unwrap();

        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let mut server = CompanionServer::new(echo.clone());
        let request = |id| {
            let mut options = CompileOptions::new("purs");
            options.cwd = Some(root.clone());
            options.src = vec!["src/**/*.purs".into()];
            Request::Compile {
                id,
                path: root.join("src/Main.purs"),
                source: Some("module Main where\nimport Dep".into()),
                options,
            }
        };

        let first = server.handle(request(1)).await;
        let again = server.handle(request(2)).await;
        std::fs::write(root.join("src/Dep.purs"), "module Dep where\nx = 2").unwrap();
        let after_edit = server.handle(request(3)).await;

        assert!(matches!(first, Response::Compiled { from_cache: false, .. }));
        assert!(matches!(again, Response::Compiled { from_cache: true, .. }));
        assert!(matches!(after_edit, Response::Compiled { from_cache: false, .. }));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
        assert_eq!(server.cached(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let mut server = CompanionServer::new(echo.clone());
        for id in 1..=2 {
            let response = server.handle(compile(id, "type error")).await;
            assert!(matches!(response, Response::Failed { .. }));
        }
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_protocol_error() {
        let mut server = CompanionServer::new(Arc::new(Echo {
            calls: AtomicUsize::new(0),
        }));
        let response = server
            .handle(Request::Compile {
                id: 1,
                path: "/definitely/not/here.purs".into(),
                source: None,
                options: CompileOptions::new("purs"),
            })
            .await;
        match response {
            Response::Error { code, .. } => assert_eq!(code, codes::SOURCE_NOT_FOUND),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_serve_over_stream() {
        let (client, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let server = CompanionServer::new(Arc::new(Echo {
            calls: AtomicUsize::new(0),
        }));
        let handle = tokio::spawn(server.serve(server_read, server_write));

        let (mut read, mut write) = tokio::io::split(client);
        write_frame_async(&mut write, &Frame::new("test", Request::Ping { nonce: 7 }))
            .await
            .unwrap();
        let pong: FrameResponse = read_frame_async(&mut read).await.unwrap().unwrap();
        assert!(matches!(pong.response, Response::Pong { nonce: 7, .. }));
        assert_eq!(pong.hello.proto_schema_version, PROTO_SCHEMA_VERSION);

        let mut stale = Frame::new("test", Request::Ping { nonce: 8 });
        stale.hello.proto_schema_version = PROTO_SCHEMA_VERSION + 1;
        write_frame_async(&mut write, &stale).await.unwrap();
        let reply: FrameResponse = read_frame_async(&mut read).await.unwrap().unwrap();
        assert!(matches!(reply.response, Response::Error { .. }));

        write_frame_async(&mut write, &Frame::new("test", Request::Shutdown))
            .await
            .unwrap();
        let ack: FrameResponse = read_frame_async(&mut read).await.unwrap().unwrap();
        assert!(matches!(ack.response, Response::ShutdownAck));
        handle.await.unwrap().unwrap();
    }
}
