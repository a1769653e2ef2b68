//! Compiler requests served by a long-lived companion process.
//!
//! A single supervisor task owns the connection. Requests reach it through
//! an mpsc queue and are answered one at a time over the `ferrypack-proto`
//! frame protocol. The supervisor:
//!
//! - health-checks every fresh connection with a `Ping` carrying a nonce
//!   before sending it any work;
//! - restarts the companion when the connection breaks and retries the
//!   request that was in flight, up to `max_restarts` restarts in total;
//! - once the budget is spent, or whenever the companion cannot serve a
//!   request, answers `Unavailable` and the invoker runs the fallback.

use super::{CompileOutput, CompileRequest, CompilerError, CompilerInvoker};
use crate::version::VERSION;
use ferrypack_proto::{
    read_frame_async, write_frame_async, Frame, FrameResponse, Request, Response,
    PROTO_SCHEMA_VERSION,
};
use futures::future::BoxFuture;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Byte streams to and from a companion.
pub struct CompanionConnection {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Process behind the streams; killed when the connection is dropped.
    pub child: Option<tokio::process::Child>,
}

impl CompanionConnection {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }
}

/// Opens connections to a companion.
pub trait CompanionConnector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, io::Result<CompanionConnection>>;
}

/// Starts the companion as a child process speaking the protocol on stdio.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessConnector {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `<this executable> companion`.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, vec!["companion".to_string()]))
    }
}

impl CompanionConnector for ProcessConnector {
    fn connect(&self) -> BoxFuture<'_, io::Result<CompanionConnection>> {
        Box::pin(async move {
            let mut child = tokio::process::Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| io::Error::other("failed to capture companion stdin"))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| io::Error::other("failed to capture companion stdout"))?;
            debug!(pid = child.id().unwrap_or(0), "spawned compiler companion");

            let mut conn = CompanionConnection::new(stdout, stdin);
            conn.child = Some(child);
            Ok(conn)
        })
    }
}

/// Supervision limits.
#[derive(Debug, Clone)]
pub struct CompanionPolicy {
    /// Restarts allowed after the first start before giving up for good.
    pub max_restarts: u32,
    pub health_timeout: Duration,
    pub request_timeout: Duration,
    pub queue_depth: usize,
}

impl Default for CompanionPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            health_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            queue_depth: 64,
        }
    }
}

enum Outcome {
    Done(Result<CompileOutput, CompilerError>),
    Unavailable(String),
}

struct Job {
    request: CompileRequest,
    reply: oneshot::Sender<Outcome>,
}

/// Compiler invoker backed by a supervised companion process.
pub struct CompanionInvoker {
    tx: mpsc::Sender<Job>,
    fallback: Arc<dyn CompilerInvoker>,
}

impl CompanionInvoker {
    /// Start the supervisor task. Must be called within a tokio runtime.
    pub fn spawn(
        connector: impl CompanionConnector,
        policy: CompanionPolicy,
        fallback: Arc<dyn CompilerInvoker>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(policy.queue_depth.max(1));
        let supervisor = Supervisor {
            connector,
            policy,
            conn: None,
            starts: 0,
            next_nonce: 1,
            next_id: 1,
            gave_up: false,
        };
        tokio::spawn(supervisor.run(rx));
        Self { tx, fallback }
    }

    async fn run(&self, request: CompileRequest) -> Result<CompileOutput, CompilerError> {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            request: request.clone(),
            reply,
        };
        let reason = if self.tx.send(job).await.is_err() {
            "companion supervisor stopped".to_string()
        } else {
            match rx.await {
                Ok(Outcome::Done(result)) => return result,
                Ok(Outcome::Unavailable(reason)) => reason,
                Err(_) => "companion supervisor dropped the request".to_string(),
            }
        };
        debug!(path = %request.path.display(), %reason, "falling back to {}", self.fallback.name());
        self.fallback.invoke(request).await
    }
}

impl CompilerInvoker for CompanionInvoker {
    fn name(&self) -> &'static str {
        "companion"
    }

    fn invoke(&self, request: CompileRequest) -> BoxFuture<'_, Result<CompileOutput, CompilerError>> {
        Box::pin(self.run(request))
    }
}

struct Supervisor<C> {
    connector: C,
    policy: CompanionPolicy,
    conn: Option<CompanionConnection>,
    starts: u32,
    next_nonce: u64,
    next_id: u64,
    gave_up: bool,
}

impl<C: CompanionConnector> Supervisor<C> {
    async fn run(mut self, mut rx: mpsc::Receiver<Job>) {
        while let Some(job) = rx.recv().await {
            let outcome = self.serve(&job.request).await;
            // The requester may have been cancelled; nothing to do then.
            let _ = job.reply.send(outcome);
        }
        if let Some(mut conn) = self.conn.take() {
            let frame = Frame::new(VERSION, Request::Shutdown);
            let _ = tokio::time::timeout(
                Duration::from_secs(1),
                write_frame_async(&mut conn.writer, &frame),
            )
            .await;
        }
        debug!("companion supervisor stopped");
    }

    fn budget_left(&self) -> bool {
        self.starts <= self.policy.max_restarts
    }

    async fn serve(&mut self, request: &CompileRequest) -> Outcome {
        loop {
            if self.gave_up {
                return Outcome::Unavailable("companion restart budget exhausted".into());
            }

            if self.conn.is_none() {
                if !self.budget_left() {
                    warn!(
                        restarts = self.policy.max_restarts,
                        "compiler companion keeps failing; using direct compilation from now on"
                    );
                    self.gave_up = true;
                    continue;
                }
                self.starts += 1;
                match self.start().await {
                    Ok(conn) => {
                        if self.starts > 1 {
                            info!(restart = self.starts - 1, "compiler companion restarted");
                        }
                        self.conn = Some(conn);
                    }
                    Err(e) => {
                        warn!(error = %e, "compiler companion failed to start");
                        continue;
                    }
                }
            }

            let Some(conn) = self.conn.as_mut() else {
                continue;
            };
            let id = self.next_id;
            self.next_id += 1;
            match exchange(conn, id, request, self.policy.request_timeout).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    warn!(error = %e, path = %request.path.display(), "compiler companion connection lost");
                    self.conn = None;
                }
            }
        }
    }

    /// Connect and verify the companion answers a ping with our nonce.
    async fn start(&mut self) -> io::Result<CompanionConnection> {
        let mut conn = self.connector.connect().await?;
        let nonce = self.next_nonce;
        self.next_nonce += 1;

        let check = async {
            write_frame_async(&mut conn.writer, &Frame::new(VERSION, Request::Ping { nonce }))
                .await?;
            let reply: Option<FrameResponse> = read_frame_async(&mut conn.reader).await?;
            match reply {
                Some(frame) if frame.hello.proto_schema_version != PROTO_SCHEMA_VERSION => {
                    Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "companion speaks protocol {}, expected {PROTO_SCHEMA_VERSION}",
                            frame.hello.proto_schema_version
                        ),
                    ))
                }
                Some(FrameResponse {
                    response: Response::Pong { nonce: got, .. },
                    ..
                }) if got == nonce => Ok(()),
                Some(other) => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected health check reply: {:?}", other.response),
                )),
                None => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "companion closed the connection during health check",
                )),
            }
        };

        tokio::time::timeout(self.policy.health_timeout, check)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "companion health check timed out"))??;
        Ok(conn)
    }
}

/// Send one compile request and wait for its answer. An `Err` means the
/// connection is no longer usable.
async fn exchange(
    conn: &mut CompanionConnection,
    id: u64,
    request: &CompileRequest,
    timeout: Duration,
) -> io::Result<Outcome> {
    let frame = Frame::new(
        VERSION,
        Request::Compile {
            id,
            path: request.path.clone(),
            source: request.source.clone(),
            options: request.options.clone(),
        },
    );

    let round_trip = async {
        write_frame_async(&mut conn.writer, &frame).await?;
        read_frame_async::<_, FrameResponse>(&mut conn.reader).await
    };
    let reply = tokio::time::timeout(timeout, round_trip)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "companion request timed out"))??
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "companion exited"))?;

    match reply.response {
        Response::Compiled {
            id: got,
            compiled_output,
            diagnostics,
            source_map,
            output_path,
            from_cache,
        } if got == id => Ok(Outcome::Done(Ok(CompileOutput {
            code: compiled_output,
            source_map,
            output_path,
            diagnostics,
            from_cache,
        }))),
        Response::Failed {
            id: got,
            message,
            diagnostics,
        } if got == id => Ok(Outcome::Done(Err(
            CompilerError::compilation(message).with_diagnostics(diagnostics),
        ))),
        Response::Error { code, message } => {
            Ok(Outcome::Unavailable(format!("companion error {code}: {message}")))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected companion reply to request {id}: {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrypack_proto::{codes, CompileOptions, Diagnostic};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// How the fake companion behaves on each connection.
    #[derive(Clone, Copy)]
    enum Behavior {
        /// Answer every compile request.
        Healthy,
        /// Close the stream on the first compile request.
        CrashOnCompile,
        /// Answer pings with the wrong nonce.
        BadPong,
        /// Refuse to connect at all.
        Refuse,
    }

    struct FakeConnector {
        plan: Mutex<Vec<Behavior>>,
        connects: Arc<AtomicU32>,
    }

    impl FakeConnector {
        /// Connection `n` follows `plan[n]`; the last entry repeats.
        fn new(plan: Vec<Behavior>) -> (Self, Arc<AtomicU32>) {
            let connects = Arc::new(AtomicU32::new(0));
            (
                Self {
                    plan: Mutex::new(plan),
                    connects: connects.clone(),
                },
                connects,
            )
        }
    }

    impl CompanionConnector for FakeConnector {
        fn connect(&self) -> BoxFuture<'_, io::Result<CompanionConnection>> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) as usize;
            let behavior = {
                let plan = self.plan.lock().unwrap();
                plan[n.min(plan.len() - 1)]
            };
            Box::pin(async move {
                if matches!(behavior, Behavior::Refuse) {
                    return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
                }
                let (client, server) = tokio::io::duplex(64 * 1024);
                tokio::spawn(fake_companion(server, behavior));
                let (reader, writer) = tokio::io::split(client);
                Ok(CompanionConnection::new(reader, writer))
            })
        }
    }

    async fn fake_companion(stream: DuplexStream, behavior: Behavior) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        while let Ok(Some(frame)) = read_frame_async::<_, Frame>(&mut reader).await {
            let response = match frame.request {
                Request::Ping { nonce } => match behavior {
                    Behavior::BadPong => Response::pong(nonce + 100),
                    _ => Response::pong(nonce),
                },
                Request::Compile { id, path, source, .. } => match behavior {
                    Behavior::CrashOnCompile => return,
                    _ if path.ends_with("Bad.purs") => Response::Failed {
                        id,
                        message: "purs exited with status 1".into(),
                        diagnostics: vec![Diagnostic::error("Unknown value foo")],
                    },
                    _ if path.ends_with("Odd.purs") => {
                        Response::error(codes::INVALID_REQUEST, "cannot handle")
                    }
                    _ => Response::Compiled {
                        id,
                        compiled_output: format!(
                            "// companion\n{}",
                            source.unwrap_or_else(|| path.display().to_string())
                        ),
                        diagnostics: Vec::new(),
                        source_map: None,
                        output_path: None,
                        from_cache: false,
                    },
                },
                Request::Shutdown => Response::ShutdownAck,
            };
            let reply = FrameResponse::new("test", response);
            if write_frame_async(&mut writer, &reply).await.is_err() {
                return;
            }
        }
    }

    /// Fallback that records how often it ran.
    struct CountingFallback(AtomicU32);

    impl CompilerInvoker for CountingFallback {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn invoke(&self, request: CompileRequest) -> BoxFuture<'_, Result<CompileOutput, CompilerError>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Ok(CompileOutput {
                    code: format!("// direct\n{}", request.path.display()),
                    ..CompileOutput::default()
                })
            })
        }
    }

    fn request(path: &str) -> CompileRequest {
        CompileRequest::new(path, CompileOptions::new("purs"))
    }

    fn policy(max_restarts: u32) -> CompanionPolicy {
        CompanionPolicy {
            max_restarts,
            health_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            queue_depth: 8,
        }
    }

    #[tokio::test]
    async fn test_requests_served_over_one_connection() {
        let (connector, connects) = FakeConnector::new(vec![Behavior::Healthy]);
        let fallback = Arc::new(CountingFallback(AtomicU32::new(0)));
        let invoker = CompanionInvoker::spawn(connector, policy(3), fallback.clone());

        let a = invoker.invoke(request("/p/A.purs")).await.unwrap();
        let b = invoker
            .invoke(request("/p/B.purs").with_source("staged"))
            .await
            .unwrap();
        assert!(a.code.starts_with("// companion"));
        assert_eq!(b.code, "// companion\nstaged");
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_compilation_failure_is_not_a_fallback() {
        let (connector, _) = FakeConnector::new(vec![Behavior::Healthy]);
        let fallback = Arc::new(CountingFallback(AtomicU32::new(0)));
        let invoker = CompanionInvoker::spawn(connector, policy(3), fallback.clone());

        let err = invoker.invoke(request("/p/Bad.purs")).await.unwrap_err();
        assert_eq!(err.code, "COMPILATION_FAILED");
        assert_eq!(err.diagnostics.len(), 1);
        assert_eq!(fallback.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_crash_restarts_transparently() {
        let (connector, connects) =
            FakeConnector::new(vec![Behavior::CrashOnCompile, Behavior::Healthy]);
        let fallback = Arc::new(CountingFallback(AtomicU32::new(0)));
        let invoker = CompanionInvoker::spawn(connector, policy(3), fallback.clone());

        let out = invoker.invoke(request("/p/A.purs")).await.unwrap();
        assert!(out.code.starts_with("// companion"));
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(fallback.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhausted_budget_falls_back_for_good() {
        let (connector, connects) = FakeConnector::new(vec![Behavior::CrashOnCompile]);
        let fallback = Arc::new(CountingFallback(AtomicU32::new(0)));
        let invoker = CompanionInvoker::spawn(connector, policy(2), fallback.clone());

        let out = invoker.invoke(request("/p/A.purs")).await.unwrap();
        assert!(out.code.starts_with("// direct"));
        // First start plus two restarts.
        assert_eq!(connects.load(Ordering::SeqCst), 3);

        let out = invoker.invoke(request("/p/B.purs")).await.unwrap();
        assert!(out.code.starts_with("// direct"));
        assert_eq!(connects.load(Ordering::SeqCst), 3);
        assert_eq!(fallback.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_health_check_counts_against_budget() {
        let (connector, connects) =
            FakeConnector::new(vec![Behavior::BadPong, Behavior::Refuse, Behavior::Healthy]);
        let fallback = Arc::new(CountingFallback(AtomicU32::new(0)));
        let invoker = CompanionInvoker::spawn(connector, policy(2), fallback.clone());

        let out = invoker.invoke(request("/p/A.purs")).await.unwrap();
        assert!(out.code.starts_with("// companion"));
        assert_eq!(connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_protocol_error_uses_fallback_once() {
        let (connector, connects) = FakeConnector::new(vec![Behavior::Healthy]);
        let fallback = Arc::new(CountingFallback(AtomicU32::new(0)));
        let invoker = CompanionInvoker::spawn(connector, policy(3), fallback.clone());

        let out = invoker.invoke(request("/p/Odd.purs")).await.unwrap();
        assert!(out.code.starts_with("// direct"));
        let out = invoker.invoke(request("/p/A.purs")).await.unwrap();
        assert!(out.code.starts_with("// companion"));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }
}
