//! `ferrypack dev` command implementation.
//!
//! Builds the bundle, serves it from memory and rebuilds on every debounced
//! batch of source changes until Ctrl+C.

use super::ProjectArgs;
use ferrypack_core::{BuildOptions, BuildSession};
use ferrypack_server::DevServer;
use miette::{IntoDiagnostic, Result, WrapErr};
use tokio::net::TcpListener;
use tokio::signal;

/// Dev server action.
#[derive(Debug, Clone)]
pub struct DevAction {
    pub project: ProjectArgs,
    /// `--port` override.
    pub port: Option<u16>,
    /// `--host` override.
    pub host: Option<String>,
    pub strict_loaders: bool,
}

pub fn run(action: DevAction) -> Result<()> {
    let mut project = action.project.load()?;
    if let Some(port) = action.port {
        project = project.with_port(port);
    }
    if let Some(host) = action.host {
        project.dev_server.host = host;
    }
    let options = BuildOptions {
        require_transform: action.strict_loaders,
    };

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(async move {
        let addr = format!("{}:{}", project.dev_server.host, project.dev_server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("cannot listen on {addr}"))?;

        let session = BuildSession::new(project, options).into_diagnostic()?;
        let server = DevServer::new(session);

        eprintln!("  Press Ctrl+C to stop");
        server
            .run(listener, async {
                let _ = signal::ctrl_c().await;
            })
            .await
            .into_diagnostic()
    })
}
