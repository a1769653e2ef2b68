//! `ferrypack companion` command implementation.
//!
//! Started by a build session as a child process; speaks the frame protocol
//! on stdin/stdout, so nothing else may be printed to stdout here.

use ferrypack_core::compiler::{CompilerInvoker, DirectInvoker};
use miette::{IntoDiagnostic, Result};
use std::sync::Arc;

pub fn run() -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    let invoker: Arc<dyn CompilerInvoker> = Arc::new(DirectInvoker::new());
    let served = runtime.block_on(ferrypack_server::companion::serve_stdio(invoker));
    // A blocking stdin read may still be parked after Shutdown.
    runtime.shutdown_background();
    served.into_diagnostic()
}
