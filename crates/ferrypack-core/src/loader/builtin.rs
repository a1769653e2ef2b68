//! Loaders shipped with ferrypack.

use super::{Loader, LoaderContext, LoaderOutput};
use crate::compiler::{CompileRequest, CompilerInvoker, CompilerSettings};
use crate::Error;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Hands the module to the external compiler.
pub struct CompilerLoader {
    direct: Arc<dyn CompilerInvoker>,
    companion: Option<Arc<dyn CompilerInvoker>>,
}

impl CompilerLoader {
    #[must_use]
    pub fn new(
        direct: Arc<dyn CompilerInvoker>,
        companion: Option<Arc<dyn CompilerInvoker>>,
    ) -> Self {
        Self { direct, companion }
    }

    async fn compile(&self, ctx: &LoaderContext, input: String) -> Result<LoaderOutput, Error> {
        let settings = CompilerSettings::from_options(&ctx.options, &ctx.root)?;
        let invoker = match (&self.companion, settings.companion) {
            (Some(companion), true) => companion,
            _ => &self.direct,
        };

        let mut request = CompileRequest::new(&ctx.path, settings.options);
        if ctx.stage_index > 0 && input.as_str() != &*ctx.raw_content {
            request = request.with_source(input);
        }

        let output = invoker.invoke(request).await?;
        Ok(LoaderOutput {
            code: output.code,
            source_map: output.source_map,
            emitted_path: output.output_path,
            warnings: output.diagnostics,
        })
    }
}

impl Loader for CompilerLoader {
    fn run<'a>(
        &'a self,
        ctx: &'a LoaderContext,
        input: String,
    ) -> BoxFuture<'a, Result<LoaderOutput, Error>> {
        Box::pin(self.compile(ctx, input))
    }
}

/// Exposes a JSON document as the module's exports.
///
/// The document text is kept as written so its lines stay where they were.
pub struct JsonLoader;

impl Loader for JsonLoader {
    fn run<'a>(
        &'a self,
        ctx: &'a LoaderContext,
        input: String,
    ) -> BoxFuture<'a, Result<LoaderOutput, Error>> {
        Box::pin(async move {
            serde_json::from_str::<serde_json::Value>(&input).map_err(|e| {
                Error::other(format!("invalid JSON in {}: {e}", ctx.path.display()))
            })?;
            Ok(LoaderOutput::code(format!(
                "module.exports = {};\n",
                input.trim()
            )))
        })
    }
}

/// Exposes the file content as a string.
pub struct RawLoader;

impl Loader for RawLoader {
    fn run<'a>(
        &'a self,
        _ctx: &'a LoaderContext,
        input: String,
    ) -> BoxFuture<'a, Result<LoaderOutput, Error>> {
        Box::pin(async move {
            let literal = serde_json::to_string(&input).map_err(|e| Error::other(e.to_string()))?;
            Ok(LoaderOutput::code(format!("module.exports = {literal};\n")))
        })
    }
}
