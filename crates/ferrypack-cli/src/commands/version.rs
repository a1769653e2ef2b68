use ferrypack_core::version::version_string;
use ferrypack_core::VERSION;
use miette::{IntoDiagnostic, Result};

pub fn run(json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({ "name": "ferrypack", "version": VERSION });
        println!("{}", serde_json::to_string(&out).into_diagnostic()?);
    } else {
        println!("{}", version_string());
    }
    Ok(())
}
