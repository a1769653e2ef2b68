// Build script for ferrypack-core.
// Stamps the git revision into `version_string()` when building from a checkout.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=FERRYPACK_BUILD_GIT_HASH");
    if std::env::var_os("FERRYPACK_BUILD_GIT_HASH").is_some() {
        return;
    }

    let output = Command::new("git")
        .args(["rev-parse", "--short=10", "HEAD"])
        .output();
    if let Ok(output) = output {
        if output.status.success() {
            let hash = String::from_utf8_lossy(&output.stdout);
            let hash = hash.trim();
            if !hash.is_empty() {
                println!("cargo:rustc-env=FERRYPACK_BUILD_GIT_HASH={hash}");
            }
        }
    }
}
