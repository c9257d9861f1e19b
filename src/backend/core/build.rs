//! Build script for Greenlight Core
//!
//! Stamps the binary with a version string. An explicit `GREENLIGHT_VERSION`
//! wins; otherwise the version is derived from the git commit time and
//! revision, with a `-dirty` suffix for uncommitted changes.

use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim().to_string())
}

fn main() {
    let version = match std::env::var("GREENLIGHT_VERSION") {
        Ok(explicit) if !explicit.is_empty() => explicit,
        _ => {
            let revision = git(&["rev-parse", "HEAD"]);
            let time = git(&["log", "-1", "--format=%cI"]);
            let dirty = git(&["status", "--porcelain"])
                .map(|status| !status.is_empty())
                .unwrap_or(false);

            match (time, revision) {
                (Some(time), Some(revision)) if dirty => format!("{}-{}-dirty", time, revision),
                (Some(time), Some(revision)) => format!("{}-{}", time, revision),
                _ => std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "unknown".to_string()),
            }
        }
    };

    println!("cargo:rustc-env=GREENLIGHT_BUILD_VERSION={}", version);
    println!("cargo:rerun-if-env-changed=GREENLIGHT_VERSION");
    println!("cargo:rerun-if-changed=build.rs");
}
