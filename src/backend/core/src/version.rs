//! Build version, stamped by `build.rs`.

/// Commit time and revision of the build, or an explicit `GREENLIGHT_VERSION`.
pub const BUILD_VERSION: &str = env!("GREENLIGHT_BUILD_VERSION");

/// Crate version from `Cargo.toml`.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
