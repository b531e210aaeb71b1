//! Logging Setup
//!
//! One-call tracing initialization for binaries and integration tests.
//! The crate itself only emits `tracing` events; how they are rendered
//! is the embedder's choice, and this helper is merely the convenient
//! default.

/// Install a formatted `tracing` subscriber honoring `RUST_LOG`.
///
/// Defaults this crate to `info` when no directive is given. Safe to
/// call more than once; later calls are no-ops.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("collab_core=info".parse().expect("static directive parses"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
