//! Page backends.
//!
//! The CDP backend is feature-gated so the engine, its controllers and the
//! test suite build without a browser toolchain.

#[cfg(feature = "cdp")]
pub mod cdp;
