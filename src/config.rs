//! Build-time configuration constants.
//!
//! Generated by `build.rs` from `epochalloc.toml` (or the file named by the
//! `EPOCHALLOC_CONFIG` environment variable).

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
