//! Vidcap - command-line front end for the capture proxy.
//!
//! The binary lives in `main.rs`; this crate only exposes the pieces it
//! shares with tests.

pub mod captures;

pub use captures::{destination_for, watch_new_assets};
