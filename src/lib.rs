//! The blockwise command line tool.
//!
//! This crate wires the execution engine in `blockwise-engine` to a command
//! line interface and provides the built-in tasks.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod commands;
pub mod config;
pub mod tasks;

pub use tasks::registry;
