//! Implementation of the blockwise CLI commands.

pub mod config;
pub mod plan;
pub mod run;
pub mod status;
pub mod worker;
