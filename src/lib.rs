#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod checkpoint;
pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod process;
pub mod progress;
pub mod provider;
pub mod readiness;
pub mod registry;
pub mod secrets;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
