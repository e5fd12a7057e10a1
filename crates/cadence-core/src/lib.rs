//! `cadence-core`: shared foundations for the Cadence workspace.
//!
//! - [`node`]: the node tree jobs and scripts are expressed in
//! - [`config`]: layered configuration (TOML + `CADENCE_*` env)
//! - [`error`]: the workspace-wide error type

pub mod config;
pub mod error;
pub mod node;

pub use error::{CadenceError, Result};
pub use node::{Node, Value};
