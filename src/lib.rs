//! bothost: runs user-supplied Discord bots, each in its own sandboxed
//! interpreter, behind a single host process.

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod safety;
pub mod sandbox;

pub use config::Config;
pub use error::{Error, Result};
