//! Constrained execution of bot code.
//!
//! Each instance gets its own interpreter on its own thread; nothing from the
//! host process is reachable except the bindings in [`environment::BINDINGS`].

mod engine;
mod environment;

pub use engine::{ClientSource, Harvest, LaunchedScript, ScriptHandle, launch};
pub use environment::{
    BINDINGS, BotConsole, Environment, EnvironmentBuilder, LogLevel, TIMER_GLOBALS,
};
