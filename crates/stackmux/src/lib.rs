//! # stackmux
//!
//! Process supervision and output multiplexing for multi-project dev
//! environments.
//!
//! Commands are grouped by project into a [`RunConfiguration`]. Each command
//! runs as a [`RunUnit`] under its own pseudo-terminal, and the
//! [`Multiplexer`] drains every live unit into one console stream:
//!
//! ```text
//! [api] - Listening on http://localhost:3000
//! [web] - ready in 412ms
//! ```
//!
//! Stopping a unit signals its whole process tree, waits out a grace window
//! and escalates to `SIGKILL` (see [`Termination`]).

pub mod config;
pub mod error;
pub mod group;
pub mod multiplexer;
pub mod style;
pub mod terminate;
pub mod tree;
pub mod unit;
pub mod watcher;

pub use config::{AssemblyOptions, Absorbed, GroupSnapshot, RunConfiguration, Snapshot};
pub use error::Error;
pub use group::{Node, ProcessGroup, ProjectBundle, SetupPolicy};
pub use multiplexer::{Emission, Filter, LineSink, Multiplexer, Settings};
pub use style::{Plain, Style, Styled};
pub use terminate::{is_alive, Termination, TerminationReport};
pub use unit::{ReadOutcome, RunUnit, Runtime, Shell, UnitOutput};
pub use watcher::{ShutdownTrigger, ShutdownWatcher};
