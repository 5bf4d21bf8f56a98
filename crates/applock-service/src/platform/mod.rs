//! Window-system backends.
//!
//! Native integrations plug in here by implementing the contracts in
//! [`crate::desktop`]. The console backend simulates a desktop on stdin so
//! the whole enforcement flow can run headless.

pub mod console;

pub use console::{ConsoleDesktop, ConsoleProcess};
