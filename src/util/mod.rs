//! Helpers shared by the backends and actions.

pub mod command;
pub mod linktree;
pub mod lock;
pub mod logging;
pub mod retention;
pub mod step;
