//! Convenience facades built on top of [`pdip`] (`# 4.5`): an in-process
//! background-shell `system()` replacement and a thin network client to
//! the `rsystemd` dispatcher. Both are library functions, not CLIs — the
//! standalone `pdip(1)` interpreter is out of scope.

mod error;
mod isystem;
mod rsystem;

pub use error::{FacadeError, Result};
pub use isystem::{isystem, reinitialize};
pub use rsystem::rsystem;
