//! Helpers shared by the unit tests of all modules.
mod common;
mod fake_sb;

pub use common::*;
pub use fake_sb::*;
