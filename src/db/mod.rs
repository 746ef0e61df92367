//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `hubcast::db`; the repository API and
//! commonly used models are re-exported here.

pub mod model;
pub mod repo;

pub use model::{DispatchGroupRow, GroupStatusRow, MessageRow};
pub use repo::*;
