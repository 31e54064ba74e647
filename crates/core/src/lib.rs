#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models, task-selection policy and frontend client for the dist-git
//! importer daemon and its per-task agents.

pub mod api;
pub mod config;
pub mod filters;
pub mod frontend;
pub mod model;

mod util;

pub use util::{new_ulid, now_ms};
