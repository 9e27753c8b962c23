//! Download Wikimedia database dumps.
//!
//! The pieces run in this order: [`dump::manifest`] fetches the dump status
//! documents, [`dump::select`] chooses files and plans tasks, and
//! [`dump::engine`] transfers them, checking each file with [`dump::verify`]
//! and emitting events to [`progress`].

// These sub-modules are imported first to import their macros.
#[macro_use]
mod lazy_regex;
pub mod util;

// The rest of these sub-modules are in alphabetical order.
pub mod dump;
mod file_pattern;
pub mod http;
pub mod progress;

pub use file_pattern::FilePattern;

pub type Error = anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;
