//! Wikimedia database dumps: status manifests, file selection and downloads.

pub mod engine;
pub mod local;
pub mod manifest;
pub mod select;
pub mod verify;

mod types;
pub use types::*;

/// The server the metadata documents are always fetched from.
pub const DUMPS_WIKIMEDIA_SERVER: &str = "https://dumps.wikimedia.org";
