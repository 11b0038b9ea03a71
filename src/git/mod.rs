//! Git operations: shallow clones through the system `git` binary and
//! packaging a checkout into a downloadable archive.

pub mod archive;
pub mod commands;

pub use archive::{ArchiveBuilder, ArchiveError};
