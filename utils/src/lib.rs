//! Utility libraries used by the profile service crates.

pub mod at_command_parser;
pub mod cod;
