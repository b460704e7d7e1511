//! Subcommand implementations.

pub mod sign;
