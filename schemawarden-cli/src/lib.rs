//! Schemawarden CLI library
//!
//! The `schemawarden` binary (main.rs) is a thin dispatcher over these commands.

pub mod commands;
