//! CLI command implementations for gsync.
//!
//! This module contains all subcommand implementations for the gsync CLI
//! tool. Each module corresponds to a specific command available to users.

pub mod cleanup;
pub mod doctor;
pub mod failed;
pub mod status;
pub mod sync;
