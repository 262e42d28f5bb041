//! Durable change-stream sync into semantic search backends.
//!
//! Reads file-change records from a line stream, resolves content into a
//! size-tiered document form, and indexes batches into an external backend
//! with checkpointed exactly-once-effective delivery.

pub mod checkpoint;
pub mod cmd;
pub mod config;
pub mod embed;
pub mod error;
pub mod index;
pub mod resolve;
pub mod retry;
pub mod stream;
pub mod sync;
pub mod types;
pub mod util;

pub use error::{Error, Result};
