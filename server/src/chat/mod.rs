//! Chat history: the on-disk record format and the append-only log store.

pub mod log;
pub mod record;

pub use log::{LogError, MessageLog};
pub use record::ChatMessage;
