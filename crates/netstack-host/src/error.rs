//! Error types for the host binary.

use netstack_core::StackError;

/// Errors that can occur while building and running a host stack.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("stack error: {0}")]
    Stack(#[from] StackError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
