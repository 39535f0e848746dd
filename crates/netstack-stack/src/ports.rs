//! The port manager collaborator.
//!
//! Port reservation internals live outside the core; the stack only needs a
//! handle that can report and adjust the ephemeral range.

use std::sync::RwLock;

use netstack_core::StackError;

/// First port of the default ephemeral range.
pub const FIRST_EPHEMERAL: u16 = 16000;

/// Delegate managing the ephemeral port range.
pub trait PortManager: Send + Sync {
    /// The inclusive ephemeral port range.
    fn port_range(&self) -> (u16, u16);

    /// Set the inclusive ephemeral port range.
    fn set_port_range(&self, start: u16, end: u16) -> Result<(), StackError>;
}

/// The default port manager: a validated range, nothing more.
pub struct EphemeralPortManager {
    range: RwLock<(u16, u16)>,
}

impl EphemeralPortManager {
    pub fn new() -> Self {
        Self {
            range: RwLock::new((FIRST_EPHEMERAL, u16::MAX)),
        }
    }
}

impl Default for EphemeralPortManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PortManager for EphemeralPortManager {
    fn port_range(&self) -> (u16, u16) {
        *self.range.read().unwrap()
    }

    fn set_port_range(&self, start: u16, end: u16) -> Result<(), StackError> {
        if start == 0 || start > end {
            return Err(StackError::InvalidPortRange);
        }
        *self.range.write().unwrap() = (start, end);
        Ok(())
    }
}
