//! Shared configuration store
//!
//! The single live [`ProtocolConfig`] of a process. Every read and write goes
//! through one lock so a reader never sees half of an update. The guard never
//! leaves this module, which keeps it from being held across I/O.

use parking_lot::Mutex;

use crate::contracts::ProtocolConfig;

#[derive(Debug, Default)]
pub struct ConfigStore {
    current: Mutex<ProtocolConfig>,
}

impl ConfigStore {
    pub fn new(initial: ProtocolConfig) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> ProtocolConfig {
        *self.current.lock()
    }

    /// Overwrite all fields at once, returning the previous values
    pub fn apply(&self, update: ProtocolConfig) -> ProtocolConfig {
        let mut current = self.current.lock();
        std::mem::replace(&mut *current, update)
    }
}
