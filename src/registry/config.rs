//! Registry configuration

use crate::protocol::constants::DEFAULT_DELIVERY_CAPACITY;

/// Configuration for the session registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of each per-connection delivery queue
    ///
    /// Events published while a queue is full are dropped for that
    /// recipient only.
    pub delivery_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
        }
    }
}

impl RegistryConfig {
    /// Set the delivery queue capacity (minimum 1)
    pub fn delivery_capacity(mut self, capacity: usize) -> Self {
        self.delivery_capacity = capacity.max(1);
        self
    }
}
