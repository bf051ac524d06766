//! Domain layer - Core SAN types and port definitions
//!
//! Addresses and capabilities are the shared vocabulary of the topology;
//! the traits in [`ports`] are the boundaries that vendor drivers and host
//! fact providers implement.

pub mod address;
pub mod capability;
pub mod ports;

pub use address::{Address, AddressKind};
pub use capability::{Capability, CapabilityScope, CapabilitySet, DeviceCapabilities};
pub use ports::*;
