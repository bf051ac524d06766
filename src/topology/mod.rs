//! SAN Topology Configuration
//!
//! Loads the section based SAN topology file, scopes it to the addresses a
//! caller cares about and resolves addresses to the devices owning them.

pub mod device;
pub mod ini;
pub mod loader;
pub mod resolver;
pub mod san;

pub use device::{
    DeviceKind, DeviceRecord, DriverKey, IscsiHostConfig, IscsiIface, PhysicalTopology,
};
pub use ini::RawConfig;
pub use loader::{DeviceError, SanConfig};
pub use resolver::{normalize, PortOwner, PortResolver};
pub use san::{
    AddressSets, AttachedArray, AttachedDevice, AttachedPhySwitch, AttachedSwitch,
    DegradedDevice, LoadReport, SanTopology, TopologyView,
};
