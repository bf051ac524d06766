//! SAN Topology - Lab SAN management layer
//!
//! Loads a declarative description of a lab storage area network (FC and
//! Ethernet switches, physical layer patch switches, storage arrays) and
//! lets test code act on the equipment serving a set of host and target
//! addresses without knowing which vendor device is involved.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           SAN Manager (facade)                               │
//! │      LUN lifecycle · link/port control · controller lifecycle · queries      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Config Loader  │  │  Port Resolver  │  │    Capability Registry      │  │
//! │  │  (INI + alias)  │  │ (addr -> owner) │  │  (device / per-port scope)  │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │      SanTopology      │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                         Driver Registry                                      │
//! │  ┌─────────────────┐  ┌────────┴────────┐  ┌─────────────────────────────┐  │
//! │  │    Switches     │  │  Phy Switches   │  │      Storage Arrays         │  │
//! │  │   (FC / Eth)    │  │    (patch)      │  │  (incl. target-per-LUN)     │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                 Host Facts (sysfs / static) · Multipath Selector             │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`domain`]: Addresses, capabilities and the driver/host traits
//! - [`topology`]: Config loading, scoping and address resolution
//! - [`drivers`]: Driver registry and the simulated lab drivers
//! - [`manager`]: The SAN Manager facade
//! - [`host`]: Local host fact providers
//! - [`multipath`]: Multipath device selection
//! - [`error`]: Error types and handling

pub mod domain;
pub mod drivers;
pub mod error;
pub mod host;
pub mod manager;
pub mod multipath;
pub mod size;
pub mod topology;

// Re-export commonly used types
pub use domain::address::{Address, AddressKind};
pub use domain::capability::{Capability, CapabilityScope, CapabilitySet};
pub use domain::ports::{
    ArrayDriver, ConnectMode, FlapSpec, HostFacts, LinkAction, LunInfo, MapInfo,
    MultipathDevice, OscillateSpec, PhySwitchDriver, PortState, RcsnAction, SwitchDriver,
};

pub use drivers::{DriverHandle, DriverRegistry};

pub use error::{Error, ErrorKind, Result};

pub use host::{HostInventory, StaticHost, SysfsHost};

pub use manager::{ManagerConfig, SanManager, SwitchCheckReport};

pub use multipath::choose_mpaths;

pub use size::{size_bytes_2_size_human, size_human_2_size_bytes};

pub use topology::{AddressSets, DeviceKind, DeviceRecord, LoadReport, SanConfig, SanTopology};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
