//! Host fact providers
//!
//! Implementations of [`HostFacts`](crate::domain::ports::HostFacts):
//! - [`StaticHost`]: in-memory inventory that records every iSCSI operation
//! - [`SysfsHost`]: read-only facts from Linux sysfs

pub mod static_host;
pub mod sysfs;

pub use static_host::{HostInventory, IscsiOp, StaticHost};
pub use sysfs::{SysfsHost, SysfsHostConfig};
