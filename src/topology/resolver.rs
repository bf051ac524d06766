//! Port Resolver
//!
//! Reverse lookup from an address to the attached device owning it, one
//! category at a time. Lookups never fail: an address no attached device
//! configures has no owner. Degraded devices are not attached and so own
//! nothing.

use crate::domain::address::Address;
use crate::error::{Error, Result};
use crate::topology::san::{
    AttachedArray, AttachedDevice, AttachedPhySwitch, AttachedSwitch, SanTopology,
};

/// The device owning an address and the local port it sits on
#[derive(Debug)]
pub struct PortOwner<'a, D> {
    pub device: &'a D,
    pub port_id: &'a str,
    pub address: Address,
}

impl<'a, D: AttachedDevice> PortOwner<'a, D> {
    pub fn name(&self) -> &'a str {
        &self.device.record().name
    }
}

/// Normalize a caller supplied address, rejecting anything that is not a
/// WWPN, MAC or IQN
pub fn normalize(addr: &str) -> Result<Address> {
    Address::parse(addr)
        .ok_or_else(|| Error::InvalidArgument(format!("{} is an invalid WWPN/MAC/IQN", addr)))
}

fn owner_in<'a, D, I>(devices: I, addr: &Address) -> Option<PortOwner<'a, D>>
where
    D: AttachedDevice + 'a,
    I: IntoIterator<Item = &'a D>,
{
    devices.into_iter().find_map(|device| {
        device.record().port_of(addr).map(|port_id| PortOwner {
            device,
            port_id,
            address: addr.clone(),
        })
    })
}

/// Address to owner lookups over one topology
#[derive(Clone, Copy)]
pub struct PortResolver<'a> {
    topology: &'a SanTopology,
}

impl<'a> PortResolver<'a> {
    pub fn new(topology: &'a SanTopology) -> Self {
        Self { topology }
    }

    /// Logical switch owning `addr`
    pub fn switch_of(&self, addr: &Address) -> Option<PortOwner<'a, AttachedSwitch>> {
        owner_in(self.topology.switches().values(), addr)
    }

    /// Physical layer switch owning `addr`
    pub fn physwitch_of(&self, addr: &Address) -> Option<PortOwner<'a, AttachedPhySwitch>> {
        owner_in(self.topology.physwitches().values(), addr)
    }

    /// Array serving target `addr`.
    ///
    /// A per-LUN target of a target-per-LUN array resolves to the configured
    /// IQN port it extends.
    pub fn array_of(&self, addr: &Address) -> Option<PortOwner<'a, AttachedArray>> {
        if let Some(owner) = owner_in(self.topology.arrays().values(), addr) {
            return Some(owner);
        }
        if !addr.is_iqn() {
            return None;
        }
        self.topology
            .arrays()
            .values()
            .filter(|array| array.target_per_lun)
            .find_map(|array| {
                array
                    .record
                    .ports
                    .iter()
                    .find(|(port, _)| port.is_iqn() && addr.as_str().starts_with(port.as_str()))
                    .map(|(_, port_id)| PortOwner {
                        device: array,
                        port_id: port_id.as_str(),
                        address: addr.clone(),
                    })
            })
    }

    /// Normalize `addr` and look up its logical switch
    pub fn switch_of_str(&self, addr: &str) -> Result<Option<PortOwner<'a, AttachedSwitch>>> {
        Ok(self.switch_of(&normalize(addr)?))
    }

    /// Normalize `addr` and look up its physical layer switch
    pub fn physwitch_of_str(&self, addr: &str) -> Result<Option<PortOwner<'a, AttachedPhySwitch>>> {
        Ok(self.physwitch_of(&normalize(addr)?))
    }
}

impl SanTopology {
    pub fn resolver(&self) -> PortResolver<'_> {
        PortResolver::new(self)
    }
}
