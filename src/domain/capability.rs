//! Capability Registry types
//!
//! Every high level action is gated on a capability. Arrays grant their
//! capabilities to the whole device; switches grant them per address, since
//! FC and Ethernet ports on the same switch can differ in what they support.

use crate::domain::address::Address;
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Capability
// =============================================================================

/// An operation a device may support
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    // Logical switch
    LinkUp,
    LinkDown,
    LinkOscillate,
    RcsnEnable,
    RcsnDisable,
    SwitchReboot,
    FcSwitch,
    EthSwitch,

    // Physical layer switch
    FcPhyswitch,
    PhyPortConnect,
    PhyPortDisconnect,
    PhyPortFlap,
    PhyPortOscillate,
    PhySwitchReboot,

    // Storage array
    LunQuery,
    LunInfo,
    LunCreate,
    LunRemove,
    LunMap,
    LunUnmap,
    LunThinp,
    SaCtrlerReboot,
}

impl Capability {
    pub const ALL: [Capability; 22] = [
        Capability::LinkUp,
        Capability::LinkDown,
        Capability::LinkOscillate,
        Capability::RcsnEnable,
        Capability::RcsnDisable,
        Capability::SwitchReboot,
        Capability::FcSwitch,
        Capability::EthSwitch,
        Capability::FcPhyswitch,
        Capability::PhyPortConnect,
        Capability::PhyPortDisconnect,
        Capability::PhyPortFlap,
        Capability::PhyPortOscillate,
        Capability::PhySwitchReboot,
        Capability::LunQuery,
        Capability::LunInfo,
        Capability::LunCreate,
        Capability::LunRemove,
        Capability::LunMap,
        Capability::LunUnmap,
        Capability::LunThinp,
        Capability::SaCtrlerReboot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::LinkUp => "link_up",
            Capability::LinkDown => "link_down",
            Capability::LinkOscillate => "link_oscillate",
            Capability::RcsnEnable => "rcsn_enable",
            Capability::RcsnDisable => "rcsn_disable",
            Capability::SwitchReboot => "switch_reboot",
            Capability::FcSwitch => "fc_switch",
            Capability::EthSwitch => "eth_switch",
            Capability::FcPhyswitch => "fc_physwitch",
            Capability::PhyPortConnect => "phy_port_connect",
            Capability::PhyPortDisconnect => "phy_port_disconnect",
            Capability::PhyPortFlap => "phy_port_flap",
            Capability::PhyPortOscillate => "phy_port_oscillate",
            Capability::PhySwitchReboot => "phy_switch_reboot",
            Capability::LunQuery => "lun_query",
            Capability::LunInfo => "lun_info",
            Capability::LunCreate => "lun_create",
            Capability::LunRemove => "lun_remove",
            Capability::LunMap => "lun_map",
            Capability::LunUnmap => "lun_unmap",
            Capability::LunThinp => "lun_thinp",
            Capability::SaCtrlerReboot => "sa_ctrler_reboot",
        }
    }

    /// Capabilities that every switch driver may grant per port
    pub fn is_port_scoped(&self) -> bool {
        matches!(
            self,
            Capability::LinkUp
                | Capability::LinkDown
                | Capability::LinkOscillate
                | Capability::RcsnEnable
                | Capability::RcsnDisable
                | Capability::SwitchReboot
                | Capability::PhyPortConnect
                | Capability::PhyPortDisconnect
                | Capability::PhyPortFlap
                | Capability::PhyPortOscillate
                | Capability::PhySwitchReboot
        )
    }

    /// Port-type capabilities granted only to addresses of a matching kind
    pub fn port_type_for(addr: &Address) -> &'static [Capability] {
        match addr {
            Address::Wwpn(_) => &[Capability::FcSwitch, Capability::FcPhyswitch],
            Address::Mac(_) => &[Capability::EthSwitch],
            Address::Iqn(_) => &[],
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| crate::error::Error::InvalidArgument(format!("unknown capability: {}", s)))
    }
}

/// The capabilities one driver instance declares
pub type DeviceCapabilities = BTreeSet<Capability>;

/// Render a capability fragment for error messages
pub fn describe(caps: &DeviceCapabilities) -> String {
    if caps.is_empty() {
        return "none".to_string();
    }
    caps.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(",")
}

// =============================================================================
// Capability Scope
// =============================================================================

/// Where a granted capability applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityScope {
    /// The whole device (array level)
    Device,
    /// Only these addresses (switch level)
    Ports(BTreeSet<Address>),
}

impl Serialize for CapabilityScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CapabilityScope::Device => serializer.serialize_bool(true),
            CapabilityScope::Ports(addrs) => {
                let mut seq = serializer.serialize_seq(Some(addrs.len()))?;
                for addr in addrs {
                    seq.serialize_element(addr)?;
                }
                seq.end()
            }
        }
    }
}

// =============================================================================
// Capability Set
// =============================================================================

/// Topology-wide capability set, aggregated from every materialized driver
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    entries: BTreeMap<Capability, CapabilityScope>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `cap` to the whole device
    pub fn grant_device(&mut self, cap: Capability) {
        self.entries.insert(cap, CapabilityScope::Device);
    }

    /// Grant `cap` for one address.
    ///
    /// A device-wide grant already present is left untouched.
    pub fn grant_port(&mut self, cap: Capability, addr: Address) {
        match self
            .entries
            .entry(cap)
            .or_insert_with(|| CapabilityScope::Ports(BTreeSet::new()))
        {
            CapabilityScope::Device => {}
            CapabilityScope::Ports(addrs) => {
                addrs.insert(addr);
            }
        }
    }

    /// Merge an array driver's fragment
    pub fn merge_device(&mut self, caps: &DeviceCapabilities) {
        for cap in caps {
            self.grant_device(*cap);
        }
    }

    /// Merge a switch driver's fragment for one of its addresses
    pub fn merge_port(&mut self, caps: &DeviceCapabilities, addr: &Address) {
        for cap in caps.iter().filter(|c| c.is_port_scoped()) {
            self.grant_port(*cap, addr.clone());
        }
        for cap in Capability::port_type_for(addr) {
            if caps.contains(cap) {
                self.grant_port(*cap, addr.clone());
            }
        }
    }

    /// Is `cap` granted anywhere in the topology
    pub fn supports(&self, cap: Capability) -> bool {
        match self.entries.get(&cap) {
            Some(CapabilityScope::Device) => true,
            Some(CapabilityScope::Ports(addrs)) => !addrs.is_empty(),
            None => false,
        }
    }

    /// Is `cap` granted for `addr`
    pub fn supports_for(&self, cap: Capability, addr: &Address) -> bool {
        match self.entries.get(&cap) {
            Some(CapabilityScope::Device) => true,
            Some(CapabilityScope::Ports(addrs)) => addrs.contains(addr),
            None => false,
        }
    }

    pub fn scope(&self, cap: Capability) -> Option<&CapabilityScope> {
        self.entries.get(&cap)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Capability, &CapabilityScope)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of every granted capability, for error messages
    pub fn describe(&self) -> String {
        if self.entries.is_empty() {
            return "none".to_string();
        }
        self.entries
            .keys()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wwpn(s: &str) -> Address {
        Address::wwpn(s).unwrap()
    }

    #[test]
    fn test_capability_names_round_trip() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert!("link_sideways".parse::<Capability>().is_err());
    }

    #[test]
    fn test_serde_name_matches_as_str() {
        let json = serde_json::to_string(&Capability::SaCtrlerReboot).unwrap();
        assert_eq!(json, "\"sa_ctrler_reboot\"");
    }

    #[test]
    fn test_port_scope_is_per_address() {
        let fc = wwpn("10:00:00:00:c9:95:2f:de");
        let other = wwpn("10:00:00:00:c9:95:2f:df");
        let mut set = CapabilitySet::new();
        set.grant_port(Capability::LinkUp, fc.clone());

        assert!(set.supports(Capability::LinkUp));
        assert!(set.supports_for(Capability::LinkUp, &fc));
        assert!(!set.supports_for(Capability::LinkUp, &other));
        assert!(!set.supports(Capability::LinkDown));
    }

    #[test]
    fn test_device_scope_applies_everywhere() {
        let mut set = CapabilitySet::new();
        set.merge_device(&[Capability::LunCreate].into_iter().collect());
        assert!(set.supports_for(Capability::LunCreate, &wwpn("50:0a:09:85:99:4b:8d:c5")));
    }

    #[test]
    fn test_merge_port_respects_port_type() {
        let caps: DeviceCapabilities = [Capability::LinkUp, Capability::FcSwitch, Capability::EthSwitch]
            .into_iter()
            .collect();
        let fc = wwpn("10:00:00:00:c9:95:2f:de");
        let eth = Address::mac("08:00:27:05:37:71").unwrap();

        let mut set = CapabilitySet::new();
        set.merge_port(&caps, &fc);
        set.merge_port(&caps, &eth);

        assert!(set.supports_for(Capability::FcSwitch, &fc));
        assert!(!set.supports_for(Capability::FcSwitch, &eth));
        assert!(set.supports_for(Capability::EthSwitch, &eth));
        assert!(set.supports_for(Capability::LinkUp, &eth));
    }

    #[test]
    fn test_capability_set_serializes_both_forms() {
        let mut set = CapabilitySet::new();
        set.grant_device(Capability::LunMap);
        set.grant_port(Capability::LinkDown, wwpn("10:00:00:00:c9:95:2f:de"));

        let value = serde_json::to_value(&set).unwrap();
        assert_eq!(value["lun_map"], serde_json::json!(true));
        assert_eq!(value["link_down"], serde_json::json!(["10:00:00:00:c9:95:2f:de"]));
    }
}
