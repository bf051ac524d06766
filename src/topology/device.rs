//! Typed device records
//!
//! One [`DeviceRecord`] per configured piece of SAN hardware, plus the
//! per-host iSCSI initiator settings.

use crate::domain::address::Address;
use crate::domain::ports::ConnectMode;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Mandatory management channel fields of a controllable device
pub const MANDATORY_FIELDS: [&str; 4] = ["ctrl_ip", "ctrl_user", "ctrl_pass", "ctrl_type"];

/// Prefix of controller management IP keys (`ctrl_ip_spa`)
pub const CTRL_IP_PREFIX: &str = "ctrl_ip_";

// =============================================================================
// Device Kind
// =============================================================================

/// Category of a configured device (`type` key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Logical FC or Ethernet switch
    Switch,
    /// Physical layer (patch) switch
    #[serde(rename = "physwitch")]
    PhySwitch,
    /// Storage array
    Array,
    /// Local iSCSI initiator host settings
    IscsiInitiator,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Switch => "switch",
            DeviceKind::PhySwitch => "physwitch",
            DeviceKind::Array => "array",
            DeviceKind::IscsiInitiator => "iscsi_initiator",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "switch" => Ok(DeviceKind::Switch),
            "physwitch" => Ok(DeviceKind::PhySwitch),
            "array" => Ok(DeviceKind::Array),
            "iscsi_initiator" => Ok(DeviceKind::IscsiInitiator),
            other => Err(Error::Configuration(format!("unknown device type '{}'", other))),
        }
    }
}

// =============================================================================
// Driver Key
// =============================================================================

/// Identifies the driver implementation for a device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DriverKey {
    pub kind: DeviceKind,
    pub vendor: String,
    pub model: String,
}

impl DriverKey {
    pub fn new(kind: DeviceKind, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind,
            vendor: vendor.into().to_lowercase(),
            model: model.into().to_lowercase(),
        }
    }

    /// Derive the key from a `vendor-model` string.
    ///
    /// The string is lower-cased and split at its last hyphen, so
    /// `EMC-VNX` gives vendor `emc` and model `vnx`.
    pub fn from_model(kind: DeviceKind, model: &str) -> Option<Self> {
        let model = model.trim().to_lowercase();
        if model.chars().any(char::is_whitespace) {
            return None;
        }
        let (vendor, name) = model.rsplit_once('-')?;
        if vendor.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(kind, vendor, name))
    }

    /// Dotted module path, e.g. `array.emc.vnx`
    pub fn module_name(&self) -> String {
        format!("{}.{}.{}", self.kind, self.vendor, self.model)
    }

    pub fn class_name(&self) -> &str {
        &self.model
    }
}

impl fmt::Display for DriverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.module_name())
    }
}

// =============================================================================
// Physical Topology
// =============================================================================

/// Static cross-connects of a physical layer switch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhysicalTopology {
    /// Source port -> destination port, one direction
    pub simplex: BTreeMap<String, String>,
    /// Port -> peer port, stored in both directions
    pub duplex: BTreeMap<String, String>,
}

impl PhysicalTopology {
    pub fn connect_simplex(&mut self, src: &str, dst: &str) {
        self.simplex.insert(src.to_string(), dst.to_string());
    }

    pub fn connect_duplex(&mut self, a: &str, b: &str) {
        self.duplex.insert(a.to_string(), b.to_string());
        self.duplex.insert(b.to_string(), a.to_string());
    }

    /// Destination of `port` and the mode to reconnect it with.
    ///
    /// A simplex entry wins over a duplex one for the same port.
    pub fn destination_of(&self, port: &str) -> Option<(&str, ConnectMode)> {
        if let Some(dst) = self.simplex.get(port) {
            return Some((dst.as_str(), ConnectMode::Simplex));
        }
        self.duplex
            .get(port)
            .map(|dst| (dst.as_str(), ConnectMode::Duplex))
    }

    pub fn is_empty(&self) -> bool {
        self.simplex.is_empty() && self.duplex.is_empty()
    }
}

// =============================================================================
// Device Record
// =============================================================================

/// One configured piece of SAN hardware
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    /// Config section name
    pub name: String,
    pub kind: DeviceKind,
    /// `vendor-model` string as configured
    pub model: String,
    pub driver_key: DriverKey,
    /// Normalized address -> device-local port label
    pub ports: IndexMap<Address, String>,
    pub physical_topology: PhysicalTopology,
    /// Every key of the section, after alias resolution
    #[serde(skip)]
    pub settings: IndexMap<String, String>,
}

impl DeviceRecord {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Fetch a mandatory field
    pub fn require(&self, field: &str) -> Result<&str> {
        self.setting(field).ok_or_else(|| Error::MissingField {
            section: self.name.clone(),
            field: field.to_string(),
        })
    }

    /// Check every management channel field is present
    pub fn check_mandatory(&self) -> Result<()> {
        for field in MANDATORY_FIELDS {
            self.require(field)?;
        }
        Ok(())
    }

    pub fn ctrl_ip(&self) -> Option<&str> {
        self.setting("ctrl_ip")
    }

    /// Management channel timeout (`ctrl_tmo`, in seconds)
    pub fn ctrl_tmo(&self) -> Result<Option<Duration>> {
        match self.setting("ctrl_tmo") {
            None => Ok(None),
            Some(v) => v
                .parse::<u64>()
                .map(|secs| Some(Duration::from_secs(secs)))
                .map_err(|_| Error::Configuration(format!("[{}] ctrl_tmo '{}' is not a number of seconds", self.name, v))),
        }
    }

    /// `skip_check = 1` excludes the device from switch configuration checks
    pub fn skip_check(&self) -> bool {
        self.setting("skip_check") == Some("1")
    }

    /// Device-local port label of `addr`
    pub fn port_of(&self, addr: &Address) -> Option<&str> {
        self.ports.get(addr).map(String::as_str)
    }

    /// Controller names taken from `ctrl_ip_<name>` keys
    pub fn controller_names(&self) -> Vec<String> {
        self.settings
            .keys()
            .filter_map(|k| k.strip_prefix(CTRL_IP_PREFIX))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn controller_ip(&self, controller: &str) -> Option<&str> {
        self.setting(&format!("{}{}", CTRL_IP_PREFIX, controller))
    }
}

// =============================================================================
// iSCSI Initiator Settings
// =============================================================================

/// One iSCSI interface of an initiator host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiIface {
    pub name: Option<String>,
    pub ip: Option<String>,
    pub mask: Option<String>,
    pub gateway: Option<String>,
    pub mac: Option<String>,
    pub iqn: Option<String>,
    pub disc_mod: Option<String>,
    pub trans: Option<String>,
    pub target_ip: Option<String>,
}

/// iSCSI settings of one initiator host (`type = iscsi_initiator`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiHostConfig {
    pub hostname: String,
    /// Interface number -> interface settings
    pub ifaces: BTreeMap<u32, IscsiIface>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_key_from_model() {
        let key = DriverKey::from_model(DeviceKind::Array, "EMC-VNX").unwrap();
        assert_eq!(key.vendor, "emc");
        assert_eq!(key.model, "vnx");
        assert_eq!(key.module_name(), "array.emc.vnx");
        assert_eq!(key.class_name(), "vnx");

        let key = DriverKey::from_model(DeviceKind::Switch, "cisco-nexus-5k").unwrap();
        assert_eq!(key.vendor, "cisco-nexus");
        assert_eq!(key.model, "5k");

        assert!(DriverKey::from_model(DeviceKind::Switch, "brocade").is_none());
        assert!(DriverKey::from_model(DeviceKind::Switch, "-x").is_none());
        assert!(DriverKey::from_model(DeviceKind::Switch, "a b-c").is_none());
    }

    #[test]
    fn test_device_kind_parsing() {
        assert_eq!("physwitch".parse::<DeviceKind>().unwrap(), DeviceKind::PhySwitch);
        assert_eq!("ISCSI_INITIATOR".parse::<DeviceKind>().unwrap(), DeviceKind::IscsiInitiator);
        assert!("router".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_duplex_is_symmetric() {
        let mut topo = PhysicalTopology::default();
        topo.connect_duplex("A", "B");
        topo.connect_simplex("C", "D");

        assert_eq!(topo.destination_of("A"), Some(("B", ConnectMode::Duplex)));
        assert_eq!(topo.destination_of("B"), Some(("A", ConnectMode::Duplex)));
        assert_eq!(topo.destination_of("C"), Some(("D", ConnectMode::Simplex)));
        assert_eq!(topo.destination_of("D"), None);
    }

    #[test]
    fn test_controller_names() {
        let mut settings = IndexMap::new();
        settings.insert("ctrl_ip".to_string(), "10.0.0.1".to_string());
        settings.insert("ctrl_ip_spa".to_string(), "10.0.0.2".to_string());
        settings.insert("ctrl_ip_spb".to_string(), "10.0.0.3".to_string());
        let record = DeviceRecord {
            name: "vnx1".into(),
            kind: DeviceKind::Array,
            model: "EMC-VNX".into(),
            driver_key: DriverKey::new(DeviceKind::Array, "emc", "vnx"),
            ports: IndexMap::new(),
            physical_topology: PhysicalTopology::default(),
            settings,
        };

        assert_eq!(record.controller_names(), vec!["spa", "spb"]);
        assert_eq!(record.controller_ip("spb"), Some("10.0.0.3"));
        assert!(record.require("ctrl_user").is_err());
    }
}
