//! Config Loader
//!
//! Turns the raw sections of a SAN topology file into typed
//! [`DeviceRecord`]s and per-host iSCSI settings. A problem in one section
//! drops that device only; it is kept in [`SanConfig::errors`] and loading
//! goes on with the rest of the file.

use crate::domain::address::{self, Address};
use crate::domain::ports::DriverParams;
use crate::error::{Error, Result};
use crate::topology::device::{
    DeviceKind, DeviceRecord, DriverKey, IscsiHostConfig, IscsiIface, PhysicalTopology,
};
use crate::topology::ini::{RawConfig, Section, ALIAS_SECTION, GENERAL_SECTION};
use indexmap::IndexMap;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key of the general section recording where the config came from
pub const SAN_CONF_FILE_KEY: &str = "san_conf_file";

// =============================================================================
// Key Patterns
// =============================================================================

struct KeyPatterns {
    mac: Regex,
    wwpn: Regex,
    simplex: Regex,
    duplex: Regex,
    iface: Regex,
}

fn patterns() -> &'static KeyPatterns {
    static PATTERNS: OnceLock<KeyPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| KeyPatterns {
        mac: Regex::new(r"^mac_(.+)$").expect("valid pattern"),
        wwpn: Regex::new(r"^wwpn-(.+)$").expect("valid pattern"),
        simplex: Regex::new(r"^simplex_con_(\S+)$").expect("valid pattern"),
        duplex: Regex::new(r"^duplex_con_(\S+)$").expect("valid pattern"),
        iface: Regex::new(
            r"^(iface|iface_ip|iface_mask|iface_gateway|iface_mac|iface_iqn|iface_disc_mod|iface_trans|target_ip)_(\d+)$",
        )
        .expect("valid pattern"),
    })
}

// =============================================================================
// Device Errors
// =============================================================================

/// A device dropped while loading, with the reason
#[derive(Debug)]
pub struct DeviceError {
    pub device: String,
    pub error: Error,
}

impl DeviceError {
    pub fn new(device: impl Into<String>, error: Error) -> Self {
        Self {
            device: device.into(),
            error,
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.device, self.error)
    }
}

// =============================================================================
// SAN Config
// =============================================================================

/// Typed view of a SAN topology file
#[derive(Debug, Default)]
pub struct SanConfig {
    pub path: Option<PathBuf>,
    pub general: Section,
    pub aliases: Section,
    /// Switches, physical switches and arrays, in file order
    pub devices: IndexMap<String, DeviceRecord>,
    /// Section name (host name) -> iSCSI initiator settings
    pub iscsi_hosts: IndexMap<String, IscsiHostConfig>,
    /// Devices that could not be loaded
    pub errors: Vec<DeviceError>,
}

impl SanConfig {
    /// Read a SAN topology file.
    ///
    /// Fails only when the file cannot be read or is not valid section text.
    pub fn read(path: &Path) -> Result<Self> {
        info!("Loading SAN config: {}", path.display());
        let raw = RawConfig::read(path)?;
        Ok(Self::from_raw(raw, Some(path.to_path_buf())))
    }

    /// Parse SAN topology text
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self::from_raw(RawConfig::parse(text)?, None))
    }

    pub fn from_raw(mut raw: RawConfig, path: Option<PathBuf>) -> Self {
        if let Some(p) = &path {
            raw.section_mut(GENERAL_SECTION)
                .insert(SAN_CONF_FILE_KEY.to_string(), p.display().to_string());
        }

        let mut config = SanConfig {
            path,
            ..Default::default()
        };

        let unresolved = raw.resolve_aliases();
        let mut skipped: HashSet<String> = HashSet::new();
        for (section, error) in unresolved {
            warn!("Dropping [{}]: {}", section, error);
            skipped.insert(section.clone());
            config.errors.push(DeviceError::new(section, error));
        }

        for (name, section) in raw.into_sections() {
            match name.as_str() {
                GENERAL_SECTION => config.general = section,
                ALIAS_SECTION => config.aliases = section,
                _ if skipped.contains(&name) => {}
                _ => config.load_section(name, section),
            }
        }

        debug!(
            "SAN config has {} devices, {} iSCSI hosts, {} errors",
            config.devices.len(),
            config.iscsi_hosts.len(),
            config.errors.len()
        );
        config
    }

    fn load_section(&mut self, name: String, section: Section) {
        let Some(kind) = section.get("type") else {
            debug!("Section [{}] has no type, ignoring", name);
            return;
        };

        let kind = match kind.parse::<DeviceKind>() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Dropping [{}]: {}", name, e);
                self.errors.push(DeviceError::new(name, e));
                return;
            }
        };

        if kind == DeviceKind::IscsiInitiator {
            let host = iscsi_host_config(&name, &section);
            self.iscsi_hosts.insert(name, host);
            return;
        }

        match device_record(&name, kind, section) {
            Ok(record) => {
                debug!(
                    "Loaded {} [{}] ({} ports, driver {})",
                    record.kind,
                    record.name,
                    record.ports.len(),
                    record.driver_key
                );
                self.devices.insert(name, record);
            }
            Err(e) => {
                warn!("Dropping [{}]: {}", name, e);
                self.errors.push(DeviceError::new(name, e));
            }
        }
    }

    pub fn device(&self, name: &str) -> Option<&DeviceRecord> {
        self.devices.get(name)
    }

    pub fn devices_of(&self, kind: DeviceKind) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values().filter(move |d| d.kind == kind)
    }

    /// The array managed through `ctrl_ip`
    pub fn array_by_ctrl_ip(&self, ctrl_ip: &str) -> Option<&DeviceRecord> {
        self.devices_of(DeviceKind::Array)
            .find(|d| d.ctrl_ip() == Some(ctrl_ip))
    }

    /// Alias name whose value is `value`, for display
    pub fn alias_of(&self, value: &str) -> Option<&str> {
        self.aliases
            .iter()
            .find(|(_, v)| v.as_str() == value)
            .map(|(k, _)| k.as_str())
    }

    pub fn san_conf_file(&self) -> Option<&str> {
        self.general.get(SAN_CONF_FILE_KEY).map(String::as_str)
    }

    /// Constructor arguments for the driver of `record`
    pub fn driver_params(&self, record: &DeviceRecord, default_timeout: Option<Duration>) -> Result<DriverParams> {
        record.check_mandatory()?;
        Ok(DriverParams {
            device: record.name.clone(),
            ctrl_ip: record.require("ctrl_ip")?.to_string(),
            ctrl_user: record.require("ctrl_user")?.to_string(),
            ctrl_pass: record.require("ctrl_pass")?.to_string(),
            ctrl_type: record.require("ctrl_type")?.to_string(),
            timeout: record.ctrl_tmo()?.or(default_timeout),
            settings: record
                .settings
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            san_conf_file: self.san_conf_file().map(PathBuf::from),
        })
    }
}

// =============================================================================
// Section Interpretation
// =============================================================================

fn device_record(name: &str, kind: DeviceKind, settings: Section) -> Result<DeviceRecord> {
    let model = settings
        .get("model")
        .filter(|m| !m.is_empty())
        .cloned()
        .ok_or_else(|| Error::MissingField {
            section: name.to_string(),
            field: "model".into(),
        })?;
    let driver_key = DriverKey::from_model(kind, &model).ok_or_else(|| Error::InvalidModel {
        section: name.to_string(),
        model: model.clone(),
    })?;

    let ports = scan_ports(name, &settings)?;
    let physical_topology = scan_cross_connects(&settings);

    Ok(DeviceRecord {
        name: name.to_string(),
        kind,
        model,
        driver_key,
        ports,
        physical_topology,
        settings,
    })
}

/// Build the address -> port label map of a device section
pub fn scan_ports(name: &str, settings: &Section) -> Result<IndexMap<Address, String>> {
    let p = patterns();
    let mut ports: IndexMap<Address, String> = IndexMap::new();

    for (key, value) in settings {
        let (addr, label) = if let Some(caps) = p.mac.captures(key) {
            let mac = address::standardize_mac(value).ok_or_else(|| Error::InvalidAddress {
                section: name.to_string(),
                key: key.clone(),
                kind: "MAC".into(),
                value: value.clone(),
            })?;
            (Address::Mac(mac), caps[1].to_string())
        } else if let Some(caps) = p.wwpn.captures(key) {
            let wwpn = address::standardize_wwpn(value).ok_or_else(|| Error::InvalidAddress {
                section: name.to_string(),
                key: key.clone(),
                kind: "WWPN".into(),
                value: value.clone(),
            })?;
            (Address::Wwpn(wwpn), caps[1].to_string())
        } else if address::is_iqn(value) {
            (Address::Iqn(value.trim().to_string()), key.clone())
        } else {
            continue;
        };

        if ports.contains_key(&addr) {
            return Err(Error::DuplicateAddress {
                section: name.to_string(),
                key: key.clone(),
                address: addr.to_string(),
            });
        }
        ports.insert(addr, label);
    }

    Ok(ports)
}

fn scan_cross_connects(settings: &Section) -> PhysicalTopology {
    let p = patterns();
    let mut topology = PhysicalTopology::default();

    for (key, dst) in settings {
        if let Some(caps) = p.simplex.captures(key) {
            topology.connect_simplex(&caps[1], dst);
        } else if let Some(caps) = p.duplex.captures(key) {
            topology.connect_duplex(&caps[1], dst);
        }
    }
    topology
}

fn iscsi_host_config(name: &str, settings: &Section) -> IscsiHostConfig {
    let p = patterns();
    let mut host = IscsiHostConfig {
        hostname: name.to_string(),
        ..Default::default()
    };

    for (key, value) in settings {
        let Some(caps) = p.iface.captures(key) else {
            continue;
        };
        let Ok(index) = caps[2].parse::<u32>() else {
            warn!("[{}] {} has an out of range interface number", name, key);
            continue;
        };

        let iface: &mut IscsiIface = host.ifaces.entry(index).or_default();
        let value = Some(value.clone());
        match &caps[1] {
            "iface" => iface.name = value,
            "iface_ip" => iface.ip = value,
            "iface_mask" => iface.mask = value,
            "iface_gateway" => iface.gateway = value,
            "iface_mac" => iface.mac = value,
            "iface_iqn" => iface.iqn = value,
            "iface_disc_mod" => iface.disc_mod = value,
            "iface_trans" => iface.trans = value,
            "target_ip" => iface.target_ip = value,
            _ => {}
        }
    }
    host
}
