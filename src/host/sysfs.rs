//! Sysfs host facts
//!
//! Reads FC HBA, FC remote port, iSCSI session and NIC facts from sysfs.
//! Operations that need the iSCSI or multipath tooling are not available
//! here and fail with [`Error::Host`].

use crate::domain::address::Address;
use crate::domain::ports::{HostFacts, MultipathDevice, NicInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct SysfsHostConfig {
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
    pub hostname_path: PathBuf,
}

impl Default for SysfsHostConfig {
    fn default() -> Self {
        Self {
            sysfs_path: PathBuf::from("/sys"),
            hostname_path: PathBuf::from("/etc/hostname"),
        }
    }
}

// =============================================================================
// Sysfs Host
// =============================================================================

/// Read-only host facts from the local sysfs
pub struct SysfsHost {
    config: SysfsHostConfig,
}

impl SysfsHost {
    pub fn new(config: SysfsHostConfig) -> Self {
        Self { config }
    }

    /// Read one attribute from every entry of a sysfs class directory
    fn read_class_attr(&self, class: &str, attr: &str) -> Result<Vec<(String, String)>> {
        let class_path = self.config.sysfs_path.join("class").join(class);
        if !class_path.exists() {
            debug!("No sysfs class found at {:?}", class_path);
            return Ok(Vec::new());
        }

        let mut values = Vec::new();
        for entry in fs::read_dir(&class_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            match read_attr(&entry.path(), attr) {
                Ok(value) => values.push((name, value)),
                Err(e) => debug!("Skipping {}: {}", name, e),
            }
        }
        values.sort();
        Ok(values)
    }

    fn read_addresses(
        &self,
        class: &str,
        attr: &str,
        parse: fn(&str) -> Option<Address>,
    ) -> Result<Vec<Address>> {
        let mut addrs = Vec::new();
        for (name, value) in self.read_class_attr(class, attr)? {
            match parse(&value) {
                Some(addr) => {
                    if !addrs.contains(&addr) {
                        addrs.push(addr);
                    }
                }
                None => warn!("Ignoring {}/{} with unexpected value {}", class, name, value),
            }
        }
        Ok(addrs)
    }

    fn unsupported(operation: &str) -> Error {
        Error::Host(format!("{} is not available from sysfs", operation))
    }
}

fn read_attr(base_path: &Path, attr: &str) -> Result<String> {
    let path = base_path.join(attr);
    fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::Host(format!("Failed to read {}: {}", path.display(), e)))
}

#[async_trait]
impl HostFacts for SysfsHost {
    async fn hostname(&self) -> Result<String> {
        if let Ok(hostname) = fs::read_to_string(&self.config.hostname_path) {
            return Ok(hostname.trim().to_string());
        }
        Ok("unknown".to_string())
    }

    async fn fc_host_wwpns(&self) -> Result<Vec<Address>> {
        self.read_addresses("fc_host", "port_name", Address::wwpn)
    }

    async fn fc_target_wwpns(&self) -> Result<Vec<Address>> {
        self.read_addresses("fc_remote_ports", "port_name", Address::wwpn)
    }

    async fn iscsi_initiator_iqns(&self) -> Result<Vec<Address>> {
        self.read_addresses("iscsi_session", "initiatorname", Address::iqn)
    }

    async fn iscsi_target_iqns(&self) -> Result<Vec<Address>> {
        self.read_addresses("iscsi_session", "targetname", Address::iqn)
    }

    async fn iscsi_session_macs(&self) -> Result<Vec<Address>> {
        self.read_addresses("iscsi_host", "hwaddress", Address::mac)
    }

    async fn nics(&self) -> Result<Vec<NicInfo>> {
        Ok(self
            .read_class_attr("net", "address")?
            .into_iter()
            .filter(|(name, _)| name != "lo")
            .map(|(name, value)| NicInfo {
                name,
                mac: Address::mac(&value),
            })
            .collect())
    }

    async fn free_mpaths(&self, _exclude_boot: bool, _exclude_lvm: bool) -> Result<Vec<MultipathDevice>> {
        Err(Self::unsupported("multipath listing"))
    }

    async fn mpath_info(&self, _name: &str) -> Result<Option<MultipathDevice>> {
        Err(Self::unsupported("multipath lookup"))
    }

    async fn is_target_discovered(&self, _t_iqn: &str) -> Result<bool> {
        Err(Self::unsupported("iSCSI node lookup"))
    }

    async fn discovery_ifaces_of(&self, _t_iqn: &str) -> Result<Vec<String>> {
        Err(Self::unsupported("iSCSI node lookup"))
    }

    async fn discover(&self, _portal: &str, _ifaces: &[String]) -> Result<()> {
        Err(Self::unsupported("iSCSI discovery"))
    }

    async fn node_login(&self, _t_iqn: Option<&str>) -> Result<()> {
        Err(Self::unsupported("iSCSI login"))
    }

    async fn node_logout(&self, _t_iqn: &str) -> Result<()> {
        Err(Self::unsupported("iSCSI logout"))
    }

    async fn node_delete(&self, _t_iqn: &str) -> Result<()> {
        Err(Self::unsupported("iSCSI node delete"))
    }

    async fn iscsi_iface_names(&self) -> Result<Vec<String>> {
        Err(Self::unsupported("iSCSI iface listing"))
    }

    async fn iface_set_ip(
        &self,
        _iface: &str,
        _ip: &str,
        _mask: Option<&str>,
        _gateway: Option<&str>,
    ) -> Result<()> {
        Err(Self::unsupported("iSCSI iface setup"))
    }

    async fn iface_set_iqn(&self, _iface: &str, _iqn: &str) -> Result<()> {
        Err(Self::unsupported("iSCSI iface setup"))
    }

    async fn set_multipath_timeout(&self) -> Result<()> {
        Err(Self::unsupported("iSCSI session timeout"))
    }

    async fn rescan_scsi(&self) -> Result<()> {
        let hosts = self.config.sysfs_path.join("class/scsi_host");
        if !hosts.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&hosts)? {
            let scan = entry?.path().join("scan");
            fs::write(&scan, "- - -")
                .map_err(|e| Error::Host(format!("Failed to write {}: {}", scan.display(), e)))?;
        }
        Ok(())
    }
}
