//! SAN Manager - The orchestration surface
//!
//! Every operation follows the same steps:
//! - resolve the device owning the address (or the single in-scope array)
//! - check the device declares the capability
//! - delegate to its driver
//! - run the host side post-steps, if any
//!
//! The manager holds the addresses the caller cares about. Loading scopes the
//! SAN topology file to them and attaches drivers to the devices in scope.

mod controller;
mod iscsi;
mod link;
mod lun;
mod switch_check;

pub use switch_check::{PortMismatch, SwitchCheckReport, UnconfiguredPort};

use crate::domain::address::Address;
use crate::domain::capability::{self, Capability, CapabilitySet};
use crate::domain::ports::{HostFactsRef, MapInfo, MultipathDevice};
use crate::drivers::DriverRegistry;
use crate::error::{Error, Result};
use crate::multipath;
use crate::topology::san::{
    AddressSets, AttachedArray, AttachedDevice, AttachedPhySwitch, AttachedSwitch, LoadReport,
    SanTopology,
};
use crate::topology::resolver::{normalize, PortOwner};
use crate::topology::SanConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default location of the SAN topology file
pub const DEFAULT_CONF_PATH: &str = "/etc/san_top.conf";

/// Environment variable overriding [`DEFAULT_CONF_PATH`]
pub const CONF_PATH_ENV: &str = "SAN_TOP_CONF";

// =============================================================================
// Manager Configuration
// =============================================================================

/// Configuration for the SAN manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// SAN topology file
    pub conf_path: PathBuf,
    /// Attempts made to remove a LUN before giving up
    pub lun_remove_attempts: u32,
    /// Pause between LUN remove attempts
    pub lun_remove_pause: Duration,
    /// Default budget of a controller wait
    pub ctrler_wait_timeout: Duration,
    /// Default poll interval of a controller wait
    pub ctrler_wait_interval: Duration,
    /// Upper bound of oscillate and flap repeat counts
    pub max_repeat_count: u32,
    /// Rescan SCSI hosts after every map
    pub rescan_after_map: bool,
    /// Management channel timeout for devices without `ctrl_tmo`
    pub ctrl_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            conf_path: PathBuf::from(DEFAULT_CONF_PATH),
            lun_remove_attempts: 5,
            lun_remove_pause: Duration::from_secs(1),
            ctrler_wait_timeout: Duration::from_secs(1800),
            ctrler_wait_interval: Duration::from_secs(30),
            max_repeat_count: 10_000,
            rescan_after_map: false,
            ctrl_timeout: None,
        }
    }
}

impl ManagerConfig {
    /// Defaults, with the config path taken from `SAN_TOP_CONF` when set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var(CONF_PATH_ENV) {
            if !path.is_empty() {
                config.conf_path = PathBuf::from(path);
            }
        }
        config
    }
}

// =============================================================================
// SAN Manager
// =============================================================================

/// Facade over one loaded SAN topology
pub struct SanManager {
    config: ManagerConfig,
    registry: DriverRegistry,
    host: HostFactsRef,
    addresses: AddressSets,
    map_info: Vec<MapInfo>,
    topology: Option<SanTopology>,
}

impl SanManager {
    /// Create a manager with no addresses and nothing loaded
    pub fn new(config: ManagerConfig, registry: DriverRegistry, host: HostFactsRef) -> Self {
        Self {
            config,
            registry,
            host,
            addresses: AddressSets::default(),
            map_info: Vec::new(),
            topology: None,
        }
    }

    /// Manager scoped to one multipath device, or to every FC and iSCSI
    /// address of the host when `mpath_name` is `None`
    pub async fn create_for_mpath(
        mpath_name: Option<&str>,
        config: ManagerConfig,
        registry: DriverRegistry,
        host: HostFactsRef,
    ) -> Result<(Self, LoadReport)> {
        let mut manager = Self::new(config, registry, host.clone());

        let sets = match mpath_name {
            Some(name) => {
                let mp = host.mpath_info(name).await?.ok_or_else(|| {
                    Error::InvalidArgument(format!("could not find info for multipath {}", name))
                })?;
                manager.map_info = mp.map_info.clone();
                AddressSets {
                    h_wwpns: mp.h_wwpns,
                    t_wwpns: mp.t_wwpns,
                    h_iqns: mp.h_iqns,
                    t_iqns: mp.t_iqns,
                    macs: mp.iface_macs,
                }
            }
            None => AddressSets {
                h_wwpns: host.fc_host_wwpns().await?,
                t_wwpns: host.fc_target_wwpns().await?,
                h_iqns: host.iscsi_initiator_iqns().await?,
                t_iqns: host.iscsi_target_iqns().await?,
                macs: host.iscsi_session_macs().await?,
            },
        };

        // Only complete initiator/target pairs scope the topology
        if !sets.h_wwpns.is_empty() && !sets.t_wwpns.is_empty() {
            manager.addresses.h_wwpns = sets.h_wwpns;
            manager.addresses.t_wwpns = sets.t_wwpns;
        }
        if !sets.h_iqns.is_empty() && !sets.t_iqns.is_empty() {
            manager.addresses.h_iqns = sets.h_iqns;
            manager.addresses.t_iqns = sets.t_iqns;
            manager.addresses.macs = sets.macs;
        }

        let report = manager.load_conf().await;
        Ok((manager, report))
    }

    /// Manager scoped to every target port of the array managed through
    /// `ctrl_ip`
    pub async fn create_for_storage_array(
        ctrl_ip: &str,
        config: ManagerConfig,
        registry: DriverRegistry,
        host: HostFactsRef,
    ) -> Result<(Self, LoadReport)> {
        let san = SanConfig::read(&config.conf_path)?;
        let array = san.array_by_ctrl_ip(ctrl_ip).ok_or_else(|| {
            Error::Configuration(format!("could not find storage array with ctrl_ip {}", ctrl_ip))
        })?;

        let mut manager = Self::new(config, registry, host);
        for addr in array.ports.keys() {
            match addr {
                Address::Iqn(_) => manager.addresses.t_iqns.push(addr.clone()),
                Address::Wwpn(_) => manager.addresses.t_wwpns.push(addr.clone()),
                Address::Mac(_) => {}
            }
        }

        let report = manager.load_config(san).await;
        Ok((manager, report))
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Read the configured SAN topology file and load it
    pub async fn load_conf(&mut self) -> LoadReport {
        match SanConfig::read(&self.config.conf_path) {
            Ok(san) => self.load_config(san).await,
            Err(e) => {
                error!("Could not load SAN config: {}", e);
                self.topology = None;
                LoadReport::failed(e)
            }
        }
    }

    /// Scope `san` to the current addresses and attach drivers.
    ///
    /// Target addresses no configured array serves are dropped.
    pub async fn load_config(&mut self, san: SanConfig) -> LoadReport {
        let (topology, report) = SanTopology::load(
            san,
            self.addresses.clone(),
            &self.registry,
            self.config.ctrl_timeout,
        )
        .await;

        self.addresses = topology.addresses().clone();
        for e in &report.device_errors {
            warn!("SAN config: {}", e);
        }
        self.topology = Some(topology);
        report
    }

    pub fn is_config_loaded(&self) -> bool {
        self.topology.is_some()
    }

    /// The loaded topology
    pub fn topology(&self) -> Result<&SanTopology> {
        self.topology.as_ref().ok_or(Error::NotLoaded)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn host(&self) -> &HostFactsRef {
        &self.host
    }

    // =========================================================================
    // Address Sets
    // =========================================================================

    pub fn addresses(&self) -> &AddressSets {
        &self.addresses
    }

    pub fn h_wwpns(&self) -> &[Address] {
        &self.addresses.h_wwpns
    }

    pub fn set_h_wwpns(&mut self, addrs: Vec<Address>) {
        self.addresses.h_wwpns = addrs;
    }

    pub fn t_wwpns(&self) -> &[Address] {
        &self.addresses.t_wwpns
    }

    pub fn set_t_wwpns(&mut self, addrs: Vec<Address>) {
        self.addresses.t_wwpns = addrs;
    }

    pub fn h_iqns(&self) -> &[Address] {
        &self.addresses.h_iqns
    }

    pub fn set_h_iqns(&mut self, addrs: Vec<Address>) {
        self.addresses.h_iqns = addrs;
    }

    pub fn t_iqns(&self) -> &[Address] {
        &self.addresses.t_iqns
    }

    pub fn set_t_iqns(&mut self, addrs: Vec<Address>) {
        self.addresses.t_iqns = addrs;
    }

    pub fn macs(&self) -> &[Address] {
        &self.addresses.macs
    }

    pub fn set_macs(&mut self, addrs: Vec<Address>) {
        self.addresses.macs = addrs;
    }

    /// Initiator/target pairs LUN maps and unmaps default to
    pub fn map_info(&self) -> &[MapInfo] {
        &self.map_info
    }

    pub fn set_map_info(&mut self, map_info: Vec<MapInfo>) {
        self.map_info = map_info;
    }

    /// Replace every address set from caller supplied strings
    pub fn set_addresses_from_str(
        &mut self,
        h_wwpns: &[String],
        t_wwpns: &[String],
        h_iqns: &[String],
        t_iqns: &[String],
        macs: &[String],
    ) -> Result<()> {
        self.addresses = AddressSets {
            h_wwpns: parse_all(h_wwpns, Address::is_wwpn, "WWPN")?,
            t_wwpns: parse_all(t_wwpns, Address::is_wwpn, "WWPN")?,
            h_iqns: parse_all(h_iqns, Address::is_iqn, "IQN")?,
            t_iqns: parse_all(t_iqns, Address::is_iqn, "IQN")?,
            macs: parse_all(macs, Address::is_mac, "MAC")?,
        };
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Capabilities of every attached device
    pub fn capability(&self) -> Result<&CapabilitySet> {
        Ok(self.topology()?.capabilities())
    }

    /// Names of the attached arrays
    pub fn sa_names(&self) -> Result<Vec<String>> {
        Ok(self.topology()?.arrays().keys().cloned().collect())
    }

    /// Names of the attached logical switches
    pub fn sw_names(&self) -> Result<Vec<String>> {
        Ok(self.topology()?.switches().keys().cloned().collect())
    }

    /// Names of the attached physical layer switches
    pub fn physw_names(&self) -> Result<Vec<String>> {
        Ok(self.topology()?.physwitches().keys().cloned().collect())
    }

    /// Representative free multipath devices of this host
    pub async fn choose_mpaths(&self, mpath_name: Option<&str>) -> Result<Vec<MultipathDevice>> {
        multipath::select_mpaths(self.host.as_ref(), mpath_name, true, true).await
    }

    // =========================================================================
    // Resolution and Capability Gates
    // =========================================================================

    /// The single array in scope, checked for `cap`
    pub(crate) fn array_for(&self, cap: Capability) -> Result<&AttachedArray> {
        let array = self.topology()?.single_array()?;
        ensure_capable(array, cap)?;
        Ok(array)
    }

    /// The logical switch owning `addr`, checked for `cap`
    pub(crate) fn switch_for(&self, addr: &str, cap: Capability) -> Result<PortOwner<'_, AttachedSwitch>> {
        let owner = self.switch_owner(addr)?;
        ensure_capable(owner.device, cap)?;
        Ok(owner)
    }

    pub(crate) fn switch_owner(&self, addr: &str) -> Result<PortOwner<'_, AttachedSwitch>> {
        let addr = normalize(addr)?;
        self.topology()?
            .resolver()
            .switch_of(&addr)
            .ok_or_else(|| no_owner("switch", &addr))
    }

    /// The physical layer switch owning `addr`, checked for `cap` on that
    /// exact address
    pub(crate) fn physwitch_for(&self, addr: &str, cap: Capability) -> Result<PortOwner<'_, AttachedPhySwitch>> {
        let topology = self.topology()?;
        let owner = self.physwitch_owner(addr)?;
        if !topology.capabilities().supports_for(cap, &owner.address) {
            return Err(Error::CapabilityUnsupported {
                capability: cap.to_string(),
                device: format!("{} port {}", owner.name(), owner.port_id),
                advertised: capability::describe(&owner.device.capabilities()),
            });
        }
        Ok(owner)
    }

    pub(crate) fn physwitch_owner(&self, addr: &str) -> Result<PortOwner<'_, AttachedPhySwitch>> {
        let addr = normalize(addr)?;
        self.topology()?
            .resolver()
            .physwitch_of(&addr)
            .ok_or_else(|| no_owner("physwitch", &addr))
    }
}

/// Refuse `cap` unless `device` declares it
pub(crate) fn ensure_capable<D: AttachedDevice>(device: &D, cap: Capability) -> Result<()> {
    let caps = device.capabilities();
    if caps.contains(&cap) {
        return Ok(());
    }
    debug!("{} lacks {} (has {})", device.name(), cap, capability::describe(&caps));
    Err(Error::CapabilityUnsupported {
        capability: cap.to_string(),
        device: device.name().to_string(),
        advertised: capability::describe(&caps),
    })
}

fn no_owner(category: &str, addr: &Address) -> Error {
    Error::NoOwner {
        category: category.to_string(),
        address: addr.to_string(),
    }
}

fn parse_all(values: &[String], is_kind: fn(&Address) -> bool, kind: &str) -> Result<Vec<Address>> {
    values
        .iter()
        .map(|v| {
            normalize(v).and_then(|addr| {
                if is_kind(&addr) {
                    Ok(addr)
                } else {
                    Err(Error::InvalidArgument(format!("{} is not a {}", v, kind)))
                }
            })
        })
        .collect()
}

impl std::fmt::Debug for SanManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SanManager")
            .field("config", &self.config)
            .field("addresses", &self.addresses)
            .field("loaded", &self.is_config_loaded())
            .finish()
    }
}

// =============================================================================
// Test Fixtures
// =============================================================================


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::host::{HostInventory, StaticHost};
    use assert_matches::assert_matches;
    use std::io::Write;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_operations_before_load() {
        let host = Arc::new(StaticHost::new(HostInventory::default()));
        let manager = SanManager::new(ManagerConfig::default(), DriverRegistry::with_builtin(), host);
        assert!(!manager.is_config_loaded());
        assert_matches!(manager.sa_names(), Err(Error::NotLoaded));
        assert_matches!(manager.lun_query().await, Err(Error::NotLoaded));
    }

    #[tokio::test]
    async fn test_load_conf_reports_unreadable_file() {
        let host = Arc::new(StaticHost::new(HostInventory::default()));
        let config = ManagerConfig {
            conf_path: PathBuf::from("/nonexistent/san_top.conf"),
            ..Default::default()
        };
        let mut manager = SanManager::new(config, DriverRegistry::with_builtin(), host);

        let report = manager.load_conf().await;
        assert!(!report.loaded);
        assert!(!manager.is_config_loaded());
        assert_matches!(report.device_errors[0].error, Error::ConfigRead { .. });
    }

    #[tokio::test]
    async fn test_loaded_names_and_pruned_targets() {
        let mut addresses = fc_addresses();
        addresses.t_wwpns.push(addr("50:0a:09:85:00:00:00:99"));
        let (manager, _, _) = manager_with(LAB, addresses, HostInventory::default()).await;

        assert_eq!(manager.sa_names().unwrap(), vec!["array1"]);
        assert_eq!(manager.sw_names().unwrap(), vec!["sw1"]);
        assert_eq!(manager.physw_names().unwrap(), vec!["patch1"]);
        assert_eq!(manager.t_wwpns(), &[addr(TARGET)]);
        assert!(manager.capability().unwrap().supports(Capability::LunCreate));
    }

    #[tokio::test]
    async fn test_create_for_mpath_uses_multipath_addresses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LAB.as_bytes()).unwrap();

        let mp = MultipathDevice {
            name: "mpatha".into(),
            vendor: Some("NETAPP".into()),
            product: Some("LUN".into()),
            h_wwpns: vec![addr(HOST_A)],
            t_wwpns: vec![addr(TARGET)],
            map_info: vec![MapInfo::new(addr(HOST_A), addr(TARGET)).unwrap()],
            ..Default::default()
        };
        let host = Arc::new(StaticHost::new(HostInventory {
            mpaths: vec![mp],
            ..Default::default()
        }));
        let config = ManagerConfig {
            conf_path: file.path().to_path_buf(),
            ..Default::default()
        };

        let (manager, report) =
            SanManager::create_for_mpath(Some("mpatha"), config.clone(), DriverRegistry::with_builtin(), host.clone())
                .await
                .unwrap();
        assert!(report.is_clean(), "{:?}", report.device_errors);
        assert_eq!(manager.h_wwpns(), &[addr(HOST_A)]);
        assert_eq!(manager.map_info().len(), 1);
        assert_eq!(manager.sa_names().unwrap(), vec!["array1"]);

        let missing =
            SanManager::create_for_mpath(Some("mpathz"), config, DriverRegistry::with_builtin(), host).await;
        assert_matches!(missing, Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_create_for_storage_array_targets_its_ports() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LAB.as_bytes()).unwrap();
        let config = ManagerConfig {
            conf_path: file.path().to_path_buf(),
            ..Default::default()
        };
        let host = Arc::new(StaticHost::new(HostInventory::default()));

        let (manager, _) =
            SanManager::create_for_storage_array("10.0.0.20", config.clone(), DriverRegistry::with_builtin(), host.clone())
                .await
                .unwrap();
        assert_eq!(manager.t_wwpns(), &[addr(TARGET)]);
        assert_eq!(manager.sa_names().unwrap(), vec!["array1"]);

        let unknown =
            SanManager::create_for_storage_array("10.9.9.9", config, DriverRegistry::with_builtin(), host).await;
        assert_matches!(unknown, Err(Error::Configuration(_)));
    }

    #[test]
    fn test_address_setters_validate_kind() {
        let host = Arc::new(StaticHost::new(HostInventory::default()));
        let mut manager = SanManager::new(ManagerConfig::default(), DriverRegistry::with_builtin(), host);

        manager
            .set_addresses_from_str(&["10-00-00-00-C9-95-2F-DE".into()], &[], &[], &[], &[])
            .unwrap();
        assert_eq!(manager.h_wwpns(), &[addr(HOST_A)]);

        let err = manager.set_addresses_from_str(&[], &[], &[HOST_A.into()], &[], &[]);
        assert_matches!(err, Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_capability_error_names_advertised_set() {
        let text = LAB.replace("type = array\n", "type = array\nsim_caps = lun_query\n");
        let (manager, _, _) = manager_with(&text, fc_addresses(), HostInventory::default()).await;

        let err = manager.lun_create("1G", None, false).await.unwrap_err();
        assert_matches!(
            &err,
            Error::CapabilityUnsupported { capability, device, advertised }
                if capability == "lun_create" && device == "array1" && advertised == "lun_query"
        );
    }
}
