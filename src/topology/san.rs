//! SAN Topology
//!
//! The aggregate root built from a [`SanConfig`] and the addresses the
//! caller cares about. Only devices reachable from those addresses get a
//! driver: arrays owning one of the targets, switches owning any address of
//! interest. A device that is in scope but cannot be controlled (missing
//! management fields, no registered driver, failed connection) is kept as
//! degraded and owns no address.

use crate::domain::address::Address;
use crate::domain::capability::{CapabilitySet, DeviceCapabilities};
use crate::domain::ports::{ArrayDriverRef, PhySwitchDriverRef, SwitchDriverRef};
use crate::drivers::{DriverHandle, DriverRegistry};
use crate::error::{Error, Result};
use crate::topology::device::{DeviceKind, DeviceRecord, IscsiHostConfig};
use crate::topology::loader::{DeviceError, SanConfig};
use indexmap::IndexMap;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Address Sets
// =============================================================================

/// Host and target addresses the topology is scoped to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressSets {
    pub h_wwpns: Vec<Address>,
    pub t_wwpns: Vec<Address>,
    pub h_iqns: Vec<Address>,
    pub t_iqns: Vec<Address>,
    pub macs: Vec<Address>,
}

impl AddressSets {
    /// Target IQNs, then target WWPNs
    pub fn targets(&self) -> impl Iterator<Item = &Address> {
        self.t_iqns.iter().chain(self.t_wwpns.iter())
    }

    /// Every address switches are scoped to, without duplicates
    pub fn interest(&self) -> Vec<Address> {
        let mut addrs: Vec<Address> = Vec::new();
        for addr in self
            .macs
            .iter()
            .chain(&self.h_wwpns)
            .chain(&self.t_wwpns)
            .chain(&self.t_iqns)
        {
            if !addrs.contains(addr) {
                addrs.push(addr.clone());
            }
        }
        addrs
    }

    pub fn is_empty(&self) -> bool {
        self.h_wwpns.is_empty()
            && self.t_wwpns.is_empty()
            && self.h_iqns.is_empty()
            && self.t_iqns.is_empty()
            && self.macs.is_empty()
    }
}

// =============================================================================
// Attached Devices
// =============================================================================

/// A device record together with its live driver
pub trait AttachedDevice {
    fn record(&self) -> &DeviceRecord;

    fn name(&self) -> &str {
        &self.record().name
    }

    fn capabilities(&self) -> DeviceCapabilities;
}

pub struct AttachedArray {
    pub record: DeviceRecord,
    pub driver: ArrayDriverRef,
    /// One iSCSI target is minted per LUN
    pub target_per_lun: bool,
}

impl std::fmt::Debug for AttachedArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedArray")
            .field("record", &self.record)
            .field("target_per_lun", &self.target_per_lun)
            .finish_non_exhaustive()
    }
}

impl AttachedArray {
    /// Is `addr` a target of this array.
    ///
    /// Target-per-LUN arrays also own every IQN their configured IQNs prefix.
    pub fn owns_target(&self, addr: &Address) -> bool {
        owns_target(&self.record, self.target_per_lun, addr)
    }
}

pub struct AttachedSwitch {
    pub record: DeviceRecord,
    pub driver: SwitchDriverRef,
}

impl std::fmt::Debug for AttachedSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedSwitch")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

pub struct AttachedPhySwitch {
    pub record: DeviceRecord,
    pub driver: PhySwitchDriverRef,
}

impl AttachedDevice for AttachedArray {
    fn record(&self) -> &DeviceRecord {
        &self.record
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.driver.capabilities()
    }
}

impl AttachedDevice for AttachedSwitch {
    fn record(&self) -> &DeviceRecord {
        &self.record
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.driver.capabilities()
    }
}

impl AttachedDevice for AttachedPhySwitch {
    fn record(&self) -> &DeviceRecord {
        &self.record
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.driver.capabilities()
    }
}

fn owns_target(record: &DeviceRecord, target_per_lun: bool, addr: &Address) -> bool {
    if record.ports.contains_key(addr) {
        return true;
    }
    target_per_lun
        && addr.is_iqn()
        && record
            .ports
            .keys()
            .any(|port| port.is_iqn() && addr.as_str().starts_with(port.as_str()))
}

/// An in-scope device that could not be controlled
#[derive(Debug)]
pub struct DegradedDevice {
    pub kind: DeviceKind,
    pub error: Error,
}

// =============================================================================
// Load Report
// =============================================================================

/// Outcome of loading a topology
#[derive(Debug, Default)]
pub struct LoadReport {
    /// The configuration source was read and interpreted
    pub loaded: bool,
    /// Devices dropped from the config or left uncontrollable
    pub device_errors: Vec<DeviceError>,
}

impl LoadReport {
    pub fn failed(error: Error) -> Self {
        Self {
            loaded: false,
            device_errors: vec![DeviceError::new("general", error)],
        }
    }

    pub fn is_clean(&self) -> bool {
        self.loaded && self.device_errors.is_empty()
    }
}

// =============================================================================
// SAN Topology
// =============================================================================

/// Loaded SAN topology
#[derive(Default)]
pub struct SanTopology {
    config: SanConfig,
    addresses: AddressSets,
    arrays: IndexMap<String, AttachedArray>,
    switches: IndexMap<String, AttachedSwitch>,
    physwitches: IndexMap<String, AttachedPhySwitch>,
    degraded: IndexMap<String, DegradedDevice>,
    capabilities: CapabilitySet,
}

impl SanTopology {
    /// Scope `config` to `addresses` and attach drivers to in-scope devices.
    ///
    /// Target addresses not configured on any array are dropped from the
    /// resulting address sets before switches are scoped.
    pub async fn load(
        config: SanConfig,
        addresses: AddressSets,
        registry: &DriverRegistry,
        default_timeout: Option<Duration>,
    ) -> (Self, LoadReport) {
        let mut topology = SanTopology {
            config,
            addresses,
            ..Default::default()
        };

        topology.attach_arrays(registry, default_timeout).await;
        topology.prune_targets(registry);

        let interest = topology.addresses.interest();
        topology
            .attach_switches(DeviceKind::Switch, &interest, registry, default_timeout)
            .await;
        topology
            .attach_switches(DeviceKind::PhySwitch, &interest, registry, default_timeout)
            .await;

        info!(
            "SAN topology loaded: {} arrays, {} switches, {} physical switches, {} degraded",
            topology.arrays.len(),
            topology.switches.len(),
            topology.physwitches.len(),
            topology.degraded.len()
        );

        let mut device_errors: Vec<DeviceError> = std::mem::take(&mut topology.config.errors);
        for (name, degraded) in &topology.degraded {
            device_errors.push(DeviceError::new(name, clone_error(&degraded.error)));
        }

        let report = LoadReport {
            loaded: true,
            device_errors,
        };
        (topology, report)
    }

    async fn attach_arrays(&mut self, registry: &DriverRegistry, default_timeout: Option<Duration>) {
        let targets: Vec<Address> = self.addresses.targets().cloned().collect();
        if targets.is_empty() {
            debug!("No target addresses given, no array is in scope");
            return;
        }

        let records: Vec<DeviceRecord> = self.config.devices_of(DeviceKind::Array).cloned().collect();
        for record in records {
            let tpl = registry.is_target_per_lun(&record.driver_key);
            if !targets.iter().any(|t| owns_target(&record, tpl, t)) {
                debug!("Array [{}] owns none of the targets, skipping", record.name);
                continue;
            }

            match self.materialize(&record, registry, default_timeout).await {
                Ok(DriverHandle::Array(driver)) => {
                    self.capabilities.merge_device(&driver.capabilities());
                    info!("Attached array [{}] ({})", record.name, record.driver_key);
                    self.arrays.insert(
                        record.name.clone(),
                        AttachedArray {
                            record,
                            driver,
                            target_per_lun: tpl,
                        },
                    );
                }
                Ok(other) => self.degrade(&record, wrong_kind(&record, &other)),
                Err(e) => self.degrade(&record, e),
            }
        }
    }

    /// Keep only target addresses some configured array serves
    fn prune_targets(&mut self, registry: &DriverRegistry) {
        let arrays: Vec<(&DeviceRecord, bool)> = self
            .config
            .devices_of(DeviceKind::Array)
            .map(|r| (r, registry.is_target_per_lun(&r.driver_key)))
            .collect();

        let served = |addr: &Address| arrays.iter().any(|(r, tpl)| owns_target(r, *tpl, addr));

        let before = self.addresses.t_wwpns.len() + self.addresses.t_iqns.len();
        let t_wwpns: Vec<Address> = self.addresses.t_wwpns.iter().filter(|a| served(*a)).cloned().collect();
        let t_iqns: Vec<Address> = self.addresses.t_iqns.iter().filter(|a| served(*a)).cloned().collect();
        let dropped = before - t_wwpns.len() - t_iqns.len();
        if dropped > 0 {
            debug!("Dropped {} target addresses not configured on any array", dropped);
        }
        self.addresses.t_wwpns = t_wwpns;
        self.addresses.t_iqns = t_iqns;
    }

    async fn attach_switches(
        &mut self,
        kind: DeviceKind,
        interest: &[Address],
        registry: &DriverRegistry,
        default_timeout: Option<Duration>,
    ) {
        let records: Vec<DeviceRecord> = self.config.devices_of(kind).cloned().collect();
        for record in records {
            let in_scope: Vec<Address> = record
                .ports
                .keys()
                .filter(|addr| interest.is_empty() || interest.contains(addr))
                .cloned()
                .collect();
            if in_scope.is_empty() {
                debug!("{} [{}] controls none of the addresses, skipping", kind, record.name);
                continue;
            }

            let caps = match self.materialize(&record, registry, default_timeout).await {
                Ok(DriverHandle::Switch(driver)) if kind == DeviceKind::Switch => {
                    let caps = driver.capabilities();
                    self.switches.insert(
                        record.name.clone(),
                        AttachedSwitch {
                            record: record.clone(),
                            driver,
                        },
                    );
                    caps
                }
                Ok(DriverHandle::PhySwitch(driver)) if kind == DeviceKind::PhySwitch => {
                    let caps = driver.capabilities();
                    self.physwitches.insert(
                        record.name.clone(),
                        AttachedPhySwitch {
                            record: record.clone(),
                            driver,
                        },
                    );
                    caps
                }
                Ok(other) => {
                    self.degrade(&record, wrong_kind(&record, &other));
                    continue;
                }
                Err(e) => {
                    self.degrade(&record, e);
                    continue;
                }
            };

            for addr in &in_scope {
                self.capabilities.merge_port(&caps, addr);
            }
            info!(
                "Attached {} [{}] ({}) for {} addresses",
                kind,
                record.name,
                record.driver_key,
                in_scope.len()
            );
        }
    }

    async fn materialize(
        &self,
        record: &DeviceRecord,
        registry: &DriverRegistry,
        default_timeout: Option<Duration>,
    ) -> Result<DriverHandle> {
        let params = self.config.driver_params(record, default_timeout)?;
        registry.create(&record.driver_key, params).await
    }

    fn degrade(&mut self, record: &DeviceRecord, error: Error) {
        warn!("{} [{}] is configured but not controllable: {}", record.kind, record.name, error);
        self.degraded.insert(
            record.name.clone(),
            DegradedDevice {
                kind: record.kind,
                error,
            },
        );
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &SanConfig {
        &self.config
    }

    pub fn addresses(&self) -> &AddressSets {
        &self.addresses
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn arrays(&self) -> &IndexMap<String, AttachedArray> {
        &self.arrays
    }

    pub fn switches(&self) -> &IndexMap<String, AttachedSwitch> {
        &self.switches
    }

    pub fn physwitches(&self) -> &IndexMap<String, AttachedPhySwitch> {
        &self.physwitches
    }

    pub fn degraded(&self) -> &IndexMap<String, DegradedDevice> {
        &self.degraded
    }

    pub fn iscsi_hosts(&self) -> &IndexMap<String, IscsiHostConfig> {
        &self.config.iscsi_hosts
    }

    /// The one array this topology is scoped to
    pub fn single_array(&self) -> Result<&AttachedArray> {
        match self.arrays.len() {
            1 => Ok(&self.arrays[0]),
            0 => {
                let degraded = self
                    .degraded
                    .iter()
                    .find(|(_, d)| d.kind == DeviceKind::Array);
                match degraded {
                    Some((name, d)) => Err(Error::DriverUnavailable {
                        device: name.clone(),
                        reason: d.error.to_string(),
                    }),
                    None => Err(Error::NoArray),
                }
            }
            _ => Err(Error::AmbiguousArray {
                names: self.arrays.keys().cloned().collect(),
            }),
        }
    }

    /// Serializable view for display
    pub fn view(&self) -> TopologyView<'_> {
        TopologyView {
            san_conf_file: self.config.san_conf_file(),
            addresses: &self.addresses,
            arrays: self.arrays.values().map(|a| &a.record).collect(),
            switches: self.switches.values().map(|s| &s.record).collect(),
            physwitches: self.physwitches.values().map(|s| &s.record).collect(),
            degraded: self
                .degraded
                .iter()
                .map(|(name, d)| (name.as_str(), d.error.to_string()))
                .collect(),
            capabilities: &self.capabilities,
            iscsi_hosts: &self.config.iscsi_hosts,
        }
    }
}

/// Display form of a loaded topology
#[derive(Serialize)]
pub struct TopologyView<'a> {
    pub san_conf_file: Option<&'a str>,
    pub addresses: &'a AddressSets,
    pub arrays: Vec<&'a DeviceRecord>,
    pub switches: Vec<&'a DeviceRecord>,
    pub physwitches: Vec<&'a DeviceRecord>,
    pub degraded: IndexMap<&'a str, String>,
    pub capabilities: &'a CapabilitySet,
    pub iscsi_hosts: &'a IndexMap<String, IscsiHostConfig>,
}

fn wrong_kind(record: &DeviceRecord, handle: &DriverHandle) -> Error {
    Error::DriverUnavailable {
        device: record.name.clone(),
        reason: format!("driver {} is a {} driver", record.driver_key, handle.kind()),
    }
}

/// Errors hold io sources, so the report gets a rendered copy
fn clone_error(error: &Error) -> Error {
    match error {
        Error::MissingField { section, field } => Error::MissingField {
            section: section.clone(),
            field: field.clone(),
        },
        Error::UnsupportedDevice { key } => Error::UnsupportedDevice { key: key.clone() },
        Error::DriverUnavailable { device, reason } => Error::DriverUnavailable {
            device: device.clone(),
            reason: reason.clone(),
        },
        other => Error::Configuration(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::capability::Capability;
    use assert_matches::assert_matches;

    const LAB: &str = r#"
[alias]
st05_p1 = 10:00:00:00:c9:95:2f:de
netapp_0a = 50:0a:09:85:99:4b:8d:c5

[sw1]
type = switch
model = SIM-FABRIC
ctrl_ip = 10.0.0.10
ctrl_user = admin
ctrl_pass = secret
ctrl_type = ssh
wwpn-1 = st05_p1
wwpn-2 = netapp_0a
mac_eth1 = 08:00:27:05:37:71

[sw_other]
type = switch
model = SIM-FABRIC
ctrl_ip = 10.0.0.11
ctrl_user = admin
ctrl_pass = secret
ctrl_type = ssh
wwpn-1 = 10:00:00:00:c9:00:00:01

[array1]
type = array
model = SIM-ARRAY
ctrl_ip = 10.0.0.20
ctrl_user = admin
ctrl_pass = secret
ctrl_type = ssh
wwpn-spa-fc1 = netapp_0a

[array_unrelated]
type = array
model = SIM-ARRAY
wwpn-spa-fc1 = 50:0a:09:85:00:00:00:01

[eql]
type = array
model = SIM-TPL
ctrl_ip = 10.0.0.30
ctrl_user = grpadmin
ctrl_pass = secret
ctrl_type = ssh
t_iqn = iqn.2001-05.com.equallogic:0-8a0906
"#;

    fn wwpn(s: &str) -> Address {
        Address::wwpn(s).unwrap()
    }

    fn fc_host() -> AddressSets {
        AddressSets {
            h_wwpns: vec![wwpn("10:00:00:00:c9:95:2f:de")],
            t_wwpns: vec![wwpn("50:0a:09:85:99:4b:8d:c5"), wwpn("50:0a:09:85:ff:ff:ff:ff")],
            ..Default::default()
        }
    }

    async fn load(text: &str, addresses: AddressSets) -> (SanTopology, LoadReport) {
        let config = SanConfig::parse(text).unwrap();
        SanTopology::load(config, addresses, &DriverRegistry::with_builtin(), None).await
    }

    #[tokio::test]
    async fn test_unreachable_array_not_attached() {
        let (topology, report) = load(LAB, fc_host()).await;
        assert!(report.is_clean(), "{:?}", report.device_errors);

        // array_unrelated lacks ctrl fields but is out of scope, so it is not an error
        assert_eq!(topology.arrays().keys().collect::<Vec<_>>(), vec!["array1"]);
        assert!(topology.degraded().is_empty());
        assert_eq!(topology.single_array().unwrap().name(), "array1");
    }

    #[tokio::test]
    async fn test_targets_pruned_to_configured_ports() {
        let (topology, _) = load(LAB, fc_host()).await;
        assert_eq!(topology.addresses().t_wwpns, vec![wwpn("50:0a:09:85:99:4b:8d:c5")]);
    }

    #[tokio::test]
    async fn test_switch_scoping_and_port_capabilities() {
        let (topology, _) = load(LAB, fc_host()).await;
        assert!(topology.switches().contains_key("sw1"));
        assert!(!topology.switches().contains_key("sw_other"));

        let caps = topology.capabilities();
        let host = wwpn("10:00:00:00:c9:95:2f:de");
        assert!(caps.supports_for(Capability::LinkUp, &host));
        assert!(caps.supports_for(Capability::FcSwitch, &host));
        // the MAC port is configured on sw1 but not of interest
        assert!(!caps.supports_for(Capability::LinkUp, &Address::mac("08:00:27:05:37:71").unwrap()));
        assert!(caps.supports(Capability::LunCreate));
    }

    #[tokio::test]
    async fn test_no_addresses_loads_every_switch_and_no_array() {
        let (topology, _) = load(LAB, AddressSets::default()).await;
        assert_eq!(topology.switches().len(), 2);
        assert!(topology.arrays().is_empty());
        assert_matches!(topology.single_array(), Err(Error::NoArray));
    }

    #[tokio::test]
    async fn test_target_per_lun_prefix_scoping() {
        let addresses = AddressSets {
            h_iqns: vec![Address::iqn("iqn.1994-05.com.redhat:st05").unwrap()],
            t_iqns: vec![Address::iqn("iqn.2001-05.com.equallogic:0-8a0906-lun1").unwrap()],
            ..Default::default()
        };
        let (topology, _) = load(LAB, addresses).await;

        let eql = topology.single_array().unwrap();
        assert_eq!(eql.name(), "eql");
        assert!(eql.target_per_lun);
        assert_eq!(topology.addresses().t_iqns.len(), 1);
    }

    #[tokio::test]
    async fn test_in_scope_device_missing_fields_is_degraded() {
        let text = r#"
[array1]
type = array
model = SIM-ARRAY
ctrl_ip = 10.0.0.20
wwpn-spa-fc1 = 50:0a:09:85:99:4b:8d:c5
"#;
        let (topology, report) = load(text, fc_host()).await;
        assert!(report.loaded);
        assert_eq!(report.device_errors.len(), 1);
        assert_matches!(&report.device_errors[0].error, Error::MissingField { field, .. } if field == "ctrl_user");
        assert_matches!(topology.single_array(), Err(Error::DriverUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unknown_driver_is_degraded() {
        let text = r#"
[sw9]
type = switch
model = ACME-FABRIC9000
ctrl_ip = 10.0.0.99
ctrl_user = admin
ctrl_pass = secret
ctrl_type = ssh
wwpn-1 = 10:00:00:00:c9:95:2f:de
"#;
        let (topology, report) = load(text, fc_host()).await;
        assert!(topology.switches().is_empty());
        assert_matches!(
            &topology.degraded()["sw9"].error,
            Error::UnsupportedDevice { key } if key == "switch.acme.fabric9000"
        );
        assert_eq!(report.device_errors.len(), 1);
        assert!(!topology.capabilities().supports(Capability::LinkUp));
    }

    #[test]
    fn test_interest_dedups() {
        let addr = wwpn("10:00:00:00:c9:95:2f:de");
        let sets = AddressSets {
            h_wwpns: vec![addr.clone()],
            t_wwpns: vec![addr.clone()],
            ..Default::default()
        };
        assert_eq!(sets.interest(), vec![addr]);
    }
}
