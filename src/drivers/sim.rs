//! Simulated Lab Drivers
//!
//! In-memory switch, patch switch and array drivers for the `sim` vendor.
//! They keep lab state in memory and read fault injection keys from their
//! config section:
//!
//! - `sim_caps`: comma separated capabilities overriding the defaults
//! - `sim_fail_connect = 1`: construction fails
//! - `sim_fail_map = 1`: every `lun_map` fails
//! - `sim_remove_failures = N`: the first N `lun_remove` calls fail
//! - `sim_ctrler_offline_checks = N`: N controller checks report offline
//! - `sim_port_status_<port>`: physical port status (default `Active`)
//! - `sim_port_<port>`: WWPN or MAC logged in on a switch port

use super::{DriverHandle, DriverRegistry};
use crate::domain::address::Address;
use crate::domain::capability::{Capability, DeviceCapabilities};
use crate::domain::ports::{
    ArrayDriver, ConnectMode, DriverParams, FlapSpec, LinkAction, LunInfo, MapInfo,
    PhySwitchDriver, PortState, RcsnAction, SwitchDriver, CTRLER_ONLINE, PHY_PORT_ACTIVE,
};
use crate::error::{Error, Result};
use crate::topology::device::{DeviceKind, DriverKey, CTRL_IP_PREFIX};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

const SIM_VENDOR: &str = "sim";

/// Register every simulated driver
pub fn register(registry: &mut DriverRegistry) {
    registry.register(
        DriverKey::new(DeviceKind::Switch, SIM_VENDOR, "fabric"),
        false,
        |params| async move { Ok(DriverHandle::Switch(Arc::new(SimSwitch::new(params)?))) },
    );
    registry.register(
        DriverKey::new(DeviceKind::PhySwitch, SIM_VENDOR, "patch"),
        false,
        |params| async move { Ok(DriverHandle::PhySwitch(Arc::new(SimPatchSwitch::new(params)?))) },
    );
    registry.register(
        DriverKey::new(DeviceKind::Array, SIM_VENDOR, "array"),
        false,
        |params| async move { Ok(DriverHandle::Array(Arc::new(SimArray::new(params, false)?))) },
    );
    registry.register(
        DriverKey::new(DeviceKind::Array, SIM_VENDOR, "tpl"),
        true,
        |params| async move { Ok(DriverHandle::Array(Arc::new(SimArray::new(params, true)?))) },
    );
}

// =============================================================================
// Fault Injection Settings
// =============================================================================

fn check_connect(params: &DriverParams) -> Result<()> {
    if flag(params, "sim_fail_connect") {
        return Err(Error::DriverUnavailable {
            device: params.device.clone(),
            reason: format!("could not connect to {}", params.ctrl_ip),
        });
    }
    Ok(())
}

fn flag(params: &DriverParams, key: &str) -> bool {
    matches!(params.setting(key), Some("1") | Some("true") | Some("yes"))
}

fn counter(params: &DriverParams, key: &str) -> Result<u32> {
    match params.setting(key) {
        None | Some("") => Ok(0),
        Some(v) => v.parse().map_err(|_| {
            Error::Configuration(format!("[{}] {} '{}' is not a number", params.device, key, v))
        }),
    }
}

fn capabilities(params: &DriverParams, defaults: &[Capability]) -> Result<DeviceCapabilities> {
    match params.setting("sim_caps") {
        None => Ok(defaults.iter().copied().collect()),
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::parse::<Capability>)
            .collect(),
    }
}

fn prefixed<'a>(params: &'a DriverParams, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
    params
        .settings
        .iter()
        .filter_map(move |(k, v)| k.strip_prefix(prefix).map(|rest| (rest, v.as_str())))
        .filter(|(rest, _)| !rest.is_empty())
}

// =============================================================================
// Logical Switch
// =============================================================================

/// Simulated FC/Ethernet switch (`SIM-FABRIC`)
#[derive(Debug)]
pub struct SimSwitch {
    device: String,
    caps: DeviceCapabilities,
    logins: BTreeMap<String, Address>,
    states: Mutex<BTreeMap<String, PortState>>,
    /// Ports with RCSN suppressed
    rcsn_disabled: Mutex<BTreeSet<String>>,
}

impl SimSwitch {
    pub const DEFAULT_CAPS: [Capability; 7] = [
        Capability::LinkUp,
        Capability::LinkDown,
        Capability::LinkOscillate,
        Capability::RcsnEnable,
        Capability::RcsnDisable,
        Capability::FcSwitch,
        Capability::EthSwitch,
    ];

    pub fn new(params: DriverParams) -> Result<Self> {
        check_connect(&params)?;
        let caps = capabilities(&params, &Self::DEFAULT_CAPS)?;

        let mut logins = BTreeMap::new();
        for (port, value) in prefixed(&params, "sim_port_") {
            if port.starts_with("status_") {
                continue;
            }
            let addr = Address::parse(value).ok_or_else(|| {
                Error::Configuration(format!("[{}] sim_port_{} '{}' is not an address", params.device, port, value))
            })?;
            logins.insert(port.to_string(), addr);
        }

        debug!("Simulated switch {} with {} logged in ports", params.device, logins.len());
        Ok(Self {
            device: params.device,
            caps,
            logins,
            states: Mutex::new(BTreeMap::new()),
            rcsn_disabled: Mutex::new(BTreeSet::new()),
        })
    }

    /// Ports currently suppressing RCSN
    pub fn rcsn_disabled_ports(&self) -> Vec<String> {
        self.rcsn_disabled.lock().iter().cloned().collect()
    }

    fn logins_where(&self, pred: fn(&Address) -> bool) -> BTreeMap<String, Address> {
        self.logins
            .iter()
            .filter(|(_, addr)| pred(addr))
            .map(|(port, addr)| (port.clone(), addr.clone()))
            .collect()
    }
}

#[async_trait]
impl SwitchDriver for SimSwitch {
    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }

    async fn wwpn_2_port_id(&self) -> Result<BTreeMap<String, Address>> {
        Ok(self.logins_where(Address::is_wwpn))
    }

    async fn mac_2_port_id(&self) -> Result<BTreeMap<String, Address>> {
        Ok(self.logins_where(Address::is_mac))
    }

    async fn port_state(&self, port_id: &str) -> Result<PortState> {
        Ok(self
            .states
            .lock()
            .get(port_id)
            .copied()
            .unwrap_or(PortState::Up))
    }

    async fn link_trigger(&self, action: LinkAction, port_id: &str, check_state: bool) -> Result<()> {
        let state = match action {
            LinkAction::Up => PortState::Up,
            LinkAction::Down => PortState::Down,
        };
        info!("{}: link {} on port {}", self.device, action, port_id);
        self.states.lock().insert(port_id.to_string(), state);

        if check_state && self.port_state(port_id).await? != state {
            return Err(Error::driver(&self.device, "link_trigger", format!("port {} is not {}", port_id, state)));
        }
        Ok(())
    }

    async fn rcsn_trigger(&self, action: RcsnAction, port_id: &str) -> Result<()> {
        info!("{}: RCSN {} on port {}", self.device, action, port_id);
        let mut disabled = self.rcsn_disabled.lock();
        match action {
            RcsnAction::Enable => disabled.remove(port_id),
            RcsnAction::Disable => disabled.insert(port_id.to_string()),
        };
        Ok(())
    }
}

// =============================================================================
// Physical Layer Switch
// =============================================================================

/// Simulated patch panel switch (`SIM-PATCH`)
pub struct SimPatchSwitch {
    device: String,
    caps: DeviceCapabilities,
    status: BTreeMap<String, String>,
    connections: Mutex<BTreeMap<String, (String, ConnectMode)>>,
    flaps: Mutex<BTreeMap<String, u32>>,
}

impl SimPatchSwitch {
    pub const DEFAULT_CAPS: [Capability; 5] = [
        Capability::FcPhyswitch,
        Capability::PhyPortConnect,
        Capability::PhyPortDisconnect,
        Capability::PhyPortFlap,
        Capability::PhyPortOscillate,
    ];

    pub fn new(params: DriverParams) -> Result<Self> {
        check_connect(&params)?;
        let caps = capabilities(&params, &Self::DEFAULT_CAPS)?;

        let status = prefixed(&params, "sim_port_status_")
            .map(|(port, status)| (port.to_string(), status.to_string()))
            .collect();

        // The lab starts patched as configured
        let mut connections = BTreeMap::new();
        for (src, dst) in prefixed(&params, "simplex_con_") {
            connections.insert(src.to_string(), (dst.to_string(), ConnectMode::Simplex));
        }
        for (a, b) in prefixed(&params, "duplex_con_") {
            connections.insert(a.to_string(), (b.to_string(), ConnectMode::Duplex));
            connections.insert(b.to_string(), (a.to_string(), ConnectMode::Duplex));
        }

        Ok(Self {
            device: params.device,
            caps,
            status,
            connections: Mutex::new(connections),
            flaps: Mutex::new(BTreeMap::new()),
        })
    }

    /// Number of flaps run on `port_id`
    pub fn flap_count(&self, port_id: &str) -> u32 {
        self.flaps.lock().get(port_id).copied().unwrap_or(0)
    }

    fn status_of(&self, port_id: &str) -> &str {
        self.status
            .get(port_id)
            .map(String::as_str)
            .unwrap_or(PHY_PORT_ACTIVE)
    }
}

#[async_trait]
impl PhySwitchDriver for SimPatchSwitch {
    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }

    async fn port_status(&self, port_id: &str) -> Result<String> {
        Ok(self.status_of(port_id).to_string())
    }

    async fn port_disconnect(&self, port_id: &str, check_state: bool) -> Result<()> {
        info!("{}: disconnecting port {}", self.device, port_id);
        let mut connections = self.connections.lock();
        if let Some((peer, ConnectMode::Duplex)) = connections.remove(port_id) {
            connections.remove(&peer);
        }
        if check_state && connections.contains_key(port_id) {
            return Err(Error::driver(&self.device, "port_disconnect", format!("port {} is still connected", port_id)));
        }
        Ok(())
    }

    async fn port_connect(
        &self,
        port_id: &str,
        dst_port: &str,
        mode: ConnectMode,
        check_state: bool,
    ) -> Result<()> {
        let status = self.status_of(port_id);
        if status != PHY_PORT_ACTIVE {
            return Err(Error::driver(
                &self.device,
                "port_connect",
                format!("port {} has status {}", port_id, status),
            ));
        }

        info!("{}: connecting {} to {} ({})", self.device, port_id, dst_port, mode);
        let mut connections = self.connections.lock();
        connections.insert(port_id.to_string(), (dst_port.to_string(), mode));
        if mode == ConnectMode::Duplex {
            connections.insert(dst_port.to_string(), (port_id.to_string(), mode));
        }
        if check_state && !connections.contains_key(port_id) {
            return Err(Error::driver(&self.device, "port_connect", format!("port {} did not connect", port_id)));
        }
        Ok(())
    }

    async fn connect_mode_of(&self, port_id: &str) -> Result<Option<ConnectMode>> {
        Ok(self.connections.lock().get(port_id).map(|(_, mode)| *mode))
    }

    async fn port_flap(&self, port_id: &str, spec: &FlapSpec) -> Result<()> {
        info!(
            "{}: flapping port {} {} times ({}us up, {}us down)",
            self.device, port_id, spec.count, spec.uptime_us, spec.downtime_us
        );
        *self.flaps.lock().entry(port_id.to_string()).or_default() += spec.count;
        Ok(())
    }
}

// =============================================================================
// Storage Array
// =============================================================================

#[derive(Debug, Clone)]
struct SimLun {
    size_bytes: u64,
    thin: bool,
    wwid: String,
    mappings: BTreeSet<MapInfo>,
}

#[derive(Debug, Default)]
struct ArrayState {
    luns: BTreeMap<String, SimLun>,
    next_id: u64,
    remove_failures: u32,
    offline_checks: u32,
    reboots: Vec<String>,
}

/// Simulated storage array (`SIM-ARRAY`, or `SIM-TPL` minting one iSCSI
/// target per LUN)
pub struct SimArray {
    device: String,
    caps: DeviceCapabilities,
    target_per_lun: bool,
    /// Configured target IQN, the prefix of per-LUN targets
    base_iqn: Option<String>,
    fail_map: bool,
    offline_checks: u32,
    /// Controller management IP -> target WWPNs behind it
    ctrler_ports: BTreeMap<String, Vec<Address>>,
    state: Mutex<ArrayState>,
}

impl SimArray {
    pub const DEFAULT_CAPS: [Capability; 8] = [
        Capability::LunQuery,
        Capability::LunInfo,
        Capability::LunCreate,
        Capability::LunRemove,
        Capability::LunMap,
        Capability::LunUnmap,
        Capability::LunThinp,
        Capability::SaCtrlerReboot,
    ];

    pub fn new(params: DriverParams, target_per_lun: bool) -> Result<Self> {
        check_connect(&params)?;
        let caps = capabilities(&params, &Self::DEFAULT_CAPS)?;

        let base_iqn = params
            .settings
            .values()
            .find_map(|v| Address::iqn(v))
            .map(String::from);

        // wwpn-<controller>-<port> keys give the ports of each controller
        let mut ctrler_ports: BTreeMap<String, Vec<Address>> = BTreeMap::new();
        for (label, value) in prefixed(&params, "wwpn-") {
            let ctrler = label.split('-').next().unwrap_or(label);
            let (Some(ip), Some(addr)) = (
                params.setting(&format!("{}{}", CTRL_IP_PREFIX, ctrler)),
                Address::wwpn(value),
            ) else {
                continue;
            };
            ctrler_ports.entry(ip.to_string()).or_default().push(addr);
        }

        let offline_checks = counter(&params, "sim_ctrler_offline_checks")?;
        let state = ArrayState {
            remove_failures: counter(&params, "sim_remove_failures")?,
            offline_checks,
            ..Default::default()
        };

        Ok(Self {
            device: params.device.clone(),
            caps,
            target_per_lun,
            base_iqn,
            fail_map: flag(&params, "sim_fail_map"),
            offline_checks,
            ctrler_ports,
            state: Mutex::new(state),
        })
    }

    /// Initiator/target pairs `name` is mapped through
    pub fn mappings(&self, name: &str) -> Vec<MapInfo> {
        self.state
            .lock()
            .luns
            .get(name)
            .map(|lun| lun.mappings.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains_lun(&self, name: &str) -> bool {
        self.state.lock().luns.contains_key(name)
    }

    /// Controller IPs rebooted so far
    pub fn reboots(&self) -> Vec<String> {
        self.state.lock().reboots.clone()
    }

    fn iscsi_name_of(&self, name: &str) -> Option<String> {
        if !self.target_per_lun {
            return None;
        }
        let short = name.rsplit('/').next().unwrap_or(name);
        self.base_iqn.as_ref().map(|base| format!("{}-{}", base, short))
    }

    fn missing(&self, operation: &str, name: &str) -> Error {
        Error::driver(&self.device, operation, format!("LUN {} does not exist", name))
    }
}

#[async_trait]
impl ArrayDriver for SimArray {
    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }

    async fn query_all_luns(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().luns.keys().cloned().collect())
    }

    async fn lun_info(&self, name: &str) -> Result<Option<LunInfo>> {
        Ok(self.state.lock().luns.get(name).map(|lun| LunInfo {
            name: name.to_string(),
            size_bytes: lun.size_bytes,
            wwid: Some(lun.wwid.clone()),
            iscsi_name: self.iscsi_name_of(name),
            thin: lun.thin,
        }))
    }

    async fn lun_create(&self, name: &str, size_bytes: u64, thinp: bool) -> Result<String> {
        let mut state = self.state.lock();
        if state.luns.contains_key(name) {
            return Err(Error::driver(&self.device, "lun_create", format!("LUN {} already exists", name)));
        }
        state.next_id += 1;
        let wwid = format!("3600a0980{:023x}", state.next_id);
        state.luns.insert(
            name.to_string(),
            SimLun {
                size_bytes,
                thin: thinp,
                wwid,
                mappings: BTreeSet::new(),
            },
        );
        info!("{}: created LUN {} ({} bytes)", self.device, name, size_bytes);
        Ok(name.to_string())
    }

    async fn lun_remove(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.remove_failures > 0 {
            state.remove_failures -= 1;
            return Err(Error::driver(&self.device, "lun_remove", format!("LUN {} is busy", name)));
        }
        state
            .luns
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| self.missing("lun_remove", name))
    }

    async fn lun_map(&self, name: &str, map_info: &[MapInfo]) -> Result<()> {
        if self.fail_map {
            return Err(Error::driver(&self.device, "lun_map", "mapping rejected by array"));
        }
        let mut state = self.state.lock();
        let lun = state
            .luns
            .get_mut(name)
            .ok_or_else(|| self.missing("lun_map", name))?;
        lun.mappings.extend(map_info.iter().cloned());
        Ok(())
    }

    async fn lun_unmap(&self, name: &str, map_info: &[MapInfo]) -> Result<()> {
        let mut state = self.state.lock();
        let lun = state
            .luns
            .get_mut(name)
            .ok_or_else(|| self.missing("lun_unmap", name))?;
        if map_info.is_empty() {
            lun.mappings.clear();
        } else {
            for entry in map_info {
                lun.mappings.remove(entry);
            }
        }
        Ok(())
    }

    async fn sa_ctrler_reboot(&self, ctrler_ip: &str) -> Result<()> {
        info!("{}: rebooting controller {}", self.device, ctrler_ip);
        let mut state = self.state.lock();
        state.reboots.push(ctrler_ip.to_string());
        state.offline_checks = self.offline_checks;
        Ok(())
    }

    async fn sa_ctrler_check(&self, _ctrler_ip: &str) -> Result<String> {
        let mut state = self.state.lock();
        if state.offline_checks > 0 {
            state.offline_checks -= 1;
            return Ok("offline".to_string());
        }
        Ok(CTRLER_ONLINE.to_string())
    }

    async fn sa_ctrler_t_wwpns(&self, ctrler_ip: &str) -> Result<Vec<Address>> {
        Ok(self.ctrler_ports.get(ctrler_ip).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn params(device: &str, settings: &[(&str, &str)]) -> DriverParams {
        DriverParams {
            device: device.into(),
            ctrl_ip: "10.0.0.1".into(),
            ctrl_user: "admin".into(),
            ctrl_pass: "secret".into(),
            ctrl_type: "ssh".into(),
            timeout: None,
            settings: settings
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            san_conf_file: None,
        }
    }

    fn wwpn(s: &str) -> Address {
        Address::wwpn(s).unwrap()
    }

    #[tokio::test]
    async fn test_switch_reports_logins_and_states() {
        let sw = SimSwitch::new(params(
            "sw1",
            &[
                ("sim_port_1", "10:00:00:00:c9:95:2f:de"),
                ("sim_port_eth1", "08:00:27:05:37:71"),
            ],
        ))
        .unwrap();

        let wwpns = sw.wwpn_2_port_id().await.unwrap();
        assert_eq!(wwpns.get("1"), Some(&wwpn("10:00:00:00:c9:95:2f:de")));
        assert_eq!(sw.mac_2_port_id().await.unwrap().len(), 1);

        assert_eq!(sw.port_state("1").await.unwrap(), PortState::Up);
        sw.link_trigger(LinkAction::Down, "1", true).await.unwrap();
        assert_eq!(sw.port_state("1").await.unwrap(), PortState::Down);

        sw.rcsn_trigger(RcsnAction::Disable, "1").await.unwrap();
        assert_eq!(sw.rcsn_disabled_ports(), vec!["1"]);
        sw.rcsn_trigger(RcsnAction::Enable, "1").await.unwrap();
        assert!(sw.rcsn_disabled_ports().is_empty());
    }

    #[test]
    fn test_capability_override_and_connect_failure() {
        let sw = SimSwitch::new(params("sw1", &[("sim_caps", "link_down, fc_switch")])).unwrap();
        assert_eq!(
            sw.capabilities(),
            [Capability::LinkDown, Capability::FcSwitch].into_iter().collect()
        );

        assert!(SimSwitch::new(params("sw1", &[("sim_caps", "warp_drive")])).is_err());
        assert_matches!(
            SimSwitch::new(params("sw1", &[("sim_fail_connect", "1")])),
            Err(Error::DriverUnavailable { .. })
        );
    }

    #[tokio::test]
    async fn test_patch_switch_connections() {
        let patch = SimPatchSwitch::new(params(
            "patch1",
            &[
                ("duplex_con_A1", "B7"),
                ("sim_port_status_C3", "Faulty"),
            ],
        ))
        .unwrap();

        assert_eq!(patch.connect_mode_of("B7").await.unwrap(), Some(ConnectMode::Duplex));
        patch.port_disconnect("A1", true).await.unwrap();
        assert_eq!(patch.connect_mode_of("A1").await.unwrap(), None);
        assert_eq!(patch.connect_mode_of("B7").await.unwrap(), None);

        patch.port_connect("A1", "B7", ConnectMode::Duplex, true).await.unwrap();
        assert_eq!(patch.connect_mode_of("B7").await.unwrap(), Some(ConnectMode::Duplex));

        assert_eq!(patch.port_status("C3").await.unwrap(), "Faulty");
        assert!(patch.port_connect("C3", "D4", ConnectMode::Simplex, true).await.is_err());
    }

    #[tokio::test]
    async fn test_array_lun_lifecycle_with_faults() {
        let array = SimArray::new(params("array1", &[("sim_remove_failures", "2")]), false).unwrap();
        array.lun_create("lun1", 1 << 30, true).await.unwrap();
        assert!(array.lun_create("lun1", 1 << 30, false).await.is_err());

        let info = array.lun_info("lun1").await.unwrap().unwrap();
        assert!(info.thin);
        assert!(info.wwid.is_some());
        assert!(info.iscsi_name.is_none());

        assert!(array.lun_remove("lun1").await.is_err());
        assert!(array.lun_remove("lun1").await.is_err());
        array.lun_remove("lun1").await.unwrap();
        assert!(!array.contains_lun("lun1"));
    }

    #[tokio::test]
    async fn test_target_per_lun_names() {
        let array = SimArray::new(
            params("eql", &[("t_iqn", "iqn.2001-05.com.equallogic:0-8a0906")]),
            true,
        )
        .unwrap();
        array.lun_create("vol/lun7", 1 << 20, false).await.unwrap();
        let info = array.lun_info("vol/lun7").await.unwrap().unwrap();
        assert_eq!(info.iscsi_name.as_deref(), Some("iqn.2001-05.com.equallogic:0-8a0906-lun7"));
    }

    #[tokio::test]
    async fn test_controller_checks_and_ports() {
        let array = SimArray::new(
            params(
                "array1",
                &[
                    ("sim_ctrler_offline_checks", "1"),
                    ("ctrl_ip_spa", "10.0.0.21"),
                    ("wwpn-spa-fc1", "50:0a:09:85:99:4b:8d:c5"),
                    ("wwpn-spb-fc1", "50:0a:09:86:99:4b:8d:c5"),
                ],
            ),
            false,
        )
        .unwrap();

        assert_eq!(array.sa_ctrler_check("10.0.0.21").await.unwrap(), "offline");
        assert_eq!(array.sa_ctrler_check("10.0.0.21").await.unwrap(), CTRLER_ONLINE);

        array.sa_ctrler_reboot("10.0.0.21").await.unwrap();
        assert_eq!(array.reboots(), vec!["10.0.0.21"]);
        assert_eq!(array.sa_ctrler_check("10.0.0.21").await.unwrap(), "offline");

        assert_eq!(
            array.sa_ctrler_t_wwpns("10.0.0.21").await.unwrap(),
            vec![wwpn("50:0a:09:85:99:4b:8d:c5")]
        );
    }
}
