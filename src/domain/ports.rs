//! Domain Ports - Core trait definitions for the SAN topology manager
//!
//! These traits define the boundaries between the topology logic and the
//! equipment it controls. Vendor drivers implement the switch, physical
//! switch and array ports; host fact providers implement [`HostFacts`].

use crate::domain::address::Address;
use crate::domain::capability::DeviceCapabilities;
use crate::error::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Actions and States
// =============================================================================

/// Switch port link action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkAction {
    Up,
    Down,
}

impl fmt::Display for LinkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkAction::Up => write!(f, "UP"),
            LinkAction::Down => write!(f, "DOWN"),
        }
    }
}

impl FromStr for LinkAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "UP" | "LINK_UP" => Ok(LinkAction::Up),
            "DOWN" | "LINK_DOWN" => Ok(LinkAction::Down),
            other => Err(Error::InvalidArgument(format!("unsupported link action: {}", other))),
        }
    }
}

/// Registered State Change Notification action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RcsnAction {
    /// Stop suppressing RCSN messages on the port
    Enable,
    /// Suppress RCSN messages on the port
    Disable,
}

impl fmt::Display for RcsnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RcsnAction::Enable => write!(f, "ENABLE"),
            RcsnAction::Disable => write!(f, "DISABLE"),
        }
    }
}

impl FromStr for RcsnAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "ENABLE" => Ok(RcsnAction::Enable),
            "DISABLE" => Ok(RcsnAction::Disable),
            other => Err(Error::InvalidArgument(format!("unsupported RCSN action: {}", other))),
        }
    }
}

/// Logical switch port state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortState {
    Up,
    Down,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Up => write!(f, "UP"),
            PortState::Down => write!(f, "DOWN"),
        }
    }
}

/// Static cross-connect mode of a physical layer switch port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    /// One direction only (A -> B)
    Simplex,
    /// Both directions (A <-> B)
    Duplex,
}

impl fmt::Display for ConnectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectMode::Simplex => write!(f, "simplex"),
            ConnectMode::Duplex => write!(f, "duplex"),
        }
    }
}

/// Physical port status string meaning the port can be (re)connected
pub const PHY_PORT_ACTIVE: &str = "Active";

/// Controller status string meaning the controller is serving I/O
pub const CTRLER_ONLINE: &str = "online";

// =============================================================================
// Timing Specs
// =============================================================================

/// Dwell times and repeat count of a link oscillation
///
/// Each up and down period is picked uniformly between its min and max;
/// equal bounds give fixed dwell times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OscillateSpec {
    pub min_uptime: Duration,
    pub max_uptime: Duration,
    pub min_downtime: Duration,
    pub max_downtime: Duration,
    pub count: u32,
}

impl Default for OscillateSpec {
    fn default() -> Self {
        Self {
            min_uptime: Duration::from_secs(1),
            max_uptime: Duration::from_secs(1),
            min_downtime: Duration::from_secs(1),
            max_downtime: Duration::from_secs(1),
            count: 100,
        }
    }
}

impl OscillateSpec {
    /// Check bounds and the repeat count limit
    pub fn validate(&self, max_count: u32) -> Result<()> {
        if self.min_uptime > self.max_uptime {
            return Err(Error::InvalidArgument(format!(
                "min uptime {:?} is greater than max uptime {:?}",
                self.min_uptime, self.max_uptime
            )));
        }
        if self.min_downtime > self.max_downtime {
            return Err(Error::InvalidArgument(format!(
                "min downtime {:?} is greater than max downtime {:?}",
                self.min_downtime, self.max_downtime
            )));
        }
        if self.count == 0 || self.count > max_count {
            return Err(Error::InvalidArgument(format!(
                "oscillate count must be between 1 and {}, got {}",
                max_count, self.count
            )));
        }
        Ok(())
    }

    pub fn pick_uptime(&self) -> Duration {
        pick_between(self.min_uptime, self.max_uptime)
    }

    pub fn pick_downtime(&self) -> Duration {
        pick_between(self.min_downtime, self.max_downtime)
    }
}

fn pick_between(min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

/// Fast, driver-timed flapping of a physical port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlapSpec {
    /// Time to keep the link up per flap, in microseconds
    pub uptime_us: u64,
    /// Time to keep the link down per flap, in microseconds
    pub downtime_us: u64,
    pub count: u32,
}

impl FlapSpec {
    pub fn validate(&self, max_count: u32) -> Result<()> {
        if self.uptime_us == 0 || self.downtime_us == 0 {
            return Err(Error::InvalidArgument(
                "flap uptime and downtime must be non-zero".into(),
            ));
        }
        if self.count == 0 || self.count > max_count {
            return Err(Error::InvalidArgument(format!(
                "flap count must be between 1 and {}, got {}",
                max_count, self.count
            )));
        }
        Ok(())
    }
}

// =============================================================================
// LUN Types
// =============================================================================

/// One initiator/target pairing to map or unmap a LUN through
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MapInfo {
    /// Host side address (WWPN or IQN)
    pub initiator: Address,
    /// Array side address of the same kind
    pub target: Address,
}

impl MapInfo {
    pub fn new(initiator: Address, target: Address) -> Result<Self> {
        if initiator.kind() != target.kind() || initiator.is_mac() {
            return Err(Error::InvalidArgument(format!(
                "cannot pair initiator {} with target {}",
                initiator, target
            )));
        }
        Ok(Self { initiator, target })
    }

    pub fn is_fc(&self) -> bool {
        self.target.is_wwpn()
    }

    pub fn is_iscsi(&self) -> bool {
        self.target.is_iqn()
    }
}

/// Details an array reports for one LUN
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LunInfo {
    pub name: String,
    pub size_bytes: u64,
    /// SCSI VPD 0x83 identifier, when the array exposes it
    pub wwid: Option<String>,
    /// Per-LUN iSCSI target name for arrays that mint one target per LUN
    pub iscsi_name: Option<String>,
    pub thin: bool,
}

// =============================================================================
// Driver Construction
// =============================================================================

/// Arguments every driver constructor receives
#[derive(Debug, Clone)]
pub struct DriverParams {
    /// Name of the config section owning the device
    pub device: String,
    pub ctrl_ip: String,
    pub ctrl_user: String,
    pub ctrl_pass: String,
    pub ctrl_type: String,
    /// Management channel timeout (`ctrl_tmo`)
    pub timeout: Option<Duration>,
    /// Every key of the device section, after alias resolution
    pub settings: BTreeMap<String, String>,
    /// Path of the config file the device was loaded from
    pub san_conf_file: Option<PathBuf>,
}

impl DriverParams {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

// =============================================================================
// Switch Port
// =============================================================================

/// Port for logical FC/Ethernet switch drivers
#[async_trait]
pub trait SwitchDriver: Send + Sync {
    /// Capabilities this switch declares
    fn capabilities(&self) -> DeviceCapabilities;

    /// Port id -> WWPN logged in on that port
    async fn wwpn_2_port_id(&self) -> Result<BTreeMap<String, Address>>;

    /// Port id -> MAC learned on that port
    async fn mac_2_port_id(&self) -> Result<BTreeMap<String, Address>>;

    async fn port_state(&self, port_id: &str) -> Result<PortState>;

    /// Bring a port up or down, optionally waiting for the new state
    async fn link_trigger(&self, action: LinkAction, port_id: &str, check_state: bool) -> Result<()>;

    async fn rcsn_trigger(&self, action: RcsnAction, port_id: &str) -> Result<()>;

    /// Oscillate a port `spec.count` times, ending with the link up
    async fn port_oscillate(&self, port_id: &str, spec: &OscillateSpec) -> Result<()> {
        for i in 0..spec.count {
            self.link_trigger(LinkAction::Down, port_id, false).await?;
            tokio::time::sleep(spec.pick_downtime()).await;
            self.link_trigger(LinkAction::Up, port_id, false).await?;
            if i + 1 < spec.count {
                tokio::time::sleep(spec.pick_uptime()).await;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Physical Switch Port
// =============================================================================

/// Port for physical layer (patch panel) switch drivers
#[async_trait]
pub trait PhySwitchDriver: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    /// Hardware status of the port, [`PHY_PORT_ACTIVE`] when usable
    async fn port_status(&self, port_id: &str) -> Result<String>;

    async fn port_disconnect(&self, port_id: &str, check_state: bool) -> Result<()>;

    async fn port_connect(
        &self,
        port_id: &str,
        dst_port: &str,
        mode: ConnectMode,
        check_state: bool,
    ) -> Result<()>;

    /// Current connection of the port, `None` when disconnected
    async fn connect_mode_of(&self, port_id: &str) -> Result<Option<ConnectMode>>;

    /// Driver-timed fast flapping
    async fn port_flap(&self, port_id: &str, spec: &FlapSpec) -> Result<()>;

    /// Disconnect and reconnect a port `spec.count` times
    async fn port_oscillate(
        &self,
        port_id: &str,
        dst_port: &str,
        mode: ConnectMode,
        spec: &OscillateSpec,
    ) -> Result<()> {
        for i in 0..spec.count {
            self.port_disconnect(port_id, false).await?;
            tokio::time::sleep(spec.pick_downtime()).await;
            self.port_connect(port_id, dst_port, mode, false).await?;
            if i + 1 < spec.count {
                tokio::time::sleep(spec.pick_uptime()).await;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Storage Array Port
// =============================================================================

/// Port for storage array drivers
#[async_trait]
pub trait ArrayDriver: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    /// Names of every LUN on the array
    async fn query_all_luns(&self) -> Result<Vec<String>>;

    async fn lun_info(&self, name: &str) -> Result<Option<LunInfo>>;

    /// Create a LUN, returning the name the array gave it
    async fn lun_create(&self, name: &str, size_bytes: u64, thinp: bool) -> Result<String>;

    async fn lun_remove(&self, name: &str) -> Result<()>;

    async fn lun_map(&self, name: &str, map_info: &[MapInfo]) -> Result<()>;

    async fn lun_unmap(&self, name: &str, map_info: &[MapInfo]) -> Result<()>;

    async fn sa_ctrler_reboot(&self, ctrler_ip: &str) -> Result<()>;

    /// Controller status, [`CTRLER_ONLINE`] when serving I/O
    async fn sa_ctrler_check(&self, ctrler_ip: &str) -> Result<String>;

    /// Target WWPNs served by one controller
    async fn sa_ctrler_t_wwpns(&self, _ctrler_ip: &str) -> Result<Vec<Address>> {
        Ok(Vec::new())
    }
}

// =============================================================================
// Host Facts Port
// =============================================================================

/// A network interface of the local host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicInfo {
    pub name: String,
    pub mac: Option<Address>,
}

/// A multipath device discovered on the local host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipathDevice {
    /// Device mapper name (e.g., mpatha)
    pub name: String,
    pub wwid: Option<String>,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub h_wwpns: Vec<Address>,
    pub t_wwpns: Vec<Address>,
    pub h_iqns: Vec<Address>,
    pub t_iqns: Vec<Address>,
    pub iface_macs: Vec<Address>,
    /// Initiator/target pairs the paths of this device run through
    pub map_info: Vec<MapInfo>,
}

impl MultipathDevice {
    /// Has at least one FC or iSCSI identifier
    pub fn is_san_device(&self) -> bool {
        !(self.h_wwpns.is_empty()
            && self.t_wwpns.is_empty()
            && self.h_iqns.is_empty()
            && self.t_iqns.is_empty())
    }
}

/// Port for read-mostly facts and iSCSI node operations on the local host
#[async_trait]
pub trait HostFacts: Send + Sync {
    async fn hostname(&self) -> Result<String>;

    /// WWPNs of local FC HBAs
    async fn fc_host_wwpns(&self) -> Result<Vec<Address>>;

    /// WWPNs of FC targets visible to local HBAs
    async fn fc_target_wwpns(&self) -> Result<Vec<Address>>;

    /// Initiator IQNs of active iSCSI sessions
    async fn iscsi_initiator_iqns(&self) -> Result<Vec<Address>>;

    /// Target IQNs of active iSCSI sessions
    async fn iscsi_target_iqns(&self) -> Result<Vec<Address>>;

    /// MACs of interfaces carrying iSCSI sessions
    async fn iscsi_session_macs(&self) -> Result<Vec<Address>>;

    async fn nics(&self) -> Result<Vec<NicInfo>>;

    /// Multipath devices not used for boot or as LVM physical volumes
    async fn free_mpaths(&self, exclude_boot: bool, exclude_lvm: bool) -> Result<Vec<MultipathDevice>>;

    async fn mpath_info(&self, name: &str) -> Result<Option<MultipathDevice>>;

    async fn is_target_discovered(&self, t_iqn: &str) -> Result<bool>;

    /// iSCSI interfaces used when `t_iqn` was discovered
    async fn discovery_ifaces_of(&self, t_iqn: &str) -> Result<Vec<String>>;

    /// SendTargets discovery on `portal` through `ifaces`
    async fn discover(&self, portal: &str, ifaces: &[String]) -> Result<()>;

    /// Log in to `t_iqn`, or to every discovered node when `None`
    async fn node_login(&self, t_iqn: Option<&str>) -> Result<()>;

    async fn node_logout(&self, t_iqn: &str) -> Result<()>;

    async fn node_delete(&self, t_iqn: &str) -> Result<()>;

    async fn iscsi_iface_names(&self) -> Result<Vec<String>>;

    async fn iface_set_ip(
        &self,
        iface: &str,
        ip: &str,
        mask: Option<&str>,
        gateway: Option<&str>,
    ) -> Result<()>;

    async fn iface_set_iqn(&self, iface: &str, iqn: &str) -> Result<()>;

    /// Lower iSCSI replacement timeout for sessions used by multipath
    async fn set_multipath_timeout(&self) -> Result<()>;

    /// Rescan every SCSI host and wait for udev to settle
    async fn rescan_scsi(&self) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type SwitchDriverRef = Arc<dyn SwitchDriver>;
pub type PhySwitchDriverRef = Arc<dyn PhySwitchDriver>;
pub type ArrayDriverRef = Arc<dyn ArrayDriver>;
pub type HostFactsRef = Arc<dyn HostFacts>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parsing() {
        assert_eq!("up".parse::<LinkAction>().unwrap(), LinkAction::Up);
        assert_eq!("link_down".parse::<LinkAction>().unwrap(), LinkAction::Down);
        assert!("sideways".parse::<LinkAction>().is_err());
        assert_eq!("Enable".parse::<RcsnAction>().unwrap(), RcsnAction::Enable);
        assert!("toggle".parse::<RcsnAction>().is_err());
    }

    #[test]
    fn test_oscillate_spec_validation() {
        let spec = OscillateSpec::default();
        assert!(spec.validate(1000).is_ok());
        assert!(spec.validate(10).is_err());

        let inverted = OscillateSpec {
            min_uptime: Duration::from_secs(5),
            max_uptime: Duration::from_secs(1),
            ..OscillateSpec::default()
        };
        assert!(inverted.validate(1000).is_err());
    }

    #[test]
    fn test_oscillate_dwell_within_bounds() {
        let spec = OscillateSpec {
            min_uptime: Duration::from_millis(100),
            max_uptime: Duration::from_millis(300),
            min_downtime: Duration::from_secs(2),
            max_downtime: Duration::from_secs(2),
            count: 3,
        };
        for _ in 0..50 {
            let up = spec.pick_uptime();
            assert!(up >= spec.min_uptime && up <= spec.max_uptime);
            assert_eq!(spec.pick_downtime(), Duration::from_secs(2));
        }
    }

    #[test]
    fn test_map_info_requires_matching_kinds() {
        let h = Address::wwpn("10:00:00:00:c9:95:2f:de").unwrap();
        let t = Address::wwpn("50:0a:09:85:99:4b:8d:c5").unwrap();
        let iqn = Address::iqn("iqn.1994-05.com.redhat:st05").unwrap();

        assert!(MapInfo::new(h.clone(), t).unwrap().is_fc());
        assert!(MapInfo::new(h, iqn).is_err());
    }

    #[test]
    fn test_san_device_detection() {
        let mut mp = MultipathDevice {
            name: "mpatha".into(),
            ..Default::default()
        };
        assert!(!mp.is_san_device());
        mp.h_iqns.push(Address::iqn("iqn.1994-05.com.redhat:st05").unwrap());
        assert!(mp.is_san_device());
    }
}
