//! In-memory host facts
//!
//! Serves a fixed inventory and records the iSCSI node operations issued
//! against it, for dry runs and tests.

use crate::domain::address::Address;
use crate::domain::ports::{HostFacts, MultipathDevice, NicInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Facts a [`StaticHost`] reports
#[derive(Debug, Clone, Default)]
pub struct HostInventory {
    pub hostname: String,
    pub fc_host_wwpns: Vec<Address>,
    pub fc_target_wwpns: Vec<Address>,
    pub iscsi_initiator_iqns: Vec<Address>,
    pub iscsi_target_iqns: Vec<Address>,
    pub iscsi_session_macs: Vec<Address>,
    pub nics: Vec<NicInfo>,
    pub mpaths: Vec<MultipathDevice>,
    /// Multipath devices holding the root filesystem
    pub boot_mpaths: BTreeSet<String>,
    /// Multipath devices used as LVM physical volumes
    pub lvm_mpaths: BTreeSet<String>,
    pub iscsi_ifaces: Vec<String>,
}

/// An iSCSI or SCSI operation issued against the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IscsiOp {
    Discover { portal: String, ifaces: Vec<String> },
    Login(Option<String>),
    Logout(String),
    NodeDelete(String),
    IfaceIp {
        iface: String,
        ip: String,
        mask: Option<String>,
        gateway: Option<String>,
    },
    IfaceIqn { iface: String, iqn: String },
    MultipathTimeout,
    Rescan,
}

/// Host facts backed by a fixed inventory
pub struct StaticHost {
    inventory: RwLock<HostInventory>,
    /// Target IQN -> interfaces it was discovered through
    discovered: RwLock<BTreeMap<String, Vec<String>>>,
    sessions: RwLock<BTreeSet<String>>,
    ops: Mutex<Vec<IscsiOp>>,
}

impl StaticHost {
    pub fn new(inventory: HostInventory) -> Self {
        let sessions = inventory
            .iscsi_target_iqns
            .iter()
            .map(|a| a.to_string())
            .collect();
        Self {
            inventory: RwLock::new(inventory),
            discovered: RwLock::new(BTreeMap::new()),
            sessions: RwLock::new(sessions),
            ops: Mutex::new(Vec::new()),
        }
    }

    /// Mark `t_iqn` as already discovered through `ifaces`
    pub fn add_discovered(&self, t_iqn: &str, ifaces: &[&str]) {
        self.discovered
            .write()
            .insert(t_iqn.to_string(), ifaces.iter().map(|s| s.to_string()).collect());
    }

    /// Every operation recorded so far, oldest first
    pub fn operations(&self) -> Vec<IscsiOp> {
        self.ops.lock().clone()
    }

    /// Target IQNs with a logged in session
    pub fn sessions(&self) -> BTreeSet<String> {
        self.sessions.read().clone()
    }

    fn record(&self, op: IscsiOp) {
        debug!("Host operation: {:?}", op);
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl HostFacts for StaticHost {
    async fn hostname(&self) -> Result<String> {
        Ok(self.inventory.read().hostname.clone())
    }

    async fn fc_host_wwpns(&self) -> Result<Vec<Address>> {
        Ok(self.inventory.read().fc_host_wwpns.clone())
    }

    async fn fc_target_wwpns(&self) -> Result<Vec<Address>> {
        Ok(self.inventory.read().fc_target_wwpns.clone())
    }

    async fn iscsi_initiator_iqns(&self) -> Result<Vec<Address>> {
        Ok(self.inventory.read().iscsi_initiator_iqns.clone())
    }

    async fn iscsi_target_iqns(&self) -> Result<Vec<Address>> {
        Ok(self
            .sessions
            .read()
            .iter()
            .filter_map(|iqn| Address::iqn(iqn))
            .collect())
    }

    async fn iscsi_session_macs(&self) -> Result<Vec<Address>> {
        Ok(self.inventory.read().iscsi_session_macs.clone())
    }

    async fn nics(&self) -> Result<Vec<NicInfo>> {
        Ok(self.inventory.read().nics.clone())
    }

    async fn free_mpaths(&self, exclude_boot: bool, exclude_lvm: bool) -> Result<Vec<MultipathDevice>> {
        let inventory = self.inventory.read();
        Ok(inventory
            .mpaths
            .iter()
            .filter(|mp| !(exclude_boot && inventory.boot_mpaths.contains(&mp.name)))
            .filter(|mp| !(exclude_lvm && inventory.lvm_mpaths.contains(&mp.name)))
            .cloned()
            .collect())
    }

    async fn mpath_info(&self, name: &str) -> Result<Option<MultipathDevice>> {
        Ok(self
            .inventory
            .read()
            .mpaths
            .iter()
            .find(|mp| mp.name == name)
            .cloned())
    }

    async fn is_target_discovered(&self, t_iqn: &str) -> Result<bool> {
        Ok(self.discovered.read().contains_key(t_iqn))
    }

    async fn discovery_ifaces_of(&self, t_iqn: &str) -> Result<Vec<String>> {
        self.discovered
            .read()
            .get(t_iqn)
            .cloned()
            .ok_or_else(|| Error::Host(format!("target {} was never discovered", t_iqn)))
    }

    async fn discover(&self, portal: &str, ifaces: &[String]) -> Result<()> {
        self.record(IscsiOp::Discover {
            portal: portal.to_string(),
            ifaces: ifaces.to_vec(),
        });
        Ok(())
    }

    async fn node_login(&self, t_iqn: Option<&str>) -> Result<()> {
        self.record(IscsiOp::Login(t_iqn.map(str::to_string)));
        match t_iqn {
            Some(iqn) => {
                self.sessions.write().insert(iqn.to_string());
            }
            None => {
                let discovered: Vec<String> = self.discovered.read().keys().cloned().collect();
                self.sessions.write().extend(discovered);
            }
        }
        Ok(())
    }

    async fn node_logout(&self, t_iqn: &str) -> Result<()> {
        self.record(IscsiOp::Logout(t_iqn.to_string()));
        self.sessions.write().remove(t_iqn);
        Ok(())
    }

    async fn node_delete(&self, t_iqn: &str) -> Result<()> {
        self.record(IscsiOp::NodeDelete(t_iqn.to_string()));
        self.discovered.write().remove(t_iqn);
        Ok(())
    }

    async fn iscsi_iface_names(&self) -> Result<Vec<String>> {
        Ok(self.inventory.read().iscsi_ifaces.clone())
    }

    async fn iface_set_ip(
        &self,
        iface: &str,
        ip: &str,
        mask: Option<&str>,
        gateway: Option<&str>,
    ) -> Result<()> {
        self.record(IscsiOp::IfaceIp {
            iface: iface.to_string(),
            ip: ip.to_string(),
            mask: mask.map(str::to_string),
            gateway: gateway.map(str::to_string),
        });
        Ok(())
    }

    async fn iface_set_iqn(&self, iface: &str, iqn: &str) -> Result<()> {
        self.record(IscsiOp::IfaceIqn {
            iface: iface.to_string(),
            iqn: iqn.to_string(),
        });
        Ok(())
    }

    async fn set_multipath_timeout(&self) -> Result<()> {
        self.record(IscsiOp::MultipathTimeout);
        Ok(())
    }

    async fn rescan_scsi(&self) -> Result<()> {
        self.record(IscsiOp::Rescan);
        Ok(())
    }
}
