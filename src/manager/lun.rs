//! LUN lifecycle
//!
//! Create, map, unmap and remove LUNs on the single array in scope. Arrays
//! minting one iSCSI target per LUN get host side discovery and login after
//! a map, and logout and node removal before an unmap or remove.

use super::SanManager;
use crate::domain::address::Address;
use crate::domain::capability::Capability;
use crate::domain::ports::{LunInfo, MapInfo};
use crate::error::{Error, Result};
use crate::size::size_human_2_size_bytes;
use crate::topology::resolver::normalize;
use crate::topology::san::{AttachedArray, AttachedDevice};
use chrono::Local;
use tracing::{debug, error, info, warn};

/// Prefix of generated LUN names when `auto_lun_create_prefix` is unset
pub const DEFAULT_LUN_PREFIX: &str = "tmp";

impl SanManager {
    /// Names of every LUN on the array
    pub async fn lun_query(&self) -> Result<Vec<String>> {
        let array = self.array_for(Capability::LunQuery)?;
        array.driver.query_all_luns().await
    }

    pub async fn lun_info(&self, name: &str) -> Result<Option<LunInfo>> {
        let array = self.array_for(Capability::LunInfo)?;
        array.driver.lun_info(name).await
    }

    /// SCSI WWID of a LUN, if the array reports one
    pub async fn wwid_of_lun(&self, name: &str) -> Result<Option<String>> {
        Ok(self.lun_info(name).await?.and_then(|info| info.wwid))
    }

    /// Create a LUN of `size` (e.g. `1G`), returning the name the array gave it.
    ///
    /// An explicit name is prefixed with the array's `lun_path`; without one
    /// the name is `auto_lun_create_prefix` followed by a timestamp.
    pub async fn lun_create(&self, size: &str, name: Option<&str>, thinp: bool) -> Result<String> {
        let array = self.array_for(Capability::LunCreate)?;
        if thinp {
            super::ensure_capable(array, Capability::LunThinp)?;
        }

        let size_bytes = size_human_2_size_bytes(size)?;
        let lun_name = match name {
            Some(name) => format!("{}{}", array.record.setting("lun_path").unwrap_or(""), name),
            None => format!(
                "{}{}",
                array
                    .record
                    .setting("auto_lun_create_prefix")
                    .unwrap_or(DEFAULT_LUN_PREFIX),
                Local::now().format("%Y%m%d%H%M%S")
            ),
        };

        info!("Creating LUN {} ({} bytes, thin: {}) on {}", lun_name, size_bytes, thinp, array.name());
        let created = array.driver.lun_create(&lun_name, size_bytes, thinp).await.map_err(|e| {
            error!("Could not create LUN {}: {}", lun_name, e);
            e
        })?;
        Ok(created)
    }

    /// Remove a LUN, retrying transient failures
    pub async fn lun_remove(&self, name: &str) -> Result<()> {
        let array = self.array_for(Capability::LunRemove)?;

        if array.target_per_lun {
            match array.driver.lun_info(name).await {
                Ok(Some(LunInfo {
                    iscsi_name: Some(iqn),
                    ..
                })) => self.drop_lun_target(&iqn).await,
                Ok(_) => {}
                Err(e) => warn!("Could not get iSCSI target of {}: {}", name, e),
            }
        }

        let attempts = self.config.lun_remove_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match array.driver.lun_remove(name).await {
                Ok(()) => {
                    info!("Removed LUN {} from {}", name, array.name());
                    return Ok(());
                }
                Err(e) if attempt < attempts && e.is_retryable() => {
                    warn!(
                        "Could not remove LUN {} (attempt {}/{}): {}",
                        name, attempt, attempts, e
                    );
                    tokio::time::sleep(self.config.lun_remove_pause).await;
                }
                Err(e) => {
                    error!("Could not remove LUN {} after {} attempts: {}", name, attempt, e);
                    return Err(e);
                }
            }
        }
    }

    /// Initiator/target pairs a map or unmap runs through.
    ///
    /// Without explicit addresses the stored map info is used when set.
    /// Otherwise every target is paired with every initiator of the same
    /// transport; an explicit address replaces the list of its kind.
    pub fn build_map_info(&self, t_addr: Option<&str>, i_addr: Option<&str>) -> Result<Vec<MapInfo>> {
        if !self.map_info.is_empty() && t_addr.is_none() && i_addr.is_none() {
            return Ok(self.map_info.clone());
        }

        let mut t_wwpns = self.addresses.t_wwpns.clone();
        let mut h_wwpns = self.addresses.h_wwpns.clone();
        let mut t_iqns = self.addresses.t_iqns.clone();
        let mut h_iqns = self.addresses.h_iqns.clone();

        if let Some(t) = t_addr {
            match normalize(t)? {
                addr @ Address::Wwpn(_) => t_wwpns = vec![addr],
                addr @ Address::Iqn(_) => t_iqns = vec![addr],
                Address::Mac(_) => {
                    return Err(Error::InvalidArgument(format!("unsupported target address {}", t)))
                }
            }
        }
        if let Some(i) = i_addr {
            match normalize(i)? {
                addr @ Address::Wwpn(_) => h_wwpns = vec![addr],
                addr @ Address::Iqn(_) => h_iqns = vec![addr],
                Address::Mac(_) => {
                    return Err(Error::InvalidArgument(format!("unsupported initiator address {}", i)))
                }
            }
        }

        let mut map_info = Vec::new();
        for (targets, initiators) in [(&t_wwpns, &h_wwpns), (&t_iqns, &h_iqns)] {
            for t in targets {
                for h in initiators {
                    map_info.push(MapInfo::new(h.clone(), t.clone())?);
                }
            }
        }
        debug!("Built {} map info entries", map_info.len());
        Ok(map_info)
    }

    /// Map a LUN to the host.
    ///
    /// Per-LUN iSCSI targets are discovered through the interfaces the
    /// array's target was discovered with, then logged in.
    pub async fn lun_map(
        &self,
        name: &str,
        t_addr: Option<&str>,
        i_addr: Option<&str>,
        rescan: bool,
    ) -> Result<()> {
        let array = self.array_for(Capability::LunMap)?;
        let map_info = self.build_map_info(t_addr, i_addr)?;
        if map_info.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "no initiator/target pair to map {} through",
                name
            )));
        }

        info!("Mapping LUN {} through {} paths", name, map_info.len());
        array.driver.lun_map(name, &map_info).await.map_err(|e| {
            error!("Could not map LUN {}: {}", name, e);
            e
        })?;

        if array.target_per_lun && !self.addresses.t_iqns.is_empty() && !self.addresses.h_iqns.is_empty() {
            self.login_lun_target(array, name).await?;
        }

        if rescan || self.config.rescan_after_map {
            self.host.rescan_scsi().await?;
        }
        Ok(())
    }

    /// Unmap a LUN from the host
    pub async fn lun_unmap(&self, name: &str, t_addr: Option<&str>, i_addr: Option<&str>) -> Result<()> {
        let array = self.array_for(Capability::LunUnmap)?;
        let map_info = self.build_map_info(t_addr, i_addr)?;

        info!("Unmapping LUN {} from {} paths", name, map_info.len());
        array.driver.lun_unmap(name, &map_info).await.map_err(|e| {
            error!("Could not unmap LUN {}: {}", name, e);
            e
        })?;

        if array.target_per_lun {
            if let Some(iqn) = array.driver.lun_info(name).await?.and_then(|i| i.iscsi_name) {
                self.drop_lun_target(&iqn).await;
            }
        }
        Ok(())
    }

    /// Create and map a LUN, removing it again if the map fails.
    ///
    /// The array must support map and remove before anything is created. A
    /// LUN that cannot be removed after a failed map is reported as
    /// [`Error::OrphanedLun`].
    pub async fn lun_create_and_map(
        &self,
        size: &str,
        name: Option<&str>,
        thinp: bool,
        rescan: bool,
    ) -> Result<String> {
        let array = self.array_for(Capability::LunMap)?;
        super::ensure_capable(array, Capability::LunRemove)?;

        let lun_name = self.lun_create(size, name, thinp).await?;

        if let Err(e) = self.lun_map(&lun_name, None, None, rescan).await {
            error!("Could not map {}, deleting the LUN just created", lun_name);
            if let Err(rollback) = self.lun_remove(&lun_name).await {
                error!("Could not delete LUN {}: {}", lun_name, rollback);
                return Err(Error::OrphanedLun {
                    device: array.name().to_string(),
                    lun: lun_name,
                    map_error: e.to_string(),
                    remove_error: rollback.to_string(),
                });
            }
            return Err(e);
        }
        Ok(lun_name)
    }

    // =========================================================================
    // Per-LUN iSCSI Targets
    // =========================================================================

    async fn login_lun_target(&self, array: &AttachedArray, name: &str) -> Result<()> {
        let info = array.driver.lun_info(name).await?.ok_or_else(|| {
            Error::driver(array.name(), "lun_info", format!("LUN {} not found after map", name))
        })?;
        let Some(iqn) = info.iscsi_name else {
            return Ok(());
        };

        if !self.host.is_target_discovered(&iqn).await? {
            let base = &self.addresses.t_iqns[0];
            let ifaces = self
                .host
                .discovery_ifaces_of(base.as_str())
                .await
                .map_err(|e| Error::Host(format!("could not get discovery interfaces of {}: {}", base, e)))?;
            if ifaces.is_empty() {
                return Err(Error::Host(format!("{} was not discovered through any interface", base)));
            }

            let portal = array
                .record
                .setting("portal_ip")
                .or(array.record.ctrl_ip())
                .ok_or_else(|| Error::MissingField {
                    section: array.name().to_string(),
                    field: "portal_ip".into(),
                })?;
            info!("Discovering {} on {} through {:?}", iqn, portal, ifaces);
            self.host.discover(portal, &ifaces).await?;
        }

        let sessions = self.host.iscsi_target_iqns().await?;
        if !sessions.iter().any(|s| s.as_str() == iqn) {
            info!("Logging in to {}", iqn);
            self.host.node_login(Some(&iqn)).await?;
        }
        Ok(())
    }

    /// Log out of and forget a per-LUN target; failures are only logged
    async fn drop_lun_target(&self, iqn: &str) {
        match self.host.iscsi_target_iqns().await {
            Ok(sessions) if sessions.iter().any(|s| s.as_str() == iqn) => {
                if let Err(e) = self.host.node_logout(iqn).await {
                    warn!("Could not log out of {}: {}", iqn, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Could not list iSCSI sessions: {}", e),
        }

        match self.host.is_target_discovered(iqn).await {
            Ok(true) => {
                if let Err(e) = self.host.node_delete(iqn).await {
                    warn!("Could not delete node {}: {}", iqn, e);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Could not check discovery of {}: {}", iqn, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use crate::domain::address::Address;
    use crate::domain::ports::MapInfo;
    use crate::error::Error;
    use crate::host::{HostInventory, IscsiOp};
    use crate::topology::san::AddressSets;
    use assert_matches::assert_matches;

    fn pair(h: &str, t: &str) -> MapInfo {
        MapInfo::new(addr(h), addr(t)).unwrap()
    }

    #[tokio::test]
    async fn test_create_names_and_sizes() {
        let (manager, probed, _) = lab_manager().await;

        let name = manager.lun_create("1G", Some("lun1"), true).await.unwrap();
        assert_eq!(name, "/vol/vol0/lun1");
        let info = manager.lun_info(&name).await.unwrap().unwrap();
        assert_eq!(info.size_bytes, 1 << 30);
        assert!(info.thin);
        assert!(manager.wwid_of_lun(&name).await.unwrap().is_some());

        let generated = manager.lun_create("512M", None, false).await.unwrap();
        assert!(generated.starts_with("tmp"));
        assert_eq!(generated.len(), "tmp".len() + 14);

        assert_matches!(manager.lun_create("0", None, false).await, Err(Error::SizeParse(_)));
        assert!(probed.arrays.lock()["array1"].mappings(&name).is_empty());
    }

    #[tokio::test]
    async fn test_map_without_map_info_uses_cartesian_product() {
        let (manager, probed, _) = lab_manager().await;
        let name = manager.lun_create("1G", Some("lun1"), false).await.unwrap();

        manager.lun_map(&name, None, None, false).await.unwrap();
        let array = probed.arrays.lock()["array1"].clone();
        assert_eq!(
            array.mappings(&name),
            vec![pair(HOST_A, TARGET), pair(HOST_B, TARGET)]
        );

        manager.lun_unmap(&name, None, Some(HOST_B)).await.unwrap();
        assert_eq!(array.mappings(&name), vec![pair(HOST_A, TARGET)]);
    }

    #[tokio::test]
    async fn test_explicit_addresses_narrow_the_product() {
        let (manager, _, _) = lab_manager().await;

        let map_info = manager.build_map_info(Some(TARGET), Some(HOST_B)).unwrap();
        assert_eq!(map_info, vec![pair(HOST_B, TARGET)]);

        assert_matches!(
            manager.build_map_info(Some(HOST_MAC), None),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(manager.build_map_info(Some("nonsense"), None), Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_stored_map_info_wins() {
        let (mut manager, _, _) = lab_manager().await;
        manager.set_map_info(vec![pair(HOST_A, TARGET)]);

        assert_eq!(manager.build_map_info(None, None).unwrap(), vec![pair(HOST_A, TARGET)]);
        assert_eq!(manager.build_map_info(None, Some(HOST_B)).unwrap(), vec![pair(HOST_B, TARGET)]);
    }

    #[tokio::test]
    async fn test_create_and_map_rolls_back() {
        let text = LAB.replace("lun_path = /vol/vol0/", "sim_fail_map = 1");
        let (manager, probed, _) = manager_with(&text, fc_addresses(), HostInventory::default()).await;

        let err = manager.lun_create_and_map("1G", Some("doomed"), false, false).await.unwrap_err();
        assert_matches!(err, Error::Driver { ref operation, .. } if operation == "lun_map");
        assert!(!probed.arrays.lock()["array1"].contains_lun("doomed"));
        assert!(manager.lun_query().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_and_map_needs_map_and_remove() {
        let text = LAB.replace(
            "lun_path = /vol/vol0/",
            "sim_fail_map = 1\nsim_caps = lun_query,lun_info,lun_create,lun_map",
        );
        let (manager, probed, _) = manager_with(&text, fc_addresses(), HostInventory::default()).await;

        let err = manager.lun_create_and_map("1G", Some("orphan"), false, false).await.unwrap_err();
        assert_matches!(err, Error::CapabilityUnsupported { ref capability, .. } if capability == "lun_remove");
        assert!(!probed.arrays.lock()["array1"].contains_lun("orphan"));
        assert!(manager.lun_query().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_and_map_reports_lun_it_could_not_remove() {
        let text = LAB.replace("lun_path = /vol/vol0/", "sim_fail_map = 1\nsim_remove_failures = 9");
        let (manager, _, _) = manager_with(&text, fc_addresses(), HostInventory::default()).await;

        let err = manager.lun_create_and_map("1G", Some("stuck"), false, false).await.unwrap_err();
        assert_matches!(err, Error::OrphanedLun { ref lun, ref device, .. } if lun == "stuck" && device == "array1");
        assert!(err.to_string().contains("stuck"));
        assert_eq!(manager.lun_query().await.unwrap(), vec!["stuck".to_string()]);
    }

    #[tokio::test]
    async fn test_create_and_map_passes_thin() {
        let (manager, _, _) = lab_manager().await;

        let name = manager.lun_create_and_map("1G", Some("thin1"), true, false).await.unwrap();
        assert!(manager.lun_info(&name).await.unwrap().unwrap().thin);
    }

    #[tokio::test]
    async fn test_create_and_map_with_rescan() {
        let (manager, _, host) = lab_manager().await;

        let name = manager.lun_create_and_map("1G", Some("lun2"), false, true).await.unwrap();
        assert_eq!(manager.lun_query().await.unwrap(), vec![name]);
        assert_eq!(host.operations(), vec![IscsiOp::Rescan]);
    }

    #[tokio::test]
    async fn test_remove_retries_transient_failures() {
        let text = LAB.replace("lun_path = /vol/vol0/", "sim_remove_failures = 2");
        let (manager, _, _) = manager_with(&text, fc_addresses(), HostInventory::default()).await;
        manager.lun_create("1G", Some("busy"), false).await.unwrap();

        manager.lun_remove("busy").await.unwrap();
        assert!(manager.lun_query().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_gives_up_after_attempts() {
        let text = LAB.replace("lun_path = /vol/vol0/", "sim_remove_failures = 9");
        let (manager, _, _) = manager_with(&text, fc_addresses(), HostInventory::default()).await;
        manager.lun_create("1G", Some("stuck"), false).await.unwrap();

        assert_matches!(manager.lun_remove("stuck").await, Err(Error::Driver { .. }));
        assert_eq!(manager.lun_query().await.unwrap(), vec!["stuck".to_string()]);
    }

    const EQL: &str = r#"
[eql]
type = array
model = SIM-TPL
ctrl_ip = 10.0.0.30
portal_ip = 192.168.10.30
ctrl_user = grpadmin
ctrl_pass = secret
ctrl_type = ssh
t_iqn = iqn.2001-05.com.equallogic:0-8a0906
"#;

    const EQL_TARGET: &str = "iqn.2001-05.com.equallogic:0-8a0906";
    const ST05_IQN: &str = "iqn.1994-05.com.redhat:st05";

    fn iscsi_addresses() -> AddressSets {
        AddressSets {
            h_iqns: vec![Address::iqn(ST05_IQN).unwrap()],
            t_iqns: vec![Address::iqn(EQL_TARGET).unwrap()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_target_per_lun_login_and_logout() {
        let (manager, _, host) = manager_with(EQL, iscsi_addresses(), HostInventory::default()).await;
        host.add_discovered(EQL_TARGET, &["iface0"]);

        let name = manager.lun_create("1G", Some("vol/lun7"), false).await.unwrap();
        manager.lun_map(&name, None, None, false).await.unwrap();

        let lun_target = format!("{}-lun7", EQL_TARGET);
        assert_eq!(
            host.operations(),
            vec![
                IscsiOp::Discover {
                    portal: "192.168.10.30".into(),
                    ifaces: vec!["iface0".into()],
                },
                IscsiOp::Login(Some(lun_target.clone())),
            ]
        );
        assert!(host.sessions().contains(&lun_target));

        manager.lun_remove(&name).await.unwrap();
        assert!(!host.sessions().contains(&lun_target));
        assert!(host.operations().contains(&IscsiOp::Logout(lun_target)));
    }

    #[tokio::test]
    async fn test_target_per_lun_map_needs_discovered_base_target() {
        let (manager, _, _) = manager_with(EQL, iscsi_addresses(), HostInventory::default()).await;
        let name = manager.lun_create("1G", Some("lun8"), false).await.unwrap();

        assert_matches!(manager.lun_map(&name, None, None, false).await, Err(Error::Host(_)));
    }
}
