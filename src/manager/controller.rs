//! Storage array controller lifecycle
//!
//! Controllers are configured as `ctrl_ip_<name>` keys on the array section
//! and own the target ports whose label starts with `<name>-`.

use super::SanManager;
use crate::domain::address::Address;
use crate::domain::capability::Capability;
use crate::domain::ports::CTRLER_ONLINE;
use crate::error::{Error, Result};
use crate::topology::resolver::normalize;
use crate::topology::san::AttachedArray;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info};

impl SanManager {
    /// Controller names of the array in scope
    pub fn controller_names(&self) -> Result<Vec<String>> {
        Ok(self.topology()?.single_array()?.record.controller_names())
    }

    /// Management IP of the controller serving target port `t_addr`.
    ///
    /// The controller name is the port label up to its first hyphen, so
    /// `wwpn-spa-fc1` belongs to `ctrl_ip_spa`.
    pub fn controller_ip_of_port(&self, t_addr: &str) -> Result<String> {
        let array = self.topology()?.single_array()?;
        controller_ip_of(array, &normalize(t_addr)?).map(str::to_string)
    }

    /// Controller name -> target WWPNs it serves, as reported by the array
    pub async fn sa_t_wwpn_2_ctrler(&self) -> Result<BTreeMap<String, Vec<Address>>> {
        let array = self.topology()?.single_array()?;
        let mut ctrlers = BTreeMap::new();
        for name in array.record.controller_names() {
            let Some(ip) = array.record.controller_ip(&name) else {
                continue;
            };
            let t_wwpns = array.driver.sa_ctrler_t_wwpns(ip).await?;
            debug!("Controller {} ({}) serves {} ports", name, ip, t_wwpns.len());
            ctrlers.insert(name, t_wwpns);
        }
        Ok(ctrlers)
    }

    /// Reboot the controller serving `t_addr`
    pub async fn sa_ctrler_reboot(&self, t_addr: &str) -> Result<()> {
        let (array, ctrler_ip) = self.ctrler_of(t_addr)?;
        info!("Rebooting controller {} of {}", ctrler_ip, array.record.name);
        array.driver.sa_ctrler_reboot(ctrler_ip).await
    }

    /// Status of the controller serving `t_addr`, `online` when healthy
    pub async fn sa_ctrler_check(&self, t_addr: &str) -> Result<String> {
        let (array, ctrler_ip) = self.ctrler_of(t_addr)?;
        array.driver.sa_ctrler_check(ctrler_ip).await
    }

    /// Poll the controller serving `t_addr` until it is online.
    ///
    /// Checks `timeout / interval` times (at least once), sleeping `interval`
    /// between checks. Defaults come from [`super::ManagerConfig`].
    pub async fn sa_ctrler_wait(
        &self,
        t_addr: &str,
        timeout: Option<Duration>,
        interval: Option<Duration>,
    ) -> Result<()> {
        let timeout = timeout.unwrap_or(self.config.ctrler_wait_timeout);
        let interval = interval.unwrap_or(self.config.ctrler_wait_interval);
        if interval.is_zero() {
            return Err(Error::InvalidArgument("controller wait interval must be non-zero".into()));
        }

        let (array, ctrler_ip) = self.ctrler_of(t_addr)?;
        let attempts = (timeout.as_secs_f64() / interval.as_secs_f64()).floor().max(1.0) as u64;

        for attempt in 1..=attempts {
            let status = array.driver.sa_ctrler_check(ctrler_ip).await.map_err(|e| {
                error!("Could not get status of controller {}: {}", ctrler_ip, e);
                e
            })?;
            if status == CTRLER_ONLINE {
                info!("Controller {} is online", ctrler_ip);
                return Ok(());
            }
            info!(
                "Controller {} still on status: {} ({}/{})",
                ctrler_ip, status, attempt, attempts
            );
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        error!("Timeout, controller {} still offline", ctrler_ip);
        Err(Error::Timeout {
            what: format!("controller {}", ctrler_ip),
            seconds: timeout.as_secs(),
        })
    }

    fn ctrler_of(&self, t_addr: &str) -> Result<(&AttachedArray, &str)> {
        let array = self.array_for(Capability::SaCtrlerReboot)?;
        let ip = controller_ip_of(array, &normalize(t_addr)?)?;
        Ok((array, ip))
    }
}

fn controller_ip_of<'a>(array: &'a AttachedArray, t_addr: &Address) -> Result<&'a str> {
    let label = array.record.port_of(t_addr).ok_or_else(|| Error::NoOwner {
        category: format!("port of array {}", array.record.name),
        address: t_addr.to_string(),
    })?;
    let ctrler = label.split('-').next().unwrap_or(label);
    array.record.controller_ip(ctrler).ok_or_else(|| {
        Error::Configuration(format!(
            "[{}] ctrl_ip_{} is not defined for port {}",
            array.record.name, ctrler, label
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::host::HostInventory;
    use assert_matches::assert_matches;

    fn lab_with(extra: &str) -> String {
        LAB.replace("lun_path = /vol/vol0/", &format!("lun_path = /vol/vol0/\n{}", extra))
    }

    #[tokio::test]
    async fn test_controller_of_port_label() {
        let (manager, _, _) = lab_manager().await;

        assert_eq!(manager.controller_names().unwrap(), vec!["spa"]);
        assert_eq!(manager.controller_ip_of_port(TARGET).unwrap(), "10.0.0.21");
        assert_matches!(manager.controller_ip_of_port(HOST_A), Err(Error::NoOwner { .. }));

        let ports = manager.sa_t_wwpn_2_ctrler().await.unwrap();
        assert_eq!(ports["spa"], vec![addr(TARGET)]);
    }

    #[tokio::test]
    async fn test_port_without_controller_ip() {
        let text = LAB.replace("ctrl_ip_spa = 10.0.0.21\n", "");
        let (manager, _, _) = manager_with(&text, fc_addresses(), HostInventory::default()).await;

        assert!(manager.controller_names().unwrap().is_empty());
        assert_matches!(manager.controller_ip_of_port(TARGET), Err(Error::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_succeeds_on_second_check() {
        let text = lab_with("sim_ctrler_offline_checks = 1");
        let (manager, probed, _) = manager_with(&text, fc_addresses(), HostInventory::default()).await;

        manager.sa_ctrler_reboot(TARGET).await.unwrap();
        assert_eq!(probed.arrays.lock()["array1"].reboots(), vec!["10.0.0.21"]);

        let start = tokio::time::Instant::now();
        manager
            .sa_ctrler_wait(TARGET, Some(Duration::from_secs(60)), Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(manager.sa_ctrler_check(TARGET).await.unwrap(), CTRLER_ONLINE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let text = lab_with("sim_ctrler_offline_checks = 5");
        let (manager, _, _) = manager_with(&text, fc_addresses(), HostInventory::default()).await;

        assert_matches!(
            manager
                .sa_ctrler_wait(TARGET, Some(Duration::from_secs(60)), Some(Duration::from_secs(30)))
                .await,
            Err(Error::Timeout { seconds: 60, .. })
        );
        assert_matches!(
            manager.sa_ctrler_wait(TARGET, None, Some(Duration::ZERO)).await,
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_controller_ops_need_reboot_capability() {
        let text = lab_with("sim_caps = lun_query,lun_create");
        let (manager, _, _) = manager_with(&text, fc_addresses(), HostInventory::default()).await;

        assert_matches!(
            manager.sa_ctrler_check(TARGET).await,
            Err(Error::CapabilityUnsupported { ref capability, .. }) if capability == "sa_ctrler_reboot"
        );
        assert_matches!(manager.sa_ctrler_reboot(TARGET).await, Err(Error::CapabilityUnsupported { .. }));
    }
}
